//! OAuth 2.1 wire pieces (PKCE, authorization URL, token grants, dynamic
//! client registration) and the browser login driver that ties discovery,
//! flow coordination, the callback listener and the token store together.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng as _;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use url::Url;

use crate::callback::CallbackRegistry;
use crate::config::UpstreamConfig;
use crate::discovery::{self, DEFAULT_PROBE_TIMEOUT};
use crate::events::{self, EventEmitter};
use crate::flow::{FlowCoordinator, FlowState};
use crate::tokens::{CompletionRecord, TokenRecord, TokenStore, server_key};
use crate::transport::params::merge_form;
use crate::util::CorrelationId;

pub const PKCE_METHOD: &str = "S256";

#[derive(Debug, Clone)]
pub struct PkceMaterial {
    pub verifier: String,
    pub challenge: String,
}

/// Fresh PKCE material: 32 random octets as a url-safe verifier, and its
/// S256 challenge.
pub fn generate_pkce() -> PkceMaterial {
    let bytes: [u8; 32] = rand::rng().random();
    let verifier = URL_SAFE_NO_PAD.encode(bytes);
    let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
    PkceMaterial {
        verifier,
        challenge,
    }
}

/// Crypto-random CSRF state parameter.
pub fn generate_state() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisteredClient {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
}

#[allow(clippy::too_many_arguments)]
pub fn build_authorize_url(
    authorization_endpoint: &str,
    client_id: &str,
    redirect_uri: &str,
    scopes: &[String],
    state: &str,
    pkce: &PkceMaterial,
    resource: Option<&str>,
    extra_params: &std::collections::HashMap<String, String>,
) -> Result<Url> {
    let mut url = Url::parse(authorization_endpoint).context("parse authorization endpoint")?;
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("response_type", "code");
        pairs.append_pair("client_id", client_id);
        pairs.append_pair("redirect_uri", redirect_uri);
        if !scopes.is_empty() {
            pairs.append_pair("scope", &scopes.join(" "));
        }
        pairs.append_pair("state", state);
        pairs.append_pair("code_challenge", &pkce.challenge);
        pairs.append_pair("code_challenge_method", PKCE_METHOD);
        if let Some(resource) = resource {
            pairs.append_pair("resource", resource);
        }
    }
    Ok(crate::transport::params::merge_query(&url, extra_params))
}

async fn post_token_form(
    http: &reqwest::Client,
    token_endpoint: &str,
    pairs: &[(&str, &str)],
    extra_params: &std::collections::HashMap<String, String>,
) -> Result<TokenResponse> {
    let body = {
        let mut ser = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in pairs {
            ser.append_pair(k, v);
        }
        merge_form(&ser.finish(), extra_params)
    };
    let resp = http
        .post(token_endpoint)
        .header(
            reqwest::header::CONTENT_TYPE,
            "application/x-www-form-urlencoded",
        )
        .body(body)
        .send()
        .await
        .with_context(|| format!("POST {token_endpoint}"))?;
    let status = resp.status();
    if status.is_success() {
        return resp.json::<TokenResponse>().await.context("parse token response");
    }
    // Carry the protocol error code through verbatim; retry classification
    // keys off substrings like `invalid_grant`.
    let body: serde_json::Value = resp.json().await.unwrap_or_default();
    let code = body.get("error").and_then(|v| v.as_str()).unwrap_or("");
    let desc = body
        .get("error_description")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if code.is_empty() {
        Err(anyhow!("token endpoint returned {status}"))
    } else if desc.is_empty() {
        Err(anyhow!("token endpoint returned {status}: {code}"))
    } else {
        Err(anyhow!("token endpoint returned {status}: {code}: {desc}"))
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn exchange_code(
    http: &reqwest::Client,
    token_endpoint: &str,
    client_id: &str,
    client_secret: Option<&str>,
    redirect_uri: &str,
    code: &str,
    verifier: &str,
    resource: Option<&str>,
    extra_params: &std::collections::HashMap<String, String>,
) -> Result<TokenResponse> {
    let mut pairs = vec![
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", redirect_uri),
        ("client_id", client_id),
        ("code_verifier", verifier),
    ];
    if let Some(secret) = client_secret {
        pairs.push(("client_secret", secret));
    }
    if let Some(resource) = resource {
        pairs.push(("resource", resource));
    }
    post_token_form(http, token_endpoint, &pairs, extra_params).await
}

pub async fn refresh_grant(
    http: &reqwest::Client,
    completion: &CompletionRecord,
    refresh_token: &str,
    extra_params: &std::collections::HashMap<String, String>,
) -> Result<TokenResponse> {
    let mut pairs = vec![
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", completion.client_id.as_str()),
    ];
    if let Some(secret) = completion.client_secret.as_deref() {
        pairs.push(("client_secret", secret));
    }
    if let Some(resource) = completion.resource.as_deref() {
        pairs.push(("resource", resource));
    }
    post_token_form(http, &completion.token_endpoint, &pairs, extra_params).await
}

/// RFC 7591 dynamic registration for providers that advertise a
/// registration endpoint. PKCE public clients only.
pub async fn register_client(
    http: &reqwest::Client,
    registration_endpoint: &str,
    client_name: &str,
    redirect_uri: &str,
) -> Result<RegisteredClient> {
    let resp = http
        .post(registration_endpoint)
        .json(&serde_json::json!({
            "client_name": client_name,
            "redirect_uris": [redirect_uri],
            "grant_types": ["authorization_code", "refresh_token"],
            "response_types": ["code"],
            "token_endpoint_auth_method": "none",
        }))
        .send()
        .await
        .with_context(|| format!("POST {registration_endpoint}"))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(anyhow!("client registration returned {status}"));
    }
    resp.json::<RegisteredClient>()
        .await
        .context("parse registration response")
}

/// Build a durable record out of a token response. Scopes keep the
/// provider's original space-split order.
pub fn token_record_from_response(
    server_name: &str,
    server_url: &str,
    resp: &TokenResponse,
    previous_refresh_token: Option<String>,
) -> TokenRecord {
    let scopes = resp
        .scope
        .as_deref()
        .map(|s| s.split(' ').filter(|p| !p.is_empty()).map(str::to_string).collect())
        .unwrap_or_default();
    TokenRecord::new(
        server_name,
        server_url,
        resp.access_token.clone(),
        resp.refresh_token.clone().or(previous_refresh_token),
        resp.token_type.clone().unwrap_or_else(|| "Bearer".into()),
        scopes,
        resp.expires_in
            .filter(|s| *s > 0)
            .map(|s| Utc::now() + ChronoDuration::seconds(s)),
    )
}

/// How the authorization URL reaches the user. The default opens the
/// system browser; tests drive an in-process client instead.
pub type BrowserLauncher = Box<dyn Fn(String) + Send + Sync>;

/// Browser login driver. Serializes per-upstream flows through the
/// coordinator, so concurrent calls for the same server share one
/// browser window and one outcome.
pub struct LoginFlow {
    pub http: reqwest::Client,
    pub flows: Arc<FlowCoordinator>,
    pub callbacks: Arc<CallbackRegistry>,
    pub tokens: Arc<TokenStore>,
    launcher: BrowserLauncher,
}

impl LoginFlow {
    pub fn new(
        flows: Arc<FlowCoordinator>,
        callbacks: Arc<CallbackRegistry>,
        tokens: Arc<TokenStore>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            flows,
            callbacks,
            tokens,
            launcher: Box::new(|url| {
                let _ = open::that_detached(url);
            }),
        }
    }

    pub fn with_launcher(mut self, launcher: BrowserLauncher) -> Self {
        self.launcher = launcher;
        self
    }

    pub async fn login<E: EventEmitter + ?Sized>(
        &self,
        cfg: &UpstreamConfig,
        emitter: &E,
        wait: Duration,
    ) -> Result<()> {
        let (ctx, started) = self.flows.start_flow(&cfg.name).await;
        if !started {
            tracing::info!(
                target = "oauth",
                server = %cfg.name,
                correlation = %ctx.correlation_id,
                "flow already in progress, waiting"
            );
            return self
                .flows
                .wait_for_flow(&cfg.name, wait, &tokio_util::sync::CancellationToken::new())
                .await
                .map_err(|e| anyhow!(e.to_string()));
        }

        let result = self.run_flow(cfg, ctx.correlation_id, wait).await;
        self.flows
            .end_flow(
                &cfg.name,
                result.as_ref().map(|_| ()).map_err(|e| e.to_string()),
            )
            .await;
        match &result {
            Ok(()) => {
                events::servers_changed(
                    emitter,
                    "oauth_completed",
                    Some(serde_json::json!({ "server_name": cfg.name })),
                );
            }
            Err(e) => {
                tracing::warn!(
                    target = "oauth",
                    server = %cfg.name,
                    correlation = %ctx.correlation_id,
                    error = %e,
                    "login failed"
                );
            }
        }
        result
    }

    async fn run_flow(
        &self,
        cfg: &UpstreamConfig,
        correlation: CorrelationId,
        wait: Duration,
    ) -> Result<()> {
        let settings = cfg.oauth.clone().unwrap_or_default();
        let found = discovery::discover(&self.http, &cfg.name, &cfg.url, DEFAULT_PROBE_TIMEOUT)
            .await
            .map_err(|e| anyhow!(e.to_string()))?;
        let resource =
            discovery::detect_resource(&settings.extra_params, found.resource.as_deref(), &cfg.url);

        let listener = self.callbacks.acquire(&cfg.name, settings.callback_port).await?;
        let redirect_uri = listener.redirect_uri();

        let (client_id, client_secret) = match settings.client_id.clone() {
            Some(id) => (id, settings.client_secret.clone()),
            None => match found.auth_server.registration_endpoint.as_deref() {
                Some(endpoint) => {
                    let registered =
                        register_client(&self.http, endpoint, "mcp-warden", &redirect_uri).await?;
                    tracing::info!(
                        target = "oauth",
                        server = %cfg.name,
                        correlation = %correlation,
                        client_id = %registered.client_id,
                        "registered dynamic client"
                    );
                    (registered.client_id, registered.client_secret)
                }
                None => {
                    return Err(anyhow!(
                        "OAuth configuration for {} requires 'client_id' parameter (no registration endpoint advertised)",
                        cfg.name
                    ));
                }
            },
        };

        let scopes = if !settings.scopes.is_empty() {
            settings.scopes.clone()
        } else {
            found.scopes_supported.clone()
        };

        let pkce = generate_pkce();
        let state = generate_state();
        let auth_url = build_authorize_url(
            &found.auth_server.authorization_endpoint,
            &client_id,
            &redirect_uri,
            &scopes,
            &state,
            &pkce,
            Some(&resource),
            &settings.extra_params,
        )?;

        self.flows.update_state(&cfg.name, FlowState::Authenticating).await;
        tracing::info!(
            target = "oauth",
            server = %cfg.name,
            correlation = %correlation,
            "opening browser for authorization"
        );
        (self.launcher)(auth_url.to_string());

        let params = listener.recv(wait).await?;
        if let Some(err) = params.error {
            let desc = params.error_description.unwrap_or_default();
            return Err(if desc.is_empty() {
                anyhow!("authorization failed: {err}")
            } else {
                anyhow!("authorization failed: {err}: {desc}")
            });
        }
        if params.state.as_deref() != Some(state.as_str()) {
            return Err(anyhow!("state mismatch in oauth callback"));
        }
        let code = params
            .code
            .ok_or_else(|| anyhow!("oauth callback missing code parameter"))?;

        self.flows.update_state(&cfg.name, FlowState::TokenExchange).await;
        let token = exchange_code(
            &self.http,
            &found.auth_server.token_endpoint,
            &client_id,
            client_secret.as_deref(),
            &redirect_uri,
            &code,
            &pkce.verifier,
            Some(&resource),
            &settings.extra_params,
        )
        .await?;

        let record = token_record_from_response(&cfg.name, &cfg.url, &token, None);
        let expires_at = record.expires_at;
        self.tokens.save_token(record).await?;
        self.tokens
            .save_completion(&CompletionRecord {
                server_key: server_key(&cfg.name, &cfg.url),
                server_name: cfg.name.clone(),
                server_url: cfg.url.clone(),
                authorization_endpoint: found.auth_server.authorization_endpoint.clone(),
                token_endpoint: found.auth_server.token_endpoint.clone(),
                client_id,
                client_secret,
                resource: Some(resource),
                scopes,
                extra_params: settings.extra_params.clone(),
                updated: Utc::now().timestamp(),
            })
            .await?;
        tracing::info!(
            target = "oauth",
            server = %cfg.name,
            correlation = %correlation,
            expires_at = ?expires_at,
            "authorization complete"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkce_material_is_well_formed() {
        let pkce = generate_pkce();
        // 32 octets base64url without padding.
        assert_eq!(pkce.verifier.len(), 43);
        assert!(!pkce.verifier.contains('='));
        let expected = URL_SAFE_NO_PAD.encode(Sha256::digest(pkce.verifier.as_bytes()));
        assert_eq!(pkce.challenge, expected);
        assert_ne!(generate_pkce().verifier, pkce.verifier);
    }

    #[test]
    fn state_values_are_unique() {
        assert_ne!(generate_state(), generate_state());
    }

    #[test]
    fn authorize_url_carries_required_parameters() {
        let pkce = generate_pkce();
        let extra = std::collections::HashMap::from([(
            "audience".to_string(),
            "mcp-api".to_string(),
        )]);
        let url = build_authorize_url(
            "https://auth.example.com/oauth/authorize",
            "cid",
            "http://127.0.0.1:7777/oauth/callback",
            &["mcp".to_string(), "offline".to_string()],
            "st4te",
            &pkce,
            Some("https://api.example.com/mcp"),
            &extra,
        )
        .unwrap();
        let pairs: std::collections::HashMap<String, String> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["client_id"], "cid");
        assert_eq!(pairs["redirect_uri"], "http://127.0.0.1:7777/oauth/callback");
        assert_eq!(pairs["scope"], "mcp offline");
        assert_eq!(pairs["state"], "st4te");
        assert_eq!(pairs["code_challenge"], pkce.challenge);
        assert_eq!(pairs["code_challenge_method"], "S256");
        assert_eq!(pairs["resource"], "https://api.example.com/mcp");
        assert_eq!(pairs["audience"], "mcp-api");
    }

    #[test]
    fn token_record_mapping_preserves_scope_order_and_refresh() {
        let resp = TokenResponse {
            access_token: "at".into(),
            token_type: None,
            expires_in: Some(3600),
            refresh_token: None,
            scope: Some("zebra alpha".into()),
        };
        let record = token_record_from_response("srv", "https://u", &resp, Some("old-rt".into()));
        assert_eq!(record.token_type, "Bearer");
        assert_eq!(record.scopes, vec!["zebra", "alpha"]);
        // Providers that omit refresh_token on refresh keep the old one.
        assert_eq!(record.refresh_token.as_deref(), Some("old-rt"));
        let remaining = record.expires_at.unwrap() - Utc::now();
        assert!(remaining > ChronoDuration::seconds(3590));
        assert!(remaining <= ChronoDuration::seconds(3600));
    }

    #[test]
    fn token_record_without_expiry() {
        let resp = TokenResponse {
            access_token: "at".into(),
            ..Default::default()
        };
        let record = token_record_from_response("srv", "u", &resp, None);
        assert!(record.expires_at.is_none());
        assert!(!record.is_expired(Utc::now()));
    }
}
