//! OAuth metadata discovery: RFC 9728 protected-resource metadata probed
//! off a 401 challenge, and RFC 8414 authorization-server metadata with
//! the URL fallback chain legacy providers need.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_ATTEMPTS: usize = 3;
const MAX_RETRY_HINT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtectedResourceMetadata {
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub authorization_servers: Vec<String>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
    #[serde(default)]
    pub bearer_methods_supported: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthorizationServerMetadata {
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub authorization_endpoint: String,
    #[serde(default)]
    pub token_endpoint: String,
    #[serde(default)]
    pub registration_endpoint: Option<String>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
}

impl AuthorizationServerMetadata {
    pub fn is_usable(&self) -> bool {
        !self.authorization_endpoint.is_empty() && !self.token_endpoint.is_empty()
    }
}

// ---- error envelope ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataErrorType {
    OauthMetadataMissing,
    OauthMetadataInvalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetadataErrorCode {
    #[serde(rename = "OAUTH_NO_METADATA")]
    OauthNoMetadata,
    #[serde(rename = "OAUTH_BAD_METADATA")]
    OauthBadMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProbeDetail {
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_checked: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urls_checked: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_servers: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataErrorDetails {
    pub server_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protected_resource_metadata: Option<ProbeDetail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_server_metadata: Option<ProbeDetail>,
}

/// Surfaced when preflight metadata validation fails, in a shape clients
/// can render verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataError {
    pub error_type: MetadataErrorType,
    pub error_code: MetadataErrorCode,
    pub server_name: String,
    pub message: String,
    pub suggestion: String,
    pub details: MetadataErrorDetails,
}

impl fmt::Display for MetadataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.server_name, self.message)
    }
}

impl std::error::Error for MetadataError {}

// ---- WWW-Authenticate parsing ----

/// Extract the `resource_metadata` URL from a `WWW-Authenticate` header
/// value, e.g. `Bearer resource_metadata="https://h/.well-known/..."`.
pub fn extract_resource_metadata_url(header: &str) -> Option<String> {
    let idx = header.find("resource_metadata=")?;
    let rest = &header[idx + "resource_metadata=".len()..];
    let value = if let Some(stripped) = rest.strip_prefix('"') {
        stripped.split('"').next()?
    } else {
        rest.split([',', ' ']).next()?
    };
    if value.is_empty() { None } else { Some(value.to_string()) }
}

/// Inverse of [`extract_resource_metadata_url`], used by tests and by the
/// fake providers in the integration suite.
pub fn format_auth_header(url: &str) -> String {
    format!("Bearer resource_metadata=\"{url}\"")
}

// ---- candidate URL chain ----

/// RFC 8414 well-known candidates for an issuer, most standard first.
/// For `https://h/p`: path-suffix form, then the legacy path-prefix form,
/// then the root document.
pub fn candidate_metadata_urls(issuer: &Url) -> Vec<String> {
    const WELL_KNOWN: &str = "/.well-known/oauth-authorization-server";
    let origin = issuer.origin().ascii_serialization();
    let path = issuer.path().trim_end_matches('/');
    if path.is_empty() {
        return vec![format!("{origin}{WELL_KNOWN}")];
    }
    vec![
        format!("{origin}{WELL_KNOWN}{path}"),
        format!("{origin}{path}{WELL_KNOWN}"),
        format!("{origin}{WELL_KNOWN}"),
    ]
}

// ---- rate-limit hints ----

pub fn retry_after_hint(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let raw = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    if let Ok(secs) = raw.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs).min(MAX_RETRY_HINT));
    }
    let when = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    let delta = (when - Utc::now()).to_std().ok()?;
    Some(delta.min(MAX_RETRY_HINT))
}

/// Some providers return the reset moment in the body instead of the
/// header, either top-level or nested under `detail`.
pub fn reset_at_hint(body: &serde_json::Value) -> Option<Duration> {
    let raw = body
        .get("reset_at")
        .or_else(|| body.get("detail").and_then(|d| d.get("reset_at")))?
        .as_str()?;
    let when = DateTime::parse_from_rfc3339(raw).ok()?.with_timezone(&Utc);
    let delta = (when - Utc::now()).to_std().ok()?;
    Some(delta.min(MAX_RETRY_HINT))
}

async fn get_with_retries(
    http: &reqwest::Client,
    url: &str,
    probe_timeout: Duration,
) -> Result<(reqwest::StatusCode, serde_json::Value), String> {
    let mut last_err = String::new();
    for attempt in 0..MAX_ATTEMPTS {
        match http.get(url).timeout(probe_timeout).send().await {
            Ok(resp) => {
                let status = resp.status();
                if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                    let header_hint = retry_after_hint(resp.headers());
                    let body: serde_json::Value = resp.json().await.unwrap_or_default();
                    let wait = header_hint
                        .or_else(|| reset_at_hint(&body))
                        .unwrap_or(Duration::from_secs(1));
                    tracing::debug!(target = "discovery", url, attempt, wait_ms = wait.as_millis() as u64, "rate limited");
                    last_err = format!("rate limited fetching {url}");
                    tokio::time::sleep(wait).await;
                    continue;
                }
                if status.is_server_error() {
                    // Do not hammer a broken provider; callers fall back.
                    return Err(format!("{url} returned {status}"));
                }
                let body: serde_json::Value = resp.json().await.unwrap_or_default();
                return Ok((status, body));
            }
            Err(e) => {
                last_err = format!("GET {url}: {e}");
                tracing::debug!(target = "discovery", url, attempt, error = %e, "probe failed");
            }
        }
    }
    Err(last_err)
}

// ---- discovery ----

#[derive(Debug, Clone, Default)]
pub struct ProtectedResourceProbe {
    pub found: bool,
    pub url_checked: Option<String>,
    pub metadata: Option<ProtectedResourceMetadata>,
    pub error: Option<String>,
}

/// Probe the resource itself: a 401 with a `resource_metadata` challenge
/// points at the RFC 9728 document. Absence is not an error; plenty of
/// servers skip it.
pub async fn probe_protected_resource(
    http: &reqwest::Client,
    server_url: &str,
    probe_timeout: Duration,
) -> ProtectedResourceProbe {
    let mut probe = ProtectedResourceProbe::default();
    let resp = match http.get(server_url).timeout(probe_timeout).send().await {
        Ok(resp) => resp,
        Err(e) => {
            probe.error = Some(format!("probe {server_url}: {e}"));
            return probe;
        }
    };
    let challenge = resp
        .headers()
        .get(reqwest::header::WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
        .and_then(extract_resource_metadata_url);
    let Some(metadata_url) = challenge else {
        return probe;
    };
    probe.url_checked = Some(metadata_url.clone());
    match get_with_retries(http, &metadata_url, probe_timeout).await {
        Ok((status, body)) if status.is_success() => {
            match serde_json::from_value::<ProtectedResourceMetadata>(body) {
                Ok(metadata) => {
                    probe.found = true;
                    probe.metadata = Some(metadata);
                }
                Err(e) => probe.error = Some(format!("parse {metadata_url}: {e}")),
            }
        }
        Ok((status, _)) => probe.error = Some(format!("{metadata_url} returned {status}")),
        Err(e) => probe.error = Some(e),
    }
    probe
}

#[derive(Debug, Clone)]
pub struct DiscoveredAuthServer {
    pub metadata: AuthorizationServerMetadata,
    pub url: String,
    pub urls_checked: Vec<String>,
}

/// Walk the candidate chain; the first document carrying both an
/// authorization and a token endpoint wins.
pub async fn discover_authorization_server(
    http: &reqwest::Client,
    issuer: &str,
    probe_timeout: Duration,
) -> Result<DiscoveredAuthServer, (Vec<String>, String)> {
    let issuer_url = Url::parse(issuer).map_err(|e| (vec![], format!("parse issuer {issuer}: {e}")))?;
    let candidates = candidate_metadata_urls(&issuer_url);
    let mut checked = Vec::with_capacity(candidates.len());
    let mut last_err = format!("no usable metadata under {issuer}");
    for candidate in candidates {
        checked.push(candidate.clone());
        match get_with_retries(http, &candidate, probe_timeout).await {
            Ok((status, body)) if status.is_success() => {
                match serde_json::from_value::<AuthorizationServerMetadata>(body) {
                    Ok(metadata) if metadata.is_usable() => {
                        return Ok(DiscoveredAuthServer {
                            metadata,
                            url: candidate,
                            urls_checked: checked,
                        });
                    }
                    Ok(_) => {
                        last_err = format!("{candidate}: missing authorization or token endpoint");
                    }
                    Err(e) => last_err = format!("parse {candidate}: {e}"),
                }
            }
            Ok((status, _)) => last_err = format!("{candidate} returned {status}"),
            Err(e) => last_err = e,
        }
    }
    Err((checked, last_err))
}

#[derive(Debug, Clone)]
pub struct Discovery {
    pub auth_server: AuthorizationServerMetadata,
    pub auth_server_url: String,
    pub resource: Option<String>,
    pub scopes_supported: Vec<String>,
}

/// Full preflight: protected-resource probe, then authorization-server
/// discovery against the advertised issuer (or the server origin when
/// nothing is advertised).
pub async fn discover(
    http: &reqwest::Client,
    server_name: &str,
    server_url: &str,
    probe_timeout: Duration,
) -> Result<Discovery, Box<MetadataError>> {
    let prm = probe_protected_resource(http, server_url, probe_timeout).await;

    let issuer = prm
        .metadata
        .as_ref()
        .and_then(|m| m.authorization_servers.first().cloned())
        .unwrap_or_else(|| origin_of(server_url));

    match discover_authorization_server(http, &issuer, probe_timeout).await {
        Ok(found) => Ok(Discovery {
            auth_server: found.metadata,
            auth_server_url: found.url,
            resource: prm.metadata.as_ref().and_then(|m| m.resource.clone()),
            scopes_supported: prm
                .metadata
                .as_ref()
                .map(|m| m.scopes_supported.clone())
                .unwrap_or_default(),
        }),
        Err((urls_checked, error)) => {
            let invalid = !urls_checked.is_empty() && error.contains("missing authorization");
            Err(Box::new(MetadataError {
                error_type: if invalid {
                    MetadataErrorType::OauthMetadataInvalid
                } else {
                    MetadataErrorType::OauthMetadataMissing
                },
                error_code: if invalid {
                    MetadataErrorCode::OauthBadMetadata
                } else {
                    MetadataErrorCode::OauthNoMetadata
                },
                server_name: server_name.to_string(),
                message: format!("OAuth metadata discovery failed for {server_url}: {error}"),
                suggestion: format!(
                    "Check that {issuer} serves RFC 8414 authorization server metadata, or configure the endpoints explicitly."
                ),
                details: MetadataErrorDetails {
                    server_url: server_url.to_string(),
                    protected_resource_metadata: Some(ProbeDetail {
                        found: prm.found,
                        url_checked: prm.url_checked.clone(),
                        urls_checked: None,
                        error: prm.error.clone(),
                        authorization_servers: prm
                            .metadata
                            .as_ref()
                            .map(|m| m.authorization_servers.clone()),
                    }),
                    authorization_server_metadata: Some(ProbeDetail {
                        found: false,
                        url_checked: urls_checked.last().cloned(),
                        urls_checked: Some(urls_checked),
                        error: Some(error),
                        authorization_servers: None,
                    }),
                },
            }))
        }
    }
}

/// RFC 8707 resource indicator selection: an explicitly configured
/// `extra_params.resource` always wins, then the advertised metadata
/// `resource`, then the server URL itself.
pub fn detect_resource(
    extra_params: &HashMap<String, String>,
    discovered: Option<&str>,
    server_url: &str,
) -> String {
    if let Some(manual) = extra_params.get("resource") {
        return manual.clone();
    }
    if let Some(found) = discovered
        && !found.is_empty()
    {
        return found.to_string();
    }
    server_url.to_string()
}

fn origin_of(server_url: &str) -> String {
    Url::parse(server_url)
        .map(|u| u.origin().ascii_serialization())
        .unwrap_or_else(|_| server_url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_header_round_trip() {
        let url = "https://api.example.com/.well-known/oauth-protected-resource";
        assert_eq!(
            extract_resource_metadata_url(&format_auth_header(url)).as_deref(),
            Some(url)
        );
    }

    #[test]
    fn extract_handles_unquoted_and_extra_fields() {
        let header = r#"Bearer realm="mcp", resource_metadata="https://h/meta", error="invalid_token""#;
        assert_eq!(
            extract_resource_metadata_url(header).as_deref(),
            Some("https://h/meta")
        );
        assert_eq!(
            extract_resource_metadata_url("Bearer resource_metadata=https://h/meta, realm=x")
                .as_deref(),
            Some("https://h/meta")
        );
        assert_eq!(extract_resource_metadata_url("Bearer realm=\"x\""), None);
    }

    #[test]
    fn candidate_chain_for_rooted_issuer() {
        let issuer = Url::parse("https://auth.example.com").unwrap();
        assert_eq!(
            candidate_metadata_urls(&issuer),
            vec!["https://auth.example.com/.well-known/oauth-authorization-server"]
        );
    }

    #[test]
    fn candidate_chain_orders_path_suffix_first() {
        let issuer = Url::parse("https://auth.smithery.ai/googledrive").unwrap();
        let urls = candidate_metadata_urls(&issuer);
        assert_eq!(
            urls,
            vec![
                "https://auth.smithery.ai/.well-known/oauth-authorization-server/googledrive",
                "https://auth.smithery.ai/googledrive/.well-known/oauth-authorization-server",
                "https://auth.smithery.ai/.well-known/oauth-authorization-server",
            ]
        );
    }

    #[test]
    fn retry_after_parses_seconds_and_dates() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(retry_after_hint(&headers), Some(Duration::from_secs(7)));

        let future = (Utc::now() + chrono::Duration::seconds(10)).to_rfc2822();
        headers.insert(reqwest::header::RETRY_AFTER, future.parse().unwrap());
        let hint = retry_after_hint(&headers).unwrap();
        assert!(hint <= Duration::from_secs(10));
        assert!(hint >= Duration::from_secs(5));
    }

    #[test]
    fn reset_at_parses_top_level_and_nested() {
        let at = (Utc::now() + chrono::Duration::seconds(8)).to_rfc3339();
        let top = serde_json::json!({ "reset_at": at });
        assert!(reset_at_hint(&top).is_some());
        let nested = serde_json::json!({ "detail": { "reset_at": at } });
        assert!(reset_at_hint(&nested).is_some());
        assert!(reset_at_hint(&serde_json::json!({})).is_none());
    }

    #[test]
    fn resource_precedence() {
        let mut extra = HashMap::new();
        assert_eq!(
            detect_resource(&extra, Some("https://meta"), "https://srv"),
            "https://meta"
        );
        assert_eq!(detect_resource(&extra, None, "https://srv"), "https://srv");
        extra.insert("resource".into(), "https://manual".into());
        assert_eq!(
            detect_resource(&extra, Some("https://meta"), "https://srv"),
            "https://manual"
        );
    }

    #[test]
    fn error_envelope_serialization() {
        let err = MetadataError {
            error_type: MetadataErrorType::OauthMetadataMissing,
            error_code: MetadataErrorCode::OauthNoMetadata,
            server_name: "srv".into(),
            message: "m".into(),
            suggestion: "s".into(),
            details: MetadataErrorDetails {
                server_url: "https://srv".into(),
                ..Default::default()
            },
        };
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v["error_type"], "oauth_metadata_missing");
        assert_eq!(v["error_code"], "OAUTH_NO_METADATA");
    }
}
