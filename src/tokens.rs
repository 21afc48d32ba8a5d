//! Durable per-upstream OAuth token storage. Records are keyed by a hash
//! of `(name, url)` so two upstreams sharing a display name never collide,
//! and reads report `expires_at` early by a grace period so refresh runs
//! before the token actually dies.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::store::{BUCKET_OAUTH_COMPLETIONS, BUCKET_OAUTH_TOKENS, SqliteStore};

/// Lead time subtracted from a reported `expires_at` to drive proactive
/// refresh. Tokens whose whole lifetime fits inside the grace period are
/// reported unmodified, otherwise they would look expired at issuance.
pub const GRACE_PERIOD: Duration = Duration::minutes(5);

pub fn server_key(name: &str, url: &str) -> String {
    let digest = Sha256::digest(format!("{name}|{url}").as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("{name}_{}", &hex[..16])
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenRecord {
    pub server_key: String,
    pub server_name: String,
    pub server_url: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl TokenRecord {
    pub fn new(
        server_name: &str,
        server_url: &str,
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        token_type: impl Into<String>,
        scopes: Vec<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            server_key: server_key(server_name, server_url),
            server_name: server_name.to_string(),
            server_url: server_url.to_string(),
            access_token: access_token.into(),
            refresh_token,
            token_type: token_type.into(),
            scopes,
            expires_at,
            created: now,
            updated: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|e| now >= e)
    }

    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

/// On-disk form. Scopes round-trip as a space-joined string; timestamps
/// as unix seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredToken {
    server_key: String,
    server_name: String,
    server_url: String,
    access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    #[serde(default)]
    token_type: String,
    #[serde(default)]
    scope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<i64>,
    created: i64,
    updated: i64,
}

impl From<&TokenRecord> for StoredToken {
    fn from(r: &TokenRecord) -> Self {
        Self {
            server_key: r.server_key.clone(),
            server_name: r.server_name.clone(),
            server_url: r.server_url.clone(),
            access_token: r.access_token.clone(),
            refresh_token: r.refresh_token.clone(),
            token_type: r.token_type.clone(),
            scope: r.scopes.join(" "),
            expires_at: r.expires_at.map(|t| t.timestamp()),
            created: r.created.timestamp(),
            updated: r.updated.timestamp(),
        }
    }
}

impl StoredToken {
    fn into_record(self) -> TokenRecord {
        TokenRecord {
            server_key: self.server_key,
            server_name: self.server_name,
            server_url: self.server_url,
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            token_type: self.token_type,
            scopes: if self.scope.is_empty() {
                Vec::new()
            } else {
                self.scope.split(' ').map(|s| s.to_string()).collect()
            },
            expires_at: self.expires_at.and_then(|t| Utc.timestamp_opt(t, 0).single()),
            created: Utc
                .timestamp_opt(self.created, 0)
                .single()
                .unwrap_or_else(Utc::now),
            updated: Utc
                .timestamp_opt(self.updated, 0)
                .single()
                .unwrap_or_else(Utc::now),
        }
    }
}

/// Everything the refresh manager needs to mint a new access token
/// without re-running discovery, persisted when an authorization flow
/// completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub server_key: String,
    pub server_name: String,
    pub server_url: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Configured extras re-sent on every refresh grant.
    #[serde(default)]
    pub extra_params: std::collections::HashMap<String, String>,
    pub updated: i64,
}

#[derive(Debug, Clone)]
pub enum TokenEvent {
    Saved {
        server_name: String,
        server_url: String,
        server_key: String,
        expires_at: Option<DateTime<Utc>>,
    },
    Cleared {
        server_name: String,
        server_url: String,
        server_key: String,
    },
}

pub type TokenHook = Arc<dyn Fn(&TokenEvent) + Send + Sync>;

pub struct TokenStore {
    store: Arc<SqliteStore>,
    hooks: RwLock<Vec<TokenHook>>,
}

impl TokenStore {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self {
            store,
            hooks: RwLock::new(Vec::new()),
        }
    }

    /// Register a callback fired after every successful save/clear.
    pub fn on_event(&self, hook: TokenHook) {
        self.hooks.write().expect("hooks lock poisoned").push(hook);
    }

    fn fire(&self, event: TokenEvent) {
        let hooks = self.hooks.read().expect("hooks lock poisoned").clone();
        for hook in hooks {
            hook(&event);
        }
    }

    pub async fn save_token(&self, mut record: TokenRecord) -> anyhow::Result<TokenRecord> {
        // Upsert keeps the original creation time.
        if let Some(existing) = self
            .store
            .kv_get::<StoredToken>(BUCKET_OAUTH_TOKENS, &record.server_key)
            .await?
        {
            record.created = existing.into_record().created;
        }
        record.updated = Utc::now();
        self.store
            .kv_put(BUCKET_OAUTH_TOKENS, &record.server_key, &StoredToken::from(&record))
            .await?;
        tracing::debug!(
            target = "store",
            server = %record.server_name,
            expires_at = ?record.expires_at,
            "token saved"
        );
        self.fire(TokenEvent::Saved {
            server_name: record.server_name.clone(),
            server_url: record.server_url.clone(),
            server_key: record.server_key.clone(),
            expires_at: record.expires_at,
        });
        Ok(record)
    }

    /// Fetch the token with the grace-period adjustment applied. Expired
    /// tokens are still returned so callers can refresh them.
    pub async fn get_token(&self, name: &str, url: &str) -> anyhow::Result<Option<TokenRecord>> {
        Ok(self.get_token_raw(name, url).await?.map(apply_grace))
    }

    /// Fetch the token exactly as stored, without the grace adjustment.
    pub async fn get_token_raw(
        &self,
        name: &str,
        url: &str,
    ) -> anyhow::Result<Option<TokenRecord>> {
        let key = server_key(name, url);
        Ok(self
            .store
            .kv_get::<StoredToken>(BUCKET_OAUTH_TOKENS, &key)
            .await?
            .map(StoredToken::into_record))
    }

    pub async fn clear_token(&self, name: &str, url: &str) -> anyhow::Result<bool> {
        let key = server_key(name, url);
        let existed = self.store.kv_delete(BUCKET_OAUTH_TOKENS, &key).await?;
        if existed {
            self.fire(TokenEvent::Cleared {
                server_name: name.to_string(),
                server_url: url.to_string(),
                server_key: key,
            });
        }
        Ok(existed)
    }

    pub async fn list_tokens(&self) -> anyhow::Result<Vec<TokenRecord>> {
        Ok(self
            .store
            .kv_list::<StoredToken>(BUCKET_OAUTH_TOKENS)
            .await?
            .into_iter()
            .map(|(_, stored)| stored.into_record())
            .collect())
    }

    pub async fn save_completion(&self, completion: &CompletionRecord) -> anyhow::Result<()> {
        self.store
            .kv_put(BUCKET_OAUTH_COMPLETIONS, &completion.server_key, completion)
            .await
    }

    pub async fn get_completion(
        &self,
        name: &str,
        url: &str,
    ) -> anyhow::Result<Option<CompletionRecord>> {
        self.store
            .kv_get(BUCKET_OAUTH_COMPLETIONS, &server_key(name, url))
            .await
    }

    pub async fn clear_completion(&self, name: &str, url: &str) -> anyhow::Result<bool> {
        self.store
            .kv_delete(BUCKET_OAUTH_COMPLETIONS, &server_key(name, url))
            .await
    }
}

fn apply_grace(record: TokenRecord) -> TokenRecord {
    let Some(expires_at) = record.expires_at else {
        return record;
    };
    let lifetime = expires_at - record.updated;
    if lifetime <= GRACE_PERIOD {
        return record;
    }
    TokenRecord {
        expires_at: Some(expires_at - GRACE_PERIOD),
        ..record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_token_store() -> TokenStore {
        let stamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "mcp-warden-tokens-{}-{stamp}",
            std::process::id()
        ));
        let store = SqliteStore::open(dir.join("warden.sqlite")).await.unwrap();
        TokenStore::new(Arc::new(store))
    }

    #[test]
    fn server_key_distinguishes_urls() {
        let a = server_key("github", "https://a.example.com/mcp");
        let b = server_key("github", "https://b.example.com/mcp");
        assert_ne!(a, b);
        assert!(a.starts_with("github_"));
        assert_eq!(a.len(), "github_".len() + 16);
    }

    #[tokio::test]
    async fn long_lived_token_is_reported_early_by_grace() {
        let ts = temp_token_store().await;
        let expires = Utc::now() + Duration::hours(1);
        let record = TokenRecord::new(
            "srv",
            "https://srv.example.com/mcp",
            "at",
            Some("rt".into()),
            "Bearer",
            vec!["mcp".into()],
            Some(expires),
        );
        ts.save_token(record).await.unwrap();

        let adjusted = ts
            .get_token("srv", "https://srv.example.com/mcp")
            .await
            .unwrap()
            .unwrap();
        // Stored timestamps are truncated to whole seconds.
        let want = expires.timestamp() - GRACE_PERIOD.num_seconds();
        assert_eq!(adjusted.expires_at.unwrap().timestamp(), want);

        let raw = ts
            .get_token_raw("srv", "https://srv.example.com/mcp")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(raw.expires_at.unwrap().timestamp(), expires.timestamp());
    }

    #[tokio::test]
    async fn short_lived_token_is_returned_unmodified() {
        let ts = temp_token_store().await;
        // Lifetime exactly equal to the grace period: no adjustment, and
        // the token is not considered expired.
        let expires = Utc::now() + GRACE_PERIOD;
        let record = TokenRecord::new(
            "srv",
            "https://srv.example.com/mcp",
            "at",
            None,
            "Bearer",
            vec![],
            Some(expires),
        );
        ts.save_token(record).await.unwrap();
        let got = ts
            .get_token("srv", "https://srv.example.com/mcp")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.expires_at.unwrap().timestamp(), expires.timestamp());
        assert!(!got.is_expired(Utc::now()));
    }

    #[tokio::test]
    async fn scopes_round_trip_in_order() {
        let ts = temp_token_store().await;
        let record = TokenRecord::new(
            "srv",
            "u",
            "at",
            None,
            "Bearer",
            vec!["zebra".into(), "alpha".into(), "mid".into()],
            None,
        );
        ts.save_token(record).await.unwrap();
        let got = ts.get_token("srv", "u").await.unwrap().unwrap();
        assert_eq!(got.scopes, vec!["zebra", "alpha", "mid"]);
    }

    #[tokio::test]
    async fn hooks_fire_on_save_and_clear() {
        let ts = temp_token_store().await;
        let seen: Arc<std::sync::Mutex<Vec<String>>> = Arc::default();
        let seen_hook = seen.clone();
        ts.on_event(Arc::new(move |evt| {
            let label = match evt {
                TokenEvent::Saved { server_name, .. } => format!("saved:{server_name}"),
                TokenEvent::Cleared { server_name, .. } => format!("cleared:{server_name}"),
            };
            seen_hook.lock().unwrap().push(label);
        }));
        let record = TokenRecord::new("srv", "u", "at", None, "Bearer", vec![], None);
        ts.save_token(record).await.unwrap();
        assert!(ts.clear_token("srv", "u").await.unwrap());
        // Clearing again does not re-fire.
        assert!(!ts.clear_token("srv", "u").await.unwrap());
        assert_eq!(
            seen.lock().unwrap().clone(),
            vec!["saved:srv".to_string(), "cleared:srv".to_string()]
        );
    }

    #[tokio::test]
    async fn upsert_preserves_created_time() {
        let ts = temp_token_store().await;
        let first = ts
            .save_token(TokenRecord::new("srv", "u", "at1", None, "Bearer", vec![], None))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let second = ts
            .save_token(TokenRecord::new("srv", "u", "at2", None, "Bearer", vec![], None))
            .await
            .unwrap();
        assert_eq!(first.created.timestamp(), second.created.timestamp());
        let got = ts.get_token_raw("srv", "u").await.unwrap().unwrap();
        assert_eq!(got.access_token, "at2");
    }
}
