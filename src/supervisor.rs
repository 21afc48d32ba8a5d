//! Upstream connection supervisor: reconciles declared configuration into
//! running MCP connections, tracks per-upstream runtime state in an
//! atomically swapped snapshot, and reacts to token lifecycle events.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock, watch};
use tokio_util::sync::CancellationToken;

use crate::client::{self, ClientService};
use crate::config::{Config, ConnectionState, OAuthStatus, Protocol, UpstreamConfig};
use crate::events::{self, EventEmitter};
use crate::health::{UpstreamView, default_warning_window};
use crate::refresh::{RefreshManager, RefreshState};
use crate::secrets::SecretResolver;
use crate::store::{BUCKET_TOOL_HASHES, BUCKET_UPSTREAMS, JournalEvent, SqliteStore};
use crate::tokens::{TokenEvent, TokenStore};
use crate::tools::{DiscoveryGuard, ToolIndex};

/// Cadence for retrying upstreams stuck in `Error`/`Disconnected`.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(60);
/// Drain window between disconnect and reconnect on restart, long enough
/// for child processes and sockets to release.
pub const RESTART_DRAIN: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Serialize)]
pub struct UpstreamSnapshot {
    pub name: String,
    pub enabled: bool,
    pub quarantined: bool,
    pub oauth_required: bool,
    pub connection_state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_time: Option<DateTime<Utc>>,
    pub tool_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth_status: Option<OAuthStatus>,
    pub user_logged_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth_config_error: Option<String>,
}

pub type StateSnapshot = HashMap<String, UpstreamSnapshot>;

/// Read handle over the supervisor's state. Snapshots are immutable;
/// borrowing one never blocks the writer.
#[derive(Clone)]
pub struct StateView {
    rx: watch::Receiver<Arc<StateSnapshot>>,
}

impl StateView {
    pub fn get(&self, name: &str) -> Option<UpstreamSnapshot> {
        self.rx.borrow().get(name).cloned()
    }

    pub fn all(&self) -> Arc<StateSnapshot> {
        self.rx.borrow().clone()
    }
}

#[derive(Debug, Clone)]
struct RuntimeEntry {
    state: ConnectionState,
    last_error: Option<String>,
    error_time: Option<DateTime<Utc>>,
    tools: usize,
    connected_at: Option<DateTime<Utc>>,
    oauth_status: Option<OAuthStatus>,
    user_logged_out: bool,
    /// Set when a 401 probe showed the endpoint wants auth even though
    /// the config does not declare OAuth.
    auth_probe_required: bool,
    missing_secret: Option<String>,
    oauth_config_error: Option<String>,
}

impl Default for RuntimeEntry {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            last_error: None,
            error_time: None,
            tools: 0,
            connected_at: None,
            oauth_status: None,
            user_logged_out: false,
            auth_probe_required: false,
            missing_secret: None,
            oauth_config_error: None,
        }
    }
}

struct Inner {
    config: RwLock<Config>,
    connections: Mutex<HashMap<String, Arc<ClientService>>>,
    runtime: Mutex<HashMap<String, RuntimeEntry>>,
    state_tx: watch::Sender<Arc<StateSnapshot>>,
    emitter: Arc<dyn EventEmitter>,
    tokens: Arc<TokenStore>,
    store: Arc<SqliteStore>,
    index: Arc<dyn ToolIndex>,
    secrets: Arc<SecretResolver>,
    guard: DiscoveryGuard,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

fn state_label(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Idle => "idle",
        ConnectionState::Connecting => "connecting",
        ConnectionState::Connected => "connected",
        ConnectionState::Error => "error",
        ConnectionState::Disconnected => "disconnected",
    }
}

impl Supervisor {
    pub fn new(
        emitter: Arc<dyn EventEmitter>,
        store: Arc<SqliteStore>,
        tokens: Arc<TokenStore>,
        index: Arc<dyn ToolIndex>,
        secrets: Arc<SecretResolver>,
        cancel: CancellationToken,
    ) -> (Self, StateView) {
        let (state_tx, state_rx) = watch::channel(Arc::new(StateSnapshot::new()));
        let supervisor = Self {
            inner: Arc::new(Inner {
                config: RwLock::new(crate::config::default_config()),
                connections: Mutex::new(HashMap::new()),
                runtime: Mutex::new(HashMap::new()),
                state_tx,
                emitter,
                tokens,
                store,
                index,
                secrets,
                guard: DiscoveryGuard::new(),
                cancel,
            }),
        };
        supervisor.attach_token_hooks();
        (supervisor, StateView { rx: state_rx })
    }

    /// Token lifecycle feedback: a fresh token flips the upstream back to
    /// authenticated and reconnects it if it was down; a cleared token
    /// drops the authenticated marker.
    fn attach_token_hooks(&self) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        self.inner.tokens.on_event(Arc::new(move |event| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let supervisor = Supervisor { inner };
            match event {
                TokenEvent::Saved { server_name, .. } => {
                    let name = server_name.clone();
                    tokio::spawn(async move {
                        supervisor.on_token_saved(&name).await;
                    });
                }
                TokenEvent::Cleared { server_name, .. } => {
                    let name = server_name.clone();
                    tokio::spawn(async move {
                        supervisor
                            .update_runtime(&name, |entry| {
                                entry.oauth_status = Some(OAuthStatus::None);
                            })
                            .await;
                    });
                }
            }
        }));
    }

    async fn on_token_saved(&self, name: &str) {
        let needs_reconnect = {
            let mut runtime = self.inner.runtime.lock().await;
            let entry = runtime.entry(name.to_string()).or_default();
            entry.oauth_status = Some(OAuthStatus::Authenticated);
            entry.user_logged_out = false;
            matches!(
                entry.state,
                ConnectionState::Error | ConnectionState::Disconnected | ConnectionState::Idle
            )
        };
        self.publish().await;
        let enabled = {
            let config = self.inner.config.read().await;
            config.server(name).is_some_and(|s| s.enabled)
        };
        if needs_reconnect && enabled {
            self.connect_server(name).await;
        }
    }

    async fn update_runtime<F: FnOnce(&mut RuntimeEntry)>(&self, name: &str, f: F) {
        {
            let mut runtime = self.inner.runtime.lock().await;
            f(runtime.entry(name.to_string()).or_default());
        }
        self.publish().await;
    }

    /// Rebuild and swap the immutable state snapshot.
    async fn publish(&self) {
        let config = self.inner.config.read().await;
        let runtime = self.inner.runtime.lock().await;
        let mut snapshot = StateSnapshot::with_capacity(config.servers.len());
        for server in &config.servers {
            let entry = runtime.get(&server.name).cloned().unwrap_or_default();
            snapshot.insert(
                server.name.clone(),
                UpstreamSnapshot {
                    name: server.name.clone(),
                    enabled: server.enabled,
                    quarantined: server.quarantined,
                    oauth_required: server.oauth_required() || entry.auth_probe_required,
                    connection_state: entry.state,
                    last_error: entry.last_error,
                    error_time: entry.error_time,
                    tool_count: entry.tools,
                    connected_at: entry.connected_at,
                    oauth_status: entry.oauth_status,
                    user_logged_out: entry.user_logged_out,
                    missing_secret: entry.missing_secret,
                    oauth_config_error: entry.oauth_config_error,
                },
            );
        }
        self.inner.state_tx.send_replace(Arc::new(snapshot));
    }

    // ---- reconcile ----

    /// Converge declared configuration into running connections. Storage
    /// and the in-memory declared set are updated synchronously before
    /// any connection work, so external readers see the new fleet
    /// immediately; adds, removes and reconnects then run concurrently.
    pub async fn reconcile(&self, new_config: Config) -> Result<()> {
        new_config.validate()?;

        let (to_remove, to_add, oauth_changed) = {
            let mut config = self.inner.config.write().await;
            let old = config.clone();
            let declared: HashSet<String> =
                new_config.servers.iter().map(|s| s.name.clone()).collect();

            let mut oauth_changed = Vec::new();
            for server in &new_config.servers {
                if let Some(previous) = old.server(&server.name)
                    && previous.oauth_fingerprint() != server.oauth_fingerprint()
                {
                    oauth_changed.push(server.clone());
                }
            }

            // Storage mutations happen before the concurrent phase.
            for server in &new_config.servers {
                self.inner
                    .store
                    .kv_put(BUCKET_UPSTREAMS, &server.name, server)
                    .await?;
            }
            for server in &old.servers {
                if !declared.contains(&server.name) {
                    self.inner
                        .store
                        .kv_delete(BUCKET_UPSTREAMS, &server.name)
                        .await?;
                    self.inner.index.delete_server_tools(&server.name);
                }
            }

            let running: HashSet<String> = {
                let connections = self.inner.connections.lock().await;
                connections.keys().cloned().collect()
            };
            let wanted: HashSet<String> = new_config
                .servers
                .iter()
                .filter(|s| s.enabled)
                .map(|s| s.name.clone())
                .collect();

            let to_remove: Vec<String> = running.difference(&wanted).cloned().collect();
            let to_add: Vec<String> = wanted.difference(&running).cloned().collect();

            *config = new_config;
            (to_remove, to_add, oauth_changed)
        };

        // Drop runtime entries for servers that vanished entirely.
        {
            let config = self.inner.config.read().await;
            let declared: HashSet<String> =
                config.servers.iter().map(|s| s.name.clone()).collect();
            let mut runtime = self.inner.runtime.lock().await;
            runtime.retain(|name, _| declared.contains(name));
        }

        // An OAuth config change invalidates stored tokens and client
        // registrations for that server.
        for server in &oauth_changed {
            tracing::info!(target = "supervisor", server = %server.name, "oauth config changed, clearing cached oauth state");
            let _ = self.inner.tokens.clear_completion(&server.name, &server.url).await;
            let _ = self.inner.tokens.clear_token(&server.name, &server.url).await;
            self.update_runtime(&server.name, |entry| {
                entry.oauth_status = None;
                entry.user_logged_out = false;
            })
            .await;
            events::servers_changed(
                self.inner.emitter.as_ref(),
                "oauth_config_changed",
                Some(serde_json::json!({ "server_name": server.name })),
            );
        }

        self.publish().await;

        let mut tasks = Vec::new();
        for name in to_remove {
            let supervisor = self.clone();
            tasks.push(tokio::spawn(async move {
                supervisor.disconnect_server(&name, "reconcile").await;
            }));
        }
        for name in to_add {
            let supervisor = self.clone();
            tasks.push(tokio::spawn(async move {
                supervisor.connect_server(&name).await;
            }));
        }
        join_all(tasks).await;

        events::servers_changed(self.inner.emitter.as_ref(), "reconcile", None);
        Ok(())
    }

    // ---- connection lifecycle ----

    pub async fn connect_server(&self, name: &str) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        let cfg = {
            let config = self.inner.config.read().await;
            match config.server(name) {
                Some(s) if s.enabled => s.clone(),
                _ => return,
            }
        };
        {
            // One connection per upstream; a concurrent attempt backs off.
            let connections = self.inner.connections.lock().await;
            if connections.contains_key(name) {
                return;
            }
        }

        self.update_runtime(name, |entry| {
            entry.state = ConnectionState::Connecting;
            entry.missing_secret = None;
        })
        .await;
        events::server_state_changed(self.inner.emitter.as_ref(), name, state_label(ConnectionState::Connecting));

        let (env, headers) = match (
            self.inner.secrets.resolve_map(&cfg.env),
            self.inner.secrets.resolve_map(&cfg.headers),
        ) {
            (Ok(env), Ok(headers)) => (env, headers),
            (Err(e), _) | (_, Err(e)) => {
                let missing = e.missing_name().map(|s| s.to_string());
                let message = e.to_string();
                tracing::warn!(target = "supervisor", server = %name, error = %message, "secret resolution failed");
                self.update_runtime(name, |entry| {
                    entry.state = ConnectionState::Error;
                    entry.last_error = Some(message.clone());
                    entry.error_time = Some(Utc::now());
                    entry.missing_secret = missing;
                })
                .await;
                events::server_state_changed(self.inner.emitter.as_ref(), name, state_label(ConnectionState::Error));
                return;
            }
        };

        let bearer = if cfg.oauth_required() {
            match self.inner.tokens.get_token(&cfg.name, &cfg.url).await {
                Ok(Some(token)) => Some(token.access_token),
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!(target = "supervisor", server = %name, error = %e, "token load failed");
                    None
                }
            }
        } else {
            None
        };
        let had_token = bearer.is_some();

        match client::connect(&cfg, &headers, &env, bearer.as_deref()).await {
            Ok(service) => {
                let service = Arc::new(service);
                {
                    let mut connections = self.inner.connections.lock().await;
                    connections.insert(name.to_string(), service);
                }
                self.update_runtime(name, |entry| {
                    entry.state = ConnectionState::Connected;
                    entry.connected_at = Some(Utc::now());
                    entry.last_error = None;
                    entry.error_time = None;
                    entry.oauth_config_error = None;
                    if cfg.oauth.is_some() {
                        entry.oauth_status = Some(if had_token {
                            OAuthStatus::Authenticated
                        } else {
                            OAuthStatus::None
                        });
                    }
                })
                .await;
                tracing::info!(target = "supervisor", server = %name, "connected");
                self.inner
                    .store
                    .append_event(JournalEvent::new(events::EVENT_SERVER_CONNECTED).server(name));
                events::server_connected(self.inner.emitter.as_ref(), name);
                events::server_state_changed(self.inner.emitter.as_ref(), name, state_label(ConnectionState::Connected));
                self.trigger_discovery(name);
            }
            Err(e) => {
                let message = format!("{e:#}");
                tracing::warn!(target = "supervisor", server = %name, error = %message, "connect failed");
                let unauthorized = matches!(cfg.protocol, Protocol::Http | Protocol::Sse)
                    && client::probe_unauthorized(&cfg.url).await;
                // Classify well-known failure shapes so health can route
                // them to the right operator action.
                let secret = crate::secrets::detect_missing_secret(&message);
                let config_err = message.contains("requires '") && message.contains("' parameter");
                self.update_runtime(name, |entry| {
                    entry.state = ConnectionState::Error;
                    entry.last_error = Some(message.clone());
                    entry.error_time = Some(Utc::now());
                    if let Some(secret) = secret {
                        entry.missing_secret = Some(secret);
                    }
                    if config_err {
                        entry.oauth_config_error = Some(message.clone());
                    }
                    if unauthorized {
                        entry.auth_probe_required = true;
                        entry.oauth_status = Some(OAuthStatus::None);
                    }
                })
                .await;
                events::server_state_changed(self.inner.emitter.as_ref(), name, state_label(ConnectionState::Error));
            }
        }
    }

    pub async fn disconnect_server(&self, name: &str, reason: &str) {
        let service = {
            let mut connections = self.inner.connections.lock().await;
            connections.remove(name)
        };
        if let Some(service) = service {
            client::disconnect(&service);
            tracing::info!(target = "supervisor", server = %name, reason, "disconnected");
        }
        self.update_runtime(name, |entry| {
            entry.state = ConnectionState::Disconnected;
            entry.connected_at = None;
            entry.tools = 0;
        })
        .await;
        self.inner
            .store
            .append_event(JournalEvent::new(events::EVENT_SERVER_DISCONNECTED).server(name));
        events::server_disconnected(self.inner.emitter.as_ref(), name);
        events::server_state_changed(self.inner.emitter.as_ref(), name, state_label(ConnectionState::Disconnected));
    }

    // ---- tool discovery ----

    /// Single-flight tool (re)discovery; connect events and explicit
    /// tool-list-changed notifications coalesce into one pass.
    pub fn trigger_discovery(&self, name: &str) {
        if !self.inner.guard.begin(name) {
            return;
        }
        let supervisor = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            supervisor.run_discovery(&name).await;
            supervisor.inner.guard.end(&name);
        });
    }

    async fn run_discovery(&self, name: &str) {
        let service = {
            let connections = self.inner.connections.lock().await;
            connections.get(name).cloned()
        };
        let Some(service) = service else {
            return;
        };
        let quarantined = {
            let config = self.inner.config.read().await;
            config.server(name).is_none_or(|s| s.quarantined)
        };
        match client::list_tools(&service).await {
            Ok(tools) => {
                let count = tools.len();
                if quarantined {
                    // Connected for inspection only; nothing reaches the
                    // index.
                    tracing::info!(target = "supervisor", server = %name, count, "quarantined, tools withheld from index");
                } else {
                    let mut names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
                    names.sort_unstable();
                    let digest = Sha256::digest(names.join("\n").as_bytes());
                    let hash: String = digest.iter().map(|b| format!("{b:02x}")).collect();
                    let _ = self
                        .inner
                        .store
                        .kv_put(BUCKET_TOOL_HASHES, name, &hash)
                        .await;
                    self.inner.index.batch_index(name, tools);
                }
                self.update_runtime(name, |entry| {
                    entry.tools = count;
                })
                .await;
                tracing::debug!(target = "supervisor", server = %name, count, "tools discovered");
            }
            Err(e) => {
                tracing::warn!(target = "supervisor", server = %name, error = %e, "tool discovery failed");
            }
        }
    }

    // ---- admin operations ----

    pub async fn enable_server(&self, name: &str, enabled: bool) -> Result<()> {
        let cfg = {
            let mut config = self.inner.config.write().await;
            config.ensure_writable()?;
            let server = config
                .server_mut(name)
                .ok_or_else(|| anyhow::anyhow!("unknown server {name}"))?;
            server.enabled = enabled;
            server.clone()
        };
        self.inner.store.kv_put(BUCKET_UPSTREAMS, name, &cfg).await?;
        if enabled {
            let supervisor = self.clone();
            let name = name.to_string();
            tokio::spawn(async move {
                supervisor.connect_server(&name).await;
            });
        } else {
            self.disconnect_server(name, "disabled").await;
        }
        events::servers_changed(
            self.inner.emitter.as_ref(),
            if enabled { "enable" } else { "disable" },
            Some(serde_json::json!({ "server_name": name })),
        );
        Ok(())
    }

    pub async fn quarantine_server(&self, name: &str, quarantined: bool) -> Result<()> {
        let cfg = {
            let mut config = self.inner.config.write().await;
            config.ensure_writable()?;
            let server = config
                .server_mut(name)
                .ok_or_else(|| anyhow::anyhow!("unknown server {name}"))?;
            server.quarantined = quarantined;
            server.clone()
        };
        self.inner.store.kv_put(BUCKET_UPSTREAMS, name, &cfg).await?;
        if quarantined {
            // Tool-poisoning containment: purge before anything else can
            // read the index again.
            self.inner.index.delete_server_tools(name);
            let _ = self.inner.store.kv_delete(BUCKET_TOOL_HASHES, name).await;
        } else {
            self.trigger_discovery(name);
        }
        events::servers_changed(
            self.inner.emitter.as_ref(),
            if quarantined { "quarantine" } else { "approve" },
            Some(serde_json::json!({ "server_name": name })),
        );
        Ok(())
    }

    /// Disconnect, drop the client, drain briefly, reconnect. Recreating
    /// rather than reusing forces fresh secret resolution from external
    /// backends.
    pub async fn restart_server(&self, name: &str) -> Result<()> {
        {
            let config = self.inner.config.read().await;
            config.ensure_writable()?;
            if config.server(name).is_none() {
                return Err(anyhow::anyhow!("unknown server {name}"));
            }
        }
        self.disconnect_server(name, "restart").await;
        tokio::time::sleep(RESTART_DRAIN).await;
        self.connect_server(name).await;
        events::servers_changed(
            self.inner.emitter.as_ref(),
            "restart",
            Some(serde_json::json!({ "server_name": name })),
        );
        Ok(())
    }

    /// Tear down and re-initiate every enabled upstream. Returns
    /// `(succeeded, failed)` tallies.
    pub async fn force_reconnect(&self, reason: &str) -> (usize, usize) {
        let names: Vec<String> = {
            let config = self.inner.config.read().await;
            config
                .servers
                .iter()
                .filter(|s| s.enabled)
                .map(|s| s.name.clone())
                .collect()
        };
        tracing::info!(target = "supervisor", reason, count = names.len(), "force reconnect");
        let tasks = names.into_iter().map(|name| {
            let supervisor = self.clone();
            async move {
                supervisor.disconnect_server(&name, "force_reconnect").await;
                supervisor.connect_server(&name).await;
                supervisor
                    .state_view_entry(&name)
                    .await
                    .is_some_and(|e| e.state == ConnectionState::Connected)
            }
        });
        let results = join_all(tasks).await;
        let ok = results.iter().filter(|r| **r).count();
        (ok, results.len() - ok)
    }

    async fn state_view_entry(&self, name: &str) -> Option<RuntimeEntry> {
        let runtime = self.inner.runtime.lock().await;
        runtime.get(name).cloned()
    }

    /// Clear stored credentials for an upstream and mark it logged out.
    pub async fn logout(&self, name: &str) -> Result<()> {
        let cfg = {
            let config = self.inner.config.read().await;
            config.ensure_writable()?;
            config
                .server(name)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown server {name}"))?
        };
        let _ = self.inner.tokens.clear_completion(&cfg.name, &cfg.url).await;
        let _ = self.inner.tokens.clear_token(&cfg.name, &cfg.url).await;
        self.update_runtime(name, |entry| {
            entry.user_logged_out = true;
            entry.oauth_status = Some(OAuthStatus::None);
        })
        .await;
        events::servers_changed(
            self.inner.emitter.as_ref(),
            "logout",
            Some(serde_json::json!({ "server_name": name })),
        );
        Ok(())
    }

    // ---- background retry loop ----

    pub fn spawn_retry_loop(&self) -> tokio::task::JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = supervisor.inner.cancel.cancelled() => break,
                    _ = tokio::time::sleep(RETRY_INTERVAL) => {}
                }
                supervisor.retry_failed().await;
            }
        })
    }

    async fn retry_failed(&self) {
        let candidates: Vec<String> = {
            let config = self.inner.config.read().await;
            let runtime = self.inner.runtime.lock().await;
            config
                .servers
                .iter()
                .filter(|s| s.enabled)
                .filter(|s| {
                    runtime.get(&s.name).is_some_and(|e| {
                        matches!(
                            e.state,
                            ConnectionState::Error | ConnectionState::Disconnected
                        )
                    })
                })
                .map(|s| s.name.clone())
                .collect()
        };
        if candidates.is_empty() {
            return;
        }
        tracing::debug!(target = "supervisor", count = candidates.len(), "retrying failed upstreams");
        let tasks = candidates.into_iter().map(|name| {
            let supervisor = self.clone();
            async move {
                supervisor.connect_server(&name).await;
            }
        });
        join_all(tasks).await;
    }

    // ---- health input ----

    /// Assemble the typed per-upstream views the health calculator and
    /// the doctor consume.
    pub async fn upstream_views(&self, refresh: Option<&RefreshManager>) -> Vec<UpstreamView> {
        let servers: Vec<UpstreamConfig> = {
            let config = self.inner.config.read().await;
            config.servers.clone()
        };
        let mut views = Vec::with_capacity(servers.len());
        for server in servers {
            let entry = self.state_view_entry(&server.name).await.unwrap_or_default();
            let token = self
                .inner
                .tokens
                .get_token_raw(&server.name, &server.url)
                .await
                .ok()
                .flatten();
            let refresh_snapshot = match refresh {
                Some(manager) => manager.refresh_state(&server.name).await,
                None => None,
            };
            let mut oauth_status = entry.oauth_status;
            if refresh_snapshot
                .as_ref()
                .is_some_and(|s| s.state == RefreshState::Failed)
                && entry.state == ConnectionState::Connected
            {
                oauth_status = Some(OAuthStatus::Error);
            }
            views.push(UpstreamView {
                name: server.name.clone(),
                enabled: server.enabled,
                quarantined: server.quarantined,
                missing_secret: entry.missing_secret.clone(),
                oauth_config_error: entry.oauth_config_error.clone(),
                connection_state: entry.state,
                last_error: entry.last_error.clone(),
                error_time: entry.error_time,
                oauth_required: server.oauth_required() || entry.auth_probe_required,
                oauth_status,
                user_logged_out: entry.user_logged_out,
                token_expires_at: token.as_ref().and_then(|t| t.expires_at),
                has_refresh_token: token.as_ref().is_some_and(|t| t.has_refresh_token()),
                tool_count: entry.tools,
                warning_window: default_warning_window(),
            });
        }
        views
    }

    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let names: Vec<String> = {
            let connections = self.inner.connections.lock().await;
            connections.keys().cloned().collect()
        };
        for name in names {
            self.disconnect_server(&name, "shutdown").await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BufferingEventEmitter;
    use crate::secrets::MemorySecretStore;
    use crate::tokens::TokenStore;
    use crate::tools::MemoryToolIndex;

    async fn build() -> (Supervisor, StateView, Arc<BufferingEventEmitter>, Arc<MemoryToolIndex>) {
        let stamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "mcp-warden-supervisor-{}-{stamp}",
            std::process::id()
        ));
        let store = Arc::new(SqliteStore::open(dir.join("warden.sqlite")).await.unwrap());
        let tokens = Arc::new(TokenStore::new(store.clone()));
        let emitter = Arc::new(BufferingEventEmitter::default());
        let index = Arc::new(MemoryToolIndex::new());
        let secrets = Arc::new(SecretResolver::new(Box::new(MemorySecretStore::new())));
        let (supervisor, view) = Supervisor::new(
            emitter.clone(),
            store,
            tokens,
            index.clone(),
            secrets,
            CancellationToken::new(),
        );
        (supervisor, view, emitter, index)
    }

    fn upstream(name: &str, enabled: bool) -> UpstreamConfig {
        UpstreamConfig {
            name: name.into(),
            url: String::new(),
            protocol: Protocol::Stdio,
            // Spawn fails fast; connect attempts resolve to Error without
            // touching the network.
            command: "mcp-warden-test-no-such-binary".into(),
            args: vec![],
            env: HashMap::new(),
            headers: HashMap::new(),
            oauth: None,
            enabled,
            quarantined: false,
        }
    }

    fn config(servers: Vec<UpstreamConfig>) -> Config {
        Config {
            servers,
            ..crate::config::default_config()
        }
    }

    #[tokio::test]
    async fn reconcile_publishes_declared_fleet() {
        let (supervisor, view, emitter, _) = build().await;
        supervisor
            .reconcile(config(vec![upstream("a", false), upstream("b", false)]))
            .await
            .unwrap();
        let snapshot = view.all();
        assert_eq!(snapshot.len(), 2);
        assert!(!snapshot["a"].enabled);
        assert_eq!(snapshot["a"].connection_state, ConnectionState::Idle);
        assert!(emitter.names().contains(&events::EVENT_SERVERS_CHANGED.to_string()));
    }

    #[tokio::test]
    async fn reconcile_removes_undeclared_servers() {
        let (supervisor, view, _, index) = build().await;
        index.batch_index("a", vec![]);
        supervisor
            .reconcile(config(vec![upstream("a", false)]))
            .await
            .unwrap();
        supervisor.reconcile(config(vec![])).await.unwrap();
        assert!(view.all().is_empty());
    }

    #[tokio::test]
    async fn enabled_server_with_broken_command_lands_in_error() {
        let (supervisor, view, _, _) = build().await;
        supervisor
            .reconcile(config(vec![upstream("a", true)]))
            .await
            .unwrap();
        let entry = view.get("a").unwrap();
        assert_eq!(entry.connection_state, ConnectionState::Error);
        assert!(entry.last_error.is_some());
        assert!(entry.error_time.is_some());
    }

    #[tokio::test]
    async fn missing_secret_is_surfaced() {
        let (supervisor, view, _, _) = build().await;
        let mut srv = upstream("a", true);
        srv.env.insert(
            "TOKEN".into(),
            "${env:MCP_WARDEN_SUPERVISOR_ABSENT}".into(),
        );
        supervisor.reconcile(config(vec![srv])).await.unwrap();
        let entry = view.get("a").unwrap();
        assert_eq!(entry.connection_state, ConnectionState::Error);
        assert_eq!(
            entry.missing_secret.as_deref(),
            Some("MCP_WARDEN_SUPERVISOR_ABSENT")
        );
    }

    #[tokio::test]
    async fn gates_block_admin_operations() {
        let (supervisor, _, _, _) = build().await;
        let mut cfg = config(vec![upstream("a", false)]);
        cfg.read_only_mode = true;
        supervisor.reconcile(cfg).await.unwrap();
        let err = supervisor.enable_server("a", true).await.unwrap_err();
        assert!(err.to_string().contains("read-only"));
        let err = supervisor.quarantine_server("a", true).await.unwrap_err();
        assert!(err.to_string().contains("read-only"));
        let err = supervisor.restart_server("a").await.unwrap_err();
        assert!(err.to_string().contains("read-only"));
    }

    #[tokio::test]
    async fn quarantine_purges_tools_immediately() {
        let (supervisor, view, emitter, index) = build().await;
        supervisor
            .reconcile(config(vec![upstream("a", false)]))
            .await
            .unwrap();
        index.batch_index(
            "a",
            vec![crate::tools::ToolInfo {
                name: "t".into(),
                description: None,
                input_schema: None,
            }],
        );
        supervisor.quarantine_server("a", true).await.unwrap();
        assert!(index.tools_by_server("a").is_empty());
        assert!(view.get("a").unwrap().quarantined);
        let reasons: Vec<String> = emitter
            .events()
            .into_iter()
            .filter(|(n, _)| n == events::EVENT_SERVERS_CHANGED)
            .map(|(_, p)| p["reason"].as_str().unwrap_or_default().to_string())
            .collect();
        assert!(reasons.contains(&"quarantine".to_string()));
    }

    #[tokio::test]
    async fn disable_disconnects_and_enables_reconnects() {
        let (supervisor, view, _, _) = build().await;
        supervisor
            .reconcile(config(vec![upstream("a", true)]))
            .await
            .unwrap();
        supervisor.enable_server("a", false).await.unwrap();
        let entry = view.get("a").unwrap();
        assert!(!entry.enabled);
        assert_eq!(entry.connection_state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn oauth_config_change_clears_cached_state() {
        let (supervisor, _, emitter, _) = build().await;
        let mut srv = upstream("a", false);
        srv.url = "https://a.example.com/mcp".into();
        srv.oauth = Some(crate::config::OAuthSettings {
            scopes: vec!["mcp".into()],
            ..Default::default()
        });
        supervisor.reconcile(config(vec![srv.clone()])).await.unwrap();
        srv.oauth.as_mut().unwrap().scopes.push("offline".into());
        supervisor.reconcile(config(vec![srv])).await.unwrap();
        let reasons: Vec<String> = emitter
            .events()
            .into_iter()
            .filter(|(n, _)| n == events::EVENT_SERVERS_CHANGED)
            .map(|(_, p)| p["reason"].as_str().unwrap_or_default().to_string())
            .collect();
        assert!(reasons.contains(&"oauth_config_changed".to_string()));
    }

    #[tokio::test]
    async fn upstream_views_feed_health() {
        let (supervisor, _, _, _) = build().await;
        supervisor
            .reconcile(config(vec![upstream("a", true), upstream("b", false)]))
            .await
            .unwrap();
        let views = supervisor.upstream_views(None).await;
        assert_eq!(views.len(), 2);
        let a = views.iter().find(|v| v.name == "a").unwrap();
        assert_eq!(a.connection_state, ConnectionState::Error);
        let health = crate::health::calculate_health(a, Utc::now());
        assert_eq!(health.level, crate::health::HealthLevel::Unhealthy);
        let b = views.iter().find(|v| v.name == "b").unwrap();
        let health = crate::health::calculate_health(b, Utc::now());
        assert_eq!(health.admin_state, crate::health::AdminState::Disabled);
    }

    #[tokio::test]
    async fn force_reconnect_tallies_failures() {
        let (supervisor, _, _, _) = build().await;
        supervisor
            .reconcile(config(vec![upstream("a", true), upstream("b", true)]))
            .await
            .unwrap();
        let (ok, failed) = supervisor.force_reconnect("test").await;
        assert_eq!(ok, 0);
        assert_eq!(failed, 2);
    }

    #[test]
    fn state_labels_match_serialized_forms() {
        for state in [
            ConnectionState::Idle,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Error,
            ConnectionState::Disconnected,
        ] {
            let serialized = serde_json::to_value(state).unwrap();
            assert_eq!(serialized, state_label(state));
        }
    }
}
