//! Proactive token refresh. One timer per upstream fires at 80% of the
//! token's remaining lifetime; transient failures retry forever on an
//! exponential backoff until the token has been dead for a day, permanent
//! protocol errors give up immediately and surface a re-login action.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::events::{self, EventEmitter};
use crate::flow::FlowCoordinator;
use crate::oauth::{refresh_grant, token_record_from_response};
use crate::store::{JournalEvent, SqliteStore};
use crate::tokens::{TokenEvent, TokenRecord, TokenStore};
use crate::util::contains_ci;

pub const BACKOFF_BASE: Duration = Duration::from_secs(10);
pub const BACKOFF_CAP: Duration = Duration::from_secs(300);
/// Minimum interval between refresh attempts for one server.
pub const MIN_ATTEMPT_INTERVAL: Duration = Duration::from_secs(10);
/// Fraction of the remaining lifetime after which refresh fires.
pub const REFRESH_THRESHOLD: f64 = 0.8;
const MIN_LEAD: i64 = 5_000;

/// Stop retrying once the token has been expired this long.
pub fn give_up_horizon() -> ChronoDuration {
    ChronoDuration::hours(24)
}

/// `min(base · 2ⁿ, cap)` with base 10 s and cap 5 min.
pub fn calculate_backoff(retry: u32) -> Duration {
    let factor = 2u64.saturating_pow(retry);
    let secs = BACKOFF_BASE.as_secs().saturating_mul(factor);
    Duration::from_secs(secs.min(BACKOFF_CAP.as_secs()))
}

const PERMANENT_MARKERS: &[&str] = &[
    "invalid_grant",
    "refresh token expired",
    "refresh token revoked",
    "refresh token invalid",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshErrorClass {
    Permanent,
    Transient,
}

/// `invalid_grant`-class failures are unrecoverable without a new login;
/// everything else (network, 5xx, rate limits) is worth another try.
pub fn classify_refresh_error(message: &str) -> RefreshErrorClass {
    if PERMANENT_MARKERS.iter().any(|m| contains_ci(message, m)) {
        RefreshErrorClass::Permanent
    } else {
        RefreshErrorClass::Transient
    }
}

/// Delay until the proactive refresh for a token with `remaining`
/// lifetime: 80% of the way there, at least 5 s out, and at least 5 s
/// before the expiry itself.
pub fn compute_delay(remaining: ChronoDuration) -> Duration {
    let remaining_ms = remaining.num_milliseconds();
    if remaining_ms <= 0 {
        return Duration::ZERO;
    }
    let lead = (remaining_ms as f64 * REFRESH_THRESHOLD) as i64;
    let upper = (remaining_ms - MIN_LEAD).max(0);
    let delay_ms = lead.max(MIN_LEAD).min(upper);
    Duration::from_millis(delay_ms.max(0) as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshState {
    Idle,
    Scheduled,
    Retrying,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshSnapshot {
    pub state: RefreshState,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub next_attempt: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

struct Schedule {
    server_url: String,
    expires_at: Option<DateTime<Utc>>,
    next_attempt: Option<DateTime<Utc>>,
    retry_count: u32,
    last_attempt: Option<DateTime<Utc>>,
    last_error: Option<String>,
    state: RefreshState,
    timer: Option<tokio::task::JoinHandle<()>>,
}

impl Schedule {
    fn new(server_url: String) -> Self {
        Self {
            server_url,
            expires_at: None,
            next_attempt: None,
            retry_count: 0,
            last_attempt: None,
            last_error: None,
            state: RefreshState::Idle,
            timer: None,
        }
    }

    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.next_attempt = None;
    }
}

pub struct RefreshManager {
    inner: Mutex<HashMap<String, Schedule>>,
    tokens: Arc<TokenStore>,
    flows: Arc<FlowCoordinator>,
    store: Arc<SqliteStore>,
    emitter: Arc<dyn EventEmitter>,
    http: reqwest::Client,
    cancel: CancellationToken,
}

impl RefreshManager {
    pub fn new(
        tokens: Arc<TokenStore>,
        flows: Arc<FlowCoordinator>,
        store: Arc<SqliteStore>,
        emitter: Arc<dyn EventEmitter>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HashMap::new()),
            tokens,
            flows,
            store,
            emitter,
            http: reqwest::Client::new(),
            cancel,
        })
    }

    /// Subscribe to token store events: every save reschedules, every
    /// clear stops the timer.
    pub fn attach_token_hooks(self: &Arc<Self>) {
        let manager = Arc::downgrade(self);
        self.tokens.on_event(Arc::new(move |event| {
            let Some(manager) = manager.upgrade() else {
                return;
            };
            match event {
                TokenEvent::Saved {
                    server_name,
                    server_url,
                    ..
                } => {
                    let (name, url) = (server_name.clone(), server_url.clone());
                    tokio::spawn(async move {
                        if let Err(e) = manager.schedule_from_store(&name, &url).await {
                            tracing::warn!(target = "refresh", server = %name, error = %e, "reschedule failed");
                        }
                    });
                }
                TokenEvent::Cleared { server_name, .. } => {
                    let name = server_name.clone();
                    tokio::spawn(async move {
                        manager.stop(&name).await;
                    });
                }
            }
        }));
    }

    async fn schedule_from_store(self: &Arc<Self>, name: &str, url: &str) -> anyhow::Result<()> {
        if let Some(record) = self.tokens.get_token_raw(name, url).await? {
            self.schedule_token(&record).await;
        }
        Ok(())
    }

    /// Load every persisted token and bring its schedule up: live tokens
    /// get a proactive timer, dead ones with a refresh token are renewed
    /// immediately (sequentially, to avoid a thundering herd), dead ones
    /// without are marked failed.
    pub async fn startup(self: &Arc<Self>) -> anyhow::Result<()> {
        let records = self.tokens.list_tokens().await?;
        let now = Utc::now();
        let mut expired: Vec<TokenRecord> = Vec::new();
        for record in records {
            if record.is_expired(now) {
                expired.push(record);
            } else {
                self.schedule_token(&record).await;
            }
        }
        if expired.is_empty() {
            return Ok(());
        }
        let manager = self.clone();
        tokio::spawn(async move {
            for record in expired {
                if manager.cancel.is_cancelled() {
                    break;
                }
                if record.has_refresh_token() {
                    manager
                        .ensure_entry(&record.server_name, &record.server_url)
                        .await;
                    manager.execute_refresh(record.server_name.clone()).await;
                } else {
                    manager
                        .mark_failed(
                            &record.server_name,
                            &record.server_url,
                            "token expired and no refresh token is available",
                        )
                        .await;
                }
            }
        });
        Ok(())
    }

    /// (Re)arm the proactive timer for a freshly saved token.
    pub async fn schedule_token(self: &Arc<Self>, record: &TokenRecord) {
        let Some(expires_at) = record.expires_at else {
            // Tokens without expiry never need proactive refresh.
            self.stop(&record.server_name).await;
            return;
        };
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let entry = inner
            .entry(record.server_name.clone())
            .or_insert_with(|| Schedule::new(record.server_url.clone()));
        entry.server_url = record.server_url.clone();
        entry.expires_at = Some(expires_at);
        entry.retry_count = 0;
        entry.last_error = None;
        entry.disarm();

        if now >= expires_at {
            if record.has_refresh_token() {
                entry.state = RefreshState::Scheduled;
                entry.next_attempt = Some(now);
                self.arm(entry, &record.server_name, Duration::ZERO);
            } else {
                entry.state = RefreshState::Failed;
                entry.last_error =
                    Some("token expired and no refresh token is available".into());
            }
            return;
        }

        let delay = compute_delay(expires_at - now);
        entry.state = RefreshState::Scheduled;
        entry.next_attempt = Some(now + ChronoDuration::milliseconds(delay.as_millis() as i64));
        self.arm(entry, &record.server_name, delay);
        tracing::debug!(
            target = "refresh",
            server = %record.server_name,
            delay_secs = delay.as_secs(),
            expires_at = %expires_at.to_rfc3339(),
            "refresh scheduled"
        );
    }

    /// Stop and forget the schedule for `server`. Idempotent.
    pub async fn stop(&self, server: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(mut entry) = inner.remove(server) {
            entry.disarm();
        }
    }

    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        for (_, entry) in inner.iter_mut() {
            entry.disarm();
        }
        inner.clear();
    }

    pub async fn refresh_state(&self, server: &str) -> Option<RefreshSnapshot> {
        let inner = self.inner.lock().await;
        inner.get(server).map(|entry| RefreshSnapshot {
            state: entry.state,
            retry_count: entry.retry_count,
            last_error: entry.last_error.clone(),
            next_attempt: entry.next_attempt,
            expires_at: entry.expires_at,
        })
    }

    async fn ensure_entry(&self, server: &str, url: &str) {
        let mut inner = self.inner.lock().await;
        inner
            .entry(server.to_string())
            .or_insert_with(|| Schedule::new(url.to_string()));
    }

    async fn mark_failed(&self, server: &str, url: &str, error: &str) {
        {
            let mut inner = self.inner.lock().await;
            let entry = inner
                .entry(server.to_string())
                .or_insert_with(|| Schedule::new(url.to_string()));
            entry.disarm();
            entry.state = RefreshState::Failed;
            entry.last_error = Some(error.to_string());
        }
        events::refresh_failed(self.emitter.as_ref(), server, error);
        self.store.append_event(
            JournalEvent::new(events::EVENT_REFRESH_FAILED)
                .server(server)
                .payload(serde_json::json!({ "error": error })),
        );
    }

    fn arm(self: &Arc<Self>, entry: &mut Schedule, server: &str, delay: Duration) {
        let manager = self.clone();
        let server = server.to_string();
        let cancel = self.cancel.clone();
        entry.timer = Some(tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    manager.execute_refresh(server).await;
                }
            }
        }));
    }

    /// One refresh attempt for `server`, with the coordination rules:
    /// yield to an active manual flow, honor the per-server attempt rate
    /// limit, classify failures, and give up a day past expiry.
    fn execute_refresh(
        self: &Arc<Self>,
        server: String,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(self.execute_refresh_inner(server))
    }

    async fn execute_refresh_inner(self: &Arc<Self>, server: String) {
        if self.cancel.is_cancelled() {
            return;
        }
        // A manual flow owns the token right now; come back shortly.
        if self.flows.has_active_flow(&server).await {
            tracing::debug!(target = "refresh", server = %server, "manual flow active, deferring");
            self.rearm_after(&server, BACKOFF_BASE).await;
            return;
        }

        let now = Utc::now();
        let server_url = {
            let mut inner = self.inner.lock().await;
            let Some(entry) = inner.get_mut(&server) else {
                return;
            };
            if let Some(last) = entry.last_attempt
                && now - last < ChronoDuration::from_std(MIN_ATTEMPT_INTERVAL).unwrap_or_default()
            {
                drop(inner);
                self.rearm_after(&server, MIN_ATTEMPT_INTERVAL).await;
                return;
            }
            entry.last_attempt = Some(now);
            entry.server_url.clone()
        };

        let token = match self.tokens.get_token_raw(&server, &server_url).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                self.stop(&server).await;
                return;
            }
            Err(e) => {
                tracing::warn!(target = "refresh", server = %server, error = %e, "token load failed");
                self.rearm_after(&server, BACKOFF_BASE).await;
                return;
            }
        };

        let Some(refresh_token) = token.refresh_token.clone().filter(|t| !t.is_empty()) else {
            self.mark_failed(
                &server,
                &server_url,
                "token expired and no refresh token is available",
            )
            .await;
            return;
        };

        if let Some(expires_at) = token.expires_at
            && now - expires_at > give_up_horizon()
        {
            self.mark_failed(
                &server,
                &server_url,
                "refresh token expired: access token has been dead for more than 24 hours",
            )
            .await;
            return;
        }

        let completion = match self.tokens.get_completion(&server, &server_url).await {
            Ok(Some(c)) => c,
            Ok(None) => {
                self.mark_failed(&server, &server_url, "no oauth client registration on file")
                    .await;
                return;
            }
            Err(e) => {
                tracing::warn!(target = "refresh", server = %server, error = %e, "completion load failed");
                self.rearm_after(&server, BACKOFF_BASE).await;
                return;
            }
        };

        tracing::info!(target = "refresh", server = %server, "refreshing access token");
        match refresh_grant(&self.http, &completion, &refresh_token, &completion.extra_params)
            .await
        {
            Ok(resp) => {
                let record = token_record_from_response(
                    &server,
                    &server_url,
                    &resp,
                    Some(refresh_token),
                );
                let expires_at = record.expires_at;
                match self.tokens.save_token(record).await {
                    Ok(_) => {
                        // The save hook re-arms the schedule for the new expiry.
                        let mut inner = self.inner.lock().await;
                        if let Some(entry) = inner.get_mut(&server) {
                            entry.retry_count = 0;
                            entry.last_error = None;
                            entry.state = RefreshState::Scheduled;
                        }
                        drop(inner);
                        events::token_refreshed(self.emitter.as_ref(), &server, expires_at);
                        self.store.append_event(
                            JournalEvent::new(events::EVENT_TOKEN_REFRESHED)
                                .server(&server)
                                .payload(serde_json::json!({
                                    "expires_at": expires_at.map(|t| t.to_rfc3339()),
                                })),
                        );
                    }
                    Err(e) => {
                        tracing::warn!(target = "refresh", server = %server, error = %e, "token persist failed");
                        self.note_transient_failure(&server, &format!("persist refreshed token: {e}"))
                            .await;
                    }
                }
            }
            Err(e) => {
                // Keep the whole chain: network causes sit below the context.
                let message = format!("{e:#}");
                match classify_refresh_error(&message) {
                    RefreshErrorClass::Permanent => {
                        tracing::warn!(target = "refresh", server = %server, error = %message, "permanent refresh failure");
                        self.mark_failed(&server, &server_url, &message).await;
                    }
                    RefreshErrorClass::Transient => {
                        tracing::debug!(target = "refresh", server = %server, error = %message, "transient refresh failure");
                        self.note_transient_failure(&server, &message).await;
                    }
                }
            }
        }
    }

    async fn note_transient_failure(self: &Arc<Self>, server: &str, message: &str) {
        let backoff = {
            let mut inner = self.inner.lock().await;
            let Some(entry) = inner.get_mut(server) else {
                return;
            };
            let backoff = calculate_backoff(entry.retry_count);
            entry.retry_count += 1;
            entry.last_error = Some(message.to_string());
            entry.state = RefreshState::Retrying;
            entry.next_attempt =
                Some(Utc::now() + ChronoDuration::milliseconds(backoff.as_millis() as i64));
            backoff
        };
        self.rearm_timer_only(server, backoff).await;
    }

    async fn rearm_after(self: &Arc<Self>, server: &str, delay: Duration) {
        {
            let mut inner = self.inner.lock().await;
            if let Some(entry) = inner.get_mut(server) {
                entry.next_attempt =
                    Some(Utc::now() + ChronoDuration::milliseconds(delay.as_millis() as i64));
            }
        }
        self.rearm_timer_only(server, delay).await;
    }

    async fn rearm_timer_only(self: &Arc<Self>, server: &str, delay: Duration) {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.get_mut(server) else {
            return;
        };
        entry.disarm();
        let server = server.to_string();
        let manager = self.clone();
        let cancel = self.cancel.clone();
        entry.timer = Some(tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    manager.execute_refresh(server).await;
                }
            }
        }));
        entry.next_attempt =
            Some(Utc::now() + ChronoDuration::milliseconds(delay.as_millis() as i64));
    }
}
