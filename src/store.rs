//! Embedded persistent store: namespaced key→JSON buckets, client
//! sessions, and an append-only event journal with a batching background
//! writer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::logging::redact_json;

pub const BUCKET_OAUTH_TOKENS: &str = "oauth_tokens";
pub const BUCKET_OAUTH_COMPLETIONS: &str = "oauth_completions";
pub const BUCKET_UPSTREAMS: &str = "upstreams";
pub const BUCKET_TOOL_HASHES: &str = "tool_hashes";

const FLUSH_BATCH_SIZE: usize = 256;
const FLUSH_INTERVAL: Duration = Duration::from_millis(250);

pub const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const SESSION_IDLE_THRESHOLD: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct JournalEvent {
    pub id: Uuid,
    pub ts_ms: i64,
    pub kind: String,
    pub server_name: Option<String>,
    pub correlation: Option<String>,
    pub payload: Option<JsonValue>,
}

impl JournalEvent {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            ts_ms: now_millis(),
            kind: kind.into(),
            server_name: None,
            correlation: None,
            payload: None,
        }
    }

    pub fn server(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn correlation(mut self, id: impl ToString) -> Self {
        self.correlation = Some(id.to_string());
        self
    }

    pub fn payload(mut self, payload: JsonValue) -> Self {
        self.payload = Some(payload);
        self
    }
}

pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

enum Msg {
    Event(Box<JournalEvent>),
    Flush(oneshot::Sender<()>),
}

pub struct SqliteStore {
    pool: SqlitePool,
    journal_tx: mpsc::Sender<Msg>,
    pub db_path: PathBuf,
}

impl SqliteStore {
    pub async fn open(db_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(1));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        ensure_schema(&pool).await?;

        let (journal_tx, rx) = mpsc::channel::<Msg>(8_192);
        let writer_pool = pool.clone();
        tokio::spawn(async move {
            writer_task(writer_pool, rx).await;
        });

        Ok(Self {
            pool,
            journal_tx,
            db_path,
        })
    }

    // ---- kv buckets ----

    pub async fn kv_put<T: Serialize>(
        &self,
        namespace: &str,
        key: &str,
        value: &T,
    ) -> anyhow::Result<()> {
        let json = serde_json::to_string(value)?;
        sqlx::query(
            "INSERT INTO kv (namespace, key, value, updated_at_ms) VALUES (?, ?, ?, ?)
             ON CONFLICT(namespace, key) DO UPDATE SET
                 value = excluded.value,
                 updated_at_ms = excluded.updated_at_ms",
        )
        .bind(namespace)
        .bind(key)
        .bind(json)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn kv_get<T: DeserializeOwned>(
        &self,
        namespace: &str,
        key: &str,
    ) -> anyhow::Result<Option<T>> {
        let row = sqlx::query("SELECT value FROM kv WHERE namespace = ? AND key = ?")
            .bind(namespace)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let raw: String = row.get(0);
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    pub async fn kv_delete(&self, namespace: &str, key: &str) -> anyhow::Result<bool> {
        let res = sqlx::query("DELETE FROM kv WHERE namespace = ? AND key = ?")
            .bind(namespace)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn kv_list<T: DeserializeOwned>(
        &self,
        namespace: &str,
    ) -> anyhow::Result<Vec<(String, T)>> {
        let rows = sqlx::query("SELECT key, value FROM kv WHERE namespace = ? ORDER BY key")
            .bind(namespace)
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.get(0);
            let raw: String = row.get(1);
            match serde_json::from_str(&raw) {
                Ok(value) => out.push((key, value)),
                Err(e) => {
                    tracing::warn!(target = "store", namespace, key = %key, error = %e, "skipping undecodable record");
                }
            }
        }
        Ok(out)
    }

    // ---- sessions ----

    pub async fn touch_session(
        &self,
        session_id: &str,
        client_name: Option<&str>,
    ) -> anyhow::Result<()> {
        let now = now_millis();
        sqlx::query(
            "INSERT INTO sessions (session_id, client_name, created_at_ms, last_seen_at_ms)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(session_id) DO UPDATE SET
                 client_name = COALESCE(excluded.client_name, sessions.client_name),
                 last_seen_at_ms = excluded.last_seen_at_ms",
        )
        .bind(session_id)
        .bind(client_name)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Drop sessions idle for longer than `idle`. Returns the number removed.
    pub async fn close_inactive_sessions(&self, idle: Duration) -> anyhow::Result<u64> {
        let cutoff = now_millis() - idle.as_millis() as i64;
        let res = sqlx::query("DELETE FROM sessions WHERE last_seen_at_ms < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    pub async fn session_count(&self) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) FROM sessions")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get(0))
    }

    // ---- event journal ----

    /// Append an event to the journal. Payloads are redacted before they
    /// leave the caller's task; the write itself is batched in the
    /// background and never blocks.
    pub fn append_event(&self, mut event: JournalEvent) {
        event.payload = event.payload.map(redact_json);
        let _ = self.journal_tx.try_send(Msg::Event(Box::new(event)));
    }

    pub async fn flush_journal(&self) {
        let (tx_done, rx_done) = oneshot::channel();
        if self.journal_tx.send(Msg::Flush(tx_done)).await.is_ok() {
            let _ = timeout(Duration::from_secs(2), rx_done).await;
        }
    }

    pub async fn event_count(&self) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get(0))
    }
}

/// Periodic sweep of inactive sessions until cancelled.
pub fn spawn_session_sweeper(
    store: std::sync::Arc<SqliteStore>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(SESSION_SWEEP_INTERVAL) => {}
            }
            match store.close_inactive_sessions(SESSION_IDLE_THRESHOLD).await {
                Ok(0) => {}
                Ok(n) => {
                    tracing::debug!(target = "store", closed = n, "closed inactive sessions");
                }
                Err(e) => {
                    tracing::warn!(target = "store", error = %e, "session sweep failed");
                }
            }
        }
    })
}

async fn ensure_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for stmt in [
        "CREATE TABLE IF NOT EXISTS kv (
             namespace TEXT NOT NULL,
             key TEXT NOT NULL,
             value TEXT NOT NULL,
             updated_at_ms INTEGER NOT NULL,
             PRIMARY KEY (namespace, key)
         )",
        "CREATE TABLE IF NOT EXISTS sessions (
             session_id TEXT PRIMARY KEY,
             client_name TEXT,
             created_at_ms INTEGER NOT NULL,
             last_seen_at_ms INTEGER NOT NULL
         )",
        "CREATE TABLE IF NOT EXISTS events (
             id TEXT PRIMARY KEY,
             ts_ms INTEGER NOT NULL,
             kind TEXT NOT NULL,
             server_name TEXT,
             correlation TEXT,
             payload_json TEXT
         )",
        "CREATE INDEX IF NOT EXISTS idx_events_ts ON events(ts_ms)",
        "CREATE INDEX IF NOT EXISTS idx_sessions_seen ON sessions(last_seen_at_ms)",
    ] {
        sqlx::query(stmt).execute(pool).await?;
    }
    Ok(())
}

async fn writer_task(pool: SqlitePool, mut rx: mpsc::Receiver<Msg>) {
    let mut buf: Vec<JournalEvent> = Vec::with_capacity(FLUSH_BATCH_SIZE);
    let mut last_flush = Instant::now();

    loop {
        match timeout(FLUSH_INTERVAL, rx.recv()).await {
            Ok(Some(Msg::Event(evt))) => {
                buf.push(*evt);
                if buf.len() >= FLUSH_BATCH_SIZE || last_flush.elapsed() >= FLUSH_INTERVAL {
                    if let Err(e) = flush_events(&pool, &buf).await {
                        tracing::warn!(target = "store", count = buf.len(), error = %e, "journal flush failed");
                    }
                    buf.clear();
                    last_flush = Instant::now();
                }
            }
            Ok(Some(Msg::Flush(done))) => {
                if !buf.is_empty() {
                    if let Err(e) = flush_events(&pool, &buf).await {
                        tracing::warn!(target = "store", count = buf.len(), error = %e, "journal flush failed");
                    }
                    buf.clear();
                }
                let _ = done.send(());
                last_flush = Instant::now();
            }
            Ok(None) => {
                if !buf.is_empty() {
                    let _ = flush_events(&pool, &buf).await;
                }
                break;
            }
            Err(_) => {
                if !buf.is_empty() {
                    if let Err(e) = flush_events(&pool, &buf).await {
                        tracing::warn!(target = "store", count = buf.len(), error = %e, "journal flush failed");
                    }
                    buf.clear();
                }
                last_flush = Instant::now();
            }
        }
    }
}

async fn flush_events(pool: &SqlitePool, events: &[JournalEvent]) -> Result<(), sqlx::Error> {
    if events.is_empty() {
        return Ok(());
    }
    let mut tx = pool.begin().await?;
    for event in events {
        let payload = event
            .payload
            .as_ref()
            .map(|v| serde_json::to_string(v).unwrap_or_default());
        sqlx::query(
            "INSERT OR IGNORE INTO events (id, ts_ms, kind, server_name, correlation, payload_json)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(event.id.to_string())
        .bind(event.ts_ms)
        .bind(&event.kind)
        .bind(event.server_name.as_deref())
        .bind(event.correlation.as_deref())
        .bind(payload.as_deref())
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_store() -> SqliteStore {
        let stamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "mcp-warden-store-{}-{stamp}",
            std::process::id()
        ));
        SqliteStore::open(dir.join("warden.sqlite")).await.unwrap()
    }

    #[tokio::test]
    async fn kv_round_trip_and_delete() {
        let store = temp_store().await;
        store
            .kv_put(BUCKET_UPSTREAMS, "srv", &serde_json::json!({ "enabled": true }))
            .await
            .unwrap();
        let got: Option<serde_json::Value> =
            store.kv_get(BUCKET_UPSTREAMS, "srv").await.unwrap();
        assert_eq!(got.unwrap()["enabled"], true);
        assert!(store.kv_delete(BUCKET_UPSTREAMS, "srv").await.unwrap());
        let gone: Option<serde_json::Value> =
            store.kv_get(BUCKET_UPSTREAMS, "srv").await.unwrap();
        assert!(gone.is_none());
    }

    #[tokio::test]
    async fn kv_put_upserts() {
        let store = temp_store().await;
        store.kv_put("b", "k", &1i64).await.unwrap();
        store.kv_put("b", "k", &2i64).await.unwrap();
        let got: Option<i64> = store.kv_get("b", "k").await.unwrap();
        assert_eq!(got, Some(2));
        let all: Vec<(String, i64)> = store.kv_list("b").await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn sessions_sweep_removes_only_idle() {
        let store = temp_store().await;
        store.touch_session("old", Some("client-a")).await.unwrap();
        // Backdate the session well past the idle threshold.
        sqlx::query("UPDATE sessions SET last_seen_at_ms = ? WHERE session_id = 'old'")
            .bind(now_millis() - 10 * 60 * 1000)
            .execute(&store.pool)
            .await
            .unwrap();
        store.touch_session("fresh", None).await.unwrap();
        let removed = store
            .close_inactive_sessions(SESSION_IDLE_THRESHOLD)
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.session_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn journal_redacts_and_persists() {
        let store = temp_store().await;
        store.append_event(
            JournalEvent::new("oauth.token_refreshed")
                .server("srv")
                .payload(serde_json::json!({ "access_token": "s3cret", "ok": true })),
        );
        store.flush_journal().await;
        assert_eq!(store.event_count().await.unwrap(), 1);
        let row = sqlx::query("SELECT payload_json FROM events")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        let payload: String = row.get(0);
        assert!(!payload.contains("s3cret"));
        assert!(payload.contains(crate::logging::REDACTED));
    }
}
