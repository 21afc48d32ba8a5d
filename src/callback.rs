//! Loopback HTTP listeners that receive OAuth redirect callbacks. One
//! listener per upstream; parameters are handed to the waiting flow over
//! a 1-buffered channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{Router, extract::Query, http::StatusCode, response::Html, routing::get};
use serde::Deserialize;
use tokio::sync::{Mutex, mpsc};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

const SUCCESS_PAGE: &str = r#"<!doctype html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <title>Authorization Complete</title>
    <style>
      body { font-family: system-ui, -apple-system, Segoe UI, Roboto, Helvetica, Arial, sans-serif; line-height: 1.5; padding: 24px; }
    </style>
    <script>
      (function() {
        function tryClose() {
          try { window.open('', '_self'); } catch (e) {}
          try { window.close(); } catch (e) {}
        }
        tryClose();
        setTimeout(tryClose, 150);
      })();
    </script>
  </head>
  <body>
    <h1>Authorization Complete</h1>
    <p>You can close this window. It should close automatically.</p>
  </body>
</html>"#;

/// Handle to one upstream's callback listener.
#[derive(Clone)]
pub struct CallbackListener {
    pub port: u16,
    rx: Arc<Mutex<mpsc::Receiver<CallbackParams>>>,
}

impl CallbackListener {
    pub fn redirect_uri(&self) -> String {
        format!("http://127.0.0.1:{}/oauth/callback", self.port)
    }

    /// Wait for the browser redirect to land.
    pub async fn recv(&self, wait: Duration) -> Result<CallbackParams> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(wait, rx.recv())
            .await
            .context("timed out waiting for oauth callback")?
            .context("callback listener closed")
    }

    /// Throw away any buffered parameters left over from an earlier,
    /// abandoned attempt.
    pub async fn drain(&self) -> usize {
        let mut rx = self.rx.lock().await;
        let mut drained = 0;
        while rx.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }
}

struct Entry {
    listener: CallbackListener,
    task: tokio::task::JoinHandle<()>,
}

#[derive(Default)]
pub struct CallbackRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the listener for `server`. A preferred port is used
    /// when it binds (providers that pin redirect_uri need it); otherwise
    /// the OS assigns an ephemeral one. Reused listeners are drained of
    /// stale parameters before being returned.
    pub async fn acquire(
        &self,
        server: &str,
        preferred_port: Option<u16>,
    ) -> Result<CallbackListener> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get(server) {
            let listener = entry.listener.clone();
            let drained = listener.drain().await;
            if drained > 0 {
                tracing::debug!(target = "oauth", server, drained, "drained stale callback params");
            }
            return Ok(listener);
        }

        let tcp = bind_loopback(preferred_port).await?;
        let port = tcp.local_addr().context("callback addr")?.port();
        let (tx, rx) = mpsc::channel::<CallbackParams>(1);
        let app = Router::new().route(
            "/oauth/callback",
            get(move |Query(params): Query<CallbackParams>| {
                let tx = tx.clone();
                async move {
                    // 1-buffered: a second redirect for the same attempt
                    // has nothing new to say.
                    let _ = tx.try_send(params);
                    (StatusCode::OK, Html(SUCCESS_PAGE))
                }
            }),
        );
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(tcp, app).await {
                tracing::error!(target = "oauth", error = %e, "callback server error");
            }
        });
        tracing::info!(target = "oauth", server, port, "callback listener bound");
        let listener = CallbackListener {
            port,
            rx: Arc::new(Mutex::new(rx)),
        };
        entries.insert(
            server.to_string(),
            Entry {
                listener: listener.clone(),
                task,
            },
        );
        Ok(listener)
    }

    pub async fn release(&self, server: &str) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.remove(server) {
            entry.task.abort();
        }
    }

    pub async fn shutdown(&self) {
        let mut entries = self.entries.lock().await;
        for (_, entry) in entries.drain() {
            entry.task.abort();
        }
    }
}

async fn bind_loopback(preferred_port: Option<u16>) -> Result<tokio::net::TcpListener> {
    if let Some(port) = preferred_port {
        match tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
            Ok(l) => return Ok(l),
            Err(e) => {
                tracing::warn!(
                    target = "oauth",
                    port,
                    error = %e,
                    "preferred callback port unavailable, falling back to ephemeral"
                );
            }
        }
    }
    tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .context("bind oauth callback listener")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn callback_params_reach_the_waiter() {
        let registry = CallbackRegistry::new();
        let listener = registry.acquire("srv", None).await.unwrap();
        let uri = format!("{}?code=abc&state=xyz", listener.redirect_uri());
        let resp = reqwest::get(&uri).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let params = listener.recv(Duration::from_secs(2)).await.unwrap();
        assert_eq!(params.code.as_deref(), Some("abc"));
        assert_eq!(params.state.as_deref(), Some("xyz"));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn reuse_drains_stale_params() {
        let registry = CallbackRegistry::new();
        let listener = registry.acquire("srv", None).await.unwrap();
        // A stale redirect from a prior, failed attempt.
        let uri = format!("{}?error=access_denied", listener.redirect_uri());
        let _ = reqwest::get(&uri).await.unwrap();

        let reused = registry.acquire("srv", None).await.unwrap();
        assert_eq!(reused.port, listener.port);
        // The stale error must not be delivered to the new attempt.
        let fresh = format!("{}?code=fresh", reused.redirect_uri());
        let _ = reqwest::get(&fresh).await.unwrap();
        let params = reused.recv(Duration::from_secs(2)).await.unwrap();
        assert_eq!(params.code.as_deref(), Some("fresh"));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn error_params_are_parsed() {
        let registry = CallbackRegistry::new();
        let listener = registry.acquire("srv", None).await.unwrap();
        let uri = format!(
            "{}?error=access_denied&error_description=user%20said%20no",
            listener.redirect_uri()
        );
        let _ = reqwest::get(&uri).await.unwrap();
        let params = listener.recv(Duration::from_secs(2)).await.unwrap();
        assert_eq!(params.error.as_deref(), Some("access_denied"));
        assert_eq!(params.error_description.as_deref(), Some("user said no"));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn preferred_port_fallback_is_graceful() {
        let registry = CallbackRegistry::new();
        // Hold a socket so the preferred port is taken.
        let blocker = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let taken = blocker.local_addr().unwrap().port();
        let listener = registry.acquire("srv", Some(taken)).await.unwrap();
        assert_ne!(listener.port, taken);
        registry.shutdown().await;
    }
}
