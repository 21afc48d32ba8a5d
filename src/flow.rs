//! Per-upstream OAuth flow coordination. Exactly one flow may be active
//! per server name; concurrent starts join the existing flow instead of
//! racing a second browser window.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::util::CorrelationId;

/// Flows older than this are considered abandoned and may be reaped.
pub const STALE_FLOW_AGE: Duration = Duration::from_secs(10 * 60);

pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    Initiated,
    Authenticating,
    TokenExchange,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct OAuthFlowContext {
    pub correlation_id: CorrelationId,
    pub server_name: String,
    pub start_time: DateTime<Utc>,
    pub state: FlowState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    Timeout,
    Canceled,
    Failed(String),
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowError::Timeout => write!(f, "oauth flow timed out"),
            FlowError::Canceled => write!(f, "oauth flow canceled"),
            FlowError::Failed(err) => write!(f, "oauth flow failed: {err}"),
        }
    }
}

impl std::error::Error for FlowError {}

struct ActiveFlow {
    ctx: OAuthFlowContext,
    started: Instant,
    waiters: Vec<oneshot::Sender<Result<(), FlowError>>>,
}

impl ActiveFlow {
    fn is_stale(&self) -> bool {
        self.started.elapsed() >= STALE_FLOW_AGE
    }
}

#[derive(Default)]
pub struct FlowCoordinator {
    flows: Mutex<HashMap<String, ActiveFlow>>,
}

impl FlowCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a flow for `server`, or join the one already running.
    /// Returns the flow context plus whether this call created it. Stale
    /// leftovers are reaped silently before starting fresh.
    pub async fn start_flow(&self, server: &str) -> (OAuthFlowContext, bool) {
        let mut flows = self.flows.lock().await;
        if let Some(active) = flows.get(server) {
            if !active.is_stale() {
                return (active.ctx.clone(), false);
            }
            let stale = flows.remove(server).expect("entry just observed");
            notify(stale.waiters, Err(FlowError::Timeout));
            tracing::warn!(
                target = "oauth",
                server,
                correlation = %stale.ctx.correlation_id,
                "reaped stale flow before starting a new one"
            );
        }
        let ctx = OAuthFlowContext {
            correlation_id: CorrelationId::new(),
            server_name: server.to_string(),
            start_time: Utc::now(),
            state: FlowState::Initiated,
        };
        flows.insert(
            server.to_string(),
            ActiveFlow {
                ctx: ctx.clone(),
                started: Instant::now(),
                waiters: Vec::new(),
            },
        );
        tracing::info!(target = "oauth", server, correlation = %ctx.correlation_id, "flow started");
        (ctx, true)
    }

    pub async fn update_state(&self, server: &str, state: FlowState) {
        let mut flows = self.flows.lock().await;
        if let Some(active) = flows.get_mut(server) {
            active.ctx.state = state;
        }
    }

    /// The non-stale active flow for `server`, if any.
    pub async fn active_flow(&self, server: &str) -> Option<OAuthFlowContext> {
        let flows = self.flows.lock().await;
        flows
            .get(server)
            .filter(|f| !f.is_stale())
            .map(|f| f.ctx.clone())
    }

    pub async fn has_active_flow(&self, server: &str) -> bool {
        self.active_flow(server).await.is_some()
    }

    /// Block until the active flow for `server` finishes. Returns `Ok(())`
    /// immediately when no flow is active, the flow's terminal error when
    /// it fails, `FlowError::Timeout` on expiry, and `FlowError::Canceled`
    /// when the ambient token fires.
    pub async fn wait_for_flow(
        &self,
        server: &str,
        wait_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), FlowError> {
        let rx = {
            let mut flows = self.flows.lock().await;
            match flows.get_mut(server) {
                None => return Ok(()),
                Some(active) => {
                    let (tx, rx) = oneshot::channel();
                    active.waiters.push(tx);
                    rx
                }
            }
        };
        tokio::select! {
            res = rx => res.unwrap_or(Ok(())),
            _ = tokio::time::sleep(wait_timeout) => Err(FlowError::Timeout),
            _ = cancel.cancelled() => Err(FlowError::Canceled),
        }
    }

    /// Terminate the flow, waking every waiter with the outcome.
    pub async fn end_flow(&self, server: &str, result: Result<(), String>) {
        let mut flows = self.flows.lock().await;
        let Some(mut active) = flows.remove(server) else {
            return;
        };
        active.ctx.state = match &result {
            Ok(()) => FlowState::Completed,
            Err(_) => FlowState::Failed,
        };
        tracing::info!(
            target = "oauth",
            server,
            correlation = %active.ctx.correlation_id,
            ok = result.is_ok(),
            "flow finished"
        );
        let outcome = result.map_err(FlowError::Failed);
        notify(active.waiters, outcome);
    }

    /// Reap flows older than [`STALE_FLOW_AGE`], notifying waiters with a
    /// timeout. Returns how many were removed.
    pub async fn cleanup_stale(&self) -> usize {
        let mut flows = self.flows.lock().await;
        let stale: Vec<String> = flows
            .iter()
            .filter(|(_, f)| f.is_stale())
            .map(|(name, _)| name.clone())
            .collect();
        for name in &stale {
            if let Some(flow) = flows.remove(name) {
                tracing::warn!(
                    target = "oauth",
                    server = %name,
                    correlation = %flow.ctx.correlation_id,
                    "reaping stale flow"
                );
                notify(flow.waiters, Err(FlowError::Timeout));
            }
        }
        stale.len()
    }
}

fn notify(waiters: Vec<oneshot::Sender<Result<(), FlowError>>>, outcome: Result<(), FlowError>) {
    for waiter in waiters {
        let _ = waiter.send(outcome.clone());
    }
}

/// Periodic stale-flow reaper until cancelled.
pub fn spawn_flow_reaper(
    flows: std::sync::Arc<FlowCoordinator>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(60)) => {}
            }
            let reaped = flows.cleanup_stale().await;
            if reaped > 0 {
                tracing::info!(target = "oauth", reaped, "stale flows cleaned up");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn second_start_joins_existing_flow() {
        let flows = FlowCoordinator::new();
        let (ctx1, started1) = flows.start_flow("srv").await;
        let (ctx2, started2) = flows.start_flow("srv").await;
        assert!(started1);
        assert!(!started2);
        assert_eq!(ctx1.correlation_id, ctx2.correlation_id);
    }

    #[tokio::test]
    async fn wait_without_active_flow_returns_immediately() {
        let flows = FlowCoordinator::new();
        let cancel = CancellationToken::new();
        let res = flows
            .wait_for_flow("srv", Duration::from_millis(50), &cancel)
            .await;
        assert_eq!(res, Ok(()));
    }

    #[tokio::test]
    async fn waiters_receive_terminal_error() {
        let flows = Arc::new(FlowCoordinator::new());
        let cancel = CancellationToken::new();
        let _ = flows.start_flow("srv").await;
        let waiter = {
            let flows = flows.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                flows
                    .wait_for_flow("srv", Duration::from_secs(5), &cancel)
                    .await
            })
        };
        tokio::task::yield_now().await;
        flows.end_flow("srv", Err("access_denied".into())).await;
        let res = waiter.await.unwrap();
        assert_eq!(res, Err(FlowError::Failed("access_denied".into())));
        assert!(!flows.has_active_flow("srv").await);
    }

    #[tokio::test]
    async fn waiters_receive_success() {
        let flows = Arc::new(FlowCoordinator::new());
        let cancel = CancellationToken::new();
        let _ = flows.start_flow("srv").await;
        let waiter = {
            let flows = flows.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                flows
                    .wait_for_flow("srv", Duration::from_secs(5), &cancel)
                    .await
            })
        };
        tokio::task::yield_now().await;
        flows.end_flow("srv", Ok(())).await;
        assert_eq!(waiter.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn cancellation_interrupts_wait() {
        let flows = Arc::new(FlowCoordinator::new());
        let cancel = CancellationToken::new();
        let _ = flows.start_flow("srv").await;
        let waiter = {
            let flows = flows.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                flows
                    .wait_for_flow("srv", Duration::from_secs(5), &cancel)
                    .await
            })
        };
        tokio::task::yield_now().await;
        cancel.cancel();
        assert_eq!(waiter.await.unwrap(), Err(FlowError::Canceled));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_flows_are_reaped_with_timeout() {
        let flows = Arc::new(FlowCoordinator::new());
        let cancel = CancellationToken::new();
        let _ = flows.start_flow("srv").await;
        let waiter = {
            let flows = flows.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                flows
                    .wait_for_flow("srv", Duration::from_secs(30 * 60), &cancel)
                    .await
            })
        };
        tokio::task::yield_now().await;
        tokio::time::advance(STALE_FLOW_AGE + Duration::from_secs(1)).await;
        assert_eq!(flows.cleanup_stale().await, 1);
        assert_eq!(waiter.await.unwrap(), Err(FlowError::Timeout));
        // A fresh start is now possible.
        let (_, started) = flows.start_flow("srv").await;
        assert!(started);
    }

    #[tokio::test]
    async fn flow_state_transitions_are_visible() {
        let flows = FlowCoordinator::new();
        let _ = flows.start_flow("srv").await;
        flows.update_state("srv", FlowState::Authenticating).await;
        assert_eq!(
            flows.active_flow("srv").await.unwrap().state,
            FlowState::Authenticating
        );
    }
}
