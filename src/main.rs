use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use mcp_warden::callback::CallbackRegistry;
use mcp_warden::config::{ConfigProvider, OsConfigProvider, config_path, load_config_with};
use mcp_warden::events::{self, BroadcastBus};
use mcp_warden::flow::{FlowCoordinator, spawn_flow_reaper};
use mcp_warden::refresh::RefreshManager;
use mcp_warden::secrets::SecretResolver;
use mcp_warden::store::{SqliteStore, spawn_session_sweeper};
use mcp_warden::supervisor::Supervisor;
use mcp_warden::tokens::TokenStore;
use mcp_warden::tools::MemoryToolIndex;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mcp_warden::logging::init_tracing();

    let provider = OsConfigProvider;
    let config = load_config_with(&provider);
    let data_dir = config
        .data_dir
        .clone()
        .unwrap_or_else(|| provider.base_dir());
    let cancel = CancellationToken::new();

    let store = Arc::new(SqliteStore::open(data_dir.join("warden.sqlite")).await?);
    let bus = Arc::new(BroadcastBus::default());
    let tokens = Arc::new(TokenStore::new(store.clone()));
    let flows = Arc::new(FlowCoordinator::new());
    let callbacks = Arc::new(CallbackRegistry::new());
    let index = Arc::new(MemoryToolIndex::new());
    let secrets = Arc::new(SecretResolver::os_default());

    let (supervisor, _state_view) = Supervisor::new(
        bus.clone(),
        store.clone(),
        tokens.clone(),
        index,
        secrets,
        cancel.child_token(),
    );
    let refresh = RefreshManager::new(
        tokens.clone(),
        flows.clone(),
        store.clone(),
        bus.clone(),
        cancel.child_token(),
    );
    refresh.attach_token_hooks();

    let sweeper = spawn_session_sweeper(store.clone(), cancel.child_token());
    let reaper = spawn_flow_reaper(flows.clone(), cancel.child_token());
    let retry_loop = supervisor.spawn_retry_loop();

    events::config_reloaded(bus.as_ref(), &config_path(&provider).display().to_string());
    supervisor.reconcile(config).await?;
    refresh.startup().await?;
    tracing::info!(target = "supervisor", "mcp-warden running, ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!(target = "supervisor", "shutting down");

    cancel.cancel();
    supervisor.shutdown().await;
    refresh.shutdown().await;
    callbacks.shutdown().await;
    retry_loop.abort();
    sweeper.abort();
    reaper.abort();
    store.flush_journal().await;
    Ok(())
}
