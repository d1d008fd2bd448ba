//! agent-sandboxd - per-session container sandbox daemon.
//!
//! Serves the sandbox tool surface over HTTP. Each agent session gets an
//! ephemeral host workspace and a single long-running container that its
//! commands execute in.

use std::sync::Arc;

use agent_sandbox::{
    register_sandbox_tools, CommandExecutor, ContainerRegistry, ContainerRuntime,
    DefaultToolRegistry, DockerRuntime, IdleReaper,
};
use agent_sandbox_core::config::AppConfig;
use agent_sandbox_core::traits::EventEmitter;
use agent_sandbox_gateway::{AppState, GatewayConfig, GatewayServer};
use agent_sandbox_governance::{
    AuditLogEmitter, CompositeEventEmitter, TracingEventEmitter,
};
use agent_sandbox_workspace::WorkspaceManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    agent_sandbox_governance::configure_tracing(&config.telemetry)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting agent-sandboxd");

    // =========================================================================
    // Audit sinks
    // =========================================================================
    let mut emitters: Vec<Arc<dyn EventEmitter>> = vec![Arc::new(TracingEventEmitter)];
    if let Some(path) = &config.telemetry.audit_log {
        tracing::info!(path = %path.display(), "Audit log enabled");
        emitters.push(Arc::new(AuditLogEmitter::open(path)?));
    }
    let events: Arc<dyn EventEmitter> = Arc::new(CompositeEventEmitter::new(emitters));

    // =========================================================================
    // Container runtime and registry
    // =========================================================================
    let runtime = Arc::new(DockerRuntime::new()?);
    if !runtime.ping().await {
        tracing::warn!("Docker daemon not reachable; sessions will fail until it is");
    }

    let containers = Arc::new(
        ContainerRegistry::new(runtime, config.sandbox.clone()).with_event_emitter(events.clone()),
    );
    let executor = Arc::new(
        CommandExecutor::new(containers.clone()).with_event_emitter(events.clone()),
    );
    let workspaces = Arc::new(
        WorkspaceManager::from_settings(&config.workspace).with_event_emitter(events.clone()),
    );

    tracing::info!(
        image = %config.sandbox.image,
        network = %config.sandbox.network_mode,
        workspace_base = %workspaces.base_dir().display(),
        "Sandbox initialized"
    );

    let reaper = Arc::new(IdleReaper::from_registry(containers.clone()));
    let reaper_handle = reaper.clone().spawn(config.sandbox.reap_interval());

    // =========================================================================
    // Tools
    // =========================================================================
    let tools = Arc::new(DefaultToolRegistry::new());
    register_sandbox_tools(
        tools.as_ref(),
        executor.clone(),
        workspaces.clone(),
        Some(events.clone()),
    )
    .await?;
    tracing::info!(tools_count = tools.len(), "Tool registry initialized");

    // =========================================================================
    // Gateway
    // =========================================================================
    let state = AppState {
        tools,
        executor,
        containers: containers.clone(),
        workspaces: workspaces.clone(),
        reaper,
    };
    let mut server = GatewayServer::new(GatewayConfig::from(&config.server), state);
    if config.telemetry.metrics_enabled {
        server = server.with_metrics(agent_sandbox_governance::setup_metrics_recorder()?);
    }

    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
        })
        .await?;

    // =========================================================================
    // Teardown
    // =========================================================================
    reaper_handle.shutdown().await;
    let destroyed = containers.shutdown().await;
    let released = workspaces.release_all().await;
    tracing::info!(
        containers = destroyed,
        workspaces = released,
        "agent-sandboxd stopped"
    );

    Ok(())
}
