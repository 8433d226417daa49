//! Bastion Server - HTTP reference binding
//!
//! Serves the decision and action APIs over in-memory stores seeded from a
//! fixtures file.

use std::net::SocketAddr;
use std::sync::Arc;

use bastion_core::{
    api::{self, AppState},
    config::Config,
    telemetry,
    tenancy::{
        EntityFixtures, InMemoryEntityStore, InMemoryMembershipStore, MembershipFixtures,
        PolicyMatrix, TracingAuditSink,
    },
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = match std::env::var("BASTION_CONFIG") {
        Ok(path) => Config::from_file(&path)?,
        Err(_) => Config::load().unwrap_or_else(|e| {
            eprintln!("Warning: Could not load config: {}. Using defaults.", e);
            Config::default()
        }),
    };

    telemetry::init_logging(&config.logging)?;
    telemetry::describe_metrics();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Bastion Server"
    );

    // Policy matrix
    let policy = match &config.policy.path {
        Some(path) => {
            let matrix = PolicyMatrix::from_file(path)?;
            tracing::info!(path = %path.display(), rules = matrix.rules().len(), "Loaded policy matrix");
            matrix
        }
        None => {
            tracing::info!("Using built-in policy matrix");
            PolicyMatrix::default_matrix()
        }
    };

    // Stores
    let (memberships, entities) = match &config.fixtures.path {
        Some(path) => {
            let memberships = MembershipFixtures::from_file(path)?;
            let entities = EntityFixtures::from_file(path)?;
            tracing::info!(
                path = %path.display(),
                workspaces = memberships.workspaces.len(),
                entities = entities.entities.len(),
                "Loaded fixtures"
            );
            (
                InMemoryMembershipStore::from_fixtures(memberships),
                InMemoryEntityStore::from_fixtures(entities),
            )
        }
        None => {
            tracing::warn!("No fixtures configured; every workspace lookup will miss");
            (InMemoryMembershipStore::new(), InMemoryEntityStore::new())
        }
    };

    let sink = Arc::new(TracingAuditSink::new(config.audit.channel_buffer_size));
    let app_state = AppState::assemble(
        Arc::new(memberships),
        Arc::new(entities),
        policy,
        config.membership.lookup_timeout,
        sink,
    );
    tracing::info!(actions = ?app_state.actions.action_names(), "Action handlers registered");

    // Build router
    let app = api::build_router(app_state);

    // Start server
    let addr: SocketAddr = config.server.bind_address().parse()?;
    tracing::info!(address = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
