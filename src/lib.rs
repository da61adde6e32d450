//! bugtriage -- update service for a bug-triage dashboard.
//!
//! Runs saved tracker queries on a schedule or on demand, keeps every result
//! set as an immutable snapshot, and reconstructs per-field change history
//! from those snapshots.

pub mod api;
pub mod config;
pub mod diff;
pub mod health;
pub mod scheduler;
pub mod storage;
pub mod tracker;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::ServiceConfig;
use crate::health::HealthMonitor;
use crate::tracker::bugzilla::BugzillaTracker;

/// Start the update service: scheduling loop plus the HTTP API. Returns
/// when the server stops or on ctrl-c.
pub async fn serve(config: ServiceConfig) -> Result<()> {
    // 1. Initialize Storage
    tracing::info!(db = %config.database.path.display(), "Initializing database");
    let pool = storage::open_pool(&config.database.path)?;

    // 2. Initialize Scheduler
    let tracker = Arc::new(BugzillaTracker::new(&config.tracker)?);
    let health = Arc::new(HealthMonitor::new(config.health.window()));
    let scheduler = scheduler::Scheduler::new(pool.clone(), tracker, config.scheduler.clone(), health);

    // 3. Start Scheduler Engine (recovers interrupted executions first)
    let handle = scheduler.start().await.context("failed to start scheduler")?;

    // 4. Start API Server
    let addr: std::net::SocketAddr = config
        .api
        .bind
        .parse()
        .with_context(|| format!("invalid api.bind address '{}'", config.api.bind))?;
    let state = api::state::AppState {
        pool,
        scheduler,
        heartbeat_window: config.health.window(),
    };
    let app = api::router(state);

    tracing::info!(%addr, "bugtriage listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    handle.stop().await;
    Ok(())
}
