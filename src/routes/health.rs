use axum::{Json, extract::State};
use serde_json::{Value, json};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::sync::Notify;

use crate::state::AppState;

static START_TIME: OnceLock<Instant> = OnceLock::new();
static SHUTDOWN_NOTIFY: OnceLock<Arc<Notify>> = OnceLock::new();

/// Initialize the start time (call once at startup)
pub fn init_start_time() {
    START_TIME.get_or_init(Instant::now);
}

/// Initialize the shutdown notifier
pub fn init_shutdown_notify() -> Arc<Notify> {
    SHUTDOWN_NOTIFY.get_or_init(|| Arc::new(Notify::new())).clone()
}

/// Get a future that resolves when shutdown is requested
pub async fn wait_for_shutdown() {
    if let Some(notify) = SHUTDOWN_NOTIFY.get() {
        notify.notified().await;
    } else {
        std::future::pending::<()>().await;
    }
}

/// `GET /health` — liveness plus vector-DB reachability.
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let uptime = START_TIME.get().map(|s| s.elapsed().as_secs()).unwrap_or(0);
    let vector_db = if state.store.heartbeat().await {
        "connected"
    } else {
        "unreachable"
    };

    Json(json!({
        "status": "ok",
        "vector_db": vector_db,
        "enhanced_mode": state.config.enhanced_mode,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": uptime,
    }))
}

/// `GET /status` — queue statistics and recent job records.
pub async fn status(State(state): State<AppState>) -> Json<Value> {
    let stats = state.queue.stats();
    Json(json!({
        "queue": stats,
        "jobs": state.queue.recent_records(50),
    }))
}

/// Graceful shutdown endpoint for sidecar-managed deployments.
pub async fn shutdown_handler() -> Json<Value> {
    tracing::info!("Shutdown requested via HTTP endpoint");
    if let Some(notify) = SHUTDOWN_NOTIFY.get() {
        notify.notify_one();
    }
    Json(json!({
        "status": "shutting_down",
    }))
}
