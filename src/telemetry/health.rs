//! Health check endpoints (/healthz, /readyz).

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Liveness fails when no reconcile has completed for this long.
const STALL_THRESHOLD_SECS: i64 = 15 * 60;

/// Shared readiness and liveness state.
#[derive(Clone)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
    /// Unix seconds of the last finished reconcile, or of readiness.
    last_progress: Arc<AtomicI64>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(false)),
            last_progress: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        if ready {
            self.mark_progress(Utc::now());
        }
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Record a finished reconcile.
    pub fn mark_progress(&self, now: DateTime<Utc>) {
        self.last_progress.store(now.timestamp(), Ordering::SeqCst);
    }

    /// Alive until readiness, then as long as reconciles keep completing.
    pub fn is_alive_at(&self, now: DateTime<Utc>) -> bool {
        if !self.is_ready() {
            return true;
        }
        let last = self.last_progress.load(Ordering::SeqCst);
        now.timestamp() - last < Duration::seconds(STALL_THRESHOLD_SECS).num_seconds()
    }
}

async fn healthz(state: axum::extract::State<HealthState>) -> StatusCode {
    if state.is_alive_at(Utc::now()) {
        StatusCode::OK
    } else {
        warn!("No reconcile completed within the liveness window");
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn readyz(state: axum::extract::State<HealthState>) -> StatusCode {
    if state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Start the health server on the given port.
pub async fn serve(port: u16, state: HealthState) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state);

    let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    info!("Health server listening on port {}", port);
    axum::serve(listener, app).await?;
    Ok(())
}
