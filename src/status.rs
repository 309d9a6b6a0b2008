//! Read-only status surface
//!
//! A small HTTP server exposing what the loop has committed: `/healthz` for
//! liveness probes and `/deployments` listing the tracked deployments. It
//! reads the snapshot the loop publishes after each commit, so responses are
//! always a consistent view of one tick, never a half-updated one.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::reconcile::ReconciliationState;
use crate::registry::DesiredDeployment;
use crate::{Error, Result};

/// Receiver side of the committed-state channel
pub type StateReceiver = tokio::sync::watch::Receiver<Arc<ReconciliationState>>;

/// Serve the status surface until `cancel` fires
pub async fn serve(addr: SocketAddr, state: StateReceiver, cancel: CancellationToken) -> Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/deployments", get(deployments))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::status_server(format!("cannot bind {addr}: {e}")))?;

    info!(%addr, "status surface listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| Error::status_server(e.to_string()))
}

async fn healthz() -> &'static str {
    "ok"
}

async fn deployments(State(state): State<StateReceiver>) -> Json<Vec<DesiredDeployment>> {
    let snapshot = state.borrow().clone();
    Json(snapshot.values().cloned().collect())
}
