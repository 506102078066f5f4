//! A small JSON HTTP admin surface (`Health`, `Restart`), bound to a
//! dedicated listener separate from the KV engine's own client/peer
//! listeners. Built on `axum` rather than introducing a separate gRPC
//! dependency just for two endpoints.

use crate::supervisor::Supervisor;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct RestartResponse {
    msg: &'static str,
}

async fn health(State(supervisor): State<Arc<Supervisor>>) -> impl IntoResponse {
    if supervisor.is_cluster_healthy().await {
        Json(HealthResponse { status: "It cool" })
    } else {
        Json(HealthResponse { status: "not great, bob" })
    }
}

async fn restart(State(supervisor): State<Arc<Supervisor>>) -> impl IntoResponse {
    let supervisor = supervisor.clone();
    tokio::spawn(async move {
        if let Err(e) = supervisor.restart().await {
            tracing::error!(error = %e, "admin: restart failed");
        }
    });
    (StatusCode::ACCEPTED, Json(RestartResponse { msg: "restart triggered" }))
}

pub fn router(supervisor: Arc<Supervisor>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/restart", post(restart))
        .with_state(supervisor)
}

pub async fn serve(addr: SocketAddr, supervisor: Arc<Supervisor>) -> std::io::Result<()> {
    let app = router(supervisor);
    info!(%addr, "admin: listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}
