/// Health route for the keeper.
///
/// Liveness only: the handler does not touch the store or the chains, so a
/// slow RPC endpoint never makes the process look dead.
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// GET /health
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub fn health_routes() -> Router {
    Router::new().route("/health", get(health))
}
