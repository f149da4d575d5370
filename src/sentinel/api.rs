//! Minimal liveness endpoint for process supervisors.

use anyhow::Result;
use axum::{Json, Router, routing::get};
use serde_json::json;
use tracing::info;

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn serve(addr: String) -> Result<()> {
    let app = Router::new().route("/health", get(health));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "health endpoint up");
    axum::serve(listener, app).await?;
    Ok(())
}
