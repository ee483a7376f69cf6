mod chat;
mod detect;
mod health;
mod metrics;

use crate::server::SharedState;
use axum::{
    routing::{get, post},
    Router,
};

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/api/detect", post(detect::detect))
        .route("/api/agent-detect", post(detect::agent_detect))
        .route("/api/chat", post(chat::chat))
}
