use crate::{explanation::Intent, llm::ChatMessage, server::SharedState};
use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tracing::instrument;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub context: Vec<ChatMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,
}

#[instrument(skip_all)]
pub async fn chat(State(state): State<SharedState>, Json(request): Json<ChatRequest>) -> Json<ChatResponse> {
    state.metrics.record_request("/api/chat");

    let intent = request.intent.as_deref().map(Intent::from).unwrap_or_default();
    let response = state
        .explainer
        .respond(&request.message, intent, &request.context)
        .await;

    Json(ChatResponse { response })
}
