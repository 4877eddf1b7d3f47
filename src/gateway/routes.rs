use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    Json,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::agent::orchestrator::{IncomingMessage, Orchestrator};
use crate::ai::error::LlmError;
use crate::error::OrchestratorError;

pub type GatewayState = Arc<Orchestrator>;

// ─── Health ───────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "concierge" }))
}

// ─── Chat ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatBody {
    pub tenant_id: String,
    pub message: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl ChatBody {
    fn into_message(self) -> IncomingMessage {
        let mut message = IncomingMessage::new(self.tenant_id, self.message);
        if let Some(metadata) = self.metadata {
            message = message.with_metadata(metadata);
        }
        message
    }
}

pub async fn chat(
    State(orchestrator): State<GatewayState>,
    Json(body): Json<ChatBody>,
) -> impl IntoResponse {
    match orchestrator.handle_message(body.into_message()).await {
        Ok(result) => (StatusCode::OK, Json(json!(result))),
        Err(err) => {
            let status = match &err {
                OrchestratorError::Llm(LlmError::Auth(_)) => StatusCode::UNAUTHORIZED,
                OrchestratorError::Cancelled => StatusCode::REQUEST_TIMEOUT,
                _ => StatusCode::BAD_GATEWAY,
            };
            tracing::error!(error = %err, "chat request failed");
            (status, Json(json!({ "error": err.to_string() })))
        }
    }
}

// ─── Stream ───────────────────────────────────────────────────────────────────

/// SSE variant: each event is framed as `data: <json>`, with a terminal
/// `data: [DONE]`.
pub async fn stream(
    State(orchestrator): State<GatewayState>,
    Json(body): Json<ChatBody>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = orchestrator.stream_message(body.into_message());

    let events = ReceiverStream::new(rx)
        .map(|event| {
            let payload =
                serde_json::to_string(&event).unwrap_or_else(|e| json!({"type": "ERROR", "message": e.to_string()}).to_string());
            Ok(Event::default().data(payload))
        })
        .chain(tokio_stream::once(Ok(Event::default().data("[DONE]"))));

    Sse::new(events).keep_alive(KeepAlive::default())
}
