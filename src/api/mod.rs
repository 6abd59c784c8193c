//! OpenAI-compatible HTTP surface.
//!
//! `POST /v1/chat/completions` drives one traversal per request. In
//! streaming mode the response is server-sent events: named
//! `event: status` progress frames keyed by the current stage, then the
//! content delta, then the terminal `data: [DONE]`. User identity
//! resolves from the request's `user` field, else a hash of the bearer
//! token, else `anonymous`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router as AxumRouter};
use chrono::Utc;
use futures_util::stream::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::Settings;
use crate::evidence::compact_hash;
use crate::events::StatusBus;
use crate::message::{Message, Role};
use crate::runner::Coordinator;
use crate::state::{RequestState, RetrievalParams};

/// Shared server state.
#[derive(Clone)]
pub struct ApiState {
    pub coordinator: Arc<Coordinator>,
    pub settings: Arc<Settings>,
}

/// Build the router with all public endpoints.
pub fn router(state: ApiState) -> AxumRouter {
    AxumRouter::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/health", get(health))
        .route("/health/readiness", get(readiness))
        .with_state(state)
}

// ── Wire types ─────────────────────────────────────────────────────────

/// Incoming message; content may be a string or an array of typed parts.
#[derive(Clone, Debug, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(default)]
    content: Value,
}

impl WireMessage {
    fn normalized(&self) -> Message {
        let content = match &self.content {
            Value::String(s) => s.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter_map(|p| {
                    (p["type"] == "text")
                        .then(|| p["text"].as_str().unwrap_or_default().to_string())
                })
                .collect::<Vec<_>>()
                .join(" ")
                .trim()
                .to_string(),
            _ => String::new(),
        };
        Message::from_wire(&self.role, content)
    }
}

/// Per-request retrieval overrides.
#[derive(Clone, Debug, Deserialize)]
struct RetrievalOptions {
    #[serde(default)]
    strategy: Option<String>,
    #[serde(default)]
    reranker: Option<String>,
    #[serde(default)]
    top_k: Option<usize>,
}

#[derive(Clone, Debug, Deserialize)]
struct ChatCompletionRequest {
    #[serde(default)]
    #[allow(dead_code)]
    model: Option<String>,
    messages: Vec<WireMessage>,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    retrieval: Option<RetrievalOptions>,
}

/// Outgoing message in the OpenAI wire shape; provenance stays internal.
#[derive(Serialize)]
struct WireReply {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ChatChoice {
    index: usize,
    message: WireReply,
    finish_reason: &'static str,
}

#[derive(Serialize)]
struct ChatCompletionResponse {
    id: String,
    object: &'static str,
    created: i64,
    model: String,
    choices: Vec<ChatChoice>,
    usage: Value,
}

fn resolve_user_id(user: Option<&str>, headers: &HeaderMap) -> String {
    if let Some(user) = user {
        let trimmed = user.trim();
        if !trimmed.is_empty() {
            return trimmed.chars().take(128).collect();
        }
    }
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            if !token.is_empty() {
                return compact_hash(token).chars().take(16).collect();
            }
        }
    }
    "anonymous".to_string()
}

fn build_state(
    request: &ChatCompletionRequest,
    user_id: String,
    settings: &Settings,
) -> RequestState {
    let run_id = Uuid::new_v4().to_string();
    let messages: Vec<Message> = request
        .messages
        .iter()
        .map(WireMessage::normalized)
        .filter(|m| !m.content.is_empty())
        .collect();
    let mut state = RequestState::new(run_id, user_id, messages);
    state.max_iterations = settings.max_iterations;
    state.budgets.token_budget_remaining = settings.token_budget;
    if let Some(retrieval) = &request.retrieval {
        let mut params = RetrievalParams::default();
        if let Some(strategy) = &retrieval.strategy {
            params.strategy = strategy.clone();
        }
        if let Some(reranker) = &retrieval.reranker {
            params.reranker = reranker.clone();
        }
        if let Some(top_k) = retrieval.top_k {
            params.top_k = top_k.clamp(1, 50);
        }
        state.retrieval_params = params;
    }
    state
}

// ── Handlers ───────────────────────────────────────────────────────────

async fn chat_completions(
    State(api): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<ChatCompletionRequest>,
) -> axum::response::Response {
    let user_id = resolve_user_id(request.user.as_deref(), &headers);
    if !request
        .messages
        .iter()
        .any(|m| m.role == "user" && !m.normalized().content.is_empty())
    {
        return (
            axum::http::StatusCode::BAD_REQUEST,
            Json(json!({"error": "No user messages provided"})),
        )
            .into_response();
    }
    let state = build_state(&request, user_id, &api.settings);

    if request.stream {
        stream_completion(api, state).into_response()
    } else {
        let report = api
            .coordinator
            .run(state, crate::events::StatusBus::disconnected())
            .await;
        let content = report
            .state
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Json(ChatCompletionResponse {
            id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            object: "chat.completion",
            created: Utc::now().timestamp(),
            model: api.settings.model_id.clone(),
            choices: vec![ChatChoice {
                index: 0,
                message: WireReply {
                    role: Role::Assistant.as_str(),
                    content,
                },
                finish_reason: "stop",
            }],
            usage: json!({"prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0}),
        })
        .into_response()
    }
}

fn stream_completion(
    api: ApiState,
    state: RequestState,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let bus = StatusBus::new();
    let status_rx = bus.subscribe();
    let emitter = bus.emitter();
    let model_id = api.settings.model_id.clone();
    let completion_id = format!("chatcmpl-{}", Uuid::new_v4().simple());

    let (event_tx, event_rx) = flume::unbounded::<Event>();
    tokio::spawn(async move {
        // Forward status frames while the traversal runs.
        let forward_tx = event_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Ok(status) = status_rx.recv_async().await {
                let frame = json!({
                    "type": "status",
                    "data": {
                        "description": status.message,
                        "stage": status.stage.as_str(),
                        "done": false,
                    }
                });
                let event = Event::default().event("status").data(frame.to_string());
                if forward_tx.send(event).is_err() {
                    break;
                }
            }
        });

        let report = api.coordinator.run(state, emitter).await;
        drop(bus);
        let _ = forwarder.await;

        let final_status = json!({
            "type": "status",
            "data": {"description": "Done", "done": true}
        });
        let _ = event_tx.send(
            Event::default()
                .event("status")
                .data(final_status.to_string()),
        );

        let content = report
            .state
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let chunk = json!({
            "id": completion_id,
            "object": "chat.completion.chunk",
            "created": Utc::now().timestamp(),
            "model": model_id,
            "choices": [{
                "index": 0,
                "delta": {"role": "assistant", "content": content},
                "finish_reason": "stop",
            }],
        });
        let _ = event_tx.send(Event::default().data(chunk.to_string()));
        let _ = event_tx.send(Event::default().data("[DONE]"));
    });

    let stream = event_rx.into_stream().map(Ok);
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn list_models(State(api): State<ApiState>) -> Json<Value> {
    Json(json!({
        "object": "list",
        "data": [{
            "id": api.settings.model_id,
            "object": "model",
            "created": 0,
            "owned_by": "synesis",
        }],
    }))
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn readiness() -> Json<Value> {
    Json(json!({"status": "ready"}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_resolution_precedence() {
        let headers = HeaderMap::new();
        assert_eq!(resolve_user_id(Some(" alice "), &headers), "alice");
        assert_eq!(resolve_user_id(None, &headers), "anonymous");

        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer tok123".parse().unwrap());
        let hashed = resolve_user_id(None, &headers);
        assert_eq!(hashed.len(), 16);
        assert_ne!(hashed, "anonymous");
        // The explicit user field wins over the token hash.
        assert_eq!(resolve_user_id(Some("bob"), &headers), "bob");
    }

    #[test]
    fn multimodal_content_is_flattened() {
        let wire = WireMessage {
            role: "user".into(),
            content: json!([
                {"type": "text", "text": "hello"},
                {"type": "image_url", "image_url": {"url": "x"}},
                {"type": "text", "text": "world"},
            ]),
        };
        assert_eq!(wire.normalized().content, "hello world");
    }
}
