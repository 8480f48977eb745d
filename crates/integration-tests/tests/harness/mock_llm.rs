//! Mock LLM backend for integration tests
//!
//! One server speaks all three upstream protocols: OpenAI-compatible SSE on
//! `/v1/chat/completions`, Google SSE on `/v1beta/models/{model}:streamGenerateContent`
//! and Ollama NDJSON on `/api/chat`. Replies are scripted per request; once
//! the script runs out every request gets the fallback reply.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router, routing};
use futures_util::{StreamExt, stream};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

/// What the mock sends back for one request
#[derive(Debug, Clone)]
pub enum Reply {
    /// Stream these text deltas, then finish with usage
    Text(Vec<String>),
    /// Stream a single tool call, then finish with usage
    ToolCall { id: String, name: String, args: Value },
    /// Fail with this status before any stream starts
    Status(u16, String),
    /// Send one text delta and keep the connection open
    Stall(String),
}

impl Reply {
    pub fn text(deltas: &[&str]) -> Self {
        Self::Text(deltas.iter().map(|d| (*d).to_owned()).collect())
    }

    pub fn tool_call(id: &str, name: &str, args: Value) -> Self {
        Self::ToolCall {
            id: id.to_owned(),
            name: name.to_owned(),
            args,
        }
    }

    pub fn status(status: u16, message: &str) -> Self {
        Self::Status(status, message.to_owned())
    }

    pub fn stall(first: &str) -> Self {
        Self::Stall(first.to_owned())
    }
}

/// A request as the mock received it
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// Bearer token or `x-goog-api-key` value
    pub credential: Option<String>,
    pub body: Value,
}

#[derive(Debug, Clone, Copy)]
enum Wire {
    OpenAi,
    Google,
    Ollama,
}

/// Mock LLM backend with scripted replies
pub struct MockLlm {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<MockLlmState>,
}

struct MockLlmState {
    request_count: AtomicU32,
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockLlm {
    /// Start a mock that answers every request with a short greeting
    pub async fn start() -> anyhow::Result<Self> {
        Self::start_with(Reply::text(&["Hello", " from mock LLM"])).await
    }

    /// Start a mock whose unscripted requests get `fallback`
    pub async fn start_with(fallback: Reply) -> anyhow::Result<Self> {
        let state = Arc::new(MockLlmState {
            request_count: AtomicU32::new(0),
            script: Mutex::new(VecDeque::new()),
            fallback,
            requests: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/v1/chat/completions", routing::post(handle_openai))
            .route("/v1beta/models/{target}", routing::post(handle_google))
            .route("/api/chat", routing::post(handle_ollama))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let shutdown_clone = shutdown.clone();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_clone.cancelled().await;
                })
                .await
                .ok();
        });

        Ok(Self { addr, shutdown, state })
    }

    /// Queue replies for the next requests, in order
    pub fn script(&self, replies: impl IntoIterator<Item = Reply>) {
        self.state
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(replies);
    }

    /// Base URL for an OpenAI-compatible provider
    ///
    /// Includes `/v1` since the driver appends `/chat/completions`
    pub fn openai_base_url(&self) -> String {
        format!("http://{}/v1", self.addr)
    }

    /// Base URL for a Google provider
    pub fn google_base_url(&self) -> String {
        format!("http://{}/v1beta", self.addr)
    }

    /// Base URL for an Ollama provider
    pub fn ollama_base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Number of requests received on any route
    pub fn request_count(&self) -> u32 {
        self.state.request_count.load(Ordering::Relaxed)
    }

    /// Every request received so far
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Credentials presented, one per request
    pub fn credentials(&self) -> Vec<Option<String>> {
        self.requests().into_iter().map(|r| r.credential).collect()
    }
}

impl Drop for MockLlm {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// -- Handlers --

async fn handle_openai(
    State(state): State<Arc<MockLlmState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    respond(&state, Wire::OpenAi, &headers, body)
}

async fn handle_google(
    State(state): State<Arc<MockLlmState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    respond(&state, Wire::Google, &headers, body)
}

async fn handle_ollama(
    State(state): State<Arc<MockLlmState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    respond(&state, Wire::Ollama, &headers, body)
}

fn respond(state: &MockLlmState, wire: Wire, headers: &HeaderMap, body: Value) -> Response {
    state.request_count.fetch_add(1, Ordering::Relaxed);
    state
        .requests
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(RecordedRequest {
            credential: credential(headers),
            body,
        });

    let reply = state
        .script
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .pop_front()
        .unwrap_or_else(|| state.fallback.clone());

    match reply {
        Reply::Status(status, message) => error_response(wire, status, &message),
        Reply::Stall(first) => {
            let first = frame(wire, &text_chunk(wire, &first));
            let body = stream::iter([Ok::<_, Infallible>(first)]).chain(stream::pending());
            ([(header::CONTENT_TYPE, content_type(wire))], Body::from_stream(body)).into_response()
        }
        Reply::Text(deltas) => {
            let mut frames: Vec<String> = deltas.iter().map(|d| frame(wire, &text_chunk(wire, d))).collect();
            frames.extend(finish(wire));
            ([(header::CONTENT_TYPE, content_type(wire))], frames.concat()).into_response()
        }
        Reply::ToolCall { id, name, args } => {
            let mut frames = tool_call_frames(wire, &id, &name, &args);
            frames.extend(finish(wire));
            ([(header::CONTENT_TYPE, content_type(wire))], frames.concat()).into_response()
        }
    }
}

fn credential(headers: &HeaderMap) -> Option<String> {
    if let Some(key) = headers.get("x-goog-api-key") {
        return key.to_str().ok().map(str::to_owned);
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_owned)
}

const fn content_type(wire: Wire) -> &'static str {
    match wire {
        Wire::OpenAi | Wire::Google => "text/event-stream",
        Wire::Ollama => "application/x-ndjson",
    }
}

fn frame(wire: Wire, payload: &Value) -> String {
    match wire {
        Wire::OpenAi | Wire::Google => format!("data: {payload}\n\n"),
        Wire::Ollama => format!("{payload}\n"),
    }
}

fn error_response(wire: Wire, status: u16, message: &str) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = match wire {
        Wire::OpenAi => json!({"error": {"message": message, "type": "mock_error"}}),
        Wire::Google => json!({"error": {"code": status.as_u16(), "message": message, "status": "MOCK"}}),
        Wire::Ollama => json!({"error": message}),
    };
    (status, Json(body)).into_response()
}

// -- Chunk builders --

fn text_chunk(wire: Wire, text: &str) -> Value {
    match wire {
        Wire::OpenAi => json!({"choices": [{"index": 0, "delta": {"content": text}}]}),
        Wire::Google => json!({"candidates": [{"content": {"role": "model", "parts": [{"text": text}]}}]}),
        Wire::Ollama => json!({
            "model": "mock",
            "message": {"role": "assistant", "content": text},
            "done": false
        }),
    }
}

fn tool_call_frames(wire: Wire, id: &str, name: &str, args: &Value) -> Vec<String> {
    match wire {
        Wire::OpenAi => {
            // Split the arguments so the client has to join fragments
            let encoded = args.to_string();
            let (head, tail) = encoded.split_at(1);
            vec![
                frame(
                    wire,
                    &json!({"choices": [{"index": 0, "delta": {"tool_calls": [{
                        "index": 0,
                        "id": id,
                        "type": "function",
                        "function": {"name": name, "arguments": head}
                    }]}}]}),
                ),
                frame(
                    wire,
                    &json!({"choices": [{
                        "index": 0,
                        "delta": {"tool_calls": [{"index": 0, "function": {"arguments": tail}}]},
                        "finish_reason": "tool_calls"
                    }]}),
                ),
            ]
        }
        Wire::Google => vec![frame(
            wire,
            &json!({"candidates": [{"content": {"role": "model", "parts": [
                {"functionCall": {"id": id, "name": name, "args": args}}
            ]}}]}),
        )],
        Wire::Ollama => vec![frame(wire, &json!({"error": "tools are not supported by this model"}))],
    }
}

fn finish(wire: Wire) -> Vec<String> {
    match wire {
        Wire::OpenAi => vec![
            frame(wire, &json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]})),
            frame(
                wire,
                &json!({"choices": [], "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}}),
            ),
            "data: [DONE]\n\n".to_owned(),
        ],
        Wire::Google => vec![frame(
            wire,
            &json!({
                "candidates": [{"content": {"role": "model", "parts": []}, "finishReason": "STOP"}],
                "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 5, "totalTokenCount": 15}
            }),
        )],
        Wire::Ollama => vec![frame(
            wire,
            &json!({
                "model": "mock",
                "message": {"role": "assistant", "content": ""},
                "done": true,
                "done_reason": "stop",
                "prompt_eval_count": 10,
                "eval_count": 5
            }),
        )],
    }
}
