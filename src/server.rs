//! HTTP server. `POST /messages` (spec §6.1) is the one endpoint the spec's
//! request-surface table constrains: it accepts either a JSON body or a
//! multipart form and responds with an SSE stream of [`WireEvent`]s (spec
//! §6.2). `POST /messages/{id}/feedback` is this crate's own thin addition,
//! wiring C9's `record_feedback` operation to the HTTP boundary.

use axum::body::to_bytes;
use axum::extract::{FromRequest, Multipart, Path, Request, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::PipelineError;
use crate::orchestrator::{IncomingMessage, Orchestrator};
use crate::qa_cache::FeedbackKind;
use crate::retriever::Permission;

/// Request bodies larger than this are rejected before any parsing happens.
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/messages", post(post_message))
        .route("/messages/{id}/feedback", post(post_feedback))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run(addr: std::net::SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    tracing::info!("listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// JSON-body shape for `POST /messages` (spec §6.1's field table).
#[derive(Debug, Deserialize)]
struct JsonMessageRequest {
    content: String,
    user_id: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    show_thinking: bool,
    #[serde(default)]
    skip_cache: bool,
    #[serde(default)]
    location: Option<serde_json::Value>,
    #[serde(default)]
    regenerate_message_id: Option<String>,
}

async fn post_message(State(state): State<AppState>, request: Request) -> Response {
    match build_incoming(request).await {
        Ok(incoming) => stream_response(state, incoming).await,
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct FeedbackRequest {
    kind: FeedbackRequestKind,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum FeedbackRequestKind {
    Positive,
    Negative,
}

/// Not part of the one constrained endpoint (spec §6.1); a thin auxiliary
/// route for C9's `record_feedback` operation.
async fn post_feedback(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
    Json(body): Json<FeedbackRequest>,
) -> Response {
    let kind = match body.kind {
        FeedbackRequestKind::Positive => FeedbackKind::Positive,
        FeedbackRequestKind::Negative => FeedbackKind::Negative,
    };
    match state.orchestrator.record_feedback(&message_id, kind).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn build_incoming(request: Request) -> Result<IncomingMessage, PipelineError> {
    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("multipart/form-data"))
        .unwrap_or(false);

    let incoming = if is_multipart {
        build_from_multipart(request).await?
    } else {
        build_from_json(request).await?
    };

    if incoming.content.trim().is_empty() {
        return Err(PipelineError::ValidationError("content must not be empty".into()));
    }
    if incoming.user_id.trim().is_empty() {
        return Err(PipelineError::ValidationError("user_id must not be empty".into()));
    }

    Ok(incoming)
}

async fn build_from_json(request: Request) -> Result<IncomingMessage, PipelineError> {
    let body = request.into_body();
    let bytes = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| PipelineError::ValidationError(format!("failed to read request body: {e}")))?;
    let parsed: JsonMessageRequest = serde_json::from_slice(&bytes)
        .map_err(|e| PipelineError::ValidationError(format!("invalid JSON body: {e}")))?;

    Ok(IncomingMessage {
        content: parsed.content,
        user_id: parsed.user_id,
        session_id: parsed.session_id,
        show_thinking: parsed.show_thinking,
        skip_cache: parsed.skip_cache,
        permission: Permission::User,
        attached_text: None,
        location: parsed.location,
        regenerate_message_id: parsed.regenerate_message_id,
    })
}

async fn build_from_multipart(request: Request) -> Result<IncomingMessage, PipelineError> {
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| PipelineError::ValidationError(format!("invalid multipart form: {e}")))?;

    let mut content = String::new();
    let mut user_id = String::new();
    let mut session_id = None;
    let mut show_thinking = false;
    let mut skip_cache = false;
    let mut location = None;
    let mut regenerate_message_id = None;
    let mut attached_text = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| PipelineError::ValidationError(format!("malformed multipart field: {e}")))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| PipelineError::ValidationError(format!("failed to read file field: {e}")))?;
                let text = String::from_utf8_lossy(&bytes);
                attached_text = Some(text.chars().take(ragchat_core::ATTACHED_FILE_TEXT_CAP_CHARS).collect());
            }
            other => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| PipelineError::ValidationError(format!("failed to read field '{other}': {e}")))?;
                match other {
                    "content" => content = text,
                    "user_id" => user_id = text,
                    "session_id" if !text.is_empty() => session_id = Some(text),
                    "show_thinking" => show_thinking = text == "true" || text == "1",
                    "skip_cache" => skip_cache = text == "true" || text == "1",
                    "regenerate_message_id" if !text.is_empty() => regenerate_message_id = Some(text),
                    "location" if !text.is_empty() => {
                        location = serde_json::from_str(&text).ok().or(Some(serde_json::Value::String(text)));
                    }
                    _ => {}
                }
            }
        }
    }

    Ok(IncomingMessage {
        content,
        user_id,
        session_id,
        show_thinking,
        skip_cache,
        permission: Permission::User,
        attached_text,
        location,
        regenerate_message_id,
    })
}

async fn stream_response(state: AppState, incoming: IncomingMessage) -> Response {
    let (tx, rx) = mpsc::channel::<crate::wire::WireEvent>(ragchat_core::EVENT_BUS_MIN_CAPACITY);

    tokio::spawn(async move {
        let orchestrator = state.orchestrator;
        orchestrator
            .handle(incoming, |event| {
                let tx = tx.clone();
                async move { tx.send(event).await.map_err(|_| ()) }
            })
            .await;
    });

    let stream = async_stream::stream! {
        let mut rx = rx;
        while let Some(event) = rx.recv().await {
            yield Ok::<SseEvent, Infallible>(event.into_sse());
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;

    fn json_request(body: &str) -> Request {
        HttpRequest::builder()
            .method("POST")
            .uri("/messages")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn build_incoming_rejects_empty_content() {
        let req = json_request(r#"{"content":"   ","user_id":"u1"}"#);
        let err = build_incoming(req).await.unwrap_err();
        assert!(matches!(err, PipelineError::ValidationError(_)));
    }

    #[tokio::test]
    async fn build_incoming_rejects_empty_user_id() {
        let req = json_request(r#"{"content":"hi","user_id":""}"#);
        let err = build_incoming(req).await.unwrap_err();
        assert!(matches!(err, PipelineError::ValidationError(_)));
    }

    #[tokio::test]
    async fn build_incoming_rejects_malformed_json_body() {
        let req = json_request("not json");
        let err = build_incoming(req).await.unwrap_err();
        assert!(matches!(err, PipelineError::ValidationError(_)));
    }

    #[tokio::test]
    async fn build_from_json_parses_full_request() {
        let req = json_request(
            r#"{"content":"hello","user_id":"u1","session_id":"s1","show_thinking":true,"skip_cache":true,"location":{"lat":1.0}}"#,
        );
        let incoming = build_incoming(req).await.unwrap();
        assert_eq!(incoming.content, "hello");
        assert_eq!(incoming.user_id, "u1");
        assert_eq!(incoming.session_id.as_deref(), Some("s1"));
        assert!(incoming.show_thinking);
        assert!(incoming.skip_cache);
        assert!(matches!(incoming.permission, Permission::User));
        assert!(incoming.location.is_some());
        assert!(incoming.attached_text.is_none());
    }

    #[test]
    fn feedback_request_parses_lowercase_kind() {
        let positive: FeedbackRequest = serde_json::from_str(r#"{"kind":"positive"}"#).unwrap();
        assert!(matches!(positive.kind, FeedbackRequestKind::Positive));
        let negative: FeedbackRequest = serde_json::from_str(r#"{"kind":"negative"}"#).unwrap();
        assert!(matches!(negative.kind, FeedbackRequestKind::Negative));
    }

    #[tokio::test]
    async fn build_from_multipart_parses_fields_and_file_attachment() {
        let boundary = "X-BOUNDARY";
        let body = format!(
            "--{b}\r\n\
             Content-Disposition: form-data; name=\"content\"\r\n\r\n\
             hello from form\r\n\
             --{b}\r\n\
             Content-Disposition: form-data; name=\"user_id\"\r\n\r\n\
             u1\r\n\
             --{b}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"notes.txt\"\r\n\
             Content-Type: text/plain\r\n\r\n\
             attached file contents\r\n\
             --{b}--\r\n",
            b = boundary
        );
        let req = HttpRequest::builder()
            .method("POST")
            .uri("/messages")
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={boundary}"))
            .body(Body::from(body))
            .unwrap();

        let incoming = build_incoming(req).await.unwrap();
        assert_eq!(incoming.content, "hello from form");
        assert_eq!(incoming.user_id, "u1");
        assert_eq!(incoming.attached_text.as_deref(), Some("attached file contents"));
    }
}

