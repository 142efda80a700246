//! SSE wire protocol (spec §6.2).
//!
//! Each [`WireEvent`] renders as two lines (`event: <kind>`, `data: <json>`)
//! followed by a blank line. `axum::response::sse::Event` already handles
//! newline escaping inside the JSON payload and the blank-line framing, so
//! this module only owns the kind↔payload mapping.

use axum::response::sse::Event as SseEvent;
use serde::Serialize;
use serde_json::json;

/// One event as produced internally, independent of HTTP. The event bus
/// carries these; the stream orchestrator's drain loop turns each into an
/// `axum::response::sse::Event`.
#[derive(Debug, Clone)]
pub enum WireEvent {
    SessionCreated { session_id: String, session_name: String },
    UserMessageSaved { uuid: String, content: String },
    Thought { content: String },
    Action { content: String },
    Observation { content: String },
    AnswerChunk { text: String },
    Documents { documents: Vec<DocumentRef> },
    AiMessageSaved { uuid: String, content: String },
    Done { session_id: String },
    Error { message: String, kind: Option<String> },
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentRef {
    pub uuid: String,
    pub name: String,
}

impl WireEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            WireEvent::SessionCreated { .. } => "session_created",
            WireEvent::UserMessageSaved { .. } => "user_message_saved",
            WireEvent::Thought { .. } => "thought",
            WireEvent::Action { .. } => "action",
            WireEvent::Observation { .. } => "observation",
            WireEvent::AnswerChunk { .. } => "answer_chunk",
            WireEvent::Documents { .. } => "documents",
            WireEvent::AiMessageSaved { .. } => "ai_message_saved",
            WireEvent::Done { .. } => "done",
            WireEvent::Error { .. } => "error",
        }
    }

    /// True for the three reasoning-trace kinds the writer suppresses when
    /// the request's `show_thinking` is false (spec §6.1): they are still
    /// produced and persisted, just not written to the wire.
    pub fn is_reasoning_trace(&self) -> bool {
        matches!(self, WireEvent::Thought { .. } | WireEvent::Action { .. } | WireEvent::Observation { .. })
    }

    fn payload(&self) -> serde_json::Value {
        match self {
            WireEvent::SessionCreated { session_id, session_name } => {
                json!({ "session_id": session_id, "session_name": session_name })
            }
            WireEvent::UserMessageSaved { uuid, content } => json!({ "uuid": uuid, "content": content }),
            WireEvent::Thought { content } => json!({ "content": content }),
            WireEvent::Action { content } => json!({ "content": content }),
            WireEvent::Observation { content } => json!({ "content": content }),
            WireEvent::AnswerChunk { text } => json!({ "content": text }),
            WireEvent::Documents { documents } => json!({ "documents": documents }),
            WireEvent::AiMessageSaved { uuid, content } => json!({ "uuid": uuid, "content": content }),
            WireEvent::Done { session_id } => json!({ "session_id": session_id }),
            WireEvent::Error { message, kind } => json!({ "message": message, "kind": kind }),
        }
    }

    /// Render as an axum SSE event. `serde_json` serialises `\n` as `\\n`
    /// inside string values, so the two-line frame is never split by
    /// embedded newlines in `content`.
    pub fn into_sse(self) -> SseEvent {
        SseEvent::default().event(self.kind()).json_data(self.payload()).unwrap_or_else(|_| {
            SseEvent::default().event("error").data(r#"{"message":"event serialization failed"}"#)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_spec_table() {
        assert_eq!(WireEvent::Done { session_id: "s".into() }.kind(), "done");
        assert_eq!(WireEvent::AnswerChunk { text: "x".into() }.kind(), "answer_chunk");
    }

    #[test]
    fn answer_chunk_payload_uses_content_key() {
        let event = WireEvent::AnswerChunk { text: "hi".into() };
        assert_eq!(event.payload()["content"], json!("hi"));
    }

    #[test]
    fn reasoning_trace_events_are_flagged_for_suppression() {
        assert!(WireEvent::Thought { content: "t".into() }.is_reasoning_trace());
        assert!(!WireEvent::AnswerChunk { text: "t".into() }.is_reasoning_trace());
    }

    #[test]
    fn documents_payload_is_array_under_documents_key() {
        let event = WireEvent::Documents {
            documents: vec![DocumentRef { uuid: "1".into(), name: "a.txt".into() }],
        };
        assert_eq!(event.payload()["documents"][0]["name"], json!("a.txt"));
    }
}
