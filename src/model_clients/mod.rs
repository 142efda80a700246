//! Model Clients (spec §4.1, component C1).
//!
//! Uniform call surface to embedding, rerank and chat-completion backends.
//! Two concrete backends implement the same [`ModelClient`] trait: a
//! [`local::LocalModelClient`] talking to a same-host OpenAI-compatible
//! server, and a [`remote::RemoteModelClient`] talking to a hosted API with
//! bearer auth. Callers depend only on the trait.

pub mod local;
pub mod remote;

use crate::error::PipelineError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Whether text is being embedded as a corpus passage or as a query.
/// Some embedding models use distinct instruction prefixes for the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedMode {
    Passage,
    Query,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChatUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// A completed, non-streaming chat response (used for summarisation and
/// auto-naming, which never need token-level delivery).
#[derive(Debug, Clone)]
pub struct NonStreamChat {
    pub content: String,
    pub usage: ChatUsage,
}

/// One unit of a streaming chat completion, delivered in generation order.
/// The adapter guarantees `TextDelta` never splits a UTF-8 code point.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    TextDelta(String),
    Usage(ChatUsage),
    Done,
    Error(String),
}

/// Shared OpenAI-compatible chat-completions wire types, used by both
/// backends (they differ only in base URL and auth, not in protocol).
pub(crate) mod wire {
    use serde::{Deserialize, Serialize};
    use serde_json::Value;

    #[derive(Serialize)]
    pub struct ChatCompletionRequest {
        pub model: String,
        pub messages: Vec<WireMessage>,
        pub stream: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub temperature: Option<f32>,
    }

    #[derive(Serialize)]
    pub struct WireMessage {
        pub role: &'static str,
        pub content: String,
    }

    #[derive(Deserialize)]
    pub struct ChatCompletionResponse {
        pub choices: Vec<ChatCompletionChoice>,
        pub usage: Option<WireUsage>,
    }

    #[derive(Deserialize)]
    pub struct ChatCompletionChoice {
        pub message: ChatCompletionMessage,
    }

    #[derive(Deserialize)]
    pub struct ChatCompletionMessage {
        pub content: Option<String>,
    }

    #[derive(Deserialize)]
    pub struct WireUsage {
        pub prompt_tokens: u32,
        pub completion_tokens: u32,
    }

    #[derive(Deserialize)]
    pub struct ChatCompletionChunk {
        pub choices: Vec<ChunkChoice>,
        #[serde(default)]
        pub usage: Option<WireUsage>,
    }

    #[derive(Deserialize)]
    pub struct ChunkChoice {
        pub delta: ChunkDelta,
    }

    #[derive(Deserialize, Default)]
    pub struct ChunkDelta {
        pub content: Option<String>,
    }

    #[derive(Serialize)]
    pub struct EmbeddingRequest {
        pub model: String,
        pub input: Vec<String>,
    }

    #[derive(Deserialize)]
    pub struct EmbeddingResponse {
        pub data: Vec<EmbeddingDatum>,
    }

    #[derive(Deserialize)]
    pub struct EmbeddingDatum {
        pub embedding: Vec<f32>,
    }

    #[derive(Deserialize)]
    pub struct ApiErrorEnvelope {
        pub error: Option<Value>,
    }
}

/// Drive an OpenAI-compatible `POST .../chat/completions` streaming response
/// to completion, pushing [`StreamEvent`]s to `tx` in arrival order. Shared
/// by both backends since the wire protocol is identical once you have a URL
/// and headers.
pub(crate) async fn stream_chat_completions(
    request: reqwest::RequestBuilder,
    tx: mpsc::Sender<StreamEvent>,
) -> Result<(), PipelineError> {
    use futures::StreamExt;
    use ragchat_core::sse::SseDecoder;

    let response = request
        .send()
        .await
        .map_err(|e| PipelineError::BackendUnavailable(e.to_string()))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(PipelineError::BackendProtocolError(format!("{status}: {body}")));
    }

    let mut decoder = SseDecoder::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| PipelineError::BackendTimeout(e.to_string()))?;
        for frame in decoder.push(&chunk) {
            if frame.is_done() {
                let _ = tx.send(StreamEvent::Done).await;
                return Ok(());
            }
            let parsed: wire::ChatCompletionChunk = match frame.try_parse() {
                Ok(p) => p,
                Err(e) => {
                    let _ = tx.send(StreamEvent::Error(e.to_string())).await;
                    continue;
                }
            };
            if let Some(usage) = parsed.usage {
                let _ = tx
                    .send(StreamEvent::Usage(ChatUsage {
                        prompt_tokens: usage.prompt_tokens,
                        completion_tokens: usage.completion_tokens,
                    }))
                    .await;
            }
            for choice in parsed.choices {
                if let Some(content) = choice.delta.content {
                    if !content.is_empty() && tx.send(StreamEvent::TextDelta(content)).await.is_err() {
                        // Receiver gone (client cancelled): stop driving the upstream read.
                        return Ok(());
                    }
                }
            }
        }
    }

    let _ = tx.send(StreamEvent::Done).await;
    Ok(())
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Embed a batch of texts into unit-normalised, fixed-dimension vectors.
    /// Deterministic for identical inputs and model version.
    async fn embed(&self, texts: &[String], mode: EmbedMode) -> Result<Vec<Vec<f32>>, PipelineError>;

    /// Score each passage against `query`; scores are unnormalised logits,
    /// higher is more relevant, the reserved sentinel `-100.0` marks "filtered".
    async fn rerank(&self, query: &str, passages: &[String]) -> Result<Vec<f32>, PipelineError>;

    /// Non-streaming chat completion (used where token-level delivery isn't needed).
    async fn chat(&self, messages: Vec<ChatMessage>) -> Result<NonStreamChat, PipelineError>;

    /// Streaming chat completion: events are pushed to `tx` in generation
    /// order as they arrive. The receiver side decides whether to keep
    /// consuming; a full backpressured channel simply blocks the underlying
    /// read, which is exactly what the ReAct engine wants (spec §5).
    async fn chat_stream(
        &self,
        messages: Vec<ChatMessage>,
        tools_present: bool,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), PipelineError>;
}
