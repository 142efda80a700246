//! Local model-client backend: talks to a same-host OpenAI-compatible
//! inference server (e.g. a self-hosted vLLM/TGI/llama.cpp endpoint).
//! No bearer auth; failures are reported as `BackendUnavailable` rather than
//! `BackendProtocolError` whenever the connection itself is the problem,
//! since a local backend going away usually means the process died.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::PipelineError;
use super::wire;
use super::{ChatMessage, ChatUsage, EmbedMode, ModelClient, NonStreamChat, Role, StreamEvent};

pub struct LocalModelClient {
    http: reqwest::Client,
    base_url: String,
    chat_model: String,
    embed_model: String,
    rerank_model: Option<String>,
}

impl LocalModelClient {
    pub fn new(base_url: impl Into<String>, chat_model: impl Into<String>, embed_model: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(ragchat_core::HTTP_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base_url: base_url.into(),
            chat_model: chat_model.into(),
            embed_model: embed_model.into(),
            rerank_model: None,
        }
    }

    pub fn with_rerank_model(mut self, model: impl Into<String>) -> Self {
        self.rerank_model = Some(model.into());
        self
    }

    fn wire_role(role: Role) -> &'static str {
        match role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[async_trait]
impl ModelClient for LocalModelClient {
    async fn embed(&self, texts: &[String], mode: EmbedMode) -> Result<Vec<Vec<f32>>, PipelineError> {
        debug!(n = texts.len(), ?mode, "local embed");
        let body = wire::EmbeddingRequest {
            model: self.embed_model.clone(),
            input: texts.to_vec(),
        };
        let resp = self
            .http
            .post(format!("{}/embeddings", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::BackendUnavailable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(PipelineError::BackendUnavailable(format!("status {}", resp.status())));
        }

        let parsed: wire::EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| PipelineError::BackendProtocolError(e.to_string()))?;

        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }

    async fn rerank(&self, query: &str, passages: &[String]) -> Result<Vec<f32>, PipelineError> {
        let Some(model) = &self.rerank_model else {
            return Err(PipelineError::BackendUnavailable("no rerank model configured".into()));
        };
        let body = serde_json::json!({
            "model": model,
            "query": query,
            "documents": passages,
        });
        let resp = self
            .http
            .post(format!("{}/rerank", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::BackendUnavailable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(PipelineError::BackendUnavailable(format!("status {}", resp.status())));
        }

        let parsed: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| PipelineError::BackendProtocolError(e.to_string()))?;

        let results = parsed
            .get("results")
            .and_then(|v| v.as_array())
            .ok_or_else(|| PipelineError::BackendProtocolError("missing results[]".into()))?;

        let mut scores = vec![ragchat_core::DEFAULT_SCORE_FLOOR; passages.len()];
        for r in results {
            let idx = r.get("index").and_then(|v| v.as_u64()).unwrap_or(u64::MAX) as usize;
            let score = r.get("relevance_score").and_then(|v| v.as_f64()).unwrap_or(f64::from(ragchat_core::DEFAULT_SCORE_FLOOR));
            if idx < scores.len() {
                scores[idx] = score as f32;
            }
        }
        Ok(scores)
    }

    async fn chat(&self, messages: Vec<ChatMessage>) -> Result<NonStreamChat, PipelineError> {
        let body = wire::ChatCompletionRequest {
            model: self.chat_model.clone(),
            messages: messages
                .into_iter()
                .map(|m| wire::WireMessage { role: Self::wire_role(m.role), content: m.content })
                .collect(),
            stream: false,
            temperature: None,
        };
        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::BackendUnavailable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(PipelineError::BackendUnavailable(format!("status {}", resp.status())));
        }

        let parsed: wire::ChatCompletionResponse = resp
            .json()
            .await
            .map_err(|e| PipelineError::BackendProtocolError(e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        let usage = parsed
            .usage
            .map(|u| ChatUsage { prompt_tokens: u.prompt_tokens, completion_tokens: u.completion_tokens })
            .unwrap_or_default();

        Ok(NonStreamChat { content, usage })
    }

    async fn chat_stream(
        &self,
        messages: Vec<ChatMessage>,
        _tools_present: bool,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), PipelineError> {
        let body = wire::ChatCompletionRequest {
            model: self.chat_model.clone(),
            messages: messages
                .into_iter()
                .map(|m| wire::WireMessage { role: Self::wire_role(m.role), content: m.content })
                .collect(),
            stream: true,
            temperature: None,
        };
        let request = self.http.post(format!("{}/chat/completions", self.base_url)).json(&body);
        super::stream_chat_completions(request, tx).await
    }
}
