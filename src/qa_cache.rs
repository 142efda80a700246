//! QA Cache (spec §4.9, component C9).
//!
//! A separate Qdrant collection from the document corpus, keyed by a
//! hash-derived `thought_chain_id` (SPEC_FULL.md §4, Open Question 1).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::PipelineError;
use crate::model_clients::{EmbedMode, ModelClient};
use ragchat_core::vector_store::{MetadataBuilder, VectorPoint, VectorStoreAdapter};

pub const QA_CACHE_COLLECTION: &str = "ragchat_qa_cache";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackKind {
    Positive,
    Negative,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedCitation {
    pub uuid: String,
    pub name: String,
}

pub struct CacheHit {
    pub thought_chain_id: String,
    pub question: String,
    pub answer: String,
    pub citations: Vec<CachedCitation>,
    pub dislike_count: i64,
    pub score: f32,
}

pub struct QaCache {
    store: Arc<VectorStoreAdapter>,
    model: Arc<dyn ModelClient>,
    hit_threshold: f32,
    dislike_invalidate: u32,
}

impl QaCache {
    pub fn new(store: Arc<VectorStoreAdapter>, model: Arc<dyn ModelClient>, hit_threshold: f32, dislike_invalidate: u32) -> Self {
        Self { store, model, hit_threshold, dislike_invalidate }
    }

    /// Stable identifier for a finalised (question, answer) pair — the
    /// canonical QA-cache key (SPEC_FULL.md §4).
    pub fn thought_chain_id(question: &str, answer: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(question.as_bytes());
        hasher.update(b"\u{0}");
        hasher.update(answer.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub async fn lookup(&self, question_text: &str) -> Result<Option<CacheHit>, PipelineError> {
        let mut vectors = self.model.embed(&[question_text.to_string()], EmbedMode::Query).await?;
        let vector = vectors.pop().ok_or_else(|| PipelineError::BackendProtocolError("embed returned no vectors".into()))?;

        let hits = self
            .store
            .search(QA_CACHE_COLLECTION, ragchat_core::EMBEDDING_DIM, vector, 1, None)
            .await
            .map_err(|e| PipelineError::PersistenceError(e.to_string()))?;

        let Some(hit) = hits.into_iter().next() else {
            return Ok(None);
        };
        if hit.score < self.hit_threshold {
            return Ok(None);
        }

        let question = string_field(&hit.payload, "question").unwrap_or_default();
        let answer = string_field(&hit.payload, "answer").unwrap_or_default();
        let citations: Vec<CachedCitation> = hit
            .payload
            .get("citations")
            .and_then(|v| v.as_str())
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default();
        let dislike_count = hit.payload.get("dislike_count").and_then(|v| v.as_i64()).unwrap_or(0);

        Ok(Some(CacheHit {
            thought_chain_id: hit.id,
            question,
            answer,
            citations,
            dislike_count,
            score: hit.score,
        }))
    }

    /// Look up a cache entry by its exact id, bypassing the similarity
    /// search — used to reload the current feedback counter before
    /// re-upserting it (spec §4.9).
    async fn get_by_id(&self, thought_chain_id: &str) -> Result<Option<CacheHit>, PipelineError> {
        let hits = self
            .store
            .scroll_by_id(QA_CACHE_COLLECTION, thought_chain_id)
            .await
            .map_err(|e| PipelineError::PersistenceError(e.to_string()))?;

        let Some(hit) = hits else { return Ok(None) };
        let question = string_field(&hit.payload, "question").unwrap_or_default();
        let answer = string_field(&hit.payload, "answer").unwrap_or_default();
        let citations: Vec<CachedCitation> = hit
            .payload
            .get("citations")
            .and_then(|v| v.as_str())
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default();
        let dislike_count = hit.payload.get("dislike_count").and_then(|v| v.as_i64()).unwrap_or(0);

        Ok(Some(CacheHit {
            thought_chain_id: hit.id,
            question,
            answer,
            citations,
            dislike_count,
            score: 0.0,
        }))
    }

    pub async fn upsert(
        &self,
        thought_chain_id: &str,
        question: &str,
        answer: &str,
        citations: &[CachedCitation],
        dislike_count: i64,
    ) -> Result<(), PipelineError> {
        let mut vectors = self.model.embed(&[question.to_string()], EmbedMode::Passage).await?;
        let vector = vectors.pop().ok_or_else(|| PipelineError::BackendProtocolError("embed returned no vectors".into()))?;

        let citations_json = serde_json::to_string(citations).unwrap_or_else(|_| "[]".to_string());
        let payload = MetadataBuilder::new()
            .string("question", question)
            .string("answer", answer)
            .string("citations", citations_json)
            .number("dislike_count", dislike_count)
            .number("created_at", chrono::Utc::now().timestamp())
            .build();

        let point = VectorPoint { id: thought_chain_id.to_string(), vector, payload };
        self.store
            .upsert(QA_CACHE_COLLECTION, ragchat_core::EMBEDDING_DIM, vec![point])
            .await
            .map_err(|e| PipelineError::PersistenceError(e.to_string()))
    }

    pub async fn delete(&self, thought_chain_id: &str) -> Result<(), PipelineError> {
        self.store
            .delete_by_id(QA_CACHE_COLLECTION, thought_chain_id)
            .await
            .map_err(|e| PipelineError::PersistenceError(e.to_string()))
    }

    /// Increment the feedback counter; on a negative vote that crosses
    /// `dislike_invalidate`, synchronously delete the entry instead of
    /// persisting the new count (spec §4.9).
    pub async fn record_feedback(&self, thought_chain_id: &str, kind: FeedbackKind) -> Result<(), PipelineError> {
        if kind != FeedbackKind::Negative {
            return Ok(());
        }
        let Some(entry) = self.get_by_id(thought_chain_id).await? else {
            return Ok(());
        };
        let dislike_count = entry.dislike_count + 1;
        if dislike_count >= self.dislike_invalidate as i64 {
            self.delete(thought_chain_id).await?;
            return Ok(());
        }
        self.upsert(thought_chain_id, &entry.question, &entry.answer, &entry.citations, dislike_count).await
    }
}

fn string_field(payload: &HashMap<String, serde_json::Value>, key: &str) -> Option<String> {
    payload.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thought_chain_id_is_stable_and_order_sensitive() {
        let a = QaCache::thought_chain_id("what is rust", "a language");
        let b = QaCache::thought_chain_id("what is rust", "a language");
        let c = QaCache::thought_chain_id("a language", "what is rust");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn thought_chain_id_is_hex_sha256_length() {
        let id = QaCache::thought_chain_id("q", "a");
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
