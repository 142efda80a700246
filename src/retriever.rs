//! Retriever (spec §4.3, component C3).
//!
//! Embeds a query, searches the document-corpus collection, reranks, dedups
//! and formats passages for prompt assembly. Shares [`ragchat_core::vector_store`]
//! with the QA cache but owns its own collection name and permission filter.

use qdrant_client::qdrant::{Condition, Filter};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use crate::error::PipelineError;
use crate::model_clients::{EmbedMode, ModelClient};
use ragchat_core::vector_store::VectorStoreAdapter;

pub const CORPUS_COLLECTION: &str = "ragchat_corpus";

/// Caller's permission level, used to scope retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    User,
    Admin,
}

/// One retrieved passage, carried alongside the formatted context for
/// citation emission by the ReAct engine.
#[derive(Debug, Clone)]
pub struct Passage {
    pub filename: String,
    pub chunk_id: String,
    pub document_id: String,
    pub text: String,
    pub similarity: f32,
    pub rerank_score: Option<f32>,
}

#[derive(Debug, Clone, Default)]
pub struct RetrievalParams {
    pub candidate_k: Option<usize>,
    pub final_k: Option<usize>,
    pub rerank: bool,
}

pub struct RetrievalResult {
    pub formatted: String,
    pub passages: Vec<Passage>,
}

pub struct Retriever {
    store: Arc<VectorStoreAdapter>,
    model: Arc<dyn ModelClient>,
    candidate_k: usize,
    final_k: usize,
    score_floor: f32,
    dedup_epsilon: f32,
}

impl Retriever {
    pub fn new(
        store: Arc<VectorStoreAdapter>,
        model: Arc<dyn ModelClient>,
        candidate_k: usize,
        final_k: usize,
        score_floor: f32,
        dedup_epsilon: f32,
    ) -> Self {
        Self {
            store,
            model,
            candidate_k,
            final_k,
            score_floor,
            dedup_epsilon,
        }
    }

    pub async fn retrieve(
        &self,
        query: &str,
        permission: Permission,
        params: RetrievalParams,
    ) -> Result<RetrievalResult, PipelineError> {
        let candidate_k = params.candidate_k.unwrap_or(self.candidate_k);
        let final_k = params.final_k.unwrap_or(self.final_k);

        let mut vectors = self
            .model
            .embed(&[query.to_string()], EmbedMode::Query)
            .await?;
        let vector = vectors.pop().ok_or_else(|| {
            PipelineError::BackendProtocolError("embed returned no vectors".into())
        })?;

        let filter = permission_filter(permission);
        let hits = self
            .store
            .search(CORPUS_COLLECTION, ragchat_core::EMBEDDING_DIM, vector, candidate_k, filter)
            .await
            .map_err(|e| PipelineError::PersistenceError(e.to_string()))?;

        let mut passages: Vec<Passage> = hits
            .into_iter()
            .map(|hit| Passage {
                filename: string_field(&hit.payload, "filename").unwrap_or_else(|| "unknown".into()),
                chunk_id: string_field(&hit.payload, "chunk_id").unwrap_or_else(|| hit.id.clone()),
                document_id: string_field(&hit.payload, "document_id").unwrap_or_else(|| hit.id.clone()),
                text: string_field(&hit.payload, "text").unwrap_or_default(),
                similarity: hit.score,
                rerank_score: None,
            })
            .collect();

        if params.rerank && !passages.is_empty() {
            let texts: Vec<String> = passages.iter().map(|p| p.text.clone()).collect();
            match self.model.rerank(query, &texts).await {
                Ok(scores) => {
                    for (p, score) in passages.iter_mut().zip(scores) {
                        p.rerank_score = Some(score);
                    }
                    passages.retain(|p| p.rerank_score.map(|s| s > self.score_floor).unwrap_or(true));
                    passages.sort_by(|a, b| {
                        let sa = a.rerank_score.unwrap_or(f32::MIN);
                        let sb = b.rerank_score.unwrap_or(f32::MIN);
                        sb.partial_cmp(&sa)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then_with(|| b.similarity.partial_cmp(&a.similarity).unwrap_or(std::cmp::Ordering::Equal))
                    });
                }
                Err(e) => {
                    warn!("rerank failed, falling back to cosine order: {e}");
                }
            }
        }

        let deduped = dedup(passages, self.dedup_epsilon);
        let truncated: Vec<Passage> = deduped.into_iter().take(final_k).collect();
        let formatted = format_passages(&truncated);

        Ok(RetrievalResult { formatted, passages: truncated })
    }
}

fn permission_filter(permission: Permission) -> Option<Filter> {
    match permission {
        Permission::Admin => None,
        Permission::User => Some(Filter::should([
            Condition::matches("permission", 0_i64),
            Condition::is_empty("permission"),
        ])),
    }
}

fn string_field(payload: &std::collections::HashMap<String, Value>, key: &str) -> Option<String> {
    payload.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

/// Drop passages whose score and text are both near-identical to one already kept.
fn dedup(passages: Vec<Passage>, epsilon: f32) -> Vec<Passage> {
    let mut kept: Vec<Passage> = Vec::with_capacity(passages.len());
    for candidate in passages {
        let score = candidate.rerank_score.unwrap_or(candidate.similarity);
        let is_dup = kept.iter().any(|k| {
            let kept_score = k.rerank_score.unwrap_or(k.similarity);
            (score - kept_score).abs() < epsilon && near_identical_text(&candidate.text, &k.text)
        });
        if !is_dup {
            kept.push(candidate);
        }
    }
    kept
}

fn near_identical_text(a: &str, b: &str) -> bool {
    let (shorter, longer) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    if longer.is_empty() {
        return true;
    }
    let ratio = shorter.len() as f32 / longer.len() as f32;
    if ratio < ragchat_core::DEDUP_LENGTH_RATIO {
        return false;
    }
    char_overlap(a, b) >= ragchat_core::DEDUP_CHAR_OVERLAP
}

fn char_overlap(a: &str, b: &str) -> f32 {
    use std::collections::HashMap;
    let mut counts: HashMap<char, i32> = HashMap::new();
    for c in a.chars() {
        *counts.entry(c).or_insert(0) += 1;
    }
    let mut shared = 0usize;
    let mut total_b = 0usize;
    for c in b.chars() {
        total_b += 1;
        if let Some(n) = counts.get_mut(&c) {
            if *n > 0 {
                *n -= 1;
                shared += 1;
            }
        }
    }
    if total_b == 0 {
        return 1.0;
    }
    shared as f32 / total_b.max(a.chars().count()) as f32
}

fn format_passages(passages: &[Passage]) -> String {
    passages
        .iter()
        .map(|p| format!("[doc: {}#{}]\n{}", p.filename, p.chunk_id, p.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passage(text: &str, score: f32) -> Passage {
        Passage {
            filename: "doc.txt".into(),
            chunk_id: "1".into(),
            document_id: "doc".into(),
            text: text.into(),
            similarity: score,
            rerank_score: Some(score),
        }
    }

    #[test]
    fn format_joins_with_blank_line() {
        let passages = vec![passage("alpha", 1.0), passage("beta", 0.9)];
        let formatted = format_passages(&passages);
        assert!(formatted.contains("[doc: doc.txt#1]\nalpha"));
        assert!(formatted.contains("\n\n[doc: doc.txt#1]\nbeta"));
    }

    #[test]
    fn dedup_drops_near_identical_close_scores() {
        let passages = vec![passage("the quick brown fox", 0.90), passage("the quick brown fox!", 0.895)];
        let kept = dedup(passages, 0.02);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn dedup_keeps_distinct_text_even_with_close_scores() {
        let passages = vec![passage("alpha content here", 0.90), passage("totally different passage", 0.895)];
        let kept = dedup(passages, 0.02);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn near_identical_requires_both_ratio_and_overlap() {
        assert!(near_identical_text("hello world", "hello world"));
        assert!(!near_identical_text("hello world", "totally unrelated sentence"));
    }

    #[test]
    fn permission_filter_is_none_for_admin() {
        assert!(permission_filter(Permission::Admin).is_none());
        assert!(permission_filter(Permission::User).is_some());
    }
}
