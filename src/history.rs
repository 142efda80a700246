//! History Manager (spec §4.8, component C8).
//!
//! `load`/`append` are backed by an in-process, TTL-expiring cache keyed
//! `history:{user_id}:{session_id}` (spec §6.3), read-through to the message
//! store on a cold cache — the same shape as the teacher's `FileCache`
//! (`tools/mod.rs`), just keyed by session instead of path. Summarisation is
//! a single non-streaming chat call over the oldest prefix, recursive in
//! that an existing `system-summary` entry it encompasses is folded back in
//! (`SPEC_FULL.md` §3) — there is no hard-reset or multi-section handoff
//! blob here, just one prefix-in, summary-out call.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::PipelineError;
use crate::message_store::{MessageStore, SenderKind};
use crate::model_clients::{ChatMessage, ModelClient};

/// One turn in the working prompt context: sender-kind-filtered to
/// user/assistant/system-summary (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTurn {
    pub role: HistoryRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryRole {
    User,
    Assistant,
    SystemSummary,
}

const SYSTEM_SUMMARY_PREFIX: &str = "[conversation summary]";

struct CacheEntry {
    turns: Vec<HistoryTurn>,
    cached_at: Instant,
}

pub struct HistoryManager {
    cache: RwLock<HashMap<String, CacheEntry>>,
    store: Arc<MessageStore>,
    model: Arc<dyn ModelClient>,
    message_threshold: usize,
    token_threshold: usize,
}

impl HistoryManager {
    pub fn new(store: Arc<MessageStore>, model: Arc<dyn ModelClient>, message_threshold: usize, token_threshold: usize) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            store,
            model,
            message_threshold,
            token_threshold,
        }
    }

    fn cache_key(user_id: &str, session_id: &str) -> String {
        format!("history:{user_id}:{session_id}")
    }

    fn ttl() -> Duration {
        Duration::from_secs(ragchat_core::HISTORY_CACHE_TTL_SECS as u64)
    }

    /// Read-through load: serve from cache if fresh, else reconstruct from
    /// the message store and repopulate the cache.
    pub async fn load(&self, user_id: &str, session_id: &str) -> anyhow::Result<Vec<HistoryTurn>> {
        let key = Self::cache_key(user_id, session_id);
        if let Some(turns) = self.cached(&key) {
            return Ok(turns);
        }

        debug!(session_id, "history cache miss, reconstructing from message store");
        let messages = self.store.messages_for_session(session_id).await?;
        let turns: Vec<HistoryTurn> = messages
            .into_iter()
            .filter_map(|m| {
                let role = match m.sender_kind {
                    SenderKind::User => HistoryRole::User,
                    SenderKind::Assistant => HistoryRole::Assistant,
                    SenderKind::SystemSummary => HistoryRole::SystemSummary,
                };
                Some(HistoryTurn { role, content: m.content })
            })
            .collect();

        self.cache
            .write()
            .unwrap()
            .insert(key, CacheEntry { turns: turns.clone(), cached_at: Instant::now() });
        Ok(turns)
    }

    fn cached(&self, key: &str) -> Option<Vec<HistoryTurn>> {
        let cache = self.cache.read().unwrap();
        let entry = cache.get(key)?;
        if entry.cached_at.elapsed() > Self::ttl() {
            return None;
        }
        Some(entry.turns.clone())
    }

    /// Append a turn to the cache (the message store is written separately
    /// by the stream orchestrator).
    pub fn append(&self, user_id: &str, session_id: &str, role: HistoryRole, content: String) {
        let key = Self::cache_key(user_id, session_id);
        let mut cache = self.cache.write().unwrap();
        let entry = cache.entry(key).or_insert_with(|| CacheEntry { turns: Vec::new(), cached_at: Instant::now() });
        entry.turns.push(HistoryTurn { role, content });
        entry.cached_at = Instant::now();
    }

    /// Evaluate summarisation policy immediately before prompt assembly
    /// (spec §4.8). Returns the history unchanged if under both thresholds.
    pub async fn maybe_summarise(&self, history: Vec<HistoryTurn>) -> Result<Vec<HistoryTurn>, PipelineError> {
        if history.len() < self.message_threshold && estimate_tokens(&history) < self.token_threshold {
            return Ok(history);
        }

        let tail_start = tail_boundary(&history, ragchat_core::SUMMARY_TAIL_TURNS, self.message_threshold, self.token_threshold);
        let (prefix, tail) = history.split_at(tail_start);
        if prefix.is_empty() {
            return Ok(tail.to_vec());
        }

        let summary_text = self.summarise_prefix(prefix).await?;
        let mut result = Vec::with_capacity(tail.len() + 1);
        result.push(HistoryTurn {
            role: HistoryRole::SystemSummary,
            content: format!("{SYSTEM_SUMMARY_PREFIX} {summary_text}"),
        });
        result.extend_from_slice(tail);
        Ok(result)
    }

    async fn summarise_prefix(&self, prefix: &[HistoryTurn]) -> Result<String, PipelineError> {
        let transcript = prefix
            .iter()
            .map(|t| format!("{}: {}", role_label(t.role), t.content))
            .collect::<Vec<_>>()
            .join("\n");

        let messages = vec![
            ChatMessage::system(
                "Summarise the following conversation prefix concisely and neutrally, \
                 preserving facts and decisions a later turn might need. Output only the summary.",
            ),
            ChatMessage::user(transcript),
        ];
        let response = self.model.chat(messages).await?;
        Ok(response.content)
    }

    /// Auto-name policy (spec §4.8): after the first turn pair, ask the chat
    /// model for a short title and rename the session only if it's still
    /// the placeholder.
    pub async fn auto_name(&self, session_id: &str, first_question: &str) -> Result<(), PipelineError> {
        let messages = vec![
            ChatMessage::system(format!(
                "Generate a short title (at most {} characters, no quotes or punctuation at the end) for a conversation that starts with the user's question below.",
                ragchat_core::SESSION_NAME_MAX_CHARS
            )),
            ChatMessage::user(first_question.to_string()),
        ];
        let response = self.model.chat(messages).await?;
        let title: String = response.content.trim().chars().take(ragchat_core::SESSION_NAME_MAX_CHARS).collect();
        self.store
            .rename_if_placeholder(session_id, &title)
            .await
            .map_err(|e| PipelineError::PersistenceError(e.to_string()))?;
        Ok(())
    }
}

fn role_label(role: HistoryRole) -> &'static str {
    match role {
        HistoryRole::User => "User",
        HistoryRole::Assistant => "Assistant",
        HistoryRole::SystemSummary => "Summary",
    }
}

/// Rough token estimate (chars / 4), good enough for a threshold check —
/// the exact tokenizer belongs to the model backend, not this layer.
fn estimate_tokens(history: &[HistoryTurn]) -> usize {
    history.iter().map(|t| t.content.len() / 4).sum()
}

/// Find the prefix/tail split point that keeps the *largest* tail whose
/// message-count and token-count both fit under their thresholds, using
/// `min_tail` only as a floor on how small the tail is allowed to shrink —
/// never as a target. Starts from the whole history as the tail and grows
/// the prefix only as far as the thresholds force it to.
fn tail_boundary(history: &[HistoryTurn], min_tail: usize, message_threshold: usize, token_threshold: usize) -> usize {
    let len = history.len();
    let floor = len.saturating_sub(min_tail);
    let mut boundary = 0;
    while boundary < floor {
        let tail = &history[boundary..];
        if tail.len() <= message_threshold && estimate_tokens(tail) <= token_threshold {
            break;
        }
        boundary += 1;
    }
    boundary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_clients::NonStreamChat;
    use async_trait::async_trait;
    use sqlx::SqlitePool;

    struct StubModel;

    #[async_trait]
    impl ModelClient for StubModel {
        async fn embed(&self, _texts: &[String], _mode: crate::model_clients::EmbedMode) -> Result<Vec<Vec<f32>>, PipelineError> {
            unimplemented!()
        }
        async fn rerank(&self, _query: &str, _passages: &[String]) -> Result<Vec<f32>, PipelineError> {
            unimplemented!()
        }
        async fn chat(&self, _messages: Vec<ChatMessage>) -> Result<NonStreamChat, PipelineError> {
            Ok(NonStreamChat { content: "Trip planning".to_string(), usage: Default::default() })
        }
        async fn chat_stream(
            &self,
            _messages: Vec<ChatMessage>,
            _tools_present: bool,
            _tx: tokio::sync::mpsc::Sender<crate::model_clients::StreamEvent>,
        ) -> Result<(), PipelineError> {
            unimplemented!()
        }
    }

    async fn manager() -> HistoryManager {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = Arc::new(MessageStore::new(pool).await.unwrap());
        HistoryManager::new(store, Arc::new(StubModel), 10, 6400)
    }

    #[tokio::test]
    async fn append_then_load_round_trips_within_ttl() {
        let mgr = manager().await;
        mgr.append("u1", "s1", HistoryRole::User, "hello".to_string());
        let turns = mgr.load("u1", "s1").await.unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].content, "hello");
    }

    #[tokio::test]
    async fn maybe_summarise_is_noop_under_thresholds() {
        let mgr = manager().await;
        let history = vec![HistoryTurn { role: HistoryRole::User, content: "hi".into() }];
        let out = mgr.maybe_summarise(history.clone()).await.unwrap();
        assert_eq!(out, history);
    }

    #[tokio::test]
    async fn maybe_summarise_compresses_prefix_and_keeps_tail_verbatim() {
        let mgr = manager().await;
        let mut history = Vec::new();
        for i in 0..12 {
            history.push(HistoryTurn { role: HistoryRole::User, content: format!("turn {i}") });
        }
        let out = mgr.maybe_summarise(history).await.unwrap();
        assert!(matches!(out[0].role, HistoryRole::SystemSummary));
        assert!(out.last().unwrap().content.contains("turn 11"));
    }

    #[tokio::test]
    async fn auto_name_only_overwrites_placeholder() {
        let mgr = manager().await;
        let session = mgr.store.create_session("u1").await.unwrap();
        mgr.auto_name(&session.id, "What's the weather in Tokyo?").await.unwrap();
        let renamed = mgr.store.rename_if_placeholder(&session.id, "Something else").await.unwrap();
        assert!(!renamed);
    }
}
