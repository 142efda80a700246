//! Stream Orchestrator (spec §4.7, component C7).
//!
//! Per-incoming-message state machine: resolves the session, persists the
//! user turn, probes the QA cache, loads/summarises history, assembles the
//! prompt, runs the ReAct engine on a background task while draining its
//! event bus into the HTTP response, then persists results. A soft
//! per-request deadline wraps the whole thing (SPEC_FULL.md §3).

use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::error::PipelineError;
use crate::event_bus::{self, Consumed, EventBusConsumer};
use crate::history::{HistoryManager, HistoryRole, HistoryTurn};
use crate::message_store::{DocumentCitation, ExtraData, MessageStore, SenderKind};
use crate::model_clients::{ChatMessage, ModelClient};
use crate::qa_cache::{CachedCitation, QaCache};
use crate::react_engine::ReactEngine;
use crate::retriever::{Permission, Retriever};
use crate::tools::knowledge_search::{self, CitationSink};
use crate::tools::ToolRegistry;
use crate::wire::{DocumentRef, WireEvent};

pub struct IncomingMessage {
    pub content: String,
    pub user_id: String,
    pub session_id: Option<String>,
    pub show_thinking: bool,
    pub skip_cache: bool,
    pub permission: Permission,
    pub attached_text: Option<String>,
    pub location: Option<serde_json::Value>,
    /// Id of a prior assistant message to replace in place, instead of
    /// appending a new one (spec §6.1 `regenerate_message_id`).
    pub regenerate_message_id: Option<String>,
}

pub struct OrchestratorConfig {
    pub cache_hit_threshold: f32,
    pub request_deadline_secs: u64,
    pub candidate_k: usize,
    pub final_k: usize,
    pub max_iterations: usize,
    pub observation_limit: usize,
    pub tool_timeout_secs: u64,
}

pub struct Orchestrator {
    store: Arc<MessageStore>,
    history: Arc<HistoryManager>,
    qa_cache: Arc<QaCache>,
    model: Arc<dyn ModelClient>,
    retriever: Arc<Retriever>,
    /// External, stateless tools shared across every request. `knowledge_search`
    /// is deliberately absent here: it's registered fresh per request (below),
    /// bound to that request's own [`CitationSink`] and permission level.
    base_tools: Arc<ToolRegistry>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<MessageStore>,
        history: Arc<HistoryManager>,
        qa_cache: Arc<QaCache>,
        model: Arc<dyn ModelClient>,
        retriever: Arc<Retriever>,
        base_tools: Arc<ToolRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        Self { store, history, qa_cache, model, retriever, base_tools, config }
    }

    /// Drive one request to completion, writing wire events via `emit`.
    /// `emit` returns `Err` on write failure (client disconnect); the
    /// orchestrator treats that as cancellation and keeps draining until the
    /// reasoner (if any) exits, without writing any further events itself.
    pub async fn handle<F, Fut>(&self, msg: IncomingMessage, mut emit: F)
    where
        F: FnMut(WireEvent) -> Fut,
        Fut: std::future::Future<Output = Result<(), ()>>,
    {
        let deadline = Duration::from_secs(self.config.request_deadline_secs);
        match tokio::time::timeout(deadline, self.run(msg, &mut emit)).await {
            Ok(()) => {}
            Err(_) => {
                warn!("request exceeded soft deadline");
                let _ = emit(WireEvent::Error {
                    message: "request exceeded soft deadline".to_string(),
                    kind: Some("BackendTimeout".to_string()),
                })
                .await;
                let _ = emit(WireEvent::Done { session_id: String::new() }).await;
            }
        }
    }

    /// Record user feedback on a previously answered message (spec §4.9
    /// `record_feedback`). A no-op if the message wasn't cache-sourced.
    pub async fn record_feedback(&self, message_id: &str, kind: crate::qa_cache::FeedbackKind) -> Result<(), PipelineError> {
        let message = self
            .store
            .get_message(message_id)
            .await
            .map_err(|e| PipelineError::PersistenceError(e.to_string()))?
            .ok_or_else(|| PipelineError::ValidationError(format!("no such message: {message_id}")))?;

        let Some(thought_chain_id) = message.extra_data.thought_chain_id else {
            return Ok(());
        };
        self.qa_cache.record_feedback(&thought_chain_id, kind).await
    }

    async fn run<F, Fut>(&self, msg: IncomingMessage, emit: &mut F)
    where
        F: FnMut(WireEvent) -> Fut,
        Fut: std::future::Future<Output = Result<(), ()>>,
    {
        // 1. Session resolution.
        let (session_id, is_new_session) = match &msg.session_id {
            Some(id) => (id.clone(), false),
            None => {
                let session = match self.store.create_session(&msg.user_id).await {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = emit(WireEvent::Error { message: e.to_string(), kind: Some("PersistenceError".into()) }).await;
                        let _ = emit(WireEvent::Done { session_id: String::new() }).await;
                        return;
                    }
                };
                let _ = emit(WireEvent::SessionCreated {
                    session_id: session.id.clone(),
                    session_name: session.name.clone(),
                })
                .await;
                (session.id, true)
            }
        };

        // 2. Persist user message.
        let user_content = match &msg.attached_text {
            Some(extra) => format!("{}\n\n{}", msg.content, extra),
            None => msg.content.clone(),
        };
        let mut user_extra = ExtraData::default();
        user_extra.location = msg.location.clone();
        let user_message = match self.store.insert_message(&session_id, SenderKind::User, &user_content, &user_extra).await {
            Ok(m) => m,
            Err(e) => {
                let _ = emit(WireEvent::Error { message: e.to_string(), kind: Some("PersistenceError".into()) }).await;
                let _ = emit(WireEvent::Done { session_id }).await;
                return;
            }
        };
        let _ = emit(WireEvent::UserMessageSaved { uuid: user_message.id.clone(), content: user_content.clone() }).await;

        // 3. Regenerate invalidation: if replacing a cache-sourced answer,
        // drop its QA-cache entry and bypass the cache probe for this
        // request, before the pipeline (and any cache lookup) runs — a
        // stale cache hit would just replay the answer being regenerated.
        let mut skip_cache = msg.skip_cache;
        if let Some(old_id) = &msg.regenerate_message_id {
            match self.store.get_message(old_id).await {
                Ok(Some(old)) if old.extra_data.cache_sourced => {
                    if let Some(thought_chain_id) = &old.extra_data.thought_chain_id {
                        if let Err(e) = self.qa_cache.delete(thought_chain_id).await {
                            warn!("failed to invalidate qa cache entry for regenerated message: {e}");
                        }
                    }
                    skip_cache = true;
                }
                Ok(_) => {}
                Err(e) => warn!("failed to look up message being regenerated: {e}"),
            }
        }

        // 4. Cache probe.
        if !skip_cache {
            match self.qa_cache.lookup(&msg.content).await {
                Ok(Some(hit)) if hit.score >= self.config.cache_hit_threshold => {
                    self.stream_cached_hit(&msg.user_id, &session_id, &user_content, hit, emit).await;
                    return;
                }
                Ok(_) => {}
                Err(e) => warn!("qa cache lookup failed, continuing without cache: {e}"),
            }
        }

        // 5. History load + summarisation.
        let history = match self.history.load(&msg.user_id, &session_id).await {
            Ok(h) => h,
            Err(e) => {
                warn!("history load failed, continuing with empty history: {e}");
                Vec::new()
            }
        };
        let history = match self.history.maybe_summarise(history).await {
            Ok(h) => h,
            Err(e) => {
                warn!("summarisation failed, using unsummarised history: {e}");
                Vec::new()
            }
        };

        // 6. Per-request tool registry: the shared external tools plus a
        // `knowledge_search` bound to this request's own citation sink, so
        // the ReAct engine drains exactly the citations its own tool calls
        // recorded.
        let citations = CitationSink::new();
        let mut tools = (*self.base_tools).clone();
        tools.register(knowledge_search::descriptor(self.retriever.clone(), msg.permission, citations.clone()));
        let tools = Arc::new(tools);

        let system_prompt = self.system_prompt(&tools);
        let mut messages = vec![ChatMessage::system(system_prompt)];
        messages.extend(history.iter().map(turn_to_chat_message));
        messages.push(ChatMessage::user(user_content.clone()));

        // 7. Spawn reasoner, 8. drain loop.
        let (producer, mut consumer) = event_bus::channel(ragchat_core::EVENT_BUS_MIN_CAPACITY);
        let engine = ReactEngine::new(
            self.model.clone(),
            tools,
            self.config.max_iterations,
            self.config.observation_limit,
            self.config.tool_timeout_secs,
        );

        let reasoner_handle = {
            let producer = producer;
            let citations = citations.clone();
            tokio::spawn(async move { engine.run(messages, &producer, &citations).await })
        };

        let mut answer_text = String::new();
        let mut thoughts = Vec::new();
        let mut actions = Vec::new();
        let mut observations = Vec::new();
        let mut documents: Vec<DocumentCitation> = Vec::new();
        let mut had_error = false;
        let mut disconnected = false;

        let drain_result = self.drain(&mut consumer, msg.show_thinking, emit, &mut DrainState {
            answer_text: &mut answer_text,
            thoughts: &mut thoughts,
            actions: &mut actions,
            observations: &mut observations,
            documents: &mut documents,
            had_error: &mut had_error,
            disconnected: &mut disconnected,
        })
        .await;
        let _ = drain_result;

        let outcome = reasoner_handle.await;

        if disconnected {
            // Client gone: update history with the user turn only, persist nothing else.
            self.history.append(&msg.user_id, &session_id, HistoryRole::User, user_content);
            return;
        }

        // Prefer the engine's own bookkeeping (thoughts/actions/observations
        // accumulated server-side) over what happened to cross the wire,
        // since `show_thinking=false` suppresses the wire events, not the record.
        if let Ok(outcome) = outcome {
            if answer_text.is_empty() {
                answer_text = outcome.answer;
            }
            thoughts = outcome.thoughts;
            actions = outcome.actions;
            observations = outcome.observations;
        }

        // 9. Persist assistant message, replacing a prior one in place if requested.
        if let Some(old_id) = &msg.regenerate_message_id {
            if let Err(e) = self.store.delete_message(old_id).await {
                warn!("failed to delete message being regenerated: {e}");
            }
        }
        let cache_eligible = !answer_text.is_empty() && !had_error;
        let thought_chain_id = cache_eligible.then(|| QaCache::thought_chain_id(&msg.content, &answer_text));
        let extra_data = ExtraData {
            thoughts,
            actions,
            observations,
            documents: documents.clone(),
            file_info: None,
            location: None,
            cache_sourced: false,
            thought_chain_id: thought_chain_id.clone(),
        };
        match self.store.insert_message(&session_id, SenderKind::Assistant, &answer_text, &extra_data).await {
            Ok(assistant_message) => {
                let _ = emit(WireEvent::AiMessageSaved { uuid: assistant_message.id, content: answer_text.clone() }).await;
            }
            Err(e) => {
                had_error = true;
                let _ = emit(WireEvent::Error { message: e.to_string(), kind: Some("PersistenceError".into()) }).await;
            }
        }

        // 10. Cache write.
        if let Some(thought_chain_id) = thought_chain_id.filter(|_| !had_error) {
            let cached_citations: Vec<CachedCitation> =
                documents.iter().map(|d| CachedCitation { uuid: d.uuid.clone(), name: d.name.clone() }).collect();
            if let Err(e) = self.qa_cache.upsert(&thought_chain_id, &msg.content, &answer_text, &cached_citations, 0).await {
                warn!("qa cache upsert failed: {e}");
            }
        }

        // 11. History update.
        self.history.append(&msg.user_id, &session_id, HistoryRole::User, user_content);
        self.history.append(&msg.user_id, &session_id, HistoryRole::Assistant, answer_text.clone());

        let _ = emit(WireEvent::Done { session_id: session_id.clone() }).await;

        // 12. Background auto-name job.
        if is_new_session {
            let history_mgr = self.history.clone();
            let session_id = session_id.clone();
            let first_question = msg.content.clone();
            tokio::spawn(async move {
                if let Err(e) = history_mgr.auto_name(&session_id, &first_question).await {
                    warn!("auto-name job failed: {e}");
                }
            });
        }
    }

    async fn stream_cached_hit<F, Fut>(
        &self,
        user_id: &str,
        session_id: &str,
        user_content: &str,
        hit: crate::qa_cache::CacheHit,
        emit: &mut F,
    ) where
        F: FnMut(WireEvent) -> Fut,
        Fut: std::future::Future<Output = Result<(), ()>>,
    {
        const CHUNK_CHARS: usize = 12;
        let chars: Vec<char> = hit.answer.chars().collect();
        for chunk in chars.chunks(CHUNK_CHARS) {
            if emit(WireEvent::AnswerChunk { text: chunk.iter().collect() }).await.is_err() {
                break;
            }
        }

        if !hit.citations.is_empty() {
            let documents = hit
                .citations
                .iter()
                .map(|c| DocumentRef { uuid: c.uuid.clone(), name: c.name.clone() })
                .collect();
            let _ = emit(WireEvent::Documents { documents }).await;
        }

        let extra_data = ExtraData {
            cache_sourced: true,
            documents: hit.citations.iter().map(|c| DocumentCitation { uuid: c.uuid.clone(), name: c.name.clone() }).collect(),
            thought_chain_id: Some(hit.thought_chain_id.clone()),
            ..Default::default()
        };
        match self.store.insert_message(session_id, SenderKind::Assistant, &hit.answer, &extra_data).await {
            Ok(assistant_message) => {
                let _ = emit(WireEvent::AiMessageSaved { uuid: assistant_message.id, content: hit.answer.clone() }).await;
            }
            Err(e) => {
                let _ = emit(WireEvent::Error { message: e.to_string(), kind: Some("PersistenceError".into()) }).await;
            }
        }

        self.history.append(user_id, session_id, HistoryRole::User, user_content.to_string());
        self.history.append(user_id, session_id, HistoryRole::Assistant, hit.answer);

        let _ = emit(WireEvent::Done { session_id: session_id.to_string() }).await;
    }

    async fn drain<F, Fut>(
        &self,
        consumer: &mut EventBusConsumer,
        show_thinking: bool,
        emit: &mut F,
        state: &mut DrainState<'_>,
    ) -> Result<(), ()>
    where
        F: FnMut(WireEvent) -> Fut,
        Fut: std::future::Future<Output = Result<(), ()>>,
    {
        loop {
            match consumer.consume().await {
                Consumed::Finished => return Ok(()),
                Consumed::Empty => continue,
                Consumed::Event(event) => {
                    self.record(&event, state);
                    if event.is_reasoning_trace() && !show_thinking {
                        continue;
                    }
                    if emit(event).await.is_err() {
                        *state.disconnected = true;
                        consumer.cancel("client disconnected");
                        // Keep draining (discarding) so the reasoner observes
                        // cancellation and exits; don't write anything further.
                        while !matches!(consumer.consume().await, Consumed::Finished) {}
                        return Err(());
                    }
                }
            }
        }
    }

    fn record(&self, event: &WireEvent, state: &mut DrainState<'_>) {
        match event {
            WireEvent::AnswerChunk { text } => state.answer_text.push_str(text),
            WireEvent::Thought { content } => state.thoughts.push(content.clone()),
            WireEvent::Action { content } => state.actions.push(content.clone()),
            WireEvent::Observation { content } => state.observations.push(content.clone()),
            WireEvent::Documents { documents } => {
                state.documents.extend(documents.iter().map(|d| DocumentCitation { uuid: d.uuid.clone(), name: d.name.clone() }));
            }
            WireEvent::Error { .. } => *state.had_error = true,
            _ => {}
        }
    }

    fn system_prompt(&self, tools: &ToolRegistry) -> String {
        format!(
            "You are a retrieval-augmented assistant. Use the following tools when helpful:\n{}\n\n\
             Respond using this exact format, one tag per line:\n\
             Thought: <reasoning>\nAction: <tool>(<arguments>)\n...\nAnswer: <final answer>\n\
             Never write an 'Observation:' line yourself; it will be filled in for you.",
            tools.describe_all()
        )
    }
}

struct DrainState<'a> {
    answer_text: &'a mut String,
    thoughts: &'a mut Vec<String>,
    actions: &'a mut Vec<String>,
    observations: &'a mut Vec<String>,
    documents: &'a mut Vec<DocumentCitation>,
    had_error: &'a mut bool,
    disconnected: &'a mut bool,
}

fn turn_to_chat_message(turn: &HistoryTurn) -> ChatMessage {
    match turn.role {
        HistoryRole::User => ChatMessage::user(turn.content.clone()),
        HistoryRole::Assistant => ChatMessage::assistant(turn.content.clone()),
        HistoryRole::SystemSummary => ChatMessage::system(turn.content.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::model_clients::{EmbedMode, NonStreamChat, Role, StreamEvent};
    use crate::qa_cache::{CacheHit, CachedCitation, QaCache};
    use async_trait::async_trait;
    use sqlx::SqlitePool;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc::Sender;

    /// `chat_stream_delay` lets the deadline test hold the reasoner open past
    /// the configured soft deadline without a real model backend.
    struct StubModel {
        chat_stream_delay: Option<Duration>,
    }

    #[async_trait]
    impl ModelClient for StubModel {
        async fn embed(&self, _texts: &[String], _mode: EmbedMode) -> Result<Vec<Vec<f32>>, PipelineError> {
            unimplemented!()
        }
        async fn rerank(&self, _query: &str, _passages: &[String]) -> Result<Vec<f32>, PipelineError> {
            unimplemented!()
        }
        async fn chat(&self, _messages: Vec<ChatMessage>) -> Result<NonStreamChat, PipelineError> {
            unimplemented!()
        }
        async fn chat_stream(&self, _messages: Vec<ChatMessage>, _tools_present: bool, _tx: Sender<StreamEvent>) -> Result<(), PipelineError> {
            if let Some(delay) = self.chat_stream_delay {
                tokio::time::sleep(delay).await;
            }
            Ok(())
        }
    }

    /// `VectorStoreAdapter::connect` only builds a lazily-connecting client,
    /// so a bogus URL is safe here: none of these tests exercise a code path
    /// that issues an RPC against it (cache probing is bypassed via
    /// `skip_cache`, and `stream_cached_hit` is driven directly).
    async fn test_orchestrator(model: Arc<dyn ModelClient>, request_deadline_secs: u64) -> Orchestrator {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = Arc::new(MessageStore::new(pool).await.unwrap());
        let history = Arc::new(HistoryManager::new(store.clone(), model.clone(), 10, 6400));
        let vector_store = Arc::new(ragchat_core::vector_store::VectorStoreAdapter::connect("http://localhost:1").unwrap());
        let qa_cache = Arc::new(QaCache::new(vector_store.clone(), model.clone(), 0.9, 3));
        let retriever = Arc::new(Retriever::new(vector_store, model.clone(), 20, 5, 0.0, 0.02));
        let base_tools = Arc::new(ToolRegistry::new());
        Orchestrator::new(
            store,
            history,
            qa_cache,
            model,
            retriever,
            base_tools,
            OrchestratorConfig {
                cache_hit_threshold: 0.9,
                request_deadline_secs,
                candidate_k: 20,
                final_k: 5,
                max_iterations: 4,
                observation_limit: 2000,
                tool_timeout_secs: 10,
            },
        )
    }

    fn collector() -> (Arc<StdMutex<Vec<WireEvent>>>, impl FnMut(WireEvent) -> std::future::Ready<Result<(), ()>>) {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = events.clone();
        let emit = move |event: WireEvent| {
            sink.lock().unwrap().push(event);
            std::future::ready(Ok(()))
        };
        (events, emit)
    }

    #[tokio::test]
    async fn stream_cached_hit_chunks_answer_and_emits_documents() {
        let orch = test_orchestrator(Arc::new(StubModel { chat_stream_delay: None }), 30).await;
        let hit = CacheHit {
            thought_chain_id: "tcid".to_string(),
            question: "question".to_string(),
            answer: "a".repeat(30),
            citations: vec![CachedCitation { uuid: "u1".into(), name: "doc.txt".into() }],
            dislike_count: 0,
            score: 0.95,
        };
        let (events, mut emit) = collector();
        orch.stream_cached_hit("user1", "session1", "question", hit, &mut emit).await;

        let events = events.lock().unwrap();
        let chunks: String = events
            .iter()
            .filter_map(|e| match e {
                WireEvent::AnswerChunk { text } => Some(text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(chunks, "a".repeat(30));
        assert!(events.iter().any(|e| matches!(e, WireEvent::Documents { documents } if documents.len() == 1)));
        assert!(matches!(events.last(), Some(WireEvent::Done { session_id }) if session_id == "session1"));
    }

    #[tokio::test]
    async fn stream_cached_hit_skips_documents_event_without_citations() {
        let orch = test_orchestrator(Arc::new(StubModel { chat_stream_delay: None }), 30).await;
        let hit = CacheHit {
            thought_chain_id: "tcid".to_string(),
            question: "question".to_string(),
            answer: "short answer".to_string(),
            citations: Vec::new(),
            dislike_count: 0,
            score: 0.95,
        };
        let (events, mut emit) = collector();
        orch.stream_cached_hit("user1", "session1", "question", hit, &mut emit).await;
        assert!(!events.lock().unwrap().iter().any(|e| matches!(e, WireEvent::Documents { .. })));
    }

    #[tokio::test]
    async fn handle_emits_backend_timeout_when_soft_deadline_exceeded() {
        let orch = test_orchestrator(Arc::new(StubModel { chat_stream_delay: Some(Duration::from_secs(5)) }), 1).await;
        let msg = IncomingMessage {
            content: "hello".into(),
            user_id: "u1".into(),
            session_id: Some("s1".into()),
            show_thinking: true,
            skip_cache: true,
            permission: Permission::User,
            attached_text: None,
            location: None,
            regenerate_message_id: None,
        };
        let (events, emit) = collector();
        orch.handle(msg, emit).await;

        let events = events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(e, WireEvent::Error { kind: Some(k), .. } if k == "BackendTimeout")));
        assert!(matches!(events.last(), Some(WireEvent::Done { .. })));
    }

    #[tokio::test]
    async fn record_feedback_is_noop_for_message_without_thought_chain_id() {
        let orch = test_orchestrator(Arc::new(StubModel { chat_stream_delay: None }), 30).await;
        let session = orch.store.create_session("u1").await.unwrap();
        let message = orch
            .store
            .insert_message(&session.id, SenderKind::Assistant, "not cache-sourced", &ExtraData::default())
            .await
            .unwrap();

        // No thought_chain_id on the message, so this must return without
        // touching the QA cache (whose vector store points at a bogus URL).
        orch.record_feedback(&message.id, crate::qa_cache::FeedbackKind::Negative).await.unwrap();
    }

    #[tokio::test]
    async fn record_feedback_errors_for_unknown_message() {
        let orch = test_orchestrator(Arc::new(StubModel { chat_stream_delay: None }), 30).await;
        let err = orch.record_feedback("missing", crate::qa_cache::FeedbackKind::Positive).await.unwrap_err();
        assert!(matches!(err, PipelineError::ValidationError(_)));
    }

    #[test]
    fn turn_to_chat_message_maps_roles() {
        let user = turn_to_chat_message(&HistoryTurn { role: HistoryRole::User, content: "hi".into() });
        assert!(matches!(user.role, Role::User));
        let assistant = turn_to_chat_message(&HistoryTurn { role: HistoryRole::Assistant, content: "hi".into() });
        assert!(matches!(assistant.role, Role::Assistant));
        let summary = turn_to_chat_message(&HistoryTurn { role: HistoryRole::SystemSummary, content: "hi".into() });
        assert!(matches!(summary.role, Role::System));
    }
}
