//! The one built-in tool the core gives real semantics to: it wraps the
//! retriever (C3) and records citations on a side channel the ReAct engine
//! reads back after each invocation (spec §4.4, §4.5 documents event).

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{ArgSpec, ArgType, ToolDescriptor, ToolHandler};
use crate::retriever::{Passage, Permission, RetrievalParams, Retriever};

/// Shared with the ReAct engine: every `knowledge_search` invocation appends
/// its passages here so the engine can emit a deduplicated `Documents` event
/// once the loop ends.
#[derive(Clone, Default)]
pub struct CitationSink {
    inner: Arc<Mutex<Vec<Passage>>>,
}

impl CitationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, passages: &[Passage]) {
        self.inner.lock().unwrap().extend_from_slice(passages);
    }

    /// Drain all recorded passages, deduplicated by document id, in the
    /// order each document was first cited.
    pub fn take_deduplicated(&self) -> Vec<Passage> {
        let all = std::mem::take(&mut *self.inner.lock().unwrap());
        let mut seen = std::collections::HashSet::new();
        all.into_iter()
            .filter(|p| seen.insert(p.document_id.clone()))
            .collect()
    }
}

pub struct KnowledgeSearchTool {
    retriever: Arc<Retriever>,
    permission: Permission,
    citations: CitationSink,
}

impl KnowledgeSearchTool {
    pub fn new(retriever: Arc<Retriever>, permission: Permission, citations: CitationSink) -> Self {
        Self { retriever, permission, citations }
    }
}

/// Build the `knowledge_search` tool descriptor bound to one request's
/// permission level and citation sink. Constructed fresh per request by the
/// orchestrator so citations land in the sink the ReAct engine actually
/// drains at the end of that same request.
pub fn descriptor(retriever: Arc<Retriever>, permission: Permission, citations: CitationSink) -> ToolDescriptor {
    ToolDescriptor {
        name: "knowledge_search",
        description: "search the indexed document corpus for passages relevant to a query",
        args: vec![
            ArgSpec { name: "query", ty: ArgType::String, required: true },
            ArgSpec { name: "k", ty: ArgType::Integer, required: false },
        ],
        handler: Arc::new(KnowledgeSearchTool::new(retriever, permission, citations)),
    }
}

#[async_trait]
impl ToolHandler for KnowledgeSearchTool {
    async fn call(&self, args: HashMap<String, Value>) -> anyhow::Result<String> {
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required argument 'query'"))?
            .to_string();
        let k = args.get("k").and_then(|v| v.as_i64()).map(|n| n.max(1) as usize);

        let params = RetrievalParams { candidate_k: None, final_k: k, rerank: true };
        let result = self
            .retriever
            .retrieve(&query, self.permission, params)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;

        self.citations.record(&result.passages);

        if result.formatted.is_empty() {
            Ok("No relevant passages found.".to_string())
        } else {
            Ok(result.formatted)
        }
    }
}
