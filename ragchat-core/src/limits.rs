//! Shared limits and thresholds
//!
//! Centralized constants to prevent drift between the retriever, the
//! ReAct engine and the orchestrator.

/// Dimension of the embedding model used for the document corpus and the QA cache.
pub const EMBEDDING_DIM: u64 = 1024;

/// HTTP timeout for external model-backend calls.
pub const HTTP_TIMEOUT_SECS: u64 = 30;

/// Retry attempts left to the *caller* of a model client; the client itself never retries.
pub const EMBED_RETRY_ATTEMPTS: u32 = 0;

/// Default candidate pool size fetched from the vector store before rerank/dedup.
pub const DEFAULT_CANDIDATE_K: usize = 15;

/// Default number of passages returned to the caller after rerank/dedup.
pub const DEFAULT_FINAL_K: usize = 5;

/// Rerank scores at or below this sentinel are filtered out (spec: reserved `-inf`, practice `-100`).
pub const DEFAULT_SCORE_FLOOR: f32 = -100.0;

/// Two passages within this rerank/distance delta are candidates for dedup.
pub const DEFAULT_DEDUP_EPSILON: f32 = 0.02;

/// Minimum length-ratio for two chunks to be considered near-identical during dedup.
pub const DEDUP_LENGTH_RATIO: f32 = 0.98;

/// Minimum character-overlap ratio for two chunks to be considered near-identical during dedup.
pub const DEDUP_CHAR_OVERLAP: f32 = 0.98;

/// Cosine-similarity threshold above which a QA-cache lookup counts as a hit.
pub const DEFAULT_CACHE_HIT_THRESHOLD: f32 = 0.95;

/// Negative-feedback count at which a QA-cache entry is invalidated.
pub const DEFAULT_DISLIKE_INVALIDATE: u32 = 1;

/// Conversation-history message-count threshold that triggers summarisation.
pub const DEFAULT_MESSAGE_THRESHOLD: usize = 10;

/// Conversation-history token-count threshold that triggers summarisation.
pub const DEFAULT_TOKEN_THRESHOLD: usize = 6400;

/// Number of most-recent turns always kept verbatim in the tail after summarisation.
pub const SUMMARY_TAIL_TURNS: usize = 4;

/// Maximum ReAct loop iterations before forcing a best-effort answer.
pub const DEFAULT_MAX_ITERATIONS: usize = 5;

/// Default soft truncation limit for a tool observation, in characters.
pub const DEFAULT_OBSERVATION_LIMIT: usize = 10_000;

/// Minimum required capacity of the event bus (spec §4.6).
pub const EVENT_BUS_MIN_CAPACITY: usize = 1024;

/// Timeout applied to a single `publish` attempt on the event bus before a
/// non-critical event (e.g. an intermediate `Thought`) is dropped.
pub const EVENT_BUS_PUBLISH_TIMEOUT_MS: u64 = 250;

/// Per-request soft deadline enforced by the orchestrator.
pub const DEFAULT_REQUEST_DEADLINE_SECS: u64 = 120;

/// Per-tool-invocation deadline.
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 30;

/// History cache entry expiry (spec §6.3: "expiry >= 24h").
pub const HISTORY_CACHE_TTL_SECS: i64 = 24 * 60 * 60;

/// Maximum length of an auto-generated session title.
pub const SESSION_NAME_MAX_CHARS: usize = 20;

/// Cap on inlined attached-file extracted text.
pub const ATTACHED_FILE_TEXT_CAP_CHARS: usize = 20_000;
