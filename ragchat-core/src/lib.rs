//! ragchat-core - shared utilities for the ragchat pipeline
//!
//! - **limits**: shared constants and thresholds
//! - **excerpts** (feature): text excerpting and UTF-8 helpers
//! - **vector** (feature): thin adapter over Qdrant shared by the retriever and the QA cache
//! - **sse**: incremental Server-Sent-Events frame decoder for streaming chat backends
//!
//! # Feature Flags
//!
//! - `excerpts` - text excerpting and UTF-8 helpers (lightweight)
//! - `vector` - vector store adapter (requires qdrant-client)
//! - `full` - all features

pub mod limits;
pub mod sse;

#[cfg(feature = "excerpts")]
pub mod excerpts;

#[cfg(feature = "vector")]
pub mod vector_store;

pub use limits::*;

#[cfg(feature = "excerpts")]
pub use excerpts::{safe_utf8_slice, truncate_with_ellipsis};

#[cfg(feature = "vector")]
pub use vector_store::{MetadataBuilder, VectorHit, VectorStoreAdapter};
