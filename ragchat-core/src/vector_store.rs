//! Thin adapter over Qdrant shared by the retriever (document corpus) and the
//! QA cache (question/answer collection).
//!
//! Generalised from a single-purpose semantic-search client: this module
//! knows nothing about embeddings or models, only about collections, points
//! and filtered search. Callers hand it already-computed vectors.

use anyhow::{Context, Result};
use qdrant_client::qdrant::{
    CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter, PointStruct,
    SearchPointsBuilder, UpsertPointsBuilder, Value as QdrantValue, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tracing::{debug, info};

/// A point to upsert: a caller-chosen string id, its vector, and scalar metadata.
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: HashMap<String, Value>,
}

/// A search result: the original string id, the similarity score, and the payload.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    pub score: f32,
    pub payload: HashMap<String, Value>,
}

/// Adapter over a single Qdrant instance, shared process-wide.
///
/// Safe for concurrent use: the inner client pools its own connections; the
/// `ensured` set only short-circuits collection creation, it never gates
/// concurrent reads/writes.
pub struct VectorStoreAdapter {
    qdrant: Qdrant,
    ensured: RwLock<HashSet<String>>,
}

impl VectorStoreAdapter {
    pub fn connect(url: &str) -> Result<Self> {
        let qdrant = Qdrant::from_url(url)
            .skip_compatibility_check()
            .build()
            .with_context(|| format!("failed to build Qdrant client for {url}"))?;
        Ok(Self {
            qdrant,
            ensured: RwLock::new(HashSet::new()),
        })
    }

    /// Create the collection if it doesn't exist yet (cosine distance, fixed dim).
    /// Idempotent and cheap to call before every query/write: the collection is
    /// "loaded" the moment the client addresses it, so this is the only
    /// load-hiding step the adapter needs to perform (spec §4.2).
    pub async fn ensure_collection(&self, collection: &str, dim: u64) -> Result<()> {
        if self.ensured.read().unwrap().contains(collection) {
            return Ok(());
        }

        let exists = self.qdrant.collection_exists(collection).await?;
        if !exists {
            info!("creating vector collection {collection}");
            self.qdrant
                .create_collection(
                    CreateCollectionBuilder::new(collection)
                        .vectors_config(VectorParamsBuilder::new(dim, Distance::Cosine)),
                )
                .await
                .with_context(|| format!("failed to create collection {collection}"))?;
        }
        self.ensured.write().unwrap().insert(collection.to_string());
        Ok(())
    }

    /// Upsert a batch of points. Idempotent on id: the same string id always
    /// hashes to the same point id, so re-upserting replaces rather than duplicates.
    pub async fn upsert(&self, collection: &str, dim: u64, points: Vec<VectorPoint>) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        self.ensure_collection(collection, dim).await?;

        let structs: Vec<PointStruct> = points
            .into_iter()
            .map(|p| {
                let mut payload: HashMap<String, QdrantValue> = HashMap::new();
                payload.insert("_id".to_string(), p.id.clone().into());
                for (key, value) in p.payload {
                    if let Some(qv) = json_to_qdrant(value) {
                        payload.insert(key, qv);
                    }
                }
                PointStruct::new(hash_id(&p.id), p.vector, payload)
            })
            .collect();

        self.qdrant
            .upsert_points(UpsertPointsBuilder::new(collection, structs).wait(true))
            .await
            .context("upsert failed")?;
        debug!("upserted batch into {collection}");
        Ok(())
    }

    /// Vector search with an optional scalar-field filter. Returns up to `k`
    /// hits ordered by decreasing cosine similarity; if fewer than `k` match,
    /// returns what is available without error (spec §4.2). Lazily ensures
    /// the collection exists first, the same as `upsert`, so a first-ever
    /// query against a fresh deployment degrades to zero hits instead of
    /// erroring on a missing collection.
    pub async fn search(
        &self,
        collection: &str,
        dim: u64,
        vector: Vec<f32>,
        k: usize,
        filter: Option<Filter>,
    ) -> Result<Vec<VectorHit>> {
        self.ensure_collection(collection, dim).await?;

        let mut search = SearchPointsBuilder::new(collection, vector, k as u64).with_payload(true);
        if let Some(f) = filter {
            search = search.filter(f);
        }

        let results = self.qdrant.search_points(search).await.context("search failed")?;

        Ok(results
            .result
            .into_iter()
            .filter_map(|point| {
                let id = point
                    .payload
                    .get("_id")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())?;
                let mut payload = HashMap::new();
                for (key, value) in &point.payload {
                    if key == "_id" {
                        continue;
                    }
                    if let Some(v) = qdrant_to_json(value) {
                        payload.insert(key.clone(), v);
                    }
                }
                Some(VectorHit {
                    id,
                    score: point.score,
                    payload,
                })
            })
            .collect())
    }

    /// Fetch a single point by its caller id via a filtered scroll (Qdrant
    /// has no point-by-id read in this client version's builder set we use
    /// elsewhere, so this reuses the same scroll primitive as bulk id
    /// enumeration, just narrowed to one match).
    pub async fn scroll_by_id(&self, collection: &str, id: &str) -> Result<Option<VectorHit>> {
        use qdrant_client::qdrant::{Condition, ScrollPointsBuilder};

        let builder = ScrollPointsBuilder::new(collection)
            .filter(Filter::must([Condition::matches("_id", id.to_string())]))
            .limit(1)
            .with_payload(true)
            .with_vectors(false);

        let response = self.qdrant.scroll(builder).await.context("scroll by id failed")?;
        let Some(point) = response.result.into_iter().next() else {
            return Ok(None);
        };

        let mut payload = HashMap::new();
        for (key, value) in &point.payload {
            if key == "_id" {
                continue;
            }
            if let Some(v) = qdrant_to_json(value) {
                payload.insert(key.clone(), v);
            }
        }
        Ok(Some(VectorHit { id: id.to_string(), score: 0.0, payload }))
    }

    /// Delete every row matching `filter`.
    pub async fn delete_by_filter(&self, collection: &str, filter: Filter) -> Result<()> {
        self.qdrant
            .delete_points(DeletePointsBuilder::new(collection).points(filter).wait(true))
            .await
            .context("delete failed")?;
        Ok(())
    }

    /// Delete a single point by its caller id (used by the QA cache's exact delete).
    pub async fn delete_by_id(&self, collection: &str, id: &str) -> Result<()> {
        use qdrant_client::qdrant::PointId;
        self.qdrant
            .delete_points(
                DeletePointsBuilder::new(collection)
                    .points(vec![PointId::from(hash_id(id))])
                    .wait(true),
            )
            .await
            .context("delete by id failed")?;
        Ok(())
    }
}

fn json_to_qdrant(value: Value) -> Option<QdrantValue> {
    match value {
        Value::String(s) => Some(s.into()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.into())
            } else {
                n.as_f64().map(|f| f.into())
            }
        }
        Value::Bool(b) => Some(b.into()),
        _ => None,
    }
}

fn qdrant_to_json(value: &QdrantValue) -> Option<Value> {
    if let Some(s) = value.as_str() {
        Some(Value::String(s.to_string()))
    } else if let Some(i) = value.as_integer() {
        Some(Value::Number(i.into()))
    } else if let Some(b) = value.as_bool() {
        Some(Value::Bool(b))
    } else {
        None
    }
}

/// Hash a caller-chosen string id down to the u64 Qdrant requires as a point id.
/// Deterministic, so re-upserting the same id is idempotent.
pub fn hash_id(id: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    id.hash(&mut hasher);
    hasher.finish()
}

/// Fluent builder for scalar payload metadata, shared between the retriever's
/// ingestion path and the QA cache.
pub struct MetadataBuilder {
    metadata: HashMap<String, Value>,
}

impl MetadataBuilder {
    pub fn new() -> Self {
        Self {
            metadata: HashMap::new(),
        }
    }

    pub fn string(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), Value::String(value.into()));
        self
    }

    pub fn string_opt(mut self, key: &str, value: Option<impl Into<String>>) -> Self {
        if let Some(v) = value {
            self.metadata.insert(key.to_string(), Value::String(v.into()));
        }
        self
    }

    pub fn number(mut self, key: &str, value: i64) -> Self {
        self.metadata.insert(key.to_string(), Value::Number(value.into()));
        self
    }

    pub fn build(self) -> HashMap<String, Value> {
        self.metadata
    }
}

impl Default for MetadataBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_id_deterministic() {
        assert_eq!(hash_id("abc"), hash_id("abc"));
        assert_ne!(hash_id("abc"), hash_id("abd"));
    }

    #[test]
    fn test_metadata_builder() {
        let meta = MetadataBuilder::new()
            .string("filename", "doc1.txt")
            .number("permission", 0)
            .build();
        assert_eq!(meta.get("filename").unwrap(), &Value::String("doc1.txt".into()));
        assert_eq!(meta.get("permission").unwrap(), &Value::Number(0.into()));
    }
}
