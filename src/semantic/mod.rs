//! Semantic search over bookmark embeddings.
//!
//! # Architecture
//!
//! - `embeddings`: embedding providers behind the `Embedder` trait
//! - `index`: in-memory vector index with cosine similarity search
//!
//! `SemanticIndex` ties both together and snapshots vectors to `vectors.json`.

pub mod embeddings;
mod index;

use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};

pub use embeddings::{Embedder, EmbeddingError};
pub use index::{SearchResult, VectorEntry, VectorIndex};

use crate::{eid::Eid, storage::StorageManager};

const VECTORS_FILE: &str = "vectors.json";

#[derive(Serialize, Deserialize)]
struct VectorSnapshot {
    model: String,
    entries: Vec<VectorEntry>,
}

pub struct SemanticIndex {
    embedder: Arc<dyn Embedder>,
    index: RwLock<VectorIndex>,
    storage: Arc<dyn StorageManager>,
}

impl SemanticIndex {
    /// Restores stored vectors. Vectors produced by a different model are discarded.
    pub fn load(
        embedder: Arc<dyn Embedder>,
        storage: Arc<dyn StorageManager>,
    ) -> anyhow::Result<Self> {
        let mut index = VectorIndex::new();

        if storage.exists(VECTORS_FILE) {
            let snapshot: VectorSnapshot = serde_json::from_slice(&storage.read(VECTORS_FILE)?)?;
            if snapshot.model == embedder.model_name() {
                index = VectorIndex::from_entries(snapshot.entries);
                log::info!("loaded {} vectors", index.len());
            } else {
                log::warn!(
                    "embedding model changed from {} to {}, stored vectors discarded",
                    snapshot.model,
                    embedder.model_name()
                );
            }
        }

        Ok(SemanticIndex {
            embedder,
            index: RwLock::new(index),
            storage,
        })
    }

    pub fn model_name(&self) -> &str {
        self.embedder.model_name()
    }

    pub fn len(&self) -> usize {
        self.index.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn persist(&self, index: &VectorIndex) -> Result<(), EmbeddingError> {
        let snapshot = VectorSnapshot {
            model: self.embedder.model_name().to_string(),
            entries: index.entries().cloned().collect(),
        };
        let data = serde_json::to_vec(&snapshot)
            .map_err(|err| EmbeddingError::Index(err.to_string()))?;
        self.storage
            .write(VECTORS_FILE, &data)
            .map_err(|err| EmbeddingError::Index(err.to_string()))
    }

    /// Embeds `text` and stores it as the vector of bookmark `id`.
    pub fn index_bookmark(&self, id: &Eid, user_id: &str, text: &str) -> Result<(), EmbeddingError> {
        let embedding = self.embedder.embed(text)?;

        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        index
            .insert(id.clone(), user_id.to_string(), embedding)
            .map_err(|err| EmbeddingError::Index(err.to_string()))?;
        self.persist(&index)
    }

    pub fn remove(&self, ids: &[Eid]) {
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        let removed = ids.iter().filter(|id| index.remove(id).is_some()).count();
        if removed > 0 {
            if let Err(err) = self.persist(&index) {
                log::error!("failed to persist vectors: {err}");
            }
        }
    }

    pub fn search(
        &self,
        user_id: &str,
        query: &str,
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<SearchResult>, EmbeddingError> {
        let embedding = self.embedder.embed(query)?;
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .search(user_id, &embedding, threshold, limit)
            .map_err(|err| EmbeddingError::Index(err.to_string()))
    }
}
