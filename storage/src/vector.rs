use dashmap::DashMap;
use millrace_core::embedding::cosine_similarity;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum VectorStoreError {
    #[error("Vector store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Vector store serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Upsert batch arrays have mismatched lengths")]
    BatchShape,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorRecord {
    pub embedding: Vec<f32>,
    pub metadata: HashMap<String, String>,
    pub document: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryHit {
    pub id: String,
    pub score: f32,
    pub document: String,
    pub metadata: HashMap<String, String>,
}

/// Persistent vector index keyed by semantic hash. Upserts are idempotent by
/// construction (same hash, same slot), so concurrent writers converge and a
/// hash can never hold two embeddings. Brute-force cosine ranking; the
/// corpus sizes this serves do not warrant an ANN structure.
pub struct VectorStore {
    entries: DashMap<String, VectorRecord>,
    path: PathBuf,
    save_lock: tokio::sync::Mutex<()>,
}

impl VectorStore {
    pub async fn open(
        persist_dir: impl AsRef<Path>,
        collection_name: &str,
    ) -> Result<Self, VectorStoreError> {
        let dir = persist_dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}.json", collection_name));

        let entries = DashMap::new();
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str::<HashMap<String, VectorRecord>>(&raw) {
                Ok(stored) => {
                    for (id, record) in stored {
                        entries.insert(id, record);
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "vector index unreadable, starting empty");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            entries,
            path,
            save_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub async fn upsert(
        &self,
        ids: Vec<String>,
        embeddings: Vec<Vec<f32>>,
        metadatas: Vec<HashMap<String, String>>,
        documents: Vec<String>,
    ) -> Result<(), VectorStoreError> {
        if ids.len() != embeddings.len()
            || ids.len() != metadatas.len()
            || ids.len() != documents.len()
        {
            return Err(VectorStoreError::BatchShape);
        }
        for (((id, embedding), metadata), document) in ids
            .into_iter()
            .zip(embeddings)
            .zip(metadatas)
            .zip(documents)
        {
            self.entries.insert(
                id,
                VectorRecord {
                    embedding,
                    metadata,
                    document,
                },
            );
        }
        self.persist().await
    }

    pub fn get(&self, ids: &[String]) -> Vec<Option<VectorRecord>> {
        ids.iter()
            .map(|id| self.entries.get(id).map(|e| e.value().clone()))
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// IDs from the batch that have no vector yet.
    pub fn missing(&self, ids: &[String]) -> Vec<String> {
        ids.iter()
            .filter(|id| !self.entries.contains_key(*id))
            .cloned()
            .collect()
    }

    pub fn query(&self, embedding: &[f32], n: usize) -> Vec<QueryHit> {
        let mut hits: Vec<QueryHit> = self
            .entries
            .iter()
            .map(|entry| QueryHit {
                id: entry.key().clone(),
                score: cosine_similarity(embedding, &entry.value().embedding),
                document: entry.value().document.clone(),
                metadata: entry.value().metadata.clone(),
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(n);
        hits
    }

    pub async fn clear(&self) -> Result<usize, VectorStoreError> {
        let removed = self.entries.len();
        self.entries.clear();
        self.persist().await?;
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Snapshot the whole map to a temp file and rename it into place, so a
    /// crash mid-write never corrupts the index on disk.
    async fn persist(&self) -> Result<(), VectorStoreError> {
        let _guard = self.save_lock.lock().await;
        let snapshot: HashMap<String, VectorRecord> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let serialized = serde_json::to_string(&snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serialized).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
