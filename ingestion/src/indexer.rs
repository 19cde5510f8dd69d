use anyhow::Context;
use millrace_core::embedding::{embed_text, DEFAULT_DIMS};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use storage::{Catalog, VectorStore};
use tracing::info;

/// Embedding calls go out in batches of this size.
pub const EMBED_BATCH_SIZE: usize = 256;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait Embedder: Send + Sync {
    fn embed_batch<'a>(&'a self, texts: &'a [String]) -> BoxFuture<'a, anyhow::Result<Vec<Vec<f32>>>>;
}

/// Default embedder: deterministic vectors, computed on the blocking pool so
/// request-handling tasks never stall on embedding work.
pub struct DeterministicEmbedder {
    dims: usize,
    model_id: String,
}

impl DeterministicEmbedder {
    pub fn new(dims: usize, model_id: impl Into<String>) -> Self {
        Self {
            dims: dims.max(1),
            model_id: model_id.into(),
        }
    }
}

impl Default for DeterministicEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMS, "embedding-default-v1")
    }
}

impl Embedder for DeterministicEmbedder {
    fn embed_batch<'a>(&'a self, texts: &'a [String]) -> BoxFuture<'a, anyhow::Result<Vec<Vec<f32>>>> {
        let texts = texts.to_vec();
        let dims = self.dims;
        let model_id = self.model_id.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                texts
                    .iter()
                    .map(|text| embed_text(text, &model_id, dims))
                    .collect::<Vec<_>>()
            })
            .await
            .context("embedding task failed")
        })
    }
}

/// One prospective vector: ID is the semantic hash, document is the cleaned
/// text, metadata carries provenance.
#[derive(Debug, Clone)]
pub struct VectorItem {
    pub semantic_hash: String,
    pub document: String,
    pub metadata: HashMap<String, String>,
}

impl VectorItem {
    pub fn new(
        semantic_hash: impl Into<String>,
        document: impl Into<String>,
        file_id: &str,
        business_id: &str,
        source_type: &str,
    ) -> Self {
        let semantic_hash = semantic_hash.into();
        let metadata = HashMap::from([
            ("file_id".to_string(), file_id.to_string()),
            ("business_id".to_string(), business_id.to_string()),
            ("source_type".to_string(), source_type.to_string()),
            ("semantic_hash".to_string(), semantic_hash.clone()),
        ]);
        Self {
            semantic_hash,
            document: document.into(),
            metadata,
        }
    }
}

/// Vector store adapter: checks which hashes the store already holds and
/// embeds + upserts only the gaps, in bounded batches. Store IDs equal
/// semantic hashes, so repeated upserts converge instead of duplicating.
#[derive(Clone)]
pub struct VectorIndexer {
    store: Arc<VectorStore>,
    embedder: Arc<dyn Embedder>,
}

impl VectorIndexer {
    pub fn new(store: Arc<VectorStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    /// Embed and upsert every item whose hash the store does not hold yet.
    /// Returns the number of vectors actually written.
    pub async fn ensure_embedded(&self, items: Vec<VectorItem>) -> anyhow::Result<usize> {
        let mut unique: Vec<VectorItem> = Vec::with_capacity(items.len());
        let mut seen = HashSet::new();
        for item in items {
            if seen.insert(item.semantic_hash.clone()) {
                unique.push(item);
            }
        }

        let ids: Vec<String> = unique.iter().map(|i| i.semantic_hash.clone()).collect();
        let missing: HashSet<String> = self.store.missing(&ids).into_iter().collect();
        let to_embed: Vec<VectorItem> = unique
            .into_iter()
            .filter(|i| missing.contains(&i.semantic_hash))
            .collect();

        let mut written = 0usize;
        for batch in to_embed.chunks(EMBED_BATCH_SIZE) {
            let documents: Vec<String> = batch.iter().map(|i| i.document.clone()).collect();
            let embeddings = self.embedder.embed_batch(&documents).await?;
            self.store
                .upsert(
                    batch.iter().map(|i| i.semantic_hash.clone()).collect(),
                    embeddings,
                    batch.iter().map(|i| i.metadata.clone()).collect(),
                    documents,
                )
                .await?;
            written += batch.len();
        }
        Ok(written)
    }

    /// Walk the global content index and re-embed every hash missing from
    /// the vector store. Recovery path after vector-store outages; the
    /// relational catalog stays authoritative.
    pub async fn reconcile(&self, catalog: &Catalog) -> anyhow::Result<usize> {
        let entries = catalog.all_global_entries().await?;
        let items: Vec<VectorItem> = entries
            .iter()
            .filter(|entry| !self.store.contains(&entry.semantic_hash))
            .map(|entry| {
                VectorItem::new(
                    entry.semantic_hash.clone(),
                    entry.cleaned_text.clone(),
                    &entry.first_seen_file_id.to_string(),
                    &entry.business_id.to_string(),
                    entry.source_type.as_str(),
                )
            })
            .collect();
        if items.is_empty() {
            return Ok(0);
        }
        let restored = self.ensure_embedded(items).await?;
        info!(restored, "vector reconciliation re-embedded missing hashes");
        Ok(restored)
    }

    pub async fn embed_query(&self, query: &str) -> anyhow::Result<Vec<f32>> {
        let mut vectors = self.embedder.embed_batch(&[query.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| anyhow::anyhow!("embedder returned no vector"))
    }
}
