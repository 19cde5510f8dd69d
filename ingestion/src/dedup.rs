use millrace_core::model::FileRecord;
use storage::{Catalog, CatalogError, NewChunk};
use uuid::Uuid;

/// Two-tier deduplication.
///
/// Tier 1 short-circuits whole files whose byte hash already reached
/// `processed`. Tier 2 drops repeats within one file only; cross-file
/// recurrence is represented through the global content index rather than
/// suppressed.
#[derive(Clone)]
pub struct DedupEngine {
    catalog: Catalog,
}

impl DedupEngine {
    pub fn new(catalog: Catalog) -> Self {
        Self { catalog }
    }

    /// The earliest processed file with these bytes, if any.
    pub async fn find_media_duplicate(
        &self,
        file_hash: &str,
        current: Uuid,
    ) -> Result<Option<FileRecord>, CatalogError> {
        self.catalog
            .find_processed_with_hash(file_hash.to_string(), current)
            .await
    }

    /// Partition prepared chunks into (kept, dropped-count). A hash is
    /// dropped when this file already has a chunk row for it, or when it
    /// repeats inside the incoming batch itself.
    pub async fn split_in_file_repeats(
        &self,
        file_id: Uuid,
        chunks: Vec<NewChunk>,
    ) -> Result<(Vec<NewChunk>, i64), CatalogError> {
        let hashes: Vec<String> = chunks.iter().map(|c| c.semantic_hash.clone()).collect();
        let mut seen = self.catalog.existing_chunk_hashes(file_id, hashes).await?;

        let mut kept = Vec::with_capacity(chunks.len());
        let mut dropped = 0i64;
        for chunk in chunks {
            if seen.insert(chunk.semantic_hash.clone()) {
                kept.push(chunk);
            } else {
                dropped += 1;
            }
        }
        Ok((kept, dropped))
    }
}
