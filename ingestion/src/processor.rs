use crate::chunker::{Chunker, ChunkingParams, RecursiveChunker};
use crate::dedup::DedupEngine;
use crate::extract;
use crate::indexer::{DeterministicEmbedder, Embedder, VectorIndexer, VectorItem};
use crate::router::{self, ParserKey};
use crate::visual;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use llm::classifier::{Classification, ClassifierGateway, GENERAL_BUSINESS, UNCATEGORIZED};
use llm::client::LlmClient;
use llm::rewriter::VisualRewriter;
use millrace_core::config::{AppConfig, ProfileConfig};
use millrace_core::hash;
use millrace_core::model::{FileRecord, FileStatus, FileType, DEFAULT_BUSINESS_NAME};
use millrace_core::normalize;
use millrace_core::reasoning::ReasoningBlock;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use storage::{
    Catalog, CatalogError, NewChunk, PersistOutcome, RelationalWriter, TaxonomyRegistry,
    VectorStore,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("Storage error: {0}")]
    Storage(#[from] CatalogError),
    #[error("Ingestion task failure: {0}")]
    Internal(String),
}

impl millrace_core::error::MillraceError for IngestionError {
    fn error_code(&self) -> millrace_core::error::ErrorCode {
        use millrace_core::error::MillraceError as _;
        match self {
            IngestionError::Storage(e) => e.error_code(),
            IngestionError::Internal(_) => millrace_core::error::ErrorCode::Internal,
        }
    }
}

/// One source ready for ingestion, however it arrived: watched file, HTTP
/// upload, admin text, or a synthetic feed entry.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub file_name: String,
    /// Filesystem path or source URL; what the router dispatches on.
    pub source: String,
    pub bytes: Vec<u8>,
    pub business: Option<String>,
    pub category_hint: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl SourceDocument {
    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self {
            file_name,
            source: path.display().to_string(),
            bytes,
            business: None,
            category_hint: None,
            metadata: HashMap::new(),
        })
    }

    pub fn from_upload(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let file_name = file_name.into();
        Self {
            source: format!("upload://{}", file_name),
            file_name,
            bytes,
            business: None,
            category_hint: None,
            metadata: HashMap::new(),
        }
    }

    pub fn from_text(doc_id: &str, text: &str) -> Self {
        let file_name = if Path::new(doc_id).extension().is_some() {
            doc_id.to_string()
        } else {
            format!("{}.txt", doc_id)
        };
        Self {
            source: format!("text://{}", doc_id),
            file_name,
            bytes: text.as_bytes().to_vec(),
            business: None,
            category_hint: None,
            metadata: HashMap::new(),
        }
    }

    /// One feed or API entry, rendered to text by the poller.
    pub fn synthetic(file_name: impl Into<String>, text: &str, source_url: &str) -> Self {
        Self {
            file_name: file_name.into(),
            source: source_url.to_string(),
            bytes: text.as_bytes().to_vec(),
            business: None,
            category_hint: None,
            metadata: HashMap::from([("feed_url".to_string(), source_url.to_string())]),
        }
    }

    pub fn with_business(mut self, business: impl Into<String>) -> Self {
        self.business = Some(business.into());
        self
    }

    pub fn with_category_hint(mut self, category: impl Into<String>) -> Self {
        self.category_hint = Some(category.into());
        self
    }

    pub fn parser(&self) -> ParserKey {
        match router::route(&self.source) {
            ParserKey::Unsupported => router::route(&self.file_name),
            key => key,
        }
    }

    pub fn file_type(&self) -> Option<FileType> {
        router::file_type_for(&self.source).or_else(|| router::file_type_for(&self.file_name))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum IngestOutcome {
    Processed {
        file_id: Uuid,
        total_chunks: i64,
        unique_chunks: i64,
        duplicate_chunks: i64,
        new_vectors: usize,
        avg_confidence: f64,
    },
    Duplicate {
        file_id: Uuid,
        duplicate_of: Uuid,
    },
    Skipped {
        file_id: Option<Uuid>,
        reason: String,
    },
    Failed {
        file_id: Uuid,
        error: String,
    },
}

/// Per-file state machine: uploaded -> processing -> processed | duplicate |
/// failed. Composes parse, normalize, chunk, visual re-explanation,
/// classification, two-tier dedup, the transactional catalog write, and the
/// vector upsert. `processed` commits atomically with the chunk rows; vector
/// failures are recovered by reconciliation, never terminal.
pub struct IngestionPipeline {
    catalog: Catalog,
    writer: RelationalWriter,
    dedup: DedupEngine,
    taxonomy: TaxonomyRegistry,
    chunker: Arc<dyn Chunker>,
    classifier: ClassifierGateway,
    rewriter: VisualRewriter,
    indexer: VectorIndexer,
    profile: ProfileConfig,
    // In-flight byte hashes; best effort to avoid duplicate work, the
    // storage constraints are what actually arbitrate races.
    in_flight: Arc<DashMap<String, ()>>,
}

impl IngestionPipeline {
    pub fn new(catalog: Catalog, store: Arc<VectorStore>, client: Arc<dyn LlmClient>) -> Self {
        Self::with_components(
            catalog,
            store,
            Arc::new(RecursiveChunker::default()),
            Arc::new(DeterministicEmbedder::default()),
            client,
            ProfileConfig::default(),
            "v2",
        )
    }

    pub fn with_components(
        catalog: Catalog,
        store: Arc<VectorStore>,
        chunker: Arc<dyn Chunker>,
        embedder: Arc<dyn Embedder>,
        client: Arc<dyn LlmClient>,
        profile: ProfileConfig,
        prompt_version: impl Into<String>,
    ) -> Self {
        Self {
            writer: RelationalWriter::new(catalog.clone()),
            dedup: DedupEngine::new(catalog.clone()),
            taxonomy: TaxonomyRegistry::new(catalog.clone()),
            catalog,
            chunker,
            classifier: ClassifierGateway::new(client.clone(), prompt_version),
            rewriter: VisualRewriter::new(client),
            indexer: VectorIndexer::new(store, embedder),
            profile,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    pub fn from_config(
        config: &AppConfig,
        catalog: Catalog,
        store: Arc<VectorStore>,
        client: Arc<dyn LlmClient>,
    ) -> Self {
        let profile = config.active_profile();
        let chunker = RecursiveChunker::new(ChunkingParams {
            max_chunk_size: config.chunking.max_chunk_size,
            min_chunk_size: config.chunking.min_sentence_length,
            semantic: config.chunking.semantic_chunking && profile.semantic_chunking,
            recursive_fallback: profile.recursive_fallback,
        });
        Self::with_components(
            catalog,
            store,
            Arc::new(chunker),
            Arc::new(DeterministicEmbedder::default()),
            client,
            profile,
            config.llm.prompt_version.clone(),
        )
    }

    pub fn indexer(&self) -> &VectorIndexer {
        &self.indexer
    }

    pub async fn ingest(&self, doc: SourceDocument) -> Result<IngestOutcome, IngestionError> {
        let parser = doc.parser();
        let file_type = doc.file_type().unwrap_or(FileType::Txt);

        let business_name = doc
            .business
            .clone()
            .unwrap_or_else(|| DEFAULT_BUSINESS_NAME.to_string());
        let business_id = self.catalog.ensure_business(business_name).await?;

        let mut record = FileRecord::new(business_id, &doc.file_name, file_type, &doc.source);
        record.metadata = metadata_value(&doc.metadata);
        record.parser_used = Some(parser.as_str().to_string());

        if parser == ParserKey::Unsupported {
            record.parser_used = None;
            self.catalog.insert_file(record.clone()).await?;
            self.catalog
                .mark_failed(record.id, "unsupported_format".to_string())
                .await?;
            warn!(file = %record.file_name, "skipping unsupported source");
            return Ok(IngestOutcome::Skipped {
                file_id: Some(record.id),
                reason: "unsupported_format".to_string(),
            });
        }

        // The hash must exist before the record can leave `uploaded`; it is
        // what lets a concurrent watcher and HTTP upload converge.
        let mut doc = doc;
        let bytes = std::mem::take(&mut doc.bytes);
        let (hashed, bytes) = tokio::task::spawn_blocking(move || {
            let hashed = hash::file_hash(&bytes[..]);
            (hashed, bytes)
        })
        .await
        .map_err(|e| IngestionError::Internal(e.to_string()))?;
        let file_hash = hashed.map_err(|e| IngestionError::Internal(e.to_string()))?;
        doc.bytes = bytes;
        record.set_file_hash(&file_hash);

        self.catalog.insert_file(record.clone()).await?;

        let _in_flight = InFlightGuard::acquire(&self.in_flight, &file_hash);

        if !self.catalog.acquire_file(record.id).await? {
            return Ok(IngestOutcome::Skipped {
                file_id: Some(record.id),
                reason: "not in uploaded state".to_string(),
            });
        }
        record.status = FileStatus::Processing;

        if let Some(winner) = self.dedup.find_media_duplicate(&file_hash, record.id).await? {
            self.catalog.mark_duplicate(record.id).await?;
            info!(
                file = %record.file_name,
                duplicate_of = %winner.id,
                "whole-file dedup hit"
            );
            return Ok(IngestOutcome::Duplicate {
                file_id: record.id,
                duplicate_of: winner.id,
            });
        }

        self.run_acquired(record, parser, doc, file_hash).await
    }

    /// Re-run a file that was re-queued after a crash left it mid-flight.
    /// Only records back in `uploaded` are eligible; the earlier attempt's
    /// transaction never committed, so this is a clean restart.
    pub async fn resume(&self, file_id: Uuid) -> Result<IngestOutcome, IngestionError> {
        let Some(record) = self.catalog.get_file(file_id).await? else {
            return Ok(IngestOutcome::Skipped {
                file_id: None,
                reason: "unknown file".to_string(),
            });
        };
        if record.status != FileStatus::Uploaded {
            return Ok(IngestOutcome::Skipped {
                file_id: Some(file_id),
                reason: format!("not pending (status {})", record.status.as_str()),
            });
        }

        let bytes = match tokio::fs::read(&record.source).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let message = format!("source unavailable: {}", e);
                self.catalog.mark_failed(file_id, message.clone()).await?;
                return Ok(IngestOutcome::Failed {
                    file_id,
                    error: message,
                });
            }
        };

        let doc = SourceDocument {
            file_name: record.file_name.clone(),
            source: record.source.clone(),
            bytes,
            business: None,
            category_hint: None,
            metadata: HashMap::new(),
        };
        self.ingest_existing(record, doc).await
    }

    async fn ingest_existing(
        &self,
        mut record: FileRecord,
        doc: SourceDocument,
    ) -> Result<IngestOutcome, IngestionError> {
        let parser = doc.parser();
        let file_hash = match record.file_hash() {
            Some(h) => h.to_string(),
            None => {
                let h = hash::file_hash(&doc.bytes[..])
                    .map_err(|e| IngestionError::Internal(e.to_string()))?;
                self.catalog.set_file_hash(record.id, h.clone()).await?;
                record.set_file_hash(&h);
                h
            }
        };

        let _in_flight = InFlightGuard::acquire(&self.in_flight, &file_hash);

        if !self.catalog.acquire_file(record.id).await? {
            return Ok(IngestOutcome::Skipped {
                file_id: Some(record.id),
                reason: "not in uploaded state".to_string(),
            });
        }
        record.status = FileStatus::Processing;

        if let Some(winner) = self.dedup.find_media_duplicate(&file_hash, record.id).await? {
            self.catalog.mark_duplicate(record.id).await?;
            return Ok(IngestOutcome::Duplicate {
                file_id: record.id,
                duplicate_of: winner.id,
            });
        }

        self.run_acquired(record, parser, doc, file_hash).await
    }

    async fn run_acquired(
        &self,
        record: FileRecord,
        parser: ParserKey,
        doc: SourceDocument,
        file_hash: String,
    ) -> Result<IngestOutcome, IngestionError> {
        let file_name = doc.file_name.clone();
        let bytes = doc.bytes;
        let parsed = tokio::task::spawn_blocking(move || {
            extract::extract_text(parser, &file_name, &bytes)
        })
        .await
        .map_err(|e| IngestionError::Internal(e.to_string()))?;

        let text = match parsed {
            Ok(text) => text,
            Err(e) => {
                let message = e.to_string();
                self.catalog.mark_failed(record.id, message.clone()).await?;
                warn!(file = %record.file_name, error = %message, "parser failure");
                return Ok(IngestOutcome::Failed {
                    file_id: record.id,
                    error: message,
                });
            }
        };

        let cleaned = normalize::clean_text(&text);
        let pieces = self.chunker.chunk(&cleaned);
        let now = Utc::now();

        let mut prepared: Vec<NewChunk> = Vec::new();
        for piece in pieces {
            let batch = self
                .prepare_chunk(piece, &record, doc.category_hint.as_deref(), now)
                .await;
            prepared.extend(batch);
        }

        let (kept, dropped) = self.dedup.split_in_file_repeats(record.id, prepared).await?;
        let avg_confidence = if kept.is_empty() {
            0.0
        } else {
            kept.iter().map(|c| c.confidence).sum::<f64>() / kept.len() as f64
        };

        match self.writer.persist_file(record.clone(), kept.clone(), dropped).await {
            Err(e) => {
                let message = format!("relational write failed: {}", e);
                self.catalog.mark_failed(record.id, message.clone()).await?;
                error!(file = %record.file_name, error = %message, "per-file transaction rolled back");
                Ok(IngestOutcome::Failed {
                    file_id: record.id,
                    error: message,
                })
            }
            Ok(PersistOutcome::LostRace) => {
                self.catalog.mark_duplicate(record.id).await?;
                let winner = self.dedup.find_media_duplicate(&file_hash, record.id).await?;
                info!(file = %record.file_name, "lost processed race, downgraded to duplicate");
                Ok(IngestOutcome::Duplicate {
                    file_id: record.id,
                    duplicate_of: winner.map(|w| w.id).unwrap_or(record.id),
                })
            }
            Ok(PersistOutcome::Committed {
                total_chunks,
                unique_chunks,
                duplicate_chunks,
                ..
            }) => {
                let items: Vec<VectorItem> = kept
                    .iter()
                    .map(|chunk| {
                        VectorItem::new(
                            chunk.semantic_hash.clone(),
                            chunk.cleaned_text.clone(),
                            &record.id.to_string(),
                            &record.business_id.to_string(),
                            chunk.source_type.as_str(),
                        )
                    })
                    .collect();
                let new_vectors = match self.indexer.ensure_embedded(items).await {
                    Ok(written) => written,
                    Err(e) => {
                        error!(
                            error = %format!("{e:#}"),
                            "vector upsert failed; catalog remains authoritative"
                        );
                        0
                    }
                };
                info!(
                    file = %record.file_name,
                    total_chunks,
                    unique_chunks,
                    new_vectors,
                    "file processed"
                );
                Ok(IngestOutcome::Processed {
                    file_id: record.id,
                    total_chunks,
                    unique_chunks,
                    duplicate_chunks,
                    new_vectors,
                    avg_confidence,
                })
            }
        }
    }

    /// Visual-detect, optionally re-explain (and re-chunk the explanation),
    /// hash, reason, classify. One input piece can fan out into several
    /// chunks when its explanation runs long.
    async fn prepare_chunk(
        &self,
        piece: String,
        record: &FileRecord,
        category_hint: Option<&str>,
        now: DateTime<Utc>,
    ) -> Vec<NewChunk> {
        let is_visual = visual::is_visual(&piece);
        let original_hash = hash::semantic_hash(&piece);

        let mut texts = vec![piece.clone()];
        if is_visual && self.profile.llm_enabled {
            if let Some(explained) = self.rewriter.explain(&piece).await {
                let cleaned = normalize::clean_text(&explained);
                let rechunked = self.chunker.chunk(&cleaned);
                if !rechunked.is_empty() {
                    texts = rechunked;
                }
            }
        }

        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            let semantic_hash = hash::semantic_hash(&text);
            let mut reasoning =
                ReasoningBlock::build(&text, record.file_type, &semantic_hash, now);
            if is_visual {
                reasoning.mark_visual(&original_hash);
            }

            let mut classification = if self.profile.llm_enabled {
                self.classifier.classify(&text).await
            } else {
                // Offline profiles classify against the registry itself:
                // literal + embedding match, collapsing to the safe default
                // below the certainty threshold.
                let mut fallback = Classification::fallback(&text);
                match self.taxonomy.best_match(&text).await {
                    Ok(best) => {
                        fallback.category_level_1 = best.category;
                        fallback.category_level_2_sub = best.subcategory;
                        if best.confidence > fallback.extraction_confidence {
                            fallback.extraction_confidence = best.confidence;
                        }
                    }
                    Err(e) => warn!(error = %e, "taxonomy best-match unavailable"),
                }
                fallback
            };
            if classification.extraction_confidence
                < self.profile.classification_confidence_threshold
            {
                classification.category_level_1 = UNCATEGORIZED.to_string();
                classification.category_level_2_sub = GENERAL_BUSINESS.to_string();
            }

            let (category, subcategory) = resolve_categories(&classification, category_hint);
            let metadata = chunk_metadata(record, &classification);

            out.push(NewChunk {
                text: text.clone(),
                cleaned_text: text.clone(),
                tokens: normalize::token_count(&text) as i64,
                source_type: record.file_type,
                metadata,
                confidence: classification.extraction_confidence,
                semantic_hash,
                reasoning,
                category,
                subcategory,
            });
        }
        out
    }
}

fn resolve_categories(
    classification: &Classification,
    category_hint: Option<&str>,
) -> (String, String) {
    let uncategorized = classification.category_level_1.trim().is_empty()
        || classification.category_level_1 == UNCATEGORIZED;
    if uncategorized {
        return match category_hint {
            Some(hint) if !hint.trim().is_empty() => {
                (hint.trim().to_string(), GENERAL_BUSINESS.to_string())
            }
            _ => (UNCATEGORIZED.to_string(), GENERAL_BUSINESS.to_string()),
        };
    }
    let subcategory = if classification.category_level_2_sub.trim().is_empty() {
        GENERAL_BUSINESS.to_string()
    } else {
        classification.category_level_2_sub.clone()
    };
    (classification.category_level_1.clone(), subcategory)
}

fn chunk_metadata(record: &FileRecord, classification: &Classification) -> Value {
    serde_json::json!({
        "file_name": record.file_name,
        "source": record.source,
        "classification": classification,
    })
}

fn metadata_value(metadata: &HashMap<String, String>) -> Value {
    let map: serde_json::Map<String, Value> = metadata
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    Value::Object(map)
}

struct InFlightGuard {
    locks: Arc<DashMap<String, ()>>,
    key: String,
    owner: bool,
}

impl InFlightGuard {
    fn acquire(locks: &Arc<DashMap<String, ()>>, key: &str) -> Self {
        let owner = locks.insert(key.to_string(), ()).is_none();
        if !owner {
            debug!(hash = %key, "identical bytes already in flight");
        }
        Self {
            locks: locks.clone(),
            key: key.to_string(),
            owner,
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.owner {
            self.locks.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classification(level_1: &str, level_2: &str, confidence: f64) -> Classification {
        Classification {
            category_level_1: level_1.to_string(),
            category_level_2_sub: level_2.to_string(),
            extraction_confidence: confidence,
            ..Classification::fallback("")
        }
    }

    #[test]
    fn hint_fills_in_for_uncategorized_results() {
        let c = classification(UNCATEGORIZED, "", 0.4);
        let (category, subcategory) = resolve_categories(&c, Some("marketing"));
        assert_eq!(category, "marketing");
        assert_eq!(subcategory, GENERAL_BUSINESS);
    }

    #[test]
    fn classified_results_ignore_the_hint() {
        let c = classification("Finance", "Budgeting", 0.9);
        let (category, subcategory) = resolve_categories(&c, Some("marketing"));
        assert_eq!(category, "Finance");
        assert_eq!(subcategory, "Budgeting");
    }

    #[test]
    fn missing_subcategory_defaults_to_general_business() {
        let c = classification("Finance", "  ", 0.9);
        let (_, subcategory) = resolve_categories(&c, None);
        assert_eq!(subcategory, GENERAL_BUSINESS);
    }
}
