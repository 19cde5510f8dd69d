use crate::catalog::{
    ensure_business, increment_occurrence, insert_chunk, insert_file, mark_processed,
    max_chunk_index, now_str, ts_str, upsert_global, Catalog, CatalogError,
};
use crate::taxonomy::resolve_or_create_in;
use chrono::Utc;
use millrace_core::hash;
use millrace_core::model::{ChunkRecord, FileRecord, FileType, GlobalContentEntry};
use millrace_core::reasoning::ReasoningBlock;
use rusqlite::params;
use serde_json::Value;
use uuid::Uuid;

/// A fully prepared chunk, ready for its relational row: classified,
/// hashed, reasoned, and already past in-file dedup.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub text: String,
    pub cleaned_text: String,
    pub tokens: i64,
    pub source_type: FileType,
    pub metadata: Value,
    pub confidence: f64,
    pub semantic_hash: String,
    pub reasoning: ReasoningBlock,
    pub category: String,
    pub subcategory: String,
}

#[derive(Debug)]
pub enum PersistOutcome {
    Committed {
        chunk_ids: Vec<Uuid>,
        total_chunks: i64,
        unique_chunks: i64,
        duplicate_chunks: i64,
        dedup_ratio: f64,
    },
    /// A concurrent worker committed `processed` for the same bytes first;
    /// the whole transaction rolled back and nothing was written.
    LostRace,
}

/// Transactional projection of one file into the catalog: file row, dense
/// chunk rows, global-index upserts, taxonomy rows, entity links, and the
/// terminal `processed` flip, all in one transaction.
#[derive(Clone)]
pub struct RelationalWriter {
    catalog: Catalog,
}

impl RelationalWriter {
    pub fn new(catalog: Catalog) -> Self {
        Self { catalog }
    }

    pub async fn persist_file(
        &self,
        file: FileRecord,
        chunks: Vec<NewChunk>,
        duplicate_chunks: i64,
    ) -> Result<PersistOutcome, CatalogError> {
        self.catalog
            .with_conn(move |conn| {
                let tx = conn.transaction()?;

                ensure_business_row(&tx, file.business_id)?;
                insert_file(&tx, &file)?;

                let start_index = max_chunk_index(&tx, file.id)? + 1;
                let mut chunk_ids = Vec::with_capacity(chunks.len());
                let mut unique_chunks = 0i64;

                for (offset, chunk) in chunks.iter().enumerate() {
                    let entry = GlobalContentEntry {
                        id: Uuid::new_v4(),
                        semantic_hash: chunk.semantic_hash.clone(),
                        cleaned_text: chunk.cleaned_text.clone(),
                        raw_text: chunk.text.clone(),
                        tokens: chunk.tokens,
                        business_id: file.business_id,
                        first_seen_file_id: file.id,
                        source_type: chunk.source_type,
                        occurrence_count: 1,
                        created_at: Utc::now(),
                        updated_at: Utc::now(),
                    };
                    let (global_id, first_seen) = upsert_global(&tx, &entry)?;
                    if first_seen {
                        unique_chunks += 1;
                    } else {
                        increment_occurrence(&tx, &chunk.semantic_hash)?;
                    }

                    let chunk_id = Uuid::new_v4();
                    let record = ChunkRecord {
                        id: chunk_id,
                        file_id: file.id,
                        business_id: file.business_id,
                        chunk_index: start_index + offset as i64,
                        text: chunk.text.clone(),
                        cleaned_text: chunk.cleaned_text.clone(),
                        tokens: chunk.tokens,
                        source_type: chunk.source_type,
                        metadata: chunk.metadata.clone(),
                        confidence: chunk.confidence,
                        semantic_hash: chunk.semantic_hash.clone(),
                        global_content_id: Some(global_id),
                        reasoning: chunk.reasoning.clone(),
                        is_duplicate: !first_seen,
                        created_at: Utc::now(),
                    };
                    insert_chunk(&tx, &record)?;

                    let category_id = resolve_or_create_in(&tx, &chunk.category)?;
                    let subcategory_id = resolve_or_create_in(&tx, &chunk.subcategory)?;
                    insert_entity_link(
                        &tx,
                        chunk_id,
                        category_id,
                        subcategory_id,
                        file.business_id,
                        &chunk.semantic_hash,
                    )?;

                    chunk_ids.push(chunk_id);
                }

                let total_chunks = chunk_ids.len() as i64;
                let attempted = total_chunks + duplicate_chunks;
                let dedup_ratio = if attempted > 0 {
                    duplicate_chunks as f64 / attempted as f64
                } else {
                    0.0
                };

                if !mark_processed(
                    &tx,
                    file.id,
                    total_chunks,
                    unique_chunks,
                    duplicate_chunks,
                    dedup_ratio,
                )? {
                    // Drop rolls the transaction back.
                    return Ok(PersistOutcome::LostRace);
                }

                tx.commit()?;
                Ok(PersistOutcome::Committed {
                    chunk_ids,
                    total_chunks,
                    unique_chunks,
                    duplicate_chunks,
                    dedup_ratio,
                })
            })
            .await
    }
}

fn ensure_business_row(
    conn: &rusqlite::Connection,
    business_id: Uuid,
) -> Result<(), CatalogError> {
    use rusqlite::OptionalExtension;
    let exists: Option<String> = conn
        .query_row(
            "SELECT id FROM businesses WHERE id = ?1",
            params![business_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_none() {
        ensure_business(conn, millrace_core::model::DEFAULT_BUSINESS_NAME)?;
        // The caller handed us an id that is not in the table; record it so
        // the foreign key holds rather than silently remapping the file.
        conn.execute(
            "INSERT OR IGNORE INTO businesses (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![
                business_id.to_string(),
                format!("business-{}", business_id),
                now_str()
            ],
        )?;
    }
    Ok(())
}

fn insert_entity_link(
    conn: &rusqlite::Connection,
    chunk_id: Uuid,
    category_id: Uuid,
    subcategory_id: Uuid,
    business_id: Uuid,
    semantic_hash: &str,
) -> Result<(), CatalogError> {
    let entity_id = chunk_id.to_string();
    let fingerprint = hash::fingerprint(&["chunk", &entity_id, semantic_hash]);
    conn.execute(
        "INSERT INTO entity_links
         (id, entity_type, entity_id, category_id, subcategory_id, business_id, fingerprint,
          created_at)
         VALUES (?1, 'chunk', ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            Uuid::new_v4().to_string(),
            entity_id,
            category_id.to_string(),
            subcategory_id.to_string(),
            business_id.to_string(),
            fingerprint,
            ts_str(Utc::now()),
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use millrace_core::model::{FileStatus, DEFAULT_BUSINESS_NAME};

    fn new_chunk(text: &str, category: &str) -> NewChunk {
        let semantic_hash = hash::semantic_hash(text);
        NewChunk {
            text: text.to_string(),
            cleaned_text: text.to_string(),
            tokens: text.split_whitespace().count() as i64,
            source_type: FileType::Txt,
            metadata: Value::Object(Default::default()),
            confidence: 0.9,
            semantic_hash: semantic_hash.clone(),
            reasoning: ReasoningBlock::build(text, FileType::Txt, &semantic_hash, Utc::now()),
            category: category.to_string(),
            subcategory: "General Business".to_string(),
        }
    }

    async fn setup() -> (tempfile::TempDir, Catalog, RelationalWriter, FileRecord) {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path().join("catalog.db")).await.unwrap();
        let business = catalog
            .ensure_business(DEFAULT_BUSINESS_NAME.to_string())
            .await
            .unwrap();
        let mut file = FileRecord::new(business, "a.txt", FileType::Txt, "/tmp/a.txt");
        file.set_file_hash("file-hash-a");
        catalog.insert_file(file.clone()).await.unwrap();
        let writer = RelationalWriter::new(catalog.clone());
        (dir, catalog, writer, file)
    }

    #[tokio::test]
    async fn persists_dense_chunk_indexes_links_and_counters() {
        let (_dir, catalog, writer, file) = setup().await;

        let chunks = vec![new_chunk("first passage", "Marketing"), new_chunk("second passage", "Finance")];
        let outcome = writer.persist_file(file.clone(), chunks, 1).await.unwrap();

        let (total, unique) = match outcome {
            PersistOutcome::Committed {
                total_chunks,
                unique_chunks,
                ..
            } => (total_chunks, unique_chunks),
            PersistOutcome::LostRace => panic!("no competing writer in this test"),
        };
        assert_eq!(total, 2);
        assert_eq!(unique, 2);

        let stored = catalog.chunks_for_file(file.id).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].chunk_index, 0);
        assert_eq!(stored[1].chunk_index, 1);
        assert!(stored.iter().all(|c| c.global_content_id.is_some()));

        let loaded = catalog.get_file(file.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, FileStatus::Processed);
        assert_eq!(loaded.total_chunks, 2);
        assert_eq!(loaded.duplicate_chunks, 1);
        assert!((loaded.dedup_ratio - 1.0 / 3.0).abs() < 1e-9);

        let counts = catalog.counts().await.unwrap();
        assert_eq!(counts.entity_links, 2);
    }

    #[tokio::test]
    async fn shared_content_reuses_the_global_entry() {
        let (_dir, catalog, writer, file_a) = setup().await;
        let shared = "Q4 revenue grew 18% year over year.";

        writer
            .persist_file(file_a.clone(), vec![new_chunk(shared, "Finance")], 0)
            .await
            .unwrap();

        let mut file_b =
            FileRecord::new(file_a.business_id, "b.txt", FileType::Txt, "/tmp/b.txt");
        file_b.set_file_hash("file-hash-b");
        catalog.insert_file(file_b.clone()).await.unwrap();

        let outcome = writer
            .persist_file(
                file_b.clone(),
                vec![new_chunk(shared, "Finance"), new_chunk("fresh text", "Ops")],
                0,
            )
            .await
            .unwrap();
        match outcome {
            PersistOutcome::Committed { unique_chunks, total_chunks, .. } => {
                assert_eq!(total_chunks, 2);
                assert_eq!(unique_chunks, 1); // only "fresh text" is new globally
            }
            PersistOutcome::LostRace => panic!("no competing writer in this test"),
        }

        let entry = catalog
            .global_entry(hash::semantic_hash(shared))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.occurrence_count, 2);
        assert_eq!(entry.first_seen_file_id, file_a.id);

        let b_chunks = catalog.chunks_for_file(file_b.id).await.unwrap();
        assert!(b_chunks.iter().any(|c| c.is_duplicate));
    }

    #[tokio::test]
    async fn lost_race_rolls_back_every_row() {
        let (_dir, catalog, writer, file_a) = setup().await;

        // Another record with identical bytes wins `processed` first.
        let mut rival = FileRecord::new(
            file_a.business_id,
            "same.txt",
            FileType::Txt,
            "/tmp/same.txt",
        );
        rival.set_file_hash("file-hash-a");
        catalog.insert_file(rival.clone()).await.unwrap();
        writer
            .persist_file(rival, vec![new_chunk("winning content", "Ops")], 0)
            .await
            .unwrap();

        let outcome = writer
            .persist_file(file_a.clone(), vec![new_chunk("losing content", "Ops")], 0)
            .await
            .unwrap();
        assert!(matches!(outcome, PersistOutcome::LostRace));

        // Nothing from the losing transaction survives.
        assert_eq!(catalog.count_chunks(file_a.id).await.unwrap(), 0);
        assert!(catalog
            .global_entry(hash::semantic_hash("losing content"))
            .await
            .unwrap()
            .is_none());
        let loaded = catalog.get_file(file_a.id).await.unwrap().unwrap();
        assert_ne!(loaded.status, FileStatus::Processed);
    }
}
