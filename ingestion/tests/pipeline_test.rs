use ingestion::processor::{IngestOutcome, IngestionPipeline, SourceDocument};
use llm::client::MockLlm;
use millrace_core::hash;
use millrace_core::model::FileStatus;
use std::path::Path;
use std::sync::Arc;
use storage::{Catalog, VectorStore};
use tempfile::tempdir;

const CLASSIFIER_JSON: &str = r#"{
    "entity_type": "content",
    "category_level_1": "Marketing",
    "category_level_2_sub": "Campaign Strategy",
    "business_concept_name": "",
    "business_specific_name": "",
    "primary_process_type": "analysis",
    "title": "Passage",
    "description": "A classified passage",
    "extraction_confidence": 0.9
}"#;

async fn pipeline_with(
    dir: &Path,
    client: MockLlm,
) -> (Catalog, Arc<VectorStore>, IngestionPipeline) {
    let catalog = Catalog::open(dir.join("catalog.db")).await.unwrap();
    let store = Arc::new(VectorStore::open(dir.join("rag_db"), "chunks").await.unwrap());
    let pipeline = IngestionPipeline::new(catalog.clone(), store.clone(), Arc::new(client));
    (catalog, store, pipeline)
}

async fn pipeline(dir: &Path) -> (Catalog, Arc<VectorStore>, IngestionPipeline) {
    pipeline_with(dir, MockLlm::fixed(CLASSIFIER_JSON)).await
}

fn processed(outcome: &IngestOutcome) -> (i64, i64, usize) {
    match outcome {
        IngestOutcome::Processed {
            total_chunks,
            unique_chunks,
            new_vectors,
            ..
        } => (*total_chunks, *unique_chunks, *new_vectors),
        other => panic!("expected processed outcome, got {:?}", other),
    }
}

#[tokio::test]
async fn text_ingest_creates_one_chunk_and_one_vector() {
    let dir = tempdir().unwrap();
    let (catalog, store, pipeline) = pipeline(dir.path()).await;

    let text = "AI is transforming marketing content...";
    let outcome = pipeline
        .ingest(SourceDocument::from_text("blog1", text).with_category_hint("marketing"))
        .await
        .unwrap();
    let (total, unique, vectors) = processed(&outcome);
    assert_eq!(total, 1);
    assert_eq!(unique, 1);
    assert_eq!(vectors, 1);

    let file_id = match outcome {
        IngestOutcome::Processed { file_id, .. } => file_id,
        _ => unreachable!(),
    };
    let file = catalog.get_file(file_id).await.unwrap().unwrap();
    assert_eq!(file.status, FileStatus::Processed);

    let chunks = catalog.chunks_for_file(file_id).await.unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].cleaned_text, text);
    assert_eq!(chunks[0].semantic_hash, hash::semantic_hash(text));
    assert_eq!(chunks[0].chunk_index, 0);
    assert!(chunks[0].global_content_id.is_some());

    // The vector is keyed by the semantic hash of the cleaned text.
    assert!(store.contains(&hash::semantic_hash(text)));
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn identical_bytes_dedup_to_a_single_processed_file() {
    let dir = tempdir().unwrap();
    let (catalog, store, pipeline) = pipeline(dir.path()).await;
    let bytes = b"Quarterly report body with enough words to form a chunk.".to_vec();

    let first = pipeline
        .ingest(SourceDocument::from_upload("report.txt", bytes.clone()))
        .await
        .unwrap();
    let (total, _, _) = processed(&first);
    assert!(total > 0);
    let vectors_after_first = store.len();

    let second = pipeline
        .ingest(SourceDocument::from_upload("report.txt", bytes))
        .await
        .unwrap();
    let (first_id, second_id) = match (&first, &second) {
        (
            IngestOutcome::Processed { file_id: a, .. },
            IngestOutcome::Duplicate {
                file_id: b,
                duplicate_of,
            },
        ) => {
            assert_eq!(duplicate_of, a);
            (*a, *b)
        }
        other => panic!("expected processed then duplicate, got {:?}", other),
    };

    let duplicate = catalog.get_file(second_id).await.unwrap().unwrap();
    assert_eq!(duplicate.status, FileStatus::Duplicate);
    assert_eq!(duplicate.total_chunks, 0);
    assert_eq!(catalog.count_chunks(second_id).await.unwrap(), 0);
    assert!(catalog.count_chunks(first_id).await.unwrap() > 0);
    // No new vectors from the duplicate.
    assert_eq!(store.len(), vectors_after_first);
}

#[tokio::test]
async fn shared_sentences_share_one_global_entry_and_one_vector() {
    let dir = tempdir().unwrap();
    let (catalog, store, pipeline) = pipeline(dir.path()).await;
    let shared = "Q4 revenue grew 18% year over year.";
    // Long enough that the chunker cannot merge it with the shared sentence.
    let unique = "unique ".repeat(82);

    pipeline
        .ingest(SourceDocument::from_upload("a.txt", shared.as_bytes().to_vec()))
        .await
        .unwrap();
    let entry = catalog
        .global_entry(hash::semantic_hash(shared))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.occurrence_count, 1);

    let b_body = format!("{}\n\n{}", shared, unique.trim());
    let outcome = pipeline
        .ingest(SourceDocument::from_upload("b.txt", b_body.into_bytes()))
        .await
        .unwrap();
    let (total, unique_chunks, new_vectors) = processed(&outcome);
    assert_eq!(total, 2);
    assert_eq!(unique_chunks, 1);
    assert_eq!(new_vectors, 1);

    let entry = catalog
        .global_entry(hash::semantic_hash(shared))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.occurrence_count, 2);

    // Exactly one vector for the shared sentence.
    assert_eq!(store.len(), 2);
    assert!(store.contains(&hash::semantic_hash(shared)));
}

#[tokio::test]
async fn fully_deduped_file_processes_with_zero_new_vectors() {
    let dir = tempdir().unwrap();
    let (catalog, store, pipeline) = pipeline(dir.path()).await;
    let sentence = "Q4 revenue grew 18% year over year.";

    pipeline
        .ingest(SourceDocument::from_upload("a.txt", sentence.as_bytes().to_vec()))
        .await
        .unwrap();
    let links_before = catalog.counts().await.unwrap().entity_links;

    // Different bytes (trailing newline), identical cleaned chunk.
    let outcome = pipeline
        .ingest(SourceDocument::from_upload(
            "c.txt",
            format!("{}\n", sentence).into_bytes(),
        ))
        .await
        .unwrap();
    let (total, unique_chunks, new_vectors) = processed(&outcome);
    assert_eq!(total, 1);
    assert_eq!(unique_chunks, 0);
    assert_eq!(new_vectors, 0);
    assert_eq!(store.len(), 1);

    // New chunk record and new entity link despite zero new vectors.
    let counts = catalog.counts().await.unwrap();
    assert_eq!(counts.chunks, 2);
    assert_eq!(counts.entity_links, links_before + 1);
}

#[tokio::test]
async fn visual_chunks_are_re_explained_and_tagged() {
    let dir = tempdir().unwrap();
    let explanation =
        "Growth accelerated from twelve percent in the first year to twenty-seven percent.";
    let client = MockLlm::fixed(CLASSIFIER_JSON).on("Explain this chart", explanation);
    let (catalog, _store, pipeline) = pipeline_with(dir.path(), client).await;

    let visual_text = "Year over year revenue growth, tabulated by percent:\n\
                       2021: 12%\n2022: 18%\n2023: 27%\nSource: internal";
    let outcome = pipeline
        .ingest(SourceDocument::from_upload("growth.txt", visual_text.as_bytes().to_vec()))
        .await
        .unwrap();
    let file_id = match outcome {
        IngestOutcome::Processed { file_id, .. } => file_id,
        other => panic!("expected processed, got {:?}", other),
    };

    let chunks = catalog.chunks_for_file(file_id).await.unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].cleaned_text, explanation);
    assert_eq!(chunks[0].reasoning.content_type.as_deref(), Some("visual"));
    assert_eq!(
        chunks[0].reasoning.original_text_hash.as_deref(),
        Some(hash::semantic_hash(visual_text).as_str())
    );
}

#[tokio::test]
async fn failed_re_explanation_keeps_the_original_text() {
    let dir = tempdir().unwrap();
    // Classifier works, the rewrite prompt gets no scripted answer and errors.
    let client = MockLlm::failing();
    let (catalog, _store, pipeline) = pipeline_with(dir.path(), client).await;

    let visual_text = "Year over year revenue growth, tabulated by percent:\n\
                       2021: 12%\n2022: 18%\n2023: 27%\nSource: internal";
    let outcome = pipeline
        .ingest(SourceDocument::from_upload("growth.txt", visual_text.as_bytes().to_vec()))
        .await
        .unwrap();
    let file_id = match outcome {
        IngestOutcome::Processed { file_id, .. } => file_id,
        other => panic!("expected processed, got {:?}", other),
    };

    let chunks = catalog.chunks_for_file(file_id).await.unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].cleaned_text, visual_text);
    // Still flagged visual even though the rewrite never landed.
    assert_eq!(chunks[0].reasoning.content_type.as_deref(), Some("visual"));
}

#[tokio::test]
async fn unreachable_llm_falls_back_to_uncategorized() {
    let dir = tempdir().unwrap();
    let (catalog, _store, pipeline) = pipeline_with(dir.path(), MockLlm::failing()).await;

    let text = "the business keeps operating ".repeat(18); // ~500 chars
    let outcome = pipeline
        .ingest(SourceDocument::from_upload("notes.txt", text.into_bytes()))
        .await
        .unwrap();
    let file_id = match outcome {
        IngestOutcome::Processed { file_id, .. } => file_id,
        other => panic!("expected processed, got {:?}", other),
    };

    let file = catalog.get_file(file_id).await.unwrap().unwrap();
    assert_eq!(file.status, FileStatus::Processed);

    let chunks = catalog.chunks_for_file(file_id).await.unwrap();
    assert!(!chunks.is_empty());
    for chunk in &chunks {
        assert!((chunk.confidence - 0.4).abs() < 1e-9);
        let classification = &chunk.metadata["classification"];
        assert_eq!(classification["category_level_1"], "Uncategorized");
    }
}

#[tokio::test]
async fn empty_file_processes_with_zero_chunks() {
    let dir = tempdir().unwrap();
    let (catalog, store, pipeline) = pipeline(dir.path()).await;

    let outcome = pipeline
        .ingest(SourceDocument::from_upload("empty.txt", Vec::new()))
        .await
        .unwrap();
    let (total, unique, vectors) = processed(&outcome);
    assert_eq!(total, 0);
    assert_eq!(unique, 0);
    assert_eq!(vectors, 0);

    let file_id = match outcome {
        IngestOutcome::Processed { file_id, .. } => file_id,
        _ => unreachable!(),
    };
    let file = catalog.get_file(file_id).await.unwrap().unwrap();
    assert_eq!(file.status, FileStatus::Processed);
    assert!(store.is_empty());
}

#[tokio::test]
async fn unsupported_extension_is_skipped_with_failed_record() {
    let dir = tempdir().unwrap();
    let (catalog, _store, pipeline) = pipeline(dir.path()).await;

    let outcome = pipeline
        .ingest(SourceDocument::from_upload("image.png", vec![0x89, 0x50]))
        .await
        .unwrap();
    let file_id = match outcome {
        IngestOutcome::Skipped { file_id, reason } => {
            assert_eq!(reason, "unsupported_format");
            file_id.unwrap()
        }
        other => panic!("expected skipped, got {:?}", other),
    };

    let file = catalog.get_file(file_id).await.unwrap().unwrap();
    assert_eq!(file.status, FileStatus::Failed);
    assert_eq!(file.error_message.as_deref(), Some("unsupported_format"));
}

#[tokio::test]
async fn broken_pdf_fails_with_truncated_error() {
    let dir = tempdir().unwrap();
    let (catalog, _store, pipeline) = pipeline(dir.path()).await;

    let outcome = pipeline
        .ingest(SourceDocument::from_upload(
            "broken.pdf",
            b"definitely not a pdf".to_vec(),
        ))
        .await
        .unwrap();
    let file_id = match outcome {
        IngestOutcome::Failed { file_id, .. } => file_id,
        other => panic!("expected failed, got {:?}", other),
    };

    let file = catalog.get_file(file_id).await.unwrap().unwrap();
    assert_eq!(file.status, FileStatus::Failed);
    let message = file.error_message.unwrap();
    assert!(!message.is_empty());
    assert!(message.chars().count() <= 255);
    assert_eq!(catalog.count_chunks(file_id).await.unwrap(), 0);
}

#[tokio::test]
async fn concurrent_identical_ingests_yield_one_processed_one_duplicate() {
    let dir = tempdir().unwrap();
    let (catalog, _store, pipeline) = pipeline(dir.path()).await;
    let bytes = b"Concurrent arrivals of the same bytes must converge to one file.".to_vec();

    let (a, b) = tokio::join!(
        pipeline.ingest(SourceDocument::from_upload("same.txt", bytes.clone())),
        pipeline.ingest(SourceDocument::from_upload("same.txt", bytes)),
    );
    let outcomes = [a.unwrap(), b.unwrap()];

    let processed: Vec<_> = outcomes
        .iter()
        .filter(|o| matches!(o, IngestOutcome::Processed { .. }))
        .collect();
    let duplicates: Vec<_> = outcomes
        .iter()
        .filter(|o| matches!(o, IngestOutcome::Duplicate { .. }))
        .collect();
    assert_eq!(processed.len(), 1, "outcomes: {:?}", outcomes);
    assert_eq!(duplicates.len(), 1, "outcomes: {:?}", outcomes);

    // Total chunks in the catalog equal those of a single ingest.
    let winner_id = match processed[0] {
        IngestOutcome::Processed { file_id, .. } => *file_id,
        _ => unreachable!(),
    };
    let winner_chunks = catalog.count_chunks(winner_id).await.unwrap();
    assert!(winner_chunks > 0);
    assert_eq!(catalog.counts().await.unwrap().chunks, winner_chunks);
}

#[tokio::test]
async fn offline_profile_classifies_against_the_taxonomy_registry() {
    use ingestion::chunker::RecursiveChunker;
    use ingestion::indexer::DeterministicEmbedder;
    use millrace_core::config::ProfileConfig;
    use storage::TaxonomyRegistry;

    let dir = tempdir().unwrap();
    let catalog = Catalog::open(dir.path().join("catalog.db")).await.unwrap();
    let store = Arc::new(VectorStore::open(dir.path().join("rag_db"), "chunks").await.unwrap());

    let registry = TaxonomyRegistry::new(catalog.clone());
    registry.resolve_or_create("content", "Retail").await.unwrap();

    let profile = ProfileConfig {
        llm_enabled: false,
        ..ProfileConfig::default()
    };
    let pipeline = IngestionPipeline::with_components(
        catalog.clone(),
        store,
        Arc::new(RecursiveChunker::default()),
        Arc::new(DeterministicEmbedder::default()),
        Arc::new(MockLlm::failing()), // must never be called
        profile,
        "v2",
    );

    // A chunk that is exactly a category name passes the match threshold.
    let outcome = pipeline
        .ingest(SourceDocument::from_upload("word.txt", b"Retail".to_vec()))
        .await
        .unwrap();
    let file_id = match outcome {
        IngestOutcome::Processed { file_id, .. } => file_id,
        other => panic!("expected processed, got {:?}", other),
    };
    let chunks = catalog.chunks_for_file(file_id).await.unwrap();
    assert_eq!(
        chunks[0].metadata["classification"]["category_level_2_sub"],
        "Retail"
    );

    // Loose prose collapses to the safe default instead of misclassifying.
    let outcome = pipeline
        .ingest(SourceDocument::from_upload(
            "prose.txt",
            b"our stores did well this quarter".to_vec(),
        ))
        .await
        .unwrap();
    let file_id = match outcome {
        IngestOutcome::Processed { file_id, .. } => file_id,
        other => panic!("expected processed, got {:?}", other),
    };
    let chunks = catalog.chunks_for_file(file_id).await.unwrap();
    assert_eq!(
        chunks[0].metadata["classification"]["category_level_1"],
        "Uncategorized"
    );
}

#[tokio::test]
async fn reconciliation_restores_vectors_lost_from_the_store() {
    let dir = tempdir().unwrap();
    let (catalog, store, pipeline) = pipeline(dir.path()).await;

    let text = "Reconciliation test passage with a reasonable amount of text.";
    pipeline
        .ingest(SourceDocument::from_upload("r.txt", text.as_bytes().to_vec()))
        .await
        .unwrap();
    assert_eq!(store.len(), 1);

    store.clear().await.unwrap();
    assert!(store.is_empty());

    let restored = pipeline.indexer().reconcile(&catalog).await.unwrap();
    assert_eq!(restored, 1);
    assert!(store.contains(&hash::semantic_hash(text)));
}

#[tokio::test]
async fn resume_reprocesses_a_requeued_file() {
    let dir = tempdir().unwrap();
    let (catalog, _store, pipeline) = pipeline(dir.path()).await;

    // Simulate a crash: the record exists with its hash but was re-queued.
    let source_path = dir.path().join("stuck.txt");
    tokio::fs::write(&source_path, "Content that was mid-flight during a crash.")
        .await
        .unwrap();

    let business = catalog.ensure_business("default".to_string()).await.unwrap();
    let mut record = millrace_core::model::FileRecord::new(
        business,
        "stuck.txt",
        millrace_core::model::FileType::Txt,
        source_path.display().to_string(),
    );
    record.set_file_hash(&hash::file_hash_path(&source_path).unwrap());
    catalog.insert_file(record.clone()).await.unwrap();

    let outcome = pipeline.resume(record.id).await.unwrap();
    let (total, _, _) = processed(&outcome);
    assert_eq!(total, 1);
    let file = catalog.get_file(record.id).await.unwrap().unwrap();
    assert_eq!(file.status, FileStatus::Processed);
}
