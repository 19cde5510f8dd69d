use ingestion::processor::IngestionPipeline;
use jobs::poller::FeedPoller;
use jobs::queue::ChannelJobQueue;
use jobs::watcher::{ProcessedSet, UploadWatcher};
use llm::client::HttpLlmClient;
use millrace_core::config::AppConfig;
use server::{app, AppState, SearchCache};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use storage::{Catalog, TaxonomyRegistry, VectorStore};
use tracing::{info, warn};

const INGEST_QUEUE_CAPACITY: usize = 256;
const ORCHESTRATOR_WORKERS: usize = 4;
const STALE_GRACE_MINUTES: i64 = 10;
const SEARCH_CACHE_EXPIRY_HOURS: i64 = 24;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    millrace_core::init_tracing();
    let config = AppConfig::load()?;

    tokio::fs::create_dir_all(&config.paths.upload_dir).await?;
    tokio::fs::create_dir_all(&config.paths.logs_dir).await?;

    let catalog = Catalog::open(&config.paths.catalog_db).await?;
    let vector = Arc::new(
        VectorStore::open(
            &config.chromadb.persist_directory,
            &config.chromadb.collection_name,
        )
        .await?,
    );

    let taxonomy = TaxonomyRegistry::new(catalog.clone());
    if Path::new(&config.paths.taxonomy_master).exists() {
        let report = taxonomy.sync_master(&config.paths.taxonomy_master).await?;
        info!(
            inserted = report.inserted,
            updated = report.updated,
            skipped = report.skipped,
            "taxonomy master synced"
        );
    }

    let client = Arc::new(HttpLlmClient::new(&config.llm)?);
    let pipeline = Arc::new(IngestionPipeline::from_config(
        &config,
        catalog.clone(),
        vector.clone(),
        client,
    ));

    // Re-embed hashes the vector store lost; the catalog is authoritative.
    match pipeline.indexer().reconcile(&catalog).await {
        Ok(0) => {}
        Ok(restored) => info!(restored, "vector store reconciled on startup"),
        Err(e) => warn!(error = %format!("{e:#}"), "vector reconciliation failed"),
    }

    let (queue, receiver) = ChannelJobQueue::channel(INGEST_QUEUE_CAPACITY);
    let queue = Arc::new(queue);
    let processed = Arc::new(
        ProcessedSet::load(Path::new(&config.paths.upload_dir).join(".processed_files")).await?,
    );
    let _workers = jobs::worker::spawn_workers(
        ORCHESTRATOR_WORKERS,
        receiver,
        pipeline.clone(),
        Some(processed.clone()),
    );
    jobs::worker::requeue_stale(
        &catalog,
        queue.as_ref(),
        chrono::Duration::minutes(STALE_GRACE_MINUTES),
    )
    .await?;

    if config.file_watcher.auto_start {
        let watcher = UploadWatcher::new(
            &config.paths.upload_dir,
            queue.clone(),
            processed.clone(),
            Duration::from_secs(config.file_watcher.settle_secs),
        );
        tokio::spawn(async move {
            if let Err(e) = watcher.run().await {
                warn!(error = %format!("{e:#}"), "upload watcher exited");
            }
        });
    }

    if !config.feeds.urls.is_empty() {
        let poller = FeedPoller::new(
            catalog.clone(),
            pipeline.clone(),
            config.feeds.urls.clone(),
            Duration::from_secs(config.feeds.poll_interval_secs),
            Duration::from_secs(config.feeds.fetch_timeout_secs),
        )?;
        tokio::spawn(poller.run());
    }

    let cache = SearchCache::new(
        Path::new(&config.paths.logs_dir).join("search_cache.json"),
        SEARCH_CACHE_EXPIRY_HOURS,
    );
    let state = AppState::new(
        catalog,
        vector,
        pipeline,
        &config.paths.taxonomy_master,
        cache,
    );
    let router = app(state).layer(tower_http::trace::TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!(%addr, "millrace listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}
