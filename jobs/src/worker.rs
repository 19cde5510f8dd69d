use crate::queue::{IngestJob, JobQueue};
use crate::watcher::ProcessedSet;
use ingestion::processor::IngestionPipeline;
use std::sync::Arc;
use storage::Catalog;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Orchestrator worker pool. Workers share one receiver behind a mutex and
/// pull files as they free up; per-job failures are logged and never take a
/// worker down.
pub fn spawn_workers(
    count: usize,
    receiver: mpsc::Receiver<IngestJob>,
    pipeline: Arc<IngestionPipeline>,
    processed: Option<Arc<ProcessedSet>>,
) -> Vec<JoinHandle<()>> {
    let shared = Arc::new(Mutex::new(receiver));
    (0..count.max(1))
        .map(|worker_id| {
            let shared = shared.clone();
            let pipeline = pipeline.clone();
            let processed = processed.clone();
            tokio::spawn(async move {
                info!(worker_id, "ingest worker started");
                loop {
                    let job = { shared.lock().await.recv().await };
                    let Some(job) = job else { break };
                    if let Err(e) = handle_job(job, &pipeline, processed.as_deref()).await {
                        error!(worker_id, error = %format!("{e:#}"), "ingest job failed");
                    }
                }
                info!(worker_id, "ingest worker stopped");
            })
        })
        .collect()
}

async fn handle_job(
    job: IngestJob,
    pipeline: &IngestionPipeline,
    processed: Option<&ProcessedSet>,
) -> anyhow::Result<()> {
    match job {
        IngestJob::WatchedFile { path } => {
            let doc = ingestion::processor::SourceDocument::from_path(&path).await?;
            let outcome = pipeline.ingest(doc).await?;
            info!(path = %path.display(), outcome = ?outcome, "watched file ingested");
            if let Some(set) = processed {
                set.record(&path.display().to_string()).await?;
            }
        }
        IngestJob::Resume { file_id } => {
            let outcome = pipeline.resume(file_id).await?;
            info!(%file_id, outcome = ?outcome, "re-queued file resumed");
        }
    }
    Ok(())
}

/// Startup pass: push files stuck in `processing` longer than the grace
/// period back onto the queue.
pub async fn requeue_stale(
    catalog: &Catalog,
    queue: &dyn JobQueue,
    grace: chrono::Duration,
) -> anyhow::Result<usize> {
    let stale = catalog.requeue_stale(grace).await?;
    for record in &stale {
        queue
            .enqueue(IngestJob::Resume {
                file_id: record.id,
            })
            .await?;
    }
    if !stale.is_empty() {
        info!(count = stale.len(), "re-queued stale in-flight files");
    }
    Ok(stale.len())
}
