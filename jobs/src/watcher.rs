use crate::queue::{IngestJob, JobQueue};
use ingestion::router::{self, ParserKey};
use notify::{RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

/// The append-only ledger of paths that already completed ingestion.
/// Duplicate lines are harmless; the in-memory set keeps appends unique
/// within one process.
pub struct ProcessedSet {
    path: PathBuf,
    seen: Mutex<HashSet<String>>,
}

impl ProcessedSet {
    pub async fn load(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let seen = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
            Err(e) => return Err(e),
        };
        Ok(Self {
            path,
            seen: Mutex::new(seen),
        })
    }

    pub async fn contains(&self, path: &str) -> bool {
        self.seen.lock().await.contains(path)
    }

    pub async fn record(&self, path: &str) -> std::io::Result<()> {
        let mut seen = self.seen.lock().await;
        if !seen.insert(path.to_string()) {
            return Ok(());
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(format!("{}\n", path).as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Non-recursive watcher over the upload directory. New regular files with
/// supported extensions settle briefly (so writers can finish), then join
/// the ingest queue; the worker appends them to the processed set when
/// their run reaches a terminal state.
#[derive(Clone)]
pub struct UploadWatcher {
    dir: PathBuf,
    queue: Arc<dyn JobQueue>,
    processed: Arc<ProcessedSet>,
    settle: Duration,
    pending: Arc<Mutex<HashSet<PathBuf>>>,
}

impl UploadWatcher {
    pub fn new(
        dir: impl Into<PathBuf>,
        queue: Arc<dyn JobQueue>,
        processed: Arc<ProcessedSet>,
        settle: Duration,
    ) -> Self {
        Self {
            dir: dir.into(),
            queue,
            processed,
            settle,
            pending: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Sweep files already sitting in the directory, then follow filesystem
    /// events. Runs until the process shuts down.
    pub async fn run(self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let swept = self.scan_existing().await?;
        info!(dir = %self.dir.display(), swept, "upload watcher started");

        let (tx, mut rx) = mpsc::channel::<notify::Result<notify::Event>>(256);
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.blocking_send(res);
        })?;
        watcher.watch(&self.dir, RecursiveMode::NonRecursive)?;

        while let Some(event) = rx.recv().await {
            match event {
                Ok(event) => {
                    if matches!(
                        event.kind,
                        notify::EventKind::Create(_) | notify::EventKind::Modify(_)
                    ) {
                        for path in event.paths {
                            let watcher = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = watcher.consider(path.clone()).await {
                                    warn!(path = %path.display(), error = %format!("{e:#}"), "watch event dropped");
                                }
                            });
                        }
                    }
                }
                Err(e) => warn!(error = %e, "watch error"),
            }
        }
        Ok(())
    }

    /// Enqueue every eligible file already present in the directory.
    pub async fn scan_existing(&self) -> anyhow::Result<usize> {
        let mut enqueued = 0usize;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() && self.consider(entry.path()).await? {
                enqueued += 1;
            }
        }
        Ok(enqueued)
    }

    /// Apply the skip rules, wait for the writer to settle, enqueue.
    /// Returns whether the path was handed to the queue.
    pub async fn consider(&self, path: PathBuf) -> anyhow::Result<bool> {
        let file_name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => return Ok(false),
        };
        if router::is_temporary_name(&file_name) {
            return Ok(false);
        }
        if router::route(&file_name) == ParserKey::Unsupported {
            return Ok(false);
        }
        if self.processed.contains(&path.display().to_string()).await {
            return Ok(false);
        }
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {}
            _ => return Ok(false),
        }

        {
            let mut pending = self.pending.lock().await;
            if !pending.insert(path.clone()) {
                return Ok(false);
            }
        }

        // Let whoever is writing the file finish before reading it.
        tokio::time::sleep(self.settle).await;

        let result = self
            .queue
            .enqueue(IngestJob::WatchedFile { path: path.clone() })
            .await;
        self.pending.lock().await.remove(&path);
        result?;
        Ok(true)
    }
}
