use std::path::PathBuf;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum IngestJob {
    /// A file the directory watcher settled on; the worker records it in
    /// the processed-set file once ingestion reaches a terminal state.
    WatchedFile { path: PathBuf },
    /// A record re-queued after a crash left it in `processing`.
    Resume { file_id: Uuid },
}

#[async_trait::async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: IngestJob) -> anyhow::Result<()>;
}

/// In-memory queue over a Tokio channel; producers share the sender, the
/// worker pool drains the receiver.
pub struct ChannelJobQueue {
    sender: mpsc::Sender<IngestJob>,
}

impl ChannelJobQueue {
    pub fn new(sender: mpsc::Sender<IngestJob>) -> Self {
        Self { sender }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<IngestJob>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self::new(sender), receiver)
    }
}

#[async_trait::async_trait]
impl JobQueue for ChannelJobQueue {
    async fn enqueue(&self, job: IngestJob) -> anyhow::Result<()> {
        self.sender
            .send(job)
            .await
            .map_err(|e| anyhow::anyhow!("queue send error: {}", e))
    }
}
