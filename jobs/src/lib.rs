pub mod poller;
pub mod queue;
pub mod watcher;
pub mod worker;

pub use poller::{FeedEntry, FeedPoller, FeedRunStats};
pub use queue::{ChannelJobQueue, IngestJob, JobQueue};
pub use watcher::{ProcessedSet, UploadWatcher};
pub use worker::{requeue_stale, spawn_workers};
