pub mod chunker;
pub mod dedup;
pub mod extract;
pub mod indexer;
pub mod processor;
pub mod router;
pub mod visual;

pub use chunker::{Chunker, ChunkingParams, RecursiveChunker};
pub use indexer::{DeterministicEmbedder, Embedder, VectorIndexer, VectorItem};
pub use processor::{IngestOutcome, IngestionError, IngestionPipeline, SourceDocument};
pub use router::ParserKey;
