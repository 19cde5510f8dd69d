pub mod catalog;
pub mod taxonomy;
pub mod vector;
pub mod writer;

pub use catalog::{Catalog, CatalogCounts, CatalogError};
pub use taxonomy::{BestMatch, SyncReport, TaxonomyRegistry};
pub use vector::{QueryHit, VectorRecord, VectorStore, VectorStoreError};
pub use writer::{NewChunk, PersistOutcome, RelationalWriter};
