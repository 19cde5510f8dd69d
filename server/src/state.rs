use crate::cache::SearchCache;
use ingestion::indexer::VectorIndexer;
use ingestion::processor::IngestionPipeline;
use std::path::PathBuf;
use std::sync::Arc;
use storage::{Catalog, TaxonomyRegistry, VectorStore};

pub struct AppState {
    pub catalog: Catalog,
    pub vector: Arc<VectorStore>,
    pub pipeline: Arc<IngestionPipeline>,
    pub indexer: VectorIndexer,
    pub taxonomy: TaxonomyRegistry,
    pub taxonomy_master: PathBuf,
    pub cache: SearchCache,
}

impl AppState {
    pub fn new(
        catalog: Catalog,
        vector: Arc<VectorStore>,
        pipeline: Arc<IngestionPipeline>,
        taxonomy_master: impl Into<PathBuf>,
        cache: SearchCache,
    ) -> Arc<Self> {
        let indexer = pipeline.indexer().clone();
        let taxonomy = TaxonomyRegistry::new(catalog.clone());
        Arc::new(Self {
            catalog,
            vector,
            pipeline,
            indexer,
            taxonomy,
            taxonomy_master: taxonomy_master.into(),
            cache,
        })
    }
}
