use config::{builder::DefaultState, Config, ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    pub model_name: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub prompt_version: String,
    pub endpoint: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    pub max_chunk_size: usize,
    pub overlap_ratio: f64,
    pub min_sentence_length: usize,
    pub semantic_chunking: bool,
    pub recursive_threshold: usize,
}

/// Vector store settings. The section keeps its historical `chromadb` name
/// so existing deployment configs keep working.
#[derive(Debug, Deserialize, Clone)]
pub struct VectorStoreConfig {
    pub persist_directory: String,
    pub collection_name: String,
    pub distance_metric: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    pub upload_dir: String,
    pub logs_dir: String,
    pub catalog_db: String,
    pub taxonomy_master: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FileWatcherConfig {
    pub auto_start: bool,
    pub settle_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModulesConfig {
    pub enabled: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FormatsConfig {
    pub supported: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeedsConfig {
    pub urls: Vec<String>,
    pub poll_interval_secs: u64,
    pub fetch_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProfileConfig {
    pub llm_enabled: bool,
    pub semantic_chunking: bool,
    pub recursive_fallback: bool,
    pub classification_confidence_threshold: f64,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            llm_enabled: true,
            semantic_chunking: true,
            recursive_fallback: true,
            classification_confidence_threshold: 0.35,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProfilesConfig {
    pub active: String,
    pub definitions: HashMap<String, ProfileConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub chunking: ChunkingConfig,
    pub chromadb: VectorStoreConfig,
    pub paths: PathsConfig,
    pub file_watcher: FileWatcherConfig,
    pub modules: ModulesConfig,
    pub formats: FormatsConfig,
    pub feeds: FeedsConfig,
    pub profiles: ProfilesConfig,
}

impl AppConfig {
    /// Layered load: coded defaults, then `config/default.yaml`, then the
    /// RUN_MODE overlay, then `MILLRACE_*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = defaults()?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(Environment::with_prefix("MILLRACE").separator("__"));

        builder.build()?.try_deserialize()
    }

    /// Coded defaults only; what tests and embedded uses start from.
    pub fn from_defaults() -> Result<Self, ConfigError> {
        defaults()?.build()?.try_deserialize()
    }

    pub fn active_profile(&self) -> ProfileConfig {
        self.profiles
            .definitions
            .get(&self.profiles.active)
            .cloned()
            .unwrap_or_default()
    }
}

fn string_list(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 8080)?
        .set_default("llm.model_name", "llama3")?
        .set_default("llm.temperature", 0.2)?
        .set_default("llm.max_tokens", 1024)?
        .set_default("llm.prompt_version", "v2")?
        .set_default("llm.endpoint", "http://127.0.0.1:11434/api/generate")?
        .set_default("llm.timeout_secs", 180)?
        .set_default("chunking.max_chunk_size", 600)?
        .set_default("chunking.overlap_ratio", 0.0)?
        .set_default("chunking.min_sentence_length", 150)?
        .set_default("chunking.semantic_chunking", true)?
        .set_default("chunking.recursive_threshold", 2000)?
        .set_default("chromadb.persist_directory", "data/rag_db")?
        .set_default("chromadb.collection_name", "content_chunks")?
        .set_default("chromadb.distance_metric", "cosine")?
        .set_default("paths.upload_dir", "data/uploads")?
        .set_default("paths.logs_dir", "logs")?
        .set_default("paths.catalog_db", "data/catalog.db")?
        .set_default("paths.taxonomy_master", "data/taxonomy_master.json")?
        .set_default("file_watcher.auto_start", true)?
        .set_default("file_watcher.settle_secs", 2)?
        .set_default(
            "modules.enabled",
            string_list(&["excel", "pdf", "docx", "txt", "json", "rss", "api"]),
        )?
        .set_default(
            "formats.supported",
            string_list(&["txt", "json", "csv", "xls", "xlsx", "pdf", "docx"]),
        )?
        .set_default("feeds.urls", Vec::<String>::new())?
        .set_default("feeds.poll_interval_secs", 900)?
        .set_default("feeds.fetch_timeout_secs", 30)?
        .set_default("profiles.active", "standard")?
        .set_default("profiles.definitions.standard.llm_enabled", true)?
        .set_default("profiles.definitions.standard.semantic_chunking", true)?
        .set_default("profiles.definitions.standard.recursive_fallback", true)?
        .set_default(
            "profiles.definitions.standard.classification_confidence_threshold",
            0.35,
        )?
        .set_default("profiles.definitions.offline.llm_enabled", false)?
        .set_default("profiles.definitions.offline.semantic_chunking", true)?
        .set_default("profiles.definitions.offline.recursive_fallback", true)?
        .set_default(
            "profiles.definitions.offline.classification_confidence_threshold",
            0.0,
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_section() {
        let cfg = AppConfig::from_defaults().unwrap();
        assert_eq!(cfg.chunking.max_chunk_size, 600);
        assert_eq!(cfg.chunking.min_sentence_length, 150);
        // Keys several modules read but older config files omit.
        assert!(cfg.chunking.semantic_chunking);
        assert_eq!(cfg.chunking.recursive_threshold, 2000);
        assert!(cfg.formats.supported.contains(&"xlsx".to_string()));
        assert_eq!(cfg.llm.timeout_secs, 180);
        assert_eq!(cfg.feeds.fetch_timeout_secs, 30);
        assert_eq!(cfg.chromadb.distance_metric, "cosine");
    }

    #[test]
    fn active_profile_resolves_and_falls_back() {
        let mut cfg = AppConfig::from_defaults().unwrap();
        assert!(cfg.active_profile().llm_enabled);

        cfg.profiles.active = "offline".to_string();
        assert!(!cfg.active_profile().llm_enabled);

        cfg.profiles.active = "missing".to_string();
        let fallback = cfg.active_profile();
        assert!(fallback.llm_enabled);
    }
}
