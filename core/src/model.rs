use crate::reasoning::ReasoningBlock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const DEFAULT_BUSINESS_NAME: &str = "default";

/// Source formats the pipeline understands. `Xlsx` covers `.xls` as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Pdf,
    Docx,
    Txt,
    Csv,
    Xlsx,
    Json,
    Rss,
    Api,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Pdf => "pdf",
            FileType::Docx => "docx",
            FileType::Txt => "txt",
            FileType::Csv => "csv",
            FileType::Xlsx => "xlsx",
            FileType::Json => "json",
            FileType::Rss => "rss",
            FileType::Api => "api",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pdf" => Some(FileType::Pdf),
            "docx" => Some(FileType::Docx),
            "txt" => Some(FileType::Txt),
            "csv" => Some(FileType::Csv),
            "xls" | "xlsx" => Some(FileType::Xlsx),
            "json" => Some(FileType::Json),
            "rss" => Some(FileType::Rss),
            "api" => Some(FileType::Api),
            _ => None,
        }
    }

    /// Documents authored by the business itself, as opposed to feed or API
    /// material relayed from elsewhere.
    pub fn is_primary_source(&self) -> bool {
        matches!(
            self,
            FileType::Pdf | FileType::Docx | FileType::Csv | FileType::Xlsx
        )
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Uploaded,
    Processing,
    Processed,
    Duplicate,
    Failed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Uploaded => "uploaded",
            FileStatus::Processing => "processing",
            FileStatus::Processed => "processed",
            FileStatus::Duplicate => "duplicate",
            FileStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "uploaded" => Some(FileStatus::Uploaded),
            "processing" => Some(FileStatus::Processing),
            "processed" => Some(FileStatus::Processed),
            "duplicate" => Some(FileStatus::Duplicate),
            "failed" => Some(FileStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FileStatus::Processed | FileStatus::Duplicate | FileStatus::Failed
        )
    }
}

/// One ingestion attempt of a source. `metadata` always carries `file_hash`
/// once the record has left `uploaded`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: Uuid,
    pub business_id: Uuid,
    pub file_name: String,
    pub file_type: FileType,
    /// Filesystem path or source URL.
    pub source: String,
    pub metadata: Value,
    pub parser_used: Option<String>,
    pub status: FileStatus,
    pub total_chunks: i64,
    pub unique_chunks: i64,
    pub duplicate_chunks: i64,
    pub dedup_ratio: f64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn new(
        business_id: Uuid,
        file_name: impl Into<String>,
        file_type: FileType,
        source: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            business_id,
            file_name: file_name.into(),
            file_type,
            source: source.into(),
            metadata: Value::Object(Default::default()),
            parser_used: None,
            status: FileStatus::Uploaded,
            total_chunks: 0,
            unique_chunks: 0,
            duplicate_chunks: 0,
            dedup_ratio: 0.0,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn file_hash(&self) -> Option<&str> {
        self.metadata.get("file_hash").and_then(Value::as_str)
    }

    pub fn set_file_hash(&mut self, hash: &str) {
        if let Value::Object(map) = &mut self.metadata {
            map.insert("file_hash".to_string(), Value::String(hash.to_string()));
        }
    }
}

/// One semantic chunk of one file. Never mutated after insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: Uuid,
    pub file_id: Uuid,
    pub business_id: Uuid,
    pub chunk_index: i64,
    pub text: String,
    pub cleaned_text: String,
    pub tokens: i64,
    pub source_type: FileType,
    pub metadata: Value,
    pub confidence: f64,
    pub semantic_hash: String,
    pub global_content_id: Option<Uuid>,
    pub reasoning: ReasoningBlock,
    pub is_duplicate: bool,
    pub created_at: DateTime<Utc>,
}

/// Content-addressed deduplication anchor: at most one entry per
/// `semantic_hash`; `occurrence_count` only ever increases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalContentEntry {
    pub id: Uuid,
    pub semantic_hash: String,
    pub cleaned_text: String,
    pub raw_text: String,
    pub tokens: i64,
    pub business_id: Uuid,
    pub first_seen_file_id: Uuid,
    pub source_type: FileType,
    pub occurrence_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxonomyCategory {
    pub id: Uuid,
    pub name: String,
    pub group: String,
    pub description: String,
    pub synonyms: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Binds a concrete entity (chunks today) to a category/subcategory/business
/// tuple. The fingerprint is derived from the entity identity plus its
/// semantic hash, so re-linking the same entity is a conflict while the same
/// content in another file links cleanly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityLink {
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub category_id: Uuid,
    pub subcategory_id: Option<Uuid>,
    pub business_id: Uuid,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedStatus {
    #[default]
    Idle,
    Active,
    Partial,
    Failed,
}

impl FeedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedStatus::Idle => "idle",
            FeedStatus::Active => "active",
            FeedStatus::Partial => "partial",
            FeedStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(FeedStatus::Idle),
            "active" => Some(FeedStatus::Active),
            "partial" => Some(FeedStatus::Partial),
            "failed" => Some(FeedStatus::Failed),
            _ => None,
        }
    }
}

/// Per-feed metrics for scheduled pulls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSource {
    pub id: Uuid,
    pub feed_url: String,
    pub entries_seen: i64,
    pub entries_ingested: i64,
    pub failures: i64,
    pub status: FeedStatus,
    pub avg_confidence: f64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Business {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_hash_round_trips_through_metadata() {
        let mut record = FileRecord::new(Uuid::new_v4(), "a.txt", FileType::Txt, "/tmp/a.txt");
        assert_eq!(record.file_hash(), None);
        record.set_file_hash("abc123");
        assert_eq!(record.file_hash(), Some("abc123"));
    }

    #[test]
    fn xls_and_xlsx_map_to_the_same_type() {
        assert_eq!(FileType::parse("xls"), Some(FileType::Xlsx));
        assert_eq!(FileType::parse("xlsx"), Some(FileType::Xlsx));
    }

    #[test]
    fn primary_source_covers_authored_documents_only() {
        assert!(FileType::Pdf.is_primary_source());
        assert!(FileType::Csv.is_primary_source());
        assert!(!FileType::Rss.is_primary_source());
        assert!(!FileType::Txt.is_primary_source());
    }
}
