use crate::catalog::{now_str, Catalog, CatalogError};
use millrace_core::embedding::{cosine_similarity, embed_text};
use millrace_core::model::TaxonomyCategory;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub const UNCATEGORIZED: &str = "Uncategorized";
pub const GENERAL_BUSINESS: &str = "General Business";

const AUTO_GROUP: &str = "content";
const AUTO_DESCRIPTION: &str = "Auto-generated";
const MASTER_DESCRIPTION: &str = "Imported from taxonomy master";

const LITERAL_WEIGHT: f64 = 0.6;
const EMBEDDING_WEIGHT: f64 = 0.4;
const MATCH_THRESHOLD: f64 = 0.99;

const MATCH_MODEL: &str = "taxonomy-match-v1";
const MATCH_DIMS: usize = 64;

#[derive(Error, Debug)]
pub enum TaxonomyError {
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("Master document I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Master document parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Malformed master document: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BestMatch {
    pub category: String,
    pub subcategory: String,
    pub confidence: f64,
}

/// Two-level controlled vocabulary. Categories auto-create on first use and
/// a master document can be re-synced at any time without churn.
#[derive(Clone)]
pub struct TaxonomyRegistry {
    catalog: Catalog,
}

impl TaxonomyRegistry {
    pub fn new(catalog: Catalog) -> Self {
        Self { catalog }
    }

    /// Case-insensitive resolve by name; creates the category under the
    /// `content` group when nothing matches. The group argument is where the
    /// caller expects the name to live and only informs logging; lookup is
    /// by name so synced vocabularies keep winning over auto-creation.
    pub async fn resolve_or_create(
        &self,
        group: &str,
        name: &str,
    ) -> Result<Uuid, CatalogError> {
        let group = group.to_string();
        let name = name.trim().to_string();
        self.catalog
            .with_conn(move |conn| {
                let id = resolve_or_create_in(conn, &name)?;
                debug!(category = %name, requested_group = %group, "taxonomy resolve");
                Ok(id)
            })
            .await
    }

    pub async fn all_categories(&self) -> Result<Vec<TaxonomyCategory>, CatalogError> {
        self.catalog
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, category_group, description, synonyms, created_at, \
                     updated_at FROM taxonomy_categories ORDER BY category_group, name",
                )?;
                let rows = stmt
                    .query_map([], category_from_row)?
                    .collect::<Result<_, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Import the master document (section -> values + synonyms). Safe to
    /// re-run: an unchanged document reports inserted=0, updated=0.
    pub async fn sync_master(&self, path: impl AsRef<Path>) -> Result<SyncReport, TaxonomyError> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        let doc: serde_json::Value = serde_json::from_str(&raw)?;
        let sections = doc
            .as_object()
            .ok_or_else(|| TaxonomyError::Malformed("top level must be an object".into()))?;

        let mut entries: Vec<(String, String, Vec<String>)> = Vec::new();
        for (section, body) in sections {
            if matches!(section.as_str(), "version" | "last_updated" | "description") {
                continue;
            }
            let values = body
                .get("values")
                .and_then(|v| v.as_array())
                .ok_or_else(|| {
                    TaxonomyError::Malformed(format!("section '{}' has no values array", section))
                })?;
            let synonyms = body.get("synonyms").and_then(|v| v.as_object());
            for value in values {
                let name = value
                    .as_str()
                    .ok_or_else(|| {
                        TaxonomyError::Malformed(format!(
                            "section '{}' contains a non-string value",
                            section
                        ))
                    })?
                    .to_string();
                let mut names: Vec<String> = synonyms
                    .and_then(|map| map.get(&name))
                    .and_then(|v| v.as_array())
                    .map(|list| {
                        list.iter()
                            .filter_map(|s| s.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                names.sort();
                entries.push((section.clone(), name, names));
            }
        }

        let report = self
            .catalog
            .with_conn(move |conn| {
                let mut report = SyncReport::default();
                let tx = conn.transaction()?;
                for (group, name, synonyms) in &entries {
                    sync_one(&tx, group, name, synonyms, &mut report)?;
                }
                tx.commit()?;
                Ok(report)
            })
            .await?;

        info!(
            inserted = report.inserted,
            updated = report.updated,
            skipped = report.skipped,
            "taxonomy master sync complete"
        );
        Ok(report)
    }

    /// Blend of literal substring similarity and name-embedding cosine.
    /// Anything below the threshold collapses to the safe default rather
    /// than silently misclassifying.
    pub async fn best_match(&self, text: &str) -> Result<BestMatch, CatalogError> {
        let categories = self.all_categories().await?;
        let lower = text.to_lowercase();
        let text_embedding = embed_text(text, MATCH_MODEL, MATCH_DIMS);

        let mut best: Option<(f64, &TaxonomyCategory)> = None;
        for category in &categories {
            let literal = literal_similarity(&lower, &category.name.to_lowercase());
            let name_embedding = embed_text(&category.name, MATCH_MODEL, MATCH_DIMS);
            let semantic = f64::from(cosine_similarity(&text_embedding, &name_embedding)).max(0.0);
            let score = LITERAL_WEIGHT * literal + EMBEDDING_WEIGHT * semantic;
            if best.map(|(s, _)| score > s).unwrap_or(true) {
                best = Some((score, category));
            }
        }

        match best {
            Some((score, category)) if score >= MATCH_THRESHOLD => Ok(BestMatch {
                category: category.group.clone(),
                subcategory: category.name.clone(),
                confidence: score,
            }),
            Some((score, _)) => Ok(BestMatch {
                category: UNCATEGORIZED.to_string(),
                subcategory: GENERAL_BUSINESS.to_string(),
                confidence: score,
            }),
            None => Ok(BestMatch {
                category: UNCATEGORIZED.to_string(),
                subcategory: GENERAL_BUSINESS.to_string(),
                confidence: 0.0,
            }),
        }
    }
}

pub(crate) fn resolve_or_create_in(
    conn: &Connection,
    name: &str,
) -> Result<Uuid, CatalogError> {
    let name = if name.trim().is_empty() {
        UNCATEGORIZED
    } else {
        name.trim()
    };
    if let Some(id) = conn
        .query_row(
            "SELECT id FROM taxonomy_categories WHERE name = ?1
             ORDER BY created_at ASC LIMIT 1",
            params![name],
            |row| row.get::<_, String>(0),
        )
        .optional()?
    {
        return parse_uuid(&id);
    }
    conn.execute(
        "INSERT INTO taxonomy_categories
         (id, name, category_group, description, synonyms, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, '[]', ?5, ?5)
         ON CONFLICT(category_group, name) DO NOTHING",
        params![
            Uuid::new_v4().to_string(),
            name,
            AUTO_GROUP,
            AUTO_DESCRIPTION,
            now_str()
        ],
    )?;
    let id: String = conn.query_row(
        "SELECT id FROM taxonomy_categories WHERE name = ?1 ORDER BY created_at ASC LIMIT 1",
        params![name],
        |row| row.get(0),
    )?;
    parse_uuid(&id)
}

fn sync_one(
    conn: &Connection,
    group: &str,
    name: &str,
    synonyms: &[String],
    report: &mut SyncReport,
) -> Result<(), CatalogError> {
    let synonyms_json = serde_json::to_string(synonyms)?;
    let existing: Option<(String, String, String)> = conn
        .query_row(
            "SELECT id, description, synonyms FROM taxonomy_categories
             WHERE category_group = ?1 AND name = ?2",
            params![group, name],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    match existing {
        None => {
            conn.execute(
                "INSERT INTO taxonomy_categories
                 (id, name, category_group, description, synonyms, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    Uuid::new_v4().to_string(),
                    name,
                    group,
                    MASTER_DESCRIPTION,
                    synonyms_json,
                    now_str()
                ],
            )?;
            report.inserted += 1;
        }
        Some((id, description, stored_synonyms)) => {
            if description == MASTER_DESCRIPTION && stored_synonyms == synonyms_json {
                report.skipped += 1;
            } else {
                conn.execute(
                    "UPDATE taxonomy_categories
                     SET description = ?2, synonyms = ?3, updated_at = ?4 WHERE id = ?1",
                    params![id, MASTER_DESCRIPTION, synonyms_json, now_str()],
                )?;
                report.updated += 1;
            }
        }
    }
    Ok(())
}

fn literal_similarity(text_lower: &str, name_lower: &str) -> f64 {
    if name_lower.is_empty() {
        return 0.0;
    }
    if text_lower.contains(name_lower) {
        return 1.0;
    }
    let name_tokens: Vec<&str> = name_lower.split_whitespace().collect();
    if name_tokens.is_empty() {
        return 0.0;
    }
    let hits = name_tokens
        .iter()
        .filter(|token| text_lower.contains(*token))
        .count();
    hits as f64 / name_tokens.len() as f64
}

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, CatalogError> {
    Uuid::parse_str(s).map_err(|_| CatalogError::NotFound)
}

fn category_from_row(row: &Row) -> rusqlite::Result<TaxonomyCategory> {
    let id: String = row.get(0)?;
    let synonyms: String = row.get(4)?;
    let created: String = row.get(5)?;
    let updated: String = row.get(6)?;
    Ok(TaxonomyCategory {
        id: Uuid::parse_str(&id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        name: row.get(1)?,
        group: row.get(2)?,
        description: row.get(3)?,
        synonyms: serde_json::from_str(&synonyms).unwrap_or_default(),
        created_at: chrono::DateTime::parse_from_rfc3339(&created)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    5,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
        updated_at: chrono::DateTime::parse_from_rfc3339(&updated)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    6,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
    })
}
