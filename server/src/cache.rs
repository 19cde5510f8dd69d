use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    timestamp: i64,
    results: Value,
}

#[derive(Debug, Serialize)]
pub struct CacheStats {
    pub status: &'static str,
    pub entries: usize,
    pub file_path: String,
    pub file_size_kb: f64,
    pub oldest_entry: Option<String>,
    pub newest_entry: Option<String>,
    pub cache_expiry_hours: i64,
}

/// File-backed cache for search results, with timestamped entries and an
/// expiry window the admin surface can flush on demand.
pub struct SearchCache {
    path: PathBuf,
    expiry_hours: i64,
    lock: Mutex<()>,
}

impl SearchCache {
    pub fn new(path: impl Into<PathBuf>, expiry_hours: i64) -> Self {
        Self {
            path: path.into(),
            expiry_hours: expiry_hours.max(1),
            lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> HashMap<String, CacheEntry> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(error = %e, "search cache unreadable, treating as empty");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        }
    }

    async fn save(&self, entries: &HashMap<String, CacheEntry>) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let serialized = serde_json::to_string(entries).unwrap_or_else(|_| "{}".to_string());
        tokio::fs::write(&self.path, serialized).await
    }

    pub async fn get(&self, query: &str) -> Option<Value> {
        let _guard = self.lock.lock().await;
        let entries = self.load().await;
        let entry = entries.get(query)?;
        if self.is_expired(entry.timestamp) {
            return None;
        }
        Some(entry.results.clone())
    }

    pub async fn put(&self, query: &str, results: Value) -> std::io::Result<()> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await;
        entries.insert(
            query.to_string(),
            CacheEntry {
                timestamp: Utc::now().timestamp(),
                results,
            },
        );
        self.save(&entries).await
    }

    pub async fn stats(&self) -> CacheStats {
        let _guard = self.lock.lock().await;
        let entries = self.load().await;
        if entries.is_empty() {
            return CacheStats {
                status: "empty",
                entries: 0,
                file_path: self.path.display().to_string(),
                file_size_kb: 0.0,
                oldest_entry: None,
                newest_entry: None,
                cache_expiry_hours: self.expiry_hours,
            };
        }

        let timestamps: Vec<i64> = entries.values().map(|e| e.timestamp).collect();
        let file_size_kb = tokio::fs::metadata(&self.path)
            .await
            .map(|m| (m.len() as f64 / 1024.0 * 100.0).round() / 100.0)
            .unwrap_or(0.0);
        CacheStats {
            status: "active",
            entries: entries.len(),
            file_path: self.path.display().to_string(),
            file_size_kb,
            oldest_entry: timestamps.iter().min().copied().map(iso),
            newest_entry: timestamps.iter().max().copied().map(iso),
            cache_expiry_hours: self.expiry_hours,
        }
    }

    /// Remove the cache file entirely.
    pub async fn clear(&self) -> std::io::Result<()> {
        let _guard = self.lock.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Drop only entries past the expiry window; returns how many went.
    pub async fn clear_expired(&self) -> std::io::Result<usize> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await;
        let before = entries.len();
        entries.retain(|_, entry| !self.is_expired(entry.timestamp));
        let removed = before - entries.len();
        if removed > 0 {
            self.save(&entries).await?;
        }
        Ok(removed)
    }

    fn is_expired(&self, timestamp: i64) -> bool {
        let age_secs = Utc::now().timestamp() - timestamp;
        age_secs > self.expiry_hours * 3600
    }
}

fn iso(timestamp: i64) -> String {
    Utc.timestamp_opt(timestamp, 0)
        .single()
        .map(|dt: DateTime<Utc>| dt.to_rfc3339())
        .unwrap_or_default()
}
