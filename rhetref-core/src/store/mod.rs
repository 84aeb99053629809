mod sqlite;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::detector::Finding;

pub use sqlite::SqliteDedupStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("no database at {0}")]
    NotFound(PathBuf),
    #[error("value out of range: {0}")]
    OutOfRange(String),
    #[error("failed to open database at {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error("blocking store task failed: {0}")]
    Join(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// One decided pipeline outcome, kept for offline inspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityRecord {
    pub item_id: String,
    pub source_account: String,
    pub item_text: String,
    pub outcome: String,
    pub findings: Vec<Finding>,
    pub max_confidence: Option<f64>,
    pub reply_text: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub processed_removed: usize,
    pub activity_removed: usize,
}

/// Durable record of processed item ids.
///
/// `mark_processed` on an id that is already present is a no-op and returns
/// `false`, so concurrent writers never fail on each other.
#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn is_processed(&self, item_id: &str) -> StoreResult<bool>;
    async fn mark_processed(&self, item_id: &str, source_account: &str) -> StoreResult<bool>;
    async fn record_activity(&self, record: &ActivityRecord) -> StoreResult<()>;
}

#[async_trait]
impl DedupStore for SqliteDedupStore {
    async fn is_processed(&self, item_id: &str) -> StoreResult<bool> {
        let store = self.clone();
        let item_id = item_id.to_string();
        tokio::task::spawn_blocking(move || store.contains(&item_id))
            .await
            .map_err(|err| StoreError::Join(err.to_string()))?
    }

    async fn mark_processed(&self, item_id: &str, source_account: &str) -> StoreResult<bool> {
        let store = self.clone();
        let item_id = item_id.to_string();
        let source_account = source_account.to_string();
        tokio::task::spawn_blocking(move || store.insert(&item_id, &source_account, Utc::now()))
            .await
            .map_err(|err| StoreError::Join(err.to_string()))?
    }

    async fn record_activity(&self, record: &ActivityRecord) -> StoreResult<()> {
        let store = self.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || store.append_activity(&record))
            .await
            .map_err(|err| StoreError::Join(err.to_string()))?
    }
}
