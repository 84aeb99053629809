use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::detector::Finding;

use super::{ActivityRecord, PruneReport, StoreError, StoreResult};

const DEDUP_SCHEMA: &str = include_str!("../../../sql/dedup.sql");

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;\n\
         PRAGMA synchronous = NORMAL;\n\
         PRAGMA temp_store = MEMORY;\n\
         PRAGMA busy_timeout = 5000;\n",
    )
}

/// SQLite-backed dedup store. Cheap to clone; every call opens its own
/// connection.
#[derive(Debug, Clone)]
pub struct SqliteDedupStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteDedupStore {
    /// Store at `path`, creating the file and its parent directories on
    /// first use.
    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            flags: OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        })
    }

    /// Store at `path`, which must already exist.
    pub fn open_existing(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(StoreError::NotFound(path));
        }
        Ok(Self {
            path,
            flags: OpenFlags::SQLITE_OPEN_READ_WRITE,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> StoreResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            StoreError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        configure_connection(&conn).map_err(|source| StoreError::OpenDatabase {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute_batch(DEDUP_SCHEMA)?;
        Ok(())
    }

    pub fn contains(&self, item_id: &str) -> StoreResult<bool> {
        let conn = self.open()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM processed_items WHERE item_id = ?1",
                params![item_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Returns `true` when the id was newly recorded.
    pub fn insert(
        &self,
        item_id: &str,
        source_account: &str,
        processed_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let conn = self.open()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO processed_items (item_id, processed_at, source_account)
             VALUES (?1, ?2, ?3)",
            params![item_id, processed_at, source_account],
        )?;
        Ok(inserted > 0)
    }

    pub fn append_activity(&self, record: &ActivityRecord) -> StoreResult<()> {
        let conn = self.open()?;
        let findings = serde_json::to_string(&record.findings)?;
        conn.execute(
            "INSERT INTO activity (
                item_id, source_account, item_text, outcome, findings,
                max_confidence, reply_text, recorded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                &record.item_id,
                &record.source_account,
                &record.item_text,
                &record.outcome,
                findings,
                record.max_confidence,
                &record.reply_text,
                record.recorded_at,
            ],
        )?;
        Ok(())
    }

    /// Delete dedup and activity rows older than `days`.
    pub fn prune_older_than(&self, days: u32) -> StoreResult<PruneReport> {
        let cutoff = ChronoDuration::try_days(i64::from(days))
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .ok_or_else(|| StoreError::OutOfRange(format!("retention of {days} days")))?;
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let processed_removed = tx.execute(
            "DELETE FROM processed_items WHERE processed_at < ?1",
            params![cutoff],
        )?;
        let activity_removed =
            tx.execute("DELETE FROM activity WHERE recorded_at < ?1", params![cutoff])?;
        tx.commit()?;
        Ok(PruneReport {
            processed_removed,
            activity_removed,
        })
    }

    pub fn processed_count(&self) -> StoreResult<i64> {
        let conn = self.open()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM processed_items", [], |row| row.get(0))?)
    }

    /// Outcome counts for activity recorded at or after `since`.
    pub fn outcome_counts(&self, since: DateTime<Utc>) -> StoreResult<Vec<(String, i64)>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT outcome, COUNT(*) FROM activity
             WHERE recorded_at >= ?1
             GROUP BY outcome
             ORDER BY outcome",
        )?;
        let rows = stmt.query_map(params![since], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut counts = Vec::new();
        for row in rows {
            counts.push(row?);
        }
        Ok(counts)
    }

    pub fn recent_activity(&self, limit: usize) -> StoreResult<Vec<ActivityRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT item_id, source_account, item_text, outcome, findings,
                    max_confidence, reply_text, recorded_at
             FROM activity
             ORDER BY recorded_at DESC, id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<f64>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, DateTime<Utc>>(7)?,
            ))
        })?;
        let mut records = Vec::new();
        for row in rows {
            let (item_id, source_account, item_text, outcome, findings, max_confidence, reply_text, recorded_at) =
                row?;
            let findings: Vec<Finding> = serde_json::from_str(&findings)?;
            records.push(ActivityRecord {
                item_id,
                source_account,
                item_text,
                outcome,
                findings,
                max_confidence,
                reply_text,
                recorded_at,
            });
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DedupStore;
    use tempfile::tempdir;

    fn store_in(dir: &Path) -> SqliteDedupStore {
        let store = SqliteDedupStore::new(dir.join("nested/dedup.sqlite")).unwrap();
        store.initialize().unwrap();
        store
    }

    #[test]
    fn duplicate_insert_is_a_no_op() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        assert!(!store.contains("1001").unwrap());
        assert!(store.insert("1001", "someone", Utc::now()).unwrap());
        assert!(!store.insert("1001", "someone_else", Utc::now()).unwrap());
        assert!(store.contains("1001").unwrap());
        assert_eq!(store.processed_count().unwrap(), 1);
    }

    #[test]
    fn prune_removes_only_old_rows() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store
            .insert("old", "acct", Utc::now() - ChronoDuration::days(45))
            .unwrap();
        store.insert("fresh", "acct", Utc::now()).unwrap();
        let report = store.prune_older_than(30).unwrap();
        assert_eq!(report.processed_removed, 1);
        assert!(!store.contains("old").unwrap());
        assert!(store.contains("fresh").unwrap());
    }

    #[test]
    fn activity_round_trips_findings() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let record = ActivityRecord {
            item_id: "42".into(),
            source_account: "acct".into(),
            item_text: "Everyone knows it".into(),
            outcome: "posted".into(),
            findings: vec![Finding::new("bandwagon", "popularity", 0.9)],
            max_confidence: Some(0.9),
            reply_text: Some("Penalty flag!".into()),
            recorded_at: Utc::now(),
        };
        store.append_activity(&record).unwrap();

        let recent = store.recent_activity(10).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].findings, record.findings);
        let counts = store
            .outcome_counts(Utc::now() - ChronoDuration::hours(1))
            .unwrap();
        assert_eq!(counts, vec![("posted".to_string(), 1)]);
    }

    #[test]
    fn open_existing_refuses_to_create() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.sqlite");
        assert!(matches!(
            SqliteDedupStore::open_existing(&path),
            Err(StoreError::NotFound(ref missing)) if missing == &path
        ));
        assert!(!path.exists());

        store_in(dir.path());
        let existing = SqliteDedupStore::open_existing(dir.path().join("nested/dedup.sqlite")).unwrap();
        assert_eq!(existing.processed_count().unwrap(), 0);
    }

    #[test]
    fn absurd_retention_is_rejected() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store.insert("1", "acct", Utc::now()).unwrap();
        assert!(matches!(
            store.prune_older_than(u32::MAX),
            Err(StoreError::OutOfRange(_))
        ));
        assert!(store.contains("1").unwrap());
    }

    #[tokio::test]
    async fn async_adapter_marks_and_checks() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let dedup: &dyn DedupStore = &store;
        assert!(!dedup.is_processed("7").await.unwrap());
        assert!(dedup.mark_processed("7", "acct").await.unwrap());
        assert!(dedup.is_processed("7").await.unwrap());
        assert!(!dedup.mark_processed("7", "acct").await.unwrap());
    }
}
