//! Sync checkpoint persistence and the rules for moving it.
//!
//! The checkpoint is a single, monotonic timestamp: the newest message
//! known to be indexed with nothing older left behind. Two backends:
//!
//! | Backend | Selected by |
//! |---------|-------------|
//! | [`SqliteCheckpointStore`] | default; singleton row in the index database |
//! | [`FileCheckpointStore`] | `sync.checkpoint_path`; JSON file replaced atomically |
//!
//! Both refuse to move backwards. Only one sync may write at a time.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

use crate::config::{Config, SyncConfig};
use crate::index::IndexReport;
use crate::models::SyncCheckpoint;

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self) -> Result<Option<SyncCheckpoint>>;

    /// Record a completed run. The stored timestamp becomes
    /// `max(current, timestamp)`; the effective checkpoint is returned.
    async fn save(&self, timestamp: i64, count: u64) -> Result<SyncCheckpoint>;
}

pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    /// `pool` must point at a migrated index database.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn load(&self) -> Result<Option<SyncCheckpoint>> {
        let row: Option<(i64, i64, i64)> = sqlx::query_as(
            "SELECT last_synced_timestamp, last_run_count, updated_at FROM sync_checkpoint WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(ts, count, updated_at)| SyncCheckpoint {
            last_synced_timestamp: ts,
            last_run_count: count.max(0) as u64,
            updated_at,
        }))
    }

    async fn save(&self, timestamp: i64, count: u64) -> Result<SyncCheckpoint> {
        sqlx::query(
            r#"
            INSERT INTO sync_checkpoint (id, last_synced_timestamp, last_run_count, updated_at)
            VALUES (1, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                last_synced_timestamp = MAX(last_synced_timestamp, excluded.last_synced_timestamp),
                last_run_count = excluded.last_run_count,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(timestamp)
        .bind(count as i64)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        self.load()
            .await?
            .context("checkpoint row missing after save")
    }
}

pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> Result<Option<SyncCheckpoint>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read checkpoint: {}", self.path.display())
                })
            }
        };
        let checkpoint = serde_json::from_str(&content)
            .with_context(|| format!("Corrupt checkpoint file: {}", self.path.display()))?;
        Ok(Some(checkpoint))
    }

    async fn save(&self, timestamp: i64, count: u64) -> Result<SyncCheckpoint> {
        let current = self.load().await?;
        let checkpoint = SyncCheckpoint {
            last_synced_timestamp: current
                .map(|c| c.last_synced_timestamp.max(timestamp))
                .unwrap_or(timestamp),
            last_run_count: count,
            updated_at: Utc::now().timestamp_millis(),
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        // Write beside the target, then rename over it.
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&checkpoint)?)
            .with_context(|| format!("Failed to write checkpoint: {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace checkpoint: {}", self.path.display()))?;

        Ok(checkpoint)
    }
}

/// The file store when `sync.checkpoint_path` is set, else the SQLite one.
pub fn checkpoint_store(sync: &SyncConfig, pool: &SqlitePool) -> Arc<dyn CheckpointStore> {
    match &sync.checkpoint_path {
        Some(path) => Arc::new(FileCheckpointStore::new(path.clone())),
        None => Arc::new(SqliteCheckpointStore::new(pool.clone())),
    }
}

/// Print the stored checkpoint (`recall checkpoint`).
pub async fn show_checkpoint(config: &Config) -> Result<()> {
    let pool = crate::db::connect(config).await?;
    crate::migrate::migrate_pool(&pool).await?;
    let checkpoints = checkpoint_store(&config.sync, &pool);
    let checkpoint = checkpoints.load().await;
    pool.close().await;

    match checkpoint? {
        Some(cp) => {
            let at = chrono::DateTime::from_timestamp_millis(cp.last_synced_timestamp)
                .map(|dt| dt.to_rfc3339())
                .unwrap_or_else(|| cp.last_synced_timestamp.to_string());
            println!("last_synced_timestamp: {} ({})", cp.last_synced_timestamp, at);
            println!("last_run_count: {}", cp.last_run_count);
            println!("updated_at: {}", cp.updated_at);
        }
        None => println!("No checkpoint yet. Run `recall sync` first."),
    }
    Ok(())
}

/// Exclusive lower bound on message timestamps for an incremental run.
///
/// With a checkpoint this is `last_synced_timestamp - overlap_minutes`;
/// without one it is `now - initial_lookback_days`.
pub fn lower_bound(checkpoint: Option<&SyncCheckpoint>, sync: &SyncConfig, now_ms: i64) -> i64 {
    let bound = match checkpoint {
        Some(cp) => cp.last_synced_timestamp - sync.overlap_minutes * 60_000,
        None => now_ms - sync.initial_lookback_days * 86_400_000,
    };
    bound.max(0)
}

/// Where a run may move the checkpoint, or `None` if it must stay put.
///
/// The candidate is the newest timestamp written by the run, held strictly
/// below the oldest failed message so the next run sees that message again.
/// Runs that wrote nothing never move it, even if every message they saw
/// was already present.
pub fn next_checkpoint(report: &IndexReport) -> Option<i64> {
    if report.indexed == 0 {
        return None;
    }
    let newest = report.max_indexed_ts?;
    let candidate = match report.min_failed_ts {
        Some(failed) => newest.min(failed - 1),
        None => newest,
    };
    (candidate > 0).then_some(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::migrate_pool;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sqlite_checkpoint_is_monotonic() {
        let tmp = TempDir::new().unwrap();
        let pool = crate::db::connect_path(&tmp.path().join("idx.sqlite"))
            .await
            .unwrap();
        migrate_pool(&pool).await.unwrap();
        let store = SqliteCheckpointStore::new(pool);

        assert!(store.load().await.unwrap().is_none());
        let cp = store.save(5_000, 3).await.unwrap();
        assert_eq!(cp.last_synced_timestamp, 5_000);

        let cp = store.save(4_000, 1).await.unwrap();
        assert_eq!(cp.last_synced_timestamp, 5_000);
        assert_eq!(cp.last_run_count, 1);

        let cp = store.save(9_000, 2).await.unwrap();
        assert_eq!(cp.last_synced_timestamp, 9_000);
        assert_eq!(store.load().await.unwrap(), Some(cp));
    }

    #[tokio::test]
    async fn test_file_checkpoint_is_monotonic() {
        let tmp = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(tmp.path().join("state/checkpoint.json"));

        assert!(store.load().await.unwrap().is_none());
        store.save(7_000, 4).await.unwrap();
        let cp = store.save(6_000, 0).await.unwrap();
        assert_eq!(cp.last_synced_timestamp, 7_000);
        assert!(store.path().exists());
        assert!(!store.path().with_extension("tmp").exists());
        assert_eq!(store.load().await.unwrap().unwrap().last_synced_timestamp, 7_000);
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("checkpoint.json");
        std::fs::write(&path, "{{not json").unwrap();
        assert!(FileCheckpointStore::new(path).load().await.is_err());
    }

    #[test]
    fn test_lower_bound() {
        let sync = SyncConfig {
            overlap_minutes: 60,
            initial_lookback_days: 2,
            checkpoint_path: None,
        };
        let cp = SyncCheckpoint {
            last_synced_timestamp: 10_000_000,
            last_run_count: 1,
            updated_at: 0,
        };
        assert_eq!(lower_bound(Some(&cp), &sync, 0), 10_000_000 - 3_600_000);
        let now = 1_000_000_000_000;
        assert_eq!(lower_bound(None, &sync, now), now - 2 * 86_400_000);
    }

    #[test]
    fn test_next_checkpoint_rules() {
        let nothing = IndexReport::default();
        assert_eq!(next_checkpoint(&nothing), None);

        let clean = IndexReport {
            indexed: 3,
            max_indexed_ts: Some(900),
            ..Default::default()
        };
        assert_eq!(next_checkpoint(&clean), Some(900));

        let partial = IndexReport {
            indexed: 3,
            failed: 1,
            max_indexed_ts: Some(900),
            min_failed_ts: Some(500),
            ..Default::default()
        };
        assert_eq!(next_checkpoint(&partial), Some(499));

        let only_duplicates = IndexReport {
            skipped_duplicate: 4,
            max_indexed_ts: Some(900),
            ..Default::default()
        };
        assert_eq!(next_checkpoint(&only_duplicates), None);

        let all_failed = IndexReport {
            failed: 2,
            min_failed_ts: Some(500),
            ..Default::default()
        };
        assert_eq!(next_checkpoint(&all_failed), None);
    }
}
