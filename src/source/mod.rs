//! Read-only extraction from local chat-history stores.
//!
//! Each configured store is a SQLite key/value file labelled with a
//! workspace. Opening a [`SourceExtractor`] probes every store (see
//! [`probe`]); a store whose layout is not recognized fails the open with
//! [`SourceError::SchemaIncompatible`] and a diagnostics JSON file, so no
//! per-message parsing is ever attempted against it.
//!
//! Extraction is per UTC day: [`SourceExtractor::extract_date`] returns the
//! conversations that have messages on that day, carrying only those
//! messages. Each store is read once and kept until
//! [`SourceExtractor::refresh`]. Malformed entries are logged and counted,
//! never fatal.

pub mod probe;
pub mod strategy;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::bail;
use chrono::{DateTime, NaiveDate, NaiveTime};
use serde_json::Value;
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use crate::config::SourceConfig;
use crate::db;
use crate::error::{MalformedRecord, SourceError};
use crate::models::{ConversationRecord, SchemaHealthReport};

use probe::{prefix_upper_bound, Tables};
use strategy::{
    classify_composer, ExtractionStrategy, RawEntry, BUBBLE_PREFIX,
    COMPOSER_PREFIX, LEGACY_CHAT_KEY,
};

const DAY_MS: i64 = 86_400_000;

/// Inclusive range of UTC calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> anyhow::Result<Self> {
        if from > to {
            bail!("date range start {} is after end {}", from, to);
        }
        Ok(Self { from, to })
    }

    pub fn single(date: NaiveDate) -> Self {
        Self {
            from: date,
            to: date,
        }
    }

    /// Lazily yield each day in the range, oldest first.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let to = self.to;
        self.from.iter_days().take_while(move |d| *d <= to)
    }

    pub fn num_days(&self) -> u64 {
        (self.to - self.from).num_days() as u64 + 1
    }
}

/// `[start, end)` of a UTC day in epoch milliseconds.
pub fn day_bounds(date: NaiveDate) -> (i64, i64) {
    let start = date.and_time(NaiveTime::MIN).and_utc().timestamp_millis();
    (start, start + DAY_MS)
}

/// UTC day containing `ts_ms`.
pub fn date_of(ts_ms: i64) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(ts_ms).map(|dt| dt.date_naive())
}

/// Conversations extracted for one day.
#[derive(Debug, Clone)]
pub struct DateExtraction {
    pub date: NaiveDate,
    pub conversations: Vec<ConversationRecord>,
    pub malformed: u64,
}

impl DateExtraction {
    pub fn message_count(&self) -> usize {
        self.conversations.iter().map(|c| c.messages.len()).sum()
    }
}

struct SourceStore {
    workspace: String,
    path: PathBuf,
    pool: SqlitePool,
    tables: Tables,
    report: SchemaHealthReport,
}

pub struct SourceExtractor {
    stores: Vec<SourceStore>,
    diagnostics_dir: PathBuf,
    /// Conversations per workspace, read on first use.
    loaded: Mutex<HashMap<String, Arc<Vec<ConversationRecord>>>>,
}

impl SourceExtractor {
    /// Open and probe every configured store without judging the results.
    pub async fn connect(config: &SourceConfig) -> Result<Self, SourceError> {
        let mut stores = Vec::with_capacity(config.stores.len());
        for store in &config.stores {
            let pool = db::connect_read_only(&store.path).await?;
            let tables = probe::tables(&pool).await?;
            let report = probe::probe(&pool, config.probe_sample_size).await?;
            tracing::info!(
                workspace = %store.workspace,
                path = %store.path.display(),
                schema = %report.schema_version,
                healthy = report.is_healthy,
                issues = report.issues.len(),
                "probed source store"
            );
            stores.push(SourceStore {
                workspace: store.workspace.clone(),
                path: store.path.clone(),
                pool,
                tables,
                report,
            });
        }
        Ok(Self {
            stores,
            diagnostics_dir: config.diagnostics_dir.clone(),
            loaded: Mutex::new(HashMap::new()),
        })
    }

    /// Connect and fail fast if any store has an unrecognized layout.
    pub async fn open(config: &SourceConfig) -> Result<Self, SourceError> {
        let extractor = Self::connect(config).await?;
        if let Err(e) = extractor.check_health() {
            extractor.close().await;
            return Err(e);
        }
        Ok(extractor)
    }

    /// Return every store's probe report, or `SchemaIncompatible` for the
    /// first unhealthy store after writing its diagnostics file.
    pub fn check_health(&self) -> Result<Vec<(String, SchemaHealthReport)>, SourceError> {
        for store in &self.stores {
            if store.report.is_healthy {
                continue;
            }
            match probe::write_diagnostics(&self.diagnostics_dir, &store.workspace, &store.report) {
                Ok(path) => tracing::error!(
                    workspace = %store.workspace,
                    path = %store.path.display(),
                    diagnostics = %path.display(),
                    "source schema not recognized"
                ),
                Err(e) => tracing::error!(
                    workspace = %store.workspace,
                    error = %e,
                    "source schema not recognized; failed to write diagnostics"
                ),
            }
            return Err(SourceError::SchemaIncompatible(Box::new(store.report.clone())));
        }
        Ok(self.reports())
    }

    pub fn reports(&self) -> Vec<(String, SchemaHealthReport)> {
        self.stores
            .iter()
            .map(|s| (s.workspace.clone(), s.report.clone()))
            .collect()
    }

    pub fn workspaces(&self) -> Vec<&str> {
        self.stores.iter().map(|s| s.workspace.as_str()).collect()
    }

    /// The lazy per-date driver: one day at a time, oldest first.
    pub fn dates(range: &DateRange) -> impl Iterator<Item = NaiveDate> {
        range.days()
    }

    /// Conversations with messages on `date` (UTC), restricted to that day's
    /// messages. `workspace` limits extraction to one store label.
    ///
    /// Malformed entries are counted by the call that first reads a store.
    pub async fn extract_date(
        &self,
        date: NaiveDate,
        workspace: Option<&str>,
    ) -> Result<DateExtraction, SourceError> {
        let (start, end) = day_bounds(date);
        let mut conversations = Vec::new();
        let mut malformed = 0u64;

        for store in self.selected(workspace) {
            let (convs, bad) = self.cached(store).await?;
            malformed += bad;
            for conv in convs.iter() {
                if !conv
                    .messages
                    .iter()
                    .any(|m| m.timestamp >= start && m.timestamp < end)
                {
                    continue;
                }
                let mut conv = conv.clone();
                conv.messages.retain(|m| m.timestamp >= start && m.timestamp < end);
                conversations.push(conv);
            }
        }

        tracing::debug!(
            %date,
            conversations = conversations.len(),
            malformed,
            "extracted date"
        );
        Ok(DateExtraction {
            date,
            conversations,
            malformed,
        })
    }

    /// Eager convenience over [`Self::extract_date`] for short ranges.
    pub async fn extract_range(
        &self,
        range: &DateRange,
        workspace: Option<&str>,
    ) -> Result<Vec<DateExtraction>, SourceError> {
        let mut out = Vec::with_capacity(range.num_days() as usize);
        for date in range.days() {
            out.push(self.extract_date(date, workspace).await?);
        }
        Ok(out)
    }

    /// The full ordered conversation, or `None` if the store or chat is
    /// unknown.
    pub async fn conversation(
        &self,
        workspace: &str,
        chat_id: &str,
    ) -> Result<Option<ConversationRecord>, SourceError> {
        let Some(store) = self.stores.iter().find(|s| s.workspace == workspace) else {
            return Ok(None);
        };

        if store.tables.disk_kv {
            let key = format!("{}{}", COMPOSER_PREFIX, chat_id);
            let row: Option<(String, Option<Vec<u8>>)> =
                sqlx::query_as("SELECT key, CAST(value AS BLOB) FROM cursorDiskKV WHERE key = ?")
                    .bind(&key)
                    .fetch_optional(&store.pool)
                    .await?;
            if let Some((key, value)) = row {
                let entry = RawEntry { key, value };
                return match self.extract_composer(store, &entry).await? {
                    Ok(convs) => Ok(convs.into_iter().next()),
                    Err(m) => {
                        tracing::warn!(workspace, key = %m.key, reason = %m.reason, "skipping malformed record");
                        Ok(None)
                    }
                };
            }
        }

        if store.tables.item_table {
            if let Some(entry) = legacy_entry(&store.pool).await? {
                if let Ok(convs) = ExtractionStrategy::LegacyChatTabs.extract(
                    &store.workspace,
                    &entry,
                    &HashMap::new(),
                ) {
                    return Ok(convs.into_iter().find(|c| c.chat_id == chat_id));
                }
            }
        }
        Ok(None)
    }

    /// Forget every cached store so the next extraction reads them again.
    pub async fn refresh(&self) {
        self.loaded.lock().await.clear();
    }

    pub async fn close(&self) {
        for store in &self.stores {
            store.pool.close().await;
        }
    }

    /// The store's conversations, plus the malformed count if this call
    /// did the read.
    async fn cached(
        &self,
        store: &SourceStore,
    ) -> Result<(Arc<Vec<ConversationRecord>>, u64), SourceError> {
        let mut loaded = self.loaded.lock().await;
        if let Some(convs) = loaded.get(&store.workspace) {
            return Ok((Arc::clone(convs), 0));
        }
        let (convs, malformed) = self.load(store).await?;
        let convs = Arc::new(convs);
        loaded.insert(store.workspace.clone(), Arc::clone(&convs));
        tracing::debug!(
            workspace = %store.workspace,
            conversations = convs.len(),
            malformed,
            "loaded source store"
        );
        Ok((convs, malformed))
    }

    fn selected<'a>(&'a self, workspace: Option<&'a str>) -> impl Iterator<Item = &'a SourceStore> {
        self.stores
            .iter()
            .filter(move |s| workspace.map_or(true, |w| s.workspace == w))
    }

    /// Every conversation in `store`.
    async fn load(
        &self,
        store: &SourceStore,
    ) -> Result<(Vec<ConversationRecord>, u64), SourceError> {
        let mut conversations = Vec::new();
        let mut malformed = 0u64;

        if store.tables.disk_kv {
            let rows: Vec<(String, Option<Vec<u8>>)> = sqlx::query_as(
                "SELECT key, CAST(value AS BLOB) FROM cursorDiskKV \
                 WHERE key >= ? AND key < ? ORDER BY key",
            )
            .bind(COMPOSER_PREFIX)
            .bind(prefix_upper_bound(COMPOSER_PREFIX))
            .fetch_all(&store.pool)
            .await?;

            for (key, value) in rows {
                let entry = RawEntry { key, value };
                match self.extract_composer(store, &entry).await? {
                    Ok(convs) => conversations.extend(convs),
                    Err(m) => {
                        tracing::warn!(
                            workspace = %store.workspace,
                            key = %m.key,
                            reason = %m.reason,
                            "skipping malformed record"
                        );
                        malformed += 1;
                    }
                }
            }
        }

        if store.tables.item_table {
            if let Some(entry) = legacy_entry(&store.pool).await? {
                match ExtractionStrategy::LegacyChatTabs.extract(
                    &store.workspace,
                    &entry,
                    &HashMap::new(),
                ) {
                    Ok(convs) => conversations.extend(convs),
                    Err(m) => {
                        tracing::warn!(
                            workspace = %store.workspace,
                            key = %m.key,
                            reason = %m.reason,
                            "skipping malformed record"
                        );
                        malformed += 1;
                    }
                }
            }
        }

        Ok((conversations, malformed))
    }

    /// Classify and extract one conversation entry. The outer error is a
    /// database failure; the inner one a malformed entry.
    async fn extract_composer(
        &self,
        store: &SourceStore,
        entry: &RawEntry,
    ) -> Result<Result<Vec<ConversationRecord>, MalformedRecord>, SourceError> {
        let value = match entry.json() {
            Ok(v) => v,
            Err(m) => return Ok(Err(m)),
        };
        let Some(version) = classify_composer(&value) else {
            return Ok(Err(MalformedRecord::new(&entry.key, "unrecognized payload shape")));
        };
        let strategy = ExtractionStrategy::for_version(version);
        let bubbles = if strategy == ExtractionStrategy::HeaderBubbles {
            let chat_id = value
                .get("composerId")
                .and_then(|c| c.as_str())
                .or_else(|| entry.key.strip_prefix(COMPOSER_PREFIX))
                .unwrap_or_default();
            load_bubbles(&store.pool, chat_id).await?
        } else {
            HashMap::new()
        };

        Ok(strategy.extract(&store.workspace, entry, &bubbles))
    }
}

async fn legacy_entry(pool: &SqlitePool) -> Result<Option<RawEntry>, SourceError> {
    let value: Option<Option<Vec<u8>>> =
        sqlx::query_scalar("SELECT CAST(value AS BLOB) FROM ItemTable WHERE key = ?")
            .bind(LEGACY_CHAT_KEY)
            .fetch_optional(pool)
            .await?;
    Ok(value.map(|value| RawEntry {
        key: LEGACY_CHAT_KEY.to_string(),
        value,
    }))
}

async fn load_bubbles(pool: &SqlitePool, chat_id: &str) -> Result<HashMap<String, Value>, SourceError> {
    let prefix = format!("{}{}:", BUBBLE_PREFIX, chat_id);
    let rows: Vec<(String, Option<Vec<u8>>)> = sqlx::query_as(
        "SELECT key, CAST(value AS BLOB) FROM cursorDiskKV WHERE key >= ? AND key < ?",
    )
    .bind(&prefix)
    .bind(prefix_upper_bound(&prefix))
    .fetch_all(pool)
    .await?;

    let mut bubbles = HashMap::with_capacity(rows.len());
    for (key, value) in rows {
        let entry = RawEntry { key, value };
        match entry.json() {
            Ok(v) => {
                let id = entry.key[prefix.len()..].to_string();
                bubbles.insert(id, v);
            }
            Err(e) => tracing::debug!(error = %e, "skipping unreadable bubble"),
        }
    }
    Ok(bubbles)
}
