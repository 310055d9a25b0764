//! Sync pipeline orchestration.
//!
//! Coordinates one run: probe → extract (one day at a time) → index →
//! checkpoint. Two modes:
//!
//! - **Range**: an explicit `--from/--to` window. Re-indexes whatever the
//!   source holds for those days; the checkpoint is left alone.
//! - **Incremental**: starts at the checkpoint minus the overlap margin
//!   (or the initial lookback when there is none), keeps only messages
//!   newer than that bound, and on success moves the checkpoint forward.
//!
//! A cancelled or failed run leaves every row it wrote valid; the next run
//! re-checks them as duplicates.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::checkpoint::{checkpoint_store, lower_bound, next_checkpoint, CheckpointStore};
use crate::config::{Config, SyncConfig};
use crate::db;
use crate::embedding::EmbeddingClient;
use crate::index::{IdempotentIndexer, IndexReport};
use crate::migrate;
use crate::models::{Message, RunSummary};
use crate::normalize::Normalizer;
use crate::progress::{NoProgress, SyncProgressEvent, SyncProgressReporter};
use crate::source::{date_of, DateExtraction, DateRange, SourceExtractor};
use crate::store::{SqliteVectorStore, VectorStore};

/// Run-scoped counters, merged from every date's index report.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub dates_processed: u64,
    pub conversations: u64,
    pub malformed_records: u64,
    pub report: IndexReport,
    pub checkpoint_before: Option<i64>,
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            dates_processed: 0,
            conversations: 0,
            malformed_records: 0,
            report: IndexReport::default(),
            checkpoint_before: None,
        }
    }

    fn absorb(&mut self, extraction: &DateExtraction, report: &IndexReport) {
        self.dates_processed += 1;
        self.conversations += extraction.conversations.len() as u64;
        self.malformed_records += extraction.malformed;
        self.report.merge(report);
    }

    pub fn finish(self, checkpoint_after: Option<i64>) -> RunSummary {
        RunSummary {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            dates_processed: self.dates_processed,
            conversations: self.conversations,
            messages_seen: self.report.seen,
            indexed: self.report.indexed,
            skipped_duplicate: self.report.skipped_duplicate,
            skipped_short: self.report.skipped_short,
            skipped_invalid: self.report.skipped_invalid,
            compressed: self.report.compressed,
            truncated: self.report.truncated,
            failed: self.report.failed,
            malformed_records: self.malformed_records,
            checkpoint_before: self.checkpoint_before,
            checkpoint_after,
        }
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SyncPipeline {
    extractor: Arc<SourceExtractor>,
    indexer: IdempotentIndexer,
    checkpoints: Arc<dyn CheckpointStore>,
    sync: SyncConfig,
    progress: Box<dyn SyncProgressReporter>,
}

impl SyncPipeline {
    pub fn new(
        extractor: Arc<SourceExtractor>,
        indexer: IdempotentIndexer,
        checkpoints: Arc<dyn CheckpointStore>,
        sync: SyncConfig,
    ) -> Self {
        Self {
            extractor,
            indexer,
            checkpoints,
            sync,
            progress: Box::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Box<dyn SyncProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Index every message in `range`. The checkpoint is not read or moved.
    pub async fn run_range(&self, range: DateRange, workspace: Option<&str>) -> Result<RunSummary> {
        let mut ctx = RunContext::new();
        tracing::info!(
            run_id = %ctx.run_id,
            from = %range.from,
            to = %range.to,
            workspace = workspace.unwrap_or("*"),
            "range sync started"
        );

        self.process(&range, workspace, None, &mut ctx).await?;

        let summary = ctx.finish(None);
        log_finished(&summary);
        Ok(summary)
    }

    /// Index everything newer than the checkpoint's lower bound, then move
    /// the checkpoint. `ignore_checkpoint` starts from the initial lookback
    /// window instead, but still only moves the checkpoint forward.
    pub async fn run_incremental(
        &self,
        now: DateTime<Utc>,
        ignore_checkpoint: bool,
    ) -> Result<RunSummary> {
        let mut ctx = RunContext::new();
        let checkpoint = self.checkpoints.load().await?;
        ctx.checkpoint_before = checkpoint.map(|c| c.last_synced_timestamp);

        let effective = if ignore_checkpoint { None } else { checkpoint };
        let lower = lower_bound(effective.as_ref(), &self.sync, now.timestamp_millis());
        let today = now.date_naive();
        let from = date_of(lower).unwrap_or(today).min(today);
        let range = DateRange::new(from, today)?;

        tracing::info!(
            run_id = %ctx.run_id,
            checkpoint = ?ctx.checkpoint_before,
            lower_bound = lower,
            from = %range.from,
            days = range.num_days(),
            "incremental sync started"
        );

        self.process(&range, None, Some(lower), &mut ctx).await?;

        let checkpoint_after = match next_checkpoint(&ctx.report) {
            Some(ts) => {
                let saved = self.checkpoints.save(ts, ctx.report.indexed).await?;
                Some(saved.last_synced_timestamp)
            }
            None => {
                if ctx.report.failed > 0 {
                    tracing::warn!(
                        failed = ctx.report.failed,
                        "nothing indexed, checkpoint not advanced"
                    );
                }
                ctx.checkpoint_before
            }
        };

        let summary = ctx.finish(checkpoint_after);
        log_finished(&summary);
        Ok(summary)
    }

    async fn process(
        &self,
        range: &DateRange,
        workspace: Option<&str>,
        lower: Option<i64>,
        ctx: &mut RunContext,
    ) -> Result<()> {
        // Stores are read once per run.
        self.extractor.refresh().await;
        let total = range.num_days();
        for (i, date) in SourceExtractor::dates(range).enumerate() {
            self.progress.report(SyncProgressEvent::Syncing {
                date,
                n: i as u64 + 1,
                total,
            });

            let extraction = self
                .extractor
                .extract_date(date, workspace)
                .await
                .with_context(|| format!("Failed to extract {}", date))?;

            let mut messages: Vec<Message> = extraction
                .conversations
                .iter()
                .flat_map(|c| c.messages.iter().cloned())
                .collect();
            if let Some(lower) = lower {
                messages.retain(|m| m.timestamp > lower);
            }
            let count = messages.len() as u64;

            let report = if messages.is_empty() {
                IndexReport::default()
            } else {
                self.indexer
                    .index(messages)
                    .await
                    .with_context(|| format!("Failed to index {}", date))?
            };

            tracing::info!(
                %date,
                messages = count,
                indexed = report.indexed,
                duplicates = report.skipped_duplicate,
                failed = report.failed,
                malformed = extraction.malformed,
                "date synced"
            );
            self.progress.report(SyncProgressEvent::DateDone {
                date,
                messages: count,
                indexed: report.indexed,
            });
            ctx.absorb(&extraction, &report);
        }
        Ok(())
    }
}

fn log_finished(summary: &RunSummary) {
    tracing::info!(
        run_id = %summary.run_id,
        dates = summary.dates_processed,
        indexed = summary.indexed,
        duplicates = summary.skipped_duplicate,
        failed = summary.failed,
        malformed = summary.malformed_records,
        checkpoint = ?summary.checkpoint_after,
        "sync finished"
    );
}

/// Options for the `sync` command.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub workspace: Option<String>,
    /// Ignore the stored checkpoint and start from the lookback window.
    pub full: bool,
    pub dry_run: bool,
}

impl SyncOptions {
    fn is_range(&self) -> bool {
        self.from.is_some() || self.to.is_some()
    }

    fn range(&self, today: NaiveDate) -> Result<DateRange> {
        let to = self.to.unwrap_or(today);
        let from = self.from.unwrap_or(to);
        DateRange::new(from, to)
    }
}

pub async fn run_sync(
    config: &Config,
    opts: SyncOptions,
    progress: Box<dyn SyncProgressReporter>,
) -> Result<()> {
    if config.source.stores.is_empty() {
        bail!("No source stores configured. Add [[source.stores]] entries to the config.");
    }
    if opts.workspace.is_some() && !opts.is_range() {
        bail!("--workspace requires --from/--to; the checkpoint covers every workspace");
    }

    progress.report(SyncProgressEvent::Probing);
    let extractor = Arc::new(SourceExtractor::open(&config.source).await?);
    let today = Utc::now().date_naive();

    if opts.dry_run {
        let result = dry_run(&extractor, &opts, today).await;
        extractor.close().await;
        return result;
    }

    if !config.embedding.is_enabled() {
        extractor.close().await;
        bail!("Sync requires embeddings. Set [embedding] provider in config.");
    }

    let pool = db::connect(config).await?;
    migrate::migrate_pool(&pool).await?;

    let store: Arc<dyn VectorStore> = Arc::new(SqliteVectorStore::new(pool.clone()));
    let embedder = Arc::new(EmbeddingClient::from_config(&config.embedding)?);
    let normalizer = Arc::new(Normalizer::from_config(config)?);
    let indexer = IdempotentIndexer::new(store, embedder, normalizer, config);
    let checkpoints = checkpoint_store(&config.sync, &pool);

    let pipeline = SyncPipeline::new(
        Arc::clone(&extractor),
        indexer,
        checkpoints,
        config.sync.clone(),
    )
    .with_progress(progress);

    let result = if opts.is_range() {
        match opts.range(today) {
            Ok(range) => pipeline.run_range(range, opts.workspace.as_deref()).await,
            Err(e) => Err(e),
        }
    } else {
        pipeline.run_incremental(Utc::now(), opts.full).await
    };

    extractor.close().await;
    pool.close().await;
    let summary = result?;
    print_summary(&summary);
    Ok(())
}

async fn dry_run(extractor: &SourceExtractor, opts: &SyncOptions, today: NaiveDate) -> Result<()> {
    let range = if opts.is_range() {
        opts.range(today)?
    } else {
        DateRange::single(today)
    };

    let mut conversations = 0usize;
    let mut messages = 0usize;
    let mut malformed = 0u64;
    for date in SourceExtractor::dates(&range) {
        let extraction = extractor.extract_date(date, opts.workspace.as_deref()).await?;
        conversations += extraction.conversations.len();
        messages += extraction.message_count();
        malformed += extraction.malformed;
    }

    println!("sync (dry-run)");
    for (workspace, report) in extractor.reports() {
        println!("  {}: schema {}", workspace, report.schema_version);
    }
    println!("  dates: {} .. {}", range.from, range.to);
    println!("  conversations: {}", conversations);
    println!("  messages: {}", messages);
    println!("  malformed records: {}", malformed);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("sync {}", summary.run_id);
    println!("  dates processed: {}", summary.dates_processed);
    println!("  conversations: {}", summary.conversations);
    println!("  messages seen: {}", summary.messages_seen);
    println!("  indexed: {}", summary.indexed);
    println!("  skipped (duplicate): {}", summary.skipped_duplicate);
    println!("  skipped (too short): {}", summary.skipped_short);
    println!("  skipped (invalid): {}", summary.skipped_invalid);
    println!("  compressed: {}", summary.compressed);
    println!("  truncated: {}", summary.truncated);
    println!("  failed: {}", summary.failed);
    println!("  malformed records: {}", summary.malformed_records);
    match (summary.checkpoint_before, summary.checkpoint_after) {
        (Some(before), Some(after)) if before != after => {
            println!("  checkpoint: {} -> {}", before, after)
        }
        (_, Some(after)) => println!("  checkpoint: {}", after),
        (_, None) => println!("  checkpoint: (unchanged)"),
    }
    println!("ok");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_options_range_defaults() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();

        let opts = SyncOptions {
            from: Some(day),
            ..Default::default()
        };
        assert!(opts.is_range());
        assert_eq!(opts.range(today).unwrap().num_days(), 10);

        let opts = SyncOptions {
            to: Some(day),
            ..Default::default()
        };
        assert_eq!(opts.range(today).unwrap(), DateRange::single(day));

        let backwards = SyncOptions {
            from: Some(today),
            to: Some(day),
            ..Default::default()
        };
        assert!(backwards.range(today).is_err());
        assert!(!SyncOptions::default().is_range());
    }

    #[test]
    fn test_run_context_summary() {
        let mut ctx = RunContext::new();
        ctx.checkpoint_before = Some(10);
        let extraction = DateExtraction {
            date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            conversations: Vec::new(),
            malformed: 2,
        };
        let report = IndexReport {
            seen: 5,
            indexed: 3,
            skipped_duplicate: 2,
            ..Default::default()
        };
        ctx.absorb(&extraction, &report);
        ctx.absorb(&extraction, &report);

        let summary = ctx.finish(Some(20));
        assert_eq!(summary.dates_processed, 2);
        assert_eq!(summary.messages_seen, 10);
        assert_eq!(summary.indexed, 6);
        assert_eq!(summary.malformed_records, 4);
        assert_eq!(summary.checkpoint_before, Some(10));
        assert_eq!(summary.checkpoint_after, Some(20));
        assert!(summary.finished_at >= summary.started_at);
        assert_eq!(summary.run_id.len(), 36);
    }
}
