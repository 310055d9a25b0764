//! Idempotent indexing of extracted messages.
//!
//! Every message gets a content-addressed id: SHA-256 over workspace,
//! chat id, timestamp, and the full canonical text. Ids already present in
//! the store are skipped before any embedding work, so re-running over
//! indexed content costs one existence query per chunk of ids and writes
//! nothing.
//!
//! New messages are split into batches that run concurrently (bounded by a
//! semaphore). Inside a batch the stages run in a fixed order:
//!
//! ```text
//! fit (compress / truncate) ──► embed ──► upsert_batch ──► per-row fallback
//! ```
//!
//! A batch whose embedding fails is recorded as failed; other batches carry
//! on. A failed batch upsert is retried, then replayed row by row so only
//! the rows the store actually rejects are lost.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::Config;
use crate::embedding::EmbeddingClient;
use crate::error::StoreError;
use crate::models::{IndexedMessage, Message, TextForm};
use crate::normalize::{Normalizer, Rejection};
use crate::retry::RetryPolicy;
use crate::store::VectorStore;

/// Content-addressed message id (lowercase hex SHA-256).
pub fn message_id(workspace: &str, chat_id: &str, timestamp: i64, canonical_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(workspace.as_bytes());
    hasher.update([0u8]);
    hasher.update(chat_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(timestamp.to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical_text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Counters for one `index` call, mergeable across batches and dates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    pub seen: u64,
    /// Rows newly written.
    pub indexed: u64,
    pub skipped_duplicate: u64,
    pub skipped_short: u64,
    pub skipped_invalid: u64,
    pub compressed: u64,
    pub truncated: u64,
    pub failed: u64,
    /// Newest timestamp among rows written by this call. Duplicates found
    /// already present never set it.
    pub max_indexed_ts: Option<i64>,
    /// Oldest timestamp of a message that could not be stored.
    pub min_failed_ts: Option<i64>,
}

impl IndexReport {
    pub fn merge(&mut self, other: &IndexReport) {
        self.seen += other.seen;
        self.indexed += other.indexed;
        self.skipped_duplicate += other.skipped_duplicate;
        self.skipped_short += other.skipped_short;
        self.skipped_invalid += other.skipped_invalid;
        self.compressed += other.compressed;
        self.truncated += other.truncated;
        self.failed += other.failed;
        self.max_indexed_ts = max_opt(self.max_indexed_ts, other.max_indexed_ts);
        self.min_failed_ts = min_opt(self.min_failed_ts, other.min_failed_ts);
    }

    fn note_written(&mut self, ts: i64) {
        self.max_indexed_ts = max_opt(self.max_indexed_ts, Some(ts));
    }

    fn note_failed(&mut self, ts: i64) {
        self.failed += 1;
        self.min_failed_ts = min_opt(self.min_failed_ts, Some(ts));
    }
}

fn max_opt(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, y) => x.or(y),
    }
}

fn min_opt(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, y) => x.or(y),
    }
}

/// A screened message waiting to be stored.
struct Candidate {
    id: String,
    canonical: String,
    message: Message,
}

pub struct IdempotentIndexer {
    store: Arc<dyn VectorStore>,
    embedder: Arc<EmbeddingClient>,
    normalizer: Arc<Normalizer>,
    batch_size: usize,
    max_concurrency: usize,
    exists_chunk_size: usize,
    write_retry: RetryPolicy,
}

impl IdempotentIndexer {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<EmbeddingClient>,
        normalizer: Arc<Normalizer>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            embedder,
            normalizer,
            batch_size: config.embedding.batch_size.max(1),
            max_concurrency: config.embedding.max_concurrency.max(1),
            exists_chunk_size: config.index.exists_chunk_size.max(1),
            write_retry: config.index.retry_policy(),
        }
    }

    pub fn with_write_retry(mut self, retry: RetryPolicy) -> Self {
        self.write_retry = retry;
        self
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    /// Index `messages`. Only a store that cannot answer the existence
    /// check fails the call; every per-message problem is counted instead.
    pub async fn index(&self, messages: Vec<Message>) -> Result<IndexReport, StoreError> {
        let mut report = IndexReport {
            seen: messages.len() as u64,
            ..Default::default()
        };

        let candidates = self.screen(messages, &mut report);
        if candidates.is_empty() {
            return Ok(report);
        }

        let ids: Vec<String> = candidates.iter().map(|c| c.id.clone()).collect();
        let mut existing = HashSet::new();
        for chunk in ids.chunks(self.exists_chunk_size) {
            let found = self
                .write_retry
                .run(
                    "existing_ids",
                    || self.store.existing_ids(chunk),
                    StoreError::is_transient,
                )
                .await?;
            existing.extend(found);
        }

        let mut fresh = Vec::with_capacity(candidates.len());
        for c in candidates {
            if existing.contains(&c.id) {
                report.skipped_duplicate += 1;
            } else {
                fresh.push(c);
            }
        }
        tracing::debug!(
            new = fresh.len(),
            already_indexed = existing.len(),
            "existence check complete"
        );
        if fresh.is_empty() {
            return Ok(report);
        }

        let fresh_count = fresh.len() as u64;
        let oldest_fresh = fresh.iter().map(|c| c.message.timestamp).min();
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut tasks = JoinSet::new();
        let mut remaining = fresh.into_iter();
        loop {
            let batch: Vec<Candidate> = remaining.by_ref().take(self.batch_size).collect();
            if batch.is_empty() {
                break;
            }
            let semaphore = Arc::clone(&semaphore);
            let store = Arc::clone(&self.store);
            let embedder = Arc::clone(&self.embedder);
            let normalizer = Arc::clone(&self.normalizer);
            let retry = self.write_retry;
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                process_batch(batch, &normalizer, &embedder, store.as_ref(), retry).await
            });
        }

        // Every row of a finished batch ends up indexed, duplicate or failed.
        let mut accounted = 0u64;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(batch_report) => {
                    accounted += batch_report.indexed
                        + batch_report.skipped_duplicate
                        + batch_report.failed;
                    report.merge(&batch_report);
                }
                Err(e) => tracing::error!(error = %e, "index batch task aborted"),
            }
        }
        let lost = fresh_count.saturating_sub(accounted);
        if lost > 0 {
            // Which batch was lost is unknown; hold the checkpoint below
            // every fresh message.
            report.failed += lost;
            report.min_failed_ts = min_opt(report.min_failed_ts, oldest_fresh);
        }

        Ok(report)
    }

    /// Validate, canonicalize, gate on length, and drop in-call duplicates.
    fn screen(&self, messages: Vec<Message>, report: &mut IndexReport) -> Vec<Candidate> {
        let mut seen_ids = HashSet::new();
        let mut candidates = Vec::with_capacity(messages.len());

        for message in messages {
            if !message.is_indexable() {
                report.skipped_invalid += 1;
                continue;
            }
            let canonical = match self.normalizer.screen(&message.text) {
                Ok(text) => text,
                Err(Rejection::Empty) => {
                    report.skipped_invalid += 1;
                    continue;
                }
                Err(Rejection::TooShort { .. }) => {
                    report.skipped_short += 1;
                    continue;
                }
            };
            let id = message_id(
                &message.workspace,
                &message.chat_id,
                message.timestamp,
                &canonical,
            );
            if !seen_ids.insert(id.clone()) {
                report.skipped_duplicate += 1;
                continue;
            }
            candidates.push(Candidate {
                id,
                canonical,
                message,
            });
        }
        candidates
    }
}

async fn process_batch(
    batch: Vec<Candidate>,
    normalizer: &Normalizer,
    embedder: &EmbeddingClient,
    store: &dyn VectorStore,
    retry: RetryPolicy,
) -> IndexReport {
    let mut report = IndexReport::default();

    let mut fitted = Vec::with_capacity(batch.len());
    for c in &batch {
        let normalized = normalizer.fit(c.canonical.clone()).await;
        match normalized.form {
            TextForm::Compressed => report.compressed += 1,
            TextForm::Truncated => report.truncated += 1,
            TextForm::Original => {}
        }
        fitted.push(normalized);
    }

    let texts: Vec<String> = fitted.iter().map(|n| n.text.clone()).collect();
    let embeddings = match embedder.embed_batch(&texts).await {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(
                messages = batch.len(),
                error = %e,
                "embedding failed, batch recorded as failed"
            );
            for c in &batch {
                report.note_failed(c.message.timestamp);
            }
            return report;
        }
    };

    let rows: Vec<IndexedMessage> = batch
        .iter()
        .zip(fitted)
        .zip(embeddings)
        .map(|((c, normalized), embedding)| IndexedMessage {
            message_id: c.id.clone(),
            text: normalized.text,
            embedding,
            timestamp: c.message.timestamp,
            workspace: c.message.workspace.clone(),
            chat_id: c.message.chat_id.clone(),
            chat_type: c.message.chat_type.as_str().to_string(),
            message_type: c.message.role.as_str().to_string(),
            text_form: normalized.form,
        })
        .collect();

    let rows_ref = &rows;
    match retry
        .run(
            "upsert_batch",
            move || store.upsert_batch(rows_ref),
            StoreError::is_transient,
        )
        .await
    {
        Ok(written) => {
            report.indexed += written;
            report.skipped_duplicate += rows.len() as u64 - written.min(rows.len() as u64);
            // The ids were absent a moment ago, so a short count only means
            // a concurrent writer stored the same rows.
            if written > 0 {
                for row in &rows {
                    report.note_written(row.timestamp);
                }
            }
            tracing::debug!(rows = rows.len(), written, "batch stored");
        }
        Err(e) => {
            tracing::warn!(
                rows = rows.len(),
                error = %e,
                "batch upsert failed, falling back to per-row upserts"
            );
            for row in &rows {
                match retry
                    .run("upsert", move || store.upsert(row), StoreError::is_transient)
                    .await
                {
                    Ok(true) => {
                        report.indexed += 1;
                        report.note_written(row.timestamp);
                    }
                    Ok(false) => report.skipped_duplicate += 1,
                    Err(e) => {
                        tracing::warn!(id = %row.message_id, error = %e, "row upsert failed");
                        report.note_failed(row.timestamp);
                    }
                }
            }
        }
    }

    report
}
