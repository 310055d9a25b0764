//! Vector store abstraction.
//!
//! The [`VectorStore`] trait is the whole contract the indexer and the
//! retrieval engine rely on: existence checks by id, write-once batch
//! upserts, and filtered similarity search. Backends:
//!
//! | Backend | Use |
//! |---------|-----|
//! | [`SqliteVectorStore`] | Durable default, brute-force cosine over filtered rows |
//! | [`InMemoryVectorStore`] | Tests and dry runs |
//!
//! Every write is keyed by the content-addressed message id, so repeated or
//! concurrent writers only ever perform redundant no-op inserts.

pub mod memory;
pub mod sqlite;

use std::cmp::Ordering;
use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::IndexedMessage;

pub use memory::InMemoryVectorStore;
pub use sqlite::SqliteVectorStore;

/// Optional constraints applied to a similarity search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilter {
    /// Inclusive lower bound (ms since epoch).
    pub from_ts: Option<i64>,
    /// Inclusive upper bound (ms since epoch).
    pub to_ts: Option<i64>,
    pub workspace: Option<String>,
}

impl SearchFilter {
    pub fn matches(&self, timestamp: i64, workspace: &str) -> bool {
        if let Some(from) = self.from_ts {
            if timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.to_ts {
            if timestamp > to {
                return false;
            }
        }
        match &self.workspace {
            Some(ws) => ws == workspace,
            None => true,
        }
    }
}

/// A stored row together with its similarity to the query vector.
#[derive(Debug, Clone)]
pub struct ScoredMessage {
    pub message: IndexedMessage,
    pub similarity: f32,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Return the subset of `ids` that already have a row.
    async fn existing_ids(&self, ids: &[String]) -> Result<HashSet<String>, StoreError>;

    /// Insert every row whose id is not present yet, atomically. Returns the
    /// number of rows actually inserted; existing ids are skipped, never
    /// rewritten.
    async fn upsert_batch(&self, rows: &[IndexedMessage]) -> Result<u64, StoreError>;

    /// Insert a single row. Returns `false` when the id already existed.
    async fn upsert(&self, row: &IndexedMessage) -> Result<bool, StoreError>;

    /// Similarity search. Results are ordered by [`rank`] and truncated to
    /// `limit`.
    async fn search(
        &self,
        query: &[f32],
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<ScoredMessage>, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;
}

/// Order by similarity (desc), then timestamp (desc, newer wins ties), then
/// id (asc) so the order is total and deterministic.
pub fn rank(results: &mut [ScoredMessage]) {
    results.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(Ordering::Equal)
            .then(b.message.timestamp.cmp(&a.message.timestamp))
            .then(a.message.message_id.cmp(&b.message.message_id))
    });
}

/// Rows must carry a non-empty id and embedding to be stored.
pub(crate) fn validate_row(row: &IndexedMessage) -> Result<(), StoreError> {
    if row.message_id.is_empty() {
        return Err(StoreError::Rejected("row has empty id".to_string()));
    }
    if row.embedding.is_empty() {
        return Err(StoreError::Rejected(format!(
            "row {} has empty embedding",
            row.message_id
        )));
    }
    if row.embedding.iter().any(|v| !v.is_finite()) {
        return Err(StoreError::Rejected(format!(
            "row {} has non-finite embedding values",
            row.message_id
        )));
    }
    Ok(())
}
