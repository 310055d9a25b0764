//! In-memory [`VectorStore`] for tests and dry runs.
//!
//! Uses a `HashMap` behind `std::sync::RwLock`. Search is brute-force
//! cosine similarity over all stored rows.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::StoreError;
use crate::models::IndexedMessage;

use super::{rank, validate_row, ScoredMessage, SearchFilter, VectorStore};

pub struct InMemoryVectorStore {
    rows: RwLock<HashMap<String, IndexedMessage>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
        }
    }

    /// Snapshot of a stored row, for assertions.
    pub fn get(&self, id: &str) -> Option<IndexedMessage> {
        self.rows.read().ok()?.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.rows.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> StoreError {
    StoreError::Unavailable("in-memory store lock poisoned".to_string())
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn existing_ids(&self, ids: &[String]) -> Result<HashSet<String>, StoreError> {
        let rows = self.rows.read().map_err(|_| poisoned())?;
        Ok(ids
            .iter()
            .filter(|id| rows.contains_key(id.as_str()))
            .cloned()
            .collect())
    }

    async fn upsert_batch(&self, batch: &[IndexedMessage]) -> Result<u64, StoreError> {
        // Validate everything first so the batch stays all-or-nothing.
        for row in batch {
            validate_row(row)?;
        }
        let mut rows = self.rows.write().map_err(|_| poisoned())?;
        let mut inserted = 0u64;
        for row in batch {
            if !rows.contains_key(&row.message_id) {
                rows.insert(row.message_id.clone(), row.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn upsert(&self, row: &IndexedMessage) -> Result<bool, StoreError> {
        validate_row(row)?;
        let mut rows = self.rows.write().map_err(|_| poisoned())?;
        if rows.contains_key(&row.message_id) {
            return Ok(false);
        }
        rows.insert(row.message_id.clone(), row.clone());
        Ok(true)
    }

    async fn search(
        &self,
        query: &[f32],
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<ScoredMessage>, StoreError> {
        let rows = self.rows.read().map_err(|_| poisoned())?;
        let mut results: Vec<ScoredMessage> = rows
            .values()
            .filter(|m| filter.matches(m.timestamp, &m.workspace))
            .map(|m| ScoredMessage {
                similarity: cosine_similarity(query, &m.embedding),
                message: m.clone(),
            })
            .collect();
        rank(&mut results);
        results.truncate(limit);
        Ok(results)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.rows.read().map_err(|_| poisoned())?.len() as u64)
    }
}
