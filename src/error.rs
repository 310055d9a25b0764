//! Error taxonomy for the ingestion and retrieval pipeline.
//!
//! Application boundaries (config loading, CLI commands, run orchestration)
//! use [`anyhow::Result`]. The enums here are the failures callers need to
//! tell apart: an incompatible source schema, a transient provider hiccup,
//! a single malformed record, a store that cannot be reached.

use thiserror::Error;

use crate::models::SchemaHealthReport;

/// Errors raised while reading the local chat-history store.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The schema probe did not recognize the store layout. Fatal for the
    /// run; the report carries the diagnostics.
    #[error("source schema incompatible ({}): {}", .0.schema_version, .0.issues.join("; "))]
    SchemaIncompatible(Box<SchemaHealthReport>),

    #[error("source database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("source io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single source entry that could not be parsed. Logged and skipped.
#[derive(Debug, Clone, Error)]
#[error("malformed record {key}: {reason}")]
pub struct MalformedRecord {
    pub key: String,
    pub reason: String,
}

impl MalformedRecord {
    pub fn new(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Errors from an embedding or compression provider.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("provider rate limited: {0}")]
    RateLimited(String),

    #[error("provider timed out: {0}")]
    Timeout(String),

    #[error("provider error: {0}")]
    Fatal(String),
}

impl ProviderError {
    /// Rate limits and timeouts are worth another attempt; everything else
    /// fails the batch immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::RateLimited(_) | ProviderError::Timeout(_))
    }

    /// Classify an HTTP status returned by a provider.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let msg = format!("{}: {}", status, body);
        match status.as_u16() {
            429 => ProviderError::RateLimited(msg),
            408 | 504 => ProviderError::Timeout(msg),
            _ => ProviderError::Fatal(msg),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout(e.to_string())
        } else {
            ProviderError::Fatal(e.to_string())
        }
    }
}

/// Errors from the vector store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The backend could not be reached (connection refused, pool timeout,
    /// locked database).
    #[error("vector store unavailable: {0}")]
    Unavailable(String),

    /// The backend answered but refused the operation.
    #[error("vector store rejected operation: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(e.to_string()),
            sqlx::Error::Database(db) if db.message().contains("locked") => {
                StoreError::Unavailable(e.to_string())
            }
            _ => StoreError::Rejected(e.to_string()),
        }
    }
}

/// Errors surfaced by the retrieval engine.
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// The vector store is down. Distinct from "no matches".
    #[error("retrieval unavailable: {0}")]
    Unavailable(String),

    #[error("retrieval failed: {0}")]
    Store(StoreError),
}

impl From<StoreError> for RetrievalError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => RetrievalError::Unavailable(msg),
            other => RetrievalError::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_status_classification() {
        let rl = ProviderError::from_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(matches!(rl, ProviderError::RateLimited(_)));
        assert!(rl.is_transient());

        let gw = ProviderError::from_status(reqwest::StatusCode::GATEWAY_TIMEOUT, "");
        assert!(gw.is_transient());

        let bad = ProviderError::from_status(reqwest::StatusCode::BAD_REQUEST, "too long");
        assert!(!bad.is_transient());

        let down = ProviderError::from_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR, "");
        assert!(!down.is_transient());
    }

    #[test]
    fn unavailable_store_maps_to_retrieval_unavailable() {
        let err: RetrievalError = StoreError::Unavailable("refused".into()).into();
        assert!(matches!(err, RetrievalError::Unavailable(_)));

        let err: RetrievalError = StoreError::Rejected("bad filter".into()).into();
        assert!(matches!(err, RetrievalError::Store(_)));
    }
}
