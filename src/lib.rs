//! # Chat Recall
//!
//! Schema-adaptive ingestion, idempotent vector indexing, and similarity
//! retrieval for local AI chat history.
//!
//! Chat Recall reads conversation records out of the SQLite key/value
//! stores that editor-integrated assistants keep on disk, adapts to
//! whichever storage layout it finds, and indexes every message exactly
//! once under a content-addressed id. Searches return the best matches
//! together with the messages around them.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌─────────────┐   ┌──────────┐
//! │   Source    │──▶│  Normalize  │──▶│    Embed    │──▶│  Index   │
//! │ probe+parse │   │ fit/compress│   │ cache+retry │   │ (SQLite) │
//! └──────┬──────┘   └─────────────┘   └─────────────┘   └────┬─────┘
//!        │                                                   │
//!        │            context windows  ┌──────────┐          │
//!        └────────────────────────────▶│ Retrieve │◀─────────┘
//!                                      └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! recall init                   # create database
//! recall probe                  # check source layouts
//! recall sync                   # index everything since the checkpoint
//! recall search "flaky upload test" --context 2
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`source`] | Schema probe and per-date extraction |
//! | [`normalize`] | Canonical text, compression and truncation |
//! | [`embedding`] | Embedding providers, cache and batching |
//! | [`index`] | Content-addressed, idempotent indexing |
//! | [`store`] | Vector store trait and backends |
//! | [`checkpoint`] | Sync checkpoint persistence |
//! | [`ingest`] | Sync pipeline orchestration |
//! | [`search`] | Similarity retrieval with context windows |
//! | [`progress`] | Sync progress reporting |
//! | [`retry`] | Bounded retry with capped backoff |
//! | [`stats`] | Index statistics |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod checkpoint;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod index;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod progress;
pub mod retry;
pub mod search;
pub mod source;
pub mod stats;
pub mod store;
