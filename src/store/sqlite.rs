//! SQLite-backed [`VectorStore`].
//!
//! Rows live in the `indexed_messages` table created by
//! [`migrate`](crate::migrate). Embeddings are stored as little-endian f32
//! BLOBs; search filters by time range and workspace in SQL and computes
//! cosine similarity in Rust.

use std::collections::HashSet;

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::StoreError;
use crate::models::{IndexedMessage, TextForm};

use super::{rank, validate_row, ScoredMessage, SearchFilter, VectorStore};

const INSERT_SQL: &str = r#"
    INSERT INTO indexed_messages (id, text, embedding, dims, timestamp, workspace,
                                  chat_id, chat_type, message_type, text_form, indexed_at)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(id) DO NOTHING
"#;

pub struct SqliteVectorStore {
    pool: SqlitePool,
}

impl SqliteVectorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn bind_row<'q>(
    query: sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    row: &'q IndexedMessage,
    now: i64,
) -> sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(&row.message_id)
        .bind(&row.text)
        .bind(vec_to_blob(&row.embedding))
        .bind(row.embedding.len() as i64)
        .bind(row.timestamp)
        .bind(&row.workspace)
        .bind(&row.chat_id)
        .bind(&row.chat_type)
        .bind(&row.message_type)
        .bind(row.text_form.as_str())
        .bind(now)
}

fn row_to_message(row: &SqliteRow) -> IndexedMessage {
    let blob: Vec<u8> = row.get("embedding");
    let text_form: String = row.get("text_form");
    IndexedMessage {
        message_id: row.get("id"),
        text: row.get("text"),
        embedding: blob_to_vec(&blob),
        timestamp: row.get("timestamp"),
        workspace: row.get("workspace"),
        chat_id: row.get("chat_id"),
        chat_type: row.get("chat_type"),
        message_type: row.get("message_type"),
        text_form: TextForm::parse(&text_form),
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn existing_ids(&self, ids: &[String]) -> Result<HashSet<String>, StoreError> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT id FROM indexed_messages WHERE id IN (");
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        let found: Vec<String> = qb.build_query_scalar().fetch_all(&self.pool).await?;
        Ok(found.into_iter().collect())
    }

    async fn upsert_batch(&self, rows: &[IndexedMessage]) -> Result<u64, StoreError> {
        for row in rows {
            validate_row(row)?;
        }

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;

        for row in rows {
            let result = bind_row(sqlx::query(INSERT_SQL), row, now)
                .execute(&mut *tx)
                .await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn upsert(&self, row: &IndexedMessage) -> Result<bool, StoreError> {
        validate_row(row)?;
        let now = chrono::Utc::now().timestamp();
        let result = bind_row(sqlx::query(INSERT_SQL), row, now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn search(
        &self,
        query: &[f32],
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<ScoredMessage>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, text, embedding, timestamp, workspace, chat_id, chat_type,
                   message_type, text_form
            FROM indexed_messages
            WHERE timestamp >= ? AND timestamp <= ?
              AND (? IS NULL OR workspace = ?)
            "#,
        )
        .bind(filter.from_ts.unwrap_or(i64::MIN))
        .bind(filter.to_ts.unwrap_or(i64::MAX))
        .bind(filter.workspace.as_deref())
        .bind(filter.workspace.as_deref())
        .fetch_all(&self.pool)
        .await?;

        let mut results: Vec<ScoredMessage> = rows
            .iter()
            .map(|row| {
                let message = row_to_message(row);
                ScoredMessage {
                    similarity: cosine_similarity(query, &message.embedding),
                    message,
                }
            })
            .collect();

        rank(&mut results);
        results.truncate(limit);
        Ok(results)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM indexed_messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }
}
