//! Similarity retrieval over indexed messages.
//!
//! [`RetrievalEngine::search`] asks the vector store for the nearest rows
//! under the time-range and workspace filters, drops everything below the
//! similarity threshold, and orders the rest:
//!
//! 1. cosine similarity, descending
//! 2. timestamp, descending (more recent wins ties)
//! 3. message id, ascending
//!
//! When a [`SourceExtractor`] is attached, each match can be expanded with
//! its neighbouring messages, read from the source rather than the index.
//! A store that cannot be reached is reported as
//! [`RetrievalError::Unavailable`], never as an empty result.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;

use crate::config::{Config, RetrievalConfig};
use crate::db;
use crate::embedding::EmbeddingClient;
use crate::error::RetrievalError;
use crate::models::{ConversationRecord, IndexedMessage, Message};
use crate::normalize::canonicalize;
use crate::source::{day_bounds, SourceExtractor};
use crate::store::{rank, SearchFilter, SqliteVectorStore, VectorStore};

/// Leading characters compared when locating a match by text.
const LOCATE_PREFIX_CHARS: usize = 64;

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query_vec: Vec<f32>,
    /// Inclusive bounds, ms since epoch.
    pub from_ts: Option<i64>,
    pub to_ts: Option<i64>,
    pub workspace: Option<String>,
    pub top_k: usize,
    pub min_similarity: f32,
    /// Neighbours to attach on each side of a match; 0 disables.
    pub context_messages: usize,
}

impl SearchRequest {
    pub fn new(query_vec: Vec<f32>, config: &RetrievalConfig) -> Self {
        Self {
            query_vec,
            from_ts: None,
            to_ts: None,
            workspace: None,
            top_k: config.top_k,
            min_similarity: config.min_similarity,
            context_messages: config.context_messages,
        }
    }
}

/// Messages surrounding a match in its conversation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextWindow {
    pub before: Vec<Message>,
    pub after: Vec<Message>,
}

impl ContextWindow {
    pub fn is_empty(&self) -> bool {
        self.before.is_empty() && self.after.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct SearchMatch {
    pub message: IndexedMessage,
    pub similarity: f32,
    pub context: ContextWindow,
}

pub struct RetrievalEngine {
    store: Arc<dyn VectorStore>,
    extractor: Option<Arc<SourceExtractor>>,
}

impl RetrievalEngine {
    pub fn new(store: Arc<dyn VectorStore>) -> Self {
        Self {
            store,
            extractor: None,
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<SourceExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchMatch>, RetrievalError> {
        if request.top_k == 0 {
            return Ok(Vec::new());
        }

        let filter = SearchFilter {
            from_ts: request.from_ts,
            to_ts: request.to_ts,
            workspace: request.workspace.clone(),
        };
        let mut scored = self
            .store
            .search(&request.query_vec, &filter, request.top_k)
            .await?;

        scored.retain(|s| s.similarity >= request.min_similarity);
        rank(&mut scored);
        scored.truncate(request.top_k);

        let mut conversations: HashMap<(String, String), Option<ConversationRecord>> =
            HashMap::new();
        let mut matches = Vec::with_capacity(scored.len());
        for s in scored {
            let context = match (&self.extractor, request.context_messages) {
                (Some(extractor), n) if n > 0 => {
                    let key = (s.message.workspace.clone(), s.message.chat_id.clone());
                    if !conversations.contains_key(&key) {
                        let conv = match extractor.conversation(&key.0, &key.1).await {
                            Ok(conv) => conv,
                            Err(e) => {
                                tracing::warn!(
                                    workspace = %key.0,
                                    chat_id = %key.1,
                                    error = %e,
                                    "context lookup failed"
                                );
                                None
                            }
                        };
                        conversations.insert(key.clone(), conv);
                    }
                    conversations
                        .get(&key)
                        .and_then(|c| c.as_ref())
                        .map(|conv| context_window(conv, &s.message, n))
                        .unwrap_or_default()
                }
                _ => ContextWindow::default(),
            };
            matches.push(SearchMatch {
                message: s.message,
                similarity: s.similarity,
                context,
            });
        }

        Ok(matches)
    }
}

/// The `n` messages before and after `hit` in `conversation`.
///
/// The hit is located by timestamp, disambiguated by text prefix; if no
/// message shares its timestamp, by text prefix alone. An unlocatable hit
/// gets an empty window.
pub fn context_window(conversation: &ConversationRecord, hit: &IndexedMessage, n: usize) -> ContextWindow {
    let prefix: String = hit.text.chars().take(LOCATE_PREFIX_CHARS).collect();
    let same_text = |m: &Message| canonicalize(&m.text).starts_with(prefix.as_str());

    let messages = &conversation.messages;
    let by_time: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.timestamp == hit.timestamp)
        .map(|(i, _)| i)
        .collect();

    let position = match by_time.as_slice() {
        [only] => Some(*only),
        [first, ..] => by_time
            .iter()
            .copied()
            .find(|&i| same_text(&messages[i]))
            .or(Some(*first)),
        [] => messages.iter().position(same_text),
    };

    let Some(pos) = position else {
        return ContextWindow::default();
    };
    ContextWindow {
        before: messages[pos.saturating_sub(n)..pos].to_vec(),
        after: messages[pos + 1..(pos + 1 + n).min(messages.len())].to_vec(),
    }
}

/// Options for the `search` command.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub workspace: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub top_k: Option<usize>,
    pub min_similarity: Option<f32>,
    pub context: Option<usize>,
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{}', expected YYYY-MM-DD", s))
}

pub async fn run_search(config: &Config, query: &str, opts: SearchOptions) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }
    if !config.embedding.is_enabled() {
        bail!("Search requires embeddings. Set [embedding] provider in config.");
    }

    let embedder = EmbeddingClient::from_config(&config.embedding)?;
    let query_vec = embedder.embed_query(query).await?;

    let mut request = SearchRequest::new(query_vec, &config.retrieval);
    request.workspace = opts.workspace;
    if let Some(since) = &opts.since {
        request.from_ts = Some(day_bounds(parse_date(since)?).0);
    }
    if let Some(until) = &opts.until {
        request.to_ts = Some(day_bounds(parse_date(until)?).1 - 1);
    }
    if let Some(k) = opts.top_k {
        request.top_k = k;
    }
    if let Some(min) = opts.min_similarity {
        request.min_similarity = min;
    }
    if let Some(n) = opts.context {
        request.context_messages = n;
    }

    let pool = db::connect(config).await?;
    let mut engine = RetrievalEngine::new(Arc::new(SqliteVectorStore::new(pool.clone())));
    let mut extractor = None;
    if request.context_messages > 0 && !config.source.stores.is_empty() {
        match SourceExtractor::open(&config.source).await {
            Ok(e) => {
                let e = Arc::new(e);
                engine = engine.with_extractor(Arc::clone(&e));
                extractor = Some(e);
            }
            Err(e) => tracing::warn!(error = %e, "source unavailable, showing matches without context"),
        }
    }

    let results = engine.search(&request).await;
    if let Some(e) = &extractor {
        e.close().await;
    }
    pool.close().await;
    let results = results?;

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, m) in results.iter().enumerate() {
        let when = chrono::DateTime::from_timestamp_millis(m.message.timestamp)
            .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();

        println!(
            "{}. [{:.2}] {} / {} ({})",
            i + 1,
            m.similarity,
            m.message.workspace,
            m.message.chat_type,
            m.message.message_type
        );
        println!("    at: {}", when);
        println!("    chat: {}", m.message.chat_id);
        println!("    excerpt: \"{}\"", excerpt(&m.message.text, 240));
        for before in &m.context.before {
            println!("    < {}: {}", before.role, excerpt(&before.text, 120));
        }
        for after in &m.context.after {
            println!("    > {}: {}", after.role, excerpt(&after.text, 120));
        }
        println!("    id: {}", m.message.message_id);
        println!();
    }

    Ok(())
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let flat = text.replace('\n', " ");
    let flat = flat.trim();
    if flat.chars().count() <= max_chars {
        return flat.to_string();
    }
    let mut out: String = flat.chars().take(max_chars).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::models::{ChatType, Role, TextForm};
    use crate::store::{InMemoryVectorStore, ScoredMessage};
    use async_trait::async_trait;
    use std::collections::HashSet;

    fn row(id: &str, ws: &str, ts: i64, embedding: Vec<f32>) -> IndexedMessage {
        IndexedMessage {
            message_id: id.to_string(),
            text: format!("text of {}", id),
            embedding,
            timestamp: ts,
            workspace: ws.to_string(),
            chat_id: "C".to_string(),
            chat_type: "agent".to_string(),
            message_type: "user".to_string(),
            text_form: TextForm::Original,
        }
    }

    async fn seeded() -> Arc<InMemoryVectorStore> {
        let store = Arc::new(InMemoryVectorStore::new());
        store
            .upsert_batch(&[
                row("exact", "W", 100, vec![1.0, 0.0]),
                row("close-old", "W", 200, vec![0.9, 0.1]),
                row("close-new", "W", 300, vec![0.9, 0.1]),
                row("far", "W", 400, vec![0.0, 1.0]),
                row("other-ws", "X", 500, vec![1.0, 0.0]),
            ])
            .await
            .unwrap();
        store
    }

    fn request(top_k: usize, min_similarity: f32) -> SearchRequest {
        SearchRequest {
            query_vec: vec![1.0, 0.0],
            from_ts: None,
            to_ts: None,
            workspace: Some("W".into()),
            top_k,
            min_similarity,
            context_messages: 0,
        }
    }

    #[tokio::test]
    async fn test_ranking_threshold_and_tie_break() {
        let engine = RetrievalEngine::new(seeded().await);
        let results = engine.search(&request(10, 0.5)).await.unwrap();

        let ids: Vec<&str> = results.iter().map(|m| m.message.message_id.as_str()).collect();
        assert_eq!(ids, vec!["exact", "close-new", "close-old"]);
        assert!(results.windows(2).all(|w| w[0].similarity >= w[1].similarity));
        assert!(results.iter().all(|m| m.similarity >= 0.5));
    }

    #[tokio::test]
    async fn test_top_k_and_time_range() {
        let engine = RetrievalEngine::new(seeded().await);
        assert_eq!(engine.search(&request(1, -1.0)).await.unwrap().len(), 1);

        let mut req = request(10, -1.0);
        req.from_ts = Some(200);
        req.to_ts = Some(300);
        let results = engine.search(&req).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(engine.search(&request(0, -1.0)).await.unwrap().is_empty());
    }

    struct DownStore;

    #[async_trait]
    impl VectorStore for DownStore {
        async fn existing_ids(&self, _ids: &[String]) -> Result<HashSet<String>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn upsert_batch(&self, _rows: &[IndexedMessage]) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn upsert(&self, _row: &IndexedMessage) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn search(
            &self,
            _query: &[f32],
            _filter: &SearchFilter,
            _limit: usize,
        ) -> Result<Vec<ScoredMessage>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn count(&self) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_unreachable_store_is_not_an_empty_result() {
        let engine = RetrievalEngine::new(Arc::new(DownStore));
        let err = engine.search(&request(5, 0.0)).await.unwrap_err();
        assert!(matches!(err, RetrievalError::Unavailable(_)));
    }

    fn conv(texts: &[(&str, i64)]) -> ConversationRecord {
        ConversationRecord {
            workspace: "W".into(),
            chat_id: "C".into(),
            chat_type: ChatType::Agent,
            title: None,
            messages: texts
                .iter()
                .enumerate()
                .map(|(i, (text, ts))| Message {
                    text: text.to_string(),
                    role: if i % 2 == 0 { Role::User } else { Role::Assistant },
                    timestamp: *ts,
                    workspace: "W".into(),
                    chat_id: "C".into(),
                    chat_type: ChatType::Agent,
                })
                .collect(),
        }
    }

    #[test]
    fn test_context_window_by_timestamp() {
        let c = conv(&[("m0", 10), ("m1", 20), ("m2", 30), ("m3", 40), ("m4", 50)]);
        let mut hit = row("x", "W", 30, vec![1.0]);
        hit.text = "m2".into();

        let w = context_window(&c, &hit, 1);
        assert_eq!(w.before.len(), 1);
        assert_eq!(w.before[0].text, "m1");
        assert_eq!(w.after[0].text, "m3");

        let wide = context_window(&c, &hit, 10);
        assert_eq!(wide.before.len(), 2);
        assert_eq!(wide.after.len(), 2);
    }

    #[test]
    fn test_context_window_disambiguates_by_text() {
        let c = conv(&[("first", 10), ("second", 10), ("third", 10)]);
        let mut hit = row("x", "W", 10, vec![1.0]);
        hit.text = "second".into();
        let w = context_window(&c, &hit, 1);
        assert_eq!(w.before[0].text, "first");
        assert_eq!(w.after[0].text, "third");
    }

    #[test]
    fn test_context_window_falls_back_to_text_then_empty() {
        let c = conv(&[("alpha", 10), ("beta gamma", 20), ("delta", 30)]);
        let mut hit = row("x", "W", 999, vec![1.0]);
        hit.text = "beta gamma".into();
        assert_eq!(context_window(&c, &hit, 1).after[0].text, "delta");

        hit.text = "nowhere".into();
        assert!(context_window(&c, &hit, 1).is_empty());
    }

    #[test]
    fn test_excerpt() {
        assert_eq!(excerpt("a\nb", 10), "a b");
        assert_eq!(excerpt("abcdef", 3), "abc…");
    }
}
