//! Core data models used throughout chat-recall.
//!
//! These types represent the conversations, messages, indexed rows, and run
//! reports that flow through the ingestion and retrieval pipeline.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Interaction mode the conversation was held in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Agent,
    Ask,
    Edit,
    Unknown,
}

impl ChatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatType::Agent => "agent",
            ChatType::Ask => "ask",
            ChatType::Edit => "edit",
            ChatType::Unknown => "unknown",
        }
    }

    /// Parse the mode label used by the source. `"chat"` is the older name
    /// for ask mode.
    pub fn parse(label: &str) -> Self {
        match label.to_ascii_lowercase().as_str() {
            "agent" => ChatType::Agent,
            "ask" | "chat" => ChatType::Ask,
            "edit" | "normal" => ChatType::Edit,
            _ => ChatType::Unknown,
        }
    }
}

impl fmt::Display for ChatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single message extracted from the source store.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub text: String,
    pub role: Role,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub workspace: String,
    pub chat_id: String,
    pub chat_type: ChatType,
}

impl Message {
    /// Whether the message satisfies the minimum invariants for indexing.
    pub fn is_indexable(&self) -> bool {
        self.timestamp > 0 && !self.text.trim().is_empty()
    }
}

/// A conversation as produced by one extraction pass. Never persisted as a
/// unit; only its messages are.
#[derive(Debug, Clone)]
pub struct ConversationRecord {
    pub workspace: String,
    pub chat_id: String,
    pub chat_type: ChatType,
    pub title: Option<String>,
    /// Ordered by timestamp ascending.
    pub messages: Vec<Message>,
}

/// How the indexed text was derived from the original message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextForm {
    Original,
    Compressed,
    Truncated,
}

impl TextForm {
    pub fn as_str(&self) -> &'static str {
        match self {
            TextForm::Original => "original",
            TextForm::Compressed => "compressed",
            TextForm::Truncated => "truncated",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "compressed" => TextForm::Compressed,
            "truncated" => TextForm::Truncated,
            _ => TextForm::Original,
        }
    }
}

/// A row in the vector store. Written once, never rewritten.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedMessage {
    pub message_id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub timestamp: i64,
    pub workspace: String,
    pub chat_id: String,
    pub chat_type: String,
    /// Role of the author (`user` / `assistant`).
    pub message_type: String,
    pub text_form: TextForm,
}

/// Durable marker of incremental sync progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub last_synced_timestamp: i64,
    pub last_run_count: u64,
    #[serde(default)]
    pub updated_at: i64,
}

/// Structural variant of the source store, as classified by the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaVersion {
    /// Single item holding every chat tab and its bubbles.
    LegacyChatTabs,
    /// Conversation records carry their messages inline.
    EmbeddedMessages,
    /// Conversation records carry headers; bodies live in bubble records.
    HeaderBubbles,
    Unknown,
}

impl SchemaVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaVersion::LegacyChatTabs => "legacy_chat_tabs",
            SchemaVersion::EmbeddedMessages => "embedded_messages",
            SchemaVersion::HeaderBubbles => "header_bubbles",
            SchemaVersion::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostic output of a schema probe. Never authoritative state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaHealthReport {
    pub is_healthy: bool,
    pub schema_version: SchemaVersion,
    pub viable_strategies: BTreeSet<SchemaVersion>,
    pub issues: Vec<String>,
    pub sample_keys: Vec<String>,
}

/// Aggregate outcome of one sync run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dates_processed: u64,
    pub conversations: u64,
    pub messages_seen: u64,
    pub indexed: u64,
    pub skipped_duplicate: u64,
    pub skipped_short: u64,
    pub skipped_invalid: u64,
    pub compressed: u64,
    pub truncated: u64,
    pub failed: u64,
    pub malformed_records: u64,
    pub checkpoint_before: Option<i64>,
    pub checkpoint_after: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_type_parse_accepts_legacy_labels() {
        assert_eq!(ChatType::parse("agent"), ChatType::Agent);
        assert_eq!(ChatType::parse("Chat"), ChatType::Ask);
        assert_eq!(ChatType::parse("edit"), ChatType::Edit);
        assert_eq!(ChatType::parse("something-new"), ChatType::Unknown);
    }

    #[test]
    fn indexable_requires_timestamp_and_text() {
        let mut m = Message {
            text: "hello".into(),
            role: Role::User,
            timestamp: 1000,
            workspace: "W".into(),
            chat_id: "C".into(),
            chat_type: ChatType::Ask,
        };
        assert!(m.is_indexable());
        m.timestamp = 0;
        assert!(!m.is_indexable());
        m.timestamp = 1;
        m.text = "   ".into();
        assert!(!m.is_indexable());
    }
}
