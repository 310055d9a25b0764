//! Extraction strategies, one per recognized source layout.
//!
//! Strategies are pure: they turn one raw key/value entry (plus, for the
//! header/bubble layout, the bubble records already fetched for it) into
//! conversation records. Anything they cannot make sense of becomes a
//! [`MalformedRecord`] for the caller to log and skip.

use std::collections::HashMap;

use chrono::DateTime;
use serde_json::Value;

use crate::error::MalformedRecord;
use crate::models::{ChatType, ConversationRecord, Message, Role, SchemaVersion};

/// Key prefix of conversation records in `cursorDiskKV`.
pub const COMPOSER_PREFIX: &str = "composerData:";
/// Key prefix of message body records in `cursorDiskKV`.
pub const BUBBLE_PREFIX: &str = "bubbleId:";
/// `ItemTable` key holding every legacy chat tab.
pub const LEGACY_CHAT_KEY: &str = "workbench.panel.aichat.view.aichat.chatdata";

/// One raw entry from a key/value table. The value is kept as raw bytes
/// until a strategy parses it, so one undecodable row stays one bad row.
#[derive(Debug, Clone)]
pub struct RawEntry {
    pub key: String,
    pub value: Option<Vec<u8>>,
}

impl RawEntry {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn json(&self) -> Result<Value, MalformedRecord> {
        let bytes = self
            .value
            .as_deref()
            .ok_or_else(|| MalformedRecord::new(&self.key, "value is NULL"))?;
        let raw = std::str::from_utf8(bytes).map_err(|e| {
            MalformedRecord::new(&self.key, format!("value is not valid UTF-8: {}", e))
        })?;
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| MalformedRecord::new(&self.key, format!("invalid JSON: {}", e)))?;
        if !value.is_object() {
            return Err(MalformedRecord::new(&self.key, "payload is not a JSON object"));
        }
        Ok(value)
    }
}

/// Closed set of extraction strategies. `Unsupported` refuses to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionStrategy {
    LegacyChatTabs,
    EmbeddedMessages,
    HeaderBubbles,
    Unsupported,
}

impl ExtractionStrategy {
    pub fn for_version(version: SchemaVersion) -> Self {
        match version {
            SchemaVersion::LegacyChatTabs => ExtractionStrategy::LegacyChatTabs,
            SchemaVersion::EmbeddedMessages => ExtractionStrategy::EmbeddedMessages,
            SchemaVersion::HeaderBubbles => ExtractionStrategy::HeaderBubbles,
            SchemaVersion::Unknown => ExtractionStrategy::Unsupported,
        }
    }

    pub fn version(&self) -> SchemaVersion {
        match self {
            ExtractionStrategy::LegacyChatTabs => SchemaVersion::LegacyChatTabs,
            ExtractionStrategy::EmbeddedMessages => SchemaVersion::EmbeddedMessages,
            ExtractionStrategy::HeaderBubbles => SchemaVersion::HeaderBubbles,
            ExtractionStrategy::Unsupported => SchemaVersion::Unknown,
        }
    }

    /// Parse one raw entry. `bubbles` maps bubble id to its parsed record
    /// and is only consulted by [`ExtractionStrategy::HeaderBubbles`].
    pub fn extract(
        &self,
        workspace: &str,
        entry: &RawEntry,
        bubbles: &HashMap<String, Value>,
    ) -> Result<Vec<ConversationRecord>, MalformedRecord> {
        match self {
            ExtractionStrategy::LegacyChatTabs => extract_legacy_tabs(workspace, entry),
            ExtractionStrategy::EmbeddedMessages => {
                extract_embedded(workspace, entry).map(|c| vec![c])
            }
            ExtractionStrategy::HeaderBubbles => {
                extract_header_bubbles(workspace, entry, bubbles).map(|c| vec![c])
            }
            ExtractionStrategy::Unsupported => Err(MalformedRecord::new(
                &entry.key,
                "no extraction strategy for this schema",
            )),
        }
    }
}

/// Classify the shape of one conversation payload.
///
/// Returns `None` for objects that match no known layout.
pub fn classify_composer(value: &Value) -> Option<SchemaVersion> {
    if value
        .get("fullConversationHeadersOnly")
        .map(|h| h.is_array())
        .unwrap_or(false)
    {
        return Some(SchemaVersion::HeaderBubbles);
    }
    if value
        .get("conversation")
        .map(|c| c.is_array())
        .unwrap_or(false)
    {
        return Some(SchemaVersion::EmbeddedMessages);
    }
    None
}

/// Whether a legacy `ItemTable` payload has the chat-tabs layout.
pub fn is_legacy_tabs(value: &Value) -> bool {
    value.get("tabs").map(|t| t.is_array()).unwrap_or(false)
}

/// Parse a timestamp given as ms, seconds, numeric string, or RFC 3339.
pub fn parse_timestamp(value: &Value) -> Option<i64> {
    let ts = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?,
        Value::String(s) => match s.trim().parse::<i64>() {
            Ok(n) => n,
            Err(_) => DateTime::parse_from_rfc3339(s.trim())
                .ok()?
                .timestamp_millis(),
        },
        _ => return None,
    };
    if ts <= 0 {
        return None;
    }
    // Values this small are seconds, not milliseconds.
    if ts < 100_000_000_000 {
        Some(ts * 1000)
    } else {
        Some(ts)
    }
}

fn first_timestamp(value: &Value, pointers: &[&str]) -> Option<i64> {
    pointers
        .iter()
        .filter_map(|p| value.pointer(p))
        .find_map(parse_timestamp)
}

fn message_timestamp(bubble: &Value) -> Option<i64> {
    first_timestamp(
        bubble,
        &["/createdAt", "/timingInfo/clientStartTime", "/timestamp"],
    )
}

fn parse_role(bubble: &Value) -> Option<Role> {
    match bubble.get("type")? {
        Value::Number(n) => match n.as_i64()? {
            1 => Some(Role::User),
            2 => Some(Role::Assistant),
            _ => None,
        },
        Value::String(s) => match s.as_str() {
            "user" => Some(Role::User),
            "ai" | "assistant" => Some(Role::Assistant),
            _ => None,
        },
        _ => None,
    }
}

fn bubble_text(bubble: &Value) -> Option<String> {
    ["text", "rawText"]
        .iter()
        .filter_map(|k| bubble.get(*k).and_then(|v| v.as_str()))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn chat_type(value: &Value) -> ChatType {
    for key in ["unifiedMode", "forceMode"] {
        if let Some(mode) = value.get(key).and_then(|m| m.as_str()) {
            let parsed = ChatType::parse(mode);
            if parsed != ChatType::Unknown {
                return parsed;
            }
        }
    }
    match value.get("isAgentic").and_then(|a| a.as_bool()) {
        Some(true) => ChatType::Agent,
        Some(false) => ChatType::Ask,
        None => ChatType::Unknown,
    }
}

fn composer_id(entry: &RawEntry, value: &Value) -> Result<String, MalformedRecord> {
    value
        .get("composerId")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .or_else(|| entry.key.strip_prefix(COMPOSER_PREFIX).map(str::to_string))
        .filter(|id| !id.is_empty())
        .ok_or_else(|| MalformedRecord::new(&entry.key, "conversation has no id"))
}

/// Build a message from a bubble, inheriting `fallback_ts` when the bubble
/// carries no timestamp of its own. Bubbles without role or text are
/// skipped.
fn bubble_to_message(
    bubble: &Value,
    fallback_ts: Option<i64>,
    workspace: &str,
    chat_id: &str,
    chat_type: ChatType,
) -> Option<Message> {
    let role = parse_role(bubble)?;
    let text = bubble_text(bubble)?;
    let timestamp = message_timestamp(bubble).or(fallback_ts).unwrap_or(0);
    Some(Message {
        text,
        role,
        timestamp,
        workspace: workspace.to_string(),
        chat_id: chat_id.to_string(),
        chat_type,
    })
}

fn finish(
    workspace: &str,
    chat_id: String,
    chat_type: ChatType,
    title: Option<String>,
    mut messages: Vec<Message>,
) -> ConversationRecord {
    // Stable: messages sharing a timestamp keep their source order.
    messages.sort_by_key(|m| m.timestamp);
    ConversationRecord {
        workspace: workspace.to_string(),
        chat_id,
        chat_type,
        title,
        messages,
    }
}

fn title_of(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| value.get(*k).and_then(|v| v.as_str()))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn extract_embedded(workspace: &str, entry: &RawEntry) -> Result<ConversationRecord, MalformedRecord> {
    let value = entry.json()?;
    let chat_id = composer_id(entry, &value)?;
    let kind = chat_type(&value);
    let created = first_timestamp(&value, &["/createdAt"]);
    let bubbles = value
        .get("conversation")
        .and_then(|c| c.as_array())
        .ok_or_else(|| MalformedRecord::new(&entry.key, "missing conversation array"))?;

    let messages = bubbles
        .iter()
        .filter_map(|b| bubble_to_message(b, created, workspace, &chat_id, kind))
        .collect();

    Ok(finish(
        workspace,
        chat_id,
        kind,
        title_of(&value, &["name", "title"]),
        messages,
    ))
}

fn extract_header_bubbles(
    workspace: &str,
    entry: &RawEntry,
    bubbles: &HashMap<String, Value>,
) -> Result<ConversationRecord, MalformedRecord> {
    let value = entry.json()?;
    let chat_id = composer_id(entry, &value)?;
    let kind = chat_type(&value);
    let created = first_timestamp(&value, &["/createdAt"]);
    let headers = value
        .get("fullConversationHeadersOnly")
        .and_then(|h| h.as_array())
        .ok_or_else(|| MalformedRecord::new(&entry.key, "missing conversation headers"))?;

    let mut messages = Vec::with_capacity(headers.len());
    for header in headers {
        let Some(bubble_id) = header.get("bubbleId").and_then(|b| b.as_str()) else {
            tracing::debug!(key = %entry.key, "header without bubbleId");
            continue;
        };
        let Some(bubble) = bubbles.get(bubble_id) else {
            tracing::debug!(key = %entry.key, bubble_id, "bubble record missing");
            continue;
        };
        if let Some(m) = bubble_to_message(bubble, created, workspace, &chat_id, kind) {
            messages.push(m);
        }
    }

    Ok(finish(
        workspace,
        chat_id,
        kind,
        title_of(&value, &["name", "title"]),
        messages,
    ))
}

fn extract_legacy_tabs(
    workspace: &str,
    entry: &RawEntry,
) -> Result<Vec<ConversationRecord>, MalformedRecord> {
    let value = entry.json()?;
    let tabs = value
        .get("tabs")
        .and_then(|t| t.as_array())
        .ok_or_else(|| MalformedRecord::new(&entry.key, "missing tabs array"))?;

    let mut conversations = Vec::with_capacity(tabs.len());
    for tab in tabs {
        let Some(chat_id) = tab.get("tabId").and_then(|t| t.as_str()) else {
            tracing::debug!(key = %entry.key, "chat tab without tabId");
            continue;
        };
        let last_send = first_timestamp(tab, &["/lastSendTime"]);
        let messages = tab
            .get("bubbles")
            .and_then(|b| b.as_array())
            .map(|bubbles| {
                bubbles
                    .iter()
                    .filter_map(|b| bubble_to_message(b, last_send, workspace, chat_id, ChatType::Ask))
                    .collect()
            })
            .unwrap_or_default();
        conversations.push(finish(
            workspace,
            chat_id.to_string(),
            ChatType::Ask,
            title_of(tab, &["chatTitle"]),
            messages,
        ));
    }
    Ok(conversations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_timestamp_formats() {
        assert_eq!(parse_timestamp(&json!(1_700_000_000_000i64)), Some(1_700_000_000_000));
        assert_eq!(parse_timestamp(&json!(1_700_000_000)), Some(1_700_000_000_000));
        assert_eq!(parse_timestamp(&json!("1700000000000")), Some(1_700_000_000_000));
        assert_eq!(
            parse_timestamp(&json!("2023-11-14T22:13:20Z")),
            Some(1_700_000_000_000)
        );
        assert_eq!(parse_timestamp(&json!(0)), None);
        assert_eq!(parse_timestamp(&json!("yesterday")), None);
        assert_eq!(parse_timestamp(&json!(null)), None);
    }

    #[test]
    fn test_classify_composer() {
        assert_eq!(
            classify_composer(&json!({"conversation": []})),
            Some(SchemaVersion::EmbeddedMessages)
        );
        assert_eq!(
            classify_composer(&json!({"fullConversationHeadersOnly": [], "conversation": []})),
            Some(SchemaVersion::HeaderBubbles)
        );
        assert_eq!(classify_composer(&json!({"richText": "?"})), None);
    }

    #[test]
    fn test_embedded_extraction() {
        let entry = RawEntry::new(
            "composerData:abc",
            json!({
                "composerId": "abc",
                "unifiedMode": "agent",
                "createdAt": 1_700_000_000_000i64,
                "conversation": [
                    {"type": 1, "text": "How do I fix the borrow error?", "timingInfo": {"clientStartTime": 1_700_000_001_000i64}},
                    {"type": 2, "text": "Clone the Arc before moving it."},
                    {"type": 2, "text": ""},
                    {"type": 7, "text": "tool call"}
                ]
            })
            .to_string(),
        );
        let convs = ExtractionStrategy::EmbeddedMessages
            .extract("W", &entry, &HashMap::new())
            .unwrap();
        assert_eq!(convs.len(), 1);
        let conv = &convs[0];
        assert_eq!(conv.chat_id, "abc");
        assert_eq!(conv.chat_type, ChatType::Agent);
        assert_eq!(conv.messages.len(), 2);
        // The reply inherits createdAt, so it sorts first.
        assert_eq!(conv.messages[0].role, Role::Assistant);
        assert_eq!(conv.messages[0].timestamp, 1_700_000_000_000);
        assert_eq!(conv.messages[1].role, Role::User);
    }

    #[test]
    fn test_header_bubble_extraction_skips_missing_bubbles() {
        let entry = RawEntry::new(
            "composerData:c1",
            json!({
                "composerId": "c1",
                "isAgentic": false,
                "fullConversationHeadersOnly": [
                    {"bubbleId": "b1", "type": 1},
                    {"bubbleId": "b2", "type": 2},
                    {"bubbleId": "gone", "type": 2}
                ]
            })
            .to_string(),
        );
        let mut bubbles = HashMap::new();
        bubbles.insert(
            "b1".to_string(),
            json!({"type": 1, "text": "question", "createdAt": "2024-01-01T00:00:00Z"}),
        );
        bubbles.insert(
            "b2".to_string(),
            json!({"type": 2, "text": "answer", "createdAt": "2024-01-01T00:00:05Z"}),
        );

        let convs = ExtractionStrategy::HeaderBubbles
            .extract("W", &entry, &bubbles)
            .unwrap();
        let conv = &convs[0];
        assert_eq!(conv.chat_type, ChatType::Ask);
        assert_eq!(conv.messages.len(), 2);
        assert_eq!(conv.messages[1].text, "answer");
        assert_eq!(conv.messages[1].timestamp - conv.messages[0].timestamp, 5000);
    }

    #[test]
    fn test_legacy_tabs_extraction() {
        let entry = RawEntry::new(
            LEGACY_CHAT_KEY,
            json!({
                "tabs": [
                    {"tabId": "t1", "chatTitle": "Setup", "lastSendTime": 1_690_000_000_000i64,
                     "bubbles": [{"type": "user", "text": "hi there"}, {"type": "ai", "rawText": "hello!"}]},
                    {"chatTitle": "no id"}
                ]
            })
            .to_string(),
        );
        let convs = ExtractionStrategy::LegacyChatTabs
            .extract("W", &entry, &HashMap::new())
            .unwrap();
        assert_eq!(convs.len(), 1);
        assert_eq!(convs[0].title.as_deref(), Some("Setup"));
        assert_eq!(convs[0].messages[1].role, Role::Assistant);
        assert_eq!(convs[0].messages[1].text, "hello!");
    }

    #[test]
    fn test_malformed_payloads() {
        let garbage = RawEntry::new("composerData:x", "{not json");
        assert!(ExtractionStrategy::EmbeddedMessages
            .extract("W", &garbage, &HashMap::new())
            .is_err());

        let binary = RawEntry::new("composerData:x", vec![0x7b, 0xff, 0xfe, 0x7d]);
        assert!(binary.json().unwrap_err().reason.contains("UTF-8"));

        let array = RawEntry::new("composerData:x", "[1,2,3]");
        assert!(ExtractionStrategy::EmbeddedMessages
            .extract("W", &array, &HashMap::new())
            .is_err());

        let ok = RawEntry::new("composerData:x", json!({"conversation": []}).to_string());
        let err = ExtractionStrategy::Unsupported
            .extract("W", &ok, &HashMap::new())
            .unwrap_err();
        assert_eq!(err.key, "composerData:x");
    }
}
