//! Schema probe: classify a source store before anything is extracted.
//!
//! The probe samples conversation records and the legacy chat item, votes
//! on which layout each sample matches, and reports the majority layout
//! together with every layout that received at least one vote. Unparseable
//! samples become issues, not errors.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde_json::Value;
use sqlx::SqlitePool;

use crate::models::{SchemaHealthReport, SchemaVersion};
use crate::source::strategy::{
    classify_composer, is_legacy_tabs, RawEntry, BUBBLE_PREFIX, COMPOSER_PREFIX, LEGACY_CHAT_KEY,
};

/// Key/value tables present in the store.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tables {
    pub disk_kv: bool,
    pub item_table: bool,
}

pub async fn tables(pool: &SqlitePool) -> Result<Tables, sqlx::Error> {
    let names: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('cursorDiskKV', 'ItemTable')",
    )
    .fetch_all(pool)
    .await?;

    Ok(Tables {
        disk_kv: names.iter().any(|n| n == "cursorDiskKV"),
        item_table: names.iter().any(|n| n == "ItemTable"),
    })
}

/// Probe one store, sampling at most `sample_size` conversation records.
pub async fn probe(pool: &SqlitePool, sample_size: usize) -> Result<SchemaHealthReport, sqlx::Error> {
    let tables = tables(pool).await?;
    let mut votes: BTreeMap<SchemaVersion, usize> = BTreeMap::new();
    let mut issues = Vec::new();
    let mut sample_keys = Vec::new();

    if !tables.disk_kv && !tables.item_table {
        issues.push("no cursorDiskKV or ItemTable table found".to_string());
    }

    if tables.disk_kv {
        let rows: Vec<(String, Option<Vec<u8>>)> = sqlx::query_as(
            "SELECT key, CAST(value AS BLOB) FROM cursorDiskKV \
             WHERE key >= ? AND key < ? ORDER BY key LIMIT ?",
        )
        .bind(COMPOSER_PREFIX)
        .bind(prefix_upper_bound(COMPOSER_PREFIX))
        .bind(sample_size.max(1) as i64)
        .fetch_all(pool)
        .await?;

        let has_bubbles: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM cursorDiskKV WHERE key >= ? AND key < ? LIMIT 1",
        )
        .bind(BUBBLE_PREFIX)
        .bind(prefix_upper_bound(BUBBLE_PREFIX))
        .fetch_optional(pool)
        .await?;

        for (key, value) in rows {
            let entry = RawEntry { key, value };
            if sample_keys.len() < 20 {
                sample_keys.push(entry.key.clone());
            }
            match entry.json() {
                Ok(value) => match classify_composer(&value) {
                    // A chat with no headers yet needs no bubbles.
                    Some(SchemaVersion::HeaderBubbles)
                        if has_bubbles.is_none() && has_headers(&value) =>
                    {
                        issues.push(format!(
                            "{}: conversation headers present but no bubble records exist",
                            entry.key
                        ));
                    }
                    Some(version) => *votes.entry(version).or_default() += 1,
                    None => issues.push(format!("{}: unrecognized payload shape", entry.key)),
                },
                Err(e) => issues.push(e.to_string()),
            }
        }
    }

    if tables.item_table {
        let legacy: Option<Option<Vec<u8>>> =
            sqlx::query_scalar("SELECT CAST(value AS BLOB) FROM ItemTable WHERE key = ?")
                .bind(LEGACY_CHAT_KEY)
                .fetch_optional(pool)
                .await?;

        if let Some(value) = legacy {
            let entry = RawEntry {
                key: LEGACY_CHAT_KEY.to_string(),
                value,
            };
            sample_keys.push(entry.key.clone());
            match entry.json() {
                Ok(v) if is_legacy_tabs(&v) => {
                    *votes.entry(SchemaVersion::LegacyChatTabs).or_default() += 1
                }
                Ok(_) => issues.push(format!("{}: unrecognized payload shape", entry.key)),
                Err(e) => issues.push(e.to_string()),
            }
        }
    }

    let viable_strategies: BTreeSet<SchemaVersion> = votes.keys().copied().collect();
    let schema_version = majority(&votes);
    if schema_version == SchemaVersion::Unknown && issues.is_empty() {
        issues.push("no conversation records found".to_string());
    }

    Ok(SchemaHealthReport {
        is_healthy: schema_version != SchemaVersion::Unknown,
        schema_version,
        viable_strategies,
        issues,
        sample_keys,
    })
}

fn has_headers(value: &Value) -> bool {
    value
        .get("fullConversationHeadersOnly")
        .and_then(|h| h.as_array())
        .is_some_and(|h| !h.is_empty())
}

/// Highest vote count wins; ties go to the newer layout.
fn majority(votes: &BTreeMap<SchemaVersion, usize>) -> SchemaVersion {
    votes
        .iter()
        .filter(|(_, n)| **n > 0)
        .max_by_key(|(version, n)| (**n, **version))
        .map(|(version, _)| *version)
        .unwrap_or(SchemaVersion::Unknown)
}

/// Smallest key strictly greater than every key starting with `prefix`.
/// Prefixes here all end in `:`, whose successor is `;`.
pub(crate) fn prefix_upper_bound(prefix: &str) -> String {
    let mut upper = prefix.to_string();
    if let Some(last) = upper.pop() {
        upper.push(char::from_u32(last as u32 + 1).unwrap_or(char::MAX));
    }
    upper
}

/// Write `report` as pretty JSON under `dir`. Returns the written path.
pub fn write_diagnostics(
    dir: &Path,
    workspace: &str,
    report: &SchemaHealthReport,
) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let safe: String = workspace
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let path = dir.join(format!("schema-health-{}.json", safe));
    let json = serde_json::to_string_pretty(report).map_err(std::io::Error::other)?;
    std::fs::write(&path, json)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_path;
    use serde_json::json;
    use tempfile::TempDir;

    async fn kv_store(tmp: &TempDir, rows: &[(&str, String)]) -> SqlitePool {
        let pool = connect_path(&tmp.path().join("state.vscdb")).await.unwrap();
        sqlx::query("CREATE TABLE cursorDiskKV (key TEXT UNIQUE ON CONFLICT REPLACE, value BLOB)")
            .execute(&pool)
            .await
            .unwrap();
        for (k, v) in rows {
            sqlx::query("INSERT INTO cursorDiskKV (key, value) VALUES (?, ?)")
                .bind(*k)
                .bind(v.as_bytes())
                .execute(&pool)
                .await
                .unwrap();
        }
        pool
    }

    #[test]
    fn test_prefix_upper_bound() {
        assert_eq!(prefix_upper_bound("bubbleId:"), "bubbleId;");
    }

    #[test]
    fn test_majority_prefers_newer_layout_on_tie() {
        let mut votes = BTreeMap::new();
        votes.insert(SchemaVersion::EmbeddedMessages, 2);
        votes.insert(SchemaVersion::HeaderBubbles, 2);
        assert_eq!(majority(&votes), SchemaVersion::HeaderBubbles);
        votes.insert(SchemaVersion::EmbeddedMessages, 3);
        assert_eq!(majority(&votes), SchemaVersion::EmbeddedMessages);
        assert_eq!(majority(&BTreeMap::new()), SchemaVersion::Unknown);
    }

    #[tokio::test]
    async fn test_probe_majority_vote() {
        let tmp = TempDir::new().unwrap();
        let pool = kv_store(
            &tmp,
            &[
                ("composerData:a", json!({"conversation": []}).to_string()),
                ("composerData:b", json!({"conversation": []}).to_string()),
                ("composerData:c", json!({"fullConversationHeadersOnly": []}).to_string()),
                ("composerData:d", "not json".to_string()),
                ("bubbleId:c:1", json!({"type": 1, "text": "x"}).to_string()),
            ],
        )
        .await;

        let report = probe(&pool, 50).await.unwrap();
        assert!(report.is_healthy);
        assert_eq!(report.schema_version, SchemaVersion::EmbeddedMessages);
        assert_eq!(report.viable_strategies.len(), 2);
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.sample_keys.len(), 4);
    }

    #[tokio::test]
    async fn test_probe_unknown_layout_is_unhealthy() {
        let tmp = TempDir::new().unwrap();
        let pool = kv_store(
            &tmp,
            &[("composerData:a", json!({"richText": "?"}).to_string())],
        )
        .await;

        let report = probe(&pool, 50).await.unwrap();
        assert!(!report.is_healthy);
        assert_eq!(report.schema_version, SchemaVersion::Unknown);
        assert!(report.viable_strategies.is_empty());
        assert!(report.issues[0].contains("unrecognized"));

        let dir = tmp.path().join("diag");
        let path = write_diagnostics(&dir, "my repo", &report).unwrap();
        assert!(path.ends_with("schema-health-my_repo.json"));
        let back: SchemaHealthReport =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(back.schema_version, SchemaVersion::Unknown);
    }

    #[tokio::test]
    async fn test_probe_headers_without_bubbles() {
        let tmp = TempDir::new().unwrap();
        let pool = kv_store(
            &tmp,
            &[(
                "composerData:a",
                json!({"fullConversationHeadersOnly": [{"bubbleId": "x"}]}).to_string(),
            )],
        )
        .await;

        let report = probe(&pool, 50).await.unwrap();
        assert!(!report.is_healthy);
        assert!(report.issues[0].contains("no bubble records"));
    }

    #[tokio::test]
    async fn test_probe_new_empty_chats_are_healthy() {
        let tmp = TempDir::new().unwrap();
        let pool = kv_store(
            &tmp,
            &[
                ("composerData:a", json!({"fullConversationHeadersOnly": []}).to_string()),
                ("composerData:b", json!({"fullConversationHeadersOnly": []}).to_string()),
            ],
        )
        .await;

        let report = probe(&pool, 50).await.unwrap();
        assert!(report.is_healthy);
        assert_eq!(report.schema_version, SchemaVersion::HeaderBubbles);
        assert!(report.issues.is_empty());
    }

    #[tokio::test]
    async fn test_probe_survives_undecodable_value() {
        let tmp = TempDir::new().unwrap();
        let pool = kv_store(
            &tmp,
            &[("composerData:a", json!({"conversation": []}).to_string())],
        )
        .await;
        sqlx::query("INSERT INTO cursorDiskKV (key, value) VALUES (?, ?)")
            .bind("composerData:bad")
            .bind(vec![0x7bu8, 0xff, 0xfe, 0x7d])
            .execute(&pool)
            .await
            .unwrap();

        let report = probe(&pool, 50).await.unwrap();
        assert!(report.is_healthy);
        assert_eq!(report.schema_version, SchemaVersion::EmbeddedMessages);
        assert_eq!(report.issues.len(), 1);
        assert!(report.issues[0].contains("UTF-8"));
    }

    #[tokio::test]
    async fn test_probe_empty_database() {
        let tmp = TempDir::new().unwrap();
        let pool = connect_path(&tmp.path().join("empty.vscdb")).await.unwrap();
        let report = probe(&pool, 50).await.unwrap();
        assert!(!report.is_healthy);
        assert!(report.issues[0].contains("no cursorDiskKV"));
    }
}
