//! Index statistics and sync health overview.
//!
//! Summarizes what is indexed: message counts per workspace, how many texts
//! had to be compressed or truncated, and where the sync checkpoint stands.
//! Used by `recall stats` to give confidence that syncs are keeping up.

use anyhow::Result;
use sqlx::Row;

use crate::checkpoint::checkpoint_store;
use crate::config::Config;
use crate::db;
use crate::migrate::migrate_pool;

/// Per-workspace breakdown.
struct WorkspaceStats {
    workspace: String,
    messages: i64,
    conversations: i64,
    newest_ts: Option<i64>,
}

/// Run the stats command: query the index database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM indexed_messages")
        .fetch_one(&pool)
        .await?;

    let form_rows = sqlx::query(
        "SELECT text_form, COUNT(*) AS n FROM indexed_messages GROUP BY text_form",
    )
    .fetch_all(&pool)
    .await?;
    let form_count = |form: &str| -> i64 {
        form_rows
            .iter()
            .find(|r| r.get::<String, _>("text_form") == form)
            .map(|r| r.get::<i64, _>("n"))
            .unwrap_or(0)
    };

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Chat Recall Index Stats");
    println!("=======================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Messages:    {}", total);
    println!("  Compressed:  {}", form_count("compressed"));
    println!("  Truncated:   {}", form_count("truncated"));

    let checkpoints = checkpoint_store(&config.sync, &pool);
    match checkpoints.load().await? {
        Some(cp) => println!(
            "  Checkpoint:  {} (last run indexed {}, updated {})",
            format_ts_iso(cp.last_synced_timestamp),
            cp.last_run_count,
            format_ts_relative(cp.updated_at)
        ),
        None => println!("  Checkpoint:  never synced"),
    }

    let rows = sqlx::query(
        r#"
        SELECT
            workspace,
            COUNT(*) AS messages,
            COUNT(DISTINCT chat_id) AS conversations,
            MAX(timestamp) AS newest_ts
        FROM indexed_messages
        GROUP BY workspace
        ORDER BY messages DESC
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let stats: Vec<WorkspaceStats> = rows
        .iter()
        .map(|row| WorkspaceStats {
            workspace: row.get("workspace"),
            messages: row.get("messages"),
            conversations: row.get("conversations"),
            newest_ts: row.get("newest_ts"),
        })
        .collect();

    if !stats.is_empty() {
        println!();
        println!("  By workspace:");
        println!(
            "  {:<24} {:>8} {:>8}   {}",
            "WORKSPACE", "MESSAGES", "CHATS", "NEWEST"
        );
        println!("  {}", "-".repeat(64));

        for s in &stats {
            let newest = match s.newest_ts {
                Some(ts) => format_ts_relative(ts),
                None => "-".to_string(),
            };
            println!(
                "  {:<24} {:>8} {:>8}   {}",
                s.workspace, s.messages, s.conversations, newest
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a millisecond timestamp relative to now (e.g. "3 hours ago").
fn format_ts_relative(ts_ms: i64) -> String {
    let delta = (chrono::Utc::now().timestamp_millis() - ts_ms) / 1000;

    if delta < 0 {
        return format_ts_iso(ts_ms);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts_ms)
    }
}

fn format_ts_iso(ts_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ts_ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts_ms.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_format_ts() {
        assert_eq!(format_ts_iso(1_709_287_200_000), "2024-03-01 10:00");
        let recent = chrono::Utc::now().timestamp_millis() - 2 * 3600 * 1000;
        assert_eq!(format_ts_relative(recent), "2 hours ago");
        let future = chrono::Utc::now().timestamp_millis() + 86_400_000;
        assert_eq!(format_ts_relative(future), format_ts_iso(future));
    }
}
