use serde_json::json;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

// 2024-03-01T10:00:00Z
const DAY1: i64 = 1_709_287_200_000;

fn recall_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_recall"))
}

async fn write_store(path: &Path, rows: &[(String, String)]) {
    let opts = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let pool = SqlitePool::connect_with(opts).await.unwrap();
    sqlx::query("CREATE TABLE cursorDiskKV (key TEXT UNIQUE ON CONFLICT REPLACE, value BLOB)")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("CREATE TABLE ItemTable (key TEXT UNIQUE ON CONFLICT REPLACE, value BLOB)")
        .execute(&pool)
        .await
        .unwrap();
    for (k, v) in rows {
        sqlx::query("INSERT INTO cursorDiskKV VALUES (?, ?)")
            .bind(k)
            .bind(v.as_bytes())
            .execute(&pool)
            .await
            .unwrap();
    }
    pool.close().await;
}

fn chat_rows() -> Vec<(String, String)> {
    vec![
        (
            "composerData:chat-1".into(),
            json!({
                "composerId": "chat-1",
                "unifiedMode": "chat",
                "createdAt": DAY1,
                "lastUpdatedAt": DAY1 + 10_000,
                "conversation": [
                    {"bubbleId": "b1", "type": 1, "text": "how do I rotate the signing key?", "timingInfo": {"clientStartTime": DAY1}},
                    {"bubbleId": "b2", "type": 2, "text": "run the rotate-keys task, then redeploy", "timingInfo": {"clientStartTime": DAY1 + 4000}}
                ]
            })
            .to_string(),
        ),
        (
            "composerData:chat-2".into(),
            json!({
                "composerId": "chat-2",
                "createdAt": DAY1 + 60_000,
                "lastUpdatedAt": DAY1 + 90_000,
                "conversation": [
                    {"bubbleId": "c1", "type": 1, "text": "what does the retry budget default to?", "timingInfo": {"clientStartTime": DAY1 + 60_000}}
                ]
            })
            .to_string(),
        ),
    ]
}

async fn setup_test_env(rows: &[(String, String)]) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    write_store(&root.join("state.vscdb"), rows).await;

    let config_content = format!(
        r#"[db]
path = "{root}/data/recall.sqlite"

[source]
diagnostics_dir = "{root}/data/diagnostics"

[[source.stores]]
workspace = "api-server"
path = "{root}/state.vscdb"

[retrieval]
top_k = 5
"#,
        root = root.display()
    );

    let config_path = config_dir.join("recall.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_recall(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = recall_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path)
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run recall binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[tokio::test]
async fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env(&chat_rows()).await;

    let (stdout, stderr, success) = run_recall(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/recall.sqlite").exists());
}

#[tokio::test]
async fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env(&chat_rows()).await;

    let (_, _, first) = run_recall(&config_path, &["init"]);
    assert!(first, "First init failed");
    let (_, _, second) = run_recall(&config_path, &["init"]);
    assert!(second, "Second init failed (not idempotent)");
}

#[tokio::test]
async fn test_probe_reports_layout() {
    let (_tmp, config_path) = setup_test_env(&chat_rows()).await;

    let (stdout, stderr, success) = run_recall(&config_path, &["probe"]);
    assert!(success, "probe failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("api-server"));
    assert!(stdout.contains("OK"));
    assert!(stdout.contains("embedded_messages"));
}

#[tokio::test]
async fn test_probe_unknown_layout_fails_with_diagnostics() {
    let rows = vec![(
        "composerData:x".to_string(),
        json!({"threadV7": {"nodes": []}}).to_string(),
    )];
    let (tmp, config_path) = setup_test_env(&rows).await;

    let (stdout, stderr, success) = run_recall(&config_path, &["probe"]);
    assert!(!success, "probe should fail: stdout={}", stdout);
    assert!(stdout.contains("UNKNOWN"));
    assert!(stderr.contains("schema"), "stderr={}", stderr);
    assert!(tmp
        .path()
        .join("data/diagnostics/schema-health-api-server.json")
        .exists());
}

#[tokio::test]
async fn test_sync_dry_run_counts_without_writing() {
    let (tmp, config_path) = setup_test_env(&chat_rows()).await;

    let (stdout, stderr, success) = run_recall(
        &config_path,
        &["sync", "--from", "2024-03-01", "--to", "2024-03-01", "--dry-run"],
    );
    assert!(success, "dry run failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("conversations: 2"), "stdout={}", stdout);
    assert!(stdout.contains("messages: 3"), "stdout={}", stdout);
    assert!(!tmp.path().join("data/recall.sqlite").exists());
}

#[tokio::test]
async fn test_sync_requires_embedding_provider() {
    let (_tmp, config_path) = setup_test_env(&chat_rows()).await;

    run_recall(&config_path, &["init"]);
    let (_, stderr, success) = run_recall(&config_path, &["sync", "--from", "2024-03-01"]);
    assert!(!success);
    assert!(stderr.contains("embeddings"), "stderr={}", stderr);
}

#[tokio::test]
async fn test_workspace_filter_requires_range() {
    let (_tmp, config_path) = setup_test_env(&chat_rows()).await;

    let (_, stderr, success) = run_recall(&config_path, &["sync", "--workspace", "api-server"]);
    assert!(!success);
    assert!(stderr.contains("--workspace requires"), "stderr={}", stderr);
}

#[tokio::test]
async fn test_checkpoint_and_stats_on_fresh_index() {
    let (_tmp, config_path) = setup_test_env(&chat_rows()).await;

    run_recall(&config_path, &["init"]);
    let (stdout, _, success) = run_recall(&config_path, &["checkpoint"]);
    assert!(success);
    assert!(stdout.contains("No checkpoint yet"));

    let (stdout, stderr, success) = run_recall(&config_path, &["stats"]);
    assert!(success, "stats failed: stderr={}", stderr);
    assert!(stdout.contains("Messages:    0"));
    assert!(stdout.contains("never synced"));
}

#[tokio::test]
async fn test_stats_without_init_reports_empty_index() {
    let (tmp, config_path) = setup_test_env(&chat_rows()).await;

    let (stdout, stderr, success) = run_recall(&config_path, &["stats"]);
    assert!(success, "stats failed: stderr={}", stderr);
    assert!(stdout.contains("Messages:    0"), "stdout={}", stdout);
    assert!(tmp.path().join("data/recall.sqlite").exists());
}

#[tokio::test]
async fn test_search_requires_embedding_provider() {
    let (_tmp, config_path) = setup_test_env(&chat_rows()).await;

    run_recall(&config_path, &["init"]);
    let (_, stderr, success) = run_recall(&config_path, &["search", "signing key"]);
    assert!(!success);
    assert!(stderr.contains("embeddings"), "stderr={}", stderr);
}

#[tokio::test]
async fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_recall(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!success);
    assert!(!stderr.is_empty());
}
