//! TOML configuration.
//!
//! Every section except `[db]` and `[[source.stores]]` has defaults, so a
//! minimal config is just a database path and one source store:
//!
//! ```toml
//! [db]
//! path = "./data/recall.sqlite"
//!
//! [[source.stores]]
//! workspace = "api-server"
//! path = "~/.config/Cursor/User/globalStorage/state.vscdb"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub normalize: NormalizeConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    /// SQLite file holding the vector rows and the sync checkpoint.
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(default)]
    pub stores: Vec<SourceStoreConfig>,
    #[serde(default = "default_probe_sample_size")]
    pub probe_sample_size: usize,
    #[serde(default = "default_diagnostics_dir")]
    pub diagnostics_dir: PathBuf,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            stores: Vec::new(),
            probe_sample_size: default_probe_sample_size(),
            diagnostics_dir: default_diagnostics_dir(),
        }
    }
}

fn default_probe_sample_size() -> usize {
    50
}
fn default_diagnostics_dir() -> PathBuf {
    PathBuf::from("./data/diagnostics")
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceStoreConfig {
    /// Label attached to every message extracted from this store.
    pub workspace: String,
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NormalizeConfig {
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_truncation_marker")]
    pub truncation_marker: String,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            min_chars: default_min_chars(),
            max_chars: default_max_chars(),
            truncation_marker: default_truncation_marker(),
        }
    }
}

fn default_min_chars() -> usize {
    5
}
fn default_max_chars() -> usize {
    6000
}
fn default_truncation_marker() -> String {
    " [...truncated]".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompressionConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_compression_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            url: None,
            max_attempts: default_compression_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl CompressionConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

fn default_compression_attempts() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            timeout_secs: default_timeout_secs(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    /// `max_retries` counts retries, so total attempts is one more.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries.saturating_add(1),
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_concurrency() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Ids per existence-check query.
    #[serde(default = "default_exists_chunk_size")]
    pub exists_chunk_size: usize,
    #[serde(default = "default_write_attempts")]
    pub write_attempts: u32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            exists_chunk_size: default_exists_chunk_size(),
            write_attempts: default_write_attempts(),
        }
    }
}

impl IndexConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.write_attempts,
            Duration::from_millis(200),
            Duration::from_secs(5),
        )
    }
}

fn default_exists_chunk_size() -> usize {
    500
}
fn default_write_attempts() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,
    #[serde(default = "default_context_messages")]
    pub context_messages: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_similarity: default_min_similarity(),
            context_messages: default_context_messages(),
        }
    }
}

fn default_top_k() -> usize {
    10
}
fn default_min_similarity() -> f32 {
    0.3
}
fn default_context_messages() -> usize {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Safety margin re-scanned before the checkpoint on every incremental run.
    #[serde(default = "default_overlap_minutes")]
    pub overlap_minutes: i64,
    /// Window scanned by the first incremental run, when no checkpoint exists.
    #[serde(default = "default_initial_lookback_days")]
    pub initial_lookback_days: i64,
    /// Persist the checkpoint to this JSON file instead of the index database.
    #[serde(default)]
    pub checkpoint_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            overlap_minutes: default_overlap_minutes(),
            initial_lookback_days: default_initial_lookback_days(),
            checkpoint_path: None,
        }
    }
}

fn default_overlap_minutes() -> i64 {
    60
}
fn default_initial_lookback_days() -> i64 {
    30
}

impl Config {
    /// A config with every default and no source stores.
    pub fn minimal() -> Self {
        Self {
            db: DbConfig {
                path: PathBuf::from("./data/recall.sqlite"),
            },
            source: SourceConfig::default(),
            normalize: NormalizeConfig::default(),
            compression: CompressionConfig::default(),
            embedding: EmbeddingConfig::default(),
            index: IndexConfig::default(),
            retrieval: RetrievalConfig::default(),
            sync: SyncConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.normalize.max_chars == 0 {
            bail!("normalize.max_chars must be > 0");
        }
        if self.normalize.min_chars > self.normalize.max_chars {
            bail!("normalize.min_chars must be <= normalize.max_chars");
        }
        if self.normalize.truncation_marker.chars().count() >= self.normalize.max_chars {
            bail!("normalize.truncation_marker must be shorter than normalize.max_chars");
        }
        if self.source.probe_sample_size == 0 {
            bail!("source.probe_sample_size must be > 0");
        }
        for store in &self.source.stores {
            if store.workspace.trim().is_empty() {
                bail!("source.stores: workspace label must not be empty");
            }
        }
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }
        if self.embedding.max_concurrency == 0 {
            bail!("embedding.max_concurrency must be > 0");
        }
        if self.index.exists_chunk_size == 0 {
            bail!("index.exists_chunk_size must be > 0");
        }
        if self.retrieval.top_k == 0 {
            bail!("retrieval.top_k must be >= 1");
        }
        if !(-1.0..=1.0).contains(&self.retrieval.min_similarity) {
            bail!("retrieval.min_similarity must be in [-1.0, 1.0]");
        }
        if self.sync.overlap_minutes < 0 || self.sync.initial_lookback_days < 0 {
            bail!("sync.overlap_minutes and sync.initial_lookback_days must be >= 0");
        }

        if self.embedding.is_enabled() {
            if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    self.embedding.provider
                );
            }
            if self.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    self.embedding.provider
                );
            }
        }
        match self.embedding.provider.as_str() {
            "disabled" | "openai" | "ollama" => {}
            other => bail!(
                "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
                other
            ),
        }

        match self.compression.provider.as_str() {
            "disabled" => {}
            "openai" => {
                if self.compression.model.is_none() {
                    bail!("compression.model must be specified when provider is 'openai'");
                }
            }
            other => bail!(
                "Unknown compression provider: '{}'. Must be disabled or openai.",
                other
            ),
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    config.db.path = expand_tilde(&config.db.path);
    config.source.diagnostics_dir = expand_tilde(&config.source.diagnostics_dir);
    for store in &mut config.source.stores {
        store.path = expand_tilde(&store.path);
    }
    if let Some(path) = &config.sync.checkpoint_path {
        config.sync.checkpoint_path = Some(expand_tilde(path));
    }

    Ok(config)
}

/// Expand `~` at the start of a path to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if s.starts_with("~/") || s == "~" {
        if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
            return home.join(s.strip_prefix("~/").unwrap_or(""));
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_expand_tilde() {
        let expanded = expand_tilde(Path::new("~/.config/Cursor/state.vscdb"));
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert!(expanded.ends_with(".config/Cursor/state.vscdb"));
        let abs = Path::new("/var/lib/state.vscdb");
        assert_eq!(expand_tilde(abs), abs.to_path_buf());
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let cfg = parse(
            r#"
            [db]
            path = "/tmp/recall.sqlite"

            [[source.stores]]
            workspace = "W"
            path = "/tmp/state.vscdb"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.source.stores.len(), 1);
        assert_eq!(cfg.normalize.max_chars, 6000);
        assert_eq!(cfg.embedding.batch_size, 64);
        assert_eq!(cfg.embedding.max_concurrency, 4);
        assert!(!cfg.embedding.is_enabled());
        assert_eq!(cfg.retrieval.top_k, 10);
        assert_eq!(cfg.embedding.retry_policy().max_attempts, 6);
    }

    #[test]
    fn test_enabled_embedding_requires_model_and_dims() {
        let err = parse(
            r#"
            [db]
            path = "/tmp/recall.sqlite"

            [embedding]
            provider = "openai"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let err = parse(
            r#"
            [db]
            path = "/tmp/recall.sqlite"

            [embedding]
            provider = "magic"
            model = "m"
            dims = 8
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn test_min_above_max_rejected() {
        let mut cfg = Config::minimal();
        cfg.normalize.min_chars = 100;
        cfg.normalize.max_chars = 50;
        assert!(cfg.validate().is_err());
    }
}
