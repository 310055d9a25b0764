//! LLM-backed semantic compression for oversized messages.
//!
//! A [`Compressor`] rewrites a long message into a shorter one that keeps
//! technical decisions, code identifiers, and key claims. One HTTP call per
//! [`compress`](Compressor::compress); retries belong to the caller.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::CompressionConfig;
use crate::error::ProviderError;

#[async_trait]
pub trait Compressor: Send + Sync {
    fn name(&self) -> &str;

    /// Return a rewrite of `text` that should fit in `max_chars` characters.
    async fn compress(&self, text: &str, max_chars: usize) -> Result<String, ProviderError>;
}

const SYSTEM_PROMPT: &str = "You condense developer chat messages. Preserve every technical \
decision, code identifier, file path, command, error message and key claim. Drop pleasantries \
and repetition. Reply with the condensed message only.";

/// Compressor using the OpenAI chat completions API.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAICompressor {
    model: String,
    api_key: String,
    url: String,
    client: reqwest::Client,
}

impl OpenAICompressor {
    pub fn new(config: &CompressionConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("compression.model required for OpenAI compressor"))?;

        let api_key = match std::env::var("OPENAI_API_KEY") {
            Ok(key) => key,
            Err(_) => bail!("OPENAI_API_KEY environment variable not set"),
        };

        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1/chat/completions".to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            api_key,
            url,
            client,
        })
    }
}

#[async_trait]
impl Compressor for OpenAICompressor {
    fn name(&self) -> &str {
        &self.model
    }

    async fn compress(&self, text: &str, max_chars: usize) -> Result<String, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {
                    "role": "user",
                    "content": format!(
                        "Condense the following message to at most {} characters.\n\n{}",
                        max_chars, text
                    )
                }
            ]
        });

        let response = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &body_text));
        }

        let json: serde_json::Value = response.json().await?;
        json.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                ProviderError::Fatal("Invalid completion response: missing content".to_string())
            })
    }
}

/// Build the configured compressor, or `None` when compression is disabled.
pub fn create_compressor(config: &CompressionConfig) -> Result<Option<Arc<dyn Compressor>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "openai" => Ok(Some(Arc::new(OpenAICompressor::new(config)?))),
        other => bail!("Unknown compression provider: {}", other),
    }
}
