//! Message text normalization under embedding size limits.
//!
//! Every message passes two gates:
//!
//! 1. **Screening**: canonicalize the text (strip NULs, unify line endings,
//!    trim) and reject anything shorter than `min_chars`. The canonical text
//!    is what the content-addressed id is computed from.
//! 2. **Fitting**: texts longer than `max_chars` are first sent through
//!    semantic compression (bounded retries with backoff); if that fails,
//!    they are cut at the nearest sentence or line boundary and marked as
//!    truncated. Fitting never fails.

pub mod compress;

use std::sync::Arc;

use anyhow::Result;

use crate::config::{Config, NormalizeConfig};
use crate::error::ProviderError;
use crate::models::TextForm;
use crate::retry::RetryPolicy;

pub use compress::{create_compressor, Compressor};

/// Why a message was not indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Empty,
    TooShort { chars: usize },
}

/// Text ready for embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub text: String,
    pub form: TextForm,
}

pub struct Normalizer {
    min_chars: usize,
    max_chars: usize,
    marker: String,
    compressor: Option<Arc<dyn Compressor>>,
    retry: RetryPolicy,
}

impl Normalizer {
    pub fn new(
        config: &NormalizeConfig,
        compressor: Option<Arc<dyn Compressor>>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            min_chars: config.min_chars,
            max_chars: config.max_chars,
            marker: config.truncation_marker.clone(),
            compressor,
            retry,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let compressor = create_compressor(&config.compression)?;
        Ok(Self::new(
            &config.normalize,
            compressor,
            config.compression.retry_policy(),
        ))
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    /// Canonicalize and apply the minimum-length gate.
    pub fn screen(&self, raw: &str) -> Result<String, Rejection> {
        let text = canonicalize(raw);
        let chars = text.chars().count();
        if chars == 0 {
            return Err(Rejection::Empty);
        }
        if chars < self.min_chars {
            return Err(Rejection::TooShort { chars });
        }
        Ok(text)
    }

    /// Bring screened text within `max_chars`.
    pub async fn fit(&self, text: String) -> Normalized {
        if text.chars().count() <= self.max_chars {
            return Normalized {
                text,
                form: TextForm::Original,
            };
        }

        if let Some(compressor) = &self.compressor {
            match self.compress(compressor, &text).await {
                Ok(compressed) if compressed.chars().count() <= self.max_chars => {
                    return Normalized {
                        text: compressed,
                        form: TextForm::Compressed,
                    };
                }
                Ok(compressed) => {
                    tracing::debug!(
                        chars = compressed.chars().count(),
                        max = self.max_chars,
                        "compressed text still too long, truncating"
                    );
                    return Normalized {
                        text: self.truncate(&compressed),
                        form: TextForm::Truncated,
                    };
                }
                Err(e) => {
                    tracing::warn!(
                        compressor = compressor.name(),
                        error = %e,
                        "semantic compression failed, falling back to truncation"
                    );
                }
            }
        }

        Normalized {
            text: self.truncate(&text),
            form: TextForm::Truncated,
        }
    }

    /// Screen then fit.
    pub async fn normalize(&self, raw: &str) -> Result<Normalized, Rejection> {
        let text = self.screen(raw)?;
        Ok(self.fit(text).await)
    }

    pub fn truncate(&self, text: &str) -> String {
        truncate_at_boundary(text, self.max_chars, &self.marker)
    }

    async fn compress(
        &self,
        compressor: &Arc<dyn Compressor>,
        text: &str,
    ) -> Result<String, ProviderError> {
        let max_chars = self.max_chars;
        let out = self
            .retry
            .run(
                "compress",
                move || async move {
                    let out = compressor.compress(text, max_chars).await?;
                    let out = canonicalize(&out);
                    if out.is_empty() {
                        return Err(ProviderError::Fatal(
                            "compressor returned empty text".to_string(),
                        ));
                    }
                    Ok(out)
                },
                ProviderError::is_transient,
            )
            .await?;
        Ok(out)
    }
}

/// Strip NULs, unify line endings, and trim surrounding whitespace.
pub fn canonicalize(raw: &str) -> String {
    raw.replace('\0', "")
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .trim()
        .to_string()
}

/// Cut `text` to at most `max_chars` characters including `marker`.
///
/// Prefers the last sentence end (`.`, `!`, `?` followed by whitespace) or
/// line break within the budget, then the last whitespace, then a hard cut.
/// A boundary is only used if it keeps at least half of the budget.
pub fn truncate_at_boundary(text: &str, max_chars: usize, marker: &str) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let marker_chars = marker.chars().count();
    if marker_chars >= max_chars {
        return marker.chars().take(max_chars).collect();
    }

    let budget = max_chars - marker_chars;
    let byte_end = text
        .char_indices()
        .nth(budget)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let window = &text[..byte_end];
    let min_keep = budget / 2;
    let keeps_enough = |cut: usize| window[..cut].chars().count() >= min_keep;

    let sentence_end = window
        .char_indices()
        .filter(|(i, c)| {
            matches!(c, '.' | '!' | '?')
                && text[i + c.len_utf8()..].starts_with(char::is_whitespace)
        })
        .map(|(i, c)| i + c.len_utf8())
        .last();
    let line_end = window.rfind('\n');
    let boundary = match (sentence_end, line_end) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };

    let cut = boundary
        .filter(|&cut| keeps_enough(cut))
        .or_else(|| {
            window
                .rfind(char::is_whitespace)
                .filter(|&cut| keeps_enough(cut))
        })
        .unwrap_or(byte_end);

    let mut out = window[..cut].trim_end().to_string();
    out.push_str(marker);
    out
}
