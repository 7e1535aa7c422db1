//! Translation module: error taxonomy, prompt construction, and the
//! cache-aware single-item service that the batcher and tools build on.

pub mod batch;
pub mod cache;
pub mod client;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cancellation::CallContext;
use crate::metrics::{metric_names, new_trace_id, MetricsRegistry};

use self::cache::ResultCache;
use self::client::ChatModel;

pub use self::batch::BatchTranslator;

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("empty text input")]
    EmptyText,
    #[error("empty input language")]
    EmptySourceLanguage,
    #[error("empty output language")]
    EmptyTargetLanguage,
    #[error("empty texts input")]
    EmptyBatch,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("API error: {0}")]
    Api(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("translation timeout")]
    Timeout,
    #[error("translation cancelled")]
    Cancelled,
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("batch translation error in chunk {chunk}: failed to translate text at index {index}: {source}")]
    Batch {
        chunk: usize,
        index: usize,
        #[source]
        source: Box<TranslateError>,
    },
}

impl TranslateError {
    /// Input problems: returned immediately, never retried, never cached.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            TranslateError::EmptyText
                | TranslateError::EmptySourceLanguage
                | TranslateError::EmptyTargetLanguage
                | TranslateError::EmptyBatch
                | TranslateError::InvalidInput(_)
        )
    }

    /// Upstream failures a caller may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            TranslateError::Api(_)
            | TranslateError::RateLimited { .. }
            | TranslateError::Timeout
            | TranslateError::InvalidResponse(_) => true,
            TranslateError::Batch { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for TranslateError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TranslateError::Timeout
        } else if e.is_decode() {
            TranslateError::InvalidResponse(e.to_string())
        } else {
            TranslateError::Api(e.to_string())
        }
    }
}

/// Translation result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslateResult {
    pub request_id: String,
    pub translated_text: String,
    pub cached: bool,
    pub elapsed_ms: f64,
}

// --- Prompt construction ---

pub const SYSTEM_PROMPT: &str =
    "You are a translation assistant. Return only the translated text.";

pub fn build_prompt(text: &str, src_lang: &str, tgt_lang: &str) -> String {
    format!(
        "Translate \"{text}\" from {src_lang} to {tgt_lang}. Output the translation only, no explanations."
    )
}

/// Reject empty fields, in text → source → target order.
pub fn validate(text: &str, src_lang: &str, tgt_lang: &str) -> Result<(), TranslateError> {
    if text.is_empty() {
        return Err(TranslateError::EmptyText);
    }
    validate_languages(src_lang, tgt_lang)
}

/// Reject an empty source or target language.
pub fn validate_languages(src_lang: &str, tgt_lang: &str) -> Result<(), TranslateError> {
    if src_lang.is_empty() {
        return Err(TranslateError::EmptySourceLanguage);
    }
    if tgt_lang.is_empty() {
        return Err(TranslateError::EmptyTargetLanguage);
    }
    Ok(())
}

/// Cache-aware single-item translation over a [`ChatModel`].
pub struct TranslationService {
    model: Arc<dyn ChatModel>,
    cache: Arc<ResultCache>,
    metrics: Arc<MetricsRegistry>,
    call_timeout: Duration,
}

impl TranslationService {
    pub fn new(
        model: Arc<dyn ChatModel>,
        cache: Arc<ResultCache>,
        metrics: Arc<MetricsRegistry>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            model,
            cache,
            metrics,
            call_timeout,
        }
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn model_name(&self) -> &'static str {
        self.model.name()
    }

    /// Translate one text. Checks the cache first and populates it on success.
    pub async fn translate(
        &self,
        ctx: &CallContext,
        text: &str,
        src_lang: &str,
        tgt_lang: &str,
    ) -> Result<TranslateResult, TranslateError> {
        validate(text, src_lang, tgt_lang)?;
        let request_id = new_trace_id();
        let start = Instant::now();

        if let Some(hit) = self.cache.get(text, src_lang, tgt_lang) {
            self.metrics.increment(metric_names::CACHE_HIT);
            debug!(%request_id, text, "cache hit");
            return Ok(TranslateResult {
                request_id,
                translated_text: hit,
                cached: true,
                elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
            });
        }
        self.metrics.increment(metric_names::CACHE_MISS);

        ctx.check()?;
        let call_ctx = ctx.with_timeout(self.call_timeout);
        let prompt = build_prompt(text, src_lang, tgt_lang);
        let span = self.metrics.span(metric_names::REMOTE_CALL);

        let output = match call_ctx.run(self.model.generate(&call_ctx, &prompt)).await {
            Ok(output) => output,
            Err(e) => {
                self.metrics.increment(metric_names::REMOTE_ERROR);
                warn!(%request_id, model = self.model.name(), error = %e, "translation call failed");
                return Err(e);
            }
        };
        span.finish();

        let translated = output.trim();
        if translated.is_empty() {
            self.metrics.increment(metric_names::REMOTE_ERROR);
            return Err(TranslateError::InvalidResponse("model returned empty output".into()));
        }

        self.cache.set(text, src_lang, tgt_lang, translated);
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.metrics
            .record(metric_names::TRANSLATE_DONE, elapsed_ms * 1000.0);
        info!(%request_id, src_lang, tgt_lang, elapsed_ms, "translated");

        Ok(TranslateResult {
            request_id,
            translated_text: translated.to_string(),
            cached: false,
            elapsed_ms,
        })
    }

    pub async fn translate_one(
        &self,
        ctx: &CallContext,
        text: &str,
        src_lang: &str,
        tgt_lang: &str,
    ) -> Result<String, TranslateError> {
        self.translate(ctx, text, src_lang, tgt_lang)
            .await
            .map(|r| r.translated_text)
    }
}
