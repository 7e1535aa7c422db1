//! Shared test harness: a scripted in-process chat model and service builders.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use llm_translate::cancellation::CallContext;
use llm_translate::config::BatchConfig;
use llm_translate::metrics::MetricsRegistry;
use llm_translate::translate::cache::ResultCache;
use llm_translate::translate::client::ChatModel;
use llm_translate::translate::{TranslateError, TranslationService};

/// Chat model that answers `<text>` for every prompt, with per-text latency,
/// scripted failures and in-flight instrumentation.
#[derive(Default)]
pub struct ScriptedModel {
    default_latency: Duration,
    latencies: HashMap<String, Duration>,
    overrides: HashMap<String, String>,
    failures: Mutex<HashMap<String, usize>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_latency(mut self, latency: Duration) -> Self {
        self.default_latency = latency;
        self
    }

    pub fn with_latency(mut self, text: &str, latency: Duration) -> Self {
        self.latencies.insert(text.to_string(), latency);
        self
    }

    /// Every call for `text` fails.
    pub fn failing(self, text: &str) -> Self {
        self.failing_times(text, usize::MAX)
    }

    /// The first `times` calls for `text` fail.
    pub fn failing_times(self, text: &str, times: usize) -> Self {
        self.failures.lock().insert(text.to_string(), times);
        self
    }

    pub fn responding(mut self, text: &str, output: &str) -> Self {
        self.overrides.insert(text.to_string(), output.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    fn should_fail(&self, text: &str) -> bool {
        let mut failures = self.failures.lock();
        match failures.get_mut(text) {
            Some(0) | None => false,
            Some(remaining) => {
                if *remaining != usize::MAX {
                    *remaining -= 1;
                }
                true
            }
        }
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn generate(&self, ctx: &CallContext, prompt: &str) -> Result<String, TranslateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(prompt.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let text = text_of(prompt);
        let latency = self
            .latencies
            .get(&text)
            .copied()
            .unwrap_or(self.default_latency);
        ctx.sleep(latency).await?;

        if self.should_fail(&text) {
            return Err(TranslateError::Api(format!("scripted failure for {text}")));
        }
        Ok(self
            .overrides
            .get(&text)
            .cloned()
            .unwrap_or_else(|| format!("<{text}>")))
    }
}

/// Recover the source text from a prompt built by `build_prompt`.
pub fn text_of(prompt: &str) -> String {
    let start = prompt.find('"').map(|i| i + 1).unwrap_or(0);
    let end = prompt.rfind("\" from ").unwrap_or(prompt.len());
    prompt[start..end].to_string()
}

pub fn service(model: Arc<ScriptedModel>) -> Arc<TranslationService> {
    service_with_ttl(model, Duration::from_secs(24 * 3600))
}

pub fn service_with_ttl(model: Arc<ScriptedModel>, ttl: Duration) -> Arc<TranslationService> {
    Arc::new(TranslationService::new(
        model,
        Arc::new(ResultCache::new(ttl)),
        Arc::new(MetricsRegistry::new()),
        Duration::from_secs(60),
    ))
}

/// Reference configuration with the pacing delays removed.
pub fn no_delay_config() -> BatchConfig {
    BatchConfig {
        item_delay: Duration::ZERO,
        chunk_delay: Duration::ZERO,
        ..BatchConfig::default()
    }
}

pub fn texts(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
