//! Runtime configuration: API endpoint, cache TTL, batch fan-out limits.
//! Everything has a default; the environment overrides a handful of knobs.

use std::str::FromStr;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::warn;

use crate::translate::TranslateError;

pub const DEFAULT_BASE_URL: &str = "https://api.siliconflow.cn/v1";
pub const DEFAULT_MODEL: &str = "Qwen/Qwen2.5-72B-Instruct";

/// Connection settings for the chat-completion endpoint.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    /// Transport-level timeout for a single HTTP request.
    pub http_timeout: Duration,
    /// Minimum spacing between request starts.
    pub min_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            http_timeout: Duration::from_secs(60),
            min_interval: Duration::from_millis(100),
            retry: RetryPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Reads `SILICONFLOW_API_URL`, `SILICONFLOW_API_KEY` and `SILICONFLOW_MODEL`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        match non_empty_var("SILICONFLOW_API_URL") {
            Some(url) => config.base_url = url.trim_end_matches('/').to_string(),
            None => warn!(default = DEFAULT_BASE_URL, "SILICONFLOW_API_URL not set, using default"),
        }
        config.api_key = non_empty_var("SILICONFLOW_API_KEY");
        if let Some(model) = non_empty_var("SILICONFLOW_MODEL") {
            config.model = model;
        }
        config
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

/// Retry behaviour of the HTTP adapter. This is the only retry layer.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 429 responses: honour Retry-After, else 1s/2s/4s.
    pub max_rate_limit_retries: u32,
    /// 5xx responses: `base_backoff * 2^attempt`.
    pub max_server_retries: u32,
    pub retry_timeout_once: bool,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_rate_limit_retries: 3,
            max_server_retries: 2,
            retry_timeout_once: true,
            base_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    /// Upper bound on stored entries; oldest entry is evicted first.
    pub max_entries: Option<usize>,
    /// Period of the optional background sweep. `None` keeps expiry lazy.
    pub sweep_interval: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 3600),
            max_entries: None,
            sweep_interval: None,
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(secs) = parse_var::<u64>("TRANSLATE_CACHE_TTL_SECS") {
            config.ttl = Duration::from_secs(secs);
        }
        config.max_entries = parse_var::<usize>("TRANSLATE_CACHE_MAX_ENTRIES").filter(|n| *n > 0);
        config.sweep_interval = parse_var::<u64>("TRANSLATE_CACHE_SWEEP_SECS")
            .filter(|s| *s > 0)
            .map(Duration::from_secs);
        config
    }
}

/// Fan-out limits for batch translation.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub chunk_size: usize,
    pub max_concurrency: usize,
    pub item_timeout: Duration,
    /// Pause after each real remote call, not after cache hits.
    pub item_delay: Duration,
    /// Pause between chunks, never after the last one.
    pub chunk_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            chunk_size: 3,
            max_concurrency: 2,
            item_timeout: Duration::from_secs(60),
            item_delay: Duration::from_millis(500),
            chunk_delay: Duration::from_secs(1),
        }
    }
}

impl BatchConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = parse_var::<usize>("TRANSLATE_CHUNK_SIZE") {
            config.chunk_size = n;
        }
        if let Some(n) = parse_var::<usize>("TRANSLATE_MAX_CONCURRENCY") {
            config.max_concurrency = n;
        }
        config
    }

    pub fn validate(&self) -> Result<(), TranslateError> {
        if self.chunk_size == 0 {
            return Err(TranslateError::Config("chunk_size must be > 0".into()));
        }
        if self.max_concurrency == 0 {
            return Err(TranslateError::Config("max_concurrency must be > 0".into()));
        }
        if self.max_concurrency > Semaphore::MAX_PERMITS {
            return Err(TranslateError::Config(format!(
                "max_concurrency must be <= {}",
                Semaphore::MAX_PERMITS
            )));
        }
        Ok(())
    }
}

/// Top-level settings assembled once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub client: ClientConfig,
    pub cache: CacheConfig,
    pub batch: BatchConfig,
    /// Deadline applied to every single-item translation.
    pub call_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            cache: CacheConfig::default(),
            batch: BatchConfig::default(),
            call_timeout: Duration::from_secs(60),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, TranslateError> {
        let settings = Self {
            client: ClientConfig::from_env(),
            cache: CacheConfig::from_env(),
            batch: BatchConfig::from_env(),
            call_timeout: Duration::from_secs(60),
        };
        settings.batch.validate()?;
        Ok(settings)
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    let raw = non_empty_var(name)?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(var = name, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}
