//! llm-translate: cached, rate-limited batch translation over an
//! OpenAI-compatible chat-completion API.
//! Main library: context wiring, demo entry point.

pub mod cancellation;
pub mod config;
pub mod metrics;
pub mod state_machine;
pub mod tools;
pub mod translate;

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cancellation::CallContext;
use config::Settings;
use metrics::MetricsRegistry;
use tools::{Tool, Toolbox, TranslatorTool};
use translate::cache::ResultCache;
use translate::client::{ChatClient, ChatModel};
use translate::{BatchTranslator, TranslateError, TranslationService};

/// Command-line arguments for the demo binary.
#[derive(Debug, Parser)]
#[command(name = "llm-translate", version, about = "Translate text through a hosted chat model")]
pub struct Cli {
    /// Source language.
    #[arg(long, default_value = tools::DEFAULT_SOURCE_LANGUAGE)]
    pub source: String,

    /// Target language.
    #[arg(long, default_value = tools::DEFAULT_TARGET_LANGUAGE)]
    pub target: String,

    /// Use the offline mock tools even when an API key is configured.
    #[arg(long)]
    pub mock: bool,

    /// Texts to translate.
    #[arg(default_value = "Hello world")]
    pub texts: Vec<String>,
}

/// Shared objects, constructed once and passed by handle.
pub struct AppContext {
    pub settings: Settings,
    pub cache: Arc<ResultCache>,
    pub metrics: Arc<MetricsRegistry>,
    pub service: Arc<TranslationService>,
    pub batch: BatchTranslator,
    pub toolbox: Toolbox,
    pub shutdown: CancellationToken,
}

impl AppContext {
    /// Wire the cache, service, batcher and tools around `model`. Starts the
    /// cache sweep when configured; it stops when `shutdown` is cancelled.
    pub fn build(settings: Settings, model: Arc<dyn ChatModel>) -> Result<Self, TranslateError> {
        let cache = Arc::new(ResultCache::from_config(&settings.cache));
        let metrics = Arc::new(MetricsRegistry::new());
        let shutdown = CancellationToken::new();

        if let Some(interval) = settings.cache.sweep_interval {
            ResultCache::start_sweep_loop(Arc::clone(&cache), interval, shutdown.child_token());
            info!(interval_secs = interval.as_secs(), "cache sweep enabled");
        }

        let service = Arc::new(TranslationService::new(
            model,
            Arc::clone(&cache),
            Arc::clone(&metrics),
            settings.call_timeout,
        ));
        let batch = BatchTranslator::new(Arc::clone(&service), settings.batch.clone())?;

        let mut toolbox = Toolbox::with_mocks();
        toolbox.register(Arc::new(TranslatorTool::new(Arc::clone(&service))));

        Ok(Self {
            settings,
            cache,
            metrics,
            service,
            batch,
            toolbox,
            shutdown,
        })
    }

    pub fn root_context(&self) -> CallContext {
        CallContext::with_token(self.shutdown.child_token())
    }
}

impl Drop for AppContext {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Install the global tracing subscriber (`RUST_LOG` overrides the default filter).
/// `LOG_FORMAT=json` switches to one JSON object per line.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("llm_translate=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

/// Demo entry point.
pub async fn run(cli: Cli) -> Result<(), TranslateError> {
    let settings = Settings::from_env()?;
    info!(model = %settings.client.model, base_url = %settings.client.base_url, "llm-translate starting");

    if cli.mock || !settings.client.has_api_key() {
        if !cli.mock {
            warn!("SILICONFLOW_API_KEY not set, using mock tools");
        }
        return run_mock_demo(&cli).await;
    }

    let client = ChatClient::new(&settings.client)?;
    let ctx = AppContext::build(settings, Arc::new(client))?;
    let root = ctx.root_context();

    let translated = ctx
        .batch
        .translate_batch(&root, cli.texts.as_slice(), &cli.source, &cli.target)
        .await?;
    for (original, result) in cli.texts.iter().zip(&translated) {
        println!("{original} => {result}");
    }

    // Same request through the tool surface; served from the cache.
    if let Some(first) = cli.texts.first() {
        let request = serde_json::json!({
            "text": first,
            "source_language": cli.source,
            "target_language": cli.target,
        });
        let via_tool = ctx
            .toolbox
            .call("translate_text", &root, &request.to_string())
            .await?;
        println!("translate_text({first}) => {via_tool}");
    }

    for (name, summary) in ctx.metrics.summary() {
        info!(metric = %name, p50_us = summary.p50_us, p95_us = summary.p95_us, count = summary.count, "metric summary");
    }
    for (name, value) in ctx.metrics.counters() {
        info!(metric = %name, value, "counter");
    }
    Ok(())
}

async fn run_mock_demo(cli: &Cli) -> Result<(), TranslateError> {
    let toolbox = Toolbox::with_mocks();
    let ctx = CallContext::new();

    for tool in toolbox.iter() {
        println!("Tool: {}", tool.name());
        println!("Description: {}", tool.description());
    }

    for text in &cli.texts {
        let result = toolbox.call("mock_translator", &ctx, text).await?;
        println!("{text} => {result}");
    }
    let sum = toolbox.call("mock_calculator", &ctx, "2 + 3").await?;
    println!("2 + 3 => {sum}");
    Ok(())
}
