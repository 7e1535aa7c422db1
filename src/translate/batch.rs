//! Batch translation fan-out.
//! Input is split into fixed-size chunks processed strictly in sequence. Inside
//! a chunk every item runs as its own task; remote calls are bounded by a
//! shared semaphore, cache hits never take a permit. After a chunk drains, any
//! reported failure aborts the whole batch and no partial results escape.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{validate, validate_languages, TranslateError, TranslationService};
use crate::cancellation::CallContext;
use crate::config::BatchConfig;
use crate::metrics::{metric_names, new_trace_id, MetricsRegistry};
use crate::state_machine::{ItemLifecycle, ItemState};

/// A failed item, as reported on the batch error channel.
#[derive(Debug)]
struct ItemFailure {
    index: usize,
    error: TranslateError,
}

pub struct BatchTranslator {
    service: Arc<TranslationService>,
    config: BatchConfig,
    /// Shared by every batch run through this translator.
    slots: Arc<Semaphore>,
}

impl BatchTranslator {
    pub fn new(service: Arc<TranslationService>, config: BatchConfig) -> Result<Self, TranslateError> {
        config.validate()?;
        let slots = Arc::new(Semaphore::new(config.max_concurrency));
        Ok(Self {
            service,
            config,
            slots,
        })
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn service(&self) -> &Arc<TranslationService> {
        &self.service
    }

    /// Permits currently free.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Translate `texts` from `src_lang` to `tgt_lang`. Output index `i`
    /// corresponds to input index `i`. Any failure returns `Err` and discards
    /// everything translated so far. Dropping the returned future aborts every
    /// item task still running.
    pub async fn translate_batch<S: AsRef<str>>(
        &self,
        ctx: &CallContext,
        texts: &[S],
        src_lang: &str,
        tgt_lang: &str,
    ) -> Result<Vec<String>, TranslateError> {
        if texts.is_empty() {
            return Err(TranslateError::EmptyBatch);
        }
        validate_languages(src_lang, tgt_lang)?;

        let batch_id = new_trace_id();
        let total = texts.len();
        let chunk_size = self.config.chunk_size;
        let chunk_count = total.div_ceil(chunk_size);
        let metrics = Arc::clone(self.service.metrics());
        let batch_span = metrics.span(metric_names::BATCH_DONE);
        info!(%batch_id, total, chunk_size, chunk_count, src_lang, tgt_lang, "batch started");

        let src: Arc<str> = Arc::from(src_lang);
        let tgt: Arc<str> = Arc::from(tgt_lang);
        let mut results: Vec<Option<String>> = vec![None; total];
        // Sized to the whole input so reporting never blocks.
        let (err_tx, mut err_rx) = mpsc::channel::<ItemFailure>(total);

        for (chunk_idx, chunk) in texts.chunks(chunk_size).enumerate() {
            let base = chunk_idx * chunk_size;
            let chunk_span = metrics.span(metric_names::BATCH_CHUNK);
            debug!(%batch_id, chunk = chunk_idx, items = chunk.len(), "chunk dispatched");

            // Owned by this future: dropping it aborts the chunk's tasks, which
            // releases their permits and stops their remote calls.
            let mut tasks: JoinSet<(usize, Option<String>)> = JoinSet::new();
            for (offset, text) in chunk.iter().enumerate() {
                let index = base + offset;
                let worker = Worker {
                    index,
                    text: text.as_ref().to_string(),
                    src: Arc::clone(&src),
                    tgt: Arc::clone(&tgt),
                    service: Arc::clone(&self.service),
                    metrics: Arc::clone(&metrics),
                    slots: Arc::clone(&self.slots),
                    ctx: ctx.child(),
                    item_timeout: self.config.item_timeout,
                    item_delay: self.config.item_delay,
                    err_tx: err_tx.clone(),
                };
                tasks.spawn(async move { (index, worker.run().await) });
            }

            // Wait for the whole chunk before looking at errors.
            let mut unfinished: Vec<usize> = (base..base + chunk.len()).collect();
            let mut panicked = false;
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((index, value)) => {
                        unfinished.retain(|&i| i != index);
                        results[index] = value;
                    }
                    Err(e) => {
                        error!(%batch_id, chunk = chunk_idx, error = %e, "batch worker panicked");
                        panicked = true;
                    }
                }
            }
            if panicked {
                // A panicked task never hands back its index.
                if let Some(&index) = unfinished.first() {
                    let _ = err_tx.try_send(ItemFailure {
                        index,
                        error: TranslateError::Api("worker panicked".into()),
                    });
                }
            }
            chunk_span.finish();

            if let Ok(failure) = err_rx.try_recv() {
                metrics.increment(metric_names::BATCH_ABORTED);
                warn!(
                    %batch_id,
                    chunk = chunk_idx,
                    index = failure.index,
                    error = %failure.error,
                    "batch aborted"
                );
                return Err(TranslateError::Batch {
                    chunk: chunk_idx,
                    index: failure.index,
                    source: Box::new(failure.error),
                });
            }

            let end = base + chunk.len();
            info!(%batch_id, chunk = chunk_idx, done = end, total, "chunk complete");
            if end < total {
                ctx.sleep(self.config.chunk_delay).await?;
            }
        }

        batch_span.finish();
        let translated: Option<Vec<String>> = results.into_iter().collect();
        translated.ok_or_else(|| TranslateError::Api("batch finished with unfilled result slots".into()))
    }
}

/// One unit of work: owns everything it needs so it can run as a task.
struct Worker {
    index: usize,
    text: String,
    src: Arc<str>,
    tgt: Arc<str>,
    service: Arc<TranslationService>,
    metrics: Arc<MetricsRegistry>,
    slots: Arc<Semaphore>,
    ctx: CallContext,
    item_timeout: Duration,
    item_delay: Duration,
    err_tx: mpsc::Sender<ItemFailure>,
}

impl Worker {
    /// Returns the translation, or `None` after reporting a failure.
    async fn run(self) -> Option<String> {
        let mut lifecycle = ItemLifecycle::new(self.index);
        if let Err(e) = validate(&self.text, &self.src, &self.tgt) {
            lifecycle.advance(ItemState::Aborted);
            self.report(e);
            return None;
        }
        lifecycle.advance(ItemState::CacheCheck);

        if let Some(hit) = self.service.cache().get(&self.text, &self.src, &self.tgt) {
            self.metrics.increment(metric_names::CACHE_HIT);
            lifecycle.advance(ItemState::CacheHit);
            lifecycle.advance(ItemState::Done);
            return Some(hit);
        }
        lifecycle.advance(ItemState::CacheMiss);
        lifecycle.advance(ItemState::AwaitSlot);

        let wait_start = Instant::now();
        let acquired = tokio::select! {
            biased;
            err = self.ctx.done() => Err(err),
            permit = Arc::clone(&self.slots).acquire_owned() => {
                permit.map_err(|_| TranslateError::Cancelled)
            }
        };
        let _permit = match acquired {
            Ok(permit) => permit,
            Err(e) => {
                lifecycle.advance(ItemState::Aborted);
                self.report(e);
                return None;
            }
        };
        self.metrics.record(
            metric_names::SLOT_WAIT,
            wait_start.elapsed().as_micros() as f64,
        );

        lifecycle.advance(ItemState::InFlight);
        let item_ctx = self.ctx.with_timeout(self.item_timeout);
        let outcome = self
            .service
            .translate(&item_ctx, &self.text, &self.src, &self.tgt)
            .await;

        match outcome {
            Ok(result) => {
                lifecycle.advance(ItemState::Success);
                if !result.cached {
                    lifecycle.advance(ItemState::Delay);
                    // The value is already in hand; an interrupted pause does not undo it.
                    if let Err(e) = self.ctx.sleep(self.item_delay).await {
                        debug!(index = self.index, error = %e, "post-call delay interrupted");
                    }
                }
                lifecycle.advance(ItemState::Done);
                Some(result.translated_text)
            }
            Err(e) => {
                lifecycle.advance(ItemState::Failure);
                lifecycle.advance(ItemState::ReportError);
                self.report(e);
                lifecycle.advance(ItemState::Done);
                None
            }
        }
    }

    fn report(&self, error: TranslateError) {
        if let Err(e) = self.err_tx.try_send(ItemFailure {
            index: self.index,
            error,
        }) {
            error!(index = self.index, error = %e, "batch error channel rejected report");
        }
    }
}
