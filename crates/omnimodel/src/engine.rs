//! Orchestrating façade.
//!
//! One entry point over the whole runtime: resolve → select adapter →
//! load → track → dispatch. Modality calls pick the first loaded model
//! of the requested type (positional, not scored), run the operation,
//! and fold wall-clock latency into that model's performance record.
//! Cache mutations are serialized here, which is the single-logical-
//! caller assumption the cache documents.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::adapter::{
    ChatRequest, Classification, Detection, GenerateOutput, GenerateRequest, LoadOptions,
    LoadedModel, MediaInput, ModelAdapter, ModelInfo, ModelType, Operation, Segmentation,
    SynthesizeRequest, SynthesizedAudio, TokenStream, TranscribeRequest, Transcription,
};
use crate::cache::{CacheStats, LruModelCache};
use crate::config::{Config, LogLevel};
use crate::error::{Result, RuntimeError};
use crate::hardware::hardware_info;
use crate::manager::{DownloadOptions, ModelManager};
use crate::metrics::{MetricsStore, MetricsUpdate, PerformanceMetrics};
use crate::registry::ModelRegistry;
use crate::retry::retry_with_backoff;
use crate::streaming::{
    stream_with_timeout, BackpressureHandler, BackpressurePermit, StreamCancellation, TokenBuffer,
};

pub struct OmniEngine {
    config: Config,
    registry: ModelRegistry,
    cache: Mutex<LruModelCache>,
    manager: ModelManager,
    metrics: Arc<MetricsStore>,
    backpressure: Arc<BackpressureHandler>,
}

impl OmniEngine {
    pub fn new(config: Config) -> Self {
        let cache = Mutex::new(LruModelCache::new(config.cache_capacity_bytes));
        let manager = ModelManager::from_config(&config);
        let backpressure = BackpressureHandler::new(config.max_concurrent_streams);
        Self {
            config,
            registry: ModelRegistry::new(),
            cache,
            manager,
            metrics: Arc::new(MetricsStore::new()),
            backpressure,
        }
    }

    pub fn register_adapter(&self, adapter: Arc<dyn ModelAdapter>) {
        self.registry.register_adapter(adapter);
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn manager(&self) -> &ModelManager {
        &self.manager
    }

    fn gate(&self, level: LogLevel) -> bool {
        self.config.log_level.allows(level)
    }

    fn log_failure(&self, operation: &str, subject: &str, err: &RuntimeError) {
        if self.gate(LogLevel::Error) {
            error!("{} failed for {}: [{}] {}", operation, subject, err.kind(), err);
        }
    }

    /// Resolve, select, load and track a local model. The canonical path
    /// string becomes the cache key.
    pub async fn load_model(&self, path: &Path, options: LoadOptions) -> Result<Arc<LoadedModel>> {
        let cache_key = path.display().to_string();
        if let Some(model) = self.cache.lock().await.get(&cache_key) {
            if self.gate(LogLevel::Debug) {
                debug!("Model for {} already resident", cache_key);
            }
            return Ok(model);
        }

        let info = self.manager.model_info(path).await?;
        let hardware = hardware_info();
        let adapter = self
            .registry
            .select_best_adapter(path, info.as_ref(), Some(&hardware))
            .ok_or_else(|| RuntimeError::Unsupported {
                subject: cache_key.clone(),
                operation: "load".to_string(),
            })?;

        let started = Instant::now();
        let model = match adapter.clone().load_model(path, options).await {
            Ok(model) => Arc::new(model),
            Err(e) => {
                self.log_failure("load", &cache_key, &e);
                return Err(e);
            }
        };
        let load_ms = started.elapsed().as_secs_f64() * 1000.0;

        self.registry.register_loaded_model(model.clone());
        if let Err(e) = self.cache.lock().await.insert(&cache_key, model.clone()).await {
            // The model cannot be resident-bounded; roll the load back
            // rather than leaving an unbounded native instance behind.
            self.log_failure("cache", &model.id, &e);
            if let Err(unload_err) = self.registry.unload_model(&model.id).await {
                self.log_failure("rollback unload", &model.id, &unload_err);
            }
            return Err(e);
        }

        self.metrics.record(
            &model.id,
            MetricsUpdate {
                load_time_ms: Some(load_ms),
                memory_usage_bytes: Some(model.info.size),
                ..Default::default()
            },
        );
        if self.gate(LogLevel::Info) {
            info!(
                "Loaded {} as {} ({} bytes) in {:.0}ms",
                cache_key, model.id, model.info.size, load_ms
            );
        }
        Ok(model)
    }

    /// Download a remote model into the cache directory, then load it.
    pub async fn load_model_from_url(
        &self,
        url: &str,
        info: &ModelInfo,
        download: DownloadOptions,
        options: LoadOptions,
    ) -> Result<Arc<LoadedModel>> {
        let local = self.manager.download_model(url, info, download).await?;
        self.load_model(&local, options).await
    }

    /// Load with retry for the recoverable failure kinds.
    pub async fn load_model_with_retry(
        &self,
        path: &Path,
        options: LoadOptions,
        max_retries: u32,
    ) -> Result<Arc<LoadedModel>> {
        let base_delay = Duration::from_millis(self.config.download_base_delay_ms);
        retry_with_backoff(
            |_attempt| self.load_model(path, options.clone()),
            max_retries,
            base_delay,
        )
        .await
    }

    /// Unload a model everywhere: cache entry (which releases the native
    /// instance) and registry tracking. No-op for unknown ids.
    pub async fn unload_model(&self, model_id: &str) -> Result<()> {
        let mut cache = self.cache.lock().await;
        if let Some(key) = cache.key_for_model(model_id) {
            cache.remove(&key).await?;
        }
        drop(cache);
        // Safe even after the cache released it: adapter unload is
        // idempotent on unknown ids.
        self.registry.unload_model(model_id).await?;
        self.metrics.remove(model_id);
        Ok(())
    }

    pub async fn cached_model(&self, key: &str) -> Option<Arc<LoadedModel>> {
        self.cache.lock().await.get(key)
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.lock().await.stats()
    }

    pub async fn prune_cache(&self, max_age: Duration) -> Result<usize> {
        self.cache.lock().await.prune(max_age).await
    }

    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear().await;
    }

    pub fn loaded_models(&self) -> Vec<Arc<LoadedModel>> {
        self.registry.all_loaded_models()
    }

    pub fn memory_usage(&self) -> u64 {
        self.registry.memory_usage()
    }

    pub fn model_metrics(&self, model_id: &str) -> Option<PerformanceMetrics> {
        self.metrics.get(model_id)
    }

    /// First loaded model of the requested modality, in load order.
    fn first_model_for(&self, modality: ModelType) -> Result<Arc<LoadedModel>> {
        self.registry
            .all_loaded_models()
            .into_iter()
            .find(|m| m.model_type() == modality)
            .ok_or_else(|| RuntimeError::NotFound {
                what: format!("no {} models loaded", modality.name()),
            })
    }

    fn record_latency(&self, model_id: &str, elapsed: Duration, tokens: Option<u32>) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        let tokens_per_second = tokens.and_then(|t| {
            let secs = elapsed.as_secs_f64();
            (secs > 0.0).then(|| t as f64 / secs)
        });
        self.metrics.record(
            model_id,
            MetricsUpdate {
                inference_time_ms: Some(ms),
                tokens_per_second,
                ..Default::default()
            },
        );
    }

    pub async fn generate(&self, req: GenerateRequest) -> Result<GenerateOutput> {
        let model = self.first_model_for(ModelType::Llm)?;
        let started = Instant::now();
        match model.generate(req).await {
            Ok(out) => {
                self.record_latency(&model.id, started.elapsed(), Some(out.tokens_generated));
                Ok(out)
            }
            Err(e) => {
                self.log_failure("generate", &model.id, &e);
                Err(e)
            }
        }
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<GenerateOutput> {
        let model = self.first_model_for(ModelType::Llm)?;
        let started = Instant::now();
        match model.chat(req).await {
            Ok(out) => {
                self.record_latency(&model.id, started.elapsed(), Some(out.tokens_generated));
                Ok(out)
            }
            Err(e) => {
                self.log_failure("chat", &model.id, &e);
                Err(e)
            }
        }
    }

    /// Streamed generation under backpressure. The stream holds one of
    /// the bounded concurrency permits until it is fully consumed or
    /// dropped; each token must arrive within the configured stall
    /// budget. Token throughput is recorded when the stream ends.
    pub async fn generate_stream(&self, req: GenerateRequest) -> Result<TokenStream> {
        self.generate_stream_inner(req, None).await
    }

    /// Streamed generation that additionally observes a cancellation
    /// token between items.
    pub async fn generate_stream_cancellable(
        &self,
        req: GenerateRequest,
        cancel: StreamCancellation,
    ) -> Result<TokenStream> {
        self.generate_stream_inner(req, Some(cancel)).await
    }

    async fn generate_stream_inner(
        &self,
        req: GenerateRequest,
        cancel: Option<StreamCancellation>,
    ) -> Result<TokenStream> {
        let model = self.first_model_for(ModelType::Llm)?;
        let permit = BackpressurePermit::acquire(self.backpressure.clone()).await;

        let inner = match model.generate_stream(req).await {
            Ok(stream) => stream,
            Err(e) => {
                self.log_failure("generate_stream", &model.id, &e);
                return Err(e);
            }
        };
        let inner: TokenStream = match self.config.token_timeout_ms {
            Some(ms) => Box::pin(stream_with_timeout(inner, Duration::from_millis(ms))),
            None => inner,
        };

        let metrics = MetricsHandle { store: self.metrics.clone(), model_id: model.id.clone() };
        let buffer_capacity = self.config.token_buffer_capacity;
        let stream = async_stream::stream! {
            // Moved in so their lifetime is the stream's lifetime.
            let _permit = permit;
            let mut inner = inner;
            let mut tail = TokenBuffer::new(buffer_capacity);
            let mut produced: u32 = 0;
            let started = Instant::now();
            use futures_util::StreamExt;
            loop {
                if let Some(cancel) = &cancel {
                    if let Err(e) = cancel.throw_if_cancelled() {
                        yield Err(e);
                        break;
                    }
                }
                match inner.next().await {
                    Some(Ok(token)) => {
                        produced += 1;
                        tail.add(token.clone());
                        yield Ok(token);
                    }
                    Some(Err(e)) => {
                        yield Err(e);
                        break;
                    }
                    None => break,
                }
            }
            metrics.finish(started.elapsed(), produced, tail.last_n(8));
        };
        Ok(Box::pin(stream))
    }

    pub async fn classify(&self, input: MediaInput) -> Result<Vec<Classification>> {
        let model = self.first_model_for(ModelType::Vision)?;
        let started = Instant::now();
        match model.classify(input).await {
            Ok(out) => {
                self.record_latency(&model.id, started.elapsed(), None);
                Ok(out)
            }
            Err(e) => {
                self.log_failure("classify", &model.id, &e);
                Err(e)
            }
        }
    }

    pub async fn detect(&self, input: MediaInput) -> Result<Vec<Detection>> {
        let model = self.first_model_for(ModelType::Vision)?;
        let started = Instant::now();
        match model.detect(input).await {
            Ok(out) => {
                self.record_latency(&model.id, started.elapsed(), None);
                Ok(out)
            }
            Err(e) => {
                self.log_failure("detect", &model.id, &e);
                Err(e)
            }
        }
    }

    pub async fn segment(&self, input: MediaInput) -> Result<Segmentation> {
        let model = self.first_model_for(ModelType::Vision)?;
        let started = Instant::now();
        match model.segment(input).await {
            Ok(out) => {
                self.record_latency(&model.id, started.elapsed(), None);
                Ok(out)
            }
            Err(e) => {
                self.log_failure("segment", &model.id, &e);
                Err(e)
            }
        }
    }

    pub async fn transcribe(&self, req: TranscribeRequest) -> Result<Transcription> {
        let model = self.first_model_for(ModelType::Audio)?;
        let started = Instant::now();
        match model.transcribe(req).await {
            Ok(out) => {
                self.record_latency(&model.id, started.elapsed(), None);
                Ok(out)
            }
            Err(e) => {
                self.log_failure("transcribe", &model.id, &e);
                Err(e)
            }
        }
    }

    pub async fn synthesize(&self, req: SynthesizeRequest) -> Result<SynthesizedAudio> {
        let model = self.first_model_for(ModelType::Audio)?;
        let started = Instant::now();
        match model.synthesize(req).await {
            Ok(out) => {
                self.record_latency(&model.id, started.elapsed(), None);
                Ok(out)
            }
            Err(e) => {
                self.log_failure("synthesize", &model.id, &e);
                Err(e)
            }
        }
    }

    pub async fn embed(&self, inputs: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let model = self.first_model_for(ModelType::Embedding)?;
        let started = Instant::now();
        match model.embed(inputs).await {
            Ok(out) => {
                self.record_latency(&model.id, started.elapsed(), None);
                Ok(out)
            }
            Err(e) => {
                self.log_failure("embed", &model.id, &e);
                Err(e)
            }
        }
    }

    /// Raw pass-through. Picks the first loaded model of any modality
    /// that exposes the run tag.
    pub async fn run(&self, input: serde_json::Value) -> Result<serde_json::Value> {
        let model = self
            .registry
            .all_loaded_models()
            .into_iter()
            .find(|m| m.supports(Operation::Run))
            .ok_or_else(|| RuntimeError::NotFound {
                what: "no models loaded that support run".to_string(),
            })?;
        let started = Instant::now();
        match model.run(input).await {
            Ok(out) => {
                self.record_latency(&model.id, started.elapsed(), None);
                Ok(out)
            }
            Err(e) => {
                self.log_failure("run", &model.id, &e);
                Err(e)
            }
        }
    }
}

/// Owned metrics handle moved into token streams.
struct MetricsHandle {
    store: Arc<MetricsStore>,
    model_id: String,
}

impl MetricsHandle {
    fn finish(&self, elapsed: Duration, tokens: u32, tail: Vec<String>) {
        let secs = elapsed.as_secs_f64();
        let tokens_per_second = (secs > 0.0 && tokens > 0).then(|| tokens as f64 / secs);
        self.store.record(
            &self.model_id,
            MetricsUpdate {
                inference_time_ms: Some(secs * 1000.0),
                tokens_per_second,
                ..Default::default()
            },
        );
        debug!(
            "Stream for {} produced {} tokens, tail {:?}",
            self.model_id, tokens, tail
        );
    }
}
