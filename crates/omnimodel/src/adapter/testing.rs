//! Test adapter shared across the core's test modules.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::adapter::contract::{
    extension_can_handle, AdapterCapabilities, LoadOptions, ModelAdapter, ModelFormat, ModelInfo,
    ModelType,
};
use crate::adapter::model::{
    generate_model_id, Classification, GenerateOutput, LoadedModel, ModelOps, Transcription,
};
use crate::error::{Result, RuntimeError};

/// Configurable in-memory adapter. Loads never touch the filesystem; the
/// "native resource" is a live flag the unload path revokes.
pub struct MockAdapter {
    format: ModelFormat,
    types: Vec<ModelType>,
    supports_gpu: bool,
    supports_streaming: bool,
    quantization_levels: Vec<String>,
    model_size: u64,
    accept_all: bool,
    fail_loads: AtomicBool,
    fail_unloads: AtomicBool,
    unload_counts: Mutex<HashMap<String, usize>>,
    live_flags: Mutex<HashMap<String, Arc<AtomicBool>>>,
    loads: AtomicUsize,
}

impl MockAdapter {
    pub fn new(format: ModelFormat, types: Vec<ModelType>) -> Arc<Self> {
        Arc::new(Self {
            format,
            types,
            supports_gpu: false,
            supports_streaming: false,
            quantization_levels: Vec::new(),
            model_size: 1024,
            accept_all: false,
            fail_loads: AtomicBool::new(false),
            fail_unloads: AtomicBool::new(false),
            unload_counts: Mutex::new(HashMap::new()),
            live_flags: Mutex::new(HashMap::new()),
            loads: AtomicUsize::new(0),
        })
    }

    pub fn builder(format: ModelFormat, types: Vec<ModelType>) -> MockAdapterBuilder {
        MockAdapterBuilder {
            format,
            types,
            supports_gpu: false,
            supports_streaming: false,
            quantization_levels: Vec::new(),
            model_size: 1024,
            accept_all: false,
        }
    }

    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_unloads(&self, fail: bool) {
        self.fail_unloads.store(fail, Ordering::SeqCst);
    }

    pub fn unload_count(&self, model_id: &str) -> usize {
        self.unload_counts.lock().unwrap().get(model_id).copied().unwrap_or(0)
    }

    pub fn total_unloads(&self) -> usize {
        self.unload_counts.lock().unwrap().values().sum()
    }

    pub fn total_loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

pub struct MockAdapterBuilder {
    format: ModelFormat,
    types: Vec<ModelType>,
    supports_gpu: bool,
    supports_streaming: bool,
    quantization_levels: Vec<String>,
    model_size: u64,
    accept_all: bool,
}

impl MockAdapterBuilder {
    pub fn gpu(mut self, yes: bool) -> Self {
        self.supports_gpu = yes;
        self
    }

    pub fn streaming(mut self, yes: bool) -> Self {
        self.supports_streaming = yes;
        self
    }

    pub fn quantization(mut self, levels: &[&str]) -> Self {
        self.quantization_levels = levels.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn model_size(mut self, size: u64) -> Self {
        self.model_size = size;
        self
    }

    /// Handle any path regardless of extension. Used to exercise
    /// tie-breaking among equally scored candidates.
    pub fn accept_all(mut self) -> Self {
        self.accept_all = true;
        self
    }

    pub fn build(self) -> Arc<MockAdapter> {
        Arc::new(MockAdapter {
            format: self.format,
            types: self.types,
            supports_gpu: self.supports_gpu,
            supports_streaming: self.supports_streaming,
            quantization_levels: self.quantization_levels,
            model_size: self.model_size,
            accept_all: self.accept_all,
            fail_loads: AtomicBool::new(false),
            fail_unloads: AtomicBool::new(false),
            unload_counts: Mutex::new(HashMap::new()),
            live_flags: Mutex::new(HashMap::new()),
            loads: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ModelAdapter for MockAdapter {
    fn format(&self) -> ModelFormat {
        self.format
    }

    fn supported_types(&self) -> &[ModelType] {
        &self.types
    }

    fn can_handle(&self, path: &Path, info: Option<&ModelInfo>) -> bool {
        self.accept_all || extension_can_handle(self.format, path, info)
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            supports_streaming: self.supports_streaming,
            supports_gpu: self.supports_gpu,
            quantization_levels: self.quantization_levels.clone(),
            max_context_length: Some(4096),
            file_extensions: self.format.extensions().iter().map(|e| e.to_string()).collect(),
        }
    }

    async fn load_model(
        self: Arc<Self>,
        path: &Path,
        _options: LoadOptions,
    ) -> Result<LoadedModel> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(RuntimeError::LoadFailure {
                path: path.to_path_buf(),
                reason: "mock load failure".into(),
            });
        }
        self.loads.fetch_add(1, Ordering::SeqCst);

        let id = generate_model_id(self.format);
        let live = Arc::new(AtomicBool::new(true));
        self.live_flags.lock().unwrap().insert(id.clone(), live.clone());

        let info = ModelInfo {
            name: path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("mock")
                .to_string(),
            format: self.format,
            model_type: self.types.first().copied().unwrap_or(ModelType::Llm),
            size: self.model_size,
            version: "0.0-test".into(),
            checksum: None,
            metadata: HashMap::new(),
        };

        let mut ops = ModelOps::default();
        if self.types.contains(&ModelType::Llm) {
            let gen_id = id.clone();
            ops.generate = Some(Arc::new(move |req| {
                let gen_id = gen_id.clone();
                Box::pin(async move {
                    Ok(GenerateOutput {
                        text: format!("[{gen_id}] {}", req.prompt),
                        tokens_generated: req.prompt.split_whitespace().count() as u32,
                        finish_reason: Some("stop".into()),
                    })
                })
            }));
            ops.chat = Some(Arc::new(move |req| {
                Box::pin(async move {
                    let last = req.messages.last().map(|m| m.content.clone()).unwrap_or_default();
                    Ok(GenerateOutput {
                        text: format!("echo: {last}"),
                        tokens_generated: 2,
                        finish_reason: Some("stop".into()),
                    })
                })
            }));
            ops.generate_stream = Some(Arc::new(move |req| {
                Box::pin(async move {
                    let tokens: Vec<String> =
                        req.prompt.split_whitespace().map(|t| format!("{t} ")).collect();
                    let stream = async_stream::stream! {
                        for token in tokens {
                            yield Ok(token);
                        }
                    };
                    Ok(Box::pin(stream) as crate::adapter::model::TokenStream)
                })
            }));
            ops.embed = Some(Arc::new(move |inputs| {
                Box::pin(async move {
                    Ok(inputs.iter().map(|s| vec![s.len() as f32, 1.0]).collect())
                })
            }));
        }
        if self.types.contains(&ModelType::Embedding) {
            ops.embed = Some(Arc::new(move |inputs| {
                Box::pin(async move {
                    Ok(inputs.iter().map(|s| vec![s.len() as f32, 2.0]).collect())
                })
            }));
        }
        if self.types.contains(&ModelType::Vision) {
            ops.classify = Some(Arc::new(move |_input| {
                Box::pin(async move {
                    Ok(vec![Classification { label: "cat".into(), confidence: 0.9 }])
                })
            }));
        }
        if self.types.contains(&ModelType::Audio) {
            ops.transcribe = Some(Arc::new(move |_req| {
                Box::pin(async move {
                    Ok(Transcription {
                        text: "hello world".into(),
                        language: Some("en".into()),
                        segments: Vec::new(),
                    })
                })
            }));
        }

        let adapter: Arc<dyn ModelAdapter> = self.clone();
        Ok(LoadedModel::new(id, info, adapter, ops, live))
    }

    async fn unload_model(&self, model_id: &str) -> Result<()> {
        let live = self.live_flags.lock().unwrap().get(model_id).cloned();
        match live {
            Some(flag) => {
                *self.unload_counts.lock().unwrap().entry(model_id.to_string()).or_insert(0) += 1;
                if self.fail_unloads.load(Ordering::SeqCst) {
                    return Err(RuntimeError::InferenceFailure {
                        model_id: model_id.to_string(),
                        reason: "mock unload failure".into(),
                    });
                }
                flag.store(false, Ordering::Release);
                self.live_flags.lock().unwrap().remove(model_id);
                Ok(())
            }
            // Unknown id: idempotent no-op per the contract.
            None => Ok(()),
        }
    }
}
