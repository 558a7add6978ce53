//! Adapter capability contract.
//!
//! Each model-file format is driven by one adapter that translates the
//! unified contract into calls against an externally supplied native
//! inference runtime. The core consumes this trait polymorphically and
//! never implements it itself.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::adapter::model::LoadedModel;
use crate::error::Result;

/// Closed set of supported model-file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelFormat {
    Gguf,
    Onnx,
    TfLite,
    CoreMl,
}

impl ModelFormat {
    /// File extensions recognized for this format.
    pub fn extensions(&self) -> &[&str] {
        match self {
            ModelFormat::Gguf => &["gguf"],
            ModelFormat::Onnx => &["onnx", "ort"],
            ModelFormat::TfLite => &["tflite", "lite"],
            ModelFormat::CoreMl => &["mlmodel", "mlpackage"],
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ModelFormat::Gguf => "GGUF (llama.cpp)",
            ModelFormat::Onnx => "ONNX Runtime",
            ModelFormat::TfLite => "TensorFlow Lite",
            ModelFormat::CoreMl => "CoreML",
        }
    }

    /// Short lowercase tag used in model ids and log fields.
    pub fn tag(&self) -> &str {
        match self {
            ModelFormat::Gguf => "gguf",
            ModelFormat::Onnx => "onnx",
            ModelFormat::TfLite => "tflite",
            ModelFormat::CoreMl => "coreml",
        }
    }

    pub fn all() -> &'static [ModelFormat] {
        &[ModelFormat::Gguf, ModelFormat::Onnx, ModelFormat::TfLite, ModelFormat::CoreMl]
    }
}

/// Closed set of task modalities a model can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelType {
    Llm,
    Vision,
    Audio,
    Embedding,
}

impl ModelType {
    pub fn name(&self) -> &str {
        match self {
            ModelType::Llm => "llm",
            ModelType::Vision => "vision",
            ModelType::Audio => "audio",
            ModelType::Embedding => "embedding",
        }
    }
}

/// Immutable descriptor of an on-disk model. Produced by resolution,
/// never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub format: ModelFormat,
    pub model_type: ModelType,
    /// Reported byte size of the weight file; feeds cache accounting.
    pub size: u64,
    pub version: String,
    /// Blake3 content hash, hex-encoded. None when hashing was skipped
    /// (file above the configured threshold).
    pub checksum: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Static adapter-scoped descriptor consumed only by selection scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterCapabilities {
    pub supports_streaming: bool,
    pub supports_gpu: bool,
    pub quantization_levels: Vec<String>,
    pub max_context_length: Option<u32>,
    pub file_extensions: Vec<String>,
}

/// Per-load tuning knobs passed through to the native runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadOptions {
    pub context_size: Option<u32>,
    pub batch_size: Option<u32>,
    pub threads: Option<u32>,
    pub gpu_layers: Option<u32>,
    pub extra: serde_json::Value,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            context_size: None,
            batch_size: None,
            threads: None,
            gpu_layers: None,
            extra: serde_json::json!({}),
        }
    }
}

/// Format driver contract.
///
/// `can_handle` must be a pure predicate: it is called speculatively
/// across the whole adapter set on every selection. `unload_model` must
/// be safe to call with an unknown id and must release every native
/// resource before returning; cache and registry rely on that to bound
/// memory.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    fn format(&self) -> ModelFormat;

    fn supported_types(&self) -> &[ModelType];

    fn can_handle(&self, path: &Path, info: Option<&ModelInfo>) -> bool;

    fn capabilities(&self) -> AdapterCapabilities;

    /// Construct a model instance. The returned model's id is unique for
    /// the process lifetime and the model holds this adapter as its
    /// owner, which is why the receiver is `Arc<Self>`.
    async fn load_model(self: Arc<Self>, path: &Path, options: LoadOptions)
        -> Result<LoadedModel>;

    /// Tear down a model instance. No-op on unknown ids.
    async fn unload_model(&self, model_id: &str) -> Result<()>;
}

/// Default `can_handle` used by the shipped adapters: extension match,
/// with a declared format taking precedence when a descriptor is present.
pub fn extension_can_handle(
    format: ModelFormat,
    path: &Path,
    info: Option<&ModelInfo>,
) -> bool {
    if let Some(info) = info {
        return info.format == format;
    }
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format.extensions().contains(&ext.to_lowercase().as_str()),
        None => false,
    }
}
