//! Loaded model instances and their operation surface.
//!
//! A `LoadedModel` is a tagged-capability record: an explicit set of
//! supported operations with one async handler per tag. Callers probe tag
//! membership before invoking; invoking a missing tag fails with
//! Unsupported, invoking after unload fails with NotFound.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures_util::Stream;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::adapter::contract::{ModelAdapter, ModelFormat, ModelInfo};
use crate::error::{Result, RuntimeError};

/// Operation tags a model may expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Generate,
    GenerateStream,
    Chat,
    Classify,
    Detect,
    Segment,
    Transcribe,
    Synthesize,
    Embed,
    Run,
}

impl Operation {
    pub fn name(&self) -> &str {
        match self {
            Operation::Generate => "generate",
            Operation::GenerateStream => "generate_stream",
            Operation::Chat => "chat",
            Operation::Classify => "classify",
            Operation::Detect => "detect",
            Operation::Segment => "segment",
            Operation::Transcribe => "transcribe",
            Operation::Synthesize => "synthesize",
            Operation::Embed => "embed",
            Operation::Run => "run",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self { prompt: prompt.into(), max_tokens: 2000, temperature: 0.7 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".into(), content: content.into() }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".into(), content: content.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateOutput {
    pub text: String,
    pub tokens_generated: u32,
    pub finish_reason: Option<String>,
}

/// Raw media bytes handed to vision handlers, with an optional content
/// hint ("image/png", "pixel_buffer", ...).
#[derive(Debug, Clone)]
pub struct MediaInput {
    pub bytes: Vec<u8>,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub label: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    /// Normalized [x, y, width, height].
    pub bbox: [f32; 4],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segmentation {
    pub width: u32,
    pub height: u32,
    /// Per-pixel class indices, row-major.
    pub class_map: Vec<u8>,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TranscribeRequest {
    pub audio: Vec<u8>,
    pub sample_rate: Option<u32>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcription {
    pub text: String,
    pub language: Option<String>,
    pub segments: Vec<TranscriptSegment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesizeRequest {
    pub text: String,
    pub voice: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesizedAudio {
    pub audio: Vec<u8>,
    pub sample_rate: u32,
    pub encoding: String,
}

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

type OpFuture<T> = BoxFuture<'static, Result<T>>;

pub type GenerateFn = Arc<dyn Fn(GenerateRequest) -> OpFuture<GenerateOutput> + Send + Sync>;
pub type GenerateStreamFn = Arc<dyn Fn(GenerateRequest) -> OpFuture<TokenStream> + Send + Sync>;
pub type ChatFn = Arc<dyn Fn(ChatRequest) -> OpFuture<GenerateOutput> + Send + Sync>;
pub type ClassifyFn = Arc<dyn Fn(MediaInput) -> OpFuture<Vec<Classification>> + Send + Sync>;
pub type DetectFn = Arc<dyn Fn(MediaInput) -> OpFuture<Vec<Detection>> + Send + Sync>;
pub type SegmentFn = Arc<dyn Fn(MediaInput) -> OpFuture<Segmentation> + Send + Sync>;
pub type TranscribeFn = Arc<dyn Fn(TranscribeRequest) -> OpFuture<Transcription> + Send + Sync>;
pub type SynthesizeFn = Arc<dyn Fn(SynthesizeRequest) -> OpFuture<SynthesizedAudio> + Send + Sync>;
pub type EmbedFn = Arc<dyn Fn(Vec<String>) -> OpFuture<Vec<Vec<f32>>> + Send + Sync>;
pub type RunFn = Arc<dyn Fn(serde_json::Value) -> OpFuture<serde_json::Value> + Send + Sync>;

/// One handler slot per operation tag. Adapters populate only the tags
/// the model actually serves.
#[derive(Default, Clone)]
pub struct ModelOps {
    pub generate: Option<GenerateFn>,
    pub generate_stream: Option<GenerateStreamFn>,
    pub chat: Option<ChatFn>,
    pub classify: Option<ClassifyFn>,
    pub detect: Option<DetectFn>,
    pub segment: Option<SegmentFn>,
    pub transcribe: Option<TranscribeFn>,
    pub synthesize: Option<SynthesizeFn>,
    pub embed: Option<EmbedFn>,
    pub run: Option<RunFn>,
}

impl ModelOps {
    pub fn supports(&self, op: Operation) -> bool {
        match op {
            Operation::Generate => self.generate.is_some(),
            Operation::GenerateStream => self.generate_stream.is_some(),
            Operation::Chat => self.chat.is_some(),
            Operation::Classify => self.classify.is_some(),
            Operation::Detect => self.detect.is_some(),
            Operation::Segment => self.segment.is_some(),
            Operation::Transcribe => self.transcribe.is_some(),
            Operation::Synthesize => self.synthesize.is_some(),
            Operation::Embed => self.embed.is_some(),
            Operation::Run => self.run.is_some(),
        }
    }

    /// The explicit tag set for this record.
    pub fn supported(&self) -> Vec<Operation> {
        [
            Operation::Generate,
            Operation::GenerateStream,
            Operation::Chat,
            Operation::Classify,
            Operation::Detect,
            Operation::Segment,
            Operation::Transcribe,
            Operation::Synthesize,
            Operation::Embed,
            Operation::Run,
        ]
        .into_iter()
        .filter(|op| self.supports(*op))
        .collect()
    }
}

/// One in-memory model instance, owned by its adapter.
///
/// Operation handlers are only valid while the instance is registered;
/// the owning adapter revokes them on unload through the shared flag.
#[derive(Clone)]
pub struct LoadedModel {
    pub id: String,
    pub info: ModelInfo,
    adapter: Arc<dyn ModelAdapter>,
    ops: ModelOps,
    live: Arc<AtomicBool>,
}

impl LoadedModel {
    pub fn new(
        id: String,
        info: ModelInfo,
        adapter: Arc<dyn ModelAdapter>,
        ops: ModelOps,
        live: Arc<AtomicBool>,
    ) -> Self {
        Self { id, info, adapter, ops, live }
    }

    pub fn adapter(&self) -> &Arc<dyn ModelAdapter> {
        &self.adapter
    }

    pub fn model_type(&self) -> crate::adapter::contract::ModelType {
        self.info.model_type
    }

    pub fn supports(&self, op: Operation) -> bool {
        self.ops.supports(op)
    }

    pub fn supported_operations(&self) -> Vec<Operation> {
        self.ops.supported()
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_live() {
            Ok(())
        } else {
            Err(RuntimeError::NotFound { what: format!("model {} (unloaded)", self.id) })
        }
    }

    fn handler<'a, F>(&'a self, slot: &'a Option<F>, op: Operation) -> Result<&'a F> {
        self.ensure_live()?;
        slot.as_ref().ok_or_else(|| RuntimeError::Unsupported {
            subject: format!("model {}", self.id),
            operation: op.name().to_string(),
        })
    }

    pub async fn generate(&self, req: GenerateRequest) -> Result<GenerateOutput> {
        self.handler(&self.ops.generate, Operation::Generate)?(req).await
    }

    pub async fn generate_stream(&self, req: GenerateRequest) -> Result<TokenStream> {
        self.handler(&self.ops.generate_stream, Operation::GenerateStream)?(req).await
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<GenerateOutput> {
        self.handler(&self.ops.chat, Operation::Chat)?(req).await
    }

    pub async fn classify(&self, input: MediaInput) -> Result<Vec<Classification>> {
        self.handler(&self.ops.classify, Operation::Classify)?(input).await
    }

    pub async fn detect(&self, input: MediaInput) -> Result<Vec<Detection>> {
        self.handler(&self.ops.detect, Operation::Detect)?(input).await
    }

    pub async fn segment(&self, input: MediaInput) -> Result<Segmentation> {
        self.handler(&self.ops.segment, Operation::Segment)?(input).await
    }

    pub async fn transcribe(&self, req: TranscribeRequest) -> Result<Transcription> {
        self.handler(&self.ops.transcribe, Operation::Transcribe)?(req).await
    }

    pub async fn synthesize(&self, req: SynthesizeRequest) -> Result<SynthesizedAudio> {
        self.handler(&self.ops.synthesize, Operation::Synthesize)?(req).await
    }

    pub async fn embed(&self, inputs: Vec<String>) -> Result<Vec<Vec<f32>>> {
        self.handler(&self.ops.embed, Operation::Embed)?(inputs).await
    }

    pub async fn run(&self, input: serde_json::Value) -> Result<serde_json::Value> {
        self.handler(&self.ops.run, Operation::Run)?(input).await
    }
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("id", &self.id)
            .field("format", &self.info.format)
            .field("type", &self.info.model_type)
            .field("live", &self.is_live())
            .field("operations", &self.supported_operations())
            .finish()
    }
}

/// Process-unique model id: format tag, millisecond timestamp, random
/// suffix. Monotonically informed so collisions are negligible even under
/// rapid loads.
pub fn generate_model_id(format: ModelFormat) -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let suffix: u32 = rand::thread_rng().gen_range(0..0x100_0000);
    format!("{}-{}-{:06x}", format.tag(), millis, suffix)
}
