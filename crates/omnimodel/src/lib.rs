// omnimodel/crates/omnimodel/src/lib.rs

pub mod adapter;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod hardware;
pub mod manager;
pub mod metrics;
pub mod registry;
pub mod retry;
pub mod streaming;
pub mod telemetry;

// Public API exports
pub use config::{Config, LogLevel};
pub use engine::OmniEngine;
pub use error::{Result, RuntimeError};
pub use telemetry::init_tracing;

// Adapter surface exports
pub use adapter::{
    AdapterCapabilities, ChatMessage, ChatRequest, Classification, Detection, FormatDetector,
    GenerateOutput, GenerateRequest, GgufAdapter, GgufAdapterConfig, LoadOptions, LoadedModel,
    MediaInput, ModelAdapter, ModelFormat, ModelInfo, ModelType, Operation, Segmentation,
    SynthesizeRequest, SynthesizedAudio, TfLiteAdapter, TfLiteAdapterConfig, TokenStream,
    TranscribeRequest, Transcription,
};

// Lifecycle and flow-control exports
pub use cache::{CacheStats, LruModelCache};
pub use hardware::{hardware_info, reset_hardware_cache, HardwareInfo};
pub use manager::{DownloadOptions, ModelManager, ProgressFn};
pub use metrics::{MetricsStore, MetricsUpdate, PerformanceMetrics};
pub use registry::{selection_score, ModelRegistry};
pub use retry::retry_with_backoff;
pub use streaming::{
    buffer_stream, stream_with_timeout, transform_stream, BackpressureHandler, BackpressurePermit,
    StreamCancellation, StreamController, StreamState, TokenBuffer,
};
