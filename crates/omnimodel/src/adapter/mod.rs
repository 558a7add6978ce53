//! Format adapter layer.
//!
//! One adapter per model-file format, each wrapping an externally
//! supplied native inference runtime behind the unified
//! [`ModelAdapter`] contract. The core selects among adapters by
//! capability score and drives model lifecycle through them.

pub mod contract;
pub mod format;
pub mod gguf;
pub mod model;
pub mod tflite;

#[cfg(test)]
pub mod testing;

pub use contract::{
    extension_can_handle, AdapterCapabilities, LoadOptions, ModelAdapter, ModelFormat, ModelInfo,
    ModelType,
};
pub use format::FormatDetector;
pub use gguf::{GgufAdapter, GgufAdapterConfig};
pub use model::{
    generate_model_id, ChatMessage, ChatRequest, Classification, Detection, GenerateOutput,
    GenerateRequest, LoadedModel, MediaInput, ModelOps, Operation, Segmentation, SynthesizeRequest,
    SynthesizedAudio, TokenStream, TranscribeRequest, Transcription, TranscriptSegment,
};
pub use tflite::{TfLiteAdapter, TfLiteAdapterConfig};
