//! Format detection from file extension.

use std::path::Path;

use tracing::debug;

use crate::adapter::contract::ModelFormat;

pub struct FormatDetector;

impl FormatDetector {
    pub fn detect_from_path(path: &Path) -> Option<ModelFormat> {
        let extension = path.extension()?.to_str()?.to_lowercase();

        let format = if ModelFormat::Gguf.extensions().contains(&extension.as_str()) {
            Some(ModelFormat::Gguf)
        } else if ModelFormat::Onnx.extensions().contains(&extension.as_str()) {
            Some(ModelFormat::Onnx)
        } else if ModelFormat::TfLite.extensions().contains(&extension.as_str()) {
            if extension == "tflite" {
                Some(ModelFormat::TfLite)
            } else {
                // ".lite" is ambiguous; only accept it when the filename
                // makes the format explicit.
                path.file_name()
                    .and_then(|n| n.to_str())
                    .filter(|name| name.contains("tflite") || name.contains("tf_lite"))
                    .map(|_| ModelFormat::TfLite)
            }
        } else if ModelFormat::CoreMl.extensions().contains(&extension.as_str()) {
            Some(ModelFormat::CoreMl)
        } else {
            None
        };

        if let Some(fmt) = format {
            debug!("Detected model format: {} for file: {}", fmt.name(), path.display());
        }
        format
    }

    pub fn supported_extensions() -> Vec<String> {
        ModelFormat::all()
            .iter()
            .flat_map(|format| format.extensions().iter().map(|e| e.to_string()))
            .collect()
    }
}
