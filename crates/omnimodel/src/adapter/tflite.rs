//! TensorFlow Lite adapter.
//!
//! Drives mobile-inference model files through an externally supplied
//! delegate server (the native TFLite interpreter lives there, not in
//! this process). Models are registered with the server, which hands
//! back a native handle; vision and audio calls are proxied per handle.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use tracing::{debug, info};

use crate::adapter::contract::{
    extension_can_handle, AdapterCapabilities, LoadOptions, ModelAdapter, ModelFormat, ModelInfo,
    ModelType,
};
use crate::adapter::model::{
    generate_model_id, Classification, Detection, LoadedModel, ModelOps, Segmentation,
    SynthesizedAudio, Transcription,
};
use crate::error::{Result, RuntimeError};

#[derive(Debug, Clone)]
pub struct TfLiteAdapterConfig {
    /// Delegate server endpoint, e.g. "http://127.0.0.1:8200".
    pub endpoint: String,
    pub request_timeout: Duration,
}

impl Default for TfLiteAdapterConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8200".to_string(),
            request_timeout: Duration::from_secs(120),
        }
    }
}

struct TfLiteInstance {
    handle: String,
    live: Arc<AtomicBool>,
}

pub struct TfLiteAdapter {
    config: TfLiteAdapterConfig,
    client: reqwest::Client,
    instances: DashMap<String, TfLiteInstance>,
}

impl TfLiteAdapter {
    pub fn new(config: TfLiteAdapterConfig) -> Arc<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        Arc::new(Self { config, client, instances: DashMap::new() })
    }

    fn endpoint(&self) -> String {
        self.config.endpoint.trim_end_matches('/').to_string()
    }

    fn build_ops(&self, model_id: &str, handle: &str, model_type: ModelType) -> ModelOps {
        let mut ops = ModelOps::default();
        let base = self.endpoint();

        if model_type == ModelType::Vision {
            let client = self.client.clone();
            let url = format!("{base}/v1/models/{handle}/classify");
            let id = model_id.to_string();
            ops.classify = Some(Arc::new(move |input| {
                let client = client.clone();
                let url = url.clone();
                let id = id.clone();
                Box::pin(async move {
                    let value = post_media(&client, &url, &id, input.bytes, input.hint).await?;
                    let results = value.as_array().cloned().unwrap_or_default();
                    Ok(results
                        .iter()
                        .map(|r| Classification {
                            label: r["label"].as_str().unwrap_or("").to_string(),
                            confidence: r["confidence"].as_f64().unwrap_or(0.0) as f32,
                        })
                        .collect())
                })
            }));

            let client = self.client.clone();
            let url = format!("{base}/v1/models/{handle}/detect");
            let id = model_id.to_string();
            ops.detect = Some(Arc::new(move |input| {
                let client = client.clone();
                let url = url.clone();
                let id = id.clone();
                Box::pin(async move {
                    let value = post_media(&client, &url, &id, input.bytes, input.hint).await?;
                    let results = value.as_array().cloned().unwrap_or_default();
                    Ok(results
                        .iter()
                        .map(|r| {
                            let mut bbox = [0.0f32; 4];
                            if let Some(coords) = r["bbox"].as_array() {
                                for (slot, coord) in bbox.iter_mut().zip(coords) {
                                    *slot = coord.as_f64().unwrap_or(0.0) as f32;
                                }
                            }
                            Detection {
                                label: r["label"].as_str().unwrap_or("").to_string(),
                                confidence: r["confidence"].as_f64().unwrap_or(0.0) as f32,
                                bbox,
                            }
                        })
                        .collect())
                })
            }));

            let client = self.client.clone();
            let url = format!("{base}/v1/models/{handle}/segment");
            let id = model_id.to_string();
            ops.segment = Some(Arc::new(move |input| {
                let client = client.clone();
                let url = url.clone();
                let id = id.clone();
                Box::pin(async move {
                    let value = post_media(&client, &url, &id, input.bytes, input.hint).await?;
                    Ok(Segmentation {
                        width: value["width"].as_u64().unwrap_or(0) as u32,
                        height: value["height"].as_u64().unwrap_or(0) as u32,
                        class_map: value["class_map"]
                            .as_array()
                            .map(|a| a.iter().filter_map(|v| v.as_u64()).map(|v| v as u8).collect())
                            .unwrap_or_default(),
                        labels: value["labels"]
                            .as_array()
                            .map(|a| {
                                a.iter()
                                    .filter_map(|v| v.as_str())
                                    .map(|s| s.to_string())
                                    .collect()
                            })
                            .unwrap_or_default(),
                    })
                })
            }));
        }

        if model_type == ModelType::Audio {
            let client = self.client.clone();
            let url = format!("{base}/v1/models/{handle}/transcribe");
            let id = model_id.to_string();
            ops.transcribe = Some(Arc::new(move |req| {
                let client = client.clone();
                let url = url.clone();
                let id = id.clone();
                Box::pin(async move {
                    let mut request = client.post(&url).body(req.audio);
                    if let Some(rate) = req.sample_rate {
                        request = request.query(&[("sample_rate", rate.to_string())]);
                    }
                    if let Some(lang) = &req.language {
                        request = request.query(&[("language", lang.clone())]);
                    }
                    let value = send_json(request, &url, &id).await?;
                    Ok(Transcription {
                        text: value["text"].as_str().unwrap_or("").to_string(),
                        language: value["language"].as_str().map(|s| s.to_string()),
                        segments: value["segments"]
                            .as_array()
                            .map(|a| {
                                a.iter()
                                    .map(|s| crate::adapter::model::TranscriptSegment {
                                        start_ms: s["start_ms"].as_u64().unwrap_or(0),
                                        end_ms: s["end_ms"].as_u64().unwrap_or(0),
                                        text: s["text"].as_str().unwrap_or("").to_string(),
                                    })
                                    .collect()
                            })
                            .unwrap_or_default(),
                    })
                })
            }));

            let client = self.client.clone();
            let url = format!("{base}/v1/models/{handle}/synthesize");
            let id = model_id.to_string();
            ops.synthesize = Some(Arc::new(move |req| {
                let client = client.clone();
                let url = url.clone();
                let id = id.clone();
                Box::pin(async move {
                    let resp = client
                        .post(&url)
                        .json(&json!({ "text": req.text, "voice": req.voice }))
                        .send()
                        .await
                        .map_err(|e| RuntimeError::Transport {
                            endpoint: url.clone(),
                            reason: e.to_string(),
                        })?;
                    if !resp.status().is_success() {
                        return Err(RuntimeError::InferenceFailure {
                            model_id: id,
                            reason: format!("synthesize returned {}", resp.status()),
                        });
                    }
                    let sample_rate = resp
                        .headers()
                        .get("x-sample-rate")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(22_050);
                    let encoding = resp
                        .headers()
                        .get("x-encoding")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("pcm_s16le")
                        .to_string();
                    let audio = resp
                        .bytes()
                        .await
                        .map_err(|e| RuntimeError::InferenceFailure {
                            model_id: id.clone(),
                            reason: format!("audio body unreadable: {e}"),
                        })?
                        .to_vec();
                    Ok(SynthesizedAudio { audio, sample_rate, encoding })
                })
            }));
        }

        // Raw tensor escape hatch available for every modality.
        let client = self.client.clone();
        let url = format!("{base}/v1/models/{handle}/run");
        let id = model_id.to_string();
        ops.run = Some(Arc::new(move |input| {
            let client = client.clone();
            let url = url.clone();
            let id = id.clone();
            Box::pin(async move { send_json(client.post(&url).json(&input), &url, &id).await })
        }));

        ops
    }
}

async fn post_media(
    client: &reqwest::Client,
    url: &str,
    model_id: &str,
    bytes: Vec<u8>,
    hint: Option<String>,
) -> Result<serde_json::Value> {
    let mut request = client.post(url).body(bytes);
    if let Some(hint) = hint {
        request = request.header("content-type", hint);
    }
    send_json(request, url, model_id).await
}

async fn send_json(
    request: reqwest::RequestBuilder,
    url: &str,
    model_id: &str,
) -> Result<serde_json::Value> {
    let resp = request.send().await.map_err(|e| RuntimeError::Transport {
        endpoint: url.to_string(),
        reason: e.to_string(),
    })?;
    if !resp.status().is_success() {
        return Err(RuntimeError::InferenceFailure {
            model_id: model_id.to_string(),
            reason: format!("delegate returned {}", resp.status()),
        });
    }
    resp.json().await.map_err(|e| RuntimeError::InferenceFailure {
        model_id: model_id.to_string(),
        reason: format!("unparsable delegate response: {e}"),
    })
}

/// Audio-tuned file names route to the audio modality; everything else
/// on this adapter is vision.
fn model_type_for(path: &Path) -> ModelType {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .to_lowercase();
    let audio = ["whisper", "speech", "audio", "asr", "tts", "vocoder", "wav2vec"]
        .iter()
        .any(|k| name.contains(k));
    if audio {
        ModelType::Audio
    } else {
        ModelType::Vision
    }
}

#[async_trait]
impl ModelAdapter for TfLiteAdapter {
    fn format(&self) -> ModelFormat {
        ModelFormat::TfLite
    }

    fn supported_types(&self) -> &[ModelType] {
        &[ModelType::Vision, ModelType::Audio]
    }

    fn can_handle(&self, path: &Path, info: Option<&ModelInfo>) -> bool {
        extension_can_handle(ModelFormat::TfLite, path, info)
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            supports_streaming: false,
            supports_gpu: false,
            quantization_levels: vec!["int8".into(), "fp16".into()],
            max_context_length: None,
            file_extensions: ModelFormat::TfLite
                .extensions()
                .iter()
                .map(|e| e.to_string())
                .collect(),
        }
    }

    async fn load_model(
        self: Arc<Self>,
        path: &Path,
        options: LoadOptions,
    ) -> Result<LoadedModel> {
        let meta =
            tokio::fs::metadata(path).await.map_err(|e| RuntimeError::LoadFailure {
                path: path.to_path_buf(),
                reason: format!("model file unreadable: {e}"),
            })?;

        let base = self.endpoint();
        let register_url = format!("{base}/v1/models");
        let resp = self
            .client
            .post(&register_url)
            .json(&json!({ "path": path.display().to_string(), "options": options.extra }))
            .send()
            .await
            .map_err(|e| RuntimeError::LoadFailure {
                path: path.to_path_buf(),
                reason: format!("delegate server unreachable: {e}"),
            })?;
        if !resp.status().is_success() {
            return Err(RuntimeError::LoadFailure {
                path: path.to_path_buf(),
                reason: format!("delegate refused model: {}", resp.status()),
            });
        }
        let value: serde_json::Value =
            resp.json().await.map_err(|e| RuntimeError::LoadFailure {
                path: path.to_path_buf(),
                reason: format!("unparsable register response: {e}"),
            })?;

        let id = generate_model_id(ModelFormat::TfLite);
        let handle = value["handle"].as_str().unwrap_or(&id).to_string();
        let model_type = model_type_for(path);

        let mut metadata = HashMap::new();
        metadata.insert("delegate_handle".to_string(), handle.clone());
        metadata.insert("delegate_endpoint".to_string(), base.clone());
        let info = ModelInfo {
            name: path.file_stem().and_then(|s| s.to_str()).unwrap_or("model").to_string(),
            format: ModelFormat::TfLite,
            model_type,
            size: meta.len(),
            version: "latest".to_string(),
            checksum: None,
            metadata,
        };

        let live = Arc::new(AtomicBool::new(true));
        let ops = self.build_ops(&id, &handle, model_type);
        self.instances.insert(id.clone(), TfLiteInstance { handle, live: live.clone() });
        debug!("Loaded TFLite model {} ({})", id, model_type.name());

        let adapter: Arc<dyn ModelAdapter> = self.clone();
        Ok(LoadedModel::new(id, info, adapter, ops, live))
    }

    async fn unload_model(&self, model_id: &str) -> Result<()> {
        let Some((_, instance)) = self.instances.remove(model_id) else {
            return Ok(());
        };
        instance.live.store(false, Ordering::Release);
        let url = format!("{}/v1/models/{}", self.endpoint(), instance.handle);
        match self.client.delete(&url).send().await {
            Ok(resp) if resp.status().is_success() || resp.status().as_u16() == 404 => {
                info!("Released TFLite handle {}", instance.handle);
                Ok(())
            }
            Ok(resp) => Err(RuntimeError::InferenceFailure {
                model_id: model_id.to_string(),
                reason: format!("delegate failed to release handle: {}", resp.status()),
            }),
            Err(e) => Err(RuntimeError::Transport { endpoint: url, reason: e.to_string() }),
        }
    }
}
