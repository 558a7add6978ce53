//! GGUF adapter.
//!
//! Drives GGUF weight files through an externally supplied llama-server
//! compatible runtime. Each loaded model either spawns its own server
//! process (binary configured) or attaches to an already-running endpoint,
//! and all inference is proxied over the runtime's OpenAI-style HTTP API.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use serde_json::json;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::adapter::contract::{
    extension_can_handle, AdapterCapabilities, LoadOptions, ModelAdapter, ModelFormat, ModelInfo,
    ModelType,
};
use crate::adapter::model::{
    generate_model_id, ChatMessage, GenerateOutput, LoadedModel, ModelOps, TokenStream,
};
use crate::error::{Result, RuntimeError};
use crate::streaming::StreamController;

#[derive(Debug, Clone)]
pub struct GgufAdapterConfig {
    /// llama-server compatible binary. None means attach-only.
    pub server_binary: Option<PathBuf>,
    /// Existing runtime endpoint to attach to instead of spawning.
    pub endpoint: Option<String>,
    pub host: String,
    pub base_port: u16,
    pub startup_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for GgufAdapterConfig {
    fn default() -> Self {
        Self {
            server_binary: None,
            endpoint: None,
            host: "127.0.0.1".to_string(),
            base_port: 8100,
            startup_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(600),
        }
    }
}

struct GgufInstance {
    base_url: String,
    child: Option<tokio::process::Child>,
    live: Arc<AtomicBool>,
}

pub struct GgufAdapter {
    config: GgufAdapterConfig,
    client: reqwest::Client,
    instances: DashMap<String, GgufInstance>,
    next_port: AtomicU16,
}

impl GgufAdapter {
    pub fn new(config: GgufAdapterConfig) -> Arc<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        let base_port = config.base_port;
        Arc::new(Self {
            config,
            client,
            instances: DashMap::new(),
            next_port: AtomicU16::new(base_port),
        })
    }

    async fn is_ready(&self, base_url: &str) -> bool {
        let health_url = format!("{base_url}/health");
        match self.client.get(&health_url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    async fn spawn_server(
        &self,
        path: &Path,
        options: &LoadOptions,
        port: u16,
    ) -> Result<tokio::process::Child> {
        let binary = self.config.server_binary.as_ref().ok_or_else(|| {
            RuntimeError::LoadFailure {
                path: path.to_path_buf(),
                reason: "no runtime binary configured and no endpoint to attach to".into(),
            }
        })?;
        if !binary.exists() {
            return Err(RuntimeError::LoadFailure {
                path: path.to_path_buf(),
                reason: format!("runtime binary not found at {}", binary.display()),
            });
        }

        info!("Starting GGUF runtime for {} on port {}", path.display(), port);
        let mut cmd = tokio::process::Command::new(binary);
        cmd.arg("--model")
            .arg(path)
            .arg("--host")
            .arg(&self.config.host)
            .arg("--port")
            .arg(port.to_string())
            .arg("--ctx-size")
            .arg(options.context_size.unwrap_or(8192).to_string())
            .arg("--batch-size")
            .arg(options.batch_size.unwrap_or(128).to_string())
            .arg("--threads")
            .arg(options.threads.unwrap_or(6).to_string())
            .arg("--n-gpu-layers")
            .arg(options.gpu_layers.unwrap_or(0).to_string())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        cmd.spawn().map_err(|e| RuntimeError::LoadFailure {
            path: path.to_path_buf(),
            reason: format!("failed to spawn runtime server: {e}"),
        })
    }

    async fn wait_until_ready(&self, base_url: &str) -> Result<()> {
        let poll = Duration::from_millis(500);
        let mut waited = Duration::ZERO;
        while waited < self.config.startup_timeout {
            if self.is_ready(base_url).await {
                info!("GGUF runtime ready at {} after {:?}", base_url, waited);
                return Ok(());
            }
            sleep(poll).await;
            waited += poll;
        }
        Err(RuntimeError::Timeout { waited_ms: self.config.startup_timeout.as_millis() as u64 })
    }

    fn build_ops(&self, model_id: &str, base_url: &str) -> ModelOps {
        let mut ops = ModelOps::default();

        let client = self.client.clone();
        let url = base_url.to_string();
        let id = model_id.to_string();
        ops.generate = Some(Arc::new(move |req| {
            let client = client.clone();
            let url = url.clone();
            let id = id.clone();
            Box::pin(async move {
                let messages = vec![ChatMessage::user(req.prompt)];
                chat_completion(&client, &url, &id, messages, req.max_tokens, req.temperature)
                    .await
            })
        }));

        let client = self.client.clone();
        let url = base_url.to_string();
        let id = model_id.to_string();
        ops.chat = Some(Arc::new(move |req| {
            let client = client.clone();
            let url = url.clone();
            let id = id.clone();
            Box::pin(async move {
                chat_completion(&client, &url, &id, req.messages, req.max_tokens, req.temperature)
                    .await
            })
        }));

        let client = self.client.clone();
        let url = base_url.to_string();
        let id = model_id.to_string();
        ops.generate_stream = Some(Arc::new(move |req| {
            let client = client.clone();
            let url = url.clone();
            let id = id.clone();
            Box::pin(async move { stream_completion(client, url, id, req).await })
        }));

        let client = self.client.clone();
        let url = base_url.to_string();
        let id = model_id.to_string();
        ops.embed = Some(Arc::new(move |inputs| {
            let client = client.clone();
            let url = url.clone();
            let id = id.clone();
            Box::pin(async move { embeddings(&client, &url, &id, inputs).await })
        }));

        ops
    }
}

async fn chat_completion(
    client: &reqwest::Client,
    base_url: &str,
    model_id: &str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
) -> Result<GenerateOutput> {
    let payload = json!({
        "model": "local-model",
        "messages": messages,
        "max_tokens": max_tokens,
        "temperature": temperature,
        "stream": false,
    });

    let resp = client
        .post(format!("{base_url}/v1/chat/completions"))
        .json(&payload)
        .send()
        .await
        .map_err(|e| RuntimeError::Transport {
            endpoint: base_url.to_string(),
            reason: e.to_string(),
        })?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(RuntimeError::InferenceFailure {
            model_id: model_id.to_string(),
            reason: format!("runtime returned {status}: {body}"),
        });
    }

    let value: serde_json::Value =
        resp.json().await.map_err(|e| RuntimeError::InferenceFailure {
            model_id: model_id.to_string(),
            reason: format!("unparsable response: {e}"),
        })?;

    let text = value["choices"][0]["message"]["content"].as_str().unwrap_or("").to_string();
    let tokens_generated = value["usage"]["completion_tokens"]
        .as_u64()
        .unwrap_or_else(|| text.split_whitespace().count() as u64) as u32;
    let finish_reason =
        value["choices"][0]["finish_reason"].as_str().map(|s| s.to_string());

    Ok(GenerateOutput { text, tokens_generated, finish_reason })
}

async fn stream_completion(
    client: reqwest::Client,
    base_url: String,
    model_id: String,
    req: crate::adapter::model::GenerateRequest,
) -> Result<TokenStream> {
    let payload = json!({
        "model": "local-model",
        "messages": [ChatMessage::user(req.prompt)],
        "max_tokens": req.max_tokens,
        "temperature": req.temperature,
        "stream": true,
    });

    let resp = client
        .post(format!("{base_url}/v1/chat/completions"))
        .json(&payload)
        .send()
        .await
        .map_err(|e| RuntimeError::Transport { endpoint: base_url.clone(), reason: e.to_string() })?;
    if !resp.status().is_success() {
        return Err(RuntimeError::InferenceFailure {
            model_id,
            reason: format!("runtime returned {}", resp.status()),
        });
    }

    let controller = StreamController::<String>::new();
    let producer = controller.clone();
    tokio::spawn(async move {
        let mut buffer = String::new();
        let mut byte_stream = resp.bytes_stream();
        while let Some(chunk) = byte_stream.next().await {
            match chunk {
                Ok(bytes) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    while let Some(pos) = buffer.find('\n') {
                        let line: String = buffer.drain(..=pos).collect();
                        let line = line.trim();
                        let Some(data) = line.strip_prefix("data: ") else {
                            continue;
                        };
                        if data == "[DONE]" {
                            producer.close();
                            return;
                        }
                        if let Some(token) = extract_delta_content(data) {
                            if !producer.push(token) {
                                // Consumer cancelled; stop reading.
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    producer.error(RuntimeError::Transport {
                        endpoint: base_url.clone(),
                        reason: format!("stream interrupted: {e}"),
                    });
                    return;
                }
            }
        }
        producer.close();
    });

    Ok(Box::pin(controller.into_stream()) as TokenStream)
}

fn extract_delta_content(data: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(data).ok()?;
    value["choices"][0]["delta"]["content"].as_str().map(|s| s.to_string())
}

async fn embeddings(
    client: &reqwest::Client,
    base_url: &str,
    model_id: &str,
    inputs: Vec<String>,
) -> Result<Vec<Vec<f32>>> {
    let payload = json!({ "model": "local-model", "input": inputs });
    let resp = client
        .post(format!("{base_url}/v1/embeddings"))
        .json(&payload)
        .send()
        .await
        .map_err(|e| RuntimeError::Transport {
            endpoint: base_url.to_string(),
            reason: e.to_string(),
        })?;
    if !resp.status().is_success() {
        return Err(RuntimeError::InferenceFailure {
            model_id: model_id.to_string(),
            reason: format!("embeddings request returned {}", resp.status()),
        });
    }
    let value: serde_json::Value =
        resp.json().await.map_err(|e| RuntimeError::InferenceFailure {
            model_id: model_id.to_string(),
            reason: format!("unparsable embeddings response: {e}"),
        })?;
    let data = value["data"].as_array().cloned().unwrap_or_default();
    Ok(data
        .iter()
        .map(|item| {
            item["embedding"]
                .as_array()
                .map(|nums| {
                    nums.iter().filter_map(|n| n.as_f64()).map(|n| n as f32).collect()
                })
                .unwrap_or_default()
        })
        .collect())
}

#[async_trait]
impl ModelAdapter for GgufAdapter {
    fn format(&self) -> ModelFormat {
        ModelFormat::Gguf
    }

    fn supported_types(&self) -> &[ModelType] {
        &[ModelType::Llm, ModelType::Embedding]
    }

    fn can_handle(&self, path: &Path, info: Option<&ModelInfo>) -> bool {
        extension_can_handle(ModelFormat::Gguf, path, info)
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            supports_streaming: true,
            supports_gpu: true,
            quantization_levels: vec![
                "q4_0".into(),
                "q4_k_m".into(),
                "q5_k_m".into(),
                "q8_0".into(),
                "f16".into(),
            ],
            max_context_length: Some(32_768),
            file_extensions: ModelFormat::Gguf.extensions().iter().map(|e| e.to_string()).collect(),
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

        let id = generate_model_id(ModelFormat::Gguf);
        let (base_url, child) = match &self.config.endpoint {
            Some(endpoint) => (endpoint.trim_end_matches('/').to_string(), None),
            None => {
                let port = self.next_port.fetch_add(1, Ordering::SeqCst);
                let child = self.spawn_server(path, &options, port).await?;
                (format!("http://{}:{}", self.config.host, port), Some(child))
            }
        };

        if let Err(e) = self.wait_until_ready(&base_url).await {
            if let Some(mut child) = child {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
            return Err(RuntimeError::LoadFailure {
                path: path.to_path_buf(),
                reason: format!("runtime never became ready: {e}"),
            });
        }

        let mut metadata = HashMap::new();
        metadata.insert("base_url".to_string(), base_url.clone());
        let info = ModelInfo {
            name: path.file_stem().and_then(|s| s.to_str()).unwrap_or("model").to_string(),
            format: ModelFormat::Gguf,
            model_type: ModelType::Llm,
            size: meta.len(),
            version: "latest".to_string(),
            checksum: None,
            metadata,
        };

        let live = Arc::new(AtomicBool::new(true));
        let ops = self.build_ops(&id, &base_url);
        self.instances.insert(
            id.clone(),
            GgufInstance { base_url: base_url.clone(), child, live: live.clone() },
        );
        debug!("Loaded GGUF model {} behind {}", id, base_url);

        let adapter: Arc<dyn ModelAdapter> = self.clone();
        Ok(LoadedModel::new(id, info, adapter, ops, live))
    }

    async fn unload_model(&self, model_id: &str) -> Result<()> {
        let Some((_, mut instance)) = self.instances.remove(model_id) else {
            return Ok(());
        };
        instance.live.store(false, Ordering::Release);
        if let Some(mut child) = instance.child.take() {
            info!("Stopping GGUF runtime at {}", instance.base_url);
            if let Err(e) = child.start_kill() {
                warn!("Failed to kill runtime process: {}", e);
            }
            let _ = child.wait().await;
        }
        Ok(())
    }
}
