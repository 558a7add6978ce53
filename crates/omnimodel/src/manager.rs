//! Model resolution and acquisition.
//!
//! Turns a path or URL into on-disk bytes plus a `ModelInfo` descriptor:
//! format from the file extension, modality inferred from the filename,
//! blake3 content hash for integrity. Downloads stream into the cache
//! directory with retry/backoff and an optional progress callback.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::adapter::{FormatDetector, ModelFormat, ModelInfo, ModelType};
use crate::config::Config;
use crate::error::{Result, RuntimeError};
use crate::retry::retry_with_backoff;

/// Invoked with (bytes downloaded so far, total if known).
pub type ProgressFn = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

pub struct DownloadOptions {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub expected_checksum: Option<String>,
    pub progress: Option<ProgressFn>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            expected_checksum: None,
            progress: None,
        }
    }
}

pub struct ModelManager {
    cache_dir: PathBuf,
    checksum_threshold_bytes: u64,
    client: reqwest::Client,
}

impl ModelManager {
    pub fn new(cache_dir: PathBuf, checksum_threshold_bytes: u64) -> Self {
        Self { cache_dir, checksum_threshold_bytes, client: reqwest::Client::new() }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.cache_dir.clone(), config.checksum_threshold_bytes)
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Resolve a local file into a descriptor. `Ok(None)` when the format
    /// is unrecognized from the extension; that is not an error.
    pub async fn model_info(&self, path: &Path) -> Result<Option<ModelInfo>> {
        let Some(format) = FormatDetector::detect_from_path(path) else {
            return Ok(None);
        };
        let meta = fs::metadata(path).await.map_err(|e| RuntimeError::LoadFailure {
            path: path.to_path_buf(),
            reason: format!("cannot stat model file: {e}"),
        })?;
        let size = meta.len();

        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("model");
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("model")
            .to_string();

        let mut metadata = HashMap::new();
        metadata.insert("source_path".to_string(), path.display().to_string());

        let checksum = if size <= self.checksum_threshold_bytes {
            Some(hash_file(path).await?)
        } else {
            metadata.insert("checksum_skipped".to_string(), "file_above_threshold".to_string());
            None
        };

        Ok(Some(ModelInfo {
            name,
            format,
            model_type: infer_model_type(format, file_name),
            size,
            version: infer_version(file_name),
            checksum,
            metadata,
        }))
    }

    /// Compare a file's blake3 hash against an expected hex digest.
    pub async fn verify_checksum(&self, path: &Path, expected: &str) -> Result<bool> {
        let actual = hash_file(path).await?;
        Ok(actual.eq_ignore_ascii_case(expected))
    }

    /// Fetch a remote model into the cache directory. Transport failures
    /// retry with exponential backoff; a checksum mismatch discards the
    /// file and fails.
    pub async fn download_model(
        &self,
        url: &str,
        info: &ModelInfo,
        options: DownloadOptions,
    ) -> Result<PathBuf> {
        fs::create_dir_all(&self.cache_dir).await.map_err(|e| RuntimeError::LoadFailure {
            path: self.cache_dir.clone(),
            reason: format!("cannot create cache directory: {e}"),
        })?;

        let file_name = filename_from_url(url)
            .unwrap_or_else(|| format!("{}.{}", info.name, info.format.extensions()[0]));
        let target = self.cache_dir.join(file_name);

        info!("Downloading {} -> {}", url, target.display());
        retry_with_backoff(
            |_attempt| self.attempt_download(url, &target, options.progress.clone()),
            options.max_retries,
            options.base_delay,
        )
        .await?;

        if let Some(expected) = &options.expected_checksum {
            if !self.verify_checksum(&target, expected).await? {
                let _ = fs::remove_file(&target).await;
                return Err(RuntimeError::LoadFailure {
                    path: target,
                    reason: "downloaded file failed checksum validation".into(),
                });
            }
        }

        info!("Download complete: {}", target.display());
        Ok(target)
    }

    async fn attempt_download(
        &self,
        url: &str,
        target: &Path,
        progress: Option<ProgressFn>,
    ) -> Result<()> {
        let response = self.client.get(url).send().await.map_err(|e| {
            RuntimeError::Transport { endpoint: url.to_string(), reason: e.to_string() }
        })?;
        if !response.status().is_success() {
            return Err(RuntimeError::Transport {
                endpoint: url.to_string(),
                reason: format!("server returned {}", response.status()),
            });
        }

        let total = response.content_length();
        let mut file = fs::File::create(target).await.map_err(|e| RuntimeError::LoadFailure {
            path: target.to_path_buf(),
            reason: format!("cannot create target file: {e}"),
        })?;

        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| RuntimeError::Transport {
                endpoint: url.to_string(),
                reason: format!("stream interrupted: {e}"),
            })?;
            file.write_all(&chunk).await.map_err(|e| RuntimeError::LoadFailure {
                path: target.to_path_buf(),
                reason: format!("write failed: {e}"),
            })?;
            downloaded += chunk.len() as u64;
            if let Some(cb) = &progress {
                cb(downloaded, total);
            }
        }
        file.flush().await.map_err(|e| RuntimeError::LoadFailure {
            path: target.to_path_buf(),
            reason: format!("flush failed: {e}"),
        })?;
        debug!("Fetched {} bytes from {}", downloaded, url);
        Ok(())
    }
}

async fn hash_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).await.map_err(|e| RuntimeError::LoadFailure {
        path: path.to_path_buf(),
        reason: format!("cannot open for hashing: {e}"),
    })?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf).await.map_err(|e| RuntimeError::LoadFailure {
            path: path.to_path_buf(),
            reason: format!("read failed while hashing: {e}"),
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

fn filename_from_url(url: &str) -> Option<String> {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    without_query
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty() && segment.contains('.'))
        .map(|segment| segment.to_string())
}

/// Modality from format plus filename hints. GGUF defaults to text
/// generation; the mobile formats default to vision, with audio keywords
/// promoting them to the audio modality.
fn infer_model_type(format: ModelFormat, file_name: &str) -> ModelType {
    let lower = file_name.to_lowercase();
    let audio_hint = ["whisper", "wav2vec", "speech", "audio", "asr", "tts", "vocoder"]
        .iter()
        .any(|k| lower.contains(k));
    let embedding_hint =
        ["embed", "embedding", "sentence", "minilm", "bge-"].iter().any(|k| lower.contains(k));

    match format {
        ModelFormat::Gguf => {
            if embedding_hint {
                ModelType::Embedding
            } else {
                ModelType::Llm
            }
        }
        ModelFormat::Onnx | ModelFormat::TfLite | ModelFormat::CoreMl => {
            if audio_hint {
                ModelType::Audio
            } else if embedding_hint {
                ModelType::Embedding
            } else {
                ModelType::Vision
            }
        }
    }
}

fn infer_version(file_name: &str) -> String {
    file_name
        .split(['-', '_', '.'])
        .find(|token| {
            token.len() >= 2
                && token.starts_with('v')
                && token[1..].chars().all(|c| c.is_ascii_digit())
        })
        .map(|token| token.to_string())
        .unwrap_or_else(|| "latest".to_string())
}
