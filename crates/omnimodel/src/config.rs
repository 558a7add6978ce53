// omnimodel/crates/omnimodel/src/config.rs

use anyhow::Result;
use std::env;
use std::path::PathBuf;
use sysinfo::System;
use tracing::{info, warn};

/// Verbosity threshold consumed by the dispatch layer's log gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    /// Whether a message at `level` passes this threshold.
    pub fn allows(&self, level: LogLevel) -> bool {
        level >= *self
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound on resident model bytes in the LRU cache.
    pub cache_capacity_bytes: u64,
    /// Where downloaded models land.
    pub cache_dir: PathBuf,
    pub log_level: LogLevel,
    /// Files above this size skip content hashing during resolution.
    pub checksum_threshold_bytes: u64,
    pub download_retries: u32,
    pub download_base_delay_ms: u64,
    /// Backpressure bound on concurrently active token streams.
    pub max_concurrent_streams: usize,
    /// Ring size for the recent-token diagnostics buffer.
    pub token_buffer_capacity: usize,
    /// Per-token stall budget for streamed generation; None disables it.
    pub token_timeout_ms: Option<u64>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        // Auto-size the cache when unset: a quarter of system memory,
        // clamped to a sane window.
        let cache_capacity_bytes =
            match env::var("OMNIMODEL_CACHE_CAPACITY_BYTES").ok().as_deref() {
                Some("auto") | None => Self::auto_detect_cache_capacity(),
                Some(raw) => raw.parse().unwrap_or_else(|_| {
                    warn!("Unparsable OMNIMODEL_CACHE_CAPACITY_BYTES={}, using auto", raw);
                    Self::auto_detect_cache_capacity()
                }),
            };

        let cache_dir = env::var("OMNIMODEL_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("omnimodel").join("models"));

        let log_level = env::var("OMNIMODEL_LOG_LEVEL")
            .ok()
            .and_then(|v| LogLevel::parse(&v))
            .unwrap_or(LogLevel::Info);

        let config = Self {
            cache_capacity_bytes,
            cache_dir,
            log_level,
            checksum_threshold_bytes: env::var("OMNIMODEL_CHECKSUM_THRESHOLD_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(512 * 1024 * 1024),
            download_retries: env::var("OMNIMODEL_DOWNLOAD_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            download_base_delay_ms: env::var("OMNIMODEL_DOWNLOAD_BASE_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(500),
            max_concurrent_streams: env::var("OMNIMODEL_MAX_CONCURRENT_STREAMS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),
            token_buffer_capacity: env::var("OMNIMODEL_TOKEN_BUFFER_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(64),
            token_timeout_ms: match env::var("OMNIMODEL_TOKEN_TIMEOUT_MS").ok().as_deref() {
                Some("0") | Some("off") => None,
                Some(raw) => raw.parse().ok().or(Some(30_000)),
                None => Some(30_000),
            },
        };

        info!(
            "Runtime configuration: cache {} MB at {}, {} concurrent streams",
            config.cache_capacity_bytes / 1024 / 1024,
            config.cache_dir.display(),
            config.max_concurrent_streams
        );
        Ok(config)
    }

    fn auto_detect_cache_capacity() -> u64 {
        let mut system = System::new_all();
        system.refresh_memory();
        let total = system.total_memory();
        let quarter = total / 4;
        let min = 1024 * 1024 * 1024u64;
        let max = 32 * 1024 * 1024 * 1024u64;
        let capacity = quarter.clamp(min, max);
        info!(
            "Auto-sized model cache: {} MB ({} MB system memory)",
            capacity / 1024 / 1024,
            total / 1024 / 1024
        );
        capacity
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_capacity_bytes: 4 * 1024 * 1024 * 1024,
            cache_dir: std::env::temp_dir().join("omnimodel").join("models"),
            log_level: LogLevel::Info,
            checksum_threshold_bytes: 512 * 1024 * 1024,
            download_retries: 3,
            download_base_delay_ms: 500,
            max_concurrent_streams: 4,
            token_buffer_capacity: 64,
            token_timeout_ms: Some(30_000),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ===== Log level tests =====

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(LogLevel::parse("debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("INFO"), Some(LogLevel::Info));
        assert_eq!(LogLevel::parse("warning"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("error"), Some(LogLevel::Error));
        assert_eq!(LogLevel::parse("verbose"), None);
    }

    #[test]
    fn test_log_level_threshold() {
        assert!(LogLevel::Info.allows(LogLevel::Warn));
        assert!(LogLevel::Info.allows(LogLevel::Info));
        assert!(!LogLevel::Info.allows(LogLevel::Debug));
        assert!(LogLevel::Error.allows(LogLevel::Error));
        assert!(!LogLevel::Error.allows(LogLevel::Warn));
        assert!(LogLevel::Debug.allows(LogLevel::Debug));
    }

    // ===== Defaults =====

    #[test]
    fn test_default_config_is_sane() {
        let config = Config::default();
        assert!(config.cache_capacity_bytes >= 1024 * 1024 * 1024);
        assert!(config.max_concurrent_streams > 0);
        assert!(config.token_buffer_capacity > 0);
        assert!(config.download_retries <= 10);
        assert!(config.token_timeout_ms.unwrap() > 0);
    }

    #[test]
    fn test_auto_detected_capacity_is_clamped() {
        let capacity = Config::auto_detect_cache_capacity();
        assert!(capacity >= 1024 * 1024 * 1024);
        assert!(capacity <= 32 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_checksum_threshold_below_capacity() {
        let config = Config::default();
        assert!(config.checksum_threshold_bytes <= config.cache_capacity_bytes);
    }
}
