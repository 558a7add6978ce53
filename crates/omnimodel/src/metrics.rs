//! Per-model performance records.
//!
//! Updates are merges: only the fields present in an update overwrite the
//! previous record, and a fresh record starts from zeros. One writer per
//! model id at a time is assumed; the store itself is just a concurrent
//! map.

use dashmap::DashMap;
use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceMetrics {
    pub inference_time_ms: f64,
    pub memory_usage_bytes: u64,
    pub tokens_per_second: Option<f64>,
    pub load_time_ms: Option<f64>,
}

/// Partial update; unset fields keep their previous value.
#[derive(Debug, Clone, Default)]
pub struct MetricsUpdate {
    pub inference_time_ms: Option<f64>,
    pub memory_usage_bytes: Option<u64>,
    pub tokens_per_second: Option<f64>,
    pub load_time_ms: Option<f64>,
}

pub struct MetricsStore {
    records: DashMap<String, PerformanceMetrics>,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self { records: DashMap::new() }
    }

    pub fn record(&self, model_id: &str, update: MetricsUpdate) {
        let mut entry = self.records.entry(model_id.to_string()).or_default();
        if let Some(v) = update.inference_time_ms {
            entry.inference_time_ms = v;
        }
        if let Some(v) = update.memory_usage_bytes {
            entry.memory_usage_bytes = v;
        }
        if let Some(v) = update.tokens_per_second {
            entry.tokens_per_second = Some(v);
        }
        if let Some(v) = update.load_time_ms {
            entry.load_time_ms = Some(v);
        }
    }

    pub fn get(&self, model_id: &str) -> Option<PerformanceMetrics> {
        self.records.get(model_id).map(|r| r.clone())
    }

    pub fn remove(&self, model_id: &str) {
        self.records.remove(model_id);
    }

    pub fn all(&self) -> Vec<(String, PerformanceMetrics)> {
        self.records.iter().map(|r| (r.key().clone(), r.value().clone())).collect()
    }
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new()
    }
}
