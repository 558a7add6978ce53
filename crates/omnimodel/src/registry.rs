//! Adapter and model registry.
//!
//! Owns the format→adapter mapping and the id→model tracking. Tracking is
//! unbounded; residency bounds are the cache's job, which is why "known
//! loaded" (here) and "bounded resident" (cache) are two separate owned
//! containers.

use std::path::Path;
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use crate::adapter::{LoadedModel, ModelAdapter, ModelInfo};
use crate::error::Result;
use crate::hardware::HardwareInfo;

/// Additive selection score for one candidate adapter.
pub fn selection_score(
    adapter: &dyn ModelAdapter,
    info: Option<&ModelInfo>,
    hardware: Option<&HardwareInfo>,
) -> i32 {
    let caps = adapter.capabilities();
    let mut score = 0;
    if let Some(info) = info {
        if info.format == adapter.format() {
            score += 100;
        }
    }
    if let Some(hw) = hardware {
        if hw.has_gpu && caps.supports_gpu {
            score += 50;
        }
    }
    if caps.supports_streaming {
        score += 20;
    }
    if !caps.quantization_levels.is_empty() {
        score += 10;
    }
    score
}

pub struct ModelRegistry {
    /// Registration order is preserved; it breaks selection ties.
    adapters: RwLock<Vec<Arc<dyn ModelAdapter>>>,
    /// Load order is preserved; modality dispatch is positional.
    models: RwLock<Vec<Arc<LoadedModel>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self { adapters: RwLock::new(Vec::new()), models: RwLock::new(Vec::new()) }
    }

    /// Register an adapter. A prior adapter under the same format tag is
    /// overwritten in place (last registration wins, original position
    /// kept). Duplicate registration is not an error.
    pub fn register_adapter(&self, adapter: Arc<dyn ModelAdapter>) {
        let mut adapters = self.adapters.write().unwrap();
        let format = adapter.format();
        match adapters.iter().position(|a| a.format() == format) {
            Some(idx) => {
                info!("Replacing adapter for format {}", format.name());
                adapters[idx] = adapter;
            }
            None => {
                info!("Registered adapter for format {}", format.name());
                adapters.push(adapter);
            }
        }
    }

    pub fn adapter_for(&self, format: crate::adapter::ModelFormat) -> Option<Arc<dyn ModelAdapter>> {
        self.adapters.read().unwrap().iter().find(|a| a.format() == format).cloned()
    }

    pub fn adapter_count(&self) -> usize {
        self.adapters.read().unwrap().len()
    }

    /// Pick the highest-scoring adapter whose `can_handle` accepts the
    /// input. Ties go to the earliest registered candidate. `None` means
    /// no compatible adapter, which is not an error.
    pub fn select_best_adapter(
        &self,
        path: &Path,
        info: Option<&ModelInfo>,
        hardware: Option<&HardwareInfo>,
    ) -> Option<Arc<dyn ModelAdapter>> {
        let adapters = self.adapters.read().unwrap();
        let mut best: Option<(Arc<dyn ModelAdapter>, i32)> = None;
        for adapter in adapters.iter() {
            if !adapter.can_handle(path, info) {
                continue;
            }
            let score = selection_score(adapter.as_ref(), info, hardware);
            debug!(
                "Adapter {} scored {} for {}",
                adapter.format().name(),
                score,
                path.display()
            );
            // Strictly-greater keeps the first registered on ties.
            let better = match &best {
                Some((_, best_score)) => score > *best_score,
                None => true,
            };
            if better {
                best = Some((adapter.clone(), score));
            }
        }
        if let Some((adapter, score)) = &best {
            info!(
                "Selected {} adapter (score {}) for {}",
                adapter.format().name(),
                score,
                path.display()
            );
        }
        best.map(|(adapter, _)| adapter)
    }

    pub fn register_loaded_model(&self, model: Arc<LoadedModel>) {
        debug!("Tracking loaded model {}", model.id);
        let mut models = self.models.write().unwrap();
        // Re-registration under an existing id replaces in place.
        match models.iter().position(|m| m.id == model.id) {
            Some(idx) => models[idx] = model,
            None => models.push(model),
        }
    }

    pub fn get_loaded_model(&self, id: &str) -> Option<Arc<LoadedModel>> {
        self.models.read().unwrap().iter().find(|m| m.id == id).cloned()
    }

    /// All tracked models in load order.
    pub fn all_loaded_models(&self) -> Vec<Arc<LoadedModel>> {
        self.models.read().unwrap().clone()
    }

    /// Unload through the owning adapter, then drop tracking. No-op when
    /// the id is unknown.
    pub async fn unload_model(&self, id: &str) -> Result<()> {
        let model = self.get_loaded_model(id);
        let Some(model) = model else {
            return Ok(());
        };
        model.adapter().unload_model(id).await?;
        self.models.write().unwrap().retain(|m| m.id != id);
        info!("Unloaded model {}", id);
        Ok(())
    }

    /// Sum of reported model sizes; reported, not resident.
    pub fn memory_usage(&self) -> u64 {
        self.models.read().unwrap().iter().map(|m| m.info.size).sum()
    }

    pub fn loaded_count(&self) -> usize {
        self.models.read().unwrap().len()
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testing::MockAdapter;
    use crate::adapter::{ModelFormat, ModelType};

    fn hw(has_gpu: bool) -> HardwareInfo {
        HardwareInfo {
            platform: "test".into(),
            has_gpu,
            has_npu: false,
            memory_mb: 16 * 1024,
            cpu_cores: 8,
            architecture: "x86_64".into(),
        }
    }

    fn info_for(format: ModelFormat) -> ModelInfo {
        ModelInfo {
            name: "m".into(),
            format,
            model_type: ModelType::Llm,
            size: 100,
            version: "1".into(),
            checksum: None,
            metadata: Default::default(),
        }
    }

    #[test]
    fn test_select_scores_format_gpu_streaming_quant() {
        let registry = ModelRegistry::new();
        let alpha = MockAdapter::builder(ModelFormat::Gguf, vec![ModelType::Llm])
            .gpu(true)
            .streaming(true)
            .build();
        let beta = MockAdapter::new(ModelFormat::TfLite, vec![ModelType::Vision]);
        registry.register_adapter(alpha.clone());
        registry.register_adapter(beta);

        let info = info_for(ModelFormat::Gguf);
        let selected = registry
            .select_best_adapter(Path::new("model.gguf"), Some(&info), Some(&hw(true)))
            .expect("adapter selected");
        assert_eq!(selected.format(), ModelFormat::Gguf);
        // 100 format + 50 gpu + 20 streaming
        assert_eq!(selection_score(selected.as_ref(), Some(&info), Some(&hw(true))), 170);

        let with_quant = MockAdapter::builder(ModelFormat::Gguf, vec![ModelType::Llm])
            .gpu(true)
            .streaming(true)
            .quantization(&["q4_0", "q8_0"])
            .build();
        assert_eq!(
            selection_score(with_quant.as_ref(), Some(&info), Some(&hw(true))),
            180
        );
    }

    #[test]
    fn test_select_returns_none_when_nothing_handles_path() {
        let registry = ModelRegistry::new();
        registry.register_adapter(MockAdapter::new(ModelFormat::Gguf, vec![ModelType::Llm]));
        assert!(registry
            .select_best_adapter(Path::new("weights.pt"), None, None)
            .is_none());
    }

    #[test]
    fn test_selection_is_deterministic() {
        let registry = ModelRegistry::new();
        registry.register_adapter(
            MockAdapter::builder(ModelFormat::Gguf, vec![ModelType::Llm]).gpu(true).build(),
        );
        registry.register_adapter(MockAdapter::new(ModelFormat::Onnx, vec![ModelType::Vision]));

        let info = info_for(ModelFormat::Gguf);
        let hardware = hw(true);
        let first = registry
            .select_best_adapter(Path::new("m.gguf"), Some(&info), Some(&hardware))
            .unwrap()
            .format();
        for _ in 0..10 {
            let again = registry
                .select_best_adapter(Path::new("m.gguf"), Some(&info), Some(&hardware))
                .unwrap()
                .format();
            assert_eq!(first, again);
        }
    }

    #[test]
    fn test_tie_breaks_to_first_registered() {
        let registry = ModelRegistry::new();
        let first = MockAdapter::builder(ModelFormat::Onnx, vec![ModelType::Vision])
            .accept_all()
            .build();
        let second = MockAdapter::builder(ModelFormat::CoreMl, vec![ModelType::Vision])
            .accept_all()
            .build();
        registry.register_adapter(first);
        registry.register_adapter(second);

        // No descriptor, no hardware: both score 0.
        let selected = registry
            .select_best_adapter(Path::new("anything.bin"), None, None)
            .unwrap();
        assert_eq!(selected.format(), ModelFormat::Onnx);
    }

    #[test]
    fn test_last_registration_per_format_wins() {
        let registry = ModelRegistry::new();
        let old = MockAdapter::new(ModelFormat::Gguf, vec![ModelType::Llm]);
        let new = MockAdapter::builder(ModelFormat::Gguf, vec![ModelType::Llm])
            .streaming(true)
            .build();
        registry.register_adapter(old);
        registry.register_adapter(new);
        assert_eq!(registry.adapter_count(), 1);

        let selected = registry
            .select_best_adapter(Path::new("m.gguf"), None, None)
            .unwrap();
        assert!(selected.capabilities().supports_streaming);
    }

    #[tokio::test]
    async fn test_loaded_model_tracking_and_memory_usage() {
        let registry = ModelRegistry::new();
        let adapter = MockAdapter::builder(ModelFormat::Gguf, vec![ModelType::Llm])
            .model_size(500)
            .build();
        let m1 = Arc::new(
            adapter.clone().load_model(Path::new("a.gguf"), Default::default()).await.unwrap(),
        );
        let m2 = Arc::new(
            adapter.clone().load_model(Path::new("b.gguf"), Default::default()).await.unwrap(),
        );
        registry.register_loaded_model(m1.clone());
        registry.register_loaded_model(m2.clone());

        assert_eq!(registry.loaded_count(), 2);
        assert_eq!(registry.memory_usage(), 1000);
        assert!(registry.get_loaded_model(&m1.id).is_some());

        registry.unload_model(&m1.id).await.unwrap();
        assert_eq!(registry.loaded_count(), 1);
        assert_eq!(registry.memory_usage(), 500);
        assert_eq!(adapter.unload_count(&m1.id), 1);

        // Unknown id is a no-op, not an error.
        registry.unload_model("missing").await.unwrap();
        assert_eq!(registry.loaded_count(), 1);
    }
}
