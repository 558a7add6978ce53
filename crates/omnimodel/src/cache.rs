//! Byte-bounded LRU cache for resident models.
//!
//! The cache owns residency: at most one live instance per cache key, and
//! the sum of entry sizes never exceeds the configured capacity except
//! transiently inside an in-flight insert before eviction completes.
//! Every entry that leaves the map is first released through its owning
//! adapter, which must free the native resources before returning.
//!
//! Mutations assume a single logical caller; the engine serializes them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::adapter::LoadedModel;
use crate::error::{Result, RuntimeError};

pub struct CacheEntry {
    pub key: String,
    pub model: Arc<LoadedModel>,
    /// Declared byte size; exact integer accounting, never negative.
    pub size: u64,
    pub last_accessed: Instant,
    pub hits: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub total_size: u64,
    pub entry_count: usize,
    /// Degenerate on purpose: the reference behavior divides accumulated
    /// hits by itself, so this is 1.0 whenever any hit exists and 0.0
    /// otherwise. Use `hits`/`misses` for a meaningful ratio.
    pub hit_rate: f64,
    pub hits: u64,
    pub misses: u64,
}

pub struct LruModelCache {
    max_size: u64,
    current_size: u64,
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
}

impl LruModelCache {
    pub fn new(max_size: u64) -> Self {
        Self { max_size, current_size: 0, entries: HashMap::new(), hits: 0, misses: 0 }
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn current_size(&self) -> u64 {
        self.current_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// The cache key holding a given model id, if any. Keys are caller
    /// chosen and need not equal the model id.
    pub fn key_for_model(&self, model_id: &str) -> Option<String> {
        self.entries
            .values()
            .find(|e| e.model.id == model_id)
            .map(|e| e.key.clone())
    }

    /// Look up a model. A hit refreshes recency and bumps hit counters.
    pub fn get(&mut self, key: &str) -> Option<Arc<LoadedModel>> {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.last_accessed = Instant::now();
                entry.hits += 1;
                self.hits += 1;
                debug!("Cache hit for {}", key);
                Some(entry.model.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Install a model under `key`, evicting least-recently-used entries
    /// one at a time until it fits. An entry larger than the whole cache
    /// fails outright with ResourceExhaustion; nothing is evicted for it.
    /// Overwriting an existing key releases the old instance first.
    pub async fn insert(&mut self, key: &str, model: Arc<LoadedModel>) -> Result<()> {
        let incoming = model.info.size;
        if incoming > self.max_size {
            return Err(RuntimeError::ResourceExhaustion {
                required: incoming,
                available: self.max_size,
            });
        }

        if self.entries.contains_key(key) {
            self.remove(key).await?;
        }

        while self.current_size + incoming > self.max_size && !self.entries.is_empty() {
            self.evict_lru().await?;
        }

        self.entries.insert(
            key.to_string(),
            CacheEntry {
                key: key.to_string(),
                model,
                size: incoming,
                last_accessed: Instant::now(),
                hits: 0,
            },
        );
        self.current_size += incoming;
        debug!(
            "Cached {} ({} bytes, {}/{} resident)",
            key, incoming, self.current_size, self.max_size
        );
        Ok(())
    }

    async fn evict_lru(&mut self) -> Result<()> {
        let victim = self
            .entries
            .values()
            .min_by_key(|e| e.last_accessed)
            .map(|e| e.key.clone());
        let Some(key) = victim else {
            return Ok(());
        };
        info!("Evicting least-recently-used model under key {}", key);
        self.remove(&key).await
    }

    /// Release an entry through its adapter and drop it from the map.
    /// No-op when the key is absent. An unload failure leaves the entry
    /// in place and propagates, so the size accounting stays exact.
    pub async fn remove(&mut self, key: &str) -> Result<()> {
        let (model, size) = match self.entries.get(key) {
            Some(entry) => (entry.model.clone(), entry.size),
            None => return Ok(()),
        };
        model.adapter().unload_model(&model.id).await?;
        self.entries.remove(key);
        self.current_size -= size;
        debug!("Removed {} from cache ({} bytes freed)", key, size);
        Ok(())
    }

    /// Unload everything concurrently, tolerating individual failures,
    /// then reset the bookkeeping unconditionally.
    pub async fn clear(&mut self) {
        let models: Vec<Arc<LoadedModel>> =
            self.entries.values().map(|e| e.model.clone()).collect();
        let results = join_all(
            models.iter().map(|m| async move { m.adapter().unload_model(&m.id).await }),
        )
        .await;
        for (model, result) in models.iter().zip(results) {
            if let Err(e) = result {
                warn!("Unload of {} failed during cache clear: {}", model.id, e);
            }
        }
        self.entries.clear();
        self.current_size = 0;
        info!("Cache cleared");
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            total_size: self.current_size,
            entry_count: self.entries.len(),
            hit_rate: if self.hits > 0 { 1.0 } else { 0.0 },
            hits: self.hits,
            misses: self.misses,
        }
    }

    /// Drop every entry idle for longer than `max_age`. Goes through
    /// `remove` so adapters release native resources. Returns the number
    /// of entries removed.
    pub async fn prune(&mut self, max_age: Duration) -> Result<usize> {
        let now = Instant::now();
        let stale: Vec<String> = self
            .entries
            .values()
            .filter(|e| now.duration_since(e.last_accessed) > max_age)
            .map(|e| e.key.clone())
            .collect();
        let mut removed = 0;
        for key in stale {
            self.remove(&key).await?;
            removed += 1;
        }
        if removed > 0 {
            info!("Pruned {} idle cache entries", removed);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testing::MockAdapter;
    use crate::adapter::{ModelAdapter, ModelFormat, ModelType};
    use std::path::Path;

    async fn load_sized(size: u64) -> (Arc<MockAdapter>, Arc<LoadedModel>) {
        let adapter = MockAdapter::builder(ModelFormat::Gguf, vec![ModelType::Llm])
            .model_size(size)
            .build();
        let model = Arc::new(
            adapter.clone().load_model(Path::new("m.gguf"), Default::default()).await.unwrap(),
        );
        (adapter, model)
    }

    #[tokio::test]
    async fn test_insert_and_get_roundtrip() {
        let mut cache = LruModelCache::new(100);
        let (_adapter, model) = load_sized(40).await;
        cache.insert("a", model.clone()).await.unwrap();

        let hit = cache.get("a").expect("hit");
        assert_eq!(hit.id, model.id);
        assert_eq!(cache.current_size(), 40);
        assert!(cache.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_oversized_insert_fails_without_evicting() {
        let mut cache = LruModelCache::new(100);
        let (_a1, small) = load_sized(60).await;
        cache.insert("small", small).await.unwrap();

        let (_a2, huge) = load_sized(150).await;
        let err = cache.insert("huge", huge).await.unwrap_err();
        assert!(matches!(err, RuntimeError::ResourceExhaustion { required: 150, available: 100 }));
        // Prior entry untouched.
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.current_size(), 60);
    }

    #[tokio::test]
    async fn test_evicts_one_at_a_time_until_fit() {
        let mut cache = LruModelCache::new(100);
        for key in ["a", "b", "c"] {
            let (_ad, model) = load_sized(30).await;
            cache.insert(key, model).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(cache.len(), 3);

        // 90 resident; a 40-byte insert needs two evictions, not three.
        let (_ad, model) = load_sized(40).await;
        cache.insert("d", model).await.unwrap();
        assert_eq!(cache.len(), 2);
        assert!(cache.contains("c"));
        assert!(cache.contains("d"));
        assert_eq!(cache.current_size(), 70);
    }

    #[tokio::test]
    async fn test_lru_order_respects_access() {
        let mut cache = LruModelCache::new(3);
        let mut loaded = Vec::new();
        for key in ["a", "b", "c"] {
            let (adapter, model) = load_sized(1).await;
            loaded.push((key, adapter, model.id.clone()));
            cache.insert(key, model).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        // Touch "a": "b" becomes the least recently used.
        cache.get("a").unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;

        let (_ad, d) = load_sized(1).await;
        cache.insert("d", d).await.unwrap();

        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
        assert!(cache.contains("d"));

        let (_, b_adapter, b_id) = &loaded[1];
        assert_eq!(b_adapter.unload_count(b_id), 1);
    }

    #[tokio::test]
    async fn test_unload_before_evict_exactly_once() {
        let mut cache = LruModelCache::new(10);
        let (victim_adapter, victim) = load_sized(10).await;
        let victim_id = victim.id.clone();
        cache.insert("victim", victim).await.unwrap();
        assert_eq!(cache.stats().entry_count, 1);

        let (_ad, next) = load_sized(10).await;
        cache.insert("next", next).await.unwrap();

        assert_eq!(victim_adapter.unload_count(&victim_id), 1);
        assert_eq!(cache.stats().entry_count, 1);
        assert!(cache.contains("next"));
        assert!(!cache.contains("victim"));
    }

    #[tokio::test]
    async fn test_same_key_overwrite_releases_old_instance() {
        let mut cache = LruModelCache::new(100);
        let (old_adapter, old) = load_sized(60).await;
        let old_id = old.id.clone();
        cache.insert("k", old).await.unwrap();

        let (_new_adapter, new) = load_sized(30).await;
        cache.insert("k", new.clone()).await.unwrap();

        assert_eq!(old_adapter.unload_count(&old_id), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.current_size(), 30);
        assert_eq!(cache.get("k").unwrap().id, new.id);
    }

    #[tokio::test]
    async fn test_remove_is_noop_on_absent_key() {
        let mut cache = LruModelCache::new(10);
        cache.remove("nothing").await.unwrap();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_failed_unload_keeps_entry_and_accounting() {
        let mut cache = LruModelCache::new(100);
        let adapter = MockAdapter::builder(ModelFormat::Gguf, vec![ModelType::Llm])
            .model_size(50)
            .build();
        let model = Arc::new(
            adapter.clone().load_model(Path::new("m.gguf"), Default::default()).await.unwrap(),
        );
        cache.insert("k", model).await.unwrap();

        adapter.set_fail_unloads(true);
        assert!(cache.remove("k").await.is_err());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.current_size(), 50);

        adapter.set_fail_unloads(false);
        cache.remove("k").await.unwrap();
        assert_eq!(cache.current_size(), 0);
    }

    #[tokio::test]
    async fn test_clear_tolerates_unload_failures() {
        let mut cache = LruModelCache::new(100);
        let good = MockAdapter::builder(ModelFormat::Gguf, vec![ModelType::Llm])
            .model_size(10)
            .build();
        let bad = MockAdapter::builder(ModelFormat::Onnx, vec![ModelType::Vision])
            .model_size(10)
            .build();
        let m1 = Arc::new(
            good.clone().load_model(Path::new("a.gguf"), Default::default()).await.unwrap(),
        );
        let m2 = Arc::new(
            bad.clone().load_model(Path::new("b.onnx"), Default::default()).await.unwrap(),
        );
        cache.insert("good", m1).await.unwrap();
        cache.insert("bad", m2).await.unwrap();

        bad.set_fail_unloads(true);
        cache.clear().await;
        assert!(cache.is_empty());
        assert_eq!(cache.current_size(), 0);
        assert_eq!(good.total_unloads(), 1);
    }

    #[tokio::test]
    async fn test_stats_degenerate_hit_rate() {
        let mut cache = LruModelCache::new(100);
        assert_eq!(cache.stats().hit_rate, 0.0);

        let (_ad, model) = load_sized(10).await;
        cache.insert("k", model).await.unwrap();
        assert!(cache.get("missing").is_none());
        assert_eq!(cache.stats().hit_rate, 0.0);
        assert_eq!(cache.stats().misses, 1);

        cache.get("k").unwrap();
        let stats = cache.stats();
        assert_eq!(stats.hit_rate, 1.0);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn test_prune_unloads_idle_entries() {
        let mut cache = LruModelCache::new(100);
        let (adapter, model) = load_sized(10).await;
        let id = model.id.clone();
        cache.insert("idle", model).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let (_fresh_ad, fresh) = load_sized(10).await;
        cache.insert("fresh", fresh).await.unwrap();

        let removed = cache.prune(Duration::from_millis(10)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!cache.contains("idle"));
        assert!(cache.contains("fresh"));
        assert_eq!(adapter.unload_count(&id), 1);
    }

    #[test]
    fn test_eviction_bound_holds_for_any_insert_sequence() {
        use proptest::prelude::*;

        proptest!(ProptestConfig::with_cases(64), |(
            sizes in proptest::collection::vec(1u64..=120, 1..20)
        )| {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            rt.block_on(async {
                let max = 100u64;
                let mut cache = LruModelCache::new(max);
                for (i, size) in sizes.iter().enumerate() {
                    let adapter = MockAdapter::builder(ModelFormat::Gguf, vec![ModelType::Llm])
                        .model_size(*size)
                        .build();
                    let model = Arc::new(
                        adapter
                            .clone()
                            .load_model(Path::new("m.gguf"), Default::default())
                            .await
                            .unwrap(),
                    );
                    let result = cache.insert(&format!("k{}", i % 5), model).await;
                    if *size > max {
                        assert!(result.is_err());
                    }
                    assert!(cache.current_size() <= max);
                    assert_eq!(cache.stats().total_size, cache.current_size());
                }
            });
        });
    }
}
