//! Tiered placement engine (§4.7): tier selection, promotion/demotion,
//! in-memory tier map, metrics, and instrumentation hooks.

pub mod policy;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::clock::SharedClock;
use crate::collaborators::{HotStore, ObjectStore};
use crate::config::{Tier, TierConfig};
use crate::error::{Error, Result};
use policy::AccessState;

/// Callback the placement engine uses to push `setMetadata {path, tier,
/// size}` into the metadata layer (§4.7), kept generic so C7 doesn't
/// depend on the concrete metadata store type.
#[async_trait]
pub trait MetadataSink: Send + Sync {
    async fn set_metadata(&self, path: &str, tier: Tier, size: u64) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
struct TierMapState {
    tier: Option<Tier>,
    size: u64,
    access_count: u64,
    last_access_ms: i64,
    recent_accesses: Vec<i64>,
}

/// A moving average over the last 100 latency samples, per tier (§4.7).
#[derive(Default)]
struct LatencyWindow {
    samples: Mutex<VecDeque<u64>>,
}

impl LatencyWindow {
    fn record(&self, micros: u64) {
        let mut samples = self.samples.lock();
        samples.push_back(micros);
        if samples.len() > 100 {
            samples.pop_front();
        }
    }

    fn average(&self) -> f64 {
        let samples = self.samples.lock();
        if samples.is_empty() {
            0.0
        } else {
            samples.iter().sum::<u64>() as f64 / samples.len() as f64
        }
    }
}

#[derive(Default)]
pub struct Metrics {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    reads_by_tier: DashMap<Tier, AtomicU64>,
    writes_by_tier: DashMap<Tier, AtomicU64>,
    promotions_by_tier: DashMap<Tier, AtomicU64>,
    demotions_by_tier: DashMap<Tier, AtomicU64>,
    latency_by_tier: DashMap<Tier, LatencyWindow>,
}

impl Metrics {
    fn bump(map: &DashMap<Tier, AtomicU64>, tier: Tier) {
        map.entry(tier).or_default().fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let collect = |map: &DashMap<Tier, AtomicU64>| {
            map.iter().map(|e| (*e.key(), e.value().load(Ordering::Relaxed))).collect()
        };
        MetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            reads_by_tier: collect(&self.reads_by_tier),
            writes_by_tier: collect(&self.writes_by_tier),
            promotions_by_tier: collect(&self.promotions_by_tier),
            demotions_by_tier: collect(&self.demotions_by_tier),
            average_latency_us: self.latency_by_tier.iter().map(|e| (*e.key(), e.value().average())).collect(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub reads_by_tier: Vec<(Tier, u64)>,
    pub writes_by_tier: Vec<(Tier, u64)>,
    pub promotions_by_tier: Vec<(Tier, u64)>,
    pub demotions_by_tier: Vec<(Tier, u64)>,
    pub average_latency_us: Vec<(Tier, f64)>,
}

pub type OperationHook = Arc<dyn Fn(&str) + Send + Sync>;
pub type MigrationHook = Arc<dyn Fn(&str, Tier, Tier) + Send + Sync>;

pub struct TieredPlacementEngine {
    hot: Arc<dyn HotStore>,
    warm: Option<Arc<dyn ObjectStore>>,
    cold: Option<Arc<dyn ObjectStore>>,
    metadata: Arc<dyn MetadataSink>,
    config: TierConfig,
    clock: SharedClock,
    tier_map: DashMap<String, TierMapState>,
    pub metrics: Metrics,
    pub on_operation_start: Mutex<Option<OperationHook>>,
    pub on_operation_end: Mutex<Option<OperationHook>>,
    pub on_tier_migration: Mutex<Option<MigrationHook>>,
}

impl TieredPlacementEngine {
    pub fn new(
        hot: Arc<dyn HotStore>,
        warm: Option<Arc<dyn ObjectStore>>,
        cold: Option<Arc<dyn ObjectStore>>,
        metadata: Arc<dyn MetadataSink>,
        config: TierConfig,
        clock: SharedClock,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            hot,
            warm,
            cold,
            metadata,
            config,
            clock,
            tier_map: DashMap::new(),
            metrics: Metrics::default(),
            on_operation_start: Mutex::new(None),
            on_operation_end: Mutex::new(None),
            on_tier_migration: Mutex::new(None),
        }))
    }

    fn store_for(&self, tier: Tier) -> Result<StoreRef<'_>> {
        match tier {
            Tier::Hot => Ok(StoreRef::Hot(&self.hot)),
            Tier::Warm => self.warm.as_ref().map(StoreRef::Object).ok_or_else(|| {
                Error::invalid_argument("warm tier disabled")
            }),
            Tier::Cold => self.cold.as_ref().map(StoreRef::Object).ok_or_else(|| {
                Error::invalid_argument("cold tier disabled")
            }),
        }
    }

    pub async fn write_file(&self, path: &str, bytes: &[u8]) -> Result<Tier> {
        self.fire_start(path);
        let tier = policy::select_tier(bytes.len() as u64, &self.config);
        self.store_for(tier)?.put(path, bytes).await?;
        self.metadata.set_metadata(path, tier, bytes.len() as u64).await?;
        self.tier_map.insert(
            path.to_string(),
            TierMapState { tier: Some(tier), size: bytes.len() as u64, access_count: 0, last_access_ms: self.clock.now_ms(), recent_accesses: vec![] },
        );
        Metrics::bump(&self.metrics.writes_by_tier, tier);
        self.evict_tier_map_if_needed();
        self.fire_end(path);
        Ok(tier)
    }

    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.fire_start(path);
        let started = std::time::Instant::now();
        let known_tier = self.tier_map.get(path).and_then(|s| s.tier);

        let (bytes, tier) = if let Some(tier) = known_tier {
            self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
            match self.store_for(tier)?.get(path).await? {
                Some(bytes) => (bytes, tier),
                None => self.read_by_probing(path).await?,
            }
        } else {
            self.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);
            self.read_by_probing(path).await?
        };

        Metrics::bump(&self.metrics.reads_by_tier, tier);
        self.metrics
            .latency_by_tier
            .entry(tier)
            .or_default()
            .record(started.elapsed().as_micros() as u64);
        self.record_access(path, tier, bytes.len() as u64).await?;
        self.fire_end(path);
        Ok(bytes)
    }

    async fn read_by_probing(&self, path: &str) -> Result<(Vec<u8>, Tier)> {
        for tier in [Tier::Warm, Tier::Cold, Tier::Hot] {
            if let Ok(store) = self.store_for(tier) {
                if let Some(bytes) = store.get(path).await? {
                    return Ok((bytes, tier));
                }
            }
        }
        Err(Error::not_found(path.to_string()))
    }

    async fn record_access(&self, path: &str, tier: Tier, size: u64) -> Result<()> {
        let now = self.clock.now_ms();
        let target = {
            let mut entry = self.tier_map.entry(path.to_string()).or_insert_with(|| TierMapState {
                tier: Some(tier),
                size,
                ..Default::default()
            });
            entry.tier = Some(tier);
            entry.size = size;
            entry.access_count += 1;
            entry.last_access_ms = now;
            policy::push_recent_access(&mut entry.recent_accesses, now, self.config.promotion_window_ms, self.config.max_recent_accesses);

            let state = AccessState {
                size: entry.size,
                access_count: entry.access_count,
                last_access_ms: entry.last_access_ms,
                recent_accesses: entry.recent_accesses.clone(),
            };
            policy::should_auto_promote(tier, &state, &self.config, now)
        };
        if let Some(target) = target {
            self.promote(path, target).await?;
        }
        Ok(())
    }

    pub async fn delete_file(&self, path: &str) -> Result<()> {
        let tier = self.current_tier(path).await?;
        self.store_for(tier)?.delete(path).await?;
        self.tier_map.remove(path);
        Ok(())
    }

    async fn current_tier(&self, path: &str) -> Result<Tier> {
        if let Some(tier) = self.tier_map.get(path).and_then(|s| s.tier) {
            return Ok(tier);
        }
        for tier in [Tier::Warm, Tier::Cold, Tier::Hot] {
            if let Ok(store) = self.store_for(tier) {
                if store.head(path).await? {
                    return Ok(tier);
                }
            }
        }
        Err(Error::not_found(path.to_string()))
    }

    pub async fn move_file(&self, src: &str, dst: &str) -> Result<Tier> {
        let bytes = self.read_file(src).await?;
        let tier = self.write_file(dst, &bytes).await?;
        self.delete_file(src).await?;
        Ok(tier)
    }

    pub async fn copy_file(&self, src: &str, dst: &str, tier: Option<Tier>) -> Result<Tier> {
        let bytes = self.read_file(src).await?;
        match tier {
            Some(tier) => {
                self.store_for(tier)?.put(dst, &bytes).await?;
                self.metadata.set_metadata(dst, tier, bytes.len() as u64).await?;
                Ok(tier)
            }
            None => self.write_file(dst, &bytes).await,
        }
    }

    pub async fn promote(&self, path: &str, to_tier: Tier) -> Result<()> {
        self.migrate(path, to_tier, true).await
    }

    pub async fn demote(&self, path: &str, to_tier: Tier) -> Result<()> {
        if !self.tier_enabled(to_tier) {
            return Err(Error::invalid_argument(format!("tier {to_tier} disabled")));
        }
        self.migrate(path, to_tier, false).await
    }

    async fn migrate(&self, path: &str, to_tier: Tier, is_promotion: bool) -> Result<()> {
        let from_tier = self.current_tier(path).await?;
        if from_tier == to_tier {
            return Ok(());
        }
        let bytes = self.store_for(from_tier)?.get(path).await?.ok_or_else(|| Error::not_found(path.to_string()))?;
        self.store_for(to_tier)?.put(path, &bytes).await?;
        self.store_for(from_tier)?.delete(path).await?;
        self.metadata.set_metadata(path, to_tier, bytes.len() as u64).await?;
        if let Some(mut state) = self.tier_map.get_mut(path) {
            state.tier = Some(to_tier);
        }
        if is_promotion {
            Metrics::bump(&self.metrics.promotions_by_tier, to_tier);
        } else {
            Metrics::bump(&self.metrics.demotions_by_tier, to_tier);
        }
        if let Some(hook) = self.on_tier_migration.lock().as_ref() {
            hook(path, from_tier, to_tier);
        }
        Ok(())
    }

    fn tier_enabled(&self, tier: Tier) -> bool {
        match tier {
            Tier::Hot => true,
            Tier::Warm => self.config.warm_enabled,
            Tier::Cold => self.config.cold_enabled,
        }
    }

    fn evict_tier_map_if_needed(&self) {
        while self.tier_map.len() > self.config.max_cache_size {
            let Some(oldest_key) = self
                .tier_map
                .iter()
                .min_by_key(|e| e.value().last_access_ms)
                .map(|e| e.key().clone())
            else {
                break;
            };
            self.tier_map.remove(&oldest_key);
        }
    }

    fn fire_start(&self, path: &str) {
        if let Some(hook) = self.on_operation_start.lock().as_ref() {
            hook(path);
        }
    }

    fn fire_end(&self, path: &str) {
        if let Some(hook) = self.on_operation_end.lock().as_ref() {
            hook(path);
        }
    }
}

enum StoreRef<'a> {
    Hot(&'a Arc<dyn HotStore>),
    Object(&'a Arc<dyn ObjectStore>),
}

impl StoreRef<'_> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self {
            StoreRef::Hot(s) => s.get(key).await,
            StoreRef::Object(s) => s.get(key).await,
        }
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        match self {
            StoreRef::Hot(s) => s.put(key, bytes).await,
            StoreRef::Object(s) => s.put(key, bytes).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match self {
            StoreRef::Hot(s) => s.delete(key).await,
            StoreRef::Object(s) => s.delete(key).await,
        }
    }

    async fn head(&self, key: &str) -> Result<bool> {
        match self {
            StoreRef::Hot(s) => s.head(key).await,
            StoreRef::Object(s) => s.head(key).await,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::VirtualClock;
    use crate::collaborators::in_memory::InMemoryStore;

    struct NoopMetadataSink;

    #[async_trait]
    impl MetadataSink for NoopMetadataSink {
        async fn set_metadata(&self, _path: &str, _tier: Tier, _size: u64) -> Result<()> {
            Ok(())
        }
    }

    fn engine() -> Arc<TieredPlacementEngine> {
        let hot: Arc<dyn HotStore> = Arc::new(InMemoryStore::default());
        let warm: Arc<dyn ObjectStore> = Arc::new(InMemoryStore::default());
        let cold: Arc<dyn ObjectStore> = Arc::new(InMemoryStore::default());
        TieredPlacementEngine::new(
            hot,
            Some(warm),
            Some(cold),
            Arc::new(NoopMetadataSink),
            TierConfig { hot_max_size: 10, warm_max_size: 1_000_000, ..TierConfig::default() },
            Arc::new(VirtualClock::new(0)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let engine = engine();
        let tier = engine.write_file("/a/b.txt", b"hello").await.unwrap();
        assert_eq!(tier, Tier::Hot);
        assert_eq!(engine.read_file("/a/b.txt").await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn large_write_lands_in_warm() {
        let engine = engine();
        let payload = vec![0u8; 1024];
        let tier = engine.write_file("/x", &payload).await.unwrap();
        assert_eq!(tier, Tier::Warm);
    }
}
