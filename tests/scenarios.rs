//! Cross-module scenario tests (§8 S1-S7): each exercises the public API the
//! way an embedding binary would, across the boundary of two or more
//! components rather than a single unit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::SqlitePool;

use fsx::clock::{SharedClock, VirtualClock};
use fsx::collaborators::{HotStore, ObjectStore};
use fsx::config::{BatchEmitterConfig, CoalescerConfig, Config, SubscriptionConfig, Tier, TierConfig, TransactionConfig};
use fsx::metadata::transaction::{TransactionManager, TransactionOptions};
use fsx::metadata::{MetadataStore, NewBlob};
use fsx::tier::{MetadataSink, TieredPlacementEngine};
use fsx::watch::batch::BatchEmitter;
use fsx::watch::bridge::{ConnectionSender, WatchBridge};
use fsx::watch::coalescer::{Coalescer, EventKind, FsEvent};
use fsx::watch::subscription::SubscriptionRegistry;

#[derive(Default)]
struct MemStore {
    data: DashMap<String, Vec<u8>>,
}

#[async_trait]
impl HotStore for MemStore {
    async fn get(&self, path: &str) -> fsx::Result<Option<Vec<u8>>> {
        Ok(self.data.get(path).map(|v| v.clone()))
    }
    async fn put(&self, path: &str, bytes: &[u8]) -> fsx::Result<()> {
        self.data.insert(path.to_string(), bytes.to_vec());
        Ok(())
    }
    async fn delete(&self, path: &str) -> fsx::Result<()> {
        self.data.remove(path);
        Ok(())
    }
    async fn head(&self, path: &str) -> fsx::Result<bool> {
        Ok(self.data.contains_key(path))
    }
}

#[async_trait]
impl ObjectStore for MemStore {
    async fn get(&self, key: &str) -> fsx::Result<Option<Vec<u8>>> {
        HotStore::get(self, key).await
    }
    async fn put(&self, key: &str, bytes: &[u8]) -> fsx::Result<()> {
        HotStore::put(self, key, bytes).await
    }
    async fn delete(&self, key: &str) -> fsx::Result<()> {
        HotStore::delete(self, key).await
    }
    async fn head(&self, key: &str) -> fsx::Result<bool> {
        HotStore::head(self, key).await
    }
}

struct NoopSink;

#[async_trait]
impl MetadataSink for NoopSink {
    async fn set_metadata(&self, _path: &str, _tier: Tier, _size: u64) -> fsx::Result<()> {
        Ok(())
    }
}

fn engine(tier_config: TierConfig, clock: SharedClock) -> Arc<TieredPlacementEngine> {
    let hot: Arc<dyn HotStore> = Arc::new(MemStore::default());
    let warm: Arc<dyn ObjectStore> = Arc::new(MemStore::default());
    let cold: Arc<dyn ObjectStore> = Arc::new(MemStore::default());
    TieredPlacementEngine::new(hot, Some(warm), Some(cold), Arc::new(NoopSink), tier_config, clock).unwrap()
}

async fn metadata_store() -> MetadataStore {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let store = MetadataStore::new(pool, TransactionConfig::default(), Arc::new(VirtualClock::new(1_000)));
    store.init().await.unwrap();
    store
}

/// S1 — basic write/read round-trip.
#[tokio::test]
async fn s1_write_read_round_trip() {
    let config = Config::default();
    let clock: SharedClock = Arc::new(VirtualClock::new(0));
    let engine = engine(config.tier, clock);

    let tier = engine.write_file("/a/b.txt", b"hello").await.unwrap();
    assert_eq!(tier, Tier::Hot);
    assert_eq!(engine.read_file("/a/b.txt").await.unwrap(), b"hello");
}

/// S2 — tier promotion under on-access. The file starts small enough for
/// hot, gets explicitly pushed down to warm (the way a demotion sweep
/// would), then earns its way back after crossing the access threshold.
#[tokio::test]
async fn s2_promotes_on_access_threshold() {
    let vclock = VirtualClock::new(0);
    let clock: SharedClock = Arc::new(vclock.clone());
    let tier_config = TierConfig {
        hot_max_size: 10_000,
        warm_max_size: 1_000_000,
        promotion_policy: fsx::config::PromotionPolicy::OnAccess,
        promotion_access_threshold: 3,
        promotion_window_ms: 60_000,
        ..TierConfig::default()
    };
    let engine = engine(tier_config, clock);

    let payload = vec![0u8; 1024];
    let tier = engine.write_file("/x", &payload).await.unwrap();
    assert_eq!(tier, Tier::Hot);
    engine.demote("/x", Tier::Warm).await.unwrap();

    for _ in 0..3 {
        vclock.advance(std::time::Duration::from_millis(100));
        engine.read_file("/x").await.unwrap();
    }

    assert_eq!(engine.metrics.snapshot().promotions_by_tier.iter().map(|(_, n)| n).sum::<u64>(), 1);
    assert_eq!(engine.read_file("/x").await.unwrap(), payload);
}

/// S3 — coalescing + priority.
#[test]
fn s3_coalesce_then_prioritize() {
    let clock: SharedClock = Arc::new(VirtualClock::new(0));
    let coalescer = Coalescer::new(CoalescerConfig { debounce_ms: 50, max_batch_size: 1000, max_wait_ms: 1000 }, clock.clone());
    let batcher = Arc::new(BatchEmitter::new(BatchEmitterConfig { prioritize_events: true, ..BatchEmitterConfig::default() }, clock.clone()));

    let emitted = Arc::new(StdMutex::new(Vec::new()));
    let emitted_clone = emitted.clone();
    let batcher_for_coalescer = batcher.clone();
    coalescer.on_emit(Arc::new(move |events| batcher_for_coalescer.queue(events)));
    batcher.on_batch(Arc::new(move |events| emitted_clone.lock().unwrap().extend(events)));

    let event = |path: &str, kind: EventKind| FsEvent { path: path.to_string(), kind, timestamp_ms: 0, metadata: None };
    coalescer.add(event("/f", EventKind::Modify));
    coalescer.add(event("/f", EventKind::Modify));
    coalescer.add(event("/f", EventKind::Delete));
    coalescer.add(event("/g", EventKind::Create));
    coalescer.add(event("/h", EventKind::Modify));

    coalescer.tick(60);
    batcher.tick(60);
    batcher.flush();

    let batch = emitted.lock().unwrap();
    assert_eq!(batch.len(), 3);
    assert_eq!(batch[0].path, "/f");
    assert_eq!(batch[0].kind, EventKind::Delete);
    assert_eq!(batch[1].path, "/g");
    assert_eq!(batch[1].kind, EventKind::Create);
    assert_eq!(batch[2].path, "/h");
    assert_eq!(batch[2].kind, EventKind::Modify);
}

/// S4 — rename chain coalescing.
#[test]
fn s4_rename_chain_collapses() {
    let clock: SharedClock = Arc::new(VirtualClock::new(0));
    let coalescer = Coalescer::new(CoalescerConfig::default(), clock);
    coalescer.add(FsEvent { path: "/b".into(), kind: EventKind::Rename { from: "/a".into() }, timestamp_ms: 0, metadata: None });
    coalescer.add(FsEvent { path: "/c".into(), kind: EventKind::Rename { from: "/b".into() }, timestamp_ms: 0, metadata: None });

    let flushed = coalescer.flush();
    assert_eq!(flushed.len(), 1);
    assert_eq!(flushed[0].path, "/c");
    assert_eq!(flushed[0].kind, EventKind::Rename { from: "/a".into() });
}

/// S5 — blob refcount lifecycle.
#[tokio::test]
async fn s5_refcount_lifecycle() {
    let store = metadata_store().await;
    store.register_blob(NewBlob { id: "X".into(), tier: Tier::Hot, size: 5, checksum: None }).await.unwrap();
    assert_eq!(store.get_blob_ref_count("X").await.unwrap(), 1);

    store.increment_blob_ref_count("X").await.unwrap();
    assert_eq!(store.get_blob_ref_count("X").await.unwrap(), 2);

    assert!(!store.decrement_blob_ref_count("X").await.unwrap());
    assert_eq!(store.get_blob_ref_count("X").await.unwrap(), 1);

    assert!(store.decrement_blob_ref_count("X").await.unwrap());
    assert_eq!(store.get_blob_ref_count("X").await.unwrap(), 0);
}

/// S6 — subscription fan-out with pattern match.
#[tokio::test]
async fn s6_fan_out_matches_patterns() {
    let clock: SharedClock = Arc::new(VirtualClock::new(0));
    let registry = Arc::new(SubscriptionRegistry::new(SubscriptionConfig::default()));
    registry.subscribe(1, "/home/**", None, &clock).unwrap();
    registry.subscribe(2, "/home/user/*", None, &clock).unwrap();
    registry.subscribe(3, "/var/**", None, &clock).unwrap();

    struct RecordingSender {
        received: StdMutex<Vec<u64>>,
    }
    impl ConnectionSender for RecordingSender {
        fn send(&self, conn: u64, _payload: String) -> Result<(), String> {
            self.received.lock().unwrap().push(conn);
            Ok(())
        }
    }

    let bridge = WatchBridge::new(registry, CoalescerConfig::default(), BatchEmitterConfig::default(), clock);
    let sender = Arc::new(RecordingSender { received: StdMutex::new(Vec::new()) });
    bridge.set_sender(sender.clone());

    bridge.notify(FsEvent { path: "/home/user/file.txt".into(), kind: EventKind::Modify, timestamp_ms: 0, metadata: None });
    bridge.flush();

    let mut received = sender.received.lock().unwrap().clone();
    received.sort();
    assert_eq!(received, vec![1, 2]);
}

/// S7 — transaction retry.
#[tokio::test]
async fn s7_transaction_retries_then_succeeds() {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let clock: SharedClock = Arc::new(VirtualClock::new(0));
    let manager = TransactionManager::new(pool, TransactionConfig::default(), clock);

    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_clone = attempts.clone();
    let result = manager
        .transaction(
            TransactionOptions { max_retries: 3, retry_delay_ms: 0, ..TransactionOptions::default() },
            move || {
                let attempts = attempts_clone.clone();
                async move {
                    let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                    if attempt < 2 {
                        Err(fsx::Error::Transient { reason: "backend busy".into() })
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await
        .unwrap();

    assert_eq!(result, 42);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let log = manager.get_transaction_log();
    assert_eq!(log.len(), 3);
    assert_eq!(log[2].retry_count, 2);
}
