//! Watch bridge (§4.11): wires metadata-store change notifications through
//! the coalescer and batch emitter to subscribed WebSocket connections.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::clock::SharedClock;
use crate::config::{BatchEmitterConfig, CoalescerConfig};
use crate::watch::batch::BatchEmitter;
use crate::watch::coalescer::{Coalescer, EventKind, FsEvent};
use crate::watch::subscription::{ConnectionId, SubscriptionRegistry};

/// Delivers a serialized event to one connection; failures are isolated per
/// connection and never abort the rest of the fan-out (§4.11).
pub trait ConnectionSender: Send + Sync {
    fn send(&self, conn: ConnectionId, payload: String) -> Result<(), String>;
}

pub struct WatchBridge {
    coalescer: Arc<Coalescer>,
    batcher: Arc<BatchEmitter>,
    subscriptions: Arc<SubscriptionRegistry>,
    sender: Mutex<Option<Arc<dyn ConnectionSender>>>,
    dropped_send_failures: std::sync::atomic::AtomicU64,
}

impl WatchBridge {
    pub fn new(
        subscriptions: Arc<SubscriptionRegistry>,
        coalescer_config: CoalescerConfig,
        batch_config: BatchEmitterConfig,
        clock: SharedClock,
    ) -> Arc<Self> {
        let coalescer = Arc::new(Coalescer::new(coalescer_config, clock.clone()));
        let batcher = Arc::new(BatchEmitter::new(batch_config, clock));

        let bridge = Arc::new(Self {
            coalescer: coalescer.clone(),
            batcher: batcher.clone(),
            subscriptions,
            sender: Mutex::new(None),
            dropped_send_failures: std::sync::atomic::AtomicU64::new(0),
        });

        let batcher_for_coalescer = batcher.clone();
        coalescer.on_emit(Arc::new(move |events| batcher_for_coalescer.queue(events)));

        let bridge_for_batch = bridge.clone();
        batcher.on_batch(Arc::new(move |events| bridge_for_batch.dispatch(events)));

        bridge
    }

    pub fn set_sender(&self, sender: Arc<dyn ConnectionSender>) {
        *self.sender.lock() = Some(sender);
    }

    /// Entry point called by the metadata store whenever a file changes.
    pub fn notify(&self, event: FsEvent) {
        self.coalescer.add(event);
    }

    /// Drives the coalescer/batcher timers; call on a periodic tick.
    pub fn tick(&self, now_ms: i64) {
        self.coalescer.tick(now_ms);
        self.batcher.tick(now_ms);
    }

    pub fn flush(&self) {
        self.coalescer.flush();
        self.batcher.flush();
    }

    fn dispatch(&self, events: Vec<FsEvent>) {
        let Some(sender) = self.sender.lock().clone() else { return };
        for event in events {
            let subscribers = self.subscriptions.get_subscribers_for_path(&event.path);
            if subscribers.is_empty() {
                continue;
            }
            let payload = serialize(&event);
            for conn in subscribers {
                if sender.send(conn, payload.clone()).is_err() {
                    self.dropped_send_failures.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
            }
        }
    }

    pub fn dropped_send_failures(&self) -> u64 {
        self.dropped_send_failures.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn get_subscribers_for_path(&self, path: &str) -> Vec<ConnectionId> {
        self.subscriptions.get_subscribers_for_path(path)
    }
}

/// Serializes one [`FsEvent`] as the bit-exact wire event frame of §6:
/// `type` is the bare discriminant (`create`/`modify`/`delete`/`rename`),
/// renames carry `oldPath`, and size/mtime/isDirectory are surfaced only
/// when the event carries metadata.
fn serialize(event: &FsEvent) -> String {
    let (kind, old_path) = match &event.kind {
        EventKind::Create => ("create", None),
        EventKind::Modify => ("modify", None),
        EventKind::Delete => ("delete", None),
        EventKind::Rename { from } => ("rename", Some(from.clone())),
    };
    let mut frame = serde_json::json!({
        "type": kind,
        "path": event.path,
        "timestamp": event.timestamp_ms,
    });
    if let Some(old_path) = old_path {
        frame["oldPath"] = serde_json::Value::String(old_path);
    }
    if let Some(metadata) = &event.metadata {
        if let Some(size) = metadata.size {
            frame["size"] = serde_json::Value::from(size);
        }
        if let Some(mtime) = metadata.mtime {
            frame["mtime"] = serde_json::Value::from(mtime);
        }
        if let Some(is_directory) = metadata.is_directory {
            frame["isDirectory"] = serde_json::Value::from(is_directory);
        }
    }
    frame.to_string()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::VirtualClock;
    use crate::config::SubscriptionConfig;
    use std::sync::Mutex as StdMutex;

    struct RecordingSender {
        received: StdMutex<Vec<(ConnectionId, String)>>,
    }

    impl ConnectionSender for RecordingSender {
        fn send(&self, conn: ConnectionId, payload: String) -> Result<(), String> {
            self.received.lock().unwrap().push((conn, payload));
            Ok(())
        }
    }

    #[test]
    fn notify_reaches_matching_subscriber_after_flush() {
        let clock: SharedClock = Arc::new(VirtualClock::new(0));
        let registry = Arc::new(SubscriptionRegistry::new(SubscriptionConfig::default()));
        registry.subscribe(1, "/a/*", None, &clock).unwrap();

        let bridge = WatchBridge::new(registry, CoalescerConfig::default(), BatchEmitterConfig::default(), clock);
        let sender = Arc::new(RecordingSender { received: StdMutex::new(Vec::new()) });
        bridge.set_sender(sender.clone());

        bridge.notify(FsEvent { path: "/a/b".into(), kind: EventKind::Modify, timestamp_ms: 0, metadata: None });
        bridge.flush();

        let received = sender.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, 1);
    }

    #[test]
    fn serialize_matches_bit_exact_wire_frame() {
        let rename = FsEvent {
            path: "/b".into(),
            kind: EventKind::Rename { from: "/a".into() },
            timestamp_ms: 42,
            metadata: Some(crate::watch::coalescer::FsEventMetadata {
                size: Some(5),
                mtime: Some(42),
                is_directory: Some(false),
            }),
        };
        let frame: serde_json::Value = serde_json::from_str(&serialize(&rename)).unwrap();
        assert_eq!(frame["type"], "rename");
        assert_eq!(frame["path"], "/b");
        assert_eq!(frame["oldPath"], "/a");
        assert_eq!(frame["timestamp"], 42);
        assert_eq!(frame["size"], 5);
        assert_eq!(frame["isDirectory"], false);
    }
}
