//! Batch emitter (§4.10): groups coalesced events into fixed windows before
//! handing them to the subscription bridge, with optional compression and
//! priority ordering.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::clock::SharedClock;
use crate::config::BatchEmitterConfig;
use crate::watch::coalescer::{EventKind, FsEvent};

#[derive(Debug, Default, Clone)]
pub struct BatchMetrics {
    pub events_received: u64,
    pub events_emitted: u64,
    pub batches_emitted: u64,
    pub average_batch_size: f64,
    pub average_latency_ms: f64,
    pub compression_ratio: f64,
}

pub type BatchCallback = Arc<dyn Fn(Vec<FsEvent>) + Send + Sync>;

struct Window {
    events: Vec<FsEvent>,
    opened_at_ms: i64,
}

pub struct BatchEmitter {
    config: BatchEmitterConfig,
    clock: SharedClock,
    window: Mutex<Option<Window>>,
    callback: Mutex<Option<BatchCallback>>,
    events_received: AtomicU64,
    events_emitted: AtomicU64,
    batches_emitted: AtomicU64,
    latency_sum_ms: AtomicU64,
    batch_size_sum: AtomicU64,
    raw_events_before_compression: AtomicU64,
}

impl BatchEmitter {
    pub fn new(config: BatchEmitterConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            window: Mutex::new(None),
            callback: Mutex::new(None),
            events_received: AtomicU64::new(0),
            events_emitted: AtomicU64::new(0),
            batches_emitted: AtomicU64::new(0),
            latency_sum_ms: AtomicU64::new(0),
            batch_size_sum: AtomicU64::new(0),
            raw_events_before_compression: AtomicU64::new(0),
        }
    }

    pub fn on_batch(&self, callback: BatchCallback) {
        *self.callback.lock() = Some(callback);
    }

    /// Queues `events`, opening a new window if none is active, and flushing
    /// immediately once `max_batch_size` is reached.
    pub fn queue(&self, events: Vec<FsEvent>) {
        if events.is_empty() {
            return;
        }
        self.events_received.fetch_add(events.len() as u64, Ordering::Relaxed);
        let now = self.clock.now_ms();
        let mut window = self.window.lock();
        let w = window.get_or_insert_with(|| Window { events: Vec::new(), opened_at_ms: now });
        w.events.extend(events);
        let full = w.events.len() >= self.config.max_batch_size;
        drop(window);
        if full {
            self.flush();
        }
    }

    /// Called periodically by the driving loop; flushes the open window once
    /// `batch_window_ms` has elapsed since it opened.
    pub fn tick(&self, now_ms: i64) {
        let should_flush = self
            .window
            .lock()
            .as_ref()
            .map(|w| now_ms - w.opened_at_ms >= self.config.batch_window_ms)
            .unwrap_or(false);
        if should_flush {
            self.flush();
        }
    }

    pub fn flush(&self) {
        let Some(window) = self.window.lock().take() else { return };
        if window.events.is_empty() {
            return;
        }
        let raw_count = window.events.len();
        self.raw_events_before_compression.fetch_add(raw_count as u64, Ordering::Relaxed);

        let mut events = window.events;
        if self.config.compress_events {
            events = compress(events);
        }
        if self.config.prioritize_events {
            prioritize(&mut events);
        }

        self.events_emitted.fetch_add(events.len() as u64, Ordering::Relaxed);
        self.batches_emitted.fetch_add(1, Ordering::Relaxed);
        self.batch_size_sum.fetch_add(events.len() as u64, Ordering::Relaxed);
        let latency_ms = (self.clock.now_ms() - window.opened_at_ms).max(0) as u64;
        self.latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);

        if let Some(cb) = self.callback.lock().as_ref() {
            cb(events);
        }
    }

    pub fn metrics(&self) -> BatchMetrics {
        let batches = self.batches_emitted.load(Ordering::Relaxed);
        let emitted = self.events_emitted.load(Ordering::Relaxed);
        let raw = self.raw_events_before_compression.load(Ordering::Relaxed);
        BatchMetrics {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_emitted: emitted,
            batches_emitted: batches,
            average_batch_size: if batches > 0 { self.batch_size_sum.load(Ordering::Relaxed) as f64 / batches as f64 } else { 0.0 },
            average_latency_ms: if batches > 0 { self.latency_sum_ms.load(Ordering::Relaxed) as f64 / batches as f64 } else { 0.0 },
            compression_ratio: if raw > 0 { emitted as f64 / raw as f64 } else { 1.0 },
        }
    }
}

/// Folds duplicate-path events within a single batch through the same
/// coalescing rules the coalescer applies (§4.9), so e.g. a queued
/// `[Create, Modify]` pair for one path compresses to `Create`, not a
/// last-write-wins `Modify` (§4.10 "compressEvents").
fn compress(events: Vec<FsEvent>) -> Vec<FsEvent> {
    let mut order: Vec<String> = Vec::new();
    let mut by_path: std::collections::HashMap<String, FsEvent> = std::collections::HashMap::new();
    for event in events {
        let path = event.path.clone();
        match by_path.remove(&path) {
            Some(existing) => {
                by_path.insert(path, crate::watch::coalescer::merge(&existing, event));
            }
            None => {
                order.push(path.clone());
                by_path.insert(path, event);
            }
        }
    }
    order.into_iter().filter_map(|path| by_path.remove(&path)).collect()
}

/// Stable sort: delete > rename > create > modify (§4.10 "prioritizeEvents").
fn prioritize(events: &mut [FsEvent]) {
    events.sort_by_key(priority_rank);
}

fn priority_rank(event: &FsEvent) -> u8 {
    match event.kind {
        EventKind::Delete => 0,
        EventKind::Rename { .. } => 1,
        EventKind::Create => 2,
        EventKind::Modify => 3,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::VirtualClock;
    use std::sync::atomic::AtomicUsize;

    fn event(path: &str, kind: EventKind) -> FsEvent {
        FsEvent { path: path.to_string(), kind, timestamp_ms: 0, metadata: None }
    }

    #[test]
    fn flushes_when_batch_size_reached() {
        let clock = Arc::new(VirtualClock::new(0));
        let emitter = BatchEmitter::new(BatchEmitterConfig { max_batch_size: 2, ..BatchEmitterConfig::default() }, clock);
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        emitter.on_batch(Arc::new(move |events| count_clone.fetch_add(events.len(), Ordering::SeqCst)));
        emitter.queue(vec![event("/a", EventKind::Modify)]);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        emitter.queue(vec![event("/b", EventKind::Modify)]);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn prioritize_puts_delete_first() {
        let mut events = vec![event("/a", EventKind::Modify), event("/b", EventKind::Delete)];
        prioritize(&mut events);
        assert_eq!(events[0].kind, EventKind::Delete);
    }

    #[test]
    fn compress_keeps_latest_per_path() {
        let events = vec![event("/a", EventKind::Create), event("/a", EventKind::Modify)];
        let compressed = compress(events);
        assert_eq!(compressed.len(), 1);
        assert_eq!(compressed[0].kind, EventKind::Create);
    }

    #[test]
    fn compress_applies_coalescing_rules_not_last_write_wins() {
        let events = vec![event("/a", EventKind::Modify), event("/a", EventKind::Delete)];
        let compressed = compress(events);
        assert_eq!(compressed.len(), 1);
        assert_eq!(compressed[0].kind, EventKind::Delete);
    }
}
