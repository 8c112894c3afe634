//! Event coalescer (§4.9): merges rapid-fire per-path events into a single
//! representative event before they reach the batch emitter.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::clock::SharedClock;
use crate::config::CoalescerConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Create,
    Modify,
    Delete,
    Rename { from: String },
}

/// Optional attributes carried alongside a [`FsEvent`] (§3 WatchEvent).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsEventMetadata {
    pub size: Option<i64>,
    pub mtime: Option<i64>,
    pub is_directory: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct FsEvent {
    pub path: String,
    pub kind: EventKind,
    pub timestamp_ms: i64,
    pub metadata: Option<FsEventMetadata>,
}

struct Pending {
    event: FsEvent,
    first_seen_ms: i64,
    last_seen_ms: i64,
}

pub type EmitCallback = Arc<dyn Fn(Vec<FsEvent>) + Send + Sync>;

pub struct Coalescer {
    config: Mutex<CoalescerConfig>,
    pending: Mutex<HashMap<String, Pending>>,
    clock: SharedClock,
    on_emit: Mutex<Option<EmitCallback>>,
}

impl Coalescer {
    pub fn new(config: CoalescerConfig, clock: SharedClock) -> Self {
        Self { config: Mutex::new(config), pending: Mutex::new(HashMap::new()), clock, on_emit: Mutex::new(None) }
    }

    pub fn on_emit(&self, callback: EmitCallback) {
        *self.on_emit.lock() = Some(callback);
    }

    /// Adds or merges `event` into the per-path accumulator, applying the
    /// coalescing rules (§4.9):
    /// - modify + modify → modify
    /// - create + modify → create
    /// - (modify|create) + delete → delete
    /// - rename(A→B) + modify(B) → rename(A→B)
    /// - rename(A→B) + rename(B→C) → rename(A→C)
    /// - rename(A→B) + delete(B) → delete(B)
    pub fn add(&self, event: FsEvent) {
        let now = self.clock.now_ms();
        let mut pending = self.pending.lock();
        let key = event.path.clone();

        // A rename's destination becomes its pending key, so a chain
        // (A→B then B→C) needs the earlier entry looked up by its old
        // key (the incoming `from`) and folded in before keying on C.
        let (incoming, first_seen_ms) = if let EventKind::Rename { from } = &event.kind {
            match pending.remove(from) {
                Some(prior) => (merge(&prior.event, event), prior.first_seen_ms),
                None => (event, now),
            }
        } else {
            (event, now)
        };

        match pending.get_mut(&key) {
            None => {
                pending.insert(key, Pending { event: incoming, first_seen_ms, last_seen_ms: now });
            }
            Some(slot) => {
                slot.event = merge(&slot.event, incoming);
                slot.last_seen_ms = now;
            }
        }
        drop(pending);
        self.maybe_flush_full_batch();
    }

    fn maybe_flush_full_batch(&self) {
        let max = self.config.lock().max_batch_size;
        if self.pending.lock().len() >= max {
            self.flush();
        }
    }

    /// Emits every path whose debounce window or max-wait deadline has
    /// elapsed as of `now_ms`; the bridge drives this from a timer loop.
    pub fn tick(&self, now_ms: i64) {
        let config = self.config.lock().clone();
        let mut due = Vec::new();
        {
            let mut pending = self.pending.lock();
            pending.retain(|_, slot| {
                let debounce_elapsed = now_ms - slot.last_seen_ms >= config.debounce_ms;
                let max_wait_elapsed = now_ms - slot.first_seen_ms >= config.max_wait_ms;
                if debounce_elapsed || max_wait_elapsed {
                    due.push(slot.event.clone());
                    false
                } else {
                    true
                }
            });
        }
        if !due.is_empty() {
            self.emit(due);
        }
    }

    /// Forces every pending event out immediately, regardless of timers.
    pub fn flush(&self) -> Vec<FsEvent> {
        let events: Vec<FsEvent> = self.pending.lock().drain().map(|(_, slot)| slot.event).collect();
        if !events.is_empty() {
            self.emit(events.clone());
        }
        events
    }

    fn emit(&self, events: Vec<FsEvent>) {
        if let Some(cb) = self.on_emit.lock().as_ref() {
            cb(events);
        }
    }

    pub fn get_pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn get_debounce_ms(&self) -> i64 {
        self.config.lock().debounce_ms
    }

    pub fn set_debounce_ms(&self, debounce_ms: i64) {
        self.config.lock().debounce_ms = debounce_ms;
    }

    /// Drops all pending state without emitting (connection/fs torn down).
    pub fn dispose(&self) {
        self.pending.lock().clear();
        *self.on_emit.lock() = None;
    }
}

pub(crate) fn merge(existing: &FsEvent, incoming: FsEvent) -> FsEvent {
    let kind = match (&existing.kind, &incoming.kind) {
        (EventKind::Modify, EventKind::Modify) => EventKind::Modify,
        (EventKind::Create, EventKind::Modify) => EventKind::Create,
        (EventKind::Modify, EventKind::Delete) | (EventKind::Create, EventKind::Delete) => EventKind::Delete,
        (EventKind::Rename { from }, EventKind::Modify) => EventKind::Rename { from: from.clone() },
        (EventKind::Rename { from }, EventKind::Rename { .. }) => EventKind::Rename { from: from.clone() },
        (EventKind::Rename { .. }, EventKind::Delete) => EventKind::Delete,
        (EventKind::Delete, EventKind::Modify) | (EventKind::Delete, EventKind::Create) => EventKind::Delete,
        (_, incoming_kind) => incoming_kind.clone(),
    };
    // Latest metadata wins (§4.9 "create + modify → create (latest metadata wins)").
    let metadata = incoming.metadata.or_else(|| existing.metadata.clone());
    FsEvent { path: incoming.path, kind, timestamp_ms: incoming.timestamp_ms, metadata }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::VirtualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(path: &str, kind: EventKind) -> FsEvent {
        FsEvent { path: path.to_string(), kind, timestamp_ms: 0, metadata: None }
    }

    #[test]
    fn modify_then_modify_coalesces_to_modify() {
        let coalescer = Coalescer::new(CoalescerConfig::default(), Arc::new(VirtualClock::new(0)));
        coalescer.add(event("/a", EventKind::Modify));
        coalescer.add(event("/a", EventKind::Modify));
        let flushed = coalescer.flush();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].kind, EventKind::Modify);
    }

    #[test]
    fn create_then_delete_coalesces_to_delete() {
        let coalescer = Coalescer::new(CoalescerConfig::default(), Arc::new(VirtualClock::new(0)));
        coalescer.add(event("/a", EventKind::Create));
        coalescer.add(event("/a", EventKind::Delete));
        let flushed = coalescer.flush();
        assert_eq!(flushed[0].kind, EventKind::Delete);
    }

    #[test]
    fn rename_chain_collapses_to_single_rename() {
        let coalescer = Coalescer::new(CoalescerConfig::default(), Arc::new(VirtualClock::new(0)));
        coalescer.add(event("/b", EventKind::Rename { from: "/a".into() }));
        coalescer.add(event("/c", EventKind::Rename { from: "/b".into() }));
        let flushed = coalescer.flush();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].path, "/c");
        assert_eq!(flushed[0].kind, EventKind::Rename { from: "/a".into() });
    }

    #[test]
    fn tick_emits_after_debounce_elapses() {
        let clock = Arc::new(VirtualClock::new(0));
        let coalescer = Coalescer::new(CoalescerConfig { debounce_ms: 50, max_wait_ms: 1000, max_batch_size: 1000 }, clock);
        let emitted = Arc::new(AtomicUsize::new(0));
        let emitted_clone = emitted.clone();
        coalescer.on_emit(Arc::new(move |events| emitted_clone.fetch_add(events.len(), Ordering::SeqCst)));
        coalescer.add(event("/a", EventKind::Modify));
        coalescer.tick(10);
        assert_eq!(emitted.load(Ordering::SeqCst), 0);
        coalescer.tick(60);
        assert_eq!(emitted.load(Ordering::SeqCst), 1);
    }
}
