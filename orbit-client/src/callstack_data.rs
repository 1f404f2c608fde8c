use orbit_proto::{Callstack, CallstackEvent};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// The unique callstacks of a capture plus the per-sample events referencing
/// them. Events only enter once their callstack is interned, so every
/// `callstack_id` in `events` resolves.
///
/// Mutated by the event-processor thread; the mutex gives concurrent readers
/// coarse-grained snapshots while the capture is still running.
#[derive(Debug, Default)]
pub struct CallstackData {
    inner: Mutex<CallstackDataInner>,
}

#[derive(Debug, Default)]
struct CallstackDataInner {
    unique_callstacks: FxHashMap<u64, Callstack>,
    // Append-only, in arrival (timestamp) order.
    events: Vec<CallstackEvent>,
}

impl CallstackData {
    pub fn add_unique_callstack(&self, callstack_id: u64, callstack: Callstack) {
        self.inner
            .lock()
            .unique_callstacks
            .entry(callstack_id)
            .or_insert(callstack);
    }

    /// False (and the event dropped) when the callstack was never interned;
    /// the producer protocol makes that a stream bug worth reporting.
    pub fn add_callstack_event(&self, event: CallstackEvent) -> bool {
        let mut inner = self.inner.lock();
        if !inner.unique_callstacks.contains_key(&event.callstack_id) {
            log::error!(
                "callstack event references unknown callstack id {}",
                event.callstack_id
            );
            return false;
        }
        inner.events.push(event);
        true
    }

    pub fn has_callstack(&self, callstack_id: u64) -> bool {
        self.inner.lock().unique_callstacks.contains_key(&callstack_id)
    }

    pub fn callstack_count(&self) -> usize {
        self.inner.lock().unique_callstacks.len()
    }

    pub fn event_count(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn unique_callstacks_copy(&self) -> FxHashMap<u64, Callstack> {
        self.inner.lock().unique_callstacks.clone()
    }

    pub fn events_copy(&self) -> Vec<CallstackEvent> {
        self.inner.lock().events.clone()
    }

    pub fn for_each_unique_callstack(&self, mut visit: impl FnMut(u64, &Callstack)) {
        let inner = self.inner.lock();
        for (&callstack_id, callstack) in &inner.unique_callstacks {
            visit(callstack_id, callstack);
        }
    }

    pub fn for_each_callstack_event(&self, mut visit: impl FnMut(&CallstackEvent)) {
        let inner = self.inner.lock();
        for event in &inner.events {
            visit(event);
        }
    }
}
