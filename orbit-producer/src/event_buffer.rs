use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;
use orbit_proto::CaptureEvent;

/// The bounded lock-free buffer between the instrumented application's
/// threads and the transmit thread. Enqueueing is wait-free: when the buffer
/// is full the oldest event is displaced and counted, never the caller
/// blocked.
pub struct EventBuffer {
    queue: ArrayQueue<CaptureEvent>,
    lost_events: AtomicU64,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        EventBuffer {
            queue: ArrayQueue::new(capacity),
            lost_events: AtomicU64::new(0),
        }
    }

    pub fn push(&self, event: CaptureEvent) {
        if self.queue.force_push(event).is_some() {
            self.lost_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Pops up to `max` events in the order they were enqueued.
    pub fn drain(&self, max: usize) -> Vec<CaptureEvent> {
        let mut events = Vec::new();
        while events.len() < max {
            match self.queue.pop() {
                Some(event) => events.push(event),
                None => break,
            }
        }
        events
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of events dropped since the last call; reported with the next
    /// successful send.
    pub fn take_lost_events(&self) -> u64 {
        self.lost_events.swap(0, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_proto::{capture_event, FunctionExit};

    fn event(timestamp_ns: u64) -> CaptureEvent {
        capture_event::Event::FunctionExit(FunctionExit {
            pid: 1,
            tid: 1,
            timestamp_ns,
        })
        .into()
    }

    fn timestamp_of(event: &CaptureEvent) -> u64 {
        event.timestamp_ns().unwrap()
    }

    #[test]
    fn drains_in_enqueue_order() {
        let buffer = EventBuffer::new(8);
        for timestamp in 1..=5 {
            buffer.push(event(timestamp));
        }
        let drained = buffer.drain(usize::MAX);
        let timestamps: Vec<u64> = drained.iter().map(timestamp_of).collect();
        assert_eq!(timestamps, vec![1, 2, 3, 4, 5]);
        assert_eq!(buffer.take_lost_events(), 0);
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let buffer = EventBuffer::new(4);
        for timestamp in 1..=6 {
            buffer.push(event(timestamp));
        }
        assert_eq!(buffer.take_lost_events(), 2);
        let timestamps: Vec<u64> = buffer.drain(usize::MAX).iter().map(timestamp_of).collect();
        assert_eq!(timestamps, vec![3, 4, 5, 6]);
    }

    #[test]
    fn drain_respects_the_batch_limit() {
        let buffer = EventBuffer::new(8);
        for timestamp in 1..=6 {
            buffer.push(event(timestamp));
        }
        assert_eq!(buffer.drain(4).len(), 4);
        assert_eq!(buffer.drain(4).len(), 2);
        assert!(buffer.is_empty());
    }
}
