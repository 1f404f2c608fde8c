//! Global ordering of events coming from multiple ring buffers.
//!
//! Each ring delivers events in timestamp order (that is what "ordered
//! stream" means), but different rings progress at different speeds. The
//! queue keeps one FIFO per stream and merges across streams with a min-heap
//! keyed by the front timestamp. Events without a stream are only ordered by
//! timestamp and live in their own heap.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};

use rustc_hash::FxHashMap;

use crate::events::{
    DiscardedPerfEvent, PerfEvent, PerfEventData, PerfEventOrderedStream, PerfEventVisitor,
};

struct StreamlessEvent(PerfEvent);

impl PartialEq for StreamlessEvent {
    fn eq(&self, other: &Self) -> bool {
        self.0.timestamp == other.0.timestamp
    }
}

impl Eq for StreamlessEvent {}

impl PartialOrd for StreamlessEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StreamlessEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.timestamp.cmp(&other.0.timestamp)
    }
}

/// Multi-stream priority queue of [`PerfEvent`]s.
#[derive(Default)]
pub struct PerfEventQueue {
    stream_queues: FxHashMap<PerfEventOrderedStream, VecDeque<PerfEvent>>,
    // (front timestamp, stream). Entries can be stale after a pop; they are
    // validated against the queue front when they surface.
    stream_heap: BinaryHeap<Reverse<(u64, PerfEventOrderedStream)>>,
    streamless_heap: BinaryHeap<Reverse<StreamlessEvent>>,
}

impl PerfEventQueue {
    pub fn push(&mut self, event: PerfEvent) {
        match event.ordered_stream {
            PerfEventOrderedStream::None => {
                self.streamless_heap.push(Reverse(StreamlessEvent(event)));
            }
            stream => {
                let queue = self.stream_queues.entry(stream).or_default();
                if let Some(back) = queue.back() {
                    debug_assert!(
                        back.timestamp <= event.timestamp,
                        "per-stream order violated on {stream:?}"
                    );
                }
                if queue.is_empty() {
                    self.stream_heap.push(Reverse((event.timestamp, stream)));
                }
                queue.push_back(event);
            }
        }
    }

    fn front_of_streams(&mut self) -> Option<u64> {
        while let Some(&Reverse((timestamp, stream))) = self.stream_heap.peek() {
            match self.stream_queues.get(&stream).and_then(|q| q.front()) {
                Some(front) if front.timestamp == timestamp => return Some(timestamp),
                Some(front) => {
                    // Stale entry; reinsert with the current front.
                    let front_timestamp = front.timestamp;
                    self.stream_heap.pop();
                    self.stream_heap.push(Reverse((front_timestamp, stream)));
                }
                None => {
                    self.stream_heap.pop();
                }
            }
        }
        None
    }

    pub fn top_timestamp(&mut self) -> Option<u64> {
        let stream_front = self.front_of_streams();
        let streamless_front = self.streamless_heap.peek().map(|e| e.0 .0.timestamp);
        match (stream_front, streamless_front) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    pub fn pop(&mut self) -> Option<PerfEvent> {
        let stream_front = self.front_of_streams();
        let streamless_front = self.streamless_heap.peek().map(|e| e.0 .0.timestamp);
        match (stream_front, streamless_front) {
            (Some(stream_ts), Some(streamless_ts)) if streamless_ts < stream_ts => {
                Some(self.streamless_heap.pop()?.0 .0)
            }
            (Some(_), _) => {
                let Reverse((_, stream)) = self.stream_heap.pop()?;
                let queue = self.stream_queues.get_mut(&stream)?;
                let event = queue.pop_front()?;
                if let Some(front) = queue.front() {
                    self.stream_heap.push(Reverse((front.timestamp, stream)));
                }
                Some(event)
            }
            (None, Some(_)) => Some(self.streamless_heap.pop()?.0 .0),
            (None, None) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.streamless_heap.is_empty() && self.stream_queues.values().all(|q| q.is_empty())
    }
}

/// Default visibility delay: an event is only processed once it is this much
/// older than the newest knowledge of time, giving slower ring buffers a
/// chance to deliver earlier events first.
pub const DEFAULT_PROCESSING_DELAY_NS: u64 = 10_000_000;

/// Merges events from all ring buffers into one totally-ordered dispatch to
/// the registered visitors.
pub struct PerfEventProcessor {
    queue: PerfEventQueue,
    visitors: Vec<Box<dyn PerfEventVisitor + Send>>,
    processing_delay_ns: u64,
    last_processed_timestamp_ns: u64,
    // Out-of-order events discarded since the last flush: (begin, end, count).
    pending_discards: Option<(u64, u64, u64)>,
}

impl PerfEventProcessor {
    pub fn new(processing_delay_ns: u64) -> Self {
        PerfEventProcessor {
            queue: PerfEventQueue::default(),
            visitors: Vec::new(),
            processing_delay_ns,
            last_processed_timestamp_ns: 0,
            pending_discards: None,
        }
    }

    pub fn add_visitor(&mut self, visitor: Box<dyn PerfEventVisitor + Send>) {
        self.visitors.push(visitor);
    }

    pub fn last_processed_timestamp_ns(&self) -> u64 {
        self.last_processed_timestamp_ns
    }

    /// Accepts an event from a reader thread. Events that can no longer be
    /// ordered are dropped here and accounted for; they are never silently
    /// discarded.
    pub fn add_event(&mut self, event: PerfEvent) {
        if event.timestamp < self.last_processed_timestamp_ns {
            let (begin, end, count) = self.pending_discards.take().unwrap_or((
                event.timestamp,
                event.timestamp,
                0,
            ));
            self.pending_discards = Some((
                begin.min(event.timestamp),
                end.max(event.timestamp),
                count + 1,
            ));
            return;
        }
        self.queue.push(event);
    }

    /// Processes all events older than `now_ns` minus the visibility delay.
    pub fn process_old_events(&mut self, now_ns: u64) {
        let horizon = now_ns.saturating_sub(self.processing_delay_ns);
        while let Some(timestamp) = self.queue.top_timestamp() {
            if timestamp >= horizon {
                break;
            }
            let event = self.queue.pop().expect("top_timestamp implies an event");
            self.dispatch(event);
        }
        self.flush_pending_discards();
    }

    /// Processes everything still queued, regardless of the delay. Called on
    /// capture stop.
    pub fn process_all_events(&mut self) {
        while let Some(event) = self.queue.pop() {
            self.dispatch(event);
        }
        self.flush_pending_discards();
    }

    /// Tells every visitor that no further events will arrive.
    pub fn notify_capture_finished(&mut self, timestamp_ns: u64) {
        for visitor in &mut self.visitors {
            visitor.visit_capture_finished(timestamp_ns);
        }
    }

    fn dispatch(&mut self, event: PerfEvent) {
        debug_assert!(event.timestamp >= self.last_processed_timestamp_ns);
        self.last_processed_timestamp_ns = event.timestamp;
        for visitor in &mut self.visitors {
            event.accept(visitor.as_mut());
        }
    }

    fn flush_pending_discards(&mut self) {
        let Some((begin, end, count)) = self.pending_discards.take() else {
            return;
        };
        log::warn!("discarded {count} event(s) out of order in [{begin}, {end}]");
        let marker = PerfEvent {
            timestamp: end,
            ordered_stream: PerfEventOrderedStream::None,
            data: PerfEventData::Discarded(DiscardedPerfEvent {
                begin_timestamp_ns: begin,
                count,
            }),
        };
        for visitor in &mut self.visitors {
            marker.accept(visitor.as_mut());
        }
    }
}
