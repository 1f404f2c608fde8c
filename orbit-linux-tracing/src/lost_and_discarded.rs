use std::sync::Arc;

use orbit_proto::{LostPerfRecordsEvent, OutOfOrderEventsDiscardedEvent};

use crate::events::{DiscardedPerfEvent, LostPerfEvent, PerfEventVisitor};
use crate::listener::TracerListener;
use crate::stats::TracingStats;

/// Converts the in-band loss markers into their listener events, so that no
/// gap in the capture goes unreported.
pub struct LostAndDiscardedEventVisitor {
    listener: Box<dyn TracerListener>,
    stats: Arc<TracingStats>,
}

impl LostAndDiscardedEventVisitor {
    pub fn new(listener: Box<dyn TracerListener>, stats: Arc<TracingStats>) -> Self {
        LostAndDiscardedEventVisitor { listener, stats }
    }
}

impl PerfEventVisitor for LostAndDiscardedEventVisitor {
    fn visit_lost(&mut self, timestamp: u64, data: &LostPerfEvent) {
        TracingStats::increment(&self.stats.lost_count);
        self.listener.on_lost_perf_records(LostPerfRecordsEvent {
            duration_ns: timestamp.saturating_sub(data.previous_timestamp),
            end_timestamp_ns: timestamp,
        });
    }

    fn visit_discarded(&mut self, timestamp: u64, data: &DiscardedPerfEvent) {
        TracingStats::add(&self.stats.discarded_out_of_order_count, data.count);
        self.listener
            .on_out_of_order_events_discarded(OutOfOrderEventsDiscardedEvent {
                begin_timestamp_ns: data.begin_timestamp_ns,
                end_timestamp_ns: timestamp,
                count: data.count,
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{PerfEvent, PerfEventData, PerfEventOrderedStream};
    use std::sync::Mutex;

    #[derive(Default, Clone)]
    struct Collector {
        lost: Arc<Mutex<Vec<LostPerfRecordsEvent>>>,
        discarded: Arc<Mutex<Vec<OutOfOrderEventsDiscardedEvent>>>,
    }

    impl TracerListener for Collector {
        fn on_lost_perf_records(&mut self, event: LostPerfRecordsEvent) {
            self.lost.lock().unwrap().push(event);
        }

        fn on_out_of_order_events_discarded(&mut self, event: OutOfOrderEventsDiscardedEvent) {
            self.discarded.lock().unwrap().push(event);
        }
    }

    #[test]
    fn lost_event_reports_the_gap() {
        let collector = Collector::default();
        let lost = collector.lost.clone();
        let mut visitor =
            LostAndDiscardedEventVisitor::new(Box::new(collector), Arc::default());

        let event = PerfEvent {
            timestamp: 1500,
            ordered_stream: PerfEventOrderedStream::FileDescriptor(3),
            data: PerfEventData::Lost(LostPerfEvent {
                previous_timestamp: 1000,
            }),
        };
        event.accept(&mut visitor);

        let lost = lost.lock().unwrap();
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].duration_ns, 500);
        assert_eq!(lost[0].end_timestamp_ns, 1500);
    }

    #[test]
    fn discarded_event_reports_range_and_count() {
        let collector = Collector::default();
        let discarded = collector.discarded.clone();
        let mut visitor =
            LostAndDiscardedEventVisitor::new(Box::new(collector), Arc::default());

        let event = PerfEvent {
            timestamp: 900,
            ordered_stream: PerfEventOrderedStream::None,
            data: PerfEventData::Discarded(DiscardedPerfEvent {
                begin_timestamp_ns: 700,
                count: 3,
            }),
        };
        event.accept(&mut visitor);

        let discarded = discarded.lock().unwrap();
        assert_eq!(discarded.len(), 1);
        assert_eq!(discarded[0].begin_timestamp_ns, 700);
        assert_eq!(discarded[0].end_timestamp_ns, 900);
        assert_eq!(discarded[0].count, 3);
    }
}
