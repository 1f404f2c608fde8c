use orbit_proto::{TracepointEvent, TracepointInfo};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// Events of the tracepoints the user selected for the capture, grouped per
/// thread and kept sorted by timestamp within each thread.
#[derive(Debug, Default)]
pub struct TracepointData {
    inner: Mutex<TracepointDataInner>,
}

#[derive(Debug, Default)]
struct TracepointDataInner {
    tracepoint_infos: FxHashMap<u64, TracepointInfo>,
    events_per_tid: FxHashMap<i32, Vec<TracepointEvent>>,
    num_total_events: u64,
}

impl TracepointData {
    pub fn add_tracepoint_info(&self, key: u64, info: TracepointInfo) {
        self.inner.lock().tracepoint_infos.entry(key).or_insert(info);
    }

    pub fn has_tracepoint_info(&self, key: u64) -> bool {
        self.inner.lock().tracepoint_infos.contains_key(&key)
    }

    pub fn add_tracepoint_event(&self, event: TracepointEvent) -> bool {
        let mut inner = self.inner.lock();
        if !inner.tracepoint_infos.contains_key(&event.tracepoint_info_key) {
            log::error!(
                "tracepoint event references unknown info key {}",
                event.tracepoint_info_key
            );
            return false;
        }
        inner.num_total_events += 1;
        let events = inner.events_per_tid.entry(event.tid).or_default();
        // Cross-thread arrival can be out of order, per-thread it mostly is
        // in order, so the insertion point is almost always the end.
        let position = events.partition_point(|e| e.timestamp_ns <= event.timestamp_ns);
        events.insert(position, event);
        true
    }

    pub fn num_total_events(&self) -> u64 {
        self.inner.lock().num_total_events
    }

    pub fn tracepoint_infos_copy(&self) -> FxHashMap<u64, TracepointInfo> {
        self.inner.lock().tracepoint_infos.clone()
    }

    pub fn events_copy(&self) -> Vec<TracepointEvent> {
        let inner = self.inner.lock();
        let mut events: Vec<TracepointEvent> =
            inner.events_per_tid.values().flatten().cloned().collect();
        events.sort_by_key(|event| (event.tid, event.timestamp_ns));
        events
    }

    pub fn for_each_event_of_thread(&self, tid: i32, mut visit: impl FnMut(&TracepointEvent)) {
        let inner = self.inner.lock();
        if let Some(events) = inner.events_per_tid.get(&tid) {
            for event in events {
                visit(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(tid: i32, timestamp_ns: u64) -> TracepointEvent {
        TracepointEvent {
            pid: 1,
            tid,
            timestamp_ns,
            cpu: 0,
            tracepoint_info_key: 5,
        }
    }

    #[test]
    fn per_thread_events_stay_sorted() {
        let data = TracepointData::default();
        data.add_tracepoint_info(
            5,
            TracepointInfo {
                category: "sched".to_string(),
                name: "sched_switch".to_string(),
            },
        );
        assert!(data.add_tracepoint_event(event(1, 30)));
        assert!(data.add_tracepoint_event(event(1, 10)));
        assert!(data.add_tracepoint_event(event(1, 20)));
        let mut timestamps = Vec::new();
        data.for_each_event_of_thread(1, |e| timestamps.push(e.timestamp_ns));
        assert_eq!(timestamps, vec![10, 20, 30]);
        assert_eq!(data.num_total_events(), 3);
    }

    #[test]
    fn events_need_a_known_info_key() {
        let data = TracepointData::default();
        assert!(!data.add_tracepoint_event(event(1, 10)));
    }
}
