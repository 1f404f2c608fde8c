//! Total ordering and interning across capture event producers.
//!
//! Every producer (the kernel tracer is producer 0, each connected gRPC
//! producer gets its own id) feeds events into a per-producer queue. The
//! processor forwards the event with the smallest timestamp across all
//! queues, holding recent events back by a visibility delay so slower
//! producers can catch up.
//!
//! Keys carried by events are producer-local; the processor rewrites them
//! into global keys before forwarding, and guarantees that the interned
//! value reaches the collector before any event that references it.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::hash::Hasher;

use orbit_proto::capture_event::Event;
use orbit_proto::{
    AddressInfo, Callstack, CallstackSample, CaptureEvent, GpuJob, InternedCallstack,
    InternedString, InternedTracepointInfo, OutOfOrderEventsDiscardedEvent, TracepointEvent,
    TracepointInfo,
};
use rustc_hash::{FxHashMap, FxHashSet, FxHasher};

/// Producer id reserved for the in-process kernel tracer.
pub const TRACER_PRODUCER_ID: u64 = 0;

/// Default visibility delay of the cross-producer merge.
pub const DEFAULT_PRODUCER_DELAY_NS: u64 = 10_000_000;

/// Sink for the totally-ordered client event stream.
pub trait ClientCaptureEventCollector: Send {
    fn add_event(&mut self, event: CaptureEvent);
}

impl<F: FnMut(CaptureEvent) + Send> ClientCaptureEventCollector for F {
    fn add_event(&mut self, event: CaptureEvent) {
        self(event)
    }
}

fn string_key(value: &str) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(value.as_bytes());
    hasher.finish()
}

fn tracepoint_key(info: &TracepointInfo) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(info.category.as_bytes());
    hasher.write_u8(b':');
    hasher.write(info.name.as_bytes());
    hasher.finish()
}

struct QueuedEvent(u64, CaptureEvent);

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for QueuedEvent {}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

pub struct ProducerEventProcessor<C: ClientCaptureEventCollector> {
    collector: C,
    delay_ns: u64,
    queues: FxHashMap<u64, BinaryHeap<Reverse<QueuedEvent>>>,
    last_forwarded_timestamp_ns: u64,
    pending_discards: Option<(u64, u64, u64)>,

    // Producer-local key -> global key, per kind.
    producer_string_keys: FxHashMap<(u64, u64), u64>,
    producer_callstack_keys: FxHashMap<(u64, u64), u64>,
    producer_tracepoint_keys: FxHashMap<(u64, u64), u64>,
    // Global keys whose interned value was already forwarded.
    forwarded_strings: FxHashSet<u64>,
    forwarded_callstacks: FxHashSet<u64>,
    forwarded_tracepoints: FxHashSet<u64>,
}

impl<C: ClientCaptureEventCollector> ProducerEventProcessor<C> {
    pub fn new(collector: C, delay_ns: u64) -> Self {
        ProducerEventProcessor {
            collector,
            delay_ns,
            queues: FxHashMap::default(),
            last_forwarded_timestamp_ns: 0,
            pending_discards: None,
            producer_string_keys: FxHashMap::default(),
            producer_callstack_keys: FxHashMap::default(),
            producer_tracepoint_keys: FxHashMap::default(),
            forwarded_strings: FxHashSet::default(),
            forwarded_callstacks: FxHashSet::default(),
            forwarded_tracepoints: FxHashSet::default(),
        }
    }

    pub fn collector_mut(&mut self) -> &mut C {
        &mut self.collector
    }

    fn intern_string(&mut self, value: &str) -> u64 {
        let key = string_key(value);
        if self.forwarded_strings.insert(key) {
            self.collector.add_event(
                Event::InternedString(InternedString {
                    key,
                    intern: value.to_string(),
                })
                .into(),
            );
        }
        key
    }

    fn intern_callstack(&mut self, callstack: Callstack) -> u64 {
        let key = callstack.compute_id();
        if self.forwarded_callstacks.insert(key) {
            self.collector.add_event(
                Event::InternedCallstack(InternedCallstack {
                    key,
                    intern: Some(callstack),
                })
                .into(),
            );
        }
        key
    }

    fn intern_tracepoint_info(&mut self, info: TracepointInfo) -> u64 {
        let key = tracepoint_key(&info);
        if self.forwarded_tracepoints.insert(key) {
            self.collector.add_event(
                Event::InternedTracepointInfo(InternedTracepointInfo {
                    key,
                    intern: Some(info),
                })
                .into(),
            );
        }
        key
    }

    /// Accepts one event from `producer_id`. Metadata is forwarded at once;
    /// timestamped events are queued for the ordered merge.
    pub fn process_event(&mut self, producer_id: u64, event: CaptureEvent) {
        let Some(event) = event.event else {
            return;
        };
        let rewritten: Event = match event {
            // Interned values define the producer-local key mapping.
            Event::InternedString(interned) => {
                let global = string_key(&interned.intern);
                self.producer_string_keys
                    .insert((producer_id, interned.key), global);
                self.intern_string(&interned.intern);
                return;
            }
            Event::InternedCallstack(interned) => {
                let Some(callstack) = interned.intern else {
                    return;
                };
                let global = callstack.compute_id();
                self.producer_callstack_keys
                    .insert((producer_id, interned.key), global);
                self.intern_callstack(callstack);
                return;
            }
            Event::InternedTracepointInfo(interned) => {
                let Some(info) = interned.intern else {
                    return;
                };
                let global = tracepoint_key(&info);
                self.producer_tracepoint_keys
                    .insert((producer_id, interned.key), global);
                self.intern_tracepoint_info(info);
                return;
            }

            // Full variants carry their payload inline; intern it and
            // forward the slim variant.
            Event::FullCallstackSample(full) => {
                let Some(callstack) = full.callstack else {
                    return;
                };
                let callstack_id = self.intern_callstack(callstack);
                Event::CallstackSample(CallstackSample {
                    pid: full.pid,
                    tid: full.tid,
                    callstack_id,
                    timestamp_ns: full.timestamp_ns,
                })
            }
            Event::FullGpuJob(full) => {
                let timeline_key = self.intern_string(&full.timeline);
                Event::GpuJob(GpuJob {
                    pid: full.pid,
                    tid: full.tid,
                    context: full.context,
                    seqno: full.seqno,
                    timeline_key,
                    depth: full.depth,
                    amdgpu_cs_ioctl_time_ns: full.amdgpu_cs_ioctl_time_ns,
                    amdgpu_sched_run_job_time_ns: full.amdgpu_sched_run_job_time_ns,
                    gpu_hardware_start_time_ns: full.gpu_hardware_start_time_ns,
                    dma_fence_signaled_time_ns: full.dma_fence_signaled_time_ns,
                })
            }
            Event::FullAddressInfo(full) => {
                let function_name_key = self.intern_string(&full.function_name);
                let module_name_key = self.intern_string(&full.module_name);
                // Address infos are metadata: forward ahead of the samples
                // that resolve through them.
                self.collector.add_event(
                    Event::AddressInfo(AddressInfo {
                        absolute_address: full.absolute_address,
                        offset_in_function: full.offset_in_function,
                        function_name_key,
                        module_name_key,
                    })
                    .into(),
                );
                return;
            }
            Event::FullTracepointEvent(full) => {
                let info = full.tracepoint_info.unwrap_or_default();
                let tracepoint_info_key = self.intern_tracepoint_info(info);
                Event::TracepointEvent(TracepointEvent {
                    pid: full.pid,
                    tid: full.tid,
                    timestamp_ns: full.timestamp_ns,
                    cpu: full.cpu,
                    tracepoint_info_key,
                })
            }

            // Slim variants from external producers reference producer-local
            // keys; rewrite them to global ones.
            Event::CallstackSample(mut sample) => {
                let Some(&global) = self
                    .producer_callstack_keys
                    .get(&(producer_id, sample.callstack_id))
                else {
                    log::warn!(
                        "callstack sample from producer {producer_id} references unknown key {}",
                        sample.callstack_id
                    );
                    return;
                };
                sample.callstack_id = global;
                Event::CallstackSample(sample)
            }
            Event::AddressInfo(mut info) => {
                info.function_name_key = self
                    .producer_string_keys
                    .get(&(producer_id, info.function_name_key))
                    .copied()
                    .unwrap_or(info.function_name_key);
                info.module_name_key = self
                    .producer_string_keys
                    .get(&(producer_id, info.module_name_key))
                    .copied()
                    .unwrap_or(info.module_name_key);
                self.collector.add_event(Event::AddressInfo(info).into());
                return;
            }
            Event::GpuJob(mut job) => {
                job.timeline_key = self
                    .producer_string_keys
                    .get(&(producer_id, job.timeline_key))
                    .copied()
                    .unwrap_or(job.timeline_key);
                Event::GpuJob(job)
            }
            Event::TracepointEvent(mut tracepoint_event) => {
                tracepoint_event.tracepoint_info_key = self
                    .producer_tracepoint_keys
                    .get(&(producer_id, tracepoint_event.tracepoint_info_key))
                    .copied()
                    .unwrap_or(tracepoint_event.tracepoint_info_key);
                Event::TracepointEvent(tracepoint_event)
            }
            Event::IntrospectionScope(mut scope) => {
                scope.name_key = self
                    .producer_string_keys
                    .get(&(producer_id, scope.name_key))
                    .copied()
                    .unwrap_or(scope.name_key);
                Event::IntrospectionScope(scope)
            }
            Event::GpuQueueSubmission(mut submission) => {
                for marker in &mut submission.completed_markers {
                    marker.text_key = self
                        .producer_string_keys
                        .get(&(producer_id, marker.text_key))
                        .copied()
                        .unwrap_or(marker.text_key);
                }
                Event::GpuQueueSubmission(submission)
            }

            // The capture frame markers bypass the merge so they bracket the
            // stream.
            Event::CaptureStarted(started) => {
                self.collector.add_event(Event::CaptureStarted(started).into());
                return;
            }
            Event::CaptureFinished(finished) => {
                self.collector
                    .add_event(Event::CaptureFinished(finished).into());
                return;
            }

            other => other,
        };

        let event: CaptureEvent = rewritten.into();
        let Some(timestamp) = event.timestamp_ns() else {
            self.collector.add_event(event);
            return;
        };
        if timestamp < self.last_forwarded_timestamp_ns {
            let (begin, end, count) =
                self.pending_discards
                    .take()
                    .unwrap_or((timestamp, timestamp, 0));
            self.pending_discards =
                Some((begin.min(timestamp), end.max(timestamp), count + 1));
            return;
        }
        self.queues
            .entry(producer_id)
            .or_default()
            .push(Reverse(QueuedEvent(timestamp, event)));
    }

    fn pop_next_before(&mut self, horizon: u64) -> Option<CaptureEvent> {
        let (&producer_id, _) = self
            .queues
            .iter()
            .filter_map(|(producer_id, queue)| {
                queue.peek().map(|entry| (producer_id, entry.0 .0))
            })
            .min_by_key(|&(_, timestamp)| timestamp)?;
        let queue = self.queues.get_mut(&producer_id)?;
        if queue.peek()?.0 .0 >= horizon {
            return None;
        }
        let Reverse(QueuedEvent(timestamp, event)) = queue.pop()?;
        self.last_forwarded_timestamp_ns = timestamp;
        Some(event)
    }

    /// Forwards queued events older than `now_ns` minus the visibility
    /// delay.
    pub fn process_old_events(&mut self, now_ns: u64) {
        let horizon = now_ns.saturating_sub(self.delay_ns);
        while let Some(event) = self.pop_next_before(horizon) {
            self.collector.add_event(event);
        }
        self.flush_pending_discards();
    }

    /// Forwards everything still queued; called after the drain phase of a
    /// capture stop.
    pub fn process_all_events(&mut self) {
        while let Some(event) = self.pop_next_before(u64::MAX) {
            self.collector.add_event(event);
        }
        self.flush_pending_discards();
    }

    fn flush_pending_discards(&mut self) {
        let Some((begin, end, count)) = self.pending_discards.take() else {
            return;
        };
        log::warn!("discarded {count} producer event(s) out of order in [{begin}, {end}]");
        self.collector.add_event(
            Event::OutOfOrderEventsDiscardedEvent(OutOfOrderEventsDiscardedEvent {
                begin_timestamp_ns: begin,
                end_timestamp_ns: end,
                count,
            })
            .into(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_proto::callstack::CallstackType;
    use orbit_proto::{FullCallstackSample, FunctionCall, SchedulingSlice};
    use std::sync::{Arc, Mutex};

    fn make_processor() -> (
        ProducerEventProcessor<impl ClientCaptureEventCollector>,
        Arc<Mutex<Vec<CaptureEvent>>>,
    ) {
        let collected: Arc<Mutex<Vec<CaptureEvent>>> = Arc::default();
        let sink = collected.clone();
        let processor = ProducerEventProcessor::new(
            move |event: CaptureEvent| sink.lock().unwrap().push(event),
            DEFAULT_PRODUCER_DELAY_NS,
        );
        (processor, collected)
    }

    fn function_call(timestamp: u64) -> CaptureEvent {
        Event::FunctionCall(FunctionCall {
            pid: 1,
            tid: 1,
            function_id: 1,
            duration_ns: 10,
            end_timestamp_ns: timestamp,
            depth: 0,
            return_value: 0,
        })
        .into()
    }

    fn scheduling_slice(timestamp: u64) -> CaptureEvent {
        Event::SchedulingSlice(SchedulingSlice {
            pid: 1,
            tid: 1,
            core: 0,
            duration_ns: 5,
            out_timestamp_ns: timestamp,
        })
        .into()
    }

    #[test]
    fn events_from_producers_come_out_in_timestamp_order() {
        let (mut processor, collected) = make_processor();
        processor.process_event(0, scheduling_slice(30));
        processor.process_event(1, function_call(10));
        processor.process_event(0, scheduling_slice(50));
        processor.process_event(1, function_call(40));
        processor.process_all_events();

        let timestamps: Vec<u64> = collected
            .lock()
            .unwrap()
            .iter()
            .map(|event| event.timestamp_ns().unwrap())
            .collect();
        assert_eq!(timestamps, vec![10, 30, 40, 50]);
    }

    #[test]
    fn full_callstack_samples_are_interned_and_deduplicated() {
        let (mut processor, collected) = make_processor();
        let callstack = Callstack {
            frames: vec![0x100, 0x200],
            r#type: CallstackType::Complete as i32,
        };
        for timestamp in [10, 20] {
            processor.process_event(
                0,
                Event::FullCallstackSample(FullCallstackSample {
                    pid: 1,
                    tid: 2,
                    callstack: Some(callstack.clone()),
                    timestamp_ns: timestamp,
                })
                .into(),
            );
        }
        processor.process_all_events();

        let collected = collected.lock().unwrap();
        let interned: Vec<&InternedCallstack> = collected
            .iter()
            .filter_map(|event| match &event.event {
                Some(Event::InternedCallstack(interned)) => Some(interned),
                _ => None,
            })
            .collect();
        assert_eq!(interned.len(), 1);
        let samples: Vec<&CallstackSample> = collected
            .iter()
            .filter_map(|event| match &event.event {
                Some(Event::CallstackSample(sample)) => Some(sample),
                _ => None,
            })
            .collect();
        assert_eq!(samples.len(), 2);
        assert!(samples.iter().all(|s| s.callstack_id == interned[0].key));
        // The interned value precedes the first sample referencing it.
        let interned_position = collected
            .iter()
            .position(|event| matches!(event.event, Some(Event::InternedCallstack(_))))
            .unwrap();
        let sample_position = collected
            .iter()
            .position(|event| matches!(event.event, Some(Event::CallstackSample(_))))
            .unwrap();
        assert!(interned_position < sample_position);
    }

    #[test]
    fn producer_local_string_keys_are_rewritten_to_global_keys() {
        let (mut processor, collected) = make_processor();
        // Two producers intern the same string under different local keys.
        processor.process_event(
            1,
            Event::InternedString(InternedString {
                key: 7,
                intern: "gfx".to_string(),
            })
            .into(),
        );
        processor.process_event(
            2,
            Event::InternedString(InternedString {
                key: 99,
                intern: "gfx".to_string(),
            })
            .into(),
        );
        processor.process_event(
            1,
            Event::GpuJob(GpuJob {
                timeline_key: 7,
                dma_fence_signaled_time_ns: 10,
                ..Default::default()
            })
            .into(),
        );
        processor.process_event(
            2,
            Event::GpuJob(GpuJob {
                timeline_key: 99,
                dma_fence_signaled_time_ns: 20,
                ..Default::default()
            })
            .into(),
        );
        processor.process_all_events();

        let collected = collected.lock().unwrap();
        let interned: Vec<&InternedString> = collected
            .iter()
            .filter_map(|event| match &event.event {
                Some(Event::InternedString(interned)) => Some(interned),
                _ => None,
            })
            .collect();
        assert_eq!(interned.len(), 1, "same string interned once");
        let global = interned[0].key;
        let jobs: Vec<&GpuJob> = collected
            .iter()
            .filter_map(|event| match &event.event {
                Some(Event::GpuJob(job)) => Some(job),
                _ => None,
            })
            .collect();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|job| job.timeline_key == global));
    }

    #[test]
    fn late_event_is_discarded_with_a_marker() {
        let (mut processor, collected) = make_processor();
        processor.process_event(0, function_call(1_000_000_000));
        processor.process_all_events();
        processor.process_event(0, function_call(5));
        processor.process_all_events();

        let collected = collected.lock().unwrap();
        let discarded: Vec<&OutOfOrderEventsDiscardedEvent> = collected
            .iter()
            .filter_map(|event| match &event.event {
                Some(Event::OutOfOrderEventsDiscardedEvent(discarded)) => Some(discarded),
                _ => None,
            })
            .collect();
        assert_eq!(discarded.len(), 1);
        assert_eq!(discarded[0].begin_timestamp_ns, 5);
        assert_eq!(discarded[0].end_timestamp_ns, 5);
        assert_eq!(discarded[0].count, 1);
    }

    #[test]
    fn visibility_delay_holds_back_recent_events() {
        let (mut processor, collected) = make_processor();
        processor.process_event(0, function_call(100));
        processor.process_old_events(100 + DEFAULT_PRODUCER_DELAY_NS / 2);
        assert!(collected.lock().unwrap().is_empty());
        processor.process_old_events(101 + DEFAULT_PRODUCER_DELAY_NS);
        assert_eq!(collected.lock().unwrap().len(), 1);
    }
}
