//! Turns the ordered client event stream into the [`CaptureData`] model.
//!
//! Processing is deterministic: replaying the same stream into a fresh
//! `CaptureData` produces the same model, which the capture file round-trip
//! relies on. The producer protocol guarantees interned values arrive before
//! the events referencing them.

use std::sync::Arc;

use orbit_proto::capture_event::Event;
use orbit_proto::timer_info::Type as TimerType;
use orbit_proto::{CaptureEvent, TimerInfo};
use rustc_hash::FxHashMap;

use crate::capture_data::CaptureData;
use crate::gpu_queue_submissions::GpuQueueSubmissionProcessor;

const SW_QUEUE_LABEL: &str = "sw queue";
const HW_QUEUE_LABEL: &str = "hw queue";
const HW_EXECUTION_LABEL: &str = "hw execution";

#[derive(Debug, Clone, Copy)]
struct OpenFunctionCall {
    function_id: u64,
    begin_timestamp_ns: u64,
}

pub struct CaptureEventProcessor {
    capture_data: Arc<CaptureData>,
    open_function_calls: FxHashMap<i32, Vec<OpenFunctionCall>>,
    gpu_submission_processor: GpuQueueSubmissionProcessor,
    finished: bool,
}

impl CaptureEventProcessor {
    pub fn new(capture_data: Arc<CaptureData>) -> Self {
        CaptureEventProcessor {
            capture_data,
            open_function_calls: FxHashMap::default(),
            gpu_submission_processor: GpuQueueSubmissionProcessor::default(),
            finished: false,
        }
    }

    pub fn has_finished(&self) -> bool {
        self.finished
    }

    pub fn process_event(&mut self, event: CaptureEvent) {
        let Some(event) = event.event else {
            return;
        };
        match event {
            Event::CaptureStarted(started) => {
                self.capture_data
                    .set_process(started.pid, started.capture_start_timestamp_ns);
            }
            Event::SchedulingSlice(slice) => {
                self.capture_data.add_timer(TimerInfo {
                    start_ns: slice.out_timestamp_ns - slice.duration_ns,
                    end_ns: slice.out_timestamp_ns,
                    pid: slice.pid,
                    tid: slice.tid,
                    function_id: 0,
                    depth: slice.core as u32,
                    r#type: TimerType::CoreActivity as i32,
                    timeline_hash: 0,
                    user_data_key: 0,
                    color: None,
                });
            }
            Event::FunctionCall(function_call) => {
                self.capture_data
                    .update_function_stats(function_call.function_id, function_call.duration_ns);
                self.capture_data.add_timer(TimerInfo {
                    start_ns: function_call.end_timestamp_ns - function_call.duration_ns,
                    end_ns: function_call.end_timestamp_ns,
                    pid: function_call.pid,
                    tid: function_call.tid,
                    function_id: function_call.function_id,
                    depth: function_call.depth as u32,
                    r#type: TimerType::None as i32,
                    timeline_hash: 0,
                    user_data_key: 0,
                    color: None,
                });
            }
            Event::FunctionEntry(entry) => {
                self.open_function_calls
                    .entry(entry.tid)
                    .or_default()
                    .push(OpenFunctionCall {
                        function_id: entry.function_id,
                        begin_timestamp_ns: entry.timestamp_ns,
                    });
            }
            Event::FunctionExit(exit) => {
                let Some(open_calls) = self.open_function_calls.get_mut(&exit.tid) else {
                    return;
                };
                let Some(open_call) = open_calls.pop() else {
                    return;
                };
                let depth = open_calls.len() as u32;
                let duration_ns = exit
                    .timestamp_ns
                    .saturating_sub(open_call.begin_timestamp_ns);
                self.capture_data
                    .update_function_stats(open_call.function_id, duration_ns);
                self.capture_data.add_timer(TimerInfo {
                    start_ns: open_call.begin_timestamp_ns,
                    end_ns: exit.timestamp_ns,
                    pid: exit.pid,
                    tid: exit.tid,
                    function_id: open_call.function_id,
                    depth,
                    r#type: TimerType::None as i32,
                    timeline_hash: 0,
                    user_data_key: 0,
                    color: None,
                });
            }
            Event::IntrospectionScope(scope) => {
                self.capture_data.add_timer(TimerInfo {
                    start_ns: scope.begin_timestamp_ns,
                    end_ns: scope.end_timestamp_ns,
                    pid: scope.pid,
                    tid: scope.tid,
                    function_id: 0,
                    depth: scope.depth as u32,
                    r#type: TimerType::Introspection as i32,
                    timeline_hash: 0,
                    user_data_key: scope.name_key,
                    color: scope.color,
                });
            }
            Event::InternedString(interned) => {
                self.capture_data
                    .string_table
                    .add_if_absent(interned.key, &interned.intern);
            }
            Event::InternedCallstack(interned) => {
                if let Some(callstack) = interned.intern {
                    self.capture_data
                        .callstack_data
                        .add_unique_callstack(interned.key, callstack);
                }
            }
            Event::InternedTracepointInfo(interned) => {
                if let Some(info) = interned.intern {
                    self.capture_data
                        .tracepoint_data
                        .add_tracepoint_info(interned.key, info);
                }
            }
            Event::CallstackSample(sample) => {
                self.capture_data
                    .callstack_data
                    .add_callstack_event(orbit_proto::CallstackEvent {
                        tid: sample.tid as i64,
                        timestamp_ns: sample.timestamp_ns,
                        callstack_id: sample.callstack_id,
                    });
            }
            Event::AddressInfo(info) => {
                let function_name = self
                    .capture_data
                    .string_table
                    .get(info.function_name_key)
                    .unwrap_or_default();
                let module_name = self
                    .capture_data
                    .string_table
                    .get(info.module_name_key)
                    .unwrap_or_default();
                self.capture_data
                    .add_address_info(orbit_proto::FullAddressInfo {
                        absolute_address: info.absolute_address,
                        offset_in_function: info.offset_in_function,
                        function_name,
                        module_name,
                    });
            }
            Event::ThreadName(thread_name) => {
                self.capture_data
                    .set_thread_name(thread_name.tid as i64, &thread_name.name);
            }
            Event::ThreadNamesSnapshot(snapshot) => {
                for thread_name in snapshot.thread_names {
                    self.capture_data
                        .set_thread_name(thread_name.tid as i64, &thread_name.name);
                }
            }
            Event::ThreadStateSlice(slice) => {
                self.capture_data.add_thread_state_slice(slice);
            }
            Event::GpuJob(job) => {
                let sw_queue_key = self.capture_data.string_table.add_or_get_key(SW_QUEUE_LABEL);
                let hw_queue_key = self.capture_data.string_table.add_or_get_key(HW_QUEUE_LABEL);
                let hw_execution_key = self
                    .capture_data
                    .string_table
                    .add_or_get_key(HW_EXECUTION_LABEL);
                let spans = [
                    (
                        job.amdgpu_cs_ioctl_time_ns,
                        job.amdgpu_sched_run_job_time_ns,
                        sw_queue_key,
                    ),
                    (
                        job.amdgpu_sched_run_job_time_ns,
                        job.gpu_hardware_start_time_ns,
                        hw_queue_key,
                    ),
                    (
                        job.gpu_hardware_start_time_ns,
                        job.dma_fence_signaled_time_ns,
                        hw_execution_key,
                    ),
                ];
                for (start_ns, end_ns, label_key) in spans {
                    self.capture_data.add_timer(TimerInfo {
                        start_ns,
                        end_ns,
                        pid: job.pid,
                        tid: job.tid,
                        function_id: 0,
                        depth: job.depth as u32,
                        r#type: TimerType::GpuActivity as i32,
                        timeline_hash: job.timeline_key,
                        user_data_key: label_key,
                        color: None,
                    });
                }
                for timer in self.gpu_submission_processor.process_gpu_job(&job) {
                    self.capture_data.add_timer(timer);
                }
            }
            Event::GpuQueueSubmission(submission) => {
                for timer in self
                    .gpu_submission_processor
                    .process_gpu_queue_submission(submission)
                {
                    self.capture_data.add_timer(timer);
                }
            }
            Event::TracepointEvent(tracepoint_event) => {
                self.capture_data
                    .tracepoint_data
                    .add_tracepoint_event(tracepoint_event);
            }
            Event::LostPerfRecordsEvent(lost) => {
                log::warn!(
                    "kernel dropped perf records in the {} ns before {}",
                    lost.duration_ns,
                    lost.end_timestamp_ns
                );
            }
            Event::OutOfOrderEventsDiscardedEvent(discarded) => {
                log::warn!(
                    "{} event(s) discarded out of order in [{}, {}]",
                    discarded.count,
                    discarded.begin_timestamp_ns,
                    discarded.end_timestamp_ns
                );
            }
            Event::ErrorsWithPerfEventOpenEvent(errors) => {
                log::error!(
                    "perf_event_open failed for: {}",
                    errors.failed_to_open.join(", ")
                );
            }
            Event::CaptureFinished(finished) => {
                if finished.status != orbit_proto::capture_finished::Status::Successful as i32 {
                    log::error!("capture finished with error: {}", finished.error_message);
                }
                self.finished = true;
            }
            // Full variants are rewritten by the service before they reach
            // the client.
            Event::FullCallstackSample(_)
            | Event::FullGpuJob(_)
            | Event::FullAddressInfo(_)
            | Event::FullTracepointEvent(_) => {
                log::error!("un-interned event reached the client");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_proto::callstack::CallstackType;
    use orbit_proto::{
        Callstack, CallstackSample, CaptureStarted, FunctionEntry, FunctionExit, GpuJob,
        InternedCallstack, InternedString, SchedulingSlice, ThreadStateSlice,
    };

    fn process(events: Vec<Event>) -> Arc<CaptureData> {
        let capture_data = Arc::new(CaptureData::default());
        let mut processor = CaptureEventProcessor::new(capture_data.clone());
        for event in events {
            processor.process_event(event.into());
        }
        capture_data
    }

    #[test]
    fn scheduling_slice_becomes_a_core_activity_timer() {
        let capture_data = process(vec![Event::SchedulingSlice(SchedulingSlice {
            pid: 1,
            tid: 2,
            core: 3,
            duration_ns: 50,
            out_timestamp_ns: 150,
        })]);
        let timers = capture_data.timers_copy();
        assert_eq!(timers.len(), 1);
        assert_eq!(timers[0].start_ns, 100);
        assert_eq!(timers[0].end_ns, 150);
        assert_eq!(timers[0].depth, 3);
        assert_eq!(timers[0].r#type, TimerType::CoreActivity as i32);
    }

    #[test]
    fn entry_exit_pairs_compute_depth_and_stats() {
        let capture_data = process(vec![
            Event::FunctionEntry(FunctionEntry {
                pid: 1,
                tid: 2,
                function_id: 10,
                stack_pointer: 0,
                return_address: 0,
                timestamp_ns: 100,
            }),
            Event::FunctionEntry(FunctionEntry {
                pid: 1,
                tid: 2,
                function_id: 11,
                stack_pointer: 0,
                return_address: 0,
                timestamp_ns: 110,
            }),
            Event::FunctionExit(FunctionExit {
                pid: 1,
                tid: 2,
                timestamp_ns: 150,
            }),
            Event::FunctionExit(FunctionExit {
                pid: 1,
                tid: 2,
                timestamp_ns: 200,
            }),
        ]);
        let timers = capture_data.timers_copy();
        assert_eq!(timers.len(), 2);
        // Inner call closes first, at depth 1.
        assert_eq!(timers[0].function_id, 11);
        assert_eq!(timers[0].depth, 1);
        assert_eq!(timers[0].start_ns, 110);
        assert_eq!(timers[0].end_ns, 150);
        assert_eq!(timers[1].function_id, 10);
        assert_eq!(timers[1].depth, 0);
        assert_eq!(capture_data.function_stats(11).count, 1);
        assert_eq!(capture_data.function_stats(11).total_time_ns, 40);
    }

    #[test]
    fn callstack_samples_are_deinterned() {
        let callstack = Callstack {
            frames: vec![0x100, 0x200],
            r#type: CallstackType::Complete as i32,
        };
        let capture_data = process(vec![
            Event::InternedCallstack(InternedCallstack {
                key: 42,
                intern: Some(callstack),
            }),
            Event::CallstackSample(CallstackSample {
                pid: 1,
                tid: 2,
                callstack_id: 42,
                timestamp_ns: 100,
            }),
        ]);
        assert_eq!(capture_data.callstack_data.callstack_count(), 1);
        assert_eq!(capture_data.callstack_data.event_count(), 1);
        let events = capture_data.callstack_data.events_copy();
        assert_eq!(events[0].callstack_id, 42);
        assert_eq!(events[0].tid, 2);
    }

    #[test]
    fn gpu_job_emits_three_queue_timers() {
        let capture_data = process(vec![Event::GpuJob(GpuJob {
            pid: 1,
            tid: 2,
            context: 1,
            seqno: 1,
            timeline_key: 7,
            depth: 0,
            amdgpu_cs_ioctl_time_ns: 100,
            amdgpu_sched_run_job_time_ns: 200,
            gpu_hardware_start_time_ns: 250,
            dma_fence_signaled_time_ns: 400,
        })]);
        let timers = capture_data.timers_copy();
        assert_eq!(timers.len(), 3);
        assert!(timers
            .iter()
            .all(|timer| timer.r#type == TimerType::GpuActivity as i32));
        assert_eq!(
            timers.iter().map(|t| (t.start_ns, t.end_ns)).collect::<Vec<_>>(),
            vec![(100, 200), (200, 250), (250, 400)]
        );
        // The three queue labels are interned client-side.
        assert!(timers
            .iter()
            .all(|timer| capture_data.string_table.get(timer.user_data_key).is_some()));
    }

    #[test]
    fn replaying_a_stream_yields_an_identical_model() {
        let events = vec![
            Event::CaptureStarted(CaptureStarted {
                pid: 7,
                capture_start_timestamp_ns: 1,
            }),
            Event::InternedString(InternedString {
                key: 3,
                intern: "worker".to_string(),
            }),
            Event::InternedCallstack(InternedCallstack {
                key: 42,
                intern: Some(Callstack {
                    frames: vec![0x100],
                    r#type: CallstackType::Complete as i32,
                }),
            }),
            Event::CallstackSample(CallstackSample {
                pid: 7,
                tid: 8,
                callstack_id: 42,
                timestamp_ns: 50,
            }),
            Event::ThreadStateSlice(ThreadStateSlice {
                tid: 8,
                begin_timestamp_ns: 10,
                end_timestamp_ns: 20,
                ..Default::default()
            }),
            Event::SchedulingSlice(SchedulingSlice {
                pid: 7,
                tid: 8,
                core: 0,
                duration_ns: 5,
                out_timestamp_ns: 30,
            }),
        ];
        let first = process(events.clone());
        let second = process(events);
        assert_eq!(first.pid(), second.pid());
        assert_eq!(first.timers_copy(), second.timers_copy());
        assert_eq!(
            first.callstack_data.events_copy(),
            second.callstack_data.events_copy()
        );
        assert_eq!(first.thread_names_copy(), second.thread_names_copy());
        assert_eq!(
            first.all_thread_state_slices_copy(),
            second.all_thread_state_slices_copy()
        );
        assert_eq!(first.string_table.copy_of_all(), second.string_table.copy_of_all());
    }
}
