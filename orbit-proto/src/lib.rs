//! Protobuf messages and gRPC services for the Orbit capture pipeline.
//!
//! The wire types are generated from `proto/capture.proto` and
//! `proto/services.proto`. Everything that crosses a process boundary, and
//! every record stored in a capture file, is one of these messages.

use std::hash::Hasher;

use rustc_hash::FxHasher;

mod generated {
    #![allow(clippy::enum_variant_names)]
    tonic::include_proto!("orbit_grpc");
}

pub use generated::*;

/// Reserved `function_id` meaning "no instrumented function".
pub const INVALID_FUNCTION_ID: u64 = 0;

impl Callstack {
    /// The callstack's identity: a content hash over frames and type. Two
    /// callstacks with identical frames and type share an id.
    pub fn compute_id(&self) -> u64 {
        let mut hasher = FxHasher::default();
        for frame in &self.frames {
            hasher.write_u64(*frame);
        }
        hasher.write_i32(self.r#type);
        hasher.finish()
    }
}

impl CaptureEvent {
    /// The timestamp this event is ordered by, or `None` for metadata events
    /// (interned values, address infos) which must be forwarded ahead of any
    /// event that references them.
    pub fn timestamp_ns(&self) -> Option<u64> {
        use capture_event::Event;
        let event = self.event.as_ref()?;
        match event {
            Event::CaptureStarted(e) => Some(e.capture_start_timestamp_ns),
            Event::SchedulingSlice(e) => Some(e.out_timestamp_ns),
            Event::CallstackSample(e) => Some(e.timestamp_ns),
            Event::FullCallstackSample(e) => Some(e.timestamp_ns),
            Event::FunctionCall(e) => Some(e.end_timestamp_ns),
            Event::FunctionEntry(e) => Some(e.timestamp_ns),
            Event::FunctionExit(e) => Some(e.timestamp_ns),
            Event::IntrospectionScope(e) => Some(e.end_timestamp_ns),
            Event::InternedString(_)
            | Event::InternedCallstack(_)
            | Event::InternedTracepointInfo(_)
            | Event::AddressInfo(_)
            | Event::FullAddressInfo(_) => None,
            Event::ThreadName(e) => Some(e.timestamp_ns),
            Event::ThreadNamesSnapshot(e) => Some(e.snapshot_timestamp_ns),
            Event::ThreadStateSlice(e) => Some(e.end_timestamp_ns),
            Event::GpuJob(e) => Some(e.dma_fence_signaled_time_ns),
            Event::FullGpuJob(e) => Some(e.dma_fence_signaled_time_ns),
            Event::GpuQueueSubmission(e) => e
                .meta_info
                .as_ref()
                .map(|meta| meta.post_submission_cpu_timestamp),
            Event::TracepointEvent(e) => Some(e.timestamp_ns),
            Event::FullTracepointEvent(e) => Some(e.timestamp_ns),
            Event::LostPerfRecordsEvent(e) => Some(e.end_timestamp_ns),
            Event::OutOfOrderEventsDiscardedEvent(e) => Some(e.end_timestamp_ns),
            Event::ErrorsWithPerfEventOpenEvent(e) => Some(e.timestamp_ns),
            Event::CaptureFinished(_) => None,
        }
    }
}

impl From<capture_event::Event> for CaptureEvent {
    fn from(event: capture_event::Event) -> Self {
        CaptureEvent { event: Some(event) }
    }
}
