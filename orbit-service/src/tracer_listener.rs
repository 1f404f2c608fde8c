use crossbeam_channel::Sender;
use orbit_proto::capture_event::Event;
use orbit_proto::{
    CaptureEvent, ErrorsWithPerfEventOpenEvent, FullAddressInfo, FullCallstackSample, FullGpuJob,
    FullTracepointEvent, FunctionCall, LostPerfRecordsEvent, OutOfOrderEventsDiscardedEvent,
    SchedulingSlice, ThreadName, ThreadNamesSnapshot, ThreadStateSlice,
};
use orbit_linux_tracing::TracerListener;

use crate::producer_event_processor::TRACER_PRODUCER_ID;

/// Feeds everything the kernel tracer reports into the producer event
/// processor's dispatch channel, as producer 0.
#[derive(Clone)]
pub struct TracerEventForwarder {
    sender: Sender<(u64, CaptureEvent)>,
}

impl TracerEventForwarder {
    pub fn new(sender: Sender<(u64, CaptureEvent)>) -> Self {
        TracerEventForwarder { sender }
    }

    fn forward(&mut self, event: Event) {
        // Send failures mean the capture is torn down; the remaining events
        // have nowhere to go.
        let _ = self.sender.send((TRACER_PRODUCER_ID, event.into()));
    }
}

impl TracerListener for TracerEventForwarder {
    fn on_scheduling_slice(&mut self, slice: SchedulingSlice) {
        self.forward(Event::SchedulingSlice(slice));
    }

    fn on_callstack_sample(&mut self, sample: FullCallstackSample) {
        self.forward(Event::FullCallstackSample(sample));
    }

    fn on_function_call(&mut self, function_call: FunctionCall) {
        self.forward(Event::FunctionCall(function_call));
    }

    fn on_gpu_job(&mut self, gpu_job: FullGpuJob) {
        self.forward(Event::FullGpuJob(gpu_job));
    }

    fn on_thread_name(&mut self, thread_name: ThreadName) {
        self.forward(Event::ThreadName(thread_name));
    }

    fn on_thread_names_snapshot(&mut self, snapshot: ThreadNamesSnapshot) {
        self.forward(Event::ThreadNamesSnapshot(snapshot));
    }

    fn on_thread_state_slice(&mut self, slice: ThreadStateSlice) {
        self.forward(Event::ThreadStateSlice(slice));
    }

    fn on_address_info(&mut self, address_info: FullAddressInfo) {
        self.forward(Event::FullAddressInfo(address_info));
    }

    fn on_tracepoint_event(&mut self, tracepoint_event: FullTracepointEvent) {
        self.forward(Event::FullTracepointEvent(tracepoint_event));
    }

    fn on_errors_with_perf_event_open(&mut self, event: ErrorsWithPerfEventOpenEvent) {
        self.forward(Event::ErrorsWithPerfEventOpenEvent(event));
    }

    fn on_lost_perf_records(&mut self, event: LostPerfRecordsEvent) {
        self.forward(Event::LostPerfRecordsEvent(event));
    }

    fn on_out_of_order_events_discarded(&mut self, event: OutOfOrderEventsDiscardedEvent) {
        self.forward(Event::OutOfOrderEventsDiscardedEvent(event));
    }
}
