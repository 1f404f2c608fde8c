use orbit_proto::{
    ErrorsWithPerfEventOpenEvent, FullAddressInfo, FullCallstackSample, FullGpuJob,
    FullTracepointEvent, FunctionCall, LostPerfRecordsEvent, OutOfOrderEventsDiscardedEvent,
    SchedulingSlice, ThreadName, ThreadNamesSnapshot, ThreadStateSlice,
};

/// Receiver of everything the tracer produces. Implemented by the service,
/// which forwards into the producer event processor. Methods are called on
/// the tracer's processing thread, in timestamp order.
#[allow(unused_variables)]
pub trait TracerListener: Send {
    fn on_scheduling_slice(&mut self, slice: SchedulingSlice) {}
    fn on_callstack_sample(&mut self, sample: FullCallstackSample) {}
    fn on_function_call(&mut self, function_call: FunctionCall) {}
    fn on_gpu_job(&mut self, gpu_job: FullGpuJob) {}
    fn on_thread_name(&mut self, thread_name: ThreadName) {}
    fn on_thread_names_snapshot(&mut self, snapshot: ThreadNamesSnapshot) {}
    fn on_thread_state_slice(&mut self, slice: ThreadStateSlice) {}
    fn on_address_info(&mut self, address_info: FullAddressInfo) {}
    fn on_tracepoint_event(&mut self, tracepoint_event: FullTracepointEvent) {}
    fn on_errors_with_perf_event_open(&mut self, event: ErrorsWithPerfEventOpenEvent) {}
    fn on_lost_perf_records(&mut self, event: LostPerfRecordsEvent) {}
    fn on_out_of_order_events_discarded(&mut self, event: OutOfOrderEventsDiscardedEvent) {}
}
