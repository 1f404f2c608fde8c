//! Linux tracing backend of the Orbit capture pipeline.
//!
//! Consumes perf_event_open ring buffers, parses the records into typed
//! events, orders them globally, unwinds user stacks, derives scheduling and
//! thread-state information, joins GPU tracepoints into jobs, and reports
//! everything to a [`TracerListener`].

mod event_processor;
mod events;
mod function_calls;
mod gpu_tracepoints;
mod leaf_functions;
mod listener;
mod lost_and_discarded;
mod maps;
mod perf_event_open;
mod perf_event_sys;
mod records;
mod return_addresses;
mod ring_buffer;
mod stats;
mod switches_states_names;
mod tracer;
mod unwinding;
mod uprobes_visitor;

pub use event_processor::{PerfEventProcessor, PerfEventQueue, DEFAULT_PROCESSING_DELAY_NS};
pub use events::{PerfEvent, PerfEventData, PerfEventOrderedStream, PerfEventVisitor, Registers};
pub use gpu_tracepoints::GpuTracepointVisitor;
pub use leaf_functions::LeafFunctionCallManager;
pub use listener::TracerListener;
pub use maps::{MemoryMapping, MemoryMaps};
pub use records::{RecordParser, RingBufferKind};
pub use return_addresses::UprobesReturnAddressManager;
pub use ring_buffer::PerfEventRingBuffer;
pub use stats::TracingStats;
pub use switches_states_names::{SwitchesStatesNamesVisitor, ThreadStateManager};
pub use tracer::{monotonic_now_ns, validate_capture_options, CaptureOptionError, Tracer};
pub use unwinding::{DwarfUnwinder, FramePointerProbe};
pub use uprobes_visitor::UprobesUnwindingVisitor;

/// Sentinel for "thread unknown". Tids are carried as `i64` so that
/// sentinels outside the kernel's `i32` pid range stay collision-free; -1
/// itself is never a valid tid.
pub const UNKNOWN_TID: i64 = -1;

/// The kernel caps `sample_stack_user` at this many bytes.
pub const MAX_STACK_DUMP_SIZE: u32 = 65528;
