//! Client side of the Orbit capture pipeline: consumes the ordered capture
//! event stream, materializes the queryable capture data model, derives
//! per-function sampling statistics and call trees, and reads and writes
//! `.orbit` capture files.

mod call_tree;
mod callstack_data;
mod capture_client;
mod capture_data;
mod capture_event_processor;
mod capture_file;
mod function_stats;
mod gpu_queue_submissions;
mod sampling_post_processor;
mod string_table;
mod tracepoint_data;

pub use call_tree::{CallTreeNode, CallTreeView};
pub use callstack_data::CallstackData;
pub use capture_client::{CaptureClientError, CaptureSession};
pub use capture_data::CaptureData;
pub use capture_event_processor::CaptureEventProcessor;
pub use capture_file::{
    load_capture, read_capture_into, with_capture_file_extension, write_capture, CaptureFileError,
    CAPTURE_FILE_EXTENSION, CAPTURE_FILE_VERSION,
};
pub use function_stats::FunctionStatsAccumulator;
pub use gpu_queue_submissions::GpuQueueSubmissionProcessor;
pub use sampling_post_processor::{
    create_post_processed_sampling_data, PostProcessedSamplingData, SampledFunction,
    ThreadSampleData, ALL_THREADS_SENTINEL_TID,
};
pub use string_table::StringTable;
pub use tracepoint_data::TracepointData;
