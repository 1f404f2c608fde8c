use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters accumulated across the reader threads and the processing thread.
/// Logged once per second while tracing and reset after each log line.
#[derive(Debug, Default)]
pub struct TracingStats {
    pub event_count: AtomicU64,
    pub sample_count: AtomicU64,
    pub lost_count: AtomicU64,
    pub discarded_out_of_order_count: AtomicU64,
    pub unwind_error_count: AtomicU64,
    pub samples_in_uprobes_count: AtomicU64,
    pub thread_state_slice_count: AtomicU64,
    pub gpu_events_count: AtomicU64,
    pub skipped_record_count: AtomicU64,
    pub samples_from_other_processes_count: AtomicU64,
}

impl TracingStats {
    pub fn increment(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    /// Takes and resets all counters, returning a log-ready summary.
    pub fn reset_and_summarize(self: &Arc<Self>) -> String {
        let take = |counter: &AtomicU64| counter.swap(0, Ordering::Relaxed);
        format!(
            "events: {}, samples: {} (unwind errors: {}, in uprobes: {}, other processes: {}), \
             lost: {}, discarded out of order: {}, thread states: {}, gpu: {}, skipped records: {}",
            take(&self.event_count),
            take(&self.sample_count),
            take(&self.unwind_error_count),
            take(&self.samples_in_uprobes_count),
            take(&self.samples_from_other_processes_count),
            take(&self.lost_count),
            take(&self.discarded_out_of_order_count),
            take(&self.thread_state_slice_count),
            take(&self.gpu_events_count),
            take(&self.skipped_record_count),
        )
    }
}
