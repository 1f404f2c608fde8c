//! The materialized data model of one capture.
//!
//! Created when a capture starts, mutated only by the event-processor thread
//! until the capture finishes, read-only afterwards. Substructures that the
//! UI reads while the capture is still running hand out copies under their
//! own mutex.

use std::collections::BTreeMap;

use orbit_proto::{FullAddressInfo, FunctionInfo, FunctionStats, ThreadStateSlice, TimerInfo};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::callstack_data::CallstackData;
use crate::function_stats::FunctionStatsAccumulator;
use crate::string_table::StringTable;
use crate::tracepoint_data::TracepointData;

#[derive(Debug, Default)]
pub struct CaptureData {
    pid: Mutex<i32>,
    capture_start_timestamp_ns: Mutex<u64>,

    // Keyed by absolute address; functions the user selected for
    // instrumentation, with their symbol names.
    selected_functions: Mutex<BTreeMap<u64, FunctionInfo>>,
    functions_by_id: Mutex<FxHashMap<u64, FunctionInfo>>,

    address_infos: Mutex<FxHashMap<u64, FullAddressInfo>>,
    thread_names: Mutex<FxHashMap<i64, String>>,
    thread_state_slices: Mutex<FxHashMap<i64, Vec<ThreadStateSlice>>>,
    function_stats: Mutex<FxHashMap<u64, FunctionStatsAccumulator>>,
    timers: Mutex<Vec<TimerInfo>>,

    pub callstack_data: CallstackData,
    pub tracepoint_data: TracepointData,
    pub string_table: StringTable,
}

impl CaptureData {
    pub fn set_process(&self, pid: i32, capture_start_timestamp_ns: u64) {
        *self.pid.lock() = pid;
        *self.capture_start_timestamp_ns.lock() = capture_start_timestamp_ns;
    }

    pub fn pid(&self) -> i32 {
        *self.pid.lock()
    }

    pub fn capture_start_timestamp_ns(&self) -> u64 {
        *self.capture_start_timestamp_ns.lock()
    }

    pub fn set_selected_functions(&self, functions: Vec<FunctionInfo>) {
        let mut by_address = self.selected_functions.lock();
        let mut by_id = self.functions_by_id.lock();
        for function in functions {
            by_id.insert(function.function_id, function.clone());
            by_address.insert(function.address, function);
        }
    }

    /// The selected function containing `absolute_address`, if any.
    pub fn find_function_by_address(&self, absolute_address: u64) -> Option<FunctionInfo> {
        let functions = self.selected_functions.lock();
        let (_, function) = functions.range(..=absolute_address).next_back()?;
        let end = function.address + function.size.max(1);
        (absolute_address < end).then(|| function.clone())
    }

    pub fn find_function_by_id(&self, function_id: u64) -> Option<FunctionInfo> {
        self.functions_by_id.lock().get(&function_id).cloned()
    }

    pub fn selected_functions_copy(&self) -> BTreeMap<u64, FunctionInfo> {
        self.selected_functions.lock().clone()
    }

    pub fn add_address_info(&self, address_info: FullAddressInfo) {
        self.address_infos
            .lock()
            .insert(address_info.absolute_address, address_info);
    }

    pub fn find_address_info(&self, absolute_address: u64) -> Option<FullAddressInfo> {
        self.address_infos.lock().get(&absolute_address).cloned()
    }

    pub fn address_infos_copy(&self) -> Vec<FullAddressInfo> {
        let mut infos: Vec<FullAddressInfo> = self.address_infos.lock().values().cloned().collect();
        infos.sort_by_key(|info| info.absolute_address);
        infos
    }

    pub fn set_thread_name(&self, tid: i64, name: &str) {
        self.thread_names.lock().insert(tid, name.to_string());
    }

    pub fn thread_name(&self, tid: i64) -> Option<String> {
        self.thread_names.lock().get(&tid).cloned()
    }

    pub fn thread_names_copy(&self) -> FxHashMap<i64, String> {
        self.thread_names.lock().clone()
    }

    /// Per-thread slices are kept sorted by begin timestamp. Arrival is
    /// monotonic per thread, so the insertion point is nearly always the
    /// end.
    pub fn add_thread_state_slice(&self, slice: ThreadStateSlice) {
        let mut slices = self.thread_state_slices.lock();
        let per_tid = slices.entry(slice.tid).or_default();
        let position =
            per_tid.partition_point(|s| s.begin_timestamp_ns <= slice.begin_timestamp_ns);
        per_tid.insert(position, slice);
    }

    pub fn thread_state_slices_copy(&self, tid: i64) -> Vec<ThreadStateSlice> {
        self.thread_state_slices
            .lock()
            .get(&tid)
            .cloned()
            .unwrap_or_default()
    }

    pub fn all_thread_state_slices_copy(&self) -> Vec<ThreadStateSlice> {
        let slices = self.thread_state_slices.lock();
        let mut all: Vec<ThreadStateSlice> = slices.values().flatten().cloned().collect();
        all.sort_by_key(|slice| (slice.tid, slice.begin_timestamp_ns));
        all
    }

    pub fn update_function_stats(&self, function_id: u64, duration_ns: u64) {
        self.function_stats
            .lock()
            .entry(function_id)
            .or_default()
            .update(duration_ns);
    }

    pub fn function_stats(&self, function_id: u64) -> FunctionStats {
        self.function_stats
            .lock()
            .get(&function_id)
            .copied()
            .unwrap_or_default()
            .to_proto()
    }

    pub fn function_stats_copy(&self) -> FxHashMap<u64, FunctionStats> {
        self.function_stats
            .lock()
            .iter()
            .map(|(&function_id, stats)| (function_id, stats.to_proto()))
            .collect()
    }

    pub fn set_function_stats(&self, function_id: u64, stats: FunctionStats) {
        self.function_stats
            .lock()
            .insert(function_id, stats.into());
    }

    pub fn add_timer(&self, timer: TimerInfo) {
        debug_assert!(timer.start_ns <= timer.end_ns);
        self.timers.lock().push(timer);
    }

    pub fn timer_count(&self) -> usize {
        self.timers.lock().len()
    }

    pub fn timers_copy(&self) -> Vec<TimerInfo> {
        self.timers.lock().clone()
    }

    pub fn for_each_timer(&self, mut visit: impl FnMut(&TimerInfo)) {
        let timers = self.timers.lock();
        for timer in timers.iter() {
            visit(timer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn function(id: u64, address: u64, size: u64) -> FunctionInfo {
        FunctionInfo {
            name: format!("f{id}"),
            module_path: "/bin/app".to_string(),
            address,
            size,
            function_id: id,
        }
    }

    #[test]
    fn function_lookup_by_containing_address() {
        let data = CaptureData::default();
        data.set_selected_functions(vec![function(1, 0x1000, 0x100), function(2, 0x2000, 0x80)]);
        assert_eq!(data.find_function_by_address(0x1000).unwrap().function_id, 1);
        assert_eq!(data.find_function_by_address(0x10ff).unwrap().function_id, 1);
        assert!(data.find_function_by_address(0x1100).is_none());
        assert_eq!(data.find_function_by_address(0x2040).unwrap().function_id, 2);
        assert!(data.find_function_by_address(0x999).is_none());
    }

    #[test]
    fn thread_state_slices_are_sorted_and_non_overlapping() {
        let data = CaptureData::default();
        for (begin, end) in [(200, 300), (0, 100), (100, 200)] {
            data.add_thread_state_slice(ThreadStateSlice {
                tid: 5,
                begin_timestamp_ns: begin,
                end_timestamp_ns: end,
                ..Default::default()
            });
        }
        let slices = data.thread_state_slices_copy(5);
        for window in slices.windows(2) {
            assert!(window[0].begin_timestamp_ns <= window[1].begin_timestamp_ns);
            assert!(window[0].end_timestamp_ns <= window[1].begin_timestamp_ns);
        }
    }
}
