//! Post-processing of callstack samples into per-function statistics.
//!
//! Runs once when a capture completes and again when new symbols are loaded.
//! Raw frame addresses are resolved to the start address of their containing
//! function; resolved callstacks are re-interned so samples that resolve to
//! the same function chain share one id.

use orbit_proto::callstack::CallstackType;
use orbit_proto::{Callstack, CallstackEvent};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::capture_data::CaptureData;

/// Tid of the synthetic "all threads" summary. Far outside the kernel's
/// `i32` pid range, so it can never collide with a real thread.
pub const ALL_THREADS_SENTINEL_TID: i64 = i64::MIN + 1;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampledFunction {
    pub name: String,
    pub module_path: String,
    pub absolute_address: u64,
    pub inclusive: u64,
    pub inclusive_percent: f32,
    pub exclusive: u64,
    pub exclusive_percent: f32,
    pub unwind_errors: u64,
    pub unwind_errors_percent: f32,
}

#[derive(Debug, Clone, Default)]
pub struct ThreadSampleData {
    pub tid: i64,
    pub samples_count: u64,
    pub sampled_callstack_id_to_events: FxHashMap<u64, Vec<CallstackEvent>>,
    pub resolved_address_to_inclusive_count: FxHashMap<u64, u64>,
    pub resolved_address_to_exclusive_count: FxHashMap<u64, u64>,
    pub resolved_address_to_unwind_error_count: FxHashMap<u64, u64>,
    /// Sorted by inclusive count, descending; what the sampling report
    /// shows.
    pub sampled_functions: Vec<SampledFunction>,
}

#[derive(Debug, Default)]
pub struct PostProcessedSamplingData {
    thread_id_to_sample_data: FxHashMap<i64, ThreadSampleData>,
    id_to_resolved_callstack: FxHashMap<u64, Callstack>,
    original_id_to_resolved_callstack_id: FxHashMap<u64, u64>,
    function_address_to_sampled_callstack_ids: FxHashMap<u64, FxHashSet<u64>>,
}

impl PostProcessedSamplingData {
    pub fn thread_sample_data(&self, tid: i64) -> Option<&ThreadSampleData> {
        self.thread_id_to_sample_data.get(&tid)
    }

    pub fn all_thread_sample_data(&self) -> impl Iterator<Item = &ThreadSampleData> {
        self.thread_id_to_sample_data.values()
    }

    pub fn resolved_callstack(&self, original_callstack_id: u64) -> Option<&Callstack> {
        let resolved_id = self
            .original_id_to_resolved_callstack_id
            .get(&original_callstack_id)?;
        self.id_to_resolved_callstack.get(resolved_id)
    }

    pub fn resolved_callstack_id(&self, original_callstack_id: u64) -> Option<u64> {
        self.original_id_to_resolved_callstack_id
            .get(&original_callstack_id)
            .copied()
    }

    pub fn sampled_callstack_ids_of_function(&self, function_address: u64) -> Vec<u64> {
        self.function_address_to_sampled_callstack_ids
            .get(&function_address)
            .map(|ids| {
                let mut ids: Vec<u64> = ids.iter().copied().collect();
                ids.sort_unstable();
                ids
            })
            .unwrap_or_default()
    }
}

struct SamplingDataPostProcessor<'a> {
    capture_data: &'a CaptureData,
    exact_address_to_function_address: FxHashMap<u64, u64>,
    // Names learned while resolving through address infos; the resolved
    // function address itself usually has no info entry of its own.
    function_address_to_name: FxHashMap<u64, (String, String)>,
    data: PostProcessedSamplingData,
}

/// Computes per-thread sampling statistics from the capture's callstack
/// events. `generate_summary` adds the all-threads aggregate under
/// [`ALL_THREADS_SENTINEL_TID`].
pub fn create_post_processed_sampling_data(
    capture_data: &CaptureData,
    generate_summary: bool,
) -> PostProcessedSamplingData {
    SamplingDataPostProcessor {
        capture_data,
        exact_address_to_function_address: FxHashMap::default(),
        function_address_to_name: FxHashMap::default(),
        data: PostProcessedSamplingData::default(),
    }
    .process(generate_summary)
}

impl SamplingDataPostProcessor<'_> {
    fn process(mut self, generate_summary: bool) -> PostProcessedSamplingData {
        // Group events per thread (and into the summary).
        self.capture_data
            .callstack_data
            .for_each_callstack_event(|event| {
                let mut add_to = |tid: i64| {
                    let thread_data = self
                        .data
                        .thread_id_to_sample_data
                        .entry(tid)
                        .or_insert_with(|| ThreadSampleData {
                            tid,
                            ..Default::default()
                        });
                    thread_data.samples_count += 1;
                    thread_data
                        .sampled_callstack_id_to_events
                        .entry(event.callstack_id)
                        .or_default()
                        .push(event.clone());
                };
                add_to(event.tid);
                if generate_summary {
                    add_to(ALL_THREADS_SENTINEL_TID);
                }
            });

        self.resolve_callstacks();

        // Per-thread resolved-address counts.
        let thread_ids: Vec<i64> = self.data.thread_id_to_sample_data.keys().copied().collect();
        for tid in thread_ids {
            let mut thread_data = self.data.thread_id_to_sample_data.remove(&tid).unwrap();
            for (sampled_callstack_id, events) in &thread_data.sampled_callstack_id_to_events {
                let count = events.len() as u64;
                let resolved_id =
                    self.data.original_id_to_resolved_callstack_id[sampled_callstack_id];
                let resolved = &self.data.id_to_resolved_callstack[&resolved_id];

                let innermost = resolved.frames[0];
                *thread_data
                    .resolved_address_to_exclusive_count
                    .entry(innermost)
                    .or_default() += count;

                // For non-Complete callstacks only the innermost frame is
                // trustworthy; anything else would pollute the statistics.
                let mut unique_resolved = FxHashSet::default();
                if resolved.r#type == CallstackType::Complete as i32 {
                    unique_resolved.extend(resolved.frames.iter().copied());
                } else {
                    unique_resolved.insert(innermost);
                    *thread_data
                        .resolved_address_to_unwind_error_count
                        .entry(innermost)
                        .or_default() += count;
                }
                for resolved_address in unique_resolved {
                    *thread_data
                        .resolved_address_to_inclusive_count
                        .entry(resolved_address)
                        .or_default() += count;
                }
            }
            self.fill_sampled_functions(&mut thread_data);
            self.data.thread_id_to_sample_data.insert(tid, thread_data);
        }

        self.data
    }

    fn resolve_callstacks(&mut self) {
        // value == key means the resolved callstack reuses the original id.
        let mut resolved_callstack_to_id: FxHashMap<(Vec<u64>, i32), u64> = FxHashMap::default();

        self.capture_data
            .callstack_data
            .for_each_unique_callstack(|callstack_id, callstack| {
                let resolved_frames: Vec<u64> = callstack
                    .frames
                    .iter()
                    .map(|&address| self.map_address_to_function_address(address))
                    .collect();

                if callstack.r#type == CallstackType::Complete as i32 {
                    for &function_address in &resolved_frames {
                        self.data
                            .function_address_to_sampled_callstack_ids
                            .entry(function_address)
                            .or_default()
                            .insert(callstack_id);
                    }
                } else {
                    self.data
                        .function_address_to_sampled_callstack_ids
                        .entry(resolved_frames[0])
                        .or_default()
                        .insert(callstack_id);
                }

                let resolved_id = *resolved_callstack_to_id
                    .entry((resolved_frames.clone(), callstack.r#type))
                    .or_insert_with(|| {
                        self.data.id_to_resolved_callstack.insert(
                            callstack_id,
                            Callstack {
                                frames: resolved_frames,
                                r#type: callstack.r#type,
                            },
                        );
                        callstack_id
                    });
                self.data
                    .original_id_to_resolved_callstack_id
                    .insert(callstack_id, resolved_id);
            });
    }

    /// Resolution priority: a selected function containing the address, then
    /// the address info's `absolute - offset_in_function`, then the address
    /// itself (every address becomes its own function).
    fn map_address_to_function_address(&mut self, absolute_address: u64) -> u64 {
        if let Some(&function_address) =
            self.exact_address_to_function_address.get(&absolute_address)
        {
            return function_address;
        }
        let function_address = if let Some(function) =
            self.capture_data.find_function_by_address(absolute_address)
        {
            function.address
        } else if let Some(info) = self.capture_data.find_address_info(absolute_address) {
            let function_address = absolute_address - info.offset_in_function;
            if !info.function_name.is_empty() {
                self.function_address_to_name
                    .insert(function_address, (info.function_name, info.module_name));
            }
            function_address
        } else {
            absolute_address
        };
        self.exact_address_to_function_address
            .insert(absolute_address, function_address);
        function_address
    }

    fn function_name_for(&self, function_address: u64) -> (String, String) {
        if let Some(function) = self.capture_data.find_function_by_address(function_address) {
            return (function.name, function.module_path);
        }
        if let Some((name, module)) = self.function_address_to_name.get(&function_address) {
            return (name.clone(), module.clone());
        }
        if let Some(info) = self.capture_data.find_address_info(function_address) {
            if !info.function_name.is_empty() {
                return (info.function_name, info.module_name);
            }
        }
        (format!("{function_address:#x}"), String::new())
    }

    fn fill_sampled_functions(&self, thread_data: &mut ThreadSampleData) {
        let samples_count = thread_data.samples_count.max(1) as f32;
        let mut functions: Vec<SampledFunction> = thread_data
            .resolved_address_to_inclusive_count
            .iter()
            .map(|(&function_address, &inclusive)| {
                let exclusive = thread_data
                    .resolved_address_to_exclusive_count
                    .get(&function_address)
                    .copied()
                    .unwrap_or(0);
                let unwind_errors = thread_data
                    .resolved_address_to_unwind_error_count
                    .get(&function_address)
                    .copied()
                    .unwrap_or(0);
                let (name, module_path) = self.function_name_for(function_address);
                SampledFunction {
                    name,
                    module_path,
                    absolute_address: function_address,
                    inclusive,
                    inclusive_percent: 100.0 * inclusive as f32 / samples_count,
                    exclusive,
                    exclusive_percent: 100.0 * exclusive as f32 / samples_count,
                    unwind_errors,
                    unwind_errors_percent: 100.0 * unwind_errors as f32 / samples_count,
                }
            })
            .collect();
        functions.sort_by(|a, b| {
            b.inclusive
                .cmp(&a.inclusive)
                .then(a.absolute_address.cmp(&b.absolute_address))
        });
        thread_data.sampled_functions = functions;
    }
}
