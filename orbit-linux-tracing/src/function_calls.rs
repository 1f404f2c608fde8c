//! Pairing of function entry and exit events into completed calls.
//!
//! Entries come either from uprobes or from user-space instrumentation; in
//! both cases exits on a thread close the most recent open entry of that
//! thread. The depth of a completed call is the number of calls still open
//! below it, so nested instrumented calls stack up in the UI without
//! overlap.

use orbit_proto::FunctionCall;
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, Copy)]
struct OpenCall {
    function_id: u64,
    begin_timestamp_ns: u64,
}

#[derive(Debug, Default)]
pub struct UprobesFunctionCallManager {
    tid_open_calls: FxHashMap<i32, Vec<OpenCall>>,
}

impl UprobesFunctionCallManager {
    pub fn process_function_entry(&mut self, tid: i32, function_id: u64, timestamp_ns: u64) {
        self.tid_open_calls
            .entry(tid)
            .or_default()
            .push(OpenCall {
                function_id,
                begin_timestamp_ns: timestamp_ns,
            });
    }

    /// Closes the innermost open call of `tid`. Returns `None` when there is
    /// no open call, which happens for exits of functions entered before the
    /// capture started.
    pub fn process_function_exit(
        &mut self,
        pid: i32,
        tid: i32,
        timestamp_ns: u64,
        return_value: Option<u64>,
    ) -> Option<FunctionCall> {
        let open_calls = self.tid_open_calls.get_mut(&tid)?;
        let open_call = open_calls.pop()?;
        let depth = open_calls.len() as i32;
        if open_calls.is_empty() {
            self.tid_open_calls.remove(&tid);
        }
        Some(FunctionCall {
            pid,
            tid,
            function_id: open_call.function_id,
            duration_ns: timestamp_ns.saturating_sub(open_call.begin_timestamp_ns),
            end_timestamp_ns: timestamp_ns,
            depth,
            return_value: return_value.unwrap_or(0),
        })
    }
}
