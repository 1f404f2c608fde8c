//! Scheduling slices, thread states, and thread names, derived from the
//! sched and task tracepoints.
//!
//! Thread states fuse three tracepoints into one state machine per thread:
//!
//! ```text
//! task_newtask ──► Runnable ──sched_switch(in)──► Running
//!                     ▲                              │
//!                     └── sched_wakeup ── Blocked ◄──┘ switch-out with
//!                                                      prev_state != 'R'
//! ```
//!
//! A state stays open until the next transition closes it and emits a
//! `ThreadStateSlice`; capture finish closes whatever is still open.

use std::sync::Arc;

use orbit_proto::thread_state_slice::{ThreadState, WakeupReason};
use orbit_proto::{FullTracepointEvent, SchedulingSlice, ThreadName, ThreadStateSlice};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::events::{
    ExitPerfEvent, ForkPerfEvent, GenericTracepointPerfEvent, PerfEventVisitor,
    SchedSwitchPerfEvent, SchedWakeupPerfEvent, TaskNewtaskPerfEvent, TaskRenamePerfEvent,
};
use crate::listener::TracerListener;
use crate::stats::TracingStats;

#[derive(Debug, Clone, Copy)]
struct OpenState {
    state: ThreadState,
    begin_timestamp_ns: u64,
    wakeup_tid: i64,
    wakeup_pid: i64,
    wakeup_reason: WakeupReason,
}

impl OpenState {
    fn new(state: ThreadState, begin_timestamp_ns: u64) -> Self {
        OpenState {
            state,
            begin_timestamp_ns,
            wakeup_tid: crate::UNKNOWN_TID,
            wakeup_pid: crate::UNKNOWN_TID,
            wakeup_reason: WakeupReason::NotApplicable,
        }
    }

    fn into_slice(self, tid: i32, end_timestamp_ns: u64) -> ThreadStateSlice {
        ThreadStateSlice {
            tid: tid as i64,
            thread_state: self.state as i32,
            begin_timestamp_ns: self.begin_timestamp_ns,
            end_timestamp_ns,
            wakeup_tid: self.wakeup_tid,
            wakeup_pid: self.wakeup_pid,
            wakeup_reason: self.wakeup_reason as i32,
        }
    }
}

/// State machine over the thread-state transitions of all watched threads.
#[derive(Debug, Default)]
pub struct ThreadStateManager {
    tid_open_states: FxHashMap<i32, OpenState>,
}

impl ThreadStateManager {
    pub fn on_initial_state(&mut self, timestamp_ns: u64, tid: i32, state: ThreadState) {
        self.tid_open_states
            .insert(tid, OpenState::new(state, timestamp_ns));
    }

    pub fn on_new_task(
        &mut self,
        timestamp_ns: u64,
        tid: i32,
        was_created_by_tid: i32,
        was_created_by_pid: i32,
    ) {
        let mut state = OpenState::new(ThreadState::Runnable, timestamp_ns);
        state.wakeup_tid = was_created_by_tid as i64;
        state.wakeup_pid = was_created_by_pid as i64;
        state.wakeup_reason = WakeupReason::Created;
        if self.tid_open_states.insert(tid, state).is_some() {
            log::warn!("new task {tid} already had an open state");
        }
    }

    pub fn on_sched_wakeup(
        &mut self,
        timestamp_ns: u64,
        tid: i32,
        was_unblocked_by_tid: i32,
        was_unblocked_by_pid: i32,
    ) -> Option<ThreadStateSlice> {
        let mut new_state = OpenState::new(ThreadState::Runnable, timestamp_ns);
        new_state.wakeup_tid = was_unblocked_by_tid as i64;
        new_state.wakeup_pid = was_unblocked_by_pid as i64;
        new_state.wakeup_reason = WakeupReason::Unblocked;

        let Some(open) = self.tid_open_states.get(&tid).copied() else {
            self.tid_open_states.insert(tid, new_state);
            return None;
        };
        // Wakeups also fire on threads that are already runnable or running;
        // those don't constitute a transition.
        if open.state == ThreadState::Runnable || open.state == ThreadState::Running {
            return None;
        }
        if timestamp_ns < open.begin_timestamp_ns {
            return None;
        }
        self.tid_open_states.insert(tid, new_state);
        Some(open.into_slice(tid, timestamp_ns))
    }

    pub fn on_sched_switch_in(&mut self, timestamp_ns: u64, tid: i32) -> Option<ThreadStateSlice> {
        let new_state = OpenState::new(ThreadState::Running, timestamp_ns);
        let Some(open) = self.tid_open_states.insert(tid, new_state) else {
            return None;
        };
        if open.state == ThreadState::Running || timestamp_ns < open.begin_timestamp_ns {
            return None;
        }
        Some(open.into_slice(tid, timestamp_ns))
    }

    pub fn on_sched_switch_out(
        &mut self,
        timestamp_ns: u64,
        tid: i32,
        new_state: ThreadState,
    ) -> Option<ThreadStateSlice> {
        let open = self
            .tid_open_states
            .insert(tid, OpenState::new(new_state, timestamp_ns))?;
        if timestamp_ns < open.begin_timestamp_ns {
            return None;
        }
        Some(open.into_slice(tid, timestamp_ns))
    }

    /// Closes every open state at `timestamp_ns` and returns the slices.
    pub fn on_capture_finished(&mut self, timestamp_ns: u64) -> Vec<ThreadStateSlice> {
        let mut slices: Vec<ThreadStateSlice> = self
            .tid_open_states
            .drain()
            .filter(|(_, open)| open.begin_timestamp_ns <= timestamp_ns)
            .map(|(tid, open)| open.into_slice(tid, timestamp_ns))
            .collect();
        slices.sort_by_key(|slice| (slice.tid, slice.begin_timestamp_ns));
        slices
    }
}

/// Maps the `prev_state` bits of sched_switch to the state the thread enters
/// when it is switched out.
pub fn thread_state_from_prev_state(prev_state: i64) -> ThreadState {
    // Masks from the kernel's TASK_* report set; only the lowest set bit
    // counts.
    if prev_state & 0x01 != 0 {
        ThreadState::InterruptibleSleep
    } else if prev_state & 0x02 != 0 {
        ThreadState::UninterruptibleSleep
    } else if prev_state & 0x04 != 0 {
        ThreadState::Stopped
    } else if prev_state & 0x08 != 0 {
        ThreadState::TracingStop
    } else if prev_state & 0x10 != 0 {
        ThreadState::Dead
    } else if prev_state & 0x20 != 0 {
        ThreadState::Zombie
    } else if prev_state & 0x40 != 0 {
        ThreadState::Parked
    } else if prev_state & 0x80 != 0 {
        ThreadState::Idle
    } else {
        // prev_state == 0 is 'R': preempted while still runnable.
        ThreadState::Runnable
    }
}

struct OpenCoreSlice {
    tid: i32,
    pid: i32,
    in_timestamp_ns: u64,
}

/// Visitor deriving scheduling slices, thread-state slices, thread names,
/// and user-requested tracepoint events.
pub struct SwitchesStatesNamesVisitor {
    listener: Box<dyn TracerListener>,
    stats: Arc<TracingStats>,
    target_pid: i32,
    collect_scheduling_info: bool,
    collect_thread_state: bool,
    target_tids: FxHashSet<i32>,
    tid_to_pid: FxHashMap<i32, i32>,
    state_manager: ThreadStateManager,
    core_open_slices: FxHashMap<u32, OpenCoreSlice>,
    selected_tracepoints: Vec<orbit_proto::TracepointInfo>,
}

impl SwitchesStatesNamesVisitor {
    pub fn new(
        listener: Box<dyn TracerListener>,
        stats: Arc<TracingStats>,
        target_pid: i32,
        collect_scheduling_info: bool,
        collect_thread_state: bool,
    ) -> Self {
        SwitchesStatesNamesVisitor {
            listener,
            stats,
            target_pid,
            collect_scheduling_info,
            collect_thread_state,
            target_tids: FxHashSet::default(),
            tid_to_pid: FxHashMap::default(),
            state_manager: ThreadStateManager::default(),
            core_open_slices: FxHashMap::default(),
            selected_tracepoints: Vec::new(),
        }
    }

    /// The tracepoints instrumented on user request, in key order.
    pub fn set_selected_tracepoints(&mut self, tracepoints: Vec<orbit_proto::TracepointInfo>) {
        self.selected_tracepoints = tracepoints;
    }

    /// Seeds the tid set from `/proc/<pid>/task` and records the initial
    /// state of every already-running thread.
    pub fn process_initial_tids(&mut self, timestamp_ns: u64, tids: &[i32]) {
        for &tid in tids {
            self.target_tids.insert(tid);
            self.tid_to_pid.insert(tid, self.target_pid);
            // We don't know whether the thread is on-cpu right now; the
            // first sched_switch will correct us.
            self.state_manager
                .on_initial_state(timestamp_ns, tid, ThreadState::Runnable);
        }
    }

    fn is_target_tid(&self, tid: i32) -> bool {
        self.target_tids.contains(&tid)
    }

    fn emit_state_slice(&mut self, slice: Option<ThreadStateSlice>) {
        if let Some(slice) = slice {
            TracingStats::increment(&self.stats.thread_state_slice_count);
            self.listener.on_thread_state_slice(slice);
        }
    }

}

impl PerfEventVisitor for SwitchesStatesNamesVisitor {
    fn visit_fork(&mut self, _timestamp: u64, data: &ForkPerfEvent) {
        if data.pid == self.target_pid {
            self.target_tids.insert(data.tid);
            self.tid_to_pid.insert(data.tid, data.pid);
        }
    }

    fn visit_exit(&mut self, _timestamp: u64, data: &ExitPerfEvent) {
        // The mapping is kept so the thread's last state slice can still be
        // attributed when it is flushed.
        let _ = data;
    }

    fn visit_task_newtask(&mut self, timestamp: u64, data: &TaskNewtaskPerfEvent) {
        if data.was_created_by_pid == self.target_pid {
            self.target_tids.insert(data.new_tid);
            self.tid_to_pid.insert(data.new_tid, self.target_pid);
            if self.collect_thread_state {
                self.state_manager.on_new_task(
                    timestamp,
                    data.new_tid,
                    data.was_created_by_tid,
                    data.was_created_by_pid,
                );
            }
        }
        let name_end = data.comm.iter().position(|&b| b == 0).unwrap_or(16);
        self.listener.on_thread_name(ThreadName {
            pid: self.tid_to_pid.get(&data.new_tid).copied().unwrap_or(-1),
            tid: data.new_tid,
            name: String::from_utf8_lossy(&data.comm[..name_end]).into_owned(),
            timestamp_ns: timestamp,
        });
    }

    fn visit_task_rename(&mut self, timestamp: u64, data: &TaskRenamePerfEvent) {
        let name_end = data.newcomm.iter().position(|&b| b == 0).unwrap_or(16);
        self.listener.on_thread_name(ThreadName {
            pid: self
                .tid_to_pid
                .get(&data.renamed_tid)
                .copied()
                .unwrap_or(-1),
            tid: data.renamed_tid,
            name: String::from_utf8_lossy(&data.newcomm[..name_end]).into_owned(),
            timestamp_ns: timestamp,
        });
    }

    fn visit_sched_switch(&mut self, timestamp: u64, data: &SchedSwitchPerfEvent) {
        if self.collect_scheduling_info {
            // Close the core's open slice for the thread being switched out.
            if let Some(open) = self.core_open_slices.remove(&data.cpu) {
                if open.tid == data.prev_tid && timestamp >= open.in_timestamp_ns {
                    self.listener.on_scheduling_slice(SchedulingSlice {
                        pid: open.pid,
                        tid: open.tid,
                        core: data.cpu as i32,
                        duration_ns: timestamp - open.in_timestamp_ns,
                        out_timestamp_ns: timestamp,
                    });
                }
            }
            if data.next_tid != 0 {
                self.core_open_slices.insert(
                    data.cpu,
                    OpenCoreSlice {
                        tid: data.next_tid,
                        pid: self.tid_to_pid.get(&data.next_tid).copied().unwrap_or(-1),
                        in_timestamp_ns: timestamp,
                    },
                );
            }
        }

        if self.collect_thread_state {
            if self.is_target_tid(data.prev_tid) {
                let new_state = thread_state_from_prev_state(data.prev_state);
                let slice =
                    self.state_manager
                        .on_sched_switch_out(timestamp, data.prev_tid, new_state);
                self.emit_state_slice(slice);
            }
            if self.is_target_tid(data.next_tid) {
                let slice = self.state_manager.on_sched_switch_in(timestamp, data.next_tid);
                self.emit_state_slice(slice);
            }
        }
    }

    fn visit_sched_wakeup(&mut self, timestamp: u64, data: &SchedWakeupPerfEvent) {
        if !self.collect_thread_state || !self.is_target_tid(data.woken_tid) {
            return;
        }
        let slice = self.state_manager.on_sched_wakeup(
            timestamp,
            data.woken_tid,
            data.was_unblocked_by_tid,
            data.was_unblocked_by_pid,
        );
        self.emit_state_slice(slice);
    }

    fn visit_capture_finished(&mut self, timestamp: u64) {
        if !self.collect_thread_state {
            return;
        }
        for slice in self.state_manager.on_capture_finished(timestamp) {
            TracingStats::increment(&self.stats.thread_state_slice_count);
            self.listener.on_thread_state_slice(slice);
        }
    }

    fn visit_generic_tracepoint(&mut self, timestamp: u64, data: &GenericTracepointPerfEvent) {
        self.listener.on_tracepoint_event(FullTracepointEvent {
            pid: data.pid,
            tid: data.tid,
            timestamp_ns: timestamp,
            cpu: data.cpu as i32,
            tracepoint_info: self
                .selected_tracepoints
                .get(data.tracepoint_key as usize)
                .cloned(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prev_state_bits_map_to_states() {
        assert_eq!(thread_state_from_prev_state(0), ThreadState::Runnable);
        assert_eq!(
            thread_state_from_prev_state(0x01),
            ThreadState::InterruptibleSleep
        );
        assert_eq!(
            thread_state_from_prev_state(0x02),
            ThreadState::UninterruptibleSleep
        );
        assert_eq!(thread_state_from_prev_state(0x04), ThreadState::Stopped);
        assert_eq!(thread_state_from_prev_state(0x20), ThreadState::Zombie);
        assert_eq!(thread_state_from_prev_state(0x80), ThreadState::Idle);
    }

    #[test]
    fn switch_wakeup_switch_sequence_produces_expected_slices() {
        let mut manager = ThreadStateManager::default();
        let tid = 7;
        manager.on_initial_state(0, tid, ThreadState::Running);

        // Switched out into interruptible sleep at t=100.
        let slice = manager
            .on_sched_switch_out(100, tid, ThreadState::InterruptibleSleep)
            .unwrap();
        assert_eq!(slice.thread_state, ThreadState::Running as i32);
        assert_eq!(slice.begin_timestamp_ns, 0);
        assert_eq!(slice.end_timestamp_ns, 100);

        // Woken by tid 42 at t=200.
        let slice = manager.on_sched_wakeup(200, tid, 42, 41).unwrap();
        assert_eq!(slice.thread_state, ThreadState::InterruptibleSleep as i32);
        assert_eq!(slice.begin_timestamp_ns, 100);
        assert_eq!(slice.end_timestamp_ns, 200);

        // Switched in at t=210.
        let slice = manager.on_sched_switch_in(210, tid).unwrap();
        assert_eq!(slice.thread_state, ThreadState::Runnable as i32);
        assert_eq!(slice.begin_timestamp_ns, 200);
        assert_eq!(slice.end_timestamp_ns, 210);
        assert_eq!(slice.wakeup_tid, 42);
        assert_eq!(slice.wakeup_pid, 41);
        assert_eq!(slice.wakeup_reason, WakeupReason::Unblocked as i32);

        // Capture finishes at t=300: the open Running state is flushed.
        let slices = manager.on_capture_finished(300);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].thread_state, ThreadState::Running as i32);
        assert_eq!(slices[0].begin_timestamp_ns, 210);
        assert_eq!(slices[0].end_timestamp_ns, 300);
    }

    #[test]
    fn wakeup_of_runnable_thread_is_not_a_transition() {
        let mut manager = ThreadStateManager::default();
        manager.on_new_task(100, 7, 1, 1);
        assert!(manager.on_sched_wakeup(150, 7, 2, 2).is_none());
        // The original Runnable state is still open, with its creation info.
        let slices = manager.on_capture_finished(200);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].begin_timestamp_ns, 100);
        assert_eq!(slices[0].wakeup_reason, WakeupReason::Created as i32);
    }

    #[test]
    fn slices_of_one_thread_are_contiguous_and_non_overlapping() {
        let mut manager = ThreadStateManager::default();
        let tid = 9;
        manager.on_initial_state(0, tid, ThreadState::Runnable);
        let mut slices = Vec::new();
        let mut push = |slice: Option<ThreadStateSlice>| slices.extend(slice);
        push(manager.on_sched_switch_in(10, tid));
        push(manager.on_sched_switch_out(25, tid, ThreadState::InterruptibleSleep));
        push(manager.on_sched_wakeup(40, tid, 1, 1));
        push(manager.on_sched_switch_in(55, tid));
        slices.extend(manager.on_capture_finished(80));

        for window in slices.windows(2) {
            assert_eq!(window[0].end_timestamp_ns, window[1].begin_timestamp_ns);
            assert!(window[0].begin_timestamp_ns <= window[0].end_timestamp_ns);
        }
        assert_eq!(slices.first().unwrap().begin_timestamp_ns, 0);
        assert_eq!(slices.last().unwrap().end_timestamp_ns, 80);
    }
}
