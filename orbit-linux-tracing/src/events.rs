use std::os::unix::io::RawFd;

use crate::perf_event_sys::{PERF_REG_X86_BP, PERF_REG_X86_IP, PERF_REG_X86_SP, PERF_REG_X86_64_MAX};

/// Identity of the ordered stream an event belongs to. Timestamps are
/// monotonic within a stream, not across streams. Events with `None`
/// participate in the global ordering purely by timestamp; this is needed for
/// sources that are out of order even within a single ring buffer
/// (dma_fence_signaled on some drivers) and for events we synthesize
/// ourselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PerfEventOrderedStream {
    None,
    FileDescriptor(RawFd),
    ThreadId(i32),
}

/// User-space register dump of a sample, in perf regs order.
#[derive(Debug, Clone)]
pub struct Registers(pub [u64; PERF_REG_X86_64_MAX]);

impl Registers {
    pub fn ip(&self) -> u64 {
        self.0[PERF_REG_X86_IP as usize]
    }

    pub fn sp(&self) -> u64 {
        self.0[PERF_REG_X86_SP as usize]
    }

    pub fn bp(&self) -> u64 {
        self.0[PERF_REG_X86_BP as usize]
    }
}

impl Default for Registers {
    fn default() -> Self {
        Registers([0; PERF_REG_X86_64_MAX])
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ForkPerfEvent {
    pub pid: i32,
    pub tid: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct ExitPerfEvent {
    pub pid: i32,
    pub tid: i32,
}

/// The kernel dropped records on this ring between `previous_timestamp` and
/// the event's own timestamp.
#[derive(Debug, Clone, Copy)]
pub struct LostPerfEvent {
    pub previous_timestamp: u64,
}

/// Synthesized by the event processor when events arrived too late to be
/// ordered. Covers `[begin_timestamp_ns, timestamp]` and counts the events
/// whose content was lost.
#[derive(Debug, Clone, Copy)]
pub struct DiscardedPerfEvent {
    pub begin_timestamp_ns: u64,
    pub count: u64,
}

/// A sample carrying a register dump and a copy of the user stack, to be
/// unwound with DWARF CFI.
#[derive(Debug, Clone)]
pub struct StackSamplePerfEvent {
    pub pid: i32,
    pub tid: i32,
    pub regs: Registers,
    pub dyn_size: u64,
    pub stack: Vec<u8>,
}

/// A sample carrying a kernel-built callchain plus a small stack copy used
/// for leaf-caller patching.
#[derive(Debug, Clone)]
pub struct CallchainSamplePerfEvent {
    pub pid: i32,
    pub tid: i32,
    pub ips: Vec<u64>,
    pub regs: Registers,
    pub dyn_size: u64,
    pub stack: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct UprobesPerfEvent {
    pub pid: i32,
    pub tid: i32,
    pub cpu: u32,
    pub function_id: u64,
    pub sp: u64,
    pub ip: u64,
    pub return_address: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct UretprobesPerfEvent {
    pub pid: i32,
    pub tid: i32,
    /// Stack pointer after the return, used to resynchronize the shadow
    /// stack.
    pub sp: u64,
    /// rax at function exit, the integer return value.
    pub ax: u64,
}

/// FunctionEntry reported by user-space instrumentation. Processed here,
/// alongside uprobes, because unwinding and instrumentation have to agree on
/// the shadow stack.
#[derive(Debug, Clone, Copy)]
pub struct UserSpaceFunctionEntryPerfEvent {
    pub pid: i32,
    pub tid: i32,
    pub function_id: u64,
    pub sp: u64,
    pub return_address: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct UserSpaceFunctionExitPerfEvent {
    pub pid: i32,
    pub tid: i32,
}

#[derive(Debug, Clone)]
pub struct MmapPerfEvent {
    pub pid: i32,
    pub address: u64,
    pub length: u64,
    pub page_offset: u64,
    pub filename: String,
    pub executable: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct GenericTracepointPerfEvent {
    pub pid: i32,
    pub tid: i32,
    pub cpu: u32,
    /// Index into the selected-tracepoints list registered at capture start.
    pub tracepoint_key: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct TaskNewtaskPerfEvent {
    pub comm: [u8; 16],
    pub new_tid: i32,
    pub was_created_by_tid: i32,
    pub was_created_by_pid: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct TaskRenamePerfEvent {
    pub newcomm: [u8; 16],
    pub renamed_tid: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedSwitchPerfEvent {
    pub cpu: u32,
    /// Pid of the process being switched out, or -1 when it could not be
    /// established from the common fields.
    pub prev_pid_or_minus_one: i32,
    pub prev_tid: i32,
    pub prev_state: i64,
    pub next_tid: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedWakeupPerfEvent {
    pub woken_tid: i32,
    pub was_unblocked_by_tid: i32,
    pub was_unblocked_by_pid: i32,
}

#[derive(Debug, Clone)]
pub struct AmdgpuCsIoctlPerfEvent {
    pub pid: i32,
    pub tid: i32,
    pub context: u32,
    pub seqno: u32,
    pub timeline: String,
}

#[derive(Debug, Clone)]
pub struct AmdgpuSchedRunJobPerfEvent {
    pub pid: i32,
    pub tid: i32,
    pub context: u32,
    pub seqno: u32,
    pub timeline: String,
}

#[derive(Debug, Clone)]
pub struct DmaFenceSignaledPerfEvent {
    pub pid: i32,
    pub tid: i32,
    pub context: u32,
    pub seqno: u32,
    pub timeline: String,
}

/// The data of one perf event, over all record shapes we collect. A plain
/// enum keeps per-event dispatch at a predictable branch and avoids a heap
/// allocation per event for the small variants.
#[derive(Debug, Clone)]
pub enum PerfEventData {
    Fork(ForkPerfEvent),
    Exit(ExitPerfEvent),
    Lost(LostPerfEvent),
    Discarded(DiscardedPerfEvent),
    StackSample(StackSamplePerfEvent),
    CallchainSample(CallchainSamplePerfEvent),
    Uprobes(UprobesPerfEvent),
    Uretprobes(UretprobesPerfEvent),
    UserSpaceFunctionEntry(UserSpaceFunctionEntryPerfEvent),
    UserSpaceFunctionExit(UserSpaceFunctionExitPerfEvent),
    Mmap(MmapPerfEvent),
    GenericTracepoint(GenericTracepointPerfEvent),
    TaskNewtask(TaskNewtaskPerfEvent),
    TaskRename(TaskRenamePerfEvent),
    SchedSwitch(SchedSwitchPerfEvent),
    SchedWakeup(SchedWakeupPerfEvent),
    AmdgpuCsIoctl(AmdgpuCsIoctlPerfEvent),
    AmdgpuSchedRunJob(AmdgpuSchedRunJobPerfEvent),
    DmaFenceSignaled(DmaFenceSignaledPerfEvent),
}

/// One event, with the fields common to all record shapes lifted out of the
/// variant: the kernel timestamp and the identity of the ordered stream the
/// event was read from.
#[derive(Debug, Clone)]
pub struct PerfEvent {
    pub timestamp: u64,
    pub ordered_stream: PerfEventOrderedStream,
    pub data: PerfEventData,
}

impl PerfEvent {
    pub fn accept(&self, visitor: &mut dyn PerfEventVisitor) {
        match &self.data {
            PerfEventData::Fork(data) => visitor.visit_fork(self.timestamp, data),
            PerfEventData::Exit(data) => visitor.visit_exit(self.timestamp, data),
            PerfEventData::Lost(data) => visitor.visit_lost(self.timestamp, data),
            PerfEventData::Discarded(data) => visitor.visit_discarded(self.timestamp, data),
            PerfEventData::StackSample(data) => visitor.visit_stack_sample(self.timestamp, data),
            PerfEventData::CallchainSample(data) => {
                visitor.visit_callchain_sample(self.timestamp, data)
            }
            PerfEventData::Uprobes(data) => visitor.visit_uprobes(self.timestamp, data),
            PerfEventData::Uretprobes(data) => visitor.visit_uretprobes(self.timestamp, data),
            PerfEventData::UserSpaceFunctionEntry(data) => {
                visitor.visit_user_space_function_entry(self.timestamp, data)
            }
            PerfEventData::UserSpaceFunctionExit(data) => {
                visitor.visit_user_space_function_exit(self.timestamp, data)
            }
            PerfEventData::Mmap(data) => visitor.visit_mmap(self.timestamp, data),
            PerfEventData::GenericTracepoint(data) => {
                visitor.visit_generic_tracepoint(self.timestamp, data)
            }
            PerfEventData::TaskNewtask(data) => visitor.visit_task_newtask(self.timestamp, data),
            PerfEventData::TaskRename(data) => visitor.visit_task_rename(self.timestamp, data),
            PerfEventData::SchedSwitch(data) => visitor.visit_sched_switch(self.timestamp, data),
            PerfEventData::SchedWakeup(data) => visitor.visit_sched_wakeup(self.timestamp, data),
            PerfEventData::AmdgpuCsIoctl(data) => {
                visitor.visit_amdgpu_cs_ioctl(self.timestamp, data)
            }
            PerfEventData::AmdgpuSchedRunJob(data) => {
                visitor.visit_amdgpu_sched_run_job(self.timestamp, data)
            }
            PerfEventData::DmaFenceSignaled(data) => {
                visitor.visit_dma_fence_signaled(self.timestamp, data)
            }
        }
    }
}

/// Visitor over the event variants. All methods default to no-ops so that
/// each visitor only spells out the events it cares about.
#[allow(unused_variables)]
pub trait PerfEventVisitor {
    fn visit_fork(&mut self, timestamp: u64, data: &ForkPerfEvent) {}
    fn visit_exit(&mut self, timestamp: u64, data: &ExitPerfEvent) {}
    fn visit_lost(&mut self, timestamp: u64, data: &LostPerfEvent) {}
    fn visit_discarded(&mut self, timestamp: u64, data: &DiscardedPerfEvent) {}
    fn visit_stack_sample(&mut self, timestamp: u64, data: &StackSamplePerfEvent) {}
    fn visit_callchain_sample(&mut self, timestamp: u64, data: &CallchainSamplePerfEvent) {}
    fn visit_uprobes(&mut self, timestamp: u64, data: &UprobesPerfEvent) {}
    fn visit_uretprobes(&mut self, timestamp: u64, data: &UretprobesPerfEvent) {}
    fn visit_user_space_function_entry(
        &mut self,
        timestamp: u64,
        data: &UserSpaceFunctionEntryPerfEvent,
    ) {
    }
    fn visit_user_space_function_exit(
        &mut self,
        timestamp: u64,
        data: &UserSpaceFunctionExitPerfEvent,
    ) {
    }
    fn visit_mmap(&mut self, timestamp: u64, data: &MmapPerfEvent) {}
    fn visit_generic_tracepoint(&mut self, timestamp: u64, data: &GenericTracepointPerfEvent) {}
    fn visit_task_newtask(&mut self, timestamp: u64, data: &TaskNewtaskPerfEvent) {}
    fn visit_task_rename(&mut self, timestamp: u64, data: &TaskRenamePerfEvent) {}
    fn visit_sched_switch(&mut self, timestamp: u64, data: &SchedSwitchPerfEvent) {}
    fn visit_sched_wakeup(&mut self, timestamp: u64, data: &SchedWakeupPerfEvent) {}
    fn visit_amdgpu_cs_ioctl(&mut self, timestamp: u64, data: &AmdgpuCsIoctlPerfEvent) {}
    fn visit_amdgpu_sched_run_job(&mut self, timestamp: u64, data: &AmdgpuSchedRunJobPerfEvent) {}
    fn visit_dma_fence_signaled(&mut self, timestamp: u64, data: &DmaFenceSignaledPerfEvent) {}
    /// Called once after the last event, with the capture end timestamp.
    /// Visitors flush whatever they hold open.
    fn visit_capture_finished(&mut self, timestamp: u64) {}
}
