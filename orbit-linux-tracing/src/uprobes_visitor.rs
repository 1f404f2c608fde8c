//! The visitor tying unwinding, dynamic instrumentation, and the shadow
//! stack together.
//!
//! Stack and callchain samples, uprobes/uretprobes, user-space function
//! entry/exit, and mmap events all end up here because they have to agree on
//! shared state: the process memory map, the per-thread shadow stacks, and
//! the unwinder's module list.

use std::sync::Arc;

use orbit_proto::callstack::CallstackType;
use orbit_proto::{Callstack, FullCallstackSample};

use crate::events::*;
use crate::function_calls::UprobesFunctionCallManager;
use crate::leaf_functions::LeafFunctionCallManager;
use crate::listener::TracerListener;
use crate::maps::{MemoryMapping, MemoryMaps};
use crate::perf_event_sys::PERF_CONTEXT_MAX;
use crate::return_addresses::UprobesReturnAddressManager;
use crate::stats::TracingStats;
use crate::unwinding::DwarfUnwinder;

pub struct UprobesUnwindingVisitor {
    listener: Box<dyn TracerListener>,
    stats: Arc<TracingStats>,
    target_pid: i32,
    maps: MemoryMaps,
    unwinder: DwarfUnwinder,
    return_address_manager: UprobesReturnAddressManager,
    function_call_manager: UprobesFunctionCallManager,
    leaf_function_call_manager: LeafFunctionCallManager,
}

impl UprobesUnwindingVisitor {
    pub fn new(
        listener: Box<dyn TracerListener>,
        stats: Arc<TracingStats>,
        target_pid: i32,
        initial_maps: MemoryMaps,
        stack_dump_size: u16,
    ) -> Self {
        let mut unwinder = DwarfUnwinder::default();
        for mapping in initial_maps.mappings() {
            if mapping.executable {
                unwinder.add_mapped_module(mapping);
            }
        }
        UprobesUnwindingVisitor {
            listener,
            stats,
            target_pid,
            maps: initial_maps,
            unwinder,
            return_address_manager: UprobesReturnAddressManager::default(),
            function_call_manager: UprobesFunctionCallManager::default(),
            leaf_function_call_manager: LeafFunctionCallManager::new(stack_dump_size),
        }
    }

    pub fn shadow_stack_mismatches(&self) -> u64 {
        self.return_address_manager.mismatch_count()
    }

    fn emit_sample(
        &mut self,
        timestamp: u64,
        pid: i32,
        tid: i32,
        frames: Vec<u64>,
        callstack_type: CallstackType,
    ) {
        if callstack_type != CallstackType::Complete {
            TracingStats::increment(&self.stats.unwind_error_count);
        }
        self.listener.on_callstack_sample(FullCallstackSample {
            pid,
            tid,
            callstack: Some(Callstack {
                frames,
                r#type: callstack_type as i32,
            }),
            timestamp_ns: timestamp,
        });
    }
}

impl PerfEventVisitor for UprobesUnwindingVisitor {
    fn visit_stack_sample(&mut self, timestamp: u64, data: &StackSamplePerfEvent) {
        TracingStats::increment(&self.stats.sample_count);
        if data.pid != self.target_pid {
            TracingStats::increment(&self.stats.samples_from_other_processes_count);
            return;
        }

        let ip = data.regs.ip();
        if self.maps.is_in_uprobes(ip) {
            TracingStats::increment(&self.stats.samples_in_uprobes_count);
            self.emit_sample(timestamp, data.pid, data.tid, vec![ip], CallstackType::InUprobes);
            return;
        }

        // Restore hijacked return addresses in the snapshot before walking
        // it.
        let mut stack = data.stack.clone();
        self.return_address_manager
            .patch_sample(data.tid, data.regs.sp(), &mut stack);

        let result = self
            .unwinder
            .unwind(&data.regs, &stack, data.dyn_size, &self.maps);
        self.emit_sample(
            timestamp,
            data.pid,
            data.tid,
            result.frames,
            result.callstack_type,
        );
    }

    fn visit_callchain_sample(&mut self, timestamp: u64, data: &CallchainSamplePerfEvent) {
        TracingStats::increment(&self.stats.sample_count);
        if data.pid != self.target_pid {
            TracingStats::increment(&self.stats.samples_from_other_processes_count);
            return;
        }

        // Remove the kernel's context marker frames; real addresses remain.
        let mut event = data.clone();
        event.ips.retain(|&frame| frame < PERF_CONTEXT_MAX);
        if event.ips.is_empty() {
            return;
        }

        let innermost = event.ips[0];
        if self.maps.is_in_uprobes(innermost) {
            TracingStats::increment(&self.stats.samples_in_uprobes_count);
            self.emit_sample(
                timestamp,
                data.pid,
                data.tid,
                vec![innermost],
                CallstackType::InUprobes,
            );
            return;
        }

        if !self
            .return_address_manager
            .patch_callchain(data.tid, &mut event.ips, &self.maps)
        {
            TracingStats::increment(&self.stats.samples_in_uprobes_count);
            self.emit_sample(
                timestamp,
                data.pid,
                data.tid,
                vec![innermost],
                CallstackType::InUprobes,
            );
            return;
        }

        let callstack_type = self.leaf_function_call_manager.patch_caller_of_leaf_function(
            &mut event,
            &self.maps,
            &mut self.unwinder,
        );
        self.emit_sample(timestamp, data.pid, data.tid, event.ips, callstack_type);
    }

    fn visit_uprobes(&mut self, timestamp: u64, data: &UprobesPerfEvent) {
        if data.pid != self.target_pid {
            return;
        }
        self.function_call_manager
            .process_function_entry(data.tid, data.function_id, timestamp);
        self.return_address_manager
            .process_function_entry(data.tid, data.return_address, data.sp);
    }

    fn visit_uretprobes(&mut self, timestamp: u64, data: &UretprobesPerfEvent) {
        if data.pid != self.target_pid {
            return;
        }
        if let Some(function_call) = self.function_call_manager.process_function_exit(
            data.pid,
            data.tid,
            timestamp,
            Some(data.ax),
        ) {
            self.listener.on_function_call(function_call);
        }
        self.return_address_manager
            .process_uretprobe(data.tid, data.sp);
    }

    fn visit_user_space_function_entry(
        &mut self,
        timestamp: u64,
        data: &UserSpaceFunctionEntryPerfEvent,
    ) {
        self.function_call_manager
            .process_function_entry(data.tid, data.function_id, timestamp);
        self.return_address_manager
            .process_function_entry(data.tid, data.return_address, data.sp);
    }

    fn visit_user_space_function_exit(
        &mut self,
        timestamp: u64,
        data: &UserSpaceFunctionExitPerfEvent,
    ) {
        if let Some(function_call) =
            self.function_call_manager
                .process_function_exit(data.pid, data.tid, timestamp, None)
        {
            self.listener.on_function_call(function_call);
        }
        self.return_address_manager.process_function_exit(data.tid);
    }

    fn visit_mmap(&mut self, _timestamp: u64, data: &MmapPerfEvent) {
        if data.pid != self.target_pid {
            return;
        }
        let mapping = MemoryMapping {
            start: data.address,
            end: data.address + data.length,
            file_offset: data.page_offset,
            executable: data.executable,
            path: data.filename.clone(),
        };
        if mapping.executable {
            self.unwinder.add_mapped_module(&mapping);
        }
        self.maps.insert(mapping);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_proto::FunctionCall;
    use std::sync::Mutex;

    #[derive(Default, Clone)]
    struct Collector {
        samples: Arc<Mutex<Vec<FullCallstackSample>>>,
        function_calls: Arc<Mutex<Vec<FunctionCall>>>,
    }

    impl TracerListener for Collector {
        fn on_callstack_sample(&mut self, sample: FullCallstackSample) {
            self.samples.lock().unwrap().push(sample);
        }

        fn on_function_call(&mut self, function_call: FunctionCall) {
            self.function_calls.lock().unwrap().push(function_call);
        }
    }

    const MAPS: &str = "\
100000-200000 r-xp 00000000 fd:00 1 /bin/app
7f0000000000-7f0000001000 r-xp 00000000 00:00 0 [uprobes]
";

    fn make_visitor(target_pid: i32) -> (UprobesUnwindingVisitor, Collector) {
        let collector = Collector::default();
        let visitor = UprobesUnwindingVisitor::new(
            Box::new(collector.clone()),
            Arc::default(),
            target_pid,
            MemoryMaps::parse(MAPS),
            1024,
        );
        (visitor, collector)
    }

    fn callchain_sample(pid: i32, tid: i32, ips: Vec<u64>) -> CallchainSamplePerfEvent {
        CallchainSamplePerfEvent {
            pid,
            tid,
            ips,
            regs: Registers::default(),
            dyn_size: 0,
            stack: Vec::new(),
        }
    }

    #[test]
    fn sample_from_other_process_is_dropped() {
        let (mut visitor, collector) = make_visitor(10);
        visitor.visit_callchain_sample(100, &callchain_sample(99, 99, vec![0x100100]));
        assert!(collector.samples.lock().unwrap().is_empty());
    }

    #[test]
    fn sample_inside_uprobes_map_keeps_only_innermost_frame() {
        let (mut visitor, collector) = make_visitor(10);
        visitor.visit_callchain_sample(
            100,
            &callchain_sample(10, 11, vec![0x7f0000000100, 0x100200]),
        );
        let samples = collector.samples.lock().unwrap();
        assert_eq!(samples.len(), 1);
        let callstack = samples[0].callstack.as_ref().unwrap();
        assert_eq!(callstack.frames, vec![0x7f0000000100]);
        assert_eq!(callstack.r#type, CallstackType::InUprobes as i32);
    }

    #[test]
    fn trampoline_frames_are_patched_with_shadow_stack() {
        let (mut visitor, collector) = make_visitor(10);
        visitor.visit_uprobes(
            50,
            &UprobesPerfEvent {
                pid: 10,
                tid: 11,
                cpu: 0,
                function_id: 1,
                sp: 0x8000,
                ip: 0x100400,
                return_address: 0x100999,
            },
        );
        visitor.visit_callchain_sample(
            100,
            &callchain_sample(10, 11, vec![0x100400, 0x7f0000000100, 0x100500]),
        );
        let samples = collector.samples.lock().unwrap();
        let callstack = samples[0].callstack.as_ref().unwrap();
        assert_eq!(callstack.frames, vec![0x100400, 0x100999, 0x100500]);
    }

    #[test]
    fn uprobe_and_uretprobe_produce_a_function_call() {
        let (mut visitor, collector) = make_visitor(10);
        visitor.visit_uprobes(
            100,
            &UprobesPerfEvent {
                pid: 10,
                tid: 11,
                cpu: 0,
                function_id: 7,
                sp: 0x8000,
                ip: 0x100400,
                return_address: 0x100999,
            },
        );
        visitor.visit_uretprobes(
            250,
            &UretprobesPerfEvent {
                pid: 10,
                tid: 11,
                sp: 0x8008,
                ax: 5,
            },
        );
        let calls = collector.function_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function_id, 7);
        assert_eq!(calls[0].duration_ns, 150);
        assert_eq!(calls[0].end_timestamp_ns, 250);
        assert_eq!(calls[0].return_value, 5);
        assert_eq!(visitor.shadow_stack_mismatches(), 0);
    }
}
