//! Undoing uretprobe return-address hijacking.
//!
//! When a uretprobe is installed, the kernel overwrites the callee's on-stack
//! return address with the address of a trampoline in the `[uprobes]`
//! mapping. An unwinder walking such a stack sees the trampoline instead of
//! the real caller. This module keeps, per thread, a shadow stack of the
//! still-open instrumented calls, and uses it to restore the real return
//! addresses in stack snapshots and kernel callchains.
//!
//! User-space instrumentation hijacks return addresses the same way and
//! reports FunctionEntry/FunctionExit, so it shares this mechanism.

use rustc_hash::FxHashMap;

use crate::maps::MemoryMaps;

#[derive(Debug, Clone, Copy)]
struct OpenFunctionCall {
    return_address: u64,
    // Stack pointer at function entry: the address of the hijacked return
    // address slot.
    stack_pointer: u64,
}

#[derive(Debug, Default)]
pub struct UprobesReturnAddressManager {
    tid_stacks: FxHashMap<i32, Vec<OpenFunctionCall>>,
    mismatch_count: u64,
}

impl UprobesReturnAddressManager {
    pub fn process_function_entry(&mut self, tid: i32, return_address: u64, stack_pointer: u64) {
        let stack = self.tid_stacks.entry(tid).or_default();
        if let Some(top) = stack.last() {
            // Deeper calls must have smaller stack pointers.
            if stack_pointer > top.stack_pointer {
                log::warn!("function entry on tid {tid} above the open call it nests in");
            }
        }
        stack.push(OpenFunctionCall {
            return_address,
            stack_pointer,
        });
    }

    /// FunctionExit from user-space instrumentation: the exit event is
    /// guaranteed paired by the instrumentation, so this is a plain pop.
    pub fn process_function_exit(&mut self, tid: i32) {
        if let Some(stack) = self.tid_stacks.get_mut(&tid) {
            stack.pop();
            if stack.is_empty() {
                self.tid_stacks.remove(&tid);
            }
        }
    }

    /// A uretprobe fired with the post-return stack pointer `sp`. The entry
    /// being closed is the deepest one with `stack_pointer < sp`; anything
    /// deeper is a call whose uretprobe we missed and is popped too, counted
    /// as a mismatch.
    pub fn process_uretprobe(&mut self, tid: i32, sp: u64) {
        let Some(stack) = self.tid_stacks.get_mut(&tid) else {
            self.mismatch_count += 1;
            return;
        };
        let mut popped = 0u64;
        while let Some(top) = stack.last() {
            if top.stack_pointer >= sp {
                break;
            }
            stack.pop();
            popped += 1;
        }
        match popped {
            0 => self.mismatch_count += 1,
            n => self.mismatch_count += n - 1,
        }
        if stack.is_empty() {
            self.tid_stacks.remove(&tid);
        }
    }

    /// Restores hijacked return addresses in a stack snapshot before it is
    /// unwound. `stack_start` is the address the first stack byte was copied
    /// from (the sampled stack pointer).
    pub fn patch_sample(&self, tid: i32, stack_start: u64, stack: &mut [u8]) -> bool {
        let Some(open_calls) = self.tid_stacks.get(&tid) else {
            return true;
        };
        for open_call in open_calls {
            let Some(offset) = open_call.stack_pointer.checked_sub(stack_start) else {
                // The call's return-address slot is below the sampled stack
                // pointer; the call has effectively returned already.
                continue;
            };
            let offset = offset as usize;
            if offset + 8 > stack.len() {
                continue;
            }
            stack[offset..offset + 8].copy_from_slice(&open_call.return_address.to_ne_bytes());
        }
        true
    }

    /// Replaces trampoline frames in a kernel callchain with the real return
    /// addresses. Frames are innermost first; the innermost trampoline frame
    /// corresponds to the deepest open call. Returns false when the
    /// callchain's trampoline frames cannot be matched against the shadow
    /// stack.
    pub fn patch_callchain(&self, tid: i32, callchain: &mut [u64], maps: &MemoryMaps) -> bool {
        let trampoline_frames = callchain
            .iter()
            .filter(|&&frame| maps.is_in_uprobes(frame))
            .count();
        if trampoline_frames == 0 {
            return true;
        }
        let Some(open_calls) = self.tid_stacks.get(&tid) else {
            return false;
        };
        if trampoline_frames > open_calls.len() {
            return false;
        }
        let mut replacements = open_calls.iter().rev();
        for frame in callchain.iter_mut() {
            if maps.is_in_uprobes(*frame) {
                let open_call = replacements
                    .next()
                    .expect("counted trampoline frames above");
                *frame = open_call.return_address;
            }
        }
        true
    }

    pub fn open_calls_on_thread(&self, tid: i32) -> usize {
        self.tid_stacks.get(&tid).map_or(0, |stack| stack.len())
    }

    pub fn mismatch_count(&self) -> u64 {
        self.mismatch_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maps::MemoryMaps;

    const MAPS: &str = "\
100000-200000 r-xp 00000000 fd:00 1 /bin/app
7f0000000000-7f0000001000 r-xp 00000000 00:00 0 [uprobes]
";

    #[test]
    fn uretprobe_pops_matching_entry() {
        let mut manager = UprobesReturnAddressManager::default();
        manager.process_function_entry(42, 0x101000, 0x8000);
        manager.process_function_entry(42, 0x102000, 0x7f00);
        // Return of the inner call: sp just above its entry sp.
        manager.process_uretprobe(42, 0x7f08);
        assert_eq!(manager.open_calls_on_thread(42), 1);
        assert_eq!(manager.mismatch_count(), 0);
        manager.process_uretprobe(42, 0x8008);
        assert_eq!(manager.open_calls_on_thread(42), 0);
        assert_eq!(manager.mismatch_count(), 0);
    }

    #[test]
    fn uretprobe_with_missed_exits_pops_and_counts() {
        let mut manager = UprobesReturnAddressManager::default();
        manager.process_function_entry(42, 0x101000, 0x8000);
        manager.process_function_entry(42, 0x102000, 0x7f00);
        manager.process_function_entry(42, 0x103000, 0x7e00);
        // The two inner uretprobes were lost; the outer return has to clear
        // all three entries and count the two excess pops.
        manager.process_uretprobe(42, 0x8008);
        assert_eq!(manager.open_calls_on_thread(42), 0);
        assert_eq!(manager.mismatch_count(), 2);
    }

    #[test]
    fn uretprobe_without_entry_counts_one_mismatch() {
        let mut manager = UprobesReturnAddressManager::default();
        manager.process_uretprobe(42, 0x8008);
        assert_eq!(manager.mismatch_count(), 1);
    }

    #[test]
    fn patch_sample_restores_hijacked_slots() {
        let mut manager = UprobesReturnAddressManager::default();
        manager.process_function_entry(42, 0xaabbccdd, 0x1010);

        // 32 bytes of stack starting at sp 0x1000; the hijacked slot is at
        // offset 0x10.
        let mut stack = vec![0u8; 32];
        stack[0x10..0x18].copy_from_slice(&0x7f0000000100u64.to_ne_bytes());
        assert!(manager.patch_sample(42, 0x1000, &mut stack));
        let patched = u64::from_ne_bytes(stack[0x10..0x18].try_into().unwrap());
        assert_eq!(patched, 0xaabbccdd);
    }

    #[test]
    fn patch_callchain_replaces_trampoline_frames() {
        let maps = MemoryMaps::parse(MAPS);
        let mut manager = UprobesReturnAddressManager::default();
        manager.process_function_entry(42, 0x101111, 0x8000);
        manager.process_function_entry(42, 0x102222, 0x7f00);

        let mut callchain = vec![0x103000, 0x7f0000000100, 0x7f0000000100, 0x100500];
        assert!(manager.patch_callchain(42, &mut callchain, &maps));
        assert_eq!(callchain, vec![0x103000, 0x102222, 0x101111, 0x100500]);
    }

    #[test]
    fn patch_callchain_fails_with_more_trampolines_than_entries() {
        let maps = MemoryMaps::parse(MAPS);
        let mut manager = UprobesReturnAddressManager::default();
        manager.process_function_entry(42, 0x101111, 0x8000);

        let mut callchain = vec![0x103000, 0x7f0000000100, 0x7f0000000100, 0x100500];
        assert!(!manager.patch_callchain(42, &mut callchain, &maps));
    }
}
