//! Patching the caller of a frame-pointer-less leaf function.
//!
//! With frame-pointer unwinding, a leaf function that doesn't set up rbp
//! makes the kernel's callchain walker skip its caller: the chain jumps from
//! the leaf straight to the grandcaller. At the moment of the sample the
//! leaf's return address is still the word at `sp`, so we read it from the
//! small stack copy taken with each callchain sample, validate it, and
//! splice it in between the leaf and the rest of the chain.
//!
//! The whole procedure only applies when the unwind information shows that
//! the leaf does not maintain a frame pointer. If it does, the kernel walker
//! already saw the real caller and the word at `sp` is just a local or a
//! spilled register; splicing it would corrupt a correct chain.

use byteorder::{ByteOrder, NativeEndian};
use orbit_proto::callstack::CallstackType;

use crate::events::CallchainSamplePerfEvent;
use crate::maps::MemoryMaps;
use crate::unwinding::FramePointerProbe;

pub struct LeafFunctionCallManager {
    stack_dump_size: u16,
}

impl LeafFunctionCallManager {
    pub fn new(stack_dump_size: u16) -> Self {
        LeafFunctionCallManager { stack_dump_size }
    }

    /// Attempts to patch `event.ips` in place. The returned type is
    /// `Complete` when the chain is usable afterwards (patched, already
    /// complete, or not a frame-pointer-less leaf in the first place), or
    /// the specific error type when it is not; in the error cases the chain
    /// is left unchanged and the caller keeps the sample with only the
    /// innermost frame trusted.
    pub fn patch_caller_of_leaf_function(
        &self,
        event: &mut CallchainSamplePerfEvent,
        maps: &MemoryMaps,
        unwinder: &mut dyn FramePointerProbe,
    ) -> CallstackType {
        // Index of the innermost user-space frame; everything above it is
        // kernel.
        let Some(leaf_index) = event
            .ips
            .iter()
            .position(|&frame| maps.is_executable(frame))
        else {
            return CallstackType::Complete;
        };
        if leaf_index + 1 >= event.ips.len() {
            return CallstackType::Complete;
        }

        // A leaf with a frame pointer was walked correctly by the kernel;
        // nothing to patch, regardless of the stack dump or registers.
        if unwinder.has_frame_pointer_set(event.ips[leaf_index]) {
            return CallstackType::Complete;
        }

        let sp = event.regs.sp();
        let bp = event.regs.bp();
        if bp < sp {
            return CallstackType::FramePointerUnwindingError;
        }

        let stack_size = event
            .dyn_size
            .min(event.stack.len() as u64)
            .min(self.stack_dump_size as u64);
        if stack_size < 8 {
            return CallstackType::StackTopForDwarfUnwindingTooSmall;
        }

        // The stack copy starts at the sampled stack pointer, so the return
        // address candidate is its first word.
        let candidate = NativeEndian::read_u64(&event.stack[..8]);
        if !maps.is_executable(candidate) {
            return CallstackType::StackTopDwarfUnwindingError;
        }

        // The kernel walker may have found the caller on its own, in which
        // case the candidate is already in the chain.
        if event.ips[leaf_index + 1] == candidate {
            return CallstackType::Complete;
        }

        event.ips.insert(leaf_index + 1, candidate);
        CallstackType::Complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Registers;
    use crate::perf_event_sys::{PERF_REG_X86_BP, PERF_REG_X86_SP};

    const MAPS: &str = "\
0000000000000060-0000000000000400 r-xp 00000000 fd:00 1 /bin/app
";

    struct FakeFramePointerProbe {
        has_frame_pointer: bool,
    }

    impl FramePointerProbe for FakeFramePointerProbe {
        fn has_frame_pointer_set(&mut self, _pc: u64) -> bool {
            self.has_frame_pointer
        }
    }

    fn leaf_without_frame_pointer() -> FakeFramePointerProbe {
        FakeFramePointerProbe {
            has_frame_pointer: false,
        }
    }

    fn leaf_with_frame_pointer() -> FakeFramePointerProbe {
        FakeFramePointerProbe {
            has_frame_pointer: true,
        }
    }

    fn make_event(ips: Vec<u64>, sp: u64, bp: u64, stack: Vec<u8>, dyn_size: u64) -> CallchainSamplePerfEvent {
        let mut regs = Registers::default();
        regs.0[PERF_REG_X86_SP as usize] = sp;
        regs.0[PERF_REG_X86_BP as usize] = bp;
        CallchainSamplePerfEvent {
            pid: 1,
            tid: 1,
            ips,
            regs,
            dyn_size,
            stack,
        }
    }

    #[test]
    fn caller_of_leaf_function_is_spliced_in() {
        let maps = MemoryMaps::parse(MAPS);
        let stack_size = 16u64;
        let mut stack = vec![0u8; stack_size as usize];
        stack[..8].copy_from_slice(&0x201u64.to_ne_bytes());

        // Frame 0x11 is kernel (not in the executable map), 0x100 is the
        // leaf, 0x301 the grandcaller; 0x201 sits on the stack.
        let mut event = make_event(vec![0x11, 0x100, 0x301], 10, 2 * stack_size, stack, stack_size);
        let manager = LeafFunctionCallManager::new(1024);
        let result = manager.patch_caller_of_leaf_function(
            &mut event,
            &maps,
            &mut leaf_without_frame_pointer(),
        );
        assert_eq!(result, CallstackType::Complete);
        assert_eq!(event.ips, vec![0x11, 0x100, 0x201, 0x301]);
    }

    #[test]
    fn too_small_stack_dump_keeps_chain_unchanged() {
        let maps = MemoryMaps::parse(MAPS);
        let mut event = make_event(vec![0x11, 0x100, 0x301], 10, 1 << 20, vec![0u8; 4], 4);
        let manager = LeafFunctionCallManager::new(1024);
        let result = manager.patch_caller_of_leaf_function(
            &mut event,
            &maps,
            &mut leaf_without_frame_pointer(),
        );
        assert_eq!(result, CallstackType::StackTopForDwarfUnwindingTooSmall);
        assert_eq!(event.ips, vec![0x11, 0x100, 0x301]);
    }

    #[test]
    fn non_executable_stack_top_is_an_error() {
        let maps = MemoryMaps::parse(MAPS);
        let mut stack = vec![0u8; 16];
        stack[..8].copy_from_slice(&0x5000u64.to_ne_bytes()); // unmapped
        let mut event = make_event(vec![0x11, 0x100, 0x301], 10, 1 << 20, stack, 16);
        let manager = LeafFunctionCallManager::new(1024);
        let result = manager.patch_caller_of_leaf_function(
            &mut event,
            &maps,
            &mut leaf_without_frame_pointer(),
        );
        assert_eq!(result, CallstackType::StackTopDwarfUnwindingError);
        assert_eq!(event.ips, vec![0x11, 0x100, 0x301]);
    }

    #[test]
    fn broken_frame_pointer_is_an_error() {
        let maps = MemoryMaps::parse(MAPS);
        let mut event = make_event(vec![0x11, 0x100, 0x301], 100, 50, vec![0u8; 16], 16);
        let manager = LeafFunctionCallManager::new(1024);
        let result = manager.patch_caller_of_leaf_function(
            &mut event,
            &maps,
            &mut leaf_without_frame_pointer(),
        );
        assert_eq!(result, CallstackType::FramePointerUnwindingError);
    }

    #[test]
    fn caller_already_present_is_left_alone() {
        let maps = MemoryMaps::parse(MAPS);
        let mut stack = vec![0u8; 16];
        stack[..8].copy_from_slice(&0x301u64.to_ne_bytes());
        let mut event = make_event(vec![0x11, 0x100, 0x301], 10, 1 << 20, stack, 16);
        let manager = LeafFunctionCallManager::new(1024);
        let result = manager.patch_caller_of_leaf_function(
            &mut event,
            &maps,
            &mut leaf_without_frame_pointer(),
        );
        assert_eq!(result, CallstackType::Complete);
        assert_eq!(event.ips, vec![0x11, 0x100, 0x301]);
    }

    #[test]
    fn leaf_with_frame_pointer_succeeds_even_if_stack_sample_too_small() {
        let maps = MemoryMaps::parse(MAPS);
        // Undersized dump and bp < sp: both irrelevant once the leaf is
        // known to maintain a frame pointer.
        let mut event = make_event(vec![0x11, 0x100, 0x301], 100, 50, vec![0u8; 4], 4);
        let manager = LeafFunctionCallManager::new(1024);
        let result = manager.patch_caller_of_leaf_function(
            &mut event,
            &maps,
            &mut leaf_with_frame_pointer(),
        );
        assert_eq!(result, CallstackType::Complete);
        assert_eq!(event.ips, vec![0x11, 0x100, 0x301]);
    }

    #[test]
    fn leaf_with_frame_pointer_does_not_splice_a_plausible_stack_word() {
        let maps = MemoryMaps::parse(MAPS);
        // The word at sp happens to land in executable memory (a spilled
        // register, say). With a frame pointer present it must not be taken
        // for a return address.
        let mut stack = vec![0u8; 16];
        stack[..8].copy_from_slice(&0x201u64.to_ne_bytes());
        let mut event = make_event(vec![0x11, 0x100, 0x301], 10, 1 << 20, stack, 16);
        let manager = LeafFunctionCallManager::new(1024);
        let result = manager.patch_caller_of_leaf_function(
            &mut event,
            &maps,
            &mut leaf_with_frame_pointer(),
        );
        assert_eq!(result, CallstackType::Complete);
        assert_eq!(event.ips, vec![0x11, 0x100, 0x301]);
    }
}
