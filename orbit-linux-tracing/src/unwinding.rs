//! DWARF unwinding of user stack snapshots.
//!
//! Samples taken in DWARF mode carry a register dump and a copy of the top
//! of the user stack. Unwinding replays DWARF CFI (with frame-pointer
//! fallback) over that copy, reading "memory" exclusively from the snapshot.
//! Unwind information comes from the ELF files backing the target's
//! executable mappings, registered as modules as mmap events arrive.

use std::fs::File;
use std::ops::Range;

use framehop::x86_64::{CacheX86_64, UnwindRegsX86_64, UnwinderX86_64};
use framehop::{ExplicitModuleSectionInfo, FrameAddress, Module, Unwinder};
use object::{Object, ObjectSection, ObjectSegment};
use orbit_proto::callstack::CallstackType;

use crate::events::Registers;
use crate::maps::{MemoryMapping, MemoryMaps};

/// Bound on the number of frames produced per sample; deeper stacks are cut
/// off and still marked complete.
pub const MAX_STACK_DEPTH: usize = 256;

pub struct DwarfUnwinder {
    unwinder: UnwinderX86_64<Vec<u8>>,
    cache: CacheX86_64,
}

impl Default for DwarfUnwinder {
    fn default() -> Self {
        DwarfUnwinder {
            unwinder: UnwinderX86_64::new(),
            cache: CacheX86_64::new(),
        }
    }
}

pub struct UnwindResult {
    pub frames: Vec<u64>,
    pub callstack_type: CallstackType,
}

/// Whether the unwind rule at a pc recovers the caller through the frame
/// pointer. Leaf-caller patching is gated on this: a leaf that maintains a
/// frame pointer was already walked correctly by the kernel and must be left
/// alone.
pub trait FramePointerProbe {
    fn has_frame_pointer_set(&mut self, pc: u64) -> bool;
}

impl FramePointerProbe for DwarfUnwinder {
    fn has_frame_pointer_set(&mut self, pc: u64) -> bool {
        // Drive one unwind step with sentinel registers and record which
        // addresses the rule reads. An rbp-based rule recovers the return
        // address from bp + 8; an rsp-based rule reads near sp. The
        // sentinels are far apart so the two cannot be confused.
        const PROBE_SP: u64 = 0x1_0000;
        const PROBE_BP: u64 = 0x8000_0000;

        let mut read_addresses: Vec<u64> = Vec::new();
        let mut read_stack = |address: u64| -> Result<u64, ()> {
            read_addresses.push(address);
            Err(())
        };
        let regs = UnwindRegsX86_64::new(pc, PROBE_SP, PROBE_BP);
        let mut iter = self
            .unwinder
            .iter_frames(pc, regs, &mut self.cache, &mut read_stack);
        let _ = iter.next();
        let _ = iter.next();
        drop(iter);
        read_addresses.contains(&(PROBE_BP + 8))
    }
}

impl DwarfUnwinder {
    /// Registers the ELF file behind an executable mapping so its unwind
    /// info is available. Failures are logged and skipped; unwinding through
    /// the module will then fall back to frame pointers.
    pub fn add_mapped_module(&mut self, mapping: &MemoryMapping) {
        if mapping.path.is_empty() || mapping.path.starts_with('[') {
            return;
        }
        let file = match File::open(&mapping.path) {
            Ok(file) => file,
            Err(err) => {
                log::debug!("not adding module {}: {err}", mapping.path);
                return;
            }
        };
        let mmap = match unsafe { memmap2::Mmap::map(&file) } {
            Ok(mmap) => mmap,
            Err(err) => {
                log::debug!("could not mmap {}: {err}", mapping.path);
                return;
            }
        };
        let object_file = match object::File::parse(&mmap[..]) {
            Ok(object_file) => object_file,
            Err(err) => {
                log::debug!("unrecognized object format in {}: {err}", mapping.path);
                return;
            }
        };

        let Some(base_avma) = compute_base_avma(&object_file, mapping) else {
            log::debug!(
                "mapping of {} at {:#x} matches no load segment",
                mapping.path,
                mapping.start
            );
            return;
        };
        let section_info = module_section_info(&object_file);
        let module = Module::new(
            mapping.path.clone(),
            mapping.start..mapping.end,
            base_avma,
            section_info,
        );
        self.unwinder.add_module(module);
    }

    /// Unwinds one stack snapshot. The result always contains at least the
    /// sampled instruction pointer; a non-`Complete` type means only that
    /// innermost frame is trustworthy.
    pub fn unwind(
        &mut self,
        regs: &Registers,
        stack: &[u8],
        dyn_size: u64,
        maps: &MemoryMaps,
    ) -> UnwindResult {
        let ip = regs.ip();
        let sp = regs.sp();
        let bp = regs.bp();
        let stack_prefix = &stack[..stack.len().min(dyn_size as usize)];

        let mut read_stack = |address: u64| -> Result<u64, ()> {
            let offset = address.checked_sub(sp).ok_or(())?;
            let offset = usize::try_from(offset).map_err(|_| ())?;
            let bytes = stack_prefix.get(offset..offset + 8).ok_or(())?;
            Ok(u64::from_ne_bytes(bytes.try_into().unwrap()))
        };

        let unwind_regs = UnwindRegsX86_64::new(ip, sp, bp);
        let mut frames = Vec::new();
        let mut callstack_type = CallstackType::Complete;
        let mut iter = self
            .unwinder
            .iter_frames(ip, unwind_regs, &mut self.cache, &mut read_stack);
        loop {
            match iter.next() {
                Ok(Some(FrameAddress::InstructionPointer(address))) => frames.push(address),
                Ok(Some(FrameAddress::ReturnAddress(address))) => frames.push(address.into()),
                Ok(None) => break,
                Err(err) => {
                    log::trace!("unwind stopped: {err}");
                    callstack_type = CallstackType::DwarfUnwindingError;
                    break;
                }
            }
            if frames.len() >= MAX_STACK_DEPTH {
                break;
            }
        }

        if frames.is_empty() {
            frames.push(ip);
            callstack_type = CallstackType::DwarfUnwindingError;
        }

        // A frame outside any executable mapping means the unwind went off
        // the rails even if the iterator didn't notice.
        if callstack_type == CallstackType::Complete
            && frames.iter().any(|&frame| !maps.is_executable(frame))
        {
            callstack_type = CallstackType::DwarfUnwindingError;
        }

        UnwindResult {
            frames,
            callstack_type,
        }
    }
}

fn compute_base_avma<'data>(
    object_file: &object::File<'data, &'data [u8]>,
    mapping: &MemoryMapping,
) -> Option<u64> {
    for segment in object_file.segments() {
        let (file_start, file_len) = segment.file_range();
        let file_range = file_start..file_start + file_len;
        if file_range.contains(&mapping.file_offset) {
            let svma_at_mapping_start =
                segment.address() + (mapping.file_offset - file_start);
            return mapping.start.checked_sub(svma_at_mapping_start);
        }
    }
    // Mapping at offset zero of a file without load segments covering it:
    // assume svma == file offset.
    mapping.start.checked_sub(mapping.file_offset)
}

fn module_section_info<'data>(
    object_file: &object::File<'data, &'data [u8]>,
) -> ExplicitModuleSectionInfo<Vec<u8>> {
    fn section_range<'a>(section: &impl ObjectSection<'a>) -> Range<u64> {
        section.address()..section.address() + section.size()
    }

    fn section_data<'a>(section: &impl ObjectSection<'a>) -> Option<Vec<u8>> {
        section.uncompressed_data().ok().map(|data| data.to_vec())
    }

    let base_svma = object_file
        .segments()
        .map(|segment| segment.address())
        .min()
        .unwrap_or(0);
    let text = object_file.section_by_name(".text");
    let eh_frame = object_file.section_by_name(".eh_frame");
    let eh_frame_hdr = object_file.section_by_name(".eh_frame_hdr");
    let debug_frame = object_file.section_by_name(".debug_frame");

    ExplicitModuleSectionInfo {
        base_svma,
        text_svma: text.as_ref().map(section_range),
        text: text.as_ref().and_then(section_data),
        eh_frame_svma: eh_frame.as_ref().map(section_range),
        eh_frame: eh_frame.as_ref().and_then(section_data),
        eh_frame_hdr_svma: eh_frame_hdr.as_ref().map(section_range),
        eh_frame_hdr: eh_frame_hdr.as_ref().and_then(section_data),
        debug_frame: debug_frame.as_ref().and_then(section_data),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perf_event_sys::{PERF_REG_X86_BP, PERF_REG_X86_IP, PERF_REG_X86_SP};

    fn regs(ip: u64, sp: u64, bp: u64) -> Registers {
        let mut regs = Registers::default();
        regs.0[PERF_REG_X86_IP as usize] = ip;
        regs.0[PERF_REG_X86_SP as usize] = sp;
        regs.0[PERF_REG_X86_BP as usize] = bp;
        regs
    }

    #[test]
    fn frame_pointer_fallback_walks_snapshot() {
        // Build a stack snapshot with a classic rbp chain:
        //   [rbp] -> saved rbp, [rbp+8] -> return address.
        // Stack layout starting at sp = 0x1000:
        //   0x1000..0x1010: leaf locals
        //   0x1010: saved rbp (0x1030), 0x1018: return address 0x2100
        //   0x1030: saved rbp (0), 0x1038: return address 0x2200
        let maps = MemoryMaps::parse(
            "2000-3000 r-xp 00000000 fd:00 1 /bin/app\n",
        );
        let mut stack = vec![0u8; 0x40];
        stack[0x10..0x18].copy_from_slice(&0x1030u64.to_ne_bytes());
        stack[0x18..0x20].copy_from_slice(&0x2100u64.to_ne_bytes());
        stack[0x30..0x38].copy_from_slice(&0u64.to_ne_bytes());
        stack[0x38..0x40].copy_from_slice(&0x2200u64.to_ne_bytes());

        let mut unwinder = DwarfUnwinder::default();
        let result = unwinder.unwind(
            &regs(0x2050, 0x1000, 0x1010),
            &stack,
            stack.len() as u64,
            &maps,
        );
        assert_eq!(result.frames[0], 0x2050);
        assert!(result.frames.contains(&0x2100));
        assert!(result.frames.contains(&0x2200));
    }

    #[test]
    fn truncated_snapshot_is_a_dwarf_error() {
        let maps = MemoryMaps::parse("2000-3000 r-xp 00000000 fd:00 1 /bin/app\n");
        // bp chain points past the copied bytes.
        let mut stack = vec![0u8; 0x20];
        stack[0x10..0x18].copy_from_slice(&0x9990u64.to_ne_bytes());
        stack[0x18..0x20].copy_from_slice(&0x2100u64.to_ne_bytes());

        let mut unwinder = DwarfUnwinder::default();
        let result = unwinder.unwind(
            &regs(0x2050, 0x1000, 0x1010),
            &stack,
            stack.len() as u64,
            &maps,
        );
        assert_eq!(result.frames[0], 0x2050);
        assert_eq!(result.callstack_type, CallstackType::DwarfUnwindingError);
    }
}
