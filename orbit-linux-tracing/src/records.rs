//! Decoding of raw perf_event_open records into typed [`PerfEvent`]s.
//!
//! Every ring buffer we open belongs to one [`RingBufferKind`], which pins
//! the exact sample layout of the records it carries; the parser reads a
//! fixed prefix and then computes the offsets of the variable-length parts
//! (callchain ips, stack bytes and their `dyn_size`, `__data_loc` strings).

use std::io::{Cursor, Read};
use std::os::unix::io::RawFd;

use byteorder::{NativeEndian, ReadBytesExt};
use rustc_hash::FxHashMap;

use crate::events::*;
use crate::perf_event_sys::*;

/// What a ring buffer carries, fixed when its fd is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RingBufferKind {
    /// Samples with a full register dump and a user-stack copy (DWARF mode).
    StackSamples,
    /// Samples with a kernel callchain and a small stack copy (frame-pointer
    /// mode).
    CallchainSamples,
    /// All uprobe fds of one cpu, redirected into a shared ring. The sample
    /// stream id identifies the probe.
    Uprobes,
    Uretprobes,
    SchedSwitch,
    SchedWakeup,
    TaskNewtask,
    TaskRename,
    AmdgpuCsIoctl,
    AmdgpuSchedRunJob,
    DmaFenceSignaled,
    /// A tracepoint instrumented on user request; `key` indexes the
    /// selected-tracepoints list sent with the capture options.
    GenericTracepoint { key: u64 },
}

/// Trailing `sample_id` of non-SAMPLE records, present because we set
/// `sample_id_all` with `PERF_SAMPLE_{TID,TIME,STREAM_ID,CPU}` on every fd.
#[derive(Debug, Clone, Copy)]
struct SampleId {
    pid: i32,
    tid: i32,
    time: u64,
    #[allow(dead_code)]
    stream_id: u64,
    cpu: u32,
}

impl SampleId {
    const SIZE: usize = 4 + 4 + 8 + 8 + 4 + 4;

    fn parse_trailer(payload: &[u8]) -> Option<SampleId> {
        let start = payload.len().checked_sub(Self::SIZE)?;
        let mut cursor = Cursor::new(&payload[start..]);
        Some(SampleId {
            pid: cursor.read_i32::<NativeEndian>().ok()?,
            tid: cursor.read_i32::<NativeEndian>().ok()?,
            time: cursor.read_u64::<NativeEndian>().ok()?,
            stream_id: cursor.read_u64::<NativeEndian>().ok()?,
            cpu: cursor.read_u32::<NativeEndian>().ok()?,
        })
    }
}

/// Common prefix of all PERF_RECORD_SAMPLEs we request:
/// `{pid, tid, time, stream_id, cpu, res}`.
#[derive(Debug, Clone, Copy)]
struct SamplePrefix {
    pid: i32,
    tid: i32,
    time: u64,
    stream_id: u64,
    cpu: u32,
}

fn parse_sample_prefix(cursor: &mut Cursor<&[u8]>) -> Option<SamplePrefix> {
    let pid = cursor.read_i32::<NativeEndian>().ok()?;
    let tid = cursor.read_i32::<NativeEndian>().ok()?;
    let time = cursor.read_u64::<NativeEndian>().ok()?;
    let stream_id = cursor.read_u64::<NativeEndian>().ok()?;
    let cpu = cursor.read_u32::<NativeEndian>().ok()?;
    let _res = cursor.read_u32::<NativeEndian>().ok()?;
    Some(SamplePrefix {
        pid,
        tid,
        time,
        stream_id,
        cpu,
    })
}

/// `PERF_SAMPLE_REGS_USER`: abi word followed by one word per set mask bit.
/// Registers land at their perf regs index; unset ones stay zero.
fn parse_user_regs(cursor: &mut Cursor<&[u8]>, mask: u64) -> Option<Registers> {
    let abi = cursor.read_u64::<NativeEndian>().ok()?;
    let mut regs = Registers::default();
    if abi == 0 {
        // PERF_SAMPLE_REGS_ABI_NONE: the kernel dumped nothing.
        return Some(regs);
    }
    for index in 0..PERF_REG_X86_64_MAX {
        if mask & (1 << index) != 0 {
            regs.0[index] = cursor.read_u64::<NativeEndian>().ok()?;
        }
    }
    Some(regs)
}

/// `PERF_SAMPLE_STACK_USER`: u64 size, `size` raw bytes, then the valid
/// prefix length `dyn_size` (absent when size is 0).
fn parse_user_stack(cursor: &mut Cursor<&[u8]>) -> Option<(Vec<u8>, u64)> {
    let size = cursor.read_u64::<NativeEndian>().ok()?;
    if size == 0 {
        return Some((Vec::new(), 0));
    }
    let mut stack = vec![0u8; size as usize];
    cursor.read_exact(&mut stack).ok()?;
    let dyn_size = cursor.read_u64::<NativeEndian>().ok()?;
    if dyn_size > size {
        return None;
    }
    Some((stack, dyn_size))
}

fn read_comm(payload: &[u8], offset: usize) -> Option<[u8; 16]> {
    let bytes = payload.get(offset..offset + 16)?;
    let mut comm = [0u8; 16];
    comm.copy_from_slice(bytes);
    Some(comm)
}

fn read_u32_at(payload: &[u8], offset: usize) -> Option<u32> {
    let bytes = payload.get(offset..offset + 4)?;
    Some(u32::from_ne_bytes(bytes.try_into().unwrap()))
}

fn read_i32_at(payload: &[u8], offset: usize) -> Option<i32> {
    read_u32_at(payload, offset).map(|value| value as i32)
}

fn read_i64_at(payload: &[u8], offset: usize) -> Option<i64> {
    let bytes = payload.get(offset..offset + 8)?;
    Some(i64::from_ne_bytes(bytes.try_into().unwrap()))
}

/// Extracts the string referenced by a kernel `__data_loc` field:
/// `(size << 16) | offset`, size including the terminating NUL.
fn extract_data_loc_string(raw: &[u8], data_loc: u32) -> Option<String> {
    let offset = (data_loc & 0xffff) as usize;
    let size = (data_loc >> 16) as usize;
    let bytes = raw.get(offset..offset + size)?;
    let end = bytes.iter().position(|&byte| byte == 0).unwrap_or(size);
    Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

/// Parser for one ring buffer. Holds the per-capture maps needed to resolve
/// uprobe stream ids to instrumented function ids.
pub struct RecordParser {
    kind: RingBufferKind,
    fd: RawFd,
    uprobe_function_ids: FxHashMap<u64, u64>,
}

impl RecordParser {
    pub fn new(kind: RingBufferKind, fd: RawFd) -> Self {
        RecordParser {
            kind,
            fd,
            uprobe_function_ids: FxHashMap::default(),
        }
    }

    /// Registers the function id a probe's sample stream id resolves to.
    /// Called at capture start, once per instrumented function.
    pub fn register_uprobe_stream(&mut self, stream_id: u64, function_id: u64) {
        self.uprobe_function_ids.insert(stream_id, function_id);
    }

    fn ordered_stream(&self) -> PerfEventOrderedStream {
        match self.kind {
            // dma_fence_signaled is emitted from interrupt context and is out
            // of order even within a single ring.
            RingBufferKind::DmaFenceSignaled => PerfEventOrderedStream::None,
            _ => PerfEventOrderedStream::FileDescriptor(self.fd),
        }
    }

    /// Decodes one record. `None` means the record is not representable
    /// (undersized or unknown) and should be counted as skipped by the
    /// caller.
    pub fn parse(&self, record_type: u32, misc: u16, payload: &[u8]) -> Option<PerfEvent> {
        let _ = misc;
        match record_type {
            PERF_RECORD_SAMPLE => self.parse_sample(payload),
            PERF_RECORD_FORK => self.parse_fork_or_exit(payload, true),
            PERF_RECORD_EXIT => self.parse_fork_or_exit(payload, false),
            PERF_RECORD_LOST => self.parse_lost(payload),
            PERF_RECORD_MMAP2 => self.parse_mmap2(payload),
            PERF_RECORD_THROTTLE | PERF_RECORD_UNTHROTTLE => {
                log::debug!("(un)throttle on ring {:?}", self.fd);
                None
            }
            _ => None,
        }
    }

    fn parse_sample(&self, payload: &[u8]) -> Option<PerfEvent> {
        let mut cursor = Cursor::new(payload);
        let prefix = parse_sample_prefix(&mut cursor)?;
        let data = match &self.kind {
            RingBufferKind::StackSamples => {
                let regs = parse_user_regs(&mut cursor, SAMPLE_REGS_USER_ALL)?;
                let (stack, dyn_size) = parse_user_stack(&mut cursor)?;
                PerfEventData::StackSample(StackSamplePerfEvent {
                    pid: prefix.pid,
                    tid: prefix.tid,
                    regs,
                    dyn_size,
                    stack,
                })
            }
            RingBufferKind::CallchainSamples => {
                let nr = cursor.read_u64::<NativeEndian>().ok()?;
                let mut ips = Vec::with_capacity(nr as usize);
                for _ in 0..nr {
                    ips.push(cursor.read_u64::<NativeEndian>().ok()?);
                }
                let regs = parse_user_regs(&mut cursor, SAMPLE_REGS_USER_ALL)?;
                let (stack, dyn_size) = parse_user_stack(&mut cursor)?;
                PerfEventData::CallchainSample(CallchainSamplePerfEvent {
                    pid: prefix.pid,
                    tid: prefix.tid,
                    ips,
                    regs,
                    dyn_size,
                    stack,
                })
            }
            RingBufferKind::Uprobes => {
                let regs = parse_user_regs(&mut cursor, SAMPLE_REGS_USER_SP_IP)?;
                // An 8-byte stack dump starting at sp: the return address the
                // call pushed, needed by the shadow stack.
                let (stack, dyn_size) = parse_user_stack(&mut cursor)?;
                if dyn_size < 8 {
                    return None;
                }
                let return_address = u64::from_ne_bytes(stack[..8].try_into().unwrap());
                let function_id = self
                    .uprobe_function_ids
                    .get(&prefix.stream_id)
                    .copied()
                    .unwrap_or(orbit_proto::INVALID_FUNCTION_ID);
                PerfEventData::Uprobes(UprobesPerfEvent {
                    pid: prefix.pid,
                    tid: prefix.tid,
                    cpu: prefix.cpu,
                    function_id,
                    sp: regs.sp(),
                    ip: regs.ip(),
                    return_address,
                })
            }
            RingBufferKind::Uretprobes => {
                let mask = (1 << PERF_REG_X86_AX) | (1 << PERF_REG_X86_SP);
                let regs = parse_user_regs(&mut cursor, mask)?;
                PerfEventData::Uretprobes(UretprobesPerfEvent {
                    pid: prefix.pid,
                    tid: prefix.tid,
                    sp: regs.sp(),
                    ax: regs.0[PERF_REG_X86_AX as usize],
                })
            }
            RingBufferKind::SchedSwitch
            | RingBufferKind::SchedWakeup
            | RingBufferKind::TaskNewtask
            | RingBufferKind::TaskRename
            | RingBufferKind::AmdgpuCsIoctl
            | RingBufferKind::AmdgpuSchedRunJob
            | RingBufferKind::DmaFenceSignaled
            | RingBufferKind::GenericTracepoint { .. } => {
                let raw_size = cursor.read_u32::<NativeEndian>().ok()? as usize;
                let raw_start = cursor.position() as usize;
                let raw = payload.get(raw_start..raw_start + raw_size)?;
                self.parse_tracepoint(&prefix, raw)?
            }
        };
        Some(PerfEvent {
            timestamp: prefix.time,
            ordered_stream: self.ordered_stream(),
            data,
        })
    }

    fn parse_tracepoint(&self, prefix: &SamplePrefix, raw: &[u8]) -> Option<PerfEventData> {
        // Offsets below follow the tracefs format files; the leading 8 bytes
        // are the common fields shared by every tracepoint.
        match &self.kind {
            RingBufferKind::SchedSwitch => Some(PerfEventData::SchedSwitch(SchedSwitchPerfEvent {
                cpu: prefix.cpu,
                // The switch-out record runs in the context of the thread
                // being switched out, so the sample pid attributes it.
                prev_pid_or_minus_one: prefix.pid,
                prev_tid: read_i32_at(raw, 24)?,
                prev_state: read_i64_at(raw, 32)?,
                next_tid: read_i32_at(raw, 56)?,
            })),
            RingBufferKind::SchedWakeup => Some(PerfEventData::SchedWakeup(SchedWakeupPerfEvent {
                woken_tid: read_i32_at(raw, 24)?,
                was_unblocked_by_tid: prefix.tid,
                was_unblocked_by_pid: prefix.pid,
            })),
            RingBufferKind::TaskNewtask => Some(PerfEventData::TaskNewtask(TaskNewtaskPerfEvent {
                new_tid: read_i32_at(raw, 8)?,
                comm: read_comm(raw, 12)?,
                was_created_by_tid: prefix.tid,
                was_created_by_pid: prefix.pid,
            })),
            RingBufferKind::TaskRename => Some(PerfEventData::TaskRename(TaskRenamePerfEvent {
                renamed_tid: read_i32_at(raw, 8)?,
                newcomm: read_comm(raw, 28)?,
            })),
            RingBufferKind::AmdgpuCsIoctl => {
                Some(PerfEventData::AmdgpuCsIoctl(AmdgpuCsIoctlPerfEvent {
                    pid: prefix.pid,
                    tid: prefix.tid,
                    timeline: extract_data_loc_string(raw, read_u32_at(raw, 16)?)?,
                    context: read_u32_at(raw, 20)?,
                    seqno: read_u32_at(raw, 24)?,
                }))
            }
            RingBufferKind::AmdgpuSchedRunJob => {
                Some(PerfEventData::AmdgpuSchedRunJob(AmdgpuSchedRunJobPerfEvent {
                    pid: prefix.pid,
                    tid: prefix.tid,
                    timeline: extract_data_loc_string(raw, read_u32_at(raw, 16)?)?,
                    context: read_u32_at(raw, 20)?,
                    seqno: read_u32_at(raw, 24)?,
                }))
            }
            RingBufferKind::DmaFenceSignaled => {
                Some(PerfEventData::DmaFenceSignaled(DmaFenceSignaledPerfEvent {
                    pid: prefix.pid,
                    tid: prefix.tid,
                    timeline: extract_data_loc_string(raw, read_u32_at(raw, 12)?)?,
                    context: read_u32_at(raw, 16)?,
                    seqno: read_u32_at(raw, 20)?,
                }))
            }
            RingBufferKind::GenericTracepoint { key } => {
                Some(PerfEventData::GenericTracepoint(GenericTracepointPerfEvent {
                    pid: prefix.pid,
                    tid: prefix.tid,
                    cpu: prefix.cpu,
                    tracepoint_key: *key,
                }))
            }
            _ => None,
        }
    }

    fn parse_fork_or_exit(&self, payload: &[u8], is_fork: bool) -> Option<PerfEvent> {
        let mut cursor = Cursor::new(payload);
        let pid = cursor.read_i32::<NativeEndian>().ok()?;
        let _ppid = cursor.read_i32::<NativeEndian>().ok()?;
        let tid = cursor.read_i32::<NativeEndian>().ok()?;
        let _ptid = cursor.read_i32::<NativeEndian>().ok()?;
        let _time = cursor.read_u64::<NativeEndian>().ok()?;
        let sample_id = SampleId::parse_trailer(payload)?;
        let data = if is_fork {
            PerfEventData::Fork(ForkPerfEvent { pid, tid })
        } else {
            PerfEventData::Exit(ExitPerfEvent { pid, tid })
        };
        Some(PerfEvent {
            timestamp: sample_id.time,
            ordered_stream: self.ordered_stream(),
            data,
        })
    }

    fn parse_lost(&self, payload: &[u8]) -> Option<PerfEvent> {
        let mut cursor = Cursor::new(payload);
        let _id = cursor.read_u64::<NativeEndian>().ok()?;
        let _lost = cursor.read_u64::<NativeEndian>().ok()?;
        let sample_id = SampleId::parse_trailer(payload)?;
        Some(PerfEvent {
            timestamp: sample_id.time,
            ordered_stream: self.ordered_stream(),
            // The gap spans from whatever the previous event on this ring
            // was; the caller fills that in from its bookkeeping.
            data: PerfEventData::Lost(LostPerfEvent {
                previous_timestamp: 0,
            }),
        })
    }

    fn parse_mmap2(&self, payload: &[u8]) -> Option<PerfEvent> {
        let mut cursor = Cursor::new(payload);
        let pid = cursor.read_i32::<NativeEndian>().ok()?;
        let _tid = cursor.read_i32::<NativeEndian>().ok()?;
        let address = cursor.read_u64::<NativeEndian>().ok()?;
        let length = cursor.read_u64::<NativeEndian>().ok()?;
        let page_offset = cursor.read_u64::<NativeEndian>().ok()?;
        let _maj = cursor.read_u32::<NativeEndian>().ok()?;
        let _min = cursor.read_u32::<NativeEndian>().ok()?;
        let _ino = cursor.read_u64::<NativeEndian>().ok()?;
        let _ino_generation = cursor.read_u64::<NativeEndian>().ok()?;
        let prot = cursor.read_u32::<NativeEndian>().ok()?;
        let _flags = cursor.read_u32::<NativeEndian>().ok()?;

        let filename_start = cursor.position() as usize;
        let filename_end = payload.len().checked_sub(SampleId::SIZE)?;
        let filename_bytes = payload.get(filename_start..filename_end)?;
        let end = filename_bytes
            .iter()
            .position(|&byte| byte == 0)
            .unwrap_or(filename_bytes.len());
        let mut filename = String::from_utf8_lossy(&filename_bytes[..end]).into_owned();

        // Anonymous executable mappings report the pseudo path "//anon" and a
        // page offset equal to the address; normalize both away.
        let mut page_offset = page_offset;
        if filename == "//anon" {
            filename = String::new();
        }
        if filename.is_empty() && page_offset == address {
            page_offset = 0;
        }

        let sample_id = SampleId::parse_trailer(payload)?;
        Some(PerfEvent {
            timestamp: sample_id.time,
            ordered_stream: self.ordered_stream(),
            data: PerfEventData::Mmap(MmapPerfEvent {
                pid,
                address,
                length,
                page_offset,
                filename,
                executable: prot & libc::PROT_EXEC as u32 != 0,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{NativeEndian, WriteBytesExt};

    fn push_sample_prefix(buf: &mut Vec<u8>, pid: i32, tid: i32, time: u64, cpu: u32) {
        buf.write_i32::<NativeEndian>(pid).unwrap();
        buf.write_i32::<NativeEndian>(tid).unwrap();
        buf.write_u64::<NativeEndian>(time).unwrap();
        buf.write_u64::<NativeEndian>(7).unwrap(); // stream id
        buf.write_u32::<NativeEndian>(cpu).unwrap();
        buf.write_u32::<NativeEndian>(0).unwrap(); // res
    }

    #[test]
    fn stack_sample_roundtrip() {
        let mut payload = Vec::new();
        push_sample_prefix(&mut payload, 10, 11, 1000, 2);
        // regs dump: abi + all 24 registers
        payload.write_u64::<NativeEndian>(PERF_SAMPLE_REGS_ABI_64).unwrap();
        for index in 0..PERF_REG_X86_64_MAX as u64 {
            payload.write_u64::<NativeEndian>(index * 0x10).unwrap();
        }
        // stack dump: size 16, data, dyn_size 8
        payload.write_u64::<NativeEndian>(16).unwrap();
        payload.extend_from_slice(&[0xaa; 16]);
        payload.write_u64::<NativeEndian>(8).unwrap();

        let parser = RecordParser::new(RingBufferKind::StackSamples, 3);
        let event = parser.parse(PERF_RECORD_SAMPLE, 0, &payload).unwrap();
        assert_eq!(event.timestamp, 1000);
        assert_eq!(
            event.ordered_stream,
            PerfEventOrderedStream::FileDescriptor(3)
        );
        let PerfEventData::StackSample(sample) = event.data else {
            panic!("wrong variant");
        };
        assert_eq!(sample.pid, 10);
        assert_eq!(sample.tid, 11);
        assert_eq!(sample.regs.sp(), PERF_REG_X86_SP * 0x10);
        assert_eq!(sample.regs.ip(), PERF_REG_X86_IP * 0x10);
        assert_eq!(sample.dyn_size, 8);
        assert_eq!(sample.stack.len(), 16);
    }

    #[test]
    fn dyn_size_larger_than_stack_is_rejected() {
        let mut payload = Vec::new();
        push_sample_prefix(&mut payload, 10, 11, 1000, 2);
        payload.write_u64::<NativeEndian>(PERF_SAMPLE_REGS_ABI_64).unwrap();
        for _ in 0..PERF_REG_X86_64_MAX {
            payload.write_u64::<NativeEndian>(0).unwrap();
        }
        payload.write_u64::<NativeEndian>(8).unwrap();
        payload.extend_from_slice(&[0; 8]);
        payload.write_u64::<NativeEndian>(64).unwrap(); // dyn_size > size

        let parser = RecordParser::new(RingBufferKind::StackSamples, 3);
        assert!(parser.parse(PERF_RECORD_SAMPLE, 0, &payload).is_none());
    }

    #[test]
    fn dma_fence_signaled_extracts_data_loc_timeline() {
        // Raw tracepoint payload: common(8), driver loc(4), timeline loc(4),
        // context(4), seqno(4), then the string area.
        let mut raw = vec![0u8; 24];
        let timeline = b"gfx\0";
        let offset = raw.len() as u32;
        raw.extend_from_slice(timeline);
        let data_loc = ((timeline.len() as u32) << 16) | offset;
        raw[12..16].copy_from_slice(&data_loc.to_ne_bytes());
        raw[16..20].copy_from_slice(&5u32.to_ne_bytes()); // context
        raw[20..24].copy_from_slice(&77u32.to_ne_bytes()); // seqno

        let mut payload = Vec::new();
        push_sample_prefix(&mut payload, 10, 11, 42, 0);
        payload.write_u32::<NativeEndian>(raw.len() as u32).unwrap();
        payload.extend_from_slice(&raw);

        let parser = RecordParser::new(RingBufferKind::DmaFenceSignaled, 3);
        let event = parser.parse(PERF_RECORD_SAMPLE, 0, &payload).unwrap();
        // dma_fence rings are known to be unordered; they merge by timestamp
        // only.
        assert_eq!(event.ordered_stream, PerfEventOrderedStream::None);
        let PerfEventData::DmaFenceSignaled(fence) = event.data else {
            panic!("wrong variant");
        };
        assert_eq!(fence.timeline, "gfx");
        assert_eq!(fence.context, 5);
        assert_eq!(fence.seqno, 77);
    }

    #[test]
    fn anonymous_mmap_normalizes_filename_and_page_offset() {
        let mut payload = Vec::new();
        payload.write_i32::<NativeEndian>(10).unwrap();
        payload.write_i32::<NativeEndian>(10).unwrap();
        payload.write_u64::<NativeEndian>(0x7000).unwrap(); // address
        payload.write_u64::<NativeEndian>(0x1000).unwrap(); // length
        payload.write_u64::<NativeEndian>(0x7000).unwrap(); // pgoff == address
        payload.write_u32::<NativeEndian>(0).unwrap();
        payload.write_u32::<NativeEndian>(0).unwrap();
        payload.write_u64::<NativeEndian>(0).unwrap();
        payload.write_u64::<NativeEndian>(0).unwrap();
        payload
            .write_u32::<NativeEndian>(libc::PROT_EXEC as u32)
            .unwrap();
        payload.write_u32::<NativeEndian>(0).unwrap();
        payload.extend_from_slice(b"//anon\0\0");
        // sample_id trailer
        payload.write_i32::<NativeEndian>(10).unwrap();
        payload.write_i32::<NativeEndian>(10).unwrap();
        payload.write_u64::<NativeEndian>(99).unwrap();
        payload.write_u64::<NativeEndian>(0).unwrap();
        payload.write_u32::<NativeEndian>(1).unwrap();
        payload.write_u32::<NativeEndian>(0).unwrap();

        let parser = RecordParser::new(RingBufferKind::StackSamples, 3);
        let event = parser.parse(PERF_RECORD_MMAP2, 0, &payload).unwrap();
        assert_eq!(event.timestamp, 99);
        let PerfEventData::Mmap(mmap) = event.data else {
            panic!("wrong variant");
        };
        assert_eq!(mmap.filename, "");
        assert_eq!(mmap.page_offset, 0);
        assert!(mmap.executable);
    }
}
