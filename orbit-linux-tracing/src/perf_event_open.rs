//! Opening the perf events the tracer needs.
//!
//! Every helper fills a `perf_event_attr` for one record shape and returns
//! the raw fd. All events are opened disabled and enabled together once the
//! capture is fully set up, with the monotonic clock so timestamps line up
//! across fds and with user-space instrumentation.

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::io::RawFd;

use crate::perf_event_sys::*;

const TRACEFS_ROOTS: &[&str] = &["/sys/kernel/debug/tracing", "/sys/kernel/tracing"];

fn common_attr() -> PerfEventAttr {
    let mut attr = PerfEventAttr::zeroed();
    attr.sample_type = PERF_SAMPLE_TID | PERF_SAMPLE_TIME | PERF_SAMPLE_STREAM_ID | PERF_SAMPLE_CPU;
    attr.flags = PERF_ATTR_FLAG_DISABLED | PERF_ATTR_FLAG_SAMPLE_ID_ALL | PERF_ATTR_FLAG_USE_CLOCKID;
    attr.clock_id = libc::CLOCK_MONOTONIC;
    attr
}

fn open(attr: &PerfEventAttr, pid: i32, cpu: i32) -> io::Result<RawFd> {
    let fd = sys_perf_event_open(attr, pid, cpu, -1, PERF_FLAG_FD_CLOEXEC);
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Stack samples for DWARF unwinding: full register dump plus
/// `stack_dump_size` bytes of user stack, every `period_ns` of cpu time.
pub fn open_stack_sample_event(
    pid: i32,
    cpu: i32,
    period_ns: u64,
    stack_dump_size: u32,
) -> io::Result<RawFd> {
    let mut attr = common_attr();
    attr.kind = PERF_TYPE_SOFTWARE;
    attr.config = PERF_COUNT_SW_CPU_CLOCK;
    attr.sample_period_or_freq = period_ns;
    attr.sample_type |= PERF_SAMPLE_REGS_USER | PERF_SAMPLE_STACK_USER;
    attr.sample_regs_user = SAMPLE_REGS_USER_ALL;
    attr.sample_stack_user = stack_dump_size;
    attr.flags |= PERF_ATTR_FLAG_MMAP | PERF_ATTR_FLAG_MMAP2 | PERF_ATTR_FLAG_TASK;
    open(&attr, pid, cpu)
}

/// Callchain samples for frame-pointer unwinding. The small stack dump
/// supports patching the caller of frame-pointer-less leaf functions.
pub fn open_callchain_sample_event(
    pid: i32,
    cpu: i32,
    period_ns: u64,
    leaf_patch_stack_dump_size: u32,
) -> io::Result<RawFd> {
    let mut attr = common_attr();
    attr.kind = PERF_TYPE_SOFTWARE;
    attr.config = PERF_COUNT_SW_CPU_CLOCK;
    attr.sample_period_or_freq = period_ns;
    attr.sample_type |=
        PERF_SAMPLE_CALLCHAIN | PERF_SAMPLE_REGS_USER | PERF_SAMPLE_STACK_USER;
    attr.sample_regs_user = SAMPLE_REGS_USER_ALL;
    attr.sample_stack_user = leaf_patch_stack_dump_size;
    attr.flags |= PERF_ATTR_FLAG_MMAP | PERF_ATTR_FLAG_MMAP2 | PERF_ATTR_FLAG_TASK;
    open(&attr, pid, cpu)
}

/// The id the kernel publishes for a tracepoint, from tracefs.
pub fn tracepoint_id(category: &str, name: &str) -> io::Result<u64> {
    let mut last_error = io::Error::from(io::ErrorKind::NotFound);
    for root in TRACEFS_ROOTS {
        match fs::read_to_string(format!("{root}/events/{category}/{name}/id")) {
            Ok(content) => {
                return content.trim().parse::<u64>().map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("malformed tracepoint id for {category}:{name}"),
                    )
                });
            }
            Err(err) => last_error = err,
        }
    }
    Err(last_error)
}

/// A tracepoint event, system-wide on one cpu.
pub fn open_tracepoint_event(cpu: i32, tracepoint_id: u64) -> io::Result<RawFd> {
    let mut attr = common_attr();
    attr.kind = PERF_TYPE_TRACEPOINT;
    attr.config = tracepoint_id;
    attr.sample_period_or_freq = 1;
    attr.sample_type |= PERF_SAMPLE_RAW;
    open(&attr, -1, cpu)
}

fn uprobe_pmu_type() -> io::Result<u32> {
    let content = fs::read_to_string("/sys/bus/event_source/devices/uprobe/type")?;
    content.trim().parse::<u32>().map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidData, "malformed uprobe pmu type")
    })
}

fn uretprobe_config_bit() -> io::Result<u64> {
    // The format file reads "config:N".
    let content = fs::read_to_string("/sys/bus/event_source/devices/uprobe/format/retprobe")?;
    let bit = content
        .trim()
        .strip_prefix("config:")
        .and_then(|bit| bit.parse::<u32>().ok())
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "malformed retprobe format")
        })?;
    Ok(1 << bit)
}

/// A uprobe on `file_path` + `file_offset`, firing at function entry. The
/// 8-byte stack dump captures the return address the call pushed.
pub fn open_uprobe_event(
    file_path: &str,
    file_offset: u64,
    pid: i32,
    cpu: i32,
) -> io::Result<RawFd> {
    let path = CString::new(file_path)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "probe path contains NUL"))?;
    let mut attr = common_attr();
    attr.kind = uprobe_pmu_type()?;
    attr.sample_period_or_freq = 1;
    attr.bp_addr_or_config1 = path.as_ptr() as u64;
    attr.bp_len_or_config2 = file_offset;
    attr.sample_type |= PERF_SAMPLE_REGS_USER | PERF_SAMPLE_STACK_USER;
    attr.sample_regs_user = SAMPLE_REGS_USER_SP_IP;
    attr.sample_stack_user = 8;
    // `path` must stay alive across the syscall; `open` copies it in the
    // kernel.
    open(&attr, pid, cpu)
}

/// The matching uretprobe, firing at function return with the return value
/// in ax.
pub fn open_uretprobe_event(
    file_path: &str,
    file_offset: u64,
    pid: i32,
    cpu: i32,
) -> io::Result<RawFd> {
    let path = CString::new(file_path)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "probe path contains NUL"))?;
    let mut attr = common_attr();
    attr.kind = uprobe_pmu_type()?;
    attr.config = uretprobe_config_bit()?;
    attr.sample_period_or_freq = 1;
    attr.bp_addr_or_config1 = path.as_ptr() as u64;
    attr.bp_len_or_config2 = file_offset;
    attr.sample_type |= PERF_SAMPLE_REGS_USER;
    attr.sample_regs_user = (1 << PERF_REG_X86_AX) | (1 << PERF_REG_X86_SP);
    open(&attr, pid, cpu)
}

pub fn enable_event(fd: RawFd) -> io::Result<()> {
    let result = unsafe { libc::ioctl(fd, PERF_EVENT_IOC_ENABLE as _) };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn disable_event(fd: RawFd) -> io::Result<()> {
    let result = unsafe { libc::ioctl(fd, PERF_EVENT_IOC_DISABLE as _) };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Redirects `fd`'s records into `target_ring_fd`'s ring buffer, so that all
/// uprobe fds of one cpu share a single ring.
pub fn redirect_into_ring(fd: RawFd, target_ring_fd: RawFd) -> io::Result<()> {
    let result = unsafe { libc::ioctl(fd, PERF_EVENT_IOC_SET_OUTPUT as _, target_ring_fd) };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// The sample stream id of `fd`, used to attribute records in shared rings.
pub fn event_stream_id(fd: RawFd) -> io::Result<u64> {
    let mut id: u64 = 0;
    let result = unsafe { libc::ioctl(fd, PERF_EVENT_IOC_ID as _, &mut id as *mut u64) };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(id)
}
