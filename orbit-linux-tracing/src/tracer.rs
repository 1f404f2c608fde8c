//! Capture orchestration: opens the perf events, runs one reader thread per
//! ring buffer and one processing thread that merges, visits, and reports.

use std::fs;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use orbit_proto::capture_options::UnwindingMethod;
use orbit_proto::{CaptureOptions, ErrorsWithPerfEventOpenEvent, ThreadName, ThreadNamesSnapshot};

use crate::event_processor::{PerfEventProcessor, DEFAULT_PROCESSING_DELAY_NS};
use crate::events::{PerfEvent, PerfEventData};
use crate::gpu_tracepoints::GpuTracepointVisitor;
use crate::listener::TracerListener;
use crate::lost_and_discarded::LostAndDiscardedEventVisitor;
use crate::maps::MemoryMaps;
use crate::perf_event_open::{
    disable_event, enable_event, event_stream_id, open_callchain_sample_event,
    open_stack_sample_event, open_tracepoint_event, open_uprobe_event, open_uretprobe_event,
    redirect_into_ring, tracepoint_id,
};
use crate::records::{RecordParser, RingBufferKind};
use crate::ring_buffer::PerfEventRingBuffer;
use crate::stats::TracingStats;
use crate::switches_states_names::SwitchesStatesNamesVisitor;
use crate::uprobes_visitor::UprobesUnwindingVisitor;

// Ring sizes in pages (1 << exponent). Samples carry stack copies and need
// the most room.
const SAMPLING_RING_PAGE_EXPONENT: u32 = 8;
const UPROBES_RING_PAGE_EXPONENT: u32 = 7;
const TRACEPOINT_RING_PAGE_EXPONENT: u32 = 6;

const IDLE_SLEEP: Duration = Duration::from_millis(1);
const STATS_PERIOD: Duration = Duration::from_secs(1);

// Default user-stack bytes per callchain sample, enough for the leaf-caller
// return word plus slack.
const LEAF_PATCH_STACK_DUMP_SIZE: u32 = 512;

pub fn monotonic_now_ns() -> u64 {
    let mut timespec = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut timespec) };
    timespec.tv_sec as u64 * 1_000_000_000 + timespec.tv_nsec as u64
}

/// Rejection of a capture request, naming the offending option.
#[derive(Debug, thiserror::Error)]
pub enum CaptureOptionError {
    #[error("invalid capture option pid: {0}")]
    InvalidPid(i32),
    #[error(
        "invalid capture option stack_dump_size: {0} (must be 8-byte aligned and at most {max})",
        max = crate::MAX_STACK_DUMP_SIZE
    )]
    InvalidStackDumpSize(u32),
    #[error("invalid capture option selected_functions: function id {0} has an empty file path")]
    InvalidInstrumentedFunction(u64),
    #[error("invalid capture option selected_tracepoints: empty category or name")]
    InvalidTracepoint,
}

pub fn validate_capture_options(options: &CaptureOptions) -> Result<(), CaptureOptionError> {
    if options.pid <= 0 {
        return Err(CaptureOptionError::InvalidPid(options.pid));
    }
    if options.stack_dump_size > crate::MAX_STACK_DUMP_SIZE || options.stack_dump_size % 8 != 0 {
        return Err(CaptureOptionError::InvalidStackDumpSize(
            options.stack_dump_size,
        ));
    }
    for function in &options.selected_functions {
        if function.file_path.is_empty() {
            return Err(CaptureOptionError::InvalidInstrumentedFunction(
                function.function_id,
            ));
        }
    }
    for tracepoint in &options.selected_tracepoints {
        if tracepoint.category.is_empty() || tracepoint.name.is_empty() {
            return Err(CaptureOptionError::InvalidTracepoint);
        }
    }
    Ok(())
}

/// A running capture. Dropping it (or calling [`Tracer::stop`]) quiesces the
/// readers, flushes the merger, and joins all threads.
pub struct Tracer {
    stop_flag: Arc<AtomicBool>,
    run_thread: Option<JoinHandle<()>>,
}

impl Tracer {
    pub fn start<L: TracerListener + Clone + 'static>(
        options: CaptureOptions,
        listener: L,
    ) -> Result<Tracer, CaptureOptionError> {
        validate_capture_options(&options)?;
        let stop_flag = Arc::new(AtomicBool::new(false));
        let run_thread = {
            let stop_flag = stop_flag.clone();
            thread::Builder::new()
                .name("orbit-tracer".to_string())
                .spawn(move || run(options, listener, stop_flag))
                .expect("spawning the tracer thread")
        };
        Ok(Tracer {
            stop_flag,
            run_thread: Some(run_thread),
        })
    }

    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(run_thread) = self.run_thread.take() {
            let _ = run_thread.join();
        }
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        self.stop();
    }
}

struct OpenRing {
    ring: PerfEventRingBuffer,
    parser: RecordParser,
}

struct CaptureFds {
    rings: Vec<OpenRing>,
    // Fds redirected into shared rings; they don't own a ring but still need
    // enabling and closing.
    redirected_fds: Vec<RawFd>,
    failed_to_open: Vec<String>,
}

impl CaptureFds {
    fn all_fds(&self) -> Vec<RawFd> {
        self.rings
            .iter()
            .map(|open_ring| open_ring.ring.file_descriptor())
            .chain(self.redirected_fds.iter().copied())
            .collect()
    }
}

fn read_target_threads(pid: i32) -> io::Result<Vec<(i32, String)>> {
    let mut threads = Vec::new();
    for entry in fs::read_dir(format!("/proc/{pid}/task"))? {
        let entry = entry?;
        let Ok(tid) = entry.file_name().to_string_lossy().parse::<i32>() else {
            continue;
        };
        let name = fs::read_to_string(format!("/proc/{pid}/task/{tid}/comm"))
            .map(|name| name.trim_end_matches('\n').to_string())
            .unwrap_or_default();
        threads.push((tid, name));
    }
    Ok(threads)
}

fn open_ring(
    fds: &mut CaptureFds,
    result: io::Result<RawFd>,
    exponent: u32,
    kind: RingBufferKind,
    name: String,
) -> bool {
    match result.and_then(|fd| {
        PerfEventRingBuffer::new(fd, exponent, name.clone()).inspect_err(|_| unsafe {
            libc::close(fd);
        })
    }) {
        Ok(ring) => {
            let fd = ring.file_descriptor();
            fds.rings.push(OpenRing {
                ring,
                parser: RecordParser::new(kind, fd),
            });
            true
        }
        Err(err) => {
            log::warn!("failed to open {name}: {err}");
            fds.failed_to_open.push(name);
            false
        }
    }
}

fn open_tracepoint_rings(
    fds: &mut CaptureFds,
    num_cpus: usize,
    category: &str,
    name: &str,
    kind: RingBufferKind,
    required: bool,
) {
    let id = match tracepoint_id(category, name) {
        Ok(id) => id,
        Err(err) => {
            if required {
                log::warn!("no tracepoint id for {category}:{name}: {err}");
                fds.failed_to_open.push(format!("{category}:{name}"));
            } else {
                log::debug!("tracepoint {category}:{name} unavailable: {err}");
            }
            return;
        }
    };
    for cpu in 0..num_cpus as i32 {
        open_ring(
            fds,
            open_tracepoint_event(cpu, id),
            TRACEPOINT_RING_PAGE_EXPONENT,
            kind.clone(),
            format!("{category}:{name} cpu {cpu}"),
        );
    }
}

fn open_capture_fds(options: &CaptureOptions, num_cpus: usize) -> CaptureFds {
    let mut fds = CaptureFds {
        rings: Vec::new(),
        redirected_fds: Vec::new(),
        failed_to_open: Vec::new(),
    };
    let pid = options.pid;

    if options.sampling_period_ns > 0 {
        for cpu in 0..num_cpus as i32 {
            match options.unwinding_method() {
                UnwindingMethod::Dwarf | UnwindingMethod::Undefined => {
                    open_ring(
                        &mut fds,
                        open_stack_sample_event(
                            pid,
                            cpu,
                            options.sampling_period_ns,
                            options.stack_dump_size,
                        ),
                        SAMPLING_RING_PAGE_EXPONENT,
                        RingBufferKind::StackSamples,
                        format!("stack samples cpu {cpu}"),
                    );
                }
                UnwindingMethod::FramePointers => {
                    open_ring(
                        &mut fds,
                        open_callchain_sample_event(
                            pid,
                            cpu,
                            options.sampling_period_ns,
                            LEAF_PATCH_STACK_DUMP_SIZE,
                        ),
                        SAMPLING_RING_PAGE_EXPONENT,
                        RingBufferKind::CallchainSamples,
                        format!("callchain samples cpu {cpu}"),
                    );
                }
            }
        }
    }

    if options.collect_scheduling_info || options.collect_thread_state {
        open_tracepoint_rings(&mut fds, num_cpus, "sched", "sched_switch", RingBufferKind::SchedSwitch, true);
        open_tracepoint_rings(&mut fds, num_cpus, "sched", "sched_wakeup", RingBufferKind::SchedWakeup, true);
        open_tracepoint_rings(&mut fds, num_cpus, "task", "task_newtask", RingBufferKind::TaskNewtask, true);
        open_tracepoint_rings(&mut fds, num_cpus, "task", "task_rename", RingBufferKind::TaskRename, true);
    }

    // GPU tracepoints only exist with an amdgpu driver; missing ones are not
    // an error.
    open_tracepoint_rings(
        &mut fds,
        num_cpus,
        "amdgpu",
        "amdgpu_cs_ioctl",
        RingBufferKind::AmdgpuCsIoctl,
        false,
    );
    open_tracepoint_rings(
        &mut fds,
        num_cpus,
        "amdgpu",
        "amdgpu_sched_run_job",
        RingBufferKind::AmdgpuSchedRunJob,
        false,
    );
    open_tracepoint_rings(
        &mut fds,
        num_cpus,
        "dma_fence",
        "dma_fence_signaled",
        RingBufferKind::DmaFenceSignaled,
        false,
    );

    for (key, tracepoint) in options.selected_tracepoints.iter().enumerate() {
        open_tracepoint_rings(
            &mut fds,
            num_cpus,
            &tracepoint.category,
            &tracepoint.name,
            RingBufferKind::GenericTracepoint { key: key as u64 },
            true,
        );
    }

    // One shared uprobe ring and one shared uretprobe ring per cpu; each
    // instrumented function's fds are redirected into them.
    for cpu in 0..num_cpus as i32 {
        let mut uprobe_ring_index: Option<usize> = None;
        let mut uretprobe_ring_index: Option<usize> = None;
        for function in &options.selected_functions {
            let name = format!("uprobe {:#x} cpu {cpu}", function.address);
            match open_uprobe_event(&function.file_path, function.file_offset, pid, cpu) {
                Ok(fd) => match uprobe_ring_index {
                    None => {
                        if open_ring(
                            &mut fds,
                            Ok(fd),
                            UPROBES_RING_PAGE_EXPONENT,
                            RingBufferKind::Uprobes,
                            format!("uprobes cpu {cpu}"),
                        ) {
                            uprobe_ring_index = Some(fds.rings.len() - 1);
                            register_probe_stream(&mut fds, uprobe_ring_index, fd, function.function_id);
                        }
                    }
                    Some(index) => {
                        let ring_fd = fds.rings[index].ring.file_descriptor();
                        if let Err(err) = redirect_into_ring(fd, ring_fd) {
                            log::warn!("failed to redirect {name}: {err}");
                            unsafe { libc::close(fd) };
                            fds.failed_to_open.push(name);
                            continue;
                        }
                        fds.redirected_fds.push(fd);
                        register_probe_stream(&mut fds, Some(index), fd, function.function_id);
                    }
                },
                Err(err) => {
                    log::warn!("failed to open {name}: {err}");
                    fds.failed_to_open.push(name);
                }
            }

            let name = format!("uretprobe {:#x} cpu {cpu}", function.address);
            match open_uretprobe_event(&function.file_path, function.file_offset, pid, cpu) {
                Ok(fd) => match uretprobe_ring_index {
                    None => {
                        if open_ring(
                            &mut fds,
                            Ok(fd),
                            UPROBES_RING_PAGE_EXPONENT,
                            RingBufferKind::Uretprobes,
                            format!("uretprobes cpu {cpu}"),
                        ) {
                            uretprobe_ring_index = Some(fds.rings.len() - 1);
                            register_probe_stream(&mut fds, uretprobe_ring_index, fd, function.function_id);
                        }
                    }
                    Some(index) => {
                        let ring_fd = fds.rings[index].ring.file_descriptor();
                        if let Err(err) = redirect_into_ring(fd, ring_fd) {
                            log::warn!("failed to redirect {name}: {err}");
                            unsafe { libc::close(fd) };
                            fds.failed_to_open.push(name);
                            continue;
                        }
                        fds.redirected_fds.push(fd);
                        register_probe_stream(&mut fds, Some(index), fd, function.function_id);
                    }
                },
                Err(err) => {
                    log::warn!("failed to open {name}: {err}");
                    fds.failed_to_open.push(name);
                }
            }
        }
    }

    fds
}

fn register_probe_stream(
    fds: &mut CaptureFds,
    ring_index: Option<usize>,
    fd: RawFd,
    function_id: u64,
) {
    let Some(index) = ring_index else {
        return;
    };
    match event_stream_id(fd) {
        Ok(stream_id) => fds.rings[index].parser.register_uprobe_stream(stream_id, function_id),
        Err(err) => log::warn!("could not read stream id of probe fd {fd}: {err}"),
    }
}

fn reader_loop(
    mut open_ring: OpenRing,
    sender: Sender<PerfEvent>,
    stop_flag: Arc<AtomicBool>,
    stats: Arc<TracingStats>,
) {
    let mut payload = Vec::new();
    let mut last_timestamp = 0u64;
    let mut drain = |open_ring: &mut OpenRing, payload: &mut Vec<u8>, last_timestamp: &mut u64| {
        let mut any = false;
        while open_ring.ring.has_new_data() {
            any = true;
            let header = open_ring.ring.peek_header();
            open_ring.ring.consume_record(&header, payload);
            match open_ring.parser.parse(header.kind, header.misc, payload) {
                Some(mut event) => {
                    if let PerfEventData::Lost(lost) = &mut event.data {
                        lost.previous_timestamp = *last_timestamp;
                    }
                    *last_timestamp = event.timestamp;
                    if sender.send(event).is_err() {
                        return false;
                    }
                }
                None => TracingStats::increment(&stats.skipped_record_count),
            }
        }
        any
    };

    while !stop_flag.load(Ordering::Relaxed) {
        if !drain(&mut open_ring, &mut payload, &mut last_timestamp) {
            thread::sleep(IDLE_SLEEP);
        }
    }
    // Records written before the events were disabled are still in the ring.
    drain(&mut open_ring, &mut payload, &mut last_timestamp);
}

fn run<L: TracerListener + Clone + 'static>(
    options: CaptureOptions,
    mut listener: L,
    stop_flag: Arc<AtomicBool>,
) {
    let stats = Arc::new(TracingStats::default());
    let start_timestamp_ns = monotonic_now_ns();

    let threads = match read_target_threads(options.pid) {
        Ok(threads) => threads,
        Err(err) => {
            log::error!("cannot read threads of pid {}: {err}", options.pid);
            Vec::new()
        }
    };
    listener.on_thread_names_snapshot(ThreadNamesSnapshot {
        snapshot_timestamp_ns: start_timestamp_ns,
        thread_names: threads
            .iter()
            .map(|(tid, name)| ThreadName {
                pid: options.pid,
                tid: *tid,
                name: name.clone(),
                timestamp_ns: start_timestamp_ns,
            })
            .collect(),
    });

    let initial_maps = MemoryMaps::read_from_proc(options.pid).unwrap_or_else(|err| {
        log::error!("cannot read maps of pid {}: {err}", options.pid);
        MemoryMaps::default()
    });

    let num_cpus = num_cpus::get();
    let fds = open_capture_fds(&options, num_cpus);
    if !fds.failed_to_open.is_empty() {
        listener.on_errors_with_perf_event_open(ErrorsWithPerfEventOpenEvent {
            timestamp_ns: monotonic_now_ns(),
            failed_to_open: fds.failed_to_open.clone(),
        });
    }

    let mut processor = PerfEventProcessor::new(DEFAULT_PROCESSING_DELAY_NS);
    processor.add_visitor(Box::new(UprobesUnwindingVisitor::new(
        Box::new(listener.clone()),
        stats.clone(),
        options.pid,
        initial_maps,
        options.stack_dump_size.min(u16::MAX as u32) as u16,
    )));
    let mut switches_visitor = SwitchesStatesNamesVisitor::new(
        Box::new(listener.clone()),
        stats.clone(),
        options.pid,
        options.collect_scheduling_info,
        options.collect_thread_state,
    );
    switches_visitor.set_selected_tracepoints(options.selected_tracepoints.clone());
    switches_visitor.process_initial_tids(
        start_timestamp_ns,
        &threads.iter().map(|(tid, _)| *tid).collect::<Vec<_>>(),
    );
    processor.add_visitor(Box::new(switches_visitor));
    processor.add_visitor(Box::new(GpuTracepointVisitor::new(
        Box::new(listener.clone()),
        stats.clone(),
    )));
    processor.add_visitor(Box::new(LostAndDiscardedEventVisitor::new(
        Box::new(listener.clone()),
        stats.clone(),
    )));

    let all_fds = fds.all_fds();
    let redirected_fds = fds.redirected_fds.clone();
    let (sender, receiver): (Sender<PerfEvent>, Receiver<PerfEvent>) =
        crossbeam_channel::unbounded();
    let mut reader_threads = Vec::new();
    for open_ring in fds.rings {
        let sender = sender.clone();
        let stop_flag = stop_flag.clone();
        let stats = stats.clone();
        let name = format!("orbit-ring-{}", open_ring.ring.file_descriptor());
        reader_threads.push(
            thread::Builder::new()
                .name(name)
                .spawn(move || reader_loop(open_ring, sender, stop_flag, stats))
                .expect("spawning a ring reader thread"),
        );
    }
    drop(sender);

    for &fd in &all_fds {
        if let Err(err) = enable_event(fd) {
            log::warn!("could not enable perf event fd {fd}: {err}");
        }
    }

    aggregate(&mut processor, receiver, &stats, &stop_flag, &all_fds);

    let end_timestamp_ns = monotonic_now_ns();
    processor.process_all_events();
    processor.notify_capture_finished(end_timestamp_ns);

    for reader in reader_threads {
        let _ = reader.join();
    }
    // Ring-owning fds were closed when their rings dropped with the reader
    // threads; the redirected ones are ours to close.
    for fd in redirected_fds {
        unsafe { libc::close(fd) };
    }

    log::info!(
        "capture finished after {} ms; {}",
        (end_timestamp_ns - start_timestamp_ns) / 1_000_000,
        stats.reset_and_summarize()
    );
}

fn aggregate(
    processor: &mut PerfEventProcessor,
    receiver: Receiver<PerfEvent>,
    stats: &Arc<TracingStats>,
    stop_flag: &Arc<AtomicBool>,
    all_fds: &[RawFd],
) {
    let mut last_stats_log = std::time::Instant::now();
    let mut disabled = false;
    loop {
        match receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => {
                TracingStats::increment(&stats.event_count);
                processor.add_event(event);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if stop_flag.load(Ordering::Relaxed) && !disabled {
            disabled = true;
            for &fd in all_fds {
                let _ = disable_event(fd);
            }
        }

        processor.process_old_events(monotonic_now_ns());

        if last_stats_log.elapsed() >= STATS_PERIOD {
            last_stats_log = std::time::Instant::now();
            log::debug!("{}", stats.reset_and_summarize());
        }
    }
}
