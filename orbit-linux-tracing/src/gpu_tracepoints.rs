//! Joining the amdgpu tracepoint triples into GPU jobs.
//!
//! A job on an amdgpu timeline produces three tracepoints: `amdgpu_cs_ioctl`
//! when the application submits it, `amdgpu_sched_run_job` when the driver
//! scheduler dispatches it, and `dma_fence_signaled` when the hardware
//! completes it. They share `(context, seqno, timeline)` and can be observed
//! in any order.

use std::sync::Arc;

use orbit_proto::FullGpuJob;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::events::{
    AmdgpuCsIoctlPerfEvent, AmdgpuSchedRunJobPerfEvent, DmaFenceSignaledPerfEvent,
    PerfEventVisitor,
};
use crate::listener::TracerListener;
use crate::stats::TracingStats;

type JobKey = (u32, u32, String);
type TimelineKey = (u32, String);

#[derive(Debug, Default, Clone)]
struct PartialGpuJob {
    pid: i32,
    tid: i32,
    cs_ioctl_time_ns: Option<u64>,
    sched_run_job_time_ns: Option<u64>,
    dma_fence_signaled_time_ns: Option<u64>,
}

pub struct GpuTracepointVisitor {
    listener: Box<dyn TracerListener>,
    stats: Arc<TracingStats>,
    partial_jobs: FxHashMap<JobKey, PartialGpuJob>,
    completed_keys: FxHashSet<JobKey>,
    // Hardware completion time of the latest finished job per queue; the
    // next job cannot have started executing before it.
    latest_signaled_per_queue: FxHashMap<TimelineKey, u64>,
    // Busy-until time per depth row of each timeline.
    timeline_depths: FxHashMap<String, Vec<u64>>,
}

impl GpuTracepointVisitor {
    pub fn new(listener: Box<dyn TracerListener>, stats: Arc<TracingStats>) -> Self {
        GpuTracepointVisitor {
            listener,
            stats,
            partial_jobs: FxHashMap::default(),
            completed_keys: FxHashSet::default(),
            latest_signaled_per_queue: FxHashMap::default(),
            timeline_depths: FxHashMap::default(),
        }
    }

    fn partial_job(&mut self, key: &JobKey) -> Option<&mut PartialGpuJob> {
        if self.completed_keys.contains(key) {
            log::warn!(
                "tracepoint for already completed gpu job (context={}, seqno={}, timeline={})",
                key.0,
                key.1,
                key.2
            );
            return None;
        }
        Some(self.partial_jobs.entry(key.clone()).or_default())
    }

    fn try_complete(&mut self, key: &JobKey) {
        let Some(partial) = self.partial_jobs.get(key) else {
            return;
        };
        let (Some(ioctl), Some(sched_run), Some(signaled)) = (
            partial.cs_ioctl_time_ns,
            partial.sched_run_job_time_ns,
            partial.dma_fence_signaled_time_ns,
        ) else {
            return;
        };
        let partial = self.partial_jobs.remove(key).expect("checked above");
        self.completed_keys.insert(key.clone());

        let (context, seqno, timeline) = key.clone();

        // The job can only have started on the hardware once the previous
        // job on the same queue signaled.
        let queue_key = (context, timeline.clone());
        let previous_signaled = self
            .latest_signaled_per_queue
            .get(&queue_key)
            .copied()
            .unwrap_or(0);
        let hardware_start = sched_run.max(previous_signaled);
        let entry = self.latest_signaled_per_queue.entry(queue_key).or_insert(0);
        *entry = (*entry).max(signaled);

        // Smallest depth row that is free over [ioctl, signaled].
        let rows = self.timeline_depths.entry(timeline.clone()).or_default();
        let depth = match rows.iter().position(|&busy_until| busy_until <= ioctl) {
            Some(depth) => depth,
            None => {
                rows.push(0);
                rows.len() - 1
            }
        };
        rows[depth] = rows[depth].max(signaled);

        TracingStats::increment(&self.stats.gpu_events_count);
        self.listener.on_gpu_job(FullGpuJob {
            pid: partial.pid,
            tid: partial.tid,
            context,
            seqno,
            timeline,
            depth: depth as i32,
            amdgpu_cs_ioctl_time_ns: ioctl,
            amdgpu_sched_run_job_time_ns: sched_run,
            gpu_hardware_start_time_ns: hardware_start,
            dma_fence_signaled_time_ns: signaled,
        });
    }
}

impl PerfEventVisitor for GpuTracepointVisitor {
    fn visit_amdgpu_cs_ioctl(&mut self, timestamp: u64, data: &AmdgpuCsIoctlPerfEvent) {
        let key = (data.context, data.seqno, data.timeline.clone());
        let Some(partial) = self.partial_job(&key) else {
            return;
        };
        if partial.cs_ioctl_time_ns.is_some() {
            log::warn!("duplicate amdgpu_cs_ioctl for {key:?}");
            return;
        }
        partial.pid = data.pid;
        partial.tid = data.tid;
        partial.cs_ioctl_time_ns = Some(timestamp);
        self.try_complete(&key);
    }

    fn visit_amdgpu_sched_run_job(&mut self, timestamp: u64, data: &AmdgpuSchedRunJobPerfEvent) {
        let key = (data.context, data.seqno, data.timeline.clone());
        let Some(partial) = self.partial_job(&key) else {
            return;
        };
        if partial.sched_run_job_time_ns.is_some() {
            log::warn!("duplicate amdgpu_sched_run_job for {key:?}");
            return;
        }
        partial.sched_run_job_time_ns = Some(timestamp);
        self.try_complete(&key);
    }

    fn visit_dma_fence_signaled(&mut self, timestamp: u64, data: &DmaFenceSignaledPerfEvent) {
        let key = (data.context, data.seqno, data.timeline.clone());
        let Some(partial) = self.partial_job(&key) else {
            return;
        };
        if partial.dma_fence_signaled_time_ns.is_some() {
            log::warn!("duplicate dma_fence_signaled for {key:?}");
            return;
        }
        partial.dma_fence_signaled_time_ns = Some(timestamp);
        self.try_complete(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{PerfEvent, PerfEventData, PerfEventOrderedStream};
    use std::sync::Mutex;

    #[derive(Default, Clone)]
    struct Collector {
        jobs: Arc<Mutex<Vec<FullGpuJob>>>,
    }

    impl TracerListener for Collector {
        fn on_gpu_job(&mut self, gpu_job: FullGpuJob) {
            self.jobs.lock().unwrap().push(gpu_job);
        }
    }

    fn ioctl(timestamp: u64, context: u32, seqno: u32, timeline: &str) -> PerfEvent {
        PerfEvent {
            timestamp,
            ordered_stream: PerfEventOrderedStream::FileDescriptor(3),
            data: PerfEventData::AmdgpuCsIoctl(AmdgpuCsIoctlPerfEvent {
                pid: 10,
                tid: 11,
                context,
                seqno,
                timeline: timeline.to_string(),
            }),
        }
    }

    fn sched_run(timestamp: u64, context: u32, seqno: u32, timeline: &str) -> PerfEvent {
        PerfEvent {
            timestamp,
            ordered_stream: PerfEventOrderedStream::FileDescriptor(4),
            data: PerfEventData::AmdgpuSchedRunJob(AmdgpuSchedRunJobPerfEvent {
                pid: -1,
                tid: -1,
                context,
                seqno,
                timeline: timeline.to_string(),
            }),
        }
    }

    fn signaled(timestamp: u64, context: u32, seqno: u32, timeline: &str) -> PerfEvent {
        PerfEvent {
            timestamp,
            ordered_stream: PerfEventOrderedStream::None,
            data: PerfEventData::DmaFenceSignaled(DmaFenceSignaledPerfEvent {
                pid: -1,
                tid: -1,
                context,
                seqno,
                timeline: timeline.to_string(),
            }),
        }
    }

    fn make_visitor() -> (GpuTracepointVisitor, Arc<Mutex<Vec<FullGpuJob>>>) {
        let collector = Collector::default();
        let jobs = collector.jobs.clone();
        (
            GpuTracepointVisitor::new(Box::new(collector), Arc::default()),
            jobs,
        )
    }

    #[test]
    fn three_tracepoints_join_into_a_job() {
        let (mut visitor, jobs) = make_visitor();
        ioctl(100, 1, 10, "g").accept(&mut visitor);
        sched_run(200, 1, 10, "g").accept(&mut visitor);
        signaled(300, 1, 10, "g").accept(&mut visitor);

        let jobs = jobs.lock().unwrap();
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert_eq!(job.pid, 10);
        assert_eq!(job.tid, 11);
        assert_eq!(job.amdgpu_cs_ioctl_time_ns, 100);
        assert_eq!(job.amdgpu_sched_run_job_time_ns, 200);
        assert_eq!(job.gpu_hardware_start_time_ns, 200);
        assert_eq!(job.dma_fence_signaled_time_ns, 300);
        assert_eq!(job.depth, 0);
        assert_eq!(job.timeline, "g");
    }

    #[test]
    fn arrival_order_does_not_matter() {
        let (mut visitor, jobs) = make_visitor();
        signaled(300, 1, 10, "g").accept(&mut visitor);
        ioctl(100, 1, 10, "g").accept(&mut visitor);
        assert!(jobs.lock().unwrap().is_empty());
        sched_run(200, 1, 10, "g").accept(&mut visitor);
        assert_eq!(jobs.lock().unwrap().len(), 1);
    }

    #[test]
    fn overlapping_jobs_stack_and_serialize_on_the_hardware() {
        let (mut visitor, jobs) = make_visitor();
        // Job A: [100, 300]; job B overlaps: [110, 410].
        ioctl(100, 1, 1, "g").accept(&mut visitor);
        sched_run(120, 1, 1, "g").accept(&mut visitor);
        ioctl(110, 1, 2, "g").accept(&mut visitor);
        sched_run(130, 1, 2, "g").accept(&mut visitor);
        signaled(300, 1, 1, "g").accept(&mut visitor);
        signaled(410, 1, 2, "g").accept(&mut visitor);

        let jobs = jobs.lock().unwrap();
        assert_eq!(jobs.len(), 2);
        let job_a = &jobs[0];
        let job_b = &jobs[1];
        assert_eq!(job_a.depth, 0);
        assert_eq!(job_b.depth, 1);
        // B could only start on the hardware once A signaled.
        assert_eq!(job_b.gpu_hardware_start_time_ns, 300);
        for job in jobs.iter() {
            assert!(job.amdgpu_cs_ioctl_time_ns <= job.amdgpu_sched_run_job_time_ns);
            assert!(job.amdgpu_sched_run_job_time_ns <= job.gpu_hardware_start_time_ns);
            assert!(job.gpu_hardware_start_time_ns <= job.dma_fence_signaled_time_ns);
        }
    }

    #[test]
    fn non_overlapping_jobs_share_a_depth() {
        let (mut visitor, jobs) = make_visitor();
        ioctl(100, 1, 1, "g").accept(&mut visitor);
        sched_run(110, 1, 1, "g").accept(&mut visitor);
        signaled(200, 1, 1, "g").accept(&mut visitor);
        ioctl(250, 1, 2, "g").accept(&mut visitor);
        sched_run(260, 1, 2, "g").accept(&mut visitor);
        signaled(300, 1, 2, "g").accept(&mut visitor);

        let jobs = jobs.lock().unwrap();
        assert_eq!(jobs[0].depth, 0);
        assert_eq!(jobs[1].depth, 0);
    }

    #[test]
    fn different_timelines_do_not_interact() {
        let (mut visitor, jobs) = make_visitor();
        ioctl(100, 1, 1, "gfx").accept(&mut visitor);
        sched_run(110, 1, 1, "gfx").accept(&mut visitor);
        signaled(200, 1, 1, "gfx").accept(&mut visitor);
        ioctl(120, 1, 1, "comp").accept(&mut visitor);
        sched_run(130, 1, 1, "comp").accept(&mut visitor);
        signaled(400, 1, 1, "comp").accept(&mut visitor);

        let jobs = jobs.lock().unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[1].depth, 0);
        assert_eq!(jobs[1].gpu_hardware_start_time_ns, 130);
    }

    #[test]
    fn event_for_completed_job_is_discarded() {
        let (mut visitor, jobs) = make_visitor();
        ioctl(100, 1, 10, "g").accept(&mut visitor);
        sched_run(200, 1, 10, "g").accept(&mut visitor);
        signaled(300, 1, 10, "g").accept(&mut visitor);
        signaled(999, 1, 10, "g").accept(&mut visitor);

        assert_eq!(jobs.lock().unwrap().len(), 1);
    }
}
