//! Command-buffer and debug-marker timers from GpuQueueSubmission events.
//!
//! Submissions and jobs reference each other only indirectly: a submission
//! matches the job whose amdgpu_cs_ioctl happened on the same thread between
//! the submission's pre and post CPU timestamps, and a debug marker's end
//! references the submission its begin was recorded in. Either side can
//! arrive first, so both are kept in arenas addressed by stable indices and
//! a work-list of unmatched submissions is drained whenever a job arrives.
//!
//! GPU timestamps are device-clock values; they are placed on the capture
//! timeline by mapping each submission's GPU-time range proportionally onto
//! the hardware-execution window of its job.

use orbit_proto::timer_info::Type as TimerType;
use orbit_proto::{GpuJob, GpuQueueSubmission, GpuQueueSubmissionMetaInfo, TimerInfo};

#[derive(Debug, Clone, Copy)]
struct GpuTimeMapping {
    gpu_time_min: u64,
    gpu_time_max: u64,
    window_begin_ns: u64,
    window_end_ns: u64,
}

impl GpuTimeMapping {
    fn map(&self, gpu_timestamp: u64) -> u64 {
        if self.gpu_time_max == self.gpu_time_min {
            return self.window_begin_ns;
        }
        let offset = gpu_timestamp.saturating_sub(self.gpu_time_min) as u128;
        let gpu_range = (self.gpu_time_max - self.gpu_time_min) as u128;
        let window = (self.window_end_ns - self.window_begin_ns) as u128;
        self.window_begin_ns + (offset * window / gpu_range) as u64
    }
}

struct SubmissionEntry {
    meta: GpuQueueSubmissionMetaInfo,
    submission: GpuQueueSubmission,
    job_index: Option<usize>,
    mapping: Option<GpuTimeMapping>,
}

#[derive(Default)]
pub struct GpuQueueSubmissionProcessor {
    jobs: Vec<GpuJob>,
    submissions: Vec<SubmissionEntry>,
    // Submission indices that have not found their job yet.
    unmatched_submissions: Vec<usize>,
    first_known_mapped_gpu_time_ns: Option<u64>,
}

fn meta_matches(a: &GpuQueueSubmissionMetaInfo, b: &GpuQueueSubmissionMetaInfo) -> bool {
    a.tid == b.tid
        && a.pre_submission_cpu_timestamp == b.pre_submission_cpu_timestamp
        && a.post_submission_cpu_timestamp == b.post_submission_cpu_timestamp
}

fn submission_gpu_time_range(
    submission: &GpuQueueSubmission,
    meta: &GpuQueueSubmissionMetaInfo,
) -> Option<(u64, u64)> {
    let mut min = u64::MAX;
    let mut max = 0u64;
    let mut any = false;
    let mut take = |timestamp: u64| {
        min = min.min(timestamp);
        max = max.max(timestamp);
        any = true;
    };
    for submit_info in &submission.submit_infos {
        for command_buffer in &submit_info.command_buffers {
            take(command_buffer.begin_gpu_timestamp_ns);
            take(command_buffer.end_gpu_timestamp_ns);
        }
    }
    for marker in &submission.completed_markers {
        take(marker.end_gpu_timestamp_ns);
        if let Some(begin) = &marker.begin_marker {
            if begin
                .meta_info
                .as_ref()
                .is_some_and(|begin_meta| meta_matches(begin_meta, meta))
            {
                take(begin.gpu_timestamp_ns);
            }
        }
    }
    any.then_some((min, max))
}

impl GpuQueueSubmissionProcessor {
    /// A job arrived; submissions waiting for it can now be placed.
    pub fn process_gpu_job(&mut self, job: &GpuJob) -> Vec<TimerInfo> {
        let job_index = self.jobs.len();
        self.jobs.push(job.clone());

        let mut timers = Vec::new();
        let mut still_unmatched = Vec::new();
        for submission_index in std::mem::take(&mut self.unmatched_submissions) {
            if self.submission_matches_job(submission_index, job_index) {
                timers.extend(self.place_submission(submission_index, job_index));
            } else {
                still_unmatched.push(submission_index);
            }
        }
        self.unmatched_submissions = still_unmatched;
        timers
    }

    pub fn process_gpu_queue_submission(
        &mut self,
        submission: GpuQueueSubmission,
    ) -> Vec<TimerInfo> {
        let Some(meta) = submission.meta_info.clone() else {
            log::warn!("gpu queue submission without meta info");
            return Vec::new();
        };
        let submission_index = self.submissions.len();
        self.submissions.push(SubmissionEntry {
            meta,
            submission,
            job_index: None,
            mapping: None,
        });

        match self.find_job_for_submission(submission_index) {
            Some(job_index) => self.place_submission(submission_index, job_index),
            None => {
                self.unmatched_submissions.push(submission_index);
                Vec::new()
            }
        }
    }

    fn submission_matches_job(&self, submission_index: usize, job_index: usize) -> bool {
        let meta = &self.submissions[submission_index].meta;
        let job = &self.jobs[job_index];
        job.tid == meta.tid
            && meta.pre_submission_cpu_timestamp <= job.amdgpu_cs_ioctl_time_ns
            && job.amdgpu_cs_ioctl_time_ns <= meta.post_submission_cpu_timestamp
    }

    fn find_job_for_submission(&self, submission_index: usize) -> Option<usize> {
        (0..self.jobs.len()).find(|&job_index| {
            self.submission_matches_job(submission_index, job_index)
        })
    }

    /// Emits the command-buffer and debug-marker timers of a submission now
    /// that its job (and so its spot on the timeline) is known.
    fn place_submission(&mut self, submission_index: usize, job_index: usize) -> Vec<TimerInfo> {
        let job = self.jobs[job_index].clone();
        let entry = &mut self.submissions[submission_index];
        entry.job_index = Some(job_index);

        let mapping = submission_gpu_time_range(&entry.submission, &entry.meta).map(
            |(gpu_time_min, gpu_time_max)| GpuTimeMapping {
                gpu_time_min,
                gpu_time_max,
                window_begin_ns: job.gpu_hardware_start_time_ns,
                window_end_ns: job.dma_fence_signaled_time_ns,
            },
        );
        entry.mapping = mapping;

        let meta = entry.meta.clone();
        let submission = entry.submission.clone();
        let map = |gpu_timestamp: u64| match mapping {
            Some(mapping) => mapping.map(gpu_timestamp),
            None => job.gpu_hardware_start_time_ns,
        };

        let mut timers = Vec::new();
        for submit_info in &submission.submit_infos {
            for (depth, command_buffer) in submit_info.command_buffers.iter().enumerate() {
                let start_ns = map(command_buffer.begin_gpu_timestamp_ns);
                let end_ns = map(command_buffer.end_gpu_timestamp_ns);
                self.note_mapped_time(start_ns);
                timers.push(TimerInfo {
                    start_ns,
                    end_ns,
                    pid: job.pid,
                    tid: meta.tid,
                    function_id: 0,
                    depth: depth as u32,
                    r#type: TimerType::GpuCommandBuffer as i32,
                    timeline_hash: job.timeline_key,
                    user_data_key: 0,
                    color: None,
                });
            }
        }

        for marker in &submission.completed_markers {
            let end_ns = map(marker.end_gpu_timestamp_ns);
            self.note_mapped_time(end_ns);
            let (start_ns, tid) = match self.resolve_marker_begin(marker.begin_marker.as_ref()) {
                Some((begin_ns, begin_tid)) => (begin_ns, begin_tid),
                // The begin predates the capture (or its submission was
                // never seen): stretch to the earliest known GPU time and
                // leave the thread unattributed.
                None => (
                    self.first_known_mapped_gpu_time_ns.unwrap_or(end_ns),
                    -1,
                ),
            };
            timers.push(TimerInfo {
                start_ns: start_ns.min(end_ns),
                end_ns,
                pid: job.pid,
                tid,
                function_id: 0,
                depth: marker.depth as u32,
                r#type: TimerType::GpuDebugMarker as i32,
                timeline_hash: job.timeline_key,
                user_data_key: marker.text_key,
                color: marker.color.clone(),
            });
        }
        timers
    }

    fn resolve_marker_begin(
        &self,
        begin: Option<&orbit_proto::GpuDebugMarkerBeginInfo>,
    ) -> Option<(u64, i32)> {
        let begin = begin?;
        let begin_meta = begin.meta_info.as_ref()?;
        let entry = self
            .submissions
            .iter()
            .find(|entry| meta_matches(&entry.meta, begin_meta))?;
        let mapping = entry.mapping?;
        Some((mapping.map(begin.gpu_timestamp_ns), begin_meta.tid))
    }

    fn note_mapped_time(&mut self, mapped_ns: u64) {
        self.first_known_mapped_gpu_time_ns = Some(
            self.first_known_mapped_gpu_time_ns
                .map_or(mapped_ns, |first| first.min(mapped_ns)),
        );
    }
}
