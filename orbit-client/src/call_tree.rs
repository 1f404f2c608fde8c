//! Top-down and bottom-up call trees over the post-processed samples.

use std::collections::BTreeMap;

use orbit_proto::callstack::CallstackType;
use orbit_proto::CallstackEvent;

use crate::sampling_post_processor::{PostProcessedSamplingData, ThreadSampleData};

#[derive(Debug, Default)]
pub struct CallTreeNode {
    pub sample_count: u64,
    pub children: BTreeMap<u64, CallTreeNode>,
    /// Events whose resolved callstack ends exactly at this node.
    pub exclusive_callstack_events: Vec<CallstackEvent>,
}

impl CallTreeNode {
    fn child(&mut self, function_address: u64) -> &mut CallTreeNode {
        self.children.entry(function_address).or_default()
    }
}

/// One call tree of one thread. Non-Complete samples are grouped under
/// synthetic per-error-type branches instead of polluting the real tree.
#[derive(Debug, Default)]
pub struct CallTreeView {
    pub root: CallTreeNode,
    pub unwind_error_branches: BTreeMap<i32, CallTreeNode>,
}

enum Direction {
    // Frames applied outermost first: callers on top.
    TopDown,
    // Frames applied innermost first: callees on top.
    BottomUp,
}

impl CallTreeView {
    pub fn top_down(
        thread_data: &ThreadSampleData,
        sampling_data: &PostProcessedSamplingData,
    ) -> CallTreeView {
        Self::build(thread_data, sampling_data, Direction::TopDown)
    }

    pub fn bottom_up(
        thread_data: &ThreadSampleData,
        sampling_data: &PostProcessedSamplingData,
    ) -> CallTreeView {
        Self::build(thread_data, sampling_data, Direction::BottomUp)
    }

    fn build(
        thread_data: &ThreadSampleData,
        sampling_data: &PostProcessedSamplingData,
        direction: Direction,
    ) -> CallTreeView {
        let mut view = CallTreeView::default();
        for (&callstack_id, events) in &thread_data.sampled_callstack_id_to_events {
            let Some(resolved) = sampling_data.resolved_callstack(callstack_id) else {
                continue;
            };
            let count = events.len() as u64;

            let (tree_root, frames): (&mut CallTreeNode, Vec<u64>) =
                if resolved.r#type == CallstackType::Complete as i32 {
                    let frames = match direction {
                        // Resolved frames are innermost first.
                        Direction::TopDown => resolved.frames.iter().rev().copied().collect(),
                        Direction::BottomUp => resolved.frames.clone(),
                    };
                    (&mut view.root, frames)
                } else {
                    // Only the innermost frame of a broken callstack is
                    // meaningful.
                    (
                        view.unwind_error_branches
                            .entry(resolved.r#type)
                            .or_default(),
                        vec![resolved.frames[0]],
                    )
                };

            tree_root.sample_count += count;
            let mut node = tree_root;
            for function_address in frames {
                node = node.child(function_address);
                node.sample_count += count;
            }
            node.exclusive_callstack_events.extend(events.iter().cloned());
        }
        view
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture_data::CaptureData;
    use crate::sampling_post_processor::create_post_processed_sampling_data;
    use orbit_proto::Callstack;

    fn build_sampling_data() -> (PostProcessedSamplingData, i64) {
        let capture_data = CaptureData::default();
        // main (0x100) -> work (0x200) -> leaf (0x300), sampled twice; and
        // main -> work sampled once; plus one broken sample.
        capture_data.callstack_data.add_unique_callstack(
            1,
            Callstack {
                frames: vec![0x300, 0x200, 0x100],
                r#type: CallstackType::Complete as i32,
            },
        );
        capture_data.callstack_data.add_unique_callstack(
            2,
            Callstack {
                frames: vec![0x200, 0x100],
                r#type: CallstackType::Complete as i32,
            },
        );
        capture_data.callstack_data.add_unique_callstack(
            3,
            Callstack {
                frames: vec![0x400],
                r#type: CallstackType::DwarfUnwindingError as i32,
            },
        );
        for (timestamp, id) in [(10, 1), (20, 1), (30, 2), (40, 3)] {
            assert!(capture_data
                .callstack_data
                .add_callstack_event(CallstackEvent {
                    tid: 5,
                    timestamp_ns: timestamp,
                    callstack_id: id,
                }));
        }
        (create_post_processed_sampling_data(&capture_data, false), 5)
    }

    #[test]
    fn top_down_tree_nests_callees_under_callers() {
        let (sampling, tid) = build_sampling_data();
        let thread_data = sampling.thread_sample_data(tid).unwrap();
        let view = CallTreeView::top_down(thread_data, &sampling);

        assert_eq!(view.root.sample_count, 3);
        let main = &view.root.children[&0x100];
        assert_eq!(main.sample_count, 3);
        let work = &main.children[&0x200];
        assert_eq!(work.sample_count, 3);
        // One sample ended in work itself.
        assert_eq!(work.exclusive_callstack_events.len(), 1);
        let leaf = &work.children[&0x300];
        assert_eq!(leaf.sample_count, 2);
        assert_eq!(leaf.exclusive_callstack_events.len(), 2);

        // The broken sample lives in its own branch.
        let errors = &view.unwind_error_branches[&(CallstackType::DwarfUnwindingError as i32)];
        assert_eq!(errors.sample_count, 1);
        assert_eq!(errors.children[&0x400].sample_count, 1);
    }

    #[test]
    fn bottom_up_tree_starts_at_the_callees() {
        let (sampling, tid) = build_sampling_data();
        let thread_data = sampling.thread_sample_data(tid).unwrap();
        let view = CallTreeView::bottom_up(thread_data, &sampling);

        let leaf = &view.root.children[&0x300];
        assert_eq!(leaf.sample_count, 2);
        assert_eq!(leaf.children[&0x200].children[&0x100].sample_count, 2);
        let work = &view.root.children[&0x200];
        assert_eq!(work.sample_count, 1);
    }
}
