//! Per-partition contiguous-completion tracker (spec.md §4.5, §4.9).
//!
//! State is implicit in `(next, completed)`. Each `complete` transition
//! either extends the emitted prefix by at least one and shrinks the set,
//! or leaves `next` unchanged and grows the set by one out-of-order entry.

use crate::model::SourceLocator;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::{mpsc, Mutex};

/// One partition's commit state: the next offset that must land before any
/// later one can commit, and the out-of-order completions waiting on it.
#[derive(Debug, Default)]
struct PartitionState {
    next: i64,
    /// `i64::MIN` sentinel meaning "not yet seen a first offset".
    initialized: bool,
    completed: BTreeSet<i64>,
}

/// Tracks completion across every partition seen so far and emits commit
/// tokens in strictly ascending, contiguous order per partition.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: HashMap<i32, PartitionState>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `offset` complete for `partition`, seeding the partition's
    /// resume point with `offset` the first time it's seen. Returns the
    /// (possibly empty) run of offsets now safe to commit, in ascending
    /// order.
    pub fn complete(&mut self, partition: i32, offset: i64) -> Vec<i64> {
        let state = self.partitions.entry(partition).or_default();
        if !state.initialized {
            state.next = offset;
            state.initialized = true;
        }
        state.completed.insert(offset);

        let mut emitted = Vec::new();
        while state.completed.remove(&state.next) {
            emitted.push(state.next);
            state.next += 1;
        }
        emitted
    }

    /// Number of partitions with at least one seen offset. Used for stats.
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Out-of-order completions currently buffered for `partition`, bounded
    /// by the per-session queue capacity times active sessions on that
    /// partition (spec.md §4.5).
    pub fn pending_count(&self, partition: i32) -> usize {
        self.partitions
            .get(&partition)
            .map(|p| p.completed.len())
            .unwrap_or(0)
    }
}

/// Marks `(partition, offset)` complete in `tracker` and forwards every
/// now-committable offset to `commit_tx`, in order. Shared by every path
/// that acknowledges a source item — the worker on execution (success or
/// failure) and the ingest loop on decode failure — so both advance the
/// same offset tracker identically (spec.md §4.1, §4.10: a decode failure
/// "is marked complete so it will be committed and not redelivered").
pub async fn complete_and_forward(
    tracker: &Mutex<OffsetTracker>,
    commit_tx: &mpsc::Sender<SourceLocator>,
    partition: i32,
    offset: i64,
) {
    let emitted = {
        let mut t = tracker.lock().await;
        t.complete(partition, offset)
    };
    for off in emitted {
        let _ = commit_tx.send(SourceLocator { partition, offset: off }).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scenario C from spec.md §8: offsets 0..9 on one partition completing
    /// out of order must commit in exactly ascending contiguous order.
    #[test]
    fn scenario_c_contiguous_commit_out_of_order() {
        let mut tracker = OffsetTracker::new();
        let order = [3, 1, 0, 2, 4, 5, 9, 6, 7, 8];
        let mut commits = Vec::new();
        for offset in order {
            commits.extend(tracker.complete(0, offset));
        }
        assert_eq!(commits, vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn in_order_completion_commits_immediately() {
        let mut tracker = OffsetTracker::new();
        assert_eq!(tracker.complete(0, 0), vec![0]);
        assert_eq!(tracker.complete(0, 1), vec![1]);
        assert_eq!(tracker.complete(0, 2), vec![2]);
    }

    #[test]
    fn out_of_order_completion_withholds_commit_until_gap_fills() {
        let mut tracker = OffsetTracker::new();
        assert_eq!(tracker.complete(0, 2), Vec::<i64>::new());
        assert_eq!(tracker.pending_count(0), 1);
        assert_eq!(tracker.complete(0, 1), Vec::<i64>::new());
        assert_eq!(tracker.complete(0, 0), vec![0, 1, 2]);
        assert_eq!(tracker.pending_count(0), 0);
    }

    #[test]
    fn resume_point_seeds_from_first_offset_seen() {
        // A consumer resuming at offset 50 must not require 0..49 first.
        let mut tracker = OffsetTracker::new();
        assert_eq!(tracker.complete(0, 50), vec![50]);
        assert_eq!(tracker.complete(0, 51), vec![51]);
    }

    #[test]
    fn partitions_are_tracked_independently() {
        let mut tracker = OffsetTracker::new();
        assert_eq!(tracker.complete(0, 0), vec![0]);
        assert_eq!(tracker.complete(1, 5), vec![5]);
        assert_eq!(tracker.partition_count(), 2);
    }
}
