//! Tracks which partitions this consumer owns and how far each of them has been processed.
//!
//! Ownership changes arrive from the consumer group protocol (assigned, revoked, lost) while the
//! forwarder advances and commits cursors. Both sides go through the same lock, so a membership
//! transition is never observed half way through a cursor update.
//!
//! Every assignment of a partition gets a new epoch. A cursor update or a commit computed under
//! an older epoch is discarded, which fences off work started before a partition was lost.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::message::{CommitOffset, TopicPartition};
use crate::metrics::forwarder_metrics;

#[derive(Debug, Default)]
struct PartitionState {
    epoch: u64,
    /// Highest offset written to the store.
    processed: Option<i64>,
    /// Highest offset committed to the log.
    committed: Option<i64>,
}

impl PartitionState {
    fn pending(&self) -> Option<i64> {
        match (self.processed, self.committed) {
            (Some(processed), Some(committed)) if processed <= committed => None,
            (processed, _) => processed,
        }
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    partitions: HashMap<TopicPartition, PartitionState>,
    next_epoch: u64,
}

/// A cursor snapshot taken for a commit.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PendingCommit {
    pub(crate) offset: CommitOffset,
    epoch: u64,
}

/// Partition ownership and commit cursors, shared between the forwarder and the group
/// membership callbacks.
#[derive(Debug, Clone, Default)]
pub(crate) struct PartitionTracker {
    state: Arc<Mutex<TrackerState>>,
}

impl PartitionTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The partitions were granted to this consumer.
    pub(crate) fn assigned(&self, partitions: &[TopicPartition]) {
        let mut state = self.state.lock();
        for tp in partitions {
            state.next_epoch += 1;
            let epoch = state.next_epoch;
            state.partitions.insert(
                tp.clone(),
                PartitionState {
                    epoch,
                    ..Default::default()
                },
            );
            info!(partition = %tp, epoch, "Partition assigned");
        }
        forwarder_metrics().set_assigned(state.partitions.len());
    }

    /// The partitions are being handed over. Returns the cursors which still have to be committed
    /// before the hand over completes.
    pub(crate) fn revoked(&self, partitions: &[TopicPartition]) -> Vec<CommitOffset> {
        let mut state = self.state.lock();
        let mut flush = Vec::new();
        for tp in partitions {
            let Some(partition) = state.partitions.remove(tp) else {
                continue;
            };
            if let Some(offset) = partition.pending() {
                flush.push(CommitOffset {
                    tp: tp.clone(),
                    offset,
                });
            }
            info!(partition = %tp, pending = ?partition.pending(), "Partition revoked");
        }
        forwarder_metrics().set_assigned(state.partitions.len());
        flush
    }

    /// The partitions may already belong to another consumer. Uncommitted progress is discarded.
    pub(crate) fn lost(&self, partitions: &[TopicPartition]) {
        let mut state = self.state.lock();
        for tp in partitions {
            if let Some(partition) = state.partitions.remove(tp) {
                warn!(
                    partition = %tp,
                    discarded = ?partition.pending(),
                    "Partition lost, discarding uncommitted progress"
                );
            }
        }
        forwarder_metrics().set_assigned(state.partitions.len());
    }

    /// Current ownership epoch of the partition, None if it is not owned.
    pub(crate) fn epoch(&self, tp: &TopicPartition) -> Option<u64> {
        self.state.lock().partitions.get(tp).map(|p| p.epoch)
    }

    /// Whether the partition is still owned under the given epoch.
    pub(crate) fn owned_at(&self, tp: &TopicPartition, epoch: u64) -> bool {
        self.epoch(tp) == Some(epoch)
    }

    /// Records that `offset` has been written to the store. Ignored if the partition changed
    /// owner since `epoch` or the cursor is already past the offset.
    pub(crate) fn advance(&self, tp: &TopicPartition, offset: i64, epoch: u64) -> bool {
        let mut state = self.state.lock();
        match state.partitions.get_mut(tp) {
            Some(partition) if partition.epoch == epoch => {
                if partition.processed.is_some_and(|p| p >= offset) {
                    return false;
                }
                partition.processed = Some(offset);
                true
            }
            _ => {
                debug!(partition = %tp, offset, epoch, "Not advancing cursor of unowned partition");
                false
            }
        }
    }

    /// Snapshot of the cursors that moved since the last commit, skipping `exclude`.
    pub(crate) fn pending_commits(&self, exclude: &HashSet<TopicPartition>) -> Vec<PendingCommit> {
        let state = self.state.lock();
        let mut pending: Vec<PendingCommit> = state
            .partitions
            .iter()
            .filter(|(tp, _)| !exclude.contains(*tp))
            .filter_map(|(tp, partition)| {
                partition.pending().map(|offset| PendingCommit {
                    offset: CommitOffset {
                        tp: tp.clone(),
                        offset,
                    },
                    epoch: partition.epoch,
                })
            })
            .collect();
        pending.sort_by(|a, b| a.offset.tp.cmp(&b.offset.tp));
        pending
    }

    /// Marks a snapshot as committed. Partitions reassigned in the meantime are left alone.
    pub(crate) fn mark_committed(&self, commits: &[PendingCommit]) {
        let mut state = self.state.lock();
        for commit in commits {
            match state.partitions.get_mut(&commit.offset.tp) {
                Some(partition) if partition.epoch == commit.epoch => {
                    if partition.committed.is_none_or(|c| c < commit.offset.offset) {
                        partition.committed = Some(commit.offset.offset);
                    }
                }
                _ => debug!(
                    partition = %commit.offset.tp,
                    "Partition changed owner during commit"
                ),
            }
        }
    }

    pub(crate) fn assigned_partitions(&self) -> Vec<TopicPartition> {
        let mut partitions: Vec<TopicPartition> =
            self.state.lock().partitions.keys().cloned().collect();
        partitions.sort();
        partitions
    }

    /// Highest offset committed for the partition by this consumer since it was assigned.
    #[cfg(test)]
    pub(crate) fn committed(&self, tp: &TopicPartition) -> Option<i64> {
        self.state.lock().partitions.get(tp).and_then(|p| p.committed)
    }
}
