//! In-memory doubles for the log and the store.
//!
//! [InMemoryLog] behaves like a consumer group member: rebalance events are applied at the start
//! of a poll and reported to the [PartitionTracker], revoked partitions are flushed before they
//! are released, and newly assigned partitions resume from their committed offset.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::Error;
use crate::codec::KEY_ATTRIBUTE;
use crate::message::{CommitOffset, FetchError, FetchedRecord, Fetches, TopicPartition};
use crate::sink::{Item, Store, WriteError};
use crate::source::LogClient;
use crate::tracker::PartitionTracker;

/// Controller for injecting failures during testing.
#[derive(Debug, Default)]
pub(crate) struct ErrorInjector {
    fail_next_pings: AtomicUsize,
    fail_next_commits: AtomicUsize,
    fail_next_rewinds: AtomicUsize,
    fail_next_transient_writes: AtomicUsize,
    fail_next_rejected_writes: AtomicUsize,
}

impl ErrorInjector {
    pub(crate) fn fail_pings(&self, count: usize) {
        self.fail_next_pings.store(count, Ordering::Relaxed);
    }

    pub(crate) fn fail_commits(&self, count: usize) {
        self.fail_next_commits.store(count, Ordering::Relaxed);
    }

    pub(crate) fn fail_rewinds(&self, count: usize) {
        self.fail_next_rewinds.store(count, Ordering::Relaxed);
    }

    pub(crate) fn fail_transient_writes(&self, count: usize) {
        self.fail_next_transient_writes
            .store(count, Ordering::Relaxed);
    }

    pub(crate) fn fail_rejected_writes(&self, count: usize) {
        self.fail_next_rejected_writes
            .store(count, Ordering::Relaxed);
    }

    /// Consumes one injected failure from the counter, if any is left.
    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// A rebalance event delivered by the group coordinator.
#[derive(Debug, Clone)]
pub(crate) enum RebalanceEvent {
    Assign(Vec<TopicPartition>),
    Revoke(Vec<TopicPartition>),
    Lose(Vec<TopicPartition>),
}

#[derive(Debug, Default)]
struct PartitionLog {
    records: Vec<Bytes>,
    /// Next offset to fetch.
    position: i64,
    /// Next offset to read after a restart, i.e. last committed offset + 1.
    committed: Option<i64>,
}

#[derive(Debug, Default)]
struct LogState {
    partitions: BTreeMap<TopicPartition, PartitionLog>,
    assigned: BTreeSet<TopicPartition>,
    events: VecDeque<Vec<RebalanceEvent>>,
    fetch_errors: VecDeque<Vec<FetchError>>,
    /// Records returned by the next poll whether or not their partition is assigned.
    stale: Vec<FetchedRecord>,
    /// Commits issued by the forwarder, tagged with the poll they followed.
    commit_calls: Vec<(usize, Vec<CommitOffset>)>,
    /// Offsets flushed on revocation.
    flushed: Vec<CommitOffset>,
    polls: usize,
    close_after: Option<usize>,
    closed: bool,
    close_calls: usize,
}

/// In-memory partitioned log with a single consumer group member.
#[derive(Clone)]
pub(crate) struct InMemoryLog {
    state: Arc<Mutex<LogState>>,
    tracker: PartitionTracker,
    batch_size: usize,
    error_injector: Arc<ErrorInjector>,
}

impl InMemoryLog {
    pub(crate) fn new(tracker: PartitionTracker) -> Self {
        Self {
            state: Arc::default(),
            tracker,
            batch_size: 500,
            error_injector: Arc::default(),
        }
    }

    pub(crate) fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub(crate) fn error_injector(&self) -> &Arc<ErrorInjector> {
        &self.error_injector
    }

    /// Appends records to a partition, offsets start at 0.
    pub(crate) fn produce(&self, tp: &TopicPartition, payloads: &[&str]) {
        let mut state = self.state.lock();
        let log = state.partitions.entry(tp.clone()).or_default();
        log.records
            .extend(payloads.iter().map(|p| Bytes::copy_from_slice(p.as_bytes())));
    }

    /// Queues rebalance events, delivered together at the start of the next poll that has not
    /// yet been scripted.
    pub(crate) fn schedule(&self, events: Vec<RebalanceEvent>) {
        self.state.lock().events.push_back(events);
    }

    /// Queues fetch errors returned by a future poll, one entry per poll.
    pub(crate) fn schedule_fetch_errors(&self, errors: Vec<FetchError>) {
        self.state.lock().fetch_errors.push_back(errors);
    }

    /// Makes the next poll return records of a partition this member does not own, like a
    /// client handing out messages buffered before the partition moved to another member.
    pub(crate) fn deliver_stale(&self, tp: &TopicPartition, first_offset: i64, payloads: &[&str]) {
        let mut state = self.state.lock();
        state
            .stale
            .extend(payloads.iter().zip(first_offset..).map(|(p, offset)| FetchedRecord {
                tp: tp.clone(),
                offset,
                key: None,
                value: Bytes::copy_from_slice(p.as_bytes()),
            }));
    }

    /// Reports the log as closed once `polls` polls have been served.
    pub(crate) fn close_after(&self, polls: usize) {
        self.state.lock().close_after = Some(polls);
    }

    /// Applies a rebalance right away, as if it happened while a write was in flight.
    pub(crate) fn rebalance_now(&self, event: RebalanceEvent) {
        let mut state = self.state.lock();
        self.apply(&mut state, event);
    }

    fn apply(&self, state: &mut LogState, event: RebalanceEvent) {
        match event {
            RebalanceEvent::Assign(tps) => {
                for tp in &tps {
                    let log = state.partitions.entry(tp.clone()).or_default();
                    log.position = log.committed.unwrap_or(0);
                    state.assigned.insert(tp.clone());
                }
                self.tracker.assigned(&tps);
            }
            RebalanceEvent::Revoke(tps) => {
                for offset in self.tracker.revoked(&tps) {
                    if let Some(log) = state.partitions.get_mut(&offset.tp) {
                        log.committed = Some(offset.offset + 1);
                    }
                    state.flushed.push(offset);
                }
                for tp in &tps {
                    state.assigned.remove(tp);
                }
            }
            RebalanceEvent::Lose(tps) => {
                self.tracker.lost(&tps);
                for tp in &tps {
                    state.assigned.remove(tp);
                }
            }
        }
    }

    pub(crate) fn committed(&self, tp: &TopicPartition) -> Option<i64> {
        self.state
            .lock()
            .partitions
            .get(tp)
            .and_then(|log| log.committed)
    }

    pub(crate) fn commit_calls(&self) -> Vec<(usize, Vec<CommitOffset>)> {
        self.state.lock().commit_calls.clone()
    }

    /// All offsets committed for the partition, in order.
    pub(crate) fn commits_for(&self, tp: &TopicPartition) -> Vec<i64> {
        self.state
            .lock()
            .commit_calls
            .iter()
            .flat_map(|(_, offsets)| offsets.iter())
            .filter(|offset| &offset.tp == tp)
            .map(|offset| offset.offset)
            .collect()
    }

    pub(crate) fn flushed(&self) -> Vec<CommitOffset> {
        self.state.lock().flushed.clone()
    }

    pub(crate) fn polls(&self) -> usize {
        self.state.lock().polls
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }
}

impl LogClient for InMemoryLog {
    async fn ping(&mut self) -> crate::Result<()> {
        if ErrorInjector::take(&self.error_injector.fail_next_pings) {
            return Err(Error::Log("injected ping failure".to_string()));
        }
        Ok(())
    }

    async fn poll(&mut self, _timeout: Duration) -> crate::Result<Fetches> {
        let mut state = self.state.lock();
        if state.closed || state.close_after.is_some_and(|n| state.polls >= n) {
            return Ok(Fetches {
                closed: true,
                ..Default::default()
            });
        }
        state.polls += 1;

        if let Some(events) = state.events.pop_front() {
            for event in events {
                self.apply(&mut state, event);
            }
        }

        let mut fetches = Fetches {
            records: std::mem::take(&mut state.stale),
            errors: state.fetch_errors.pop_front().unwrap_or_default(),
            ..Default::default()
        };
        let assigned: Vec<TopicPartition> = state.assigned.iter().cloned().collect();
        for tp in assigned {
            let Some(log) = state.partitions.get_mut(&tp) else {
                continue;
            };
            while fetches.records.len() < self.batch_size {
                let Some(value) = log.records.get(log.position as usize) else {
                    break;
                };
                fetches.records.push(FetchedRecord {
                    tp: tp.clone(),
                    offset: log.position,
                    key: None,
                    value: value.clone(),
                });
                log.position += 1;
            }
        }
        Ok(fetches)
    }

    async fn commit(&mut self, offsets: Vec<CommitOffset>) -> crate::Result<()> {
        let mut state = self.state.lock();
        let poll = state.polls;
        state.commit_calls.push((poll, offsets.clone()));
        if ErrorInjector::take(&self.error_injector.fail_next_commits) {
            return Err(Error::Log("injected commit failure".to_string()));
        }
        for offset in offsets {
            // the coordinator rejects commits of partitions owned by another member
            if !state.assigned.contains(&offset.tp) {
                return Err(Error::Log(format!("{} is not assigned", offset.tp)));
            }
            if let Some(log) = state.partitions.get_mut(&offset.tp) {
                log.committed = Some(offset.offset + 1);
            }
        }
        Ok(())
    }

    async fn rewind(&mut self, tp: &TopicPartition, offset: i64) -> crate::Result<()> {
        if ErrorInjector::take(&self.error_injector.fail_next_rewinds) {
            return Err(Error::Log("injected rewind failure".to_string()));
        }
        let mut state = self.state.lock();
        if !state.assigned.contains(tp) {
            return Err(Error::Log(format!("{tp} is not assigned")));
        }
        if let Some(log) = state.partitions.get_mut(tp) {
            log.position = offset;
        }
        Ok(())
    }

    async fn close(&mut self) {
        let mut state = self.state.lock();
        state.close_calls += 1;
        if state.closed {
            return;
        }
        // leaving the group revokes everything, flushing processed offsets
        let assigned: Vec<TopicPartition> = state.assigned.iter().cloned().collect();
        self.apply(&mut state, RebalanceEvent::Revoke(assigned));
        state.closed = true;
    }
}

type WriteHook = Arc<dyn Fn(&Item) + Send + Sync>;

#[derive(Default)]
struct StoreState {
    items: BTreeMap<String, Item>,
    writes: usize,
    on_write: Option<WriteHook>,
}

/// In-memory key-value table keyed by the record's natural key.
#[derive(Clone, Default)]
pub(crate) struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
    error_injector: Arc<ErrorInjector>,
}

impl InMemoryStore {
    pub(crate) fn fail_transient(&self, count: usize) {
        self.error_injector.fail_transient_writes(count);
    }

    pub(crate) fn fail_non_retryable(&self, count: usize) {
        self.error_injector.fail_rejected_writes(count);
    }

    /// Runs `hook` before every write attempt.
    pub(crate) fn on_write(&self, hook: impl Fn(&Item) + Send + Sync + 'static) {
        self.state.lock().on_write = Some(Arc::new(hook));
    }

    pub(crate) fn get(&self, key: &str) -> Option<Item> {
        self.state.lock().items.get(key).cloned()
    }

    pub(crate) fn snapshot(&self) -> BTreeMap<String, Item> {
        self.state.lock().items.clone()
    }

    /// Number of successful writes.
    pub(crate) fn write_count(&self) -> usize {
        self.state.lock().writes
    }
}

impl Store for InMemoryStore {
    async fn upsert(&self, item: Item) -> Result<(), WriteError> {
        let hook = self.state.lock().on_write.clone();
        if let Some(hook) = hook {
            hook(&item);
        }

        if ErrorInjector::take(&self.error_injector.fail_next_transient_writes) {
            return Err(WriteError::Transient("injected throttling".to_string()));
        }
        if ErrorInjector::take(&self.error_injector.fail_next_rejected_writes) {
            return Err(WriteError::NonRetryable("injected validation error".to_string()));
        }

        let Some(key) = item.get(KEY_ATTRIBUTE).cloned() else {
            return Err(WriteError::NonRetryable(format!(
                "item has no {KEY_ATTRIBUTE} attribute"
            )));
        };
        let mut state = self.state.lock();
        state.items.insert(key, item);
        state.writes += 1;
        Ok(())
    }
}
