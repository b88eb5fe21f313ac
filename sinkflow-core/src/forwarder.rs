//! The poll-process-commit loop.
//!
//! ```text
//! (ping) --> (poll) --> [ decode + upsert, per partition ] --> (commit) --> (shutdown?)
//!    ^                                                                         |
//!    +-------------------------------------------------------------------------+
//! ```
//!
//! Offsets are committed only after the record has been written to the store, so every record
//! is delivered at least once. A cycle is never interrupted, shutdown is observed between cycles.
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Error;
use crate::message::{FetchedRecord, Fetches, TopicPartition};
use crate::metrics::forwarder_metrics;
use crate::sink::{SinkWriter, Store, WriteOutcome};
use crate::source::LogClient;
use crate::tracker::PartitionTracker;

/// Counts of one cycle, logged at the end of it.
#[derive(Debug, Default, Clone, PartialEq)]
struct CycleSummary {
    polled: usize,
    written: usize,
    skipped: usize,
    retried: usize,
    committed_partitions: usize,
}

/// Moves records from the log to the store.
pub(crate) struct Forwarder<C, S> {
    client: C,
    writer: SinkWriter<S>,
    tracker: PartitionTracker,
    poll_timeout: Duration,
    cln_token: CancellationToken,
}

impl<C, S> Forwarder<C, S>
where
    C: LogClient,
    S: Store + Sync,
{
    pub(crate) fn new(
        client: C,
        store: S,
        tracker: PartitionTracker,
        poll_timeout: Duration,
        cln_token: CancellationToken,
    ) -> Self {
        Self {
            client,
            writer: SinkWriter::new(store),
            tracker,
            poll_timeout,
            cln_token,
        }
    }

    /// Runs cycles until the client is closed, shutdown is requested, or a fatal error occurs.
    /// The client is closed on every exit path.
    pub(crate) async fn start(mut self) -> crate::Result<()> {
        let result = self.run().await;
        if let Err(e) = &result {
            error!(?e, "Forwarder stopped with a fatal error");
        }
        self.client.close().await;
        info!("Forwarder stopped, log client closed");
        result
    }

    async fn run(&mut self) -> crate::Result<()> {
        loop {
            self.client
                .ping()
                .await
                .map_err(|e| Error::Liveness(e.to_string()))?;

            let fetches = self.client.poll(self.poll_timeout).await?;
            if fetches.closed {
                info!("Log client is closed, stopping forwarder");
                return Ok(());
            }

            let summary = self.process(fetches).await?;
            if summary.polled > 0 || summary.committed_partitions > 0 {
                info!(
                    polled = summary.polled,
                    written = summary.written,
                    skipped = summary.skipped,
                    retried = summary.retried,
                    committed_partitions = summary.committed_partitions,
                    assigned = ?self.tracker.assigned_partitions(),
                    "Cycle completed"
                );
            } else {
                debug!("Empty poll");
            }

            if self.cln_token.is_cancelled() {
                info!("Shutdown requested, stopping forwarder");
                return Ok(());
            }
        }
    }

    /// Writes one batch and commits whatever progress it made.
    async fn process(&mut self, fetches: Fetches) -> crate::Result<CycleSummary> {
        let mut summary = CycleSummary {
            polled: fetches.records.len(),
            ..Default::default()
        };
        forwarder_metrics().read(fetches.records.len());

        for err in &fetches.errors {
            warn!(
                topic = %err.topic,
                partition = ?err.partition,
                error = %err.error,
                "Fetch error"
            );
        }

        // partitions that hit a transient failure, they are left out of this cycle's commit
        let mut stopped: HashSet<TopicPartition> = HashSet::new();
        for (tp, records) in group_by_partition(fetches.records) {
            if let Some(outcome) = self.process_partition(&tp, records, &mut summary).await? {
                stopped.insert(outcome);
            }
        }

        self.commit(&stopped, &mut summary).await;
        Ok(summary)
    }

    /// Writes the records of one partition in offset order. Returns the partition if it has to be
    /// retried on the next poll.
    async fn process_partition(
        &mut self,
        tp: &TopicPartition,
        records: Vec<FetchedRecord>,
        summary: &mut CycleSummary,
    ) -> crate::Result<Option<TopicPartition>> {
        let Some(epoch) = self.tracker.epoch(tp) else {
            warn!(partition = %tp, count = records.len(), "Dropping records of unowned partition");
            summary.skipped += records.len();
            forwarder_metrics().dropped("unowned", records.len());
            return Ok(None);
        };

        let total = records.len();
        for (idx, record) in records.into_iter().enumerate() {
            if !self.tracker.owned_at(tp, epoch) {
                let remaining = total - idx;
                warn!(
                    partition = %tp,
                    offset = record.offset,
                    remaining,
                    "Partition changed owner mid-batch, dropping the rest of its records"
                );
                summary.skipped += remaining;
                forwarder_metrics().dropped("unowned", remaining);
                return Ok(None);
            }

            match self.writer.write(&record).await {
                WriteOutcome::Written => {
                    summary.written += 1;
                    self.tracker.advance(tp, record.offset, epoch);
                }
                WriteOutcome::Dropped => {
                    summary.skipped += 1;
                }
                WriteOutcome::Retry => {
                    summary.retried += total - idx;
                    self.rewind(tp, record.offset, epoch).await?;
                    return Ok(Some(tp.clone()));
                }
            }
        }
        Ok(None)
    }

    /// Asks the client to deliver the partition again starting at `offset`.
    async fn rewind(&mut self, tp: &TopicPartition, offset: i64, epoch: u64) -> crate::Result<()> {
        match self.client.rewind(tp, offset).await {
            Ok(()) => {
                debug!(partition = %tp, offset, "Rewound partition");
                Ok(())
            }
            // a new owner resumes from the committed offset anyway
            Err(e) if !self.tracker.owned_at(tp, epoch) => {
                warn!(?e, partition = %tp, "Rewind of a partition no longer owned failed");
                Ok(())
            }
            // still owned but the record would never be delivered again, restarting
            // resumes from the committed offset.
            Err(e) => Err(Error::Log(format!(
                "Rewinding partition {tp} to offset {offset}: {e}"
            ))),
        }
    }

    /// Commits the cursors accumulated since the last successful commit. A failed commit is
    /// retried on the next cycle.
    async fn commit(&mut self, exclude: &HashSet<TopicPartition>, summary: &mut CycleSummary) {
        let pending = self.tracker.pending_commits(exclude);
        if pending.is_empty() {
            return;
        }

        let offsets = pending.iter().map(|p| p.offset.clone()).collect();
        match self.client.commit(offsets).await {
            Ok(()) => {
                self.tracker.mark_committed(&pending);
                summary.committed_partitions = pending.len();
                forwarder_metrics().committed();
                debug!(?pending, "Committed offsets");
            }
            Err(e) => {
                forwarder_metrics().commit_error();
                warn!(?e, "Failed to commit offsets, will retry next cycle");
            }
        }
    }
}

/// Groups records by partition, keeping the fetch order within each partition.
fn group_by_partition(records: Vec<FetchedRecord>) -> BTreeMap<TopicPartition, Vec<FetchedRecord>> {
    let mut grouped: BTreeMap<TopicPartition, Vec<FetchedRecord>> = BTreeMap::new();
    for record in records {
        grouped.entry(record.tp.clone()).or_default().push(record);
    }
    grouped
}
