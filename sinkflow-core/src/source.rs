use std::time::Duration;

use crate::message::{CommitOffset, Fetches, TopicPartition};

/// [Kafka] consumer group client.
///
/// [Kafka]: https://kafka.apache.org/
pub(crate) mod kafka;

/// Client of the partitioned log the records are consumed from.
#[trait_variant::make(LogClient: Send)]
#[allow(dead_code)]
pub(crate) trait LocalLogClient {
    /// Liveness probe against the log service.
    async fn ping(&mut self) -> crate::Result<()>;

    /// Fetches the next batch from the assigned partitions, waiting at most `timeout`.
    async fn poll(&mut self, timeout: Duration) -> crate::Result<Fetches>;

    /// Commits the processed offsets. The client persists `offset + 1` for every partition.
    async fn commit(&mut self, offsets: Vec<CommitOffset>) -> crate::Result<()>;

    /// Moves the fetch position of the partition back to `offset`, so that the next poll
    /// delivers it again.
    async fn rewind(&mut self, tp: &TopicPartition, offset: i64) -> crate::Result<()>;

    /// Leaves the consumer group and releases the connection.
    async fn close(&mut self);
}
