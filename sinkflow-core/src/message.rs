use std::fmt;

use bytes::Bytes;

/// A (topic, partition) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct TopicPartition {
    pub(crate) topic: String,
    pub(crate) partition: i32,
}

impl TopicPartition {
    pub(crate) fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// A raw record read from the log.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FetchedRecord {
    pub(crate) tp: TopicPartition,
    pub(crate) offset: i64,
    pub(crate) key: Option<Bytes>,
    pub(crate) value: Bytes,
}

/// Fetch-level failure reported by the log client. Partition is unknown for errors which are
/// not scoped to a single partition (e.g. broker transport errors).
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FetchError {
    pub(crate) topic: String,
    pub(crate) partition: Option<i32>,
    pub(crate) error: String,
}

/// Result of one poll of the log.
#[derive(Debug, Default)]
pub(crate) struct Fetches {
    pub(crate) records: Vec<FetchedRecord>,
    pub(crate) errors: Vec<FetchError>,
    /// The client has been closed, no further records will be returned.
    pub(crate) closed: bool,
}

/// Highest processed offset of a partition, the client commits `offset + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CommitOffset {
    pub(crate) tp: TopicPartition,
    pub(crate) offset: i64,
}
