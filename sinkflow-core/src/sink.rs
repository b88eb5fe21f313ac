use std::borrow::Cow;
use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::codec::{self, KEY_ATTRIBUTE};
use crate::message::FetchedRecord;
use crate::metrics::forwarder_metrics;

/// [DynamoDB] sink.
///
/// [DynamoDB]: https://aws.amazon.com/dynamodb/
pub(crate) mod dynamodb;

/// A store item, attribute name to string value.
pub(crate) type Item = BTreeMap<String, String>;

/// Classified store failure. Every backend error maps to exactly one of these.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub(crate) enum WriteError {
    /// Network, throttling and capacity failures. The write may succeed if attempted later.
    #[error("transient write failure - {0}")]
    Transient(String),

    /// Malformed item, permission or schema failures. Retrying the same item will fail again.
    #[error("non-retryable write failure - {0}")]
    NonRetryable(String),
}

impl WriteError {
    pub(crate) fn class(&self) -> &'static str {
        match self {
            WriteError::Transient(_) => "transient",
            WriteError::NonRetryable(_) => "non_retryable",
        }
    }
}

/// Durable key-value store. `upsert` must be idempotent: writing the same item again leaves the
/// store in the same state.
#[trait_variant::make(Store: Send)]
#[allow(dead_code)]
pub(crate) trait LocalStore {
    async fn upsert(&self, item: Item) -> Result<(), WriteError>;
}

/// What happened to one record handed to the [SinkWriter].
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum WriteOutcome {
    /// The record is durably stored, its offset may be committed.
    Written,
    /// The record can never be written and has been dropped.
    Dropped,
    /// The write may succeed later, the record must be delivered again.
    Retry,
}

/// Decodes records and upserts them into the [Store].
#[derive(Clone)]
pub(crate) struct SinkWriter<S> {
    store: S,
}

impl<S: Store + Sync> SinkWriter<S> {
    pub(crate) fn new(store: S) -> Self {
        Self { store }
    }

    pub(crate) async fn write(&self, record: &FetchedRecord) -> WriteOutcome {
        let user = match codec::decode(&record.value) {
            Ok(user) => user,
            Err(e) => {
                warn!(
                    topic = %record.tp.topic,
                    partition = record.tp.partition,
                    offset = record.offset,
                    record_key = ?record_key(record),
                    ?e,
                    "Dropping record that cannot be decoded"
                );
                forwarder_metrics().dropped("decode", 1);
                return WriteOutcome::Dropped;
            }
        };

        match self.store.upsert(user.to_item()).await {
            Ok(()) => {
                debug!(
                    partition = record.tp.partition,
                    offset = record.offset,
                    key = %user.email,
                    "Record written"
                );
                forwarder_metrics().written();
                WriteOutcome::Written
            }
            Err(e) => {
                forwarder_metrics().write_error(e.class());
                match e {
                    // dropping is a policy choice: a poison record must not stall its partition.
                    WriteError::NonRetryable(reason) => {
                        warn!(
                            partition = record.tp.partition,
                            offset = record.offset,
                            record_key = ?record_key(record),
                            key_attribute = KEY_ATTRIBUTE,
                            key = %user.email,
                            reason = %reason,
                            "Dropping record rejected by the store"
                        );
                        forwarder_metrics().dropped("rejected", 1);
                        WriteOutcome::Dropped
                    }
                    WriteError::Transient(reason) => {
                        warn!(
                            partition = record.tp.partition,
                            offset = record.offset,
                            reason = %reason,
                            "Transient write failure, record will be delivered again"
                        );
                        WriteOutcome::Retry
                    }
                }
            }
        }
    }
}

/// The Kafka message key, for logging. Keys are not required to be UTF-8.
fn record_key(record: &FetchedRecord) -> Option<Cow<'_, str>> {
    record.key.as_deref().map(String::from_utf8_lossy)
}
