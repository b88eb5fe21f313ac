use std::sync::Arc;
use std::time::Duration;

use sinkflow_kafka::{
    FetchedBatch, FileTokenProvider, KafkaConsumer, KafkaOffset, KafkaPartition,
    MskIamTokenProvider, RebalanceListener, TokenProvider,
};

use crate::config::{OAUTH_TOKEN_LIFETIME, Settings};
use crate::error::Error;
use crate::message::{CommitOffset, FetchError, FetchedRecord, Fetches, TopicPartition};
use crate::source::LogClient;
use crate::tracker::PartitionTracker;

impl From<sinkflow_kafka::Error> for Error {
    fn from(value: sinkflow_kafka::Error) -> Self {
        match value {
            sinkflow_kafka::Error::Kafka(e) => Error::Log(e),
            sinkflow_kafka::Error::Connection { server, error } => Error::Log(format!(
                "Failed to connect to Kafka server: {server} - {error}"
            )),
            sinkflow_kafka::Error::Other(e) => Error::Log(e),
        }
    }
}

impl From<KafkaPartition> for TopicPartition {
    fn from(value: KafkaPartition) -> Self {
        TopicPartition {
            topic: value.topic,
            partition: value.partition,
        }
    }
}

impl From<CommitOffset> for KafkaOffset {
    fn from(value: CommitOffset) -> Self {
        KafkaOffset {
            topic: value.tp.topic,
            partition: value.tp.partition,
            offset: value.offset,
        }
    }
}

impl From<FetchedBatch> for Fetches {
    fn from(batch: FetchedBatch) -> Self {
        Fetches {
            records: batch
                .messages
                .into_iter()
                .map(|msg| FetchedRecord {
                    tp: TopicPartition::new(msg.topic, msg.partition),
                    offset: msg.offset,
                    key: msg.key,
                    value: msg.value,
                })
                .collect(),
            errors: batch
                .errors
                .into_iter()
                .map(|err| FetchError {
                    topic: err.topic,
                    partition: err.partition,
                    error: err.error,
                })
                .collect(),
            closed: batch.closed,
        }
    }
}

fn to_topic_partitions(partitions: &[KafkaPartition]) -> Vec<TopicPartition> {
    partitions.iter().cloned().map(TopicPartition::from).collect()
}

impl RebalanceListener for PartitionTracker {
    fn assigned(&self, partitions: &[KafkaPartition]) {
        PartitionTracker::assigned(self, &to_topic_partitions(partitions));
    }

    fn revoked(&self, partitions: &[KafkaPartition]) -> Vec<KafkaOffset> {
        PartitionTracker::revoked(self, &to_topic_partitions(partitions))
            .into_iter()
            .map(KafkaOffset::from)
            .collect()
    }

    fn lost(&self, partitions: &[KafkaPartition]) {
        PartitionTracker::lost(self, &to_topic_partitions(partitions));
    }
}

/// Connects to the brokers and joins the consumer group. Membership changes are reported to
/// the tracker. With MSK IAM, tokens are signed for the configured AWS region.
pub(crate) async fn new_kafka_consumer(
    settings: &Settings,
    tracker: PartitionTracker,
) -> crate::Result<KafkaConsumer> {
    let token_provider: Option<Arc<dyn TokenProvider>> = if settings.aws_msk_iam {
        let provider = MskIamTokenProvider::from_env(settings.dynamodb.region.clone()).await?;
        Some(Arc::new(provider) as Arc<dyn TokenProvider>)
    } else {
        settings.oauth_token_file.as_ref().map(|path| {
            Arc::new(FileTokenProvider::new(
                path,
                settings.oauth_principal.clone(),
                OAUTH_TOKEN_LIFETIME,
            )) as Arc<dyn TokenProvider>
        })
    };

    Ok(KafkaConsumer::connect(
        settings.kafka.clone(),
        settings.batch_size,
        Arc::new(tracker),
        token_provider,
    )
    .await?)
}

impl LogClient for KafkaConsumer {
    async fn ping(&mut self) -> crate::Result<()> {
        Ok(KafkaConsumer::ping(self).await?)
    }

    async fn poll(&mut self, timeout: Duration) -> crate::Result<Fetches> {
        Ok(KafkaConsumer::poll(self, timeout).await.into())
    }

    async fn commit(&mut self, offsets: Vec<CommitOffset>) -> crate::Result<()> {
        let offsets = offsets.into_iter().map(KafkaOffset::from).collect();
        Ok(KafkaConsumer::commit(self, offsets).await?)
    }

    async fn rewind(&mut self, tp: &TopicPartition, offset: i64) -> crate::Result<()> {
        let partition = KafkaPartition {
            topic: tp.topic.clone(),
            partition: tp.partition,
        };
        Ok(KafkaConsumer::seek(self, partition, offset).await?)
    }

    async fn close(&mut self) {
        KafkaConsumer::close(self).await;
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use sinkflow_kafka::{KafkaFetchError, KafkaMessage};

    use super::*;

    fn partition(partition: i32) -> KafkaPartition {
        KafkaPartition {
            topic: "users".to_string(),
            partition,
        }
    }

    #[test]
    fn test_tracker_as_rebalance_listener() {
        let tracker = PartitionTracker::new();
        let listener: Arc<dyn RebalanceListener> = Arc::new(tracker.clone());

        listener.assigned(&[partition(0), partition(1)]);
        assert_eq!(
            tracker.assigned_partitions(),
            vec![TopicPartition::new("users", 0), TopicPartition::new("users", 1)]
        );

        let tp = TopicPartition::new("users", 1);
        let epoch = tracker.epoch(&tp).unwrap();
        tracker.advance(&tp, 41, epoch);

        let flush = listener.revoked(&[partition(1)]);
        assert_eq!(
            flush,
            vec![KafkaOffset {
                topic: "users".to_string(),
                partition: 1,
                offset: 41,
            }]
        );

        listener.lost(&[partition(0)]);
        assert!(tracker.assigned_partitions().is_empty());
    }

    #[test]
    fn test_fetched_batch_conversion() {
        let batch = FetchedBatch {
            messages: vec![KafkaMessage {
                topic: "users".to_string(),
                partition: 2,
                offset: 10,
                key: Some(Bytes::from_static(b"k")),
                value: Bytes::from_static(b"{}"),
            }],
            errors: vec![KafkaFetchError {
                topic: "users".to_string(),
                partition: Some(2),
                error: "broker down".to_string(),
            }],
            closed: false,
        };

        let fetches: Fetches = batch.into();
        assert_eq!(fetches.records.len(), 1);
        assert_eq!(fetches.records[0].tp, TopicPartition::new("users", 2));
        assert_eq!(fetches.records[0].offset, 10);
        assert_eq!(fetches.errors[0].partition, Some(2));
        assert!(!fetches.closed);
    }

    #[test]
    fn test_kafka_error_conversion() {
        let err: Error = sinkflow_kafka::Error::Connection {
            server: "b-1:9092".to_string(),
            error: "refused".to_string(),
        }
        .into();
        assert_eq!(
            err,
            Error::Log("Failed to connect to Kafka server: b-1:9092 - refused".to_string())
        );
    }
}
