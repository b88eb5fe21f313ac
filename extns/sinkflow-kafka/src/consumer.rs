use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rdkafka::Offset;
use rdkafka::client::{ClientContext, OAuthToken};
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::stream_consumer::StreamConsumer;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::topic_partition_list::TopicPartitionList;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::{Error, KafkaSaslAuth, Result, TlsConfig, TokenProvider};

/// Timeout for the metadata request used as liveness probe.
const PING_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout for repositioning a partition's fetch offset.
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);
/// Consecutive receive errors after which a poll returns early with what it has.
const MAX_FAILURE_COUNT: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct KafkaConsumerConfig {
    /// The list of seed brokers to connect to.
    pub brokers: Vec<String>,
    /// The topic to consume from.
    pub topic: String,
    /// The consumer group to join.
    pub consumer_group: String,
    /// SASL credentials, if the cluster requires them.
    pub auth: Option<KafkaSaslAuth>,
    /// TLS settings, if the cluster listener is encrypted.
    pub tls: Option<TlsConfig>,
    /// Any supported kafka client configuration options from
    /// https://docs.confluent.io/platform/current/clients/librdkafka/html/md_CONFIGURATION.html
    pub kafka_raw_config: HashMap<String, String>,
}

/// A (topic, partition) pair as reported by the group coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KafkaPartition {
    pub topic: String,
    pub partition: i32,
}

/// Represents a Kafka offset for a specific topic partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KafkaOffset {
    /// The topic name
    pub topic: String,
    /// The partition id within a topic
    pub partition: i32,
    /// The offset of the last processed message within a partition
    pub offset: i64,
}

/// Message represents a record fetched from Kafka.
#[derive(Debug, Clone)]
pub struct KafkaMessage {
    /// The topic name.
    pub topic: String,
    /// The partition number.
    pub partition: i32,
    /// The offset of the message.
    pub offset: i64,
    /// Key of the message
    pub key: Option<Bytes>,
    /// The user payload.
    pub value: Bytes,
}

impl From<&BorrowedMessage<'_>> for KafkaMessage {
    fn from(message: &BorrowedMessage<'_>) -> Self {
        KafkaMessage {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(Bytes::copy_from_slice),
            // The rdkafka doc says that the payload can be None if there is no payload.
            value: message
                .payload()
                .map(Bytes::copy_from_slice)
                .unwrap_or_default(),
        }
    }
}

/// A fetch-level error. `partition` is only known for partition scoped errors.
#[derive(Debug, Clone, PartialEq)]
pub struct KafkaFetchError {
    pub topic: String,
    pub partition: Option<i32>,
    pub error: String,
}

impl KafkaFetchError {
    fn new(topic: &str, err: &KafkaError) -> Self {
        let partition = match err {
            KafkaError::PartitionEOF(partition) => Some(*partition),
            _ => None,
        };
        KafkaFetchError {
            topic: topic.to_string(),
            partition,
            error: err.to_string(),
        }
    }
}

/// The result of one poll.
#[derive(Debug, Default)]
pub struct FetchedBatch {
    pub messages: Vec<KafkaMessage>,
    pub errors: Vec<KafkaFetchError>,
    /// Set once the consumer has been closed, no further messages will be returned.
    pub closed: bool,
}

impl FetchedBatch {
    fn closed() -> Self {
        FetchedBatch {
            closed: true,
            ..Default::default()
        }
    }
}

/// Receives the consumer group membership transitions.
///
/// The callbacks are invoked by librdkafka from inside a poll of the consumer. `revoked` returns
/// the offsets which were processed but not yet committed for the revoked partitions; they are
/// committed synchronously before the revocation is acknowledged to the group coordinator.
/// `lost` is called when the partitions may already be owned by another member, nothing is
/// committed in that case.
pub trait RebalanceListener: Send + Sync + 'static {
    fn assigned(&self, partitions: &[KafkaPartition]);

    fn revoked(&self, partitions: &[KafkaPartition]) -> Vec<KafkaOffset>;

    fn lost(&self, partitions: &[KafkaPartition]);
}

// A context can be used to change the behavior of consumers by adding callbacks
// that will be executed by librdkafka.
struct SinkContext {
    listener: Arc<dyn RebalanceListener>,
    token_provider: Option<Arc<dyn TokenProvider>>,
}

impl ClientContext for SinkContext {
    const ENABLE_REFRESH_OAUTH_TOKEN: bool = true;

    fn generate_oauth_token(
        &self,
        _oauthbearer_config: Option<&str>,
    ) -> core::result::Result<OAuthToken, Box<dyn std::error::Error>> {
        let Some(provider) = &self.token_provider else {
            return Err("OAUTHBEARER token requested but no token provider is configured".into());
        };
        let token = provider.token().inspect_err(|e| {
            error!(?e, "Failed to generate OAUTHBEARER token");
        })?;
        debug!(principal = %token.principal, "Generated OAUTHBEARER token");
        Ok(OAuthToken {
            token: token.token,
            principal_name: token.principal,
            lifetime_ms: token.lifetime_ms,
        })
    }
}

impl ConsumerContext for SinkContext {
    fn pre_rebalance(&self, consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                let partitions = partitions_of(tpl);
                if consumer.assignment_lost() {
                    warn!(?partitions, "Partitions lost");
                    self.listener.lost(&partitions);
                    return;
                }

                info!(?partitions, "Partitions revoked");
                let offsets = self.listener.revoked(&partitions);
                if offsets.is_empty() {
                    return;
                }
                // the revocation is acknowledged only when this callback returns, so flush the
                // processed offsets while we still own the partitions.
                let result = commit_list(&offsets)
                    .and_then(|tpl| consumer.commit(&tpl, CommitMode::Sync));
                match result {
                    Ok(()) => info!(?offsets, "Flushed offsets of revoked partitions"),
                    Err(e) => error!(?e, ?offsets, "Failed to flush offsets of revoked partitions"),
                }
            }
            Rebalance::Assign(_) => {}
            Rebalance::Error(e) => {
                error!(?e, "Rebalance failed, treating the current assignment as lost");
                match consumer.assignment() {
                    Ok(tpl) => self.listener.lost(&partitions_of(&tpl)),
                    Err(e) => error!(?e, "Failed to read the current assignment"),
                }
            }
        }
    }

    fn post_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Assign(tpl) = rebalance {
            let partitions = partitions_of(tpl);
            info!(?partitions, "Partitions assigned");
            self.listener.assigned(&partitions);
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        debug!("Committing offsets: {:?}", result);
    }
}

fn partitions_of(tpl: &TopicPartitionList) -> Vec<KafkaPartition> {
    tpl.elements()
        .iter()
        .map(|elem| KafkaPartition {
            topic: elem.topic().to_string(),
            partition: elem.partition(),
        })
        .collect()
}

/// Builds the list to commit, keeping only the highest offset of every partition.
fn commit_list(offsets: &[KafkaOffset]) -> KafkaResult<TopicPartitionList> {
    let mut highest: HashMap<(&str, i32), i64> = HashMap::new();
    for kafka_offset in offsets {
        highest
            .entry((kafka_offset.topic.as_str(), kafka_offset.partition))
            .and_modify(|current| {
                if kafka_offset.offset > *current {
                    *current = kafka_offset.offset;
                }
            })
            .or_insert(kafka_offset.offset);
    }

    let mut tpl = TopicPartitionList::new();
    for ((topic, partition), offset) in highest {
        // The committed offset is the position of the next message to be read, hence offset+1.
        tpl.add_partition_offset(topic, partition, Offset::Offset(offset + 1))?;
    }
    Ok(tpl)
}

type SinkConsumer = StreamConsumer<SinkContext>;

enum KafkaActorMessage {
    Poll {
        timeout: Duration,
        respond_to: oneshot::Sender<FetchedBatch>,
    },
    Commit {
        offsets: Vec<KafkaOffset>,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Seek {
        partition: KafkaPartition,
        offset: i64,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Ping {
        respond_to: oneshot::Sender<Result<()>>,
    },
    Close {
        respond_to: oneshot::Sender<()>,
    },
}

struct KafkaActor {
    /// None once the consumer has been closed.
    consumer: Option<Arc<SinkConsumer>>,
    topic: String,
    batch_size: usize,
    handler_rx: mpsc::Receiver<KafkaActorMessage>,
}

impl KafkaActor {
    async fn start(
        config: KafkaConsumerConfig,
        batch_size: usize,
        listener: Arc<dyn RebalanceListener>,
        token_provider: Option<Arc<dyn TokenProvider>>,
        handler_rx: mpsc::Receiver<KafkaActorMessage>,
    ) -> Result<()> {
        let mut client_config = ClientConfig::new();
        // https://docs.confluent.io/platform/current/clients/librdkafka/html/md_CONFIGURATION.html
        client_config
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("auto.offset.reset", "earliest");
        if !config.kafka_raw_config.is_empty() {
            info!(
                "Applying user-specified kafka config: {}",
                config
                    .kafka_raw_config
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<String>>()
                    .join(", ")
            );
            for (key, value) in config.kafka_raw_config {
                client_config.set(key, value);
            }
        }
        client_config
            .set("group.id", &config.consumer_group)
            .set("bootstrap.servers", config.brokers.join(","))
            .set("enable.auto.commit", "false")
            .set_log_level(RDKafkaLogLevel::Warning);

        crate::update_auth_config(
            &mut client_config,
            config.tls,
            config.auth,
            token_provider.is_some(),
        );

        let context = SinkContext {
            listener,
            token_provider,
        };
        let consumer: Arc<SinkConsumer> =
            Arc::new(client_config.create_with_context(context).map_err(|err| {
                Error::Connection {
                    server: config.brokers.join(","),
                    error: err.to_string(),
                }
            })?);

        // NOTE: Subscribing to a non-existent topic will not return an error
        // The error happens only when we try to read from the topic
        consumer
            .subscribe(&[&config.topic])
            .map_err(|err| Error::Kafka(format!("Failed to subscribe to topic: {err}")))?;

        // The consumer.subscribe() will not fail even if the credentials are invalid.
        // To ensure creds/certificates are valid, we probe the brokers before starting the actor.
        let mut actor = KafkaActor {
            consumer: Some(consumer),
            topic: config.topic,
            batch_size,
            handler_rx,
        };
        actor
            .ping()
            .await
            .map_err(|err| Error::Connection {
                server: config.brokers.join(","),
                error: err.to_string(),
            })?;

        let consumer_group = config.consumer_group;
        tokio::spawn(async move {
            info!(
                topic = %actor.topic,
                group = %consumer_group,
                "Starting Kafka consumer..."
            );
            // This actor terminates when sender end of the handler_rx is closed
            actor.run().await;
        });

        Ok(())
    }

    // run method will only return when the sender end of the handler_rx is closed.
    async fn run(mut self) {
        while let Some(msg) = self.handler_rx.recv().await {
            self.handle_message(msg).await;
        }
        self.close().await;
    }

    async fn handle_message(&mut self, msg: KafkaActorMessage) {
        match msg {
            KafkaActorMessage::Poll {
                timeout,
                respond_to,
            } => {
                let batch = self.poll(timeout).await;
                if respond_to.send(batch).is_err() {
                    warn!("Poll requester dropped before receiving the batch");
                }
            }
            KafkaActorMessage::Commit {
                offsets,
                respond_to,
            } => {
                let status = self.commit(offsets).await;
                let _ = respond_to.send(status);
            }
            KafkaActorMessage::Seek {
                partition,
                offset,
                respond_to,
            } => {
                let status = self.seek(partition, offset).await;
                let _ = respond_to.send(status);
            }
            KafkaActorMessage::Ping { respond_to } => {
                let status = self.ping().await;
                let _ = respond_to.send(status);
            }
            KafkaActorMessage::Close { respond_to } => {
                self.close().await;
                let _ = respond_to.send(());
            }
        }
    }

    fn consumer(&self) -> Result<Arc<SinkConsumer>> {
        self.consumer
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| Error::Other("Kafka consumer is closed".to_string()))
    }

    /// Reads up to `batch_size` messages, waiting at most `timeout`.
    async fn poll(&mut self, timeout: Duration) -> FetchedBatch {
        let Ok(consumer) = self.consumer() else {
            return FetchedBatch::closed();
        };

        let mut batch = FetchedBatch::default();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        // A successful read will reset the failure count
        let mut continuous_failure_count = 0;
        loop {
            if batch.messages.len() >= self.batch_size {
                break;
            }
            tokio::select! {
                biased;

                _ = &mut deadline => {
                    break;
                }

                message = consumer.recv() => {
                    match message {
                        Ok(message) => {
                            continuous_failure_count = 0;
                            batch.messages.push(KafkaMessage::from(&message));
                        }
                        Err(e) => {
                            batch.errors.push(KafkaFetchError::new(&self.topic, &e));
                            continuous_failure_count += 1;
                            if continuous_failure_count > MAX_FAILURE_COUNT {
                                error!(?e, "Too many consecutive read failures, returning partial batch");
                                break;
                            }
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }
        debug!(
            msg_count = batch.messages.len(),
            err_count = batch.errors.len(),
            "Polled messages from Kafka"
        );
        batch
    }

    async fn commit(&mut self, offsets: Vec<KafkaOffset>) -> Result<()> {
        let consumer = self.consumer()?;
        let tpl = commit_list(&offsets).map_err(|e| {
            Error::Kafka(format!("Failed to add partition offset for commit: {e}"))
        })?;

        // commit in sync mode blocks until the coordinator responds, so run it off the runtime.
        tokio::task::spawn_blocking(move || {
            consumer
                .commit(&tpl, CommitMode::Sync)
                .map_err(|e| Error::Kafka(format!("Failed to commit offsets: {e}")))
        })
        .await
        .map_err(|e| Error::Other(format!("Waiting for spawned commit task to complete: {e:?}")))?
    }

    async fn seek(&mut self, partition: KafkaPartition, offset: i64) -> Result<()> {
        let consumer = self.consumer()?;
        tokio::task::spawn_blocking(move || {
            consumer
                .seek(
                    &partition.topic,
                    partition.partition,
                    Offset::Offset(offset),
                    SEEK_TIMEOUT,
                )
                .map_err(|e| {
                    Error::Kafka(format!(
                        "Failed to seek partition {} to offset {offset}: {e}",
                        partition.partition
                    ))
                })
        })
        .await
        .map_err(|e| Error::Other(format!("Waiting for spawned seek task to complete: {e:?}")))?
    }

    async fn ping(&mut self) -> Result<()> {
        let consumer = self.consumer()?;
        let topic = self.topic.clone();
        // fetch_metadata internally calls rd_kafka_metadata which is a blocking call.
        tokio::task::spawn_blocking(move || {
            consumer
                .fetch_metadata(Some(&topic), PING_TIMEOUT)
                .map(|_| ())
                .map_err(|e| Error::Kafka(format!("Failed to fetch metadata: {e}")))
        })
        .await
        .map_err(|e| Error::Other(format!("Waiting for spawned ping task to complete: {e:?}")))?
    }

    /// Leaves the group and releases the connection. Closing the consumer revokes its
    /// partitions, which flushes their processed offsets through the rebalance callback.
    async fn close(&mut self) {
        let Some(consumer) = self.consumer.take() else {
            return;
        };
        info!("Closing Kafka consumer");
        let result = tokio::task::spawn_blocking(move || {
            consumer.unsubscribe();
            drop(consumer);
        })
        .await;
        if let Err(e) = result {
            error!(?e, "Failed to close Kafka consumer");
        }
    }
}

/// Handle to the consumer actor.
#[derive(Clone)]
pub struct KafkaConsumer {
    actor_tx: mpsc::Sender<KafkaActorMessage>,
}

impl KafkaConsumer {
    /// Creates the consumer, joins the group and subscribes to the topic. Fails if the brokers
    /// cannot be reached.
    pub async fn connect(
        config: KafkaConsumerConfig,
        batch_size: usize,
        listener: Arc<dyn RebalanceListener>,
        token_provider: Option<Arc<dyn TokenProvider>>,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel(10);
        KafkaActor::start(config, batch_size, listener, token_provider, rx).await?;
        Ok(Self { actor_tx: tx })
    }

    /// Polls for the next batch. A terminated actor is reported as a closed batch.
    pub async fn poll(&self, timeout: Duration) -> FetchedBatch {
        let (tx, rx) = oneshot::channel();
        let msg = KafkaActorMessage::Poll {
            timeout,
            respond_to: tx,
        };
        if self.actor_tx.send(msg).await.is_err() {
            return FetchedBatch::closed();
        }
        rx.await.unwrap_or_else(|_| FetchedBatch::closed())
    }

    pub async fn commit(&self, offsets: Vec<KafkaOffset>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let msg = KafkaActorMessage::Commit {
            offsets,
            respond_to: tx,
        };
        let _ = self.actor_tx.send(msg).await;
        rx.await
            .map_err(|_| Error::Other("Actor task terminated".into()))?
    }

    pub async fn seek(&self, partition: KafkaPartition, offset: i64) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let msg = KafkaActorMessage::Seek {
            partition,
            offset,
            respond_to: tx,
        };
        let _ = self.actor_tx.send(msg).await;
        rx.await
            .map_err(|_| Error::Other("Actor task terminated".into()))?
    }

    pub async fn ping(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let msg = KafkaActorMessage::Ping { respond_to: tx };
        let _ = self.actor_tx.send(msg).await;
        rx.await
            .map_err(|_| Error::Other("Actor task terminated".into()))?
    }

    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        let msg = KafkaActorMessage::Close { respond_to: tx };
        if self.actor_tx.send(msg).await.is_ok() {
            let _ = rx.await;
        }
    }
}
