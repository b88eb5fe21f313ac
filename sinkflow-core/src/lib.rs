use std::env;
use std::net::SocketAddr;

use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod error;
pub use crate::error::{Error, Result};

mod codec;
mod config;
/// [forwarder] moves records from the Kafka topic to the DynamoDB table. It executes the
/// following in a loop till the consumer is closed or a shutdown signal is received:
/// - Probe the brokers
/// - Poll a batch from the assigned partitions
/// - Decode and upsert every record, partition by partition
/// - Commit the offsets of the records that were written
mod forwarder;
mod message;
mod metrics;
mod shared;
mod sink;
mod source;
mod tracker;

use crate::config::Settings;
use crate::forwarder::Forwarder;
use crate::sink::dynamodb::new_dynamodb_sink;
use crate::source::kafka::new_kafka_consumer;
use crate::tracker::PartitionTracker;

/// Loads the configuration from the environment and runs the forwarder until it is closed, a
/// shutdown signal is received, or a fatal error occurs.
pub async fn run() -> Result<()> {
    let settings = Settings::load(env::vars())?;
    info!(?settings, "Starting sinkflow");

    let cln_token = CancellationToken::new();
    let shutdown_cln_token = cln_token.clone();

    // wait for SIG{INT,TERM} and invoke cancellation token.
    let shutdown_handle: JoinHandle<()> = tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_cln_token.cancel();
    });

    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], settings.metrics_port));
    let metrics_cln_token = cln_token.child_token();
    let metrics_handle: JoinHandle<Result<()>> =
        metrics::spawn_metrics_http_server(metrics_addr, metrics_cln_token);

    let result = start_forwarder(settings, cln_token.clone()).await;
    if let Err(e) = &result {
        error!(?e, "Application error");
    }

    // abort the signal handler task since we are shutting down
    if !shutdown_handle.is_finished() {
        shutdown_handle.abort();
    }
    cln_token.cancel();
    // a server error has already been logged by the task
    if let Err(e) = metrics_handle.await {
        error!(?e, "Metrics server task failed");
    }

    info!("Gracefully Exiting...");
    result
}

async fn start_forwarder(settings: Settings, cln_token: CancellationToken) -> Result<()> {
    let store = new_dynamodb_sink(settings.dynamodb.clone()).await?;
    info!(table = store.table_name(), "DynamoDB sink created");

    let tracker = PartitionTracker::new();
    let consumer = new_kafka_consumer(&settings, tracker.clone()).await?;
    info!(
        topic = %settings.kafka.topic,
        group = %settings.kafka.consumer_group,
        "Joined consumer group"
    );

    Forwarder::new(consumer, store, tracker, settings.poll_timeout, cln_token)
        .start()
        .await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(?e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C signal");
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("Received terminate signal");
            }
            Err(e) => {
                error!(?e, "Failed to install terminate signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
