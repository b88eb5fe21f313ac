//! Kafka consumer-group client used by the sinkflow forwarder.
//!
//! The consumer is driven by an actor (see [Actor Pattern]) which owns the underlying `rdkafka`
//! consumer. Polling, committing, seeking and liveness probes are all serialized through the
//! actor, so the group rebalance callbacks (which librdkafka runs from inside a poll) never
//! overlap with a commit.
//!
//! [Actor Pattern]: https://ryhl.io/blog/actors-with-tokio/

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use rdkafka::ClientConfig;
use tracing::warn;

pub mod consumer;
pub mod msk_iam;

pub use consumer::{
    FetchedBatch, KafkaConsumer, KafkaConsumerConfig, KafkaFetchError, KafkaMessage, KafkaOffset,
    KafkaPartition, RebalanceListener,
};
pub use msk_iam::MskIamTokenProvider;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Connecting to Kafka {server} - {error}")]
    Connection { server: String, error: String },

    #[error("Kafka - {0}")]
    Kafka(String),

    #[error("{0}")]
    Other(String),
}

/// SASL credentials (PLAIN / SCRAM-SHA-256 / SCRAM-SHA-512).
#[derive(Clone, PartialEq)]
pub struct KafkaSaslAuth {
    pub mechanism: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for KafkaSaslAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaSaslAuth")
            .field("mechanism", &self.mechanism)
            .field("username", &self.username)
            .field("password", &"******")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TlsConfig {
    pub insecure_skip_verify: bool,
    pub ca_cert: Option<String>,
}

/// OAUTHBEARER token handed to librdkafka.
#[derive(Clone, PartialEq)]
pub struct BearerToken {
    pub token: String,
    pub principal: String,
    /// Absolute expiry in milliseconds since the unix epoch.
    pub lifetime_ms: i64,
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerToken")
            .field("principal", &self.principal)
            .field("lifetime_ms", &self.lifetime_ms)
            .finish_non_exhaustive()
    }
}

/// Supplies credentials for the OAUTHBEARER mechanism.
///
/// librdkafka asks for a token on every (re)connection and again before the previous token
/// expires, so implementations must produce a fresh token on each call instead of caching one
/// for the lifetime of the process.
pub trait TokenProvider: Send + Sync + 'static {
    fn token(&self) -> Result<BearerToken>;
}

/// Reads the bearer token from a file which is kept fresh by an external agent. The file is read
/// again on every refresh.
#[derive(Debug, Clone)]
pub struct FileTokenProvider {
    path: PathBuf,
    principal: String,
    lifetime: Duration,
}

impl FileTokenProvider {
    pub fn new(path: impl Into<PathBuf>, principal: impl Into<String>, lifetime: Duration) -> Self {
        Self {
            path: path.into(),
            principal: principal.into(),
            lifetime,
        }
    }
}

impl TokenProvider for FileTokenProvider {
    fn token(&self) -> Result<BearerToken> {
        let token = std::fs::read_to_string(&self.path).map_err(|e| {
            Error::Other(format!(
                "Reading OAUTHBEARER token from {}: {e}",
                self.path.display()
            ))
        })?;
        let token = token.trim();
        if token.is_empty() {
            return Err(Error::Other(format!(
                "OAUTHBEARER token file {} is empty",
                self.path.display()
            )));
        }

        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|e| Error::Other(format!("System clock is before unix epoch: {e}")))?
            .as_millis() as i64;

        Ok(BearerToken {
            token: token.to_string(),
            principal: self.principal.clone(),
            lifetime_ms: now_ms + self.lifetime.as_millis() as i64,
        })
    }
}

/// Applies TLS and SASL settings to the librdkafka client configuration.
pub(crate) fn update_auth_config(
    client_config: &mut ClientConfig,
    tls_config: Option<TlsConfig>,
    auth: Option<KafkaSaslAuth>,
    oauth_bearer: bool,
) {
    let tls_enabled = tls_config.is_some();
    if let Some(tls_config) = tls_config {
        client_config.set("security.protocol", "SSL");
        if tls_config.insecure_skip_verify {
            warn!(
                "'insecureSkipVerify' is set to true, certificate validation will not be performed when connecting to Kafka server"
            );
            client_config.set("enable.ssl.certificate.verification", "false");
            client_config.set("ssl.endpoint.identification.algorithm", "none");
        }
        if let Some(ca_cert) = tls_config.ca_cert {
            client_config.set("ssl.ca.location", ca_cert);
        }
    }

    let security_protocol = if tls_enabled { "SASL_SSL" } else { "SASL_PLAINTEXT" };

    if let Some(auth) = auth {
        client_config
            .set("security.protocol", security_protocol)
            .set("sasl.mechanisms", auth.mechanism)
            .set("sasl.username", auth.username)
            .set("sasl.password", auth.password);
    } else if oauth_bearer {
        client_config
            .set("security.protocol", security_protocol)
            .set("sasl.mechanisms", "OAUTHBEARER");
    }
}
