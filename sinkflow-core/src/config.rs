use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use sinkflow_dynamodb::DynamoSinkConfig;
use sinkflow_kafka::{KafkaConsumerConfig, KafkaSaslAuth, TlsConfig};

use crate::Error;
use crate::Result;

const ENV_MSK_BROKER: &str = "MSK_BROKER";
const ENV_MSK_TOPIC: &str = "MSK_TOPIC";
const ENV_DYNAMODB_TABLE: &str = "DYNAMODB_TABLE";
const ENV_AWS_REGION: &str = "AWS_REGION";
const ENV_CONSUMER_GROUP: &str = "CONSUMER_GROUP";
const ENV_POLL_TIMEOUT_MS: &str = "POLL_TIMEOUT_MS";
const ENV_POLL_BATCH_SIZE: &str = "POLL_BATCH_SIZE";
const ENV_DYNAMODB_ENDPOINT_URL: &str = "DYNAMODB_ENDPOINT_URL";
const ENV_KAFKA_SASL_MECHANISM: &str = "KAFKA_SASL_MECHANISM";
const ENV_KAFKA_SASL_USERNAME: &str = "KAFKA_SASL_USERNAME";
const ENV_KAFKA_SASL_PASSWORD: &str = "KAFKA_SASL_PASSWORD";
const ENV_KAFKA_OAUTH_TOKEN_FILE: &str = "KAFKA_OAUTH_TOKEN_FILE";
const ENV_KAFKA_OAUTH_PRINCIPAL: &str = "KAFKA_OAUTH_PRINCIPAL";
const ENV_KAFKA_AUTH: &str = "KAFKA_AUTH";
const ENV_KAFKA_TLS_ENABLED: &str = "KAFKA_TLS_ENABLED";
const ENV_KAFKA_TLS_CA_CERT: &str = "KAFKA_TLS_CA_CERT";
const ENV_KAFKA_TLS_INSECURE_SKIP_VERIFY: &str = "KAFKA_TLS_INSECURE_SKIP_VERIFY";
const ENV_METRICS_PORT: &str = "METRICS_PORT";
/// Prefix of raw librdkafka properties, e.g. `KAFKA_CONFIG_FETCH_MIN_BYTES` is `fetch.min.bytes`.
const ENV_KAFKA_CONFIG_PREFIX: &str = "KAFKA_CONFIG_";

const DEFAULT_CONSUMER_GROUP: &str = "msk-eks-app-consumer-group";
const DEFAULT_POLL_TIMEOUT_MS: u64 = 5000;
const DEFAULT_POLL_BATCH_SIZE: usize = 500;
const DEFAULT_METRICS_PORT: u16 = 2469;
const DEFAULT_OAUTH_PRINCIPAL: &str = "sinkflow";

/// `KAFKA_AUTH` value selecting IAM authentication against MSK.
const KAFKA_AUTH_AWS_MSK_IAM: &str = "aws_msk_iam";
/// MSK IAM tokens are valid for 15 minutes.
pub(crate) const OAUTH_TOKEN_LIFETIME: Duration = Duration::from_secs(900);

/// Raw kafka properties whose values must never be logged.
const SECRET_MARKERS: [&str; 3] = ["password", "secret", "token"];

/// Process configuration, read once at startup.
#[derive(Clone, PartialEq)]
pub(crate) struct Settings {
    pub(crate) kafka: KafkaConsumerConfig,
    pub(crate) oauth_token_file: Option<PathBuf>,
    pub(crate) oauth_principal: String,
    /// Sign OAUTHBEARER tokens with the default AWS credential chain.
    pub(crate) aws_msk_iam: bool,
    pub(crate) dynamodb: DynamoSinkConfig,
    pub(crate) poll_timeout: Duration,
    pub(crate) batch_size: usize,
    pub(crate) metrics_port: u16,
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let raw_config: HashMap<&str, &str> = self
            .kafka
            .kafka_raw_config
            .iter()
            .map(|(k, v)| {
                let lower = k.to_lowercase();
                if SECRET_MARKERS.iter().any(|m| lower.contains(m)) {
                    (k.as_str(), "******")
                } else {
                    (k.as_str(), v.as_str())
                }
            })
            .collect();

        f.debug_struct("Settings")
            .field("brokers", &self.kafka.brokers)
            .field("topic", &self.kafka.topic)
            .field("consumer_group", &self.kafka.consumer_group)
            .field("sasl", &self.kafka.auth)
            .field("tls", &self.kafka.tls)
            .field("kafka_raw_config", &raw_config)
            .field("oauth_token_file", &self.oauth_token_file)
            .field("aws_msk_iam", &self.aws_msk_iam)
            .field("dynamodb", &self.dynamodb)
            .field("poll_timeout", &self.poll_timeout)
            .field("batch_size", &self.batch_size)
            .field("metrics_port", &self.metrics_port)
            .finish()
    }
}

impl Settings {
    pub(crate) fn load(
        env_vars: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Result<Self> {
        let env_vars: HashMap<String, String> = env_vars
            .into_iter()
            .map(|(key, val)| (key.into(), val.into()))
            .collect();
        Settings::try_from(env_vars)
    }
}

impl TryFrom<HashMap<String, String>> for Settings {
    type Error = Error;

    fn try_from(env_vars: HashMap<String, String>) -> Result<Self> {
        // empty values are treated as unset
        let get_opt = |var: &str| -> Option<String> {
            env_vars
                .get(var)
                .map(|val| val.trim().to_string())
                .filter(|val| !val.is_empty())
        };
        let get_var = |var: &str| -> Result<String> {
            get_opt(var)
                .ok_or_else(|| Error::Config(format!("Environment variable {var} is not set")))
        };

        let brokers: Vec<String> = get_var(ENV_MSK_BROKER)?
            .split(',')
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty())
            .collect();
        if brokers.is_empty() {
            return Err(Error::Config(format!(
                "Environment variable {ENV_MSK_BROKER} has no broker address"
            )));
        }
        let topic = get_var(ENV_MSK_TOPIC)?;
        let table_name = get_var(ENV_DYNAMODB_TABLE)?;
        let region = get_var(ENV_AWS_REGION)?;

        let poll_timeout_ms = parse_or(
            ENV_POLL_TIMEOUT_MS,
            get_opt(ENV_POLL_TIMEOUT_MS),
            DEFAULT_POLL_TIMEOUT_MS,
        )?;
        if poll_timeout_ms == 0 {
            return Err(Error::Config(format!("{ENV_POLL_TIMEOUT_MS} must be positive")));
        }
        let batch_size = parse_or(
            ENV_POLL_BATCH_SIZE,
            get_opt(ENV_POLL_BATCH_SIZE),
            DEFAULT_POLL_BATCH_SIZE,
        )?;
        if batch_size == 0 {
            return Err(Error::Config(format!("{ENV_POLL_BATCH_SIZE} must be positive")));
        }
        let metrics_port = parse_or(
            ENV_METRICS_PORT,
            get_opt(ENV_METRICS_PORT),
            DEFAULT_METRICS_PORT,
        )?;

        let sasl = [
            get_opt(ENV_KAFKA_SASL_MECHANISM),
            get_opt(ENV_KAFKA_SASL_USERNAME),
            get_opt(ENV_KAFKA_SASL_PASSWORD),
        ];
        let auth = match sasl {
            [Some(mechanism), Some(username), Some(password)] => Some(KafkaSaslAuth {
                mechanism: mechanism.to_uppercase(),
                username,
                password,
            }),
            [None, None, None] => None,
            _ => {
                return Err(Error::Config(format!(
                    "{ENV_KAFKA_SASL_MECHANISM}, {ENV_KAFKA_SASL_USERNAME} and {ENV_KAFKA_SASL_PASSWORD} must be set together"
                )));
            }
        };

        let oauth_token_file = get_opt(ENV_KAFKA_OAUTH_TOKEN_FILE).map(PathBuf::from);
        if auth.is_some() && oauth_token_file.is_some() {
            return Err(Error::Config(format!(
                "SASL credentials and {ENV_KAFKA_OAUTH_TOKEN_FILE} are mutually exclusive"
            )));
        }

        let aws_msk_iam = match get_opt(ENV_KAFKA_AUTH).map(|v| v.to_lowercase()).as_deref() {
            None => false,
            Some(KAFKA_AUTH_AWS_MSK_IAM) => true,
            Some(other) => {
                return Err(Error::Config(format!(
                    "Invalid value {other:?} for {ENV_KAFKA_AUTH}, expected {KAFKA_AUTH_AWS_MSK_IAM}"
                )));
            }
        };
        if aws_msk_iam && (auth.is_some() || oauth_token_file.is_some()) {
            return Err(Error::Config(format!(
                "{ENV_KAFKA_AUTH}={KAFKA_AUTH_AWS_MSK_IAM} is mutually exclusive with SASL credentials and {ENV_KAFKA_OAUTH_TOKEN_FILE}"
            )));
        }

        let insecure_skip_verify = parse_bool(
            ENV_KAFKA_TLS_INSECURE_SKIP_VERIFY,
            get_opt(ENV_KAFKA_TLS_INSECURE_SKIP_VERIFY),
        )?;
        let ca_cert = get_opt(ENV_KAFKA_TLS_CA_CERT);
        let tls_enabled = parse_bool(ENV_KAFKA_TLS_ENABLED, get_opt(ENV_KAFKA_TLS_ENABLED))?;
        // MSK only serves IAM authentication on its TLS listener
        let tls_required = tls_enabled || aws_msk_iam || insecure_skip_verify || ca_cert.is_some();
        let tls = tls_required.then(|| TlsConfig {
            insecure_skip_verify,
            ca_cert,
        });

        let kafka_raw_config: HashMap<String, String> = env_vars
            .iter()
            .filter_map(|(key, val)| {
                key.strip_prefix(ENV_KAFKA_CONFIG_PREFIX)
                    .filter(|k| !k.is_empty())
                    .map(|k| (k.replace('_', ".").to_lowercase(), val.clone()))
            })
            .collect();

        Ok(Settings {
            kafka: KafkaConsumerConfig {
                brokers,
                topic,
                consumer_group: get_opt(ENV_CONSUMER_GROUP)
                    .unwrap_or_else(|| DEFAULT_CONSUMER_GROUP.to_string()),
                auth,
                tls,
                kafka_raw_config,
            },
            oauth_token_file,
            oauth_principal: get_opt(ENV_KAFKA_OAUTH_PRINCIPAL)
                .unwrap_or_else(|| DEFAULT_OAUTH_PRINCIPAL.to_string()),
            aws_msk_iam,
            dynamodb: DynamoSinkConfig {
                region,
                table_name,
                endpoint_url: get_opt(ENV_DYNAMODB_ENDPOINT_URL),
            },
            poll_timeout: Duration::from_millis(poll_timeout_ms),
            batch_size,
            metrics_port,
        })
    }
}

fn parse_or<T: std::str::FromStr>(var: &str, value: Option<String>, default: T) -> Result<T>
where
    T::Err: fmt::Display,
{
    match value {
        Some(value) => value
            .parse::<T>()
            .map_err(|e| Error::Config(format!("Invalid value {value:?} for {var} - {e}"))),
        None => Ok(default),
    }
}

fn parse_bool(var: &str, value: Option<String>) -> Result<bool> {
    match value.as_deref().map(str::to_lowercase).as_deref() {
        None | Some("false") => Ok(false),
        Some("true") => Ok(true),
        Some(other) => Err(Error::Config(format!(
            "Invalid value {other:?} for {var}, expected true or false"
        ))),
    }
}
