//! Idempotent upserts into a DynamoDB table.
//!
//! `PutItem` replaces the whole item stored under the same primary key, so delivering the same
//! item more than once leaves the table in the same state as delivering it once.
use std::collections::HashMap;

use aws_config::retry::RetryConfig;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::types::AttributeValue;
use tracing::{debug, info};

use crate::{Error, Result, classify_sdk_error};

/// Configuration for the DynamoDB sink.
#[derive(Clone, Debug, PartialEq)]
pub struct DynamoSinkConfig {
    /// AWS region where the table is located
    pub region: String,
    /// Name of the table
    pub table_name: String,
    /// Overrides the service endpoint, used against local DynamoDB
    pub endpoint_url: Option<String>,
}

impl DynamoSinkConfig {
    fn validate(&self) -> Result<()> {
        if self.region.is_empty() {
            return Err(Error::InvalidConfig("region is required".to_string()));
        }
        if self.table_name.is_empty() {
            return Err(Error::InvalidConfig("table name is required".to_string()));
        }
        match &self.endpoint_url {
            Some(url) if !url.starts_with("http://") && !url.starts_with("https://") => {
                Err(Error::InvalidConfig(format!(
                    "endpoint url must be an http(s) url, got {url}"
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Creates and configures a DynamoDB client based on the provided configuration.
pub async fn create_dynamodb_client(config: &DynamoSinkConfig) -> Result<Client> {
    config.validate()?;

    info!(region = %config.region, "Creating DynamoDB client in region");

    // a failed write is retried by the next poll cycle, not inside the client
    let mut config_builder = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(config.region.clone()))
        .retry_config(RetryConfig::disabled());

    if let Some(endpoint_url) = &config.endpoint_url {
        config_builder = config_builder.endpoint_url(endpoint_url);
    }

    let shared_config = config_builder.load().await;
    Ok(Client::new(&shared_config))
}

/// Writes items into one table.
#[derive(Clone, Debug)]
pub struct DynamoSink {
    client: Client,
    table_name: String,
}

/// Builder for creating and configuring a DynamoDB sink.
#[derive(Clone, Debug)]
pub struct DynamoSinkBuilder {
    config: DynamoSinkConfig,
    client: Option<Client>,
}

impl DynamoSinkBuilder {
    pub fn new(config: DynamoSinkConfig) -> Self {
        Self {
            config,
            client: None,
        }
    }

    /// Uses the given client instead of creating one from the configuration.
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub async fn build(self) -> Result<DynamoSink> {
        let client = match self.client {
            Some(client) => {
                self.config.validate()?;
                client
            }
            None => create_dynamodb_client(&self.config).await?,
        };

        Ok(DynamoSink {
            client,
            table_name: self.config.table_name,
        })
    }
}

impl DynamoSink {
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Upserts one item made of string attributes.
    pub async fn put_item(&self, attributes: Vec<(String, String)>) -> Result<()> {
        let item: HashMap<String, AttributeValue> = attributes
            .into_iter()
            .map(|(name, value)| (name, AttributeValue::S(value)))
            .collect();

        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(item))
            .send()
            .await
            .map_err(|e| classify_sdk_error(&e))?;

        debug!(table = %self.table_name, "Item upserted");
        Ok(())
    }
}
