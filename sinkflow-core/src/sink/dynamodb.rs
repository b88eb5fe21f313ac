use sinkflow_dynamodb::{DynamoSink, DynamoSinkBuilder, DynamoSinkConfig};

use crate::error::Error;
use crate::sink::{Item, Store, WriteError};

impl From<sinkflow_dynamodb::Error> for WriteError {
    fn from(value: sinkflow_dynamodb::Error) -> Self {
        if value.is_retryable() {
            WriteError::Transient(value.to_string())
        } else {
            WriteError::NonRetryable(value.to_string())
        }
    }
}

impl From<sinkflow_dynamodb::Error> for Error {
    fn from(value: sinkflow_dynamodb::Error) -> Self {
        match value {
            sinkflow_dynamodb::Error::InvalidConfig(e) => Error::Config(e),
            other => Error::Store(other.to_string()),
        }
    }
}

pub(crate) async fn new_dynamodb_sink(config: DynamoSinkConfig) -> crate::Result<DynamoSink> {
    Ok(DynamoSinkBuilder::new(config).build().await?)
}

impl Store for DynamoSink {
    async fn upsert(&self, item: Item) -> Result<(), WriteError> {
        Ok(self.put_item(item.into_iter().collect()).await?)
    }
}
