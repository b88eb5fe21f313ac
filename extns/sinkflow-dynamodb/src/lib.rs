//! DynamoDB upsert client used by the sinkflow forwarder.
//!
//! Every failure returned by the store is classified as either retryable (the write may succeed
//! if attempted again later) or not. The classification is total: there is no error that is
//! left unclassified.
use std::fmt::Debug;

use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};

pub mod sink;

pub use sink::{DynamoSink, DynamoSinkBuilder, DynamoSinkConfig};

/// Error codes for which a later attempt of the same write may succeed.
const RETRYABLE_CODES: &[&str] = &[
    "ProvisionedThroughputExceededException",
    "ThrottlingException",
    "RequestLimitExceeded",
    "InternalServerError",
    "ServiceUnavailable",
    "TransactionConflict",
    "TransactionConflictException",
    "ReplicatedWriteConflictException",
];

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Failed with DynamoDB error {code} - {message}")]
    DynamoDb {
        code: String,
        message: String,
        retryable: bool,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the failed operation may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::DynamoDb {
                retryable: true,
                ..
            }
        )
    }
}

pub type Result<T> = core::result::Result<T, Error>;

/// Maps an SDK error onto [Error::DynamoDb], deciding whether it is retryable.
pub(crate) fn classify_sdk_error<E, R>(err: &SdkError<E, R>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: Debug,
{
    let message = DisplayErrorContext(err).to_string();
    let (code, retryable) = match err {
        // the request could not even be built, sending it again will not help.
        SdkError::ConstructionFailure(_) => ("ConstructionFailure".to_string(), false),
        SdkError::TimeoutError(_) => ("TimeoutError".to_string(), true),
        SdkError::DispatchFailure(_) => ("DispatchFailure".to_string(), true),
        SdkError::ResponseError(_) => ("ResponseError".to_string(), true),
        SdkError::ServiceError(ctx) => match ctx.err().code() {
            Some(code) => (code.to_string(), RETRYABLE_CODES.contains(&code)),
            None => ("Unknown".to_string(), false),
        },
        _ => ("Unknown".to_string(), true),
    };
    Error::DynamoDb {
        code,
        message,
        retryable,
    }
}
