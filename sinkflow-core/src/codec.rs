//! Decodes raw payloads into [UserRecord]s.
use serde::Deserialize;

use crate::sink::Item;

/// Attribute holding the natural key, also the table's partition key.
pub(crate) const KEY_ATTRIBUTE: &str = "email";
const NAME_ATTRIBUTE: &str = "name";

#[derive(thiserror::Error, Debug)]
pub(crate) enum DecodeError {
    #[error("malformed JSON payload - {0}")]
    Json(#[from] serde_json::Error),

    #[error("record has no {KEY_ATTRIBUTE}")]
    MissingKey,
}

/// The user entity carried by each record.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct UserRecord {
    #[serde(rename = "email", alias = "Email", default)]
    pub(crate) email: String,
    #[serde(rename = "name", alias = "Name", default)]
    pub(crate) name: String,
}

impl UserRecord {
    pub(crate) fn to_item(&self) -> Item {
        Item::from([
            (KEY_ATTRIBUTE.to_string(), self.email.clone()),
            (NAME_ATTRIBUTE.to_string(), self.name.clone()),
        ])
    }
}

pub(crate) fn decode(payload: &[u8]) -> Result<UserRecord, DecodeError> {
    let record: UserRecord = serde_json::from_slice(payload)?;
    if record.email.trim().is_empty() {
        return Err(DecodeError::MissingKey);
    }
    Ok(record)
}
