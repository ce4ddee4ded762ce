//! Data types for rediskv operations.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A key-value entry returned by iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValueEntry {
    /// The user key.
    pub key: Bytes,
    /// The value.
    pub value: Bytes,
}

impl KeyValueEntry {
    pub fn new(key: Bytes, value: Bytes) -> Self {
        Self { key, value }
    }
}

/// One operation of an atomic batch.
///
/// Batches are often decoded from external descriptions
/// (`{"type": "put", "key": "a", "value": "1"}`); any `type` other than
/// `put` or `del` decodes to [`BatchOp::Unsupported`], which makes
/// [`KeyValueDb::batch`](crate::KeyValueDb::batch) reject the whole batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BatchOp {
    /// Writes `key`. A missing value is stored as an empty value.
    Put {
        key: Bytes,
        #[serde(default)]
        value: Option<Bytes>,
    },
    /// Removes `key`.
    #[serde(rename = "del")]
    Delete { key: Bytes },
    #[serde(other)]
    Unsupported,
}

impl BatchOp {
    pub fn put(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        BatchOp::Put {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn delete(key: impl Into<Bytes>) -> Self {
        BatchOp::Delete { key: key.into() }
    }
}

/// Lifecycle state of a [`KeyValueDb`](crate::KeyValueDb).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    Open,
    Closed,
}
