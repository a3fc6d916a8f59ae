//! Key-value store contract used by the distributed ticket registry.
//!
//! The registry only needs a linearizable string store with conditional
//! batches, compare-and-swap and prefix scans. Any backend implementing
//! [`KeyValueStore`] can host tickets; [`DeterministicKeyValueStore`] is the
//! in-memory implementation used by tests and single-node deployments.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod inmemory;
pub use inmemory::DeterministicKeyValueStore;

/// Maximum key size in bytes.
pub const MAX_KEY_SIZE: u32 = 1024;
/// Maximum value size in bytes.
pub const MAX_VALUE_SIZE: u32 = 1024 * 1024;
/// Maximum number of operations or keys in one batch.
pub const MAX_BATCH_SIZE: u32 = 1_000;
/// Scan limit applied when a request does not set one.
pub const DEFAULT_SCAN_LIMIT: u32 = 1_000;
/// Hard cap on entries returned by a single scan.
pub const MAX_SCAN_RESULTS: u32 = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WriteCommand {
    Set {
        key: String,
        value: String,
    },
    /// Write `new_value` only if the current value equals `expected`.
    /// `expected: None` means the key must not exist.
    CompareAndSwap {
        key: String,
        expected: Option<String>,
        new_value: String,
    },
    /// Apply all operations atomically if every condition holds.
    ConditionalBatch {
        conditions: Vec<BatchCondition>,
        operations: Vec<BatchOperation>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum BatchOperation {
    Set { key: String, value: String },
    Delete { key: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum BatchCondition {
    ValueEquals { key: String, expected: String },
    KeyExists { key: String },
    KeyNotExists { key: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WriteRequest {
    pub command: WriteCommand,
}

impl WriteRequest {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            command: WriteCommand::Set {
                key: key.into(),
                value: value.into(),
            },
        }
    }

    pub fn compare_and_swap(key: impl Into<String>, expected: Option<String>, new_value: impl Into<String>) -> Self {
        Self {
            command: WriteCommand::CompareAndSwap {
                key: key.into(),
                expected,
                new_value: new_value.into(),
            },
        }
    }

    pub fn conditional_batch(conditions: Vec<BatchCondition>, operations: Vec<BatchOperation>) -> Self {
        Self {
            command: WriteCommand::ConditionalBatch { conditions, operations },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WriteResult {
    pub command: Option<WriteCommand>,
    /// For conditional batches: whether every condition held.
    pub conditions_met: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyValueEntry {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadRequest {
    pub key: String,
}

impl ReadRequest {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadResult {
    pub kv: Option<KeyValueEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteRequest {
    pub key: String,
}

impl DeleteRequest {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteResult {
    pub key: String,
    /// True if the key existed and this call removed it.
    pub is_deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanRequest {
    pub prefix: String,
    pub limit: Option<u32>,
    /// Opaque token from a previous truncated [`ScanResult`].
    pub continuation_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanResult {
    /// Matching entries in ascending key order.
    pub entries: Vec<KeyValueEntry>,
    pub count: u32,
    pub is_truncated: bool,
    pub continuation_token: Option<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyValueStoreError {
    #[error("key '{key}' not found")]
    NotFound { key: String },
    #[error("operation failed: {reason}")]
    Failed { reason: String },
    #[error("key must not be empty")]
    EmptyKey,
    #[error("key size {size} exceeds maximum of {max} bytes")]
    KeyTooLarge { size: u32, max: u32 },
    #[error("value size {size} exceeds maximum of {max} bytes")]
    ValueTooLarge { size: u32, max: u32 },
    #[error("batch size {size} exceeds maximum of {max} operations")]
    BatchTooLarge { size: u32, max: u32 },
    #[error("operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
    #[error("compare-and-swap failed for key '{key}': expected {expected:?}, found {actual:?}")]
    CompareAndSwapFailed {
        key: String,
        expected: Option<String>,
        actual: Option<String>,
    },
}

/// Check key, value and batch bounds before a command reaches storage.
pub fn validate_write_command(command: &WriteCommand) -> Result<(), KeyValueStoreError> {
    let check_key = |key: &str| {
        if key.is_empty() {
            return Err(KeyValueStoreError::EmptyKey);
        }
        let len = key.len();
        if len > MAX_KEY_SIZE as usize {
            Err(KeyValueStoreError::KeyTooLarge {
                size: len as u32,
                max: MAX_KEY_SIZE,
            })
        } else {
            Ok(())
        }
    };

    let check_value = |value: &str| {
        let len = value.len();
        if len > MAX_VALUE_SIZE as usize {
            Err(KeyValueStoreError::ValueTooLarge {
                size: len as u32,
                max: MAX_VALUE_SIZE,
            })
        } else {
            Ok(())
        }
    };

    let check_batch = |size: usize| {
        if size > MAX_BATCH_SIZE as usize {
            Err(KeyValueStoreError::BatchTooLarge {
                size: size as u32,
                max: MAX_BATCH_SIZE,
            })
        } else {
            Ok(())
        }
    };

    match command {
        WriteCommand::Set { key, value } => {
            check_key(key)?;
            check_value(value)?;
        }
        WriteCommand::CompareAndSwap { key, new_value, .. } => {
            check_key(key)?;
            check_value(new_value)?;
        }
        WriteCommand::ConditionalBatch { conditions, operations } => {
            check_batch(conditions.len())?;
            check_batch(operations.len())?;
            for condition in conditions {
                match condition {
                    BatchCondition::ValueEquals { key, .. }
                    | BatchCondition::KeyExists { key }
                    | BatchCondition::KeyNotExists { key } => check_key(key)?,
                }
            }
            for op in operations {
                match op {
                    BatchOperation::Set { key, value } => {
                        check_key(key)?;
                        check_value(value)?;
                    }
                    BatchOperation::Delete { key } => check_key(key)?,
                }
            }
        }
    }
    Ok(())
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn write(&self, request: WriteRequest) -> Result<WriteResult, KeyValueStoreError>;

    /// Read a key. Returns [`KeyValueStoreError::NotFound`] for a missing key.
    async fn read(&self, request: ReadRequest) -> Result<ReadResult, KeyValueStoreError>;

    /// Delete a key from the store.
    ///
    /// Returns Ok with is_deleted=true if the key was found and removed,
    /// or Ok with is_deleted=false if the key was not found (idempotent).
    async fn delete(&self, request: DeleteRequest) -> Result<DeleteResult, KeyValueStoreError>;

    /// Scan keys by prefix in ascending key order with pagination.
    async fn scan(&self, request: ScanRequest) -> Result<ScanResult, KeyValueStoreError>;
}

// Blanket implementation for Arc<T> where T: KeyValueStore
#[async_trait]
impl<T: KeyValueStore + ?Sized> KeyValueStore for std::sync::Arc<T> {
    async fn write(&self, request: WriteRequest) -> Result<WriteResult, KeyValueStoreError> {
        (**self).write(request).await
    }

    async fn read(&self, request: ReadRequest) -> Result<ReadResult, KeyValueStoreError> {
        (**self).read(request).await
    }

    async fn delete(&self, request: DeleteRequest) -> Result<DeleteResult, KeyValueStoreError> {
        (**self).delete(request).await
    }

    async fn scan(&self, request: ScanRequest) -> Result<ScanResult, KeyValueStoreError> {
        (**self).scan(request).await
    }
}
