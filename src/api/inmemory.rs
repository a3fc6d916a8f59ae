//! In-memory implementation of KeyValueStore for testing.
//!
//! Provides a deterministic, non-persistent store that mirrors the
//! linearizable behavior of a replicated backend without network or disk I/O.
//! Every write command is applied under a single lock, so conditional batches
//! and compare-and-swap are atomic.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use tokio::sync::Mutex;

use super::{
    BatchCondition, BatchOperation, DEFAULT_SCAN_LIMIT, DeleteRequest, DeleteResult, KeyValueEntry, KeyValueStore,
    KeyValueStoreError, MAX_SCAN_RESULTS, ReadRequest, ReadResult, ScanRequest, ScanResult, WriteCommand,
    WriteRequest, WriteResult, validate_write_command,
};

/// In-memory deterministic implementation of [`KeyValueStore`] for testing.
///
/// - Single-node only (no replication)
///
/// # Example
///
/// ```ignore
/// use aspen_tickets::api::{KeyValueStore, DeterministicKeyValueStore, WriteRequest};
///
/// let store = DeterministicKeyValueStore::new();
/// store.write(WriteRequest::set("test", "value")).await?;
/// ```
#[derive(Clone, Default)]
pub struct DeterministicKeyValueStore {
    inner: Arc<Mutex<BTreeMap<String, String>>>,
}

impl DeterministicKeyValueStore {
    /// Create a new, empty in-memory key-value store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of keys currently stored.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

fn apply_operations(inner: &mut BTreeMap<String, String>, operations: &[BatchOperation]) {
    for op in operations {
        match op {
            BatchOperation::Set { key, value } => {
                inner.insert(key.clone(), value.clone());
            }
            BatchOperation::Delete { key } => {
                inner.remove(key);
            }
        }
    }
}

#[async_trait]
impl KeyValueStore for DeterministicKeyValueStore {
    async fn write(&self, request: WriteRequest) -> Result<WriteResult, KeyValueStoreError> {
        validate_write_command(&request.command)?;

        let mut inner = self.inner.lock().await;
        match request.command {
            WriteCommand::Set { key, value } => {
                inner.insert(key.clone(), value.clone());
                Ok(WriteResult {
                    command: Some(WriteCommand::Set { key, value }),
                    ..Default::default()
                })
            }
            WriteCommand::CompareAndSwap {
                key,
                expected,
                new_value,
            } => {
                let current = inner.get(&key).cloned();
                if current == expected {
                    inner.insert(key.clone(), new_value.clone());
                    Ok(WriteResult {
                        command: Some(WriteCommand::CompareAndSwap {
                            key,
                            expected,
                            new_value,
                        }),
                        ..Default::default()
                    })
                } else {
                    Err(KeyValueStoreError::CompareAndSwapFailed {
                        key,
                        expected,
                        actual: current,
                    })
                }
            }
            WriteCommand::ConditionalBatch {
                ref conditions,
                ref operations,
            } => {
                let conditions_met = conditions.iter().all(|cond| match cond {
                    BatchCondition::ValueEquals { key, expected } => inner.get(key) == Some(expected),
                    BatchCondition::KeyExists { key } => inner.contains_key(key),
                    BatchCondition::KeyNotExists { key } => !inner.contains_key(key),
                });
                if conditions_met {
                    apply_operations(&mut inner, operations);
                }
                Ok(WriteResult {
                    command: None,
                    conditions_met: Some(conditions_met),
                })
            }
        }
    }

    async fn read(&self, request: ReadRequest) -> Result<ReadResult, KeyValueStoreError> {
        let guard = self.inner.lock().await;
        match guard.get(&request.key) {
            Some(value) => Ok(ReadResult {
                kv: Some(KeyValueEntry {
                    key: request.key,
                    value: value.clone(),
                }),
            }),
            None => Err(KeyValueStoreError::NotFound { key: request.key }),
        }
    }

    async fn delete(&self, request: DeleteRequest) -> Result<DeleteResult, KeyValueStoreError> {
        let mut inner = self.inner.lock().await;
        let is_deleted = inner.remove(&request.key).is_some();
        Ok(DeleteResult {
            key: request.key,
            is_deleted,
        })
    }

    async fn scan(&self, request: ScanRequest) -> Result<ScanResult, KeyValueStoreError> {
        let inner = self.inner.lock().await;

        // Apply Tiger Style bounded limit
        let limit = request.limit.unwrap_or(DEFAULT_SCAN_LIMIT).min(MAX_SCAN_RESULTS) as usize;

        // Decode continuation token (format: base64(last_key))
        let start_after = request.continuation_token.as_ref().and_then(|token| {
            base64::engine::general_purpose::STANDARD
                .decode(token)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        });

        // BTreeMap iteration is already in key order
        let mut matching = inner
            .range(request.prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&request.prefix))
            .filter(|(k, _)| match &start_after {
                Some(after) => k.as_str() > after.as_str(),
                None => true,
            });

        let entries: Vec<KeyValueEntry> = matching
            .by_ref()
            .take(limit)
            .map(|(key, value)| KeyValueEntry {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();
        let is_truncated = matching.next().is_some();

        // Generate continuation token if truncated
        let continuation_token = if is_truncated {
            entries.last().map(|e| base64::engine::general_purpose::STANDARD.encode(&e.key))
        } else {
            None
        };

        let count = entries.len() as u32;

        Ok(ScanResult {
            entries,
            count,
            is_truncated,
            continuation_token,
        })
    }
}
