//! Ticket registry backed by the distributed key-value store.
//!
//! # Layout
//!
//! - `_tickets:tgt:<id>`: JSON blob of a ticket-granting or proxy-granting ticket
//! - `_tickets:st:<id>`: JSON blob of a service ticket
//! - `_tickets:expiry:<bucket>:<id>`: expiry index entry, bucket = expiration / width
//! - `_tickets:expiry:marked:<id>`: index entry of an explicitly expired ticket
//! - `_tickets:cleaner:last_run`: last fully processed expiry bucket
//!
//! The table is chosen from the id prefix alone, so lookups never read a
//! type tag. Blobs are serialized with ordered maps only, which makes the
//! serialized form a usable compare-and-swap witness.
//!
//! # Expiry scan
//!
//! Buckets strictly older than the current one are processed in order. Each
//! index entry is claimed by deleting it; only the caller whose delete
//! removed the entry loads the ticket, so concurrent cleaners on other nodes
//! do not both report the same ticket. The last-run marker advances with a
//! compare-and-swap after every bucket, so a crash loses at most the bucket
//! in progress.
//!
//! A claimed entry whose ticket cannot be examined is written back and its
//! bucket is left unfinished, so the next scan sees it again. A failure after
//! candidates were collected ends the scan early and still returns them.
//! Explicitly expired tickets are indexed outside the buckets and drained on
//! every scan, since their natural bucket may already be behind the marker.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{ExpiryIndex, TicketRegistry, check_routing};
use crate::api::{
    BatchCondition, BatchOperation, DeleteRequest, KeyValueEntry, KeyValueStore, KeyValueStoreError, ReadRequest,
    ScanRequest, WriteRequest,
};
use crate::constants::{
    BUCKET_KEY_WIDTH, DEFAULT_BUCKET_WIDTH_MS, DEFAULT_MAX_TGTS_TO_LOAD, EXPIRED_QUEUE_PREFIX, EXPIRY_INDEX_PREFIX, LAST_RUN_KEY,
    MAX_SCAN_PAGE, MAX_SCAN_PAGES, MAX_UPDATE_RETRIES, ST_TABLE_PREFIX, TGT_TABLE_PREFIX,
};
use crate::ticket::{ServiceTicket, Ticket, TicketError, TicketGrantingTicket, TicketKind};

/// Tuning for the key-value registry and its expiry index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValueRegistryConfig {
    /// Width of one expiry bucket.
    pub bucket_width_ms: u64,
    /// Stop claiming candidates once this many were collected in one scan.
    pub max_tgts_to_load: u32,
    /// Longest possible ticket lifetime; bounds how far back a first scan looks.
    pub max_ticket_duration_ms: u64,
}

impl Default for KeyValueRegistryConfig {
    fn default() -> Self {
        Self {
            bucket_width_ms: DEFAULT_BUCKET_WIDTH_MS,
            max_tgts_to_load: DEFAULT_MAX_TGTS_TO_LOAD,
            max_ticket_duration_ms: 8 * 60 * 60 * 1000,
        }
    }
}

/// [`TicketRegistry`] and [`ExpiryIndex`] over any [`KeyValueStore`].
pub struct KeyValueTicketRegistry<S: KeyValueStore + ?Sized> {
    kv: Arc<S>,
    config: KeyValueRegistryConfig,
}

enum BucketDrain {
    Complete,
    LimitReached,
    /// Some entries were written back for a later scan.
    Deferred,
}

impl<S: KeyValueStore + ?Sized> KeyValueTicketRegistry<S> {
    pub fn new(kv: Arc<S>, config: KeyValueRegistryConfig) -> Self {
        Self {
            kv,
            config: KeyValueRegistryConfig {
                bucket_width_ms: config.bucket_width_ms.max(1),
                ..config
            },
        }
    }

    pub fn config(&self) -> &KeyValueRegistryConfig {
        &self.config
    }

    /// Expiry bucket containing `time_ms`.
    pub fn bucket_for(&self, time_ms: u64) -> u64 {
        time_ms / self.config.bucket_width_ms
    }

    /// Last fully processed expiry bucket, if a scan has run.
    pub async fn last_run_bucket(&self) -> Result<Option<u64>, TicketError> {
        Ok(self.read_last_run().await?.and_then(|raw| raw.parse().ok()))
    }

    /// Set the last-run marker. Intended for operators resetting a scan.
    pub async fn set_last_run_bucket(&self, bucket: u64) -> Result<(), TicketError> {
        self.kv.write(WriteRequest::set(LAST_RUN_KEY, bucket.to_string())).await?;
        Ok(())
    }

    fn table_prefix(kind: TicketKind) -> &'static str {
        if kind.is_granting() {
            TGT_TABLE_PREFIX
        } else {
            ST_TABLE_PREFIX
        }
    }

    fn ticket_key(ticket_id: &str) -> Option<String> {
        TicketKind::from_id(ticket_id).map(|kind| format!("{}{}", Self::table_prefix(kind), ticket_id))
    }

    fn bucket_prefix(bucket: u64) -> String {
        format!("{EXPIRY_INDEX_PREFIX}{bucket:0width$}:", width = BUCKET_KEY_WIDTH)
    }

    fn expiry_entry_key(bucket: u64, ticket_id: &str) -> String {
        format!("{}{}", Self::bucket_prefix(bucket), ticket_id)
    }

    fn marked_entry_key(ticket_id: &str) -> String {
        format!("{EXPIRED_QUEUE_PREFIX}{ticket_id}")
    }

    fn encode(ticket: &Ticket) -> Result<String, TicketError> {
        let encoded = match ticket {
            Ticket::Granting(t) => serde_json::to_string(t),
            Ticket::Service(t) => serde_json::to_string(t),
        };
        encoded.map_err(|e| TicketError::Serialization {
            ticket_id: ticket.id().to_string(),
            reason: e.to_string(),
        })
    }

    fn decode(ticket_id: &str, kind: TicketKind, raw: &str) -> Result<Ticket, TicketError> {
        let decoded = if kind.is_granting() {
            serde_json::from_str::<TicketGrantingTicket>(raw).map(Ticket::Granting)
        } else {
            serde_json::from_str::<ServiceTicket>(raw).map(Ticket::Service)
        };
        decoded.map_err(|e| TicketError::Serialization {
            ticket_id: ticket_id.to_string(),
            reason: e.to_string(),
        })
    }

    /// Index write for a granting ticket's current deadline, if it has one.
    /// Explicitly expired tickets go to the marked queue.
    fn expiry_operation(&self, ticket: &Ticket) -> Option<BatchOperation> {
        let Ticket::Granting(tgt) = ticket else {
            return None;
        };
        let key = if tgt.state.expired {
            Self::marked_entry_key(&tgt.id)
        } else {
            let expires_at = tgt.expiration_policy.expiration_time_ms(&tgt.state)?;
            Self::expiry_entry_key(self.bucket_for(expires_at), &tgt.id)
        };
        Some(BatchOperation::Set {
            key,
            value: tgt.id.clone(),
        })
    }

    async fn read_value(&self, key: &str) -> Result<Option<String>, TicketError> {
        match self.kv.read(ReadRequest::new(key)).await {
            Ok(result) => Ok(result.kv.map(|kv| kv.value)),
            Err(KeyValueStoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_last_run(&self) -> Result<Option<String>, TicketError> {
        self.read_value(LAST_RUN_KEY).await
    }

    /// Every entry under `prefix`, following continuation tokens.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<KeyValueEntry>, TicketError> {
        let mut entries = Vec::new();
        let mut continuation_token = None;
        for _ in 0..MAX_SCAN_PAGES {
            let page = self
                .kv
                .scan(ScanRequest {
                    prefix: prefix.to_string(),
                    limit: Some(MAX_SCAN_PAGE),
                    continuation_token: continuation_token.take(),
                })
                .await?;
            entries.extend(page.entries);
            if !page.is_truncated || page.continuation_token.is_none() {
                return Ok(entries);
            }
            continuation_token = page.continuation_token;
        }
        warn!(prefix, pages = MAX_SCAN_PAGES, "scan stopped at page limit, results incomplete");
        Ok(entries)
    }

    /// Claim every entry under `prefix`, collecting expired granting tickets.
    /// `bucket` is the bucket being drained, `None` for the marked queue.
    async fn drain(
        &self,
        prefix: &str,
        bucket: Option<u64>,
        now_ms: u64,
        expired: &mut Vec<TicketGrantingTicket>,
    ) -> Result<BucketDrain, TicketError> {
        let limit = self.config.max_tgts_to_load as usize;
        let mut outcome = BucketDrain::Complete;

        for entry in self.scan_prefix(prefix).await? {
            if expired.len() >= limit {
                return Ok(BucketDrain::LimitReached);
            }
            let Some(ticket_id) = entry.key.strip_prefix(prefix) else {
                continue;
            };

            if !self.kv.delete(DeleteRequest::new(entry.key.clone())).await?.is_deleted {
                debug!(ticket_id, ?bucket, "expiry entry claimed elsewhere");
                continue;
            }

            if let Err(e) = self.examine_candidate(ticket_id, bucket, now_ms, expired).await {
                warn!(ticket_id, ?bucket, error = %e, "failed to examine expiry candidate, restoring entry");
                if let Err(e) = self.kv.write(WriteRequest::set(entry.key.clone(), entry.value.clone())).await {
                    warn!(ticket_id, ?bucket, error = %e, "failed to restore expiry entry");
                }
                outcome = BucketDrain::Deferred;
            }
        }
        Ok(outcome)
    }

    /// Decide a claimed candidate: collect it if expired, otherwise keep it
    /// indexed under its current deadline.
    async fn examine_candidate(
        &self,
        ticket_id: &str,
        bucket: Option<u64>,
        now_ms: u64,
        expired: &mut Vec<TicketGrantingTicket>,
    ) -> Result<(), TicketError> {
        let ticket = match self.find_ticket(ticket_id).await {
            Ok(Some(ticket @ Ticket::Granting(_))) => ticket,
            Ok(_) => return Ok(()),
            // Retrying cannot fix a corrupt row
            Err(e @ TicketError::Serialization { .. }) => {
                warn!(ticket_id, error = %e, "dropping undecodable expiry candidate");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if self.is_expired(&ticket, now_ms).await? {
            if let Ticket::Granting(tgt) = ticket {
                expired.push(tgt);
            }
        } else if let Some(BatchOperation::Set { key, value }) = self.expiry_operation(&ticket) {
            // Deadline moved past this bucket
            if self.bucket_for_key(&key) > bucket {
                self.kv.write(WriteRequest::set(key, value)).await?;
            }
        }
        Ok(())
    }

    fn bucket_for_key(&self, key: &str) -> Option<u64> {
        key.strip_prefix(EXPIRY_INDEX_PREFIX)?.split(':').next()?.parse().ok()
    }

    /// Advance the marker from `observed` to `bucket`. Returns the marker
    /// value now in effect, which may be ahead of `bucket` if another
    /// cleaner got further.
    async fn advance_last_run(&self, observed: Option<String>, bucket: u64) -> Result<u64, TicketError> {
        let mut expected = observed;
        for _ in 0..MAX_UPDATE_RETRIES {
            let request = WriteRequest::compare_and_swap(LAST_RUN_KEY, expected.clone(), bucket.to_string());
            match self.kv.write(request).await {
                Ok(_) => return Ok(bucket),
                Err(KeyValueStoreError::CompareAndSwapFailed { actual, .. }) => {
                    match actual.as_deref().and_then(|raw| raw.parse::<u64>().ok()) {
                        Some(other) if other >= bucket => return Ok(other),
                        _ => expected = actual,
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(TicketError::ConcurrentModification {
            ticket_id: LAST_RUN_KEY.to_string(),
            attempts: MAX_UPDATE_RETRIES,
        })
    }
}

#[async_trait]
impl<S: KeyValueStore + ?Sized> TicketRegistry for KeyValueTicketRegistry<S> {
    async fn add_ticket(&self, ticket: Ticket) -> Result<(), TicketError> {
        let kind = check_routing(&ticket)?;
        let key = format!("{}{}", Self::table_prefix(kind), ticket.id());
        let value = Self::encode(&ticket)?;

        let mut operations = vec![BatchOperation::Set {
            key: key.clone(),
            value,
        }];
        operations.extend(self.expiry_operation(&ticket));

        let result = self
            .kv
            .write(WriteRequest::conditional_batch(vec![BatchCondition::KeyNotExists { key }], operations))
            .await?;
        if result.conditions_met == Some(false) {
            return Err(TicketError::DuplicateTicket {
                ticket_id: ticket.id().to_string(),
            });
        }
        debug!(ticket_id = %ticket.id(), "added ticket");
        Ok(())
    }

    async fn find_ticket(&self, ticket_id: &str) -> Result<Option<Ticket>, TicketError> {
        let Some(kind) = TicketKind::from_id(ticket_id) else {
            return Ok(None);
        };
        let key = format!("{}{}", Self::table_prefix(kind), ticket_id);
        match self.read_value(&key).await? {
            Some(raw) => Self::decode(ticket_id, kind, &raw).map(Some),
            None => Ok(None),
        }
    }

    async fn update_ticket(&self, ticket: Ticket) -> Result<(), TicketError> {
        let kind = check_routing(&ticket)?;
        let key = format!("{}{}", Self::table_prefix(kind), ticket.id());
        let value = Self::encode(&ticket)?;

        let mut operations = vec![BatchOperation::Set {
            key: key.clone(),
            value,
        }];
        operations.extend(self.expiry_operation(&ticket));

        let result = self
            .kv
            .write(WriteRequest::conditional_batch(vec![BatchCondition::KeyExists { key }], operations))
            .await?;
        if result.conditions_met == Some(false) {
            return Err(TicketError::invalid(ticket.id()));
        }
        Ok(())
    }

    async fn compare_and_update(&self, expected: &Ticket, updated: Ticket) -> Result<bool, TicketError> {
        if expected.id() != updated.id() {
            return Err(TicketError::InvalidTicketRequest {
                reason: format!("cannot replace {} with {}", expected.id(), updated.id()),
            });
        }
        let kind = check_routing(&updated)?;
        let key = format!("{}{}", Self::table_prefix(kind), updated.id());

        let mut operations = vec![BatchOperation::Set {
            key: key.clone(),
            value: Self::encode(&updated)?,
        }];
        operations.extend(self.expiry_operation(&updated));

        let result = self
            .kv
            .write(WriteRequest::conditional_batch(
                vec![BatchCondition::ValueEquals {
                    key,
                    expected: Self::encode(expected)?,
                }],
                operations,
            ))
            .await?;
        Ok(result.conditions_met != Some(false))
    }

    async fn delete_single_ticket(&self, ticket_id: &str) -> Result<bool, TicketError> {
        let Some(key) = Self::ticket_key(ticket_id) else {
            return Ok(false);
        };
        Ok(self.kv.delete(DeleteRequest::new(key)).await?.is_deleted)
    }

    async fn get_tickets(&self) -> Result<Vec<Ticket>, TicketError> {
        let mut tickets = Vec::new();
        for prefix in [TGT_TABLE_PREFIX, ST_TABLE_PREFIX] {
            for entry in self.scan_prefix(prefix).await? {
                let Some(ticket_id) = entry.key.strip_prefix(prefix) else {
                    continue;
                };
                let Some(kind) = TicketKind::from_id(ticket_id) else {
                    warn!(key = %entry.key, "skipping ticket row with unrecognized id");
                    continue;
                };
                match Self::decode(ticket_id, kind, &entry.value) {
                    Ok(ticket) => tickets.push(ticket),
                    Err(e) => warn!(ticket_id, error = %e, "skipping undecodable ticket row"),
                }
            }
        }
        Ok(tickets)
    }

    async fn delete_all(&self) -> Result<u64, TicketError> {
        let mut deleted = 0u64;
        for prefix in [TGT_TABLE_PREFIX, ST_TABLE_PREFIX] {
            for entry in self.scan_prefix(prefix).await? {
                if self.kv.delete(DeleteRequest::new(entry.key)).await?.is_deleted {
                    deleted += 1;
                }
            }
        }
        for entry in self.scan_prefix(EXPIRY_INDEX_PREFIX).await? {
            self.kv.delete(DeleteRequest::new(entry.key)).await?;
        }
        info!(deleted, "deleted all tickets");
        Ok(deleted)
    }

    fn expiry_index(&self) -> Option<&dyn ExpiryIndex> {
        Some(self)
    }
}

#[async_trait]
impl<S: KeyValueStore + ?Sized> ExpiryIndex for KeyValueTicketRegistry<S> {
    async fn add_ticket_to_expiry_bucket(
        &self,
        ticket: &TicketGrantingTicket,
        expiration_time_ms: u64,
    ) -> Result<(), TicketError> {
        let key = Self::expiry_entry_key(self.bucket_for(expiration_time_ms), &ticket.id);
        self.kv.write(WriteRequest::set(key, ticket.id.clone())).await?;
        Ok(())
    }

    async fn get_expired_tgts(&self, now_ms: u64) -> Result<Vec<TicketGrantingTicket>, TicketError> {
        let current_bucket = self.bucket_for(now_ms);
        let mut observed = self.read_last_run().await?;
        let mut last_run = match observed.as_deref().map(str::parse::<u64>) {
            Some(Ok(bucket)) => bucket,
            other => {
                if let Some(Err(e)) = other {
                    warn!(error = %e, "unreadable last-run marker, rescanning from oldest possible bucket");
                }
                self.bucket_for(now_ms.saturating_sub(self.config.max_ticket_duration_ms)).saturating_sub(1)
            }
        };

        let limit = self.config.max_tgts_to_load as usize;
        let mut expired = Vec::new();
        if let Err(e) = self.drain(EXPIRED_QUEUE_PREFIX, None, now_ms, &mut expired).await {
            warn!(error = %e, "failed to drain explicitly expired tickets");
        }

        let mut buckets_scanned = 0u64;
        while expired.len() < limit && last_run.saturating_add(1) < current_bucket {
            let bucket = last_run + 1;
            match self.drain(&Self::bucket_prefix(bucket), Some(bucket), now_ms, &mut expired).await {
                Ok(BucketDrain::Complete) => {}
                Ok(BucketDrain::LimitReached | BucketDrain::Deferred) => break,
                Err(e) => {
                    warn!(bucket, error = %e, "expiry scan interrupted");
                    break;
                }
            }
            match self.advance_last_run(observed.take(), bucket).await {
                Ok(effective) => {
                    last_run = effective;
                    observed = Some(last_run.to_string());
                    buckets_scanned += 1;
                }
                Err(e) => {
                    warn!(bucket, error = %e, "failed to advance last-run marker");
                    break;
                }
            }
        }

        if !expired.is_empty() {
            info!(count = expired.len(), buckets_scanned, last_run, "found expired ticket-granting tickets");
        } else {
            debug!(buckets_scanned, last_run, "no expired ticket-granting tickets");
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::api::{
        DeleteResult, DeterministicKeyValueStore, ReadResult, ScanResult, WriteCommand, WriteResult,
    };
    use crate::ticket::{Authentication, ExpirationPolicy, Principal, Service};

    const WIDTH: u64 = 10_000;

    /// Times out the next `remaining` writes that touch a key under `prefix`.
    #[derive(Default)]
    struct FailingWrites {
        inner: DeterministicKeyValueStore,
        prefix: Mutex<String>,
        remaining: AtomicU32,
    }

    impl FailingWrites {
        fn fail_writes(&self, prefix: &str, count: u32) {
            *self.prefix.lock().unwrap() = prefix.to_string();
            self.remaining.store(count, Ordering::SeqCst);
        }

        fn touches_prefix(&self, command: &WriteCommand) -> bool {
            let prefix = self.prefix.lock().unwrap();
            match command {
                WriteCommand::Set { key, .. } | WriteCommand::CompareAndSwap { key, .. } => key.starts_with(&*prefix),
                WriteCommand::ConditionalBatch { operations, .. } => operations.iter().any(|op| match op {
                    BatchOperation::Set { key, .. } | BatchOperation::Delete { key } => key.starts_with(&*prefix),
                }),
            }
        }
    }

    #[async_trait]
    impl KeyValueStore for FailingWrites {
        async fn write(&self, request: WriteRequest) -> Result<WriteResult, KeyValueStoreError> {
            if self.touches_prefix(&request.command)
                && self.remaining.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
            {
                return Err(KeyValueStoreError::Timeout { duration_ms: 5 });
            }
            self.inner.write(request).await
        }

        async fn read(&self, request: ReadRequest) -> Result<ReadResult, KeyValueStoreError> {
            self.inner.read(request).await
        }

        async fn delete(&self, request: DeleteRequest) -> Result<DeleteResult, KeyValueStoreError> {
            self.inner.delete(request).await
        }

        async fn scan(&self, request: ScanRequest) -> Result<ScanResult, KeyValueStoreError> {
            self.inner.scan(request).await
        }
    }

    fn failing_registry() -> (Arc<FailingWrites>, KeyValueTicketRegistry<FailingWrites>) {
        let kv = Arc::new(FailingWrites::default());
        let registry = KeyValueTicketRegistry::new(
            kv.clone(),
            KeyValueRegistryConfig {
                bucket_width_ms: WIDTH,
                max_tgts_to_load: 100,
                max_ticket_duration_ms: 60_000,
            },
        );
        (kv, registry)
    }

    fn registry() -> (Arc<DeterministicKeyValueStore>, KeyValueTicketRegistry<DeterministicKeyValueStore>) {
        let kv = DeterministicKeyValueStore::new();
        let registry = KeyValueTicketRegistry::new(
            kv.clone(),
            KeyValueRegistryConfig {
                bucket_width_ms: WIDTH,
                max_tgts_to_load: 100,
                max_ticket_duration_ms: 60_000,
            },
        );
        (kv, registry)
    }

    fn tgt(id: &str, created_ms: u64, hard_timeout_ms: u64) -> TicketGrantingTicket {
        TicketGrantingTicket::new(
            id,
            Authentication::new(Principal::new("alice"), created_ms),
            ExpirationPolicy::HardTimeout {
                time_to_kill_ms: hard_timeout_ms,
            },
            created_ms,
        )
    }

    #[tokio::test]
    async fn test_routes_by_prefix() {
        let (kv, registry) = registry();
        let mut root = tgt("TGT-1", 0, 1_000);
        let st = root
            .grant_service_ticket("ST-1", Some(Service::new("https://a")), ExpirationPolicy::NeverExpires, true, false, 0)
            .unwrap();
        registry.add_ticket(root.into()).await.unwrap();
        registry.add_ticket(st.into()).await.unwrap();

        assert!(kv.read(ReadRequest::new("_tickets:tgt:TGT-1")).await.is_ok());
        assert!(kv.read(ReadRequest::new("_tickets:st:ST-1")).await.is_ok());
        assert!(registry.find_ticket("ST-1").await.unwrap().unwrap().as_service().is_some());
        assert!(registry.find_ticket("NOPE-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_add_duplicate_fails() {
        let (_kv, registry) = registry();
        registry.add_ticket(tgt("TGT-1", 0, 1_000).into()).await.unwrap();
        let err = registry.add_ticket(tgt("TGT-1", 5, 1_000).into()).await.unwrap_err();
        assert_eq!(err, TicketError::DuplicateTicket { ticket_id: "TGT-1".into() });
        let stored = registry.get_ticket_granting_ticket("TGT-1").await.unwrap();
        assert_eq!(stored.state.creation_time_ms, 0);
    }

    #[tokio::test]
    async fn test_add_indexes_expiration_bucket() {
        let (kv, registry) = registry();
        registry.add_ticket(tgt("TGT-1", 0, 25_000).into()).await.unwrap();
        let key = KeyValueTicketRegistry::<DeterministicKeyValueStore>::expiry_entry_key(2, "TGT-1");
        assert!(kv.read(ReadRequest::new(key)).await.is_ok());
    }

    #[tokio::test]
    async fn test_compare_and_update() {
        let (_kv, registry) = registry();
        let original: Ticket = tgt("TGT-1", 0, 1_000).into();
        registry.add_ticket(original.clone()).await.unwrap();

        let mut changed = original.clone();
        changed.mark_ticket_expired();
        assert!(registry.compare_and_update(&original, changed.clone()).await.unwrap());
        assert!(!registry.compare_and_update(&original, changed).await.unwrap());
    }

    #[tokio::test]
    async fn test_get_tickets_enumerates_both_tables() {
        let (_kv, registry) = registry();
        let mut root = tgt("TGT-1", 0, 1_000);
        let st = root
            .grant_service_ticket("ST-1", Some(Service::new("https://a")), ExpirationPolicy::NeverExpires, true, false, 0)
            .unwrap();
        registry.add_ticket(root.into()).await.unwrap();
        registry.add_ticket(st.into()).await.unwrap();
        assert_eq!(registry.get_tickets().await.unwrap().len(), 2);
        assert_eq!(registry.session_count().await.unwrap(), 1);
        assert_eq!(registry.service_ticket_count().await.unwrap(), 1);
        assert_eq!(registry.delete_all().await.unwrap(), 2);
        assert!(registry.get_tickets().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scan_without_marker_starts_at_max_duration() {
        let (_kv, registry) = registry();
        // Expires at 15s, in bucket 1
        registry.add_ticket(tgt("TGT-1", 5_000, 10_000).into()).await.unwrap();

        let now = 65_000; // bucket 6, first scan starts after bucket 0
        let expired = registry.get_expired_tgts(now).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(registry.last_run_bucket().await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_second_scan_finds_nothing() {
        let (_kv, registry) = registry();
        registry.add_ticket(tgt("TGT-1", 0, 5_000).into()).await.unwrap();
        registry.set_last_run_bucket(0).await.unwrap();
        // Bucket 0 already processed; ticket sits in bucket 0
        assert!(registry.get_expired_tgts(30_000).await.unwrap().is_empty());

        registry.set_last_run_bucket(u64::MAX).await.unwrap();
        assert!(registry.get_expired_tgts(30_000).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_marker_adopts_value_from_faster_cleaner() {
        let (kv, registry) = registry();
        registry.set_last_run_bucket(1).await.unwrap();
        let observed = registry.read_last_run().await.unwrap();
        kv.write(WriteRequest::set(LAST_RUN_KEY, "9")).await.unwrap();

        let effective = registry.advance_last_run(observed, 2).await.unwrap();
        assert_eq!(effective, 9);
        assert_eq!(registry.last_run_bucket().await.unwrap(), Some(9));
    }

    #[tokio::test]
    async fn test_bucket_limit_leaves_marker_in_place() {
        let kv = DeterministicKeyValueStore::new();
        let registry = KeyValueTicketRegistry::new(
            kv,
            KeyValueRegistryConfig {
                bucket_width_ms: WIDTH,
                max_tgts_to_load: 2,
                max_ticket_duration_ms: 60_000,
            },
        );
        for i in 0..3 {
            registry.add_ticket(tgt(&format!("TGT-{i}"), 0, 12_000).into()).await.unwrap();
        }
        registry.set_last_run_bucket(0).await.unwrap();

        let first = registry.get_expired_tgts(40_000).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(registry.last_run_bucket().await.unwrap(), Some(0));

        let second = registry.get_expired_tgts(40_000).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(registry.last_run_bucket().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_marker_failure_still_returns_claimed_candidates() {
        let (kv, registry) = failing_registry();
        // Expires at 15s, in bucket 1
        registry.add_ticket(tgt("TGT-1", 10_000, 5_000).into()).await.unwrap();
        registry.set_last_run_bucket(0).await.unwrap();
        kv.fail_writes(LAST_RUN_KEY, 1);

        let found = registry.get_expired_tgts(30_000).await.unwrap();
        assert_eq!(found.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(), vec!["TGT-1"]);
        assert_eq!(registry.last_run_bucket().await.unwrap(), Some(0));

        // The bucket is rescanned; its entry was already claimed
        assert!(registry.get_expired_tgts(30_000).await.unwrap().is_empty());
        assert_eq!(registry.last_run_bucket().await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_failed_reindex_restores_entry_and_holds_marker() {
        let (kv, registry) = failing_registry();
        let ticket = tgt("TGT-1", 0, 35_000);
        registry.add_ticket(ticket.clone().into()).await.unwrap();
        registry.add_ticket_to_expiry_bucket(&ticket, 15_000).await.unwrap();
        registry.set_last_run_bucket(0).await.unwrap();
        let early_entry = KeyValueTicketRegistry::<FailingWrites>::expiry_entry_key(1, "TGT-1");
        kv.fail_writes(&KeyValueTicketRegistry::<FailingWrites>::bucket_prefix(3), 1);

        assert!(registry.get_expired_tgts(30_000).await.unwrap().is_empty());
        assert_eq!(registry.last_run_bucket().await.unwrap(), Some(0));
        assert!(kv.read(ReadRequest::new(early_entry.clone())).await.is_ok());

        assert!(registry.get_expired_tgts(30_000).await.unwrap().is_empty());
        assert_eq!(registry.last_run_bucket().await.unwrap(), Some(2));
        assert!(kv.read(ReadRequest::new(early_entry)).await.is_err());
        let deadline_entry = KeyValueTicketRegistry::<FailingWrites>::expiry_entry_key(3, "TGT-1");
        assert!(kv.read(ReadRequest::new(deadline_entry)).await.is_ok());
    }

    #[tokio::test]
    async fn test_marked_tickets_are_found_behind_marker() {
        let (kv, registry) = registry();
        registry.add_ticket(tgt("TGT-1", 0, 1_000_000).into()).await.unwrap();
        let pinned = TicketGrantingTicket::new(
            "TGT-2",
            Authentication::new(Principal::new("bob"), 0),
            ExpirationPolicy::NeverExpires,
            0,
        );
        registry.add_ticket(pinned.into()).await.unwrap();
        registry.set_last_run_bucket(50).await.unwrap();

        assert_eq!(registry.mark_ticket_expired("TGT-1").await.unwrap(), 1);
        assert_eq!(registry.mark_ticket_expired("TGT-2").await.unwrap(), 1);
        assert!(kv.read(ReadRequest::new("_tickets:expiry:marked:TGT-2")).await.is_ok());

        let mut found: Vec<_> = registry.get_expired_tgts(520_000).await.unwrap().into_iter().map(|t| t.id).collect();
        found.sort();
        assert_eq!(found, vec!["TGT-1", "TGT-2"]);
        assert!(kv.read(ReadRequest::new("_tickets:expiry:marked:TGT-1")).await.is_err());
        assert!(registry.get_expired_tgts(520_000).await.unwrap().is_empty());
    }
}
