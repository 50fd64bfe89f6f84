//! In-memory store for tests and local development

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use super::{matches_filter, EntityStore, StoreError};
use crate::dlq::{DeadLetter, DeadLetterSink};
use crate::idempotency::{ClaimOutcome, IdempotencyGuard};
use crate::outbox::{Mutation, OutboxRecord, OutboxStatus, OutboxStore};

#[derive(Debug, Default)]
struct State {
    collections: HashMap<String, Vec<Value>>,
    outbox: HashMap<Uuid, OutboxRecord>,
    processed: HashMap<(String, Uuid), Processed>,
    dead_letters: Vec<DeadLetter>,
}

#[derive(Debug, Clone, Copy)]
enum Processed {
    Claimed { until: DateTime<Utc> },
    Done { at: DateTime<Utc> },
}

impl State {
    fn upsert(&mut self, collection: &str, filter: &Value, document: Value) {
        let documents = self.collections.entry(collection.to_string()).or_default();
        match documents.iter_mut().find(|doc| matches_filter(doc, filter)) {
            Some(existing) => *existing = document,
            None => documents.push(document),
        }
    }
}

/// Every store trait over a single lock
///
/// One lock makes each call atomic, which is all `commit`, `claim` and
/// `mark_processed` need. Clones share the same state, so a test can keep
/// a handle for inspection while services own theirs.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    dead_letters_available: Arc<AtomicBool>,
    processed_available: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            dead_letters_available: Arc::new(AtomicBool::new(true)),
            processed_available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Make dead-letter writes fail while `false`
    pub fn set_dead_letters_available(&self, available: bool) {
        self.dead_letters_available.store(available, Ordering::SeqCst);
    }

    /// Make `mark_processed` fail while `false`
    pub fn set_processed_available(&self, available: bool) {
        self.processed_available.store(available, Ordering::SeqCst);
    }

    pub fn documents(&self, collection: &str) -> Vec<Value> {
        self.lock()
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock().dead_letters.clone()
    }

    pub fn outbox_records(&self) -> Vec<OutboxRecord> {
        let mut records: Vec<_> = self.lock().outbox.values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    pub fn processed_count(&self, consumer_id: &str) -> usize {
        self.lock()
            .processed
            .iter()
            .filter(|((consumer, _), entry)| {
                consumer == consumer_id && matches!(entry, Processed::Done { .. })
            })
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn upsert(&self, collection: &str, filter: &Value, document: Value) -> Result<(), StoreError> {
        self.lock().upsert(collection, filter, document);
        Ok(())
    }

    async fn find_one(&self, collection: &str, filter: &Value) -> Result<Option<Value>, StoreError> {
        Ok(self
            .lock()
            .collections
            .get(collection)
            .and_then(|docs| docs.iter().find(|doc| matches_filter(doc, filter)))
            .cloned())
    }
}

#[async_trait]
impl OutboxStore for MemoryStore {
    async fn commit(&self, mutation: Mutation, record: OutboxRecord) -> Result<bool, StoreError> {
        let mut state = self.lock();

        for write in mutation.into_writes() {
            state.upsert(&write.collection, &write.filter, write.document);
        }

        if state.outbox.contains_key(&record.event_id) {
            return Ok(false);
        }
        state.outbox.insert(record.event_id, record);
        Ok(true)
    }

    async fn claim_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxRecord>, StoreError> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut state = self.lock();
        let mut claimable: Vec<&mut OutboxRecord> = state
            .outbox
            .values_mut()
            .filter(|r| r.status == OutboxStatus::Pending)
            .filter(|r| r.created_at <= created_before)
            .filter(|r| r.claimed_until.map_or(true, |until| until < now))
            .collect();

        claimable.sort_by_key(|r| r.created_at);

        Ok(claimable
            .into_iter()
            .take(limit)
            .map(|record| {
                record.claimed_until = Some(now + lease);
                record.clone()
            })
            .collect())
    }

    async fn mark_published(&self, event_id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.lock();
        match state.outbox.get_mut(&event_id) {
            Some(record) if record.status == OutboxStatus::Pending => {
                record.status = OutboxStatus::Published;
                record.published_at = Some(Utc::now());
                record.claimed_until = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_failure(&self, event_id: Uuid, error: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        if let Some(record) = state.outbox.get_mut(&event_id) {
            if record.status == OutboxStatus::Pending {
                record.attempts += 1;
                record.last_error = Some(error.to_string());
                record.claimed_until = None;
            }
        }
        Ok(())
    }

    async fn purge_published(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.lock();
        let initial = state.outbox.len();
        state.outbox.retain(|_, record| {
            !(record.status == OutboxStatus::Published
                && record.published_at.map_or(false, |at| at < before))
        });
        Ok((initial - state.outbox.len()) as u64)
    }

    async fn find_record(&self, event_id: Uuid) -> Result<Option<OutboxRecord>, StoreError> {
        Ok(self.lock().outbox.get(&event_id).cloned())
    }
}

#[async_trait]
impl IdempotencyGuard for MemoryStore {
    async fn already_processed(&self, consumer_id: &str, event_id: Uuid) -> Result<bool, StoreError> {
        Ok(matches!(
            self.lock().processed.get(&(consumer_id.to_string(), event_id)),
            Some(Processed::Done { .. })
        ))
    }

    async fn claim(
        &self,
        consumer_id: &str,
        event_id: Uuid,
        lease: Duration,
    ) -> Result<ClaimOutcome, StoreError> {
        let now = Utc::now();
        let until = now
            + chrono::Duration::from_std(lease)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let mut state = self.lock();
        let key = (consumer_id.to_string(), event_id);
        match state.processed.get(&key) {
            Some(Processed::Done { .. }) => Ok(ClaimOutcome::AlreadyProcessed),
            Some(Processed::Claimed { until: held }) if *held > now => Ok(ClaimOutcome::InProgress),
            _ => {
                state.processed.insert(key, Processed::Claimed { until });
                Ok(ClaimOutcome::Claimed)
            }
        }
    }

    async fn mark_processed(&self, consumer_id: &str, event_id: Uuid) -> Result<bool, StoreError> {
        if !self.processed_available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("processed events store offline".to_string()));
        }

        let mut state = self.lock();
        let key = (consumer_id.to_string(), event_id);
        if let Some(Processed::Done { .. }) = state.processed.get(&key) {
            return Ok(false);
        }
        state.processed.insert(key, Processed::Done { at: Utc::now() });
        Ok(true)
    }

    async fn release(&self, consumer_id: &str, event_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.lock();
        let key = (consumer_id.to_string(), event_id);
        if let Some(Processed::Claimed { .. }) = state.processed.get(&key) {
            state.processed.remove(&key);
        }
        Ok(())
    }

    async fn purge_processed(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.lock();
        let initial = state.processed.len();
        state.processed.retain(|_, entry| match entry {
            Processed::Done { at } => *at >= before,
            Processed::Claimed { .. } => true,
        });
        Ok((initial - state.processed.len()) as u64)
    }
}

#[async_trait]
impl DeadLetterSink for MemoryStore {
    async fn dead_letter(&self, letter: DeadLetter) -> Result<(), StoreError> {
        if !self.dead_letters_available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("dead-letter store offline".to_string()));
        }
        self.lock().dead_letters.push(letter);
        Ok(())
    }
}
