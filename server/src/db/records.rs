//! Record storage.
//!
//! Records live in a `Vec` so listings keep creation order. Creates may carry
//! an idempotency key; a repeated key returns the record created the first
//! time instead of creating another one. Keys are forgotten once their record
//! is deleted.

use chrono::Utc;
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::RwLock;
use postsync_engine::{NewRecord, Record, RecordId, RecordPatch};
use std::sync::Arc;
use uuid::Uuid;

/// Shared handle to the record store.
pub type Db = Arc<RecordStore>;

/// Outcome of a create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Created {
    /// A new record was stored
    New(Record),
    /// The idempotency key was seen before; this is the original record as
    /// it is now
    Replayed(Record),
}

impl Created {
    pub fn into_record(self) -> Record {
        match self {
            Created::New(record) | Created::Replayed(record) => record,
        }
    }
}

/// Thread-safe in-memory record store.
#[derive(Debug, Default)]
pub struct RecordStore {
    records: RwLock<Vec<Record>>,
    idempotency: DashMap<String, RecordId>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with `records`.
    pub fn with_records(records: Vec<Record>) -> Self {
        Self {
            records: RwLock::new(records),
            idempotency: DashMap::new(),
        }
    }

    /// Create a shared store.
    pub fn new_shared() -> Db {
        Arc::new(Self::new())
    }

    /// All records in creation order.
    pub fn list(&self) -> Vec<Record> {
        self.records.read().clone()
    }

    pub fn get(&self, id: &str) -> Option<Record> {
        self.records.read().iter().find(|r| r.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Store a new record with a server-assigned id.
    pub fn create(&self, input: NewRecord, idempotency_key: Option<&str>) -> Created {
        let Some(key) = idempotency_key else {
            return Created::New(self.insert(input));
        };

        match self.idempotency.entry(key.to_string()) {
            Entry::Occupied(mut entry) => match self.get(entry.get()) {
                Some(record) => {
                    tracing::debug!(key, id = %record.id, "replaying idempotent create");
                    Created::Replayed(record)
                }
                None => {
                    let record = self.insert(input);
                    entry.insert(record.id.clone());
                    Created::New(record)
                }
            },
            Entry::Vacant(entry) => {
                let record = self.insert(input);
                entry.insert(record.id.clone());
                Created::New(record)
            }
        }
    }

    fn insert(&self, input: NewRecord) -> Record {
        let id: RecordId = Uuid::new_v4().to_string();
        let record = Record::new(id, input, Utc::now());
        self.records.write().push(record.clone());
        record
    }

    /// Apply a partial update. `updatedAt` is set by the server.
    pub fn update(&self, id: &str, patch: &RecordPatch) -> Option<Record> {
        let mut records = self.records.write();
        let record = records.iter_mut().find(|r| r.id == id)?;
        // Never move backwards, even if the wall clock does.
        let now = Utc::now().max(record.updated_at);
        record.apply_patch(patch, now);
        Some(record.clone())
    }

    /// Delete a record and forget the idempotency keys that created it.
    /// Returns false if it did not exist.
    pub fn delete(&self, id: &str) -> bool {
        let deleted = {
            let mut records = self.records.write();
            let before = records.len();
            records.retain(|r| r.id != id);
            records.len() != before
        };
        if deleted {
            self.idempotency.retain(|_, created| created != id);
        }
        deleted
    }
}
