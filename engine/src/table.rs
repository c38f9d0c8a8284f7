//! Record table - the in-memory mirror of every known record.
//!
//! The table keeps insertion order for listing and notifies subscribers
//! synchronously after each mutation. It never blocks and never does IO.

use crate::{Record, RecordId};
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;

/// Callback invoked with the ordered record list after every mutation.
pub type Listener = Arc<dyn Fn(&[Record]) + Send + Sync>;

/// Handle returned by [`RecordTable::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Ordered, observable map of records keyed by id.
#[derive(Default)]
pub struct RecordTable {
    records: IndexMap<RecordId, Record>,
    listeners: Vec<(SubscriptionId, Listener)>,
    next_subscription: u64,
}

impl fmt::Debug for RecordTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordTable")
            .field("records", &self.records)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl RecordTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from records in listing order, without notifying anyone.
    pub fn from_records(records: impl IntoIterator<Item = Record>) -> Self {
        let mut table = Self::new();
        for record in records {
            table.records.insert(record.id.clone(), record);
        }
        table
    }

    /// All records in insertion order.
    pub fn records(&self) -> Vec<Record> {
        self.records.values().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    pub fn get(&self, id: &str) -> Option<&Record> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Insert or replace a record. A replaced record keeps its position.
    pub fn upsert(&mut self, record: Record) {
        self.records.insert(record.id.clone(), record);
        self.notify();
    }

    /// Remove a record, keeping the order of the others.
    pub fn remove(&mut self, id: &str) -> Option<Record> {
        let removed = self.records.shift_remove(id);
        if removed.is_some() {
            self.notify();
        }
        removed
    }

    /// Replace `old` with `record` (which carries the new id) at the same position.
    ///
    /// Returns false when `old` is not in the table.
    pub fn rename(&mut self, old: &str, record: Record) -> bool {
        let Some(index) = self.records.get_index_of(old) else {
            return false;
        };
        self.records.shift_remove_index(index);
        // A stale copy under the new id would otherwise survive next to it.
        self.records.shift_remove(&record.id);
        let index = index.min(self.records.len());
        self.records.shift_insert(index, record.id.clone(), record);
        self.notify();
        true
    }

    /// Replace the whole content, keeping listeners. Notifies once.
    pub fn replace_all(&mut self, records: impl IntoIterator<Item = Record>) {
        self.records.clear();
        for record in records {
            self.records.insert(record.id.clone(), record);
        }
        self.notify();
    }

    /// Register a listener. It runs synchronously after every mutation.
    pub fn subscribe<F>(&mut self, listener: F) -> SubscriptionId
    where
        F: Fn(&[Record]) + Send + Sync + 'static,
    {
        self.next_subscription += 1;
        let id = SubscriptionId(self.next_subscription);
        self.listeners.push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns false if it was already gone.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(sub, _)| *sub != id);
        self.listeners.len() != before
    }

    fn notify(&self) {
        if self.listeners.is_empty() {
            return;
        }
        let snapshot: Vec<Record> = self.records.values().cloned().collect();
        for (_, listener) in &self.listeners {
            listener(&snapshot);
        }
    }
}
