//! Snapshot types for persisting and restoring engine state.
//!
//! A snapshot is the bridge between the in-memory table/queue and the
//! durable byte store. It round-trips the full record table, the per-record
//! sync states and the pending operation queue.

use crate::{error::Result, Error, PendingOp, Record, RecordId, SyncState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time copy of everything the engine must not lose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Records in table order
    pub records: Vec<Record>,
    /// Sync state per record id. BTreeMap for deterministic output.
    #[serde(default)]
    pub states: BTreeMap<RecordId, SyncState>,
    /// Operations not yet confirmed by the server, in queue order
    #[serde(default)]
    pub pending_ops: Vec<PendingOp>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl Snapshot {
    /// Create a new empty snapshot.
    pub fn new() -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            records: Vec::new(),
            states: BTreeMap::new(),
            pending_ops: Vec::new(),
        }
    }

    /// Get a record from the snapshot.
    pub fn get_record(&self, id: &str) -> Option<&Record> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Check internal consistency.
    ///
    /// Record ids must be unique; a duplicate would break the table invariant
    /// of one live record per id.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for record in &self.records {
            if !seen.insert(record.id.as_str()) {
                return Err(Error::InvalidSnapshot(format!(
                    "duplicate record id: {}",
                    record.id
                )));
            }
        }
        Ok(())
    }

    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_slice(bytes).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        snapshot.validate()?;
        Ok(snapshot)
    }
}

/// Summary of a snapshot without the data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub format_version: u32,
    pub record_count: usize,
    pub pending_count: usize,
}

impl From<&Snapshot> for SnapshotMetadata {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            format_version: snapshot.format_version,
            record_count: snapshot.record_count(),
            pending_count: snapshot.pending_ops.len(),
        }
    }
}
