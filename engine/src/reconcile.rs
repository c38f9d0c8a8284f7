//! Reconciliation of a server listing with local state.
//!
//! # Algorithm
//!
//! 1. Server records targeted by a queued or in-flight operation are skipped;
//!    local intent always outranks a remote read.
//! 2. Unknown ids are appended to the table.
//! 3. Known ids are resolved last-write-wins on `updatedAt`; the server wins
//!    ties.
//! 4. Synced local records the server no longer lists are dropped.

use crate::{Record, RecordId, RecordTable, SyncState};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// What a merge did, per record id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResult {
    /// Server records that were new locally
    pub inserted: Vec<RecordId>,
    /// Local records replaced by a newer (or equally new) server copy
    pub updated: Vec<RecordId>,
    /// Local records newer than the server copy
    pub kept_local: Vec<RecordId>,
    /// Server records skipped because local operations are pending, or
    /// because an unanswered create might own them
    pub skipped_pending: Vec<RecordId>,
    /// Synced local records deleted on the server
    pub removed: Vec<RecordId>,
}

impl MergeResult {
    /// True when the merge changed the table.
    pub fn changed(&self) -> bool {
        !(self.inserted.is_empty() && self.updated.is_empty() && self.removed.is_empty())
    }
}

/// Last-write-wins: does the remote copy replace the local one?
pub fn remote_wins(local: &Record, remote: &Record) -> bool {
    remote.updated_at >= local.updated_at
}

/// Merge a full server listing into the table.
///
/// `is_pending` reports whether a record has queued or in-flight operations.
pub fn merge_listing<F>(
    table: &mut RecordTable,
    states: &mut HashMap<RecordId, SyncState>,
    remote: Vec<Record>,
    is_pending: F,
) -> MergeResult
where
    F: Fn(&str) -> bool,
{
    let mut result = MergeResult::default();
    let listed: HashSet<RecordId> = remote.iter().map(|r| r.id.clone()).collect();

    for record in remote {
        if is_pending(&record.id) {
            result.skipped_pending.push(record.id);
            continue;
        }

        match table.get(&record.id) {
            None => {
                states.insert(record.id.clone(), SyncState::Synced);
                result.inserted.push(record.id.clone());
                table.upsert(record);
            }
            Some(local) if remote_wins(local, &record) => {
                states.insert(record.id.clone(), SyncState::Synced);
                if local != &record {
                    result.updated.push(record.id.clone());
                    table.upsert(record);
                }
            }
            Some(_) => result.kept_local.push(record.id),
        }
    }

    let stale: Vec<RecordId> = table
        .iter()
        .filter(|r| !listed.contains(&r.id))
        .filter(|r| !is_pending(&r.id))
        .filter(|r| states.get(&r.id) == Some(&SyncState::Synced))
        .map(|r| r.id.clone())
        .collect();

    for id in stale {
        table.remove(&id);
        states.remove(&id);
        result.removed.push(id);
    }

    result
}
