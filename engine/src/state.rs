//! Per-record sync states and the engine-wide status.

use crate::ErrorKind;
use serde::{Deserialize, Serialize};

/// Where a record stands relative to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// Exists only on this device, never synced
    Local,
    /// An operation for this record is in flight
    Syncing,
    /// Last known state matches the server
    Synced,
    /// Last attempt errored; eligible for retry
    Failed,
}

impl SyncState {
    /// State to resume with after a restart. In-flight calls did not survive.
    pub fn restored(self) -> Self {
        match self {
            SyncState::Syncing => SyncState::Failed,
            other => other,
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncState::Local => write!(f, "local"),
            SyncState::Syncing => write!(f, "syncing"),
            SyncState::Synced => write!(f, "synced"),
            SyncState::Failed => write!(f, "failed"),
        }
    }
}

/// Observable status of a sync engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// True once the durable store has been read (or found empty)
    pub is_loaded: bool,
    /// Most recent failure; cleared by the next success
    pub last_error: Option<ErrorKind>,
    /// `None` until the reachability monitor has reported anything
    pub online: Option<bool>,
    /// Operations waiting for delivery
    pub pending: usize,
}

impl SyncStatus {
    /// Whether the UI should show a "pending/offline" indicator.
    pub fn is_degraded(&self) -> bool {
        self.online != Some(true) || self.pending > 0 || self.last_error.is_some()
    }
}
