//! Pending operations awaiting delivery to the remote service.
//!
//! Every local mutation is expressed as an operation and queued until the
//! server confirms it. Operations survive restarts as part of the snapshot.

use crate::{RecordId, RecordPatch, Timestamp};
use serde::{Deserialize, Serialize};

/// Unique identifier for an operation.
pub type OperationId = String;

/// Generate a fresh operation identifier.
pub fn new_op_id() -> OperationId {
    format!("op-{}", uuid::Uuid::new_v4())
}

/// Kind of remote call an operation maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpKind::Create => write!(f, "create"),
            OpKind::Update => write!(f, "update"),
            OpKind::Delete => write!(f, "delete"),
        }
    }
}

/// A queued, not-yet-confirmed mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOp {
    /// Operation ID, also sent as the idempotency key on create
    pub op_id: OperationId,
    pub kind: OpKind,
    /// Record this operation targets; rewritten when a temporary id is remapped
    pub record_id: RecordId,
    /// Fields to send. Empty for deletes.
    pub payload: RecordPatch,
    pub enqueued_at: Timestamp,
    /// Failed delivery attempts so far
    pub attempts: u32,
}

impl PendingOp {
    pub fn create(record_id: impl Into<RecordId>, payload: RecordPatch, now: Timestamp) -> Self {
        Self::new(OpKind::Create, record_id, payload, now)
    }

    pub fn update(record_id: impl Into<RecordId>, payload: RecordPatch, now: Timestamp) -> Self {
        Self::new(OpKind::Update, record_id, payload, now)
    }

    pub fn delete(record_id: impl Into<RecordId>, now: Timestamp) -> Self {
        Self::new(OpKind::Delete, record_id, RecordPatch::default(), now)
    }

    fn new(kind: OpKind, record_id: impl Into<RecordId>, payload: RecordPatch, now: Timestamp) -> Self {
        Self {
            op_id: new_op_id(),
            kind,
            record_id: record_id.into(),
            payload,
            enqueued_at: now,
            attempts: 0,
        }
    }
}
