//! The outbound operation queue.
//!
//! A single ordered sequence of [`PendingOp`]s. Operations for the same record
//! form a FIFO sub-queue that is never reordered; sub-queues of different
//! records interleave freely. Only the head of each sub-queue is eligible for
//! delivery.

use crate::{OpKind, OperationId, PendingOp, RecordPatch, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Outcome of queueing an update intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueued {
    /// A new operation was appended
    Appended(OperationId),
    /// The patch was folded into an operation that was already waiting
    Coalesced(OperationId),
}

impl Enqueued {
    pub fn op_id(&self) -> &OperationId {
        match self {
            Enqueued::Appended(id) | Enqueued::Coalesced(id) => id,
        }
    }
}

/// Ordered queue of pending operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpQueue {
    ops: Vec<PendingOp>,
}

impl OpQueue {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    /// Rebuild a queue from persisted operations, keeping their order.
    pub fn from_ops(ops: Vec<PendingOp>) -> Self {
        Self { ops }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingOp> {
        self.ops.iter()
    }

    pub fn as_slice(&self) -> &[PendingOp] {
        &self.ops
    }

    pub fn get(&self, op_id: &str) -> Option<&PendingOp> {
        self.ops.iter().find(|op| op.op_id == op_id)
    }

    /// Append an operation at the tail.
    pub fn push(&mut self, op: PendingOp) -> OperationId {
        let op_id = op.op_id.clone();
        self.ops.push(op);
        op_id
    }

    /// Queue an update, coalescing with a waiting update for the same record.
    ///
    /// An update is only folded into the last operation of the record's
    /// sub-queue, and only when that operation is not currently dispatched.
    pub fn enqueue_update(
        &mut self,
        record_id: &str,
        patch: RecordPatch,
        now: Timestamp,
        dispatched: &HashSet<OperationId>,
    ) -> Enqueued {
        let last = self
            .ops
            .iter_mut()
            .rev()
            .find(|op| op.record_id == record_id);

        if let Some(op) = last {
            if op.kind == OpKind::Update && !dispatched.contains(&op.op_id) {
                op.payload.merge(patch);
                return Enqueued::Coalesced(op.op_id.clone());
            }
        }

        Enqueued::Appended(self.push(PendingOp::update(record_id, patch, now)))
    }

    /// Whether any operation targets the record.
    pub fn has_ops_for(&self, record_id: &str) -> bool {
        self.ops.iter().any(|op| op.record_id == record_id)
    }

    /// Whether a create that was already tried is still waiting. Its record
    /// may exist on the server under an id not known yet.
    pub fn has_attempted_create(&self) -> bool {
        self.ops
            .iter()
            .any(|op| op.kind == OpKind::Create && op.attempts > 0)
    }

    /// Operations for one record, oldest first.
    pub fn ops_for<'a>(&'a self, record_id: &'a str) -> impl Iterator<Item = &'a PendingOp> + 'a {
        self.ops.iter().filter(move |op| op.record_id == record_id)
    }

    /// Head of a record's sub-queue.
    pub fn head_for(&self, record_id: &str) -> Option<&PendingOp> {
        self.ops.iter().find(|op| op.record_id == record_id)
    }

    /// The head of every sub-queue, in queue order.
    pub fn heads(&self) -> Vec<&PendingOp> {
        let mut seen = HashSet::new();
        self.ops
            .iter()
            .filter(|&op| seen.insert(op.record_id.as_str()))
            .collect()
    }

    /// Remove a single operation.
    pub fn remove(&mut self, op_id: &str) -> Option<PendingOp> {
        let index = self.ops.iter().position(|op| op.op_id == op_id)?;
        Some(self.ops.remove(index))
    }

    /// Remove every operation for a record except those in `keep`.
    ///
    /// Returns the removed operations in queue order.
    pub fn discard_for(&mut self, record_id: &str, keep: &HashSet<OperationId>) -> Vec<PendingOp> {
        let mut removed = Vec::new();
        self.ops.retain(|op| {
            if op.record_id == record_id && !keep.contains(&op.op_id) {
                removed.push(op.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Count a failed delivery. Returns the new attempt count.
    pub fn record_failure(&mut self, op_id: &str) -> Option<u32> {
        let op = self.ops.iter_mut().find(|op| op.op_id == op_id)?;
        op.attempts = op.attempts.saturating_add(1);
        Some(op.attempts)
    }

    /// Point every operation for `old` at `new`. Returns how many were touched.
    pub fn remap(&mut self, old: &str, new: &str) -> usize {
        let mut touched = 0;
        for op in self.ops.iter_mut().filter(|op| op.record_id == old) {
            op.record_id = new.to_string();
            touched += 1;
        }
        touched
    }

    pub fn into_vec(self) -> Vec<PendingOp> {
        self.ops
    }
}
