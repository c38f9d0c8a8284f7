//! The sync engine.
//!
//! Owns the record table and the pending operation queue. Local intents are
//! applied optimistically and persisted, then delivered to the remote gateway
//! while the device is online. Operations of one record are delivered strictly
//! in order; different records are delivered concurrently.
//!
//! Locking: all in-memory state lives behind one synchronous mutex that is
//! never held across an `.await`. Saves are serialized by `save_lock`, and
//! draining and listing by `sync_lock`, so a server listing can never race an
//! in-flight create.

use crate::{
    error::Result,
    reconcile::{merge_listing, MergeResult},
    validate::{normalize_patch, validate_new},
    Clock, DurableStore, EngineConfig, Error, ErrorKind, KeyValueStore, NewRecord, OpKind,
    OpQueue, OperationId, PendingOp, Reachability, Record, RecordId, RecordPatch, RecordTable,
    RemoteGateway, Snapshot, SubscriptionId, SyncState, SyncStatus, SystemClock,
    SNAPSHOT_FORMAT_VERSION,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Counts from one or more drain passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    /// Operations handed to the gateway
    pub dispatched: usize,
    /// Operations the server confirmed
    pub delivered: usize,
    /// Operations that failed transiently and stay queued
    pub retried: usize,
    /// Operations dropped after a terminal failure
    pub dropped: usize,
}

impl DrainReport {
    fn absorb(&mut self, other: DrainReport) {
        self.dispatched += other.dispatched;
        self.delivered += other.delivered;
        self.retried += other.retried;
        self.dropped += other.dropped;
    }

    /// Whether the queue shrank.
    pub fn made_progress(&self) -> bool {
        self.delivered + self.dropped > 0
    }
}

#[derive(Debug, Default)]
struct EngineState {
    table: RecordTable,
    queue: OpQueue,
    states: HashMap<RecordId, SyncState>,
    /// Dispatched operations and the record they targeted at dispatch time
    in_flight: HashMap<OperationId, RecordId>,
    /// Earliest next attempt for operations that failed transiently
    not_before: HashMap<OperationId, Instant>,
    online: Option<bool>,
    last_error: Option<ErrorKind>,
    /// Saves are held back until this is set, so a save can never replace a
    /// snapshot that was not read
    is_loaded: bool,
}

impl EngineState {
    fn status(&self) -> SyncStatus {
        SyncStatus {
            is_loaded: self.is_loaded,
            last_error: self.last_error,
            online: self.online,
            pending: self.queue.len(),
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            records: self.table.records(),
            states: self
                .states
                .iter()
                .map(|(id, state)| (id.clone(), *state))
                .collect(),
            pending_ops: self.queue.as_slice().to_vec(),
        }
    }

    /// Restore a snapshot underneath whatever was created before it loaded.
    fn restore(&mut self, snapshot: Snapshot) {
        let mut records: Vec<Record> = snapshot
            .records
            .into_iter()
            .filter(|r| !self.table.contains(&r.id))
            .collect();
        records.extend(self.table.records());

        let known_ops: HashSet<OperationId> =
            self.queue.iter().map(|op| op.op_id.clone()).collect();
        let mut ops: Vec<PendingOp> = snapshot
            .pending_ops
            .into_iter()
            .filter(|op| !known_ops.contains(&op.op_id))
            .collect();
        ops.extend(self.queue.iter().cloned());

        for (id, state) in snapshot.states {
            self.states.entry(id).or_insert_with(|| state.restored());
        }

        self.queue = OpQueue::from_ops(ops);
        self.table.replace_all(records);
    }

    fn is_busy(&self, record_id: &str) -> bool {
        self.in_flight.values().any(|id| id == record_id)
    }

    fn mark(&mut self, record_id: &str, state: SyncState) {
        if self.table.contains(record_id) {
            self.states.insert(record_id.to_string(), state);
        }
    }

    /// Forget a record and everything queued for it.
    fn drop_record(&mut self, record_id: &str) {
        self.table.remove(record_id);
        self.states.remove(record_id);
        for op in self.queue.discard_for(record_id, &HashSet::new()) {
            self.not_before.remove(&op.op_id);
        }
    }

    /// Replace a temporary id with the server id in table, states and queue.
    fn remap(&mut self, old: &str, server: Record) {
        let new_id = server.id.clone();
        let touched = self.queue.remap(old, &new_id);
        if let Some(state) = self.states.remove(old) {
            self.states.insert(new_id.clone(), state);
        }

        if let Some(local) = self.table.get(old) {
            // Later local edits are still queued; keep them over the server echo.
            let record = if self.queue.has_ops_for(&new_id) {
                Record {
                    id: new_id.clone(),
                    created_at: server.created_at,
                    ..local.clone()
                }
            } else {
                server
            };
            self.table.rename(old, record);
        } else if self.table.remove(&new_id).is_some() {
            // Deleted locally before the response came back; a listing may
            // have brought in the server copy meanwhile.
            debug!(old_id = old, new_id = %new_id, "dropped listed copy of a deleted record");
        }

        debug!(old_id = old, new_id = %new_id, requeued = touched, "remapped record id");
    }
}

struct Inner {
    config: EngineConfig,
    store: DurableStore,
    gateway: Arc<dyn RemoteGateway>,
    clock: Arc<dyn Clock>,
    state: Mutex<EngineState>,
    save_lock: tokio::sync::Mutex<()>,
    sync_lock: tokio::sync::Mutex<()>,
    status: watch::Sender<SyncStatus>,
    wake: Notify,
}

/// Offline-first sync engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("store", &self.inner.store.name())
            .field("status", &self.status())
            .finish()
    }
}

impl SyncEngine {
    /// Create an engine using the system clock. Call [`load`](Self::load)
    /// (or use [`open`](Self::open)) before issuing intents.
    pub fn new(
        config: EngineConfig,
        backend: Arc<dyn KeyValueStore>,
        gateway: Arc<dyn RemoteGateway>,
    ) -> Self {
        Self::with_clock(config, backend, gateway, Arc::new(SystemClock))
    }

    /// Create an engine with an explicit clock.
    pub fn with_clock(
        config: EngineConfig,
        backend: Arc<dyn KeyValueStore>,
        gateway: Arc<dyn RemoteGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = DurableStore::new(backend, config.store_name.clone());
        let (status, _) = watch::channel(SyncStatus::default());
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                gateway,
                clock,
                state: Mutex::new(EngineState::default()),
                save_lock: tokio::sync::Mutex::new(()),
                sync_lock: tokio::sync::Mutex::new(()),
                status,
                wake: Notify::new(),
            }),
        }
    }

    /// Create an engine and load its persisted state. A load failure is
    /// logged and reflected in the status; see [`load`](Self::load).
    pub async fn open(
        config: EngineConfig,
        backend: Arc<dyn KeyValueStore>,
        gateway: Arc<dyn RemoteGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let engine = Self::with_clock(config, backend, gateway, clock);
        if let Err(e) = engine.load().await {
            debug!(error = %e, "opened without persisted state");
        }
        engine
    }

    // ------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------

    /// All records in listing order.
    pub fn records(&self) -> Vec<Record> {
        self.inner.state.lock().table.records()
    }

    pub fn get(&self, id: &str) -> Option<Record> {
        self.inner.state.lock().table.get(id).cloned()
    }

    pub fn sync_state(&self, id: &str) -> Option<SyncState> {
        self.inner.state.lock().states.get(id).copied()
    }

    /// Queued operations in delivery order.
    pub fn pending_ops(&self) -> Vec<PendingOp> {
        self.inner.state.lock().queue.as_slice().to_vec()
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.state.lock().status()
    }

    /// Watch status changes.
    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    /// The state that would be persisted right now.
    pub fn snapshot(&self) -> Snapshot {
        self.inner.state.lock().snapshot()
    }

    /// Observe the record table. The listener runs synchronously, under the
    /// engine lock, after every mutation; it must not call back into the engine.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&[Record]) + Send + Sync + 'static,
    {
        self.inner.state.lock().table.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.state.lock().table.unsubscribe(id)
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Load persisted state. Records created before loading are kept after
    /// the persisted ones. Does nothing once loaded.
    ///
    /// An undecodable snapshot is copied aside under the store's corrupt key
    /// and the engine starts empty; the decode error is still returned. Any
    /// other failure leaves the engine unloaded: nothing is saved, and every
    /// later save retries the load first.
    pub async fn load(&self) -> Result<()> {
        let outcome = self.try_load().await;
        if !matches!(outcome, Ok(false)) && self.status().is_loaded {
            self.persist().await;
        }
        outcome.map(|_| ())
    }

    /// Read the snapshot into memory unless that already happened. Returns
    /// whether in-memory intents were merged in and need saving.
    async fn try_load(&self) -> Result<bool> {
        if self.inner.state.lock().is_loaded {
            return Ok(false);
        }

        let loaded = self.inner.store.load().await;
        let fallback = match &loaded {
            Err(e @ Error::InvalidSnapshot(_)) => {
                warn!(
                    error = %e,
                    moved_to = %self.inner.store.corrupt_key(),
                    "snapshot is unreadable, moving it aside"
                );
                match self.inner.store.quarantine().await {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(error = %err, "failed to move unreadable snapshot aside");
                        false
                    }
                }
            }
            _ => false,
        };

        let outcome = {
            let mut state = self.inner.state.lock();
            if state.is_loaded {
                return Ok(false);
            }
            let had_local = !state.table.is_empty() || !state.queue.is_empty();
            match loaded {
                Ok(snapshot) => {
                    if let Some(snapshot) = snapshot {
                        info!(
                            records = snapshot.records.len(),
                            pending = snapshot.pending_ops.len(),
                            "restored snapshot"
                        );
                        state.restore(snapshot);
                    } else {
                        info!(store = self.inner.store.name(), "no snapshot found, starting empty");
                    }
                    state.is_loaded = true;
                    Ok(had_local)
                }
                Err(e) => {
                    state.last_error = Some(e.kind());
                    if fallback {
                        state.is_loaded = true;
                    } else {
                        warn!(error = %e, "failed to load snapshot, saves deferred until it loads");
                    }
                    Err(e)
                }
            }
        };
        self.publish_status();
        outcome
    }

    /// Save the current state. Failures are logged and kept in the status;
    /// the in-memory state stays authoritative and the next save retries.
    async fn persist(&self) {
        let _guard = self.inner.save_lock.lock().await;
        if let Err(e) = self.try_load().await {
            debug!(error = %e, "load retry before save failed");
        }
        let snapshot = {
            let state = self.inner.state.lock();
            if !state.is_loaded {
                debug!("snapshot not loaded, save deferred");
                return;
            }
            state.snapshot()
        };

        let result = self.inner.store.save(&snapshot).await;
        {
            let mut state = self.inner.state.lock();
            match &result {
                Ok(()) => {
                    if state.last_error == Some(ErrorKind::StoreUnavailable) {
                        state.last_error = None;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to persist snapshot, keeping in-memory state");
                    state.last_error = Some(e.kind());
                }
            }
        }
        self.publish_status();
    }

    fn publish_status(&self) {
        let status = self.status();
        self.inner.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    async fn after_mutation(&self) {
        self.publish_status();
        self.persist().await;
        self.inner.wake.notify_one();
    }

    // ------------------------------------------------------------------
    // Local intents
    // ------------------------------------------------------------------

    /// Create a record locally and queue its creation on the server.
    pub async fn create_local(&self, input: NewRecord) -> Result<Record> {
        validate_new(&input)?;
        let now = self.inner.clock.now();

        let record = {
            let mut state = self.inner.state.lock();
            let record = Record::new(crate::record::local_id(), input.clone(), now);
            state.states.insert(record.id.clone(), SyncState::Local);
            state.table.upsert(record.clone());
            state
                .queue
                .push(PendingOp::create(record.id.clone(), input.into(), now));
            record
        };

        info!(record_id = %record.id, "created record locally");
        self.after_mutation().await;
        Ok(record)
    }

    /// Merge a patch into a record and queue the update.
    pub async fn update_local(&self, id: &str, patch: RecordPatch) -> Result<Record> {
        let patch = normalize_patch(patch)?;
        let now = self.inner.clock.now();

        let (record, enqueued) = {
            let mut state = self.inner.state.lock();
            let mut record = state
                .table
                .get(id)
                .cloned()
                .ok_or_else(|| Error::RecordNotFound(id.to_string()))?;
            record.apply_patch(&patch, now);
            state.table.upsert(record.clone());

            let dispatched: HashSet<OperationId> = state.in_flight.keys().cloned().collect();
            let enqueued = state.queue.enqueue_update(id, patch, now, &dispatched);
            (record, enqueued)
        };

        info!(record_id = id, op = ?enqueued, "updated record locally");
        self.after_mutation().await;
        Ok(record)
    }

    /// Remove a record locally and queue its deletion on the server.
    ///
    /// Operations for the record that were never dispatched are discarded.
    /// A record whose create never left the device is forgotten without any
    /// network call.
    pub async fn delete_local(&self, id: &str) -> Result<()> {
        let now = self.inner.clock.now();

        let remote_delete = {
            let mut state = self.inner.state.lock();
            if state.table.remove(id).is_none() {
                return Err(Error::RecordNotFound(id.to_string()));
            }

            // A create that was tried may have reached the server even if we
            // never saw the response; keep it so the delete can follow it.
            let keep: HashSet<OperationId> = state
                .queue
                .ops_for(id)
                .filter(|op| {
                    state.in_flight.contains_key(&op.op_id)
                        || (op.kind == OpKind::Create && op.attempts > 0)
                })
                .map(|op| op.op_id.clone())
                .collect();

            let discarded = state.queue.discard_for(id, &keep);
            for op in &discarded {
                state.not_before.remove(&op.op_id);
            }

            let never_sent = discarded.iter().any(|op| op.kind == OpKind::Create);
            if never_sent {
                state.states.remove(id);
                false
            } else {
                state.queue.push(PendingOp::delete(id, now));
                true
            }
        };

        info!(record_id = id, remote_delete, "deleted record locally");
        self.after_mutation().await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Connectivity
    // ------------------------------------------------------------------

    /// Record a reachability observation. Returns true on a transition to online.
    pub fn set_online(&self, online: bool) -> bool {
        let came_online = {
            let mut state = self.inner.state.lock();
            let was = state.online;
            state.online = Some(online);
            online && was != Some(true)
        };
        if came_online {
            info!("connectivity restored");
        }
        self.publish_status();
        came_online
    }

    fn is_online(&self) -> bool {
        self.inner.state.lock().online == Some(true)
    }

    // ------------------------------------------------------------------
    // Draining
    // ------------------------------------------------------------------

    /// Deliver everything that can be delivered now.
    ///
    /// Repeats drain passes while they make progress. Operations that are
    /// backing off, or fail again, stay queued for a later call.
    pub async fn drain(&self) -> DrainReport {
        let _guard = self.inner.sync_lock.lock().await;
        let mut total = DrainReport::default();
        loop {
            let pass = self.drain_pass().await;
            total.absorb(pass);
            if !pass.made_progress() {
                break;
            }
        }
        total
    }

    /// One round: dispatch the eligible head of every record's sub-queue
    /// concurrently, then apply the outcomes.
    async fn drain_pass(&self) -> DrainReport {
        let mut report = DrainReport::default();
        if !self.is_online() {
            return report;
        }

        let batch: Vec<PendingOp> = {
            let mut state = self.inner.state.lock();
            let now = Instant::now();
            let limit = self
                .inner
                .config
                .max_in_flight
                .saturating_sub(state.in_flight.len());

            let batch: Vec<PendingOp> = state
                .queue
                .heads()
                .into_iter()
                .filter(|op| !state.in_flight.contains_key(&op.op_id))
                .filter(|op| !state.is_busy(&op.record_id))
                .filter(|op| state.not_before.get(&op.op_id).map_or(true, |t| *t <= now))
                .take(limit)
                .cloned()
                .collect();

            for op in &batch {
                state.in_flight.insert(op.op_id.clone(), op.record_id.clone());
                state.mark(&op.record_id, SyncState::Syncing);
            }
            batch
        };

        if batch.is_empty() {
            return report;
        }
        report.dispatched = batch.len();

        let results =
            futures::future::join_all(batch.iter().map(|op| self.dispatch(op))).await;

        {
            let mut state = self.inner.state.lock();
            for (op, result) in batch.into_iter().zip(results) {
                self.apply_outcome(&mut state, op, result, &mut report);
            }
        }

        self.publish_status();
        self.persist().await;
        report
    }

    async fn dispatch(&self, op: &PendingOp) -> Result<Option<Record>> {
        debug!(
            op_id = %op.op_id,
            kind = %op.kind,
            record_id = %op.record_id,
            attempts = op.attempts,
            "dispatching operation"
        );
        let gateway = &self.inner.gateway;
        match op.kind {
            OpKind::Create => {
                let input = NewRecord {
                    title: op.payload.title.clone().unwrap_or_default(),
                    content: op.payload.content.clone().unwrap_or_default(),
                    author: op.payload.author.clone().unwrap_or_default(),
                };
                gateway.create(&op.op_id, &input).await.map(Some)
            }
            OpKind::Update => gateway.update(&op.record_id, &op.payload).await.map(Some),
            OpKind::Delete => gateway.delete(&op.record_id).await.map(|()| None),
        }
    }

    fn apply_outcome(
        &self,
        state: &mut EngineState,
        op: PendingOp,
        result: Result<Option<Record>>,
        report: &mut DrainReport,
    ) {
        state.in_flight.remove(&op.op_id);

        match result {
            Ok(remote) => {
                state.queue.remove(&op.op_id);
                state.not_before.remove(&op.op_id);

                let mut record_id = op.record_id.clone();
                match (op.kind, remote) {
                    (OpKind::Create, Some(server)) => {
                        record_id = server.id.clone();
                        state.remap(&op.record_id, server);
                    }
                    (OpKind::Update, Some(server))
                        if !state.queue.has_ops_for(&record_id)
                            && state.table.contains(&record_id) =>
                    {
                        state.table.upsert(server);
                    }
                    _ => {}
                }

                if !state.queue.has_ops_for(&record_id) {
                    if state.table.contains(&record_id) {
                        state.states.insert(record_id.clone(), SyncState::Synced);
                    } else {
                        state.states.remove(&record_id);
                    }
                }

                state.last_error = None;
                report.delivered += 1;
                info!(op_id = %op.op_id, kind = %op.kind, record_id = %record_id, "operation delivered");
            }
            Err(e) if e.is_transient() || (op.kind == OpKind::Create && matches!(e, Error::NotFound(_))) => {
                let attempts = state.queue.record_failure(&op.op_id).unwrap_or(op.attempts + 1);
                let delay = self.inner.config.retry.delay_for(attempts);
                state.not_before.insert(op.op_id.clone(), Instant::now() + delay);
                state.mark(&op.record_id, SyncState::Failed);
                state.last_error = Some(e.kind());
                report.retried += 1;
                warn!(
                    op_id = %op.op_id,
                    kind = %op.kind,
                    record_id = %op.record_id,
                    attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "delivery failed, will retry"
                );
            }
            Err(Error::NotFound(_)) => {
                // Gone on the server: nothing left to do for this record.
                state.drop_record(&op.record_id);
                report.dropped += 1;
                info!(
                    op_id = %op.op_id,
                    kind = %op.kind,
                    record_id = %op.record_id,
                    "record no longer exists on server, dropped locally"
                );
            }
            Err(e) => {
                state.queue.remove(&op.op_id);
                state.not_before.remove(&op.op_id);
                if op.kind == OpKind::Create {
                    state.drop_record(&op.record_id);
                } else {
                    state.mark(&op.record_id, SyncState::Failed);
                }
                state.last_error = Some(e.kind());
                report.dropped += 1;
                warn!(
                    op_id = %op.op_id,
                    kind = %op.kind,
                    record_id = %op.record_id,
                    error = %e,
                    "operation rejected by server, dropped"
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    /// Fetch the server listing and merge it into the table.
    pub async fn refresh(&self) -> Result<MergeResult> {
        let _guard = self.inner.sync_lock.lock().await;

        let remote = match self.inner.gateway.list().await {
            Ok(remote) => remote,
            Err(e) => {
                warn!(error = %e, "failed to list remote records");
                self.inner.state.lock().last_error = Some(e.kind());
                self.publish_status();
                return Err(e);
            }
        };

        let result = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;

            // An attempted create may already be listed under its server id.
            // Unknown ids wait until every such create has been answered.
            let (remote, deferred): (Vec<Record>, Vec<Record>) =
                if state.queue.has_attempted_create() {
                    let table = &state.table;
                    remote.into_iter().partition(|r| table.contains(&r.id))
                } else {
                    (remote, Vec::new())
                };

            let queue = &state.queue;
            let in_flight = &state.in_flight;
            let mut result = merge_listing(&mut state.table, &mut state.states, remote, |id| {
                queue.has_ops_for(id) || in_flight.values().any(|r| r == id)
            });
            result.skipped_pending.extend(deferred.into_iter().map(|r| r.id));
            state.last_error = None;
            result
        };

        info!(
            inserted = result.inserted.len(),
            updated = result.updated.len(),
            removed = result.removed.len(),
            skipped = result.skipped_pending.len(),
            "merged remote listing"
        );

        self.publish_status();
        if result.changed() {
            self.persist().await;
        }
        Ok(result)
    }

    /// Refresh from the server, then drain. Used when connectivity returns.
    pub async fn sync_now(&self) -> DrainReport {
        if !self.is_online() {
            return DrainReport::default();
        }
        if let Err(e) = self.refresh().await {
            debug!(error = %e, "refresh failed, draining anyway");
        }
        self.drain().await
    }

    // ------------------------------------------------------------------
    // Background loop
    // ------------------------------------------------------------------

    /// Drive the engine until the reachability source goes away.
    ///
    /// Going online triggers a refresh and a drain; every local intent and
    /// every tick triggers a drain while online.
    pub async fn run(&self, mut reachability: Reachability) {
        let initial = *reachability.borrow_and_update();
        if let Some(online) = initial {
            if self.set_online(online) {
                self.sync_now().await;
            }
        }

        let mut ticker = tokio::time::interval(self.inner.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                changed = reachability.changed() => {
                    if changed.is_err() {
                        info!("reachability source closed, stopping sync loop");
                        break;
                    }
                    let observed = *reachability.borrow_and_update();
                    match observed {
                        Some(true) => {
                            if self.set_online(true) {
                                self.sync_now().await;
                            }
                        }
                        Some(false) => {
                            self.set_online(false);
                            info!("connectivity lost, draining suspended");
                        }
                        None => {}
                    }
                }
                _ = self.inner.wake.notified() => {
                    if self.is_online() {
                        self.drain().await;
                    }
                }
                _ = ticker.tick() => {
                    if !self.status().is_loaded {
                        self.persist().await;
                    }
                    if self.is_online() {
                        self.drain().await;
                    }
                }
            }
        }
    }

    /// Spawn [`run`](Self::run) on the current tokio runtime.
    pub fn spawn(&self, reachability: Reachability) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move { engine.run(reachability).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ManualClock, MemoryKv, MockGateway, RetryPolicy};

    async fn engine() -> (SyncEngine, Arc<MockGateway>, Arc<MemoryKv>) {
        let gateway = Arc::new(MockGateway::new());
        let kv = Arc::new(MemoryKv::new());
        let engine = SyncEngine::with_clock(
            EngineConfig::default().with_retry(RetryPolicy::immediate()),
            kv.clone(),
            gateway.clone(),
            Arc::new(ManualClock::at_millis(1_000)),
        );
        engine.load().await.unwrap();
        (engine, gateway, kv)
    }

    fn post(title: &str) -> NewRecord {
        NewRecord::new(title, "body", "author")
    }

    #[tokio::test]
    async fn invalid_create_changes_nothing() {
        let (engine, _, kv) = engine().await;

        let err = engine.create_local(NewRecord::new("t", "", "")).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(engine.records().is_empty());
        assert!(engine.pending_ops().is_empty());
        assert_eq!(kv.write_count(), 0);
    }

    #[tokio::test]
    async fn update_and_delete_unknown_records_fail() {
        let (engine, _, _) = engine().await;

        let update = engine
            .update_local("nope", RecordPatch::default().title("x"))
            .await;
        assert_eq!(update.unwrap_err(), Error::RecordNotFound("nope".into()));
        assert_eq!(
            engine.delete_local("nope").await.unwrap_err(),
            Error::RecordNotFound("nope".into())
        );
    }

    #[tokio::test]
    async fn create_is_optimistic_and_persisted() {
        let (engine, _, kv) = engine().await;

        let record = engine.create_local(post("hello")).await.unwrap();

        assert!(crate::record::is_local_id(&record.id));
        assert_eq!(engine.get(&record.id), Some(record.clone()));
        assert_eq!(engine.sync_state(&record.id), Some(SyncState::Local));
        assert_eq!(engine.status().pending, 1);

        let saved = Snapshot::from_bytes(&kv.raw("posts").unwrap()).unwrap();
        assert_eq!(saved.records, vec![record]);
        assert_eq!(saved.pending_ops.len(), 1);
    }

    #[tokio::test]
    async fn load_keeps_records_created_before_it() {
        let (first, _, kv) = engine().await;
        let older = first.create_local(post("older")).await.unwrap();

        let gateway = Arc::new(MockGateway::new());
        let second = SyncEngine::new(EngineConfig::default(), kv.clone(), gateway);
        let early = second.create_local(post("early")).await.unwrap();
        second.load().await.unwrap();

        let ids: Vec<_> = second.records().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![older.id, early.id]);
        assert_eq!(second.pending_ops().len(), 2);
        assert!(second.status().is_loaded);
    }

    #[tokio::test]
    async fn restored_syncing_state_becomes_failed() {
        let (engine, _, kv) = engine().await;
        let record = engine.create_local(post("a")).await.unwrap();

        let mut snapshot = engine.snapshot();
        snapshot.states.insert(record.id.clone(), SyncState::Syncing);
        kv.set_raw("posts", snapshot.to_bytes().unwrap());

        let (fresh, _, _) = engine_on(kv);
        fresh.load().await.unwrap();
        assert_eq!(fresh.sync_state(&record.id), Some(SyncState::Failed));
    }

    fn engine_on(kv: Arc<MemoryKv>) -> (SyncEngine, Arc<MockGateway>, Arc<MemoryKv>) {
        let gateway = Arc::new(MockGateway::new());
        let engine = SyncEngine::new(EngineConfig::default(), kv.clone(), gateway.clone());
        (engine, gateway, kv)
    }

    #[test]
    fn remap_of_deleted_record_drops_listed_copy() {
        let mut state = EngineState::default();
        let server = Record::new("srv-1", post("a"), chrono::Utc::now());
        state.table.upsert(server.clone());
        state.queue.push(PendingOp::delete("local-x", server.updated_at));

        state.remap("local-x", server);

        assert!(state.table.is_empty());
        assert_eq!(state.queue.head_for("srv-1").map(|op| op.kind), Some(OpKind::Delete));
    }

    #[tokio::test]
    async fn save_waits_for_a_successful_load() {
        let (first, _, kv) = engine().await;
        first.create_local(post("kept")).await.unwrap();

        kv.set_unavailable(true);
        let (second, _, _) = engine_on(kv.clone());
        assert!(second.load().await.is_err());
        second.create_local(post("later")).await.unwrap();
        assert!(!second.status().is_loaded);

        kv.set_unavailable(false);
        second.create_local(post("last")).await.unwrap();

        let titles: Vec<_> = second.records().into_iter().map(|r| r.title).collect();
        assert_eq!(titles, vec!["kept", "later", "last"]);
        let saved = Snapshot::from_bytes(&kv.raw("posts").unwrap()).unwrap();
        assert_eq!(saved.records.len(), 3);
        assert_eq!(saved.pending_ops.len(), 3);
        assert!(second.status().is_loaded);
    }

    #[tokio::test]
    async fn drain_does_nothing_until_online() {
        let (engine, gateway, _) = engine().await;
        engine.create_local(post("a")).await.unwrap();

        assert_eq!(engine.drain().await, DrainReport::default());
        assert_eq!(gateway.call_count(), 0);

        assert!(engine.set_online(true));
        assert!(!engine.set_online(true));
        let report = engine.drain().await;
        assert_eq!(report.delivered, 1);
        assert_eq!(engine.status().pending, 0);
    }

    #[tokio::test]
    async fn rejected_create_drops_the_record() {
        let (engine, gateway, _) = engine().await;
        let record = engine.create_local(post("a")).await.unwrap();
        engine
            .update_local(&record.id, RecordPatch::default().title("b"))
            .await
            .unwrap();
        gateway.fail_next(Error::Rejected("HTTP 400: bad".into()));

        engine.set_online(true);
        let report = engine.drain().await;

        assert_eq!(report.dropped, 1);
        assert!(engine.records().is_empty());
        assert!(engine.pending_ops().is_empty());
        assert_eq!(engine.status().last_error, Some(ErrorKind::Rejected));
        assert_eq!(gateway.call_count(), 1);
    }

    #[tokio::test]
    async fn transient_failure_marks_failed_and_keeps_op() {
        let (engine, gateway, _) = engine().await;
        let record = engine.create_local(post("a")).await.unwrap();
        gateway.fail_next(Error::Server {
            status: 503,
            message: "busy".into(),
        });

        engine.set_online(true);
        let report = engine.drain().await;

        assert_eq!(report.retried, 1);
        assert_eq!(engine.sync_state(&record.id), Some(SyncState::Failed));
        assert_eq!(engine.pending_ops()[0].attempts, 1);
        assert_eq!(engine.status().last_error, Some(ErrorKind::Server));

        engine.drain().await;
        assert_eq!(engine.sync_state("srv-1"), Some(SyncState::Synced));
        assert_eq!(engine.status().last_error, None);
    }

    #[tokio::test]
    async fn backoff_defers_next_attempt() {
        let gateway = Arc::new(MockGateway::new());
        let engine = SyncEngine::new(
            EngineConfig::default().with_retry(RetryPolicy::new(
                std::time::Duration::from_secs(3600),
                std::time::Duration::from_secs(3600),
            )),
            Arc::new(MemoryKv::new()),
            gateway.clone(),
        );
        engine.create_local(post("a")).await.unwrap();
        gateway.fail_next(Error::Network("down".into()));

        engine.set_online(true);
        engine.drain().await;
        let report = engine.drain().await;

        assert_eq!(report.dispatched, 0);
        assert_eq!(gateway.call_count(), 1);
    }

    #[tokio::test]
    async fn subscribers_see_remap() {
        let (engine, _, _) = engine().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        engine.subscribe(move |records| {
            sink.lock().push(records.iter().map(|r| r.id.clone()).collect::<Vec<_>>());
        });

        engine.create_local(post("a")).await.unwrap();
        engine.set_online(true);
        engine.drain().await;

        let seen = seen.lock();
        assert!(crate::record::is_local_id(&seen[0][0]));
        assert_eq!(seen.last().unwrap(), &vec!["srv-1".to_string()]);
    }
}
