//! Remote gateway abstraction for the CRUD service.

use crate::{error::Result, Clock, Error, NewRecord, Record, RecordPatch, SystemClock};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;

/// The four remote operations the engine relies on.
///
/// Implementations do not retry. Failures are reported as
/// [`Error::Network`] or [`Error::Server`] (transient), [`Error::NotFound`]
/// or [`Error::Rejected`] (terminal).
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// Every record the server knows.
    async fn list(&self) -> Result<Vec<Record>>;

    /// Create a record. `op_id` doubles as an idempotency key: repeating a
    /// create with the same key returns the record created the first time.
    async fn create(&self, op_id: &str, input: &NewRecord) -> Result<Record>;

    /// Apply a partial update.
    async fn update(&self, id: &str, patch: &RecordPatch) -> Result<Record>;

    /// Delete a record.
    async fn delete(&self, id: &str) -> Result<()>;
}

/// A call observed by [`MockGateway`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    List,
    Create { op_id: String, title: String },
    Update { id: String, patch: RecordPatch },
    Delete { id: String },
}

impl GatewayCall {
    /// Id the call targets, if any. Creates target the idempotency key.
    pub fn target(&self) -> Option<&str> {
        match self {
            GatewayCall::List => None,
            GatewayCall::Create { op_id, .. } => Some(op_id),
            GatewayCall::Update { id, .. } | GatewayCall::Delete { id } => Some(id),
        }
    }
}

#[derive(Debug)]
enum Scripted {
    /// Fail before touching server state
    Fail(Error),
    /// Apply the call, then report a failure as if the response was lost
    LoseResponse,
}

#[derive(Default)]
struct MockServer {
    records: Vec<Record>,
    idempotency: HashMap<String, String>,
    next_id: u64,
    calls: Vec<GatewayCall>,
    script: VecDeque<Scripted>,
    offline: bool,
}

/// An in-memory stand-in for the remote service.
///
/// Assigns ids `srv-1`, `srv-2`, ... and records every call. Failures can be
/// scripted per call, the whole service can be taken offline, and calls can
/// be held at the door to observe in-flight behavior.
pub struct MockGateway {
    server: Mutex<MockServer>,
    clock: Arc<dyn Clock>,
    gate: watch::Sender<bool>,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGateway {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Use `clock` for server-side timestamps.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            server: Mutex::new(MockServer::default()),
            clock,
            gate,
        }
    }

    /// Fail every call with a network error until set back.
    pub fn set_offline(&self, offline: bool) {
        self.server.lock().offline = offline;
    }

    /// Fail the next call with `error`. Scripted failures queue up.
    pub fn fail_next(&self, error: Error) {
        self.server.lock().script.push_back(Scripted::Fail(error));
    }

    /// Apply the next call but report a network error to the caller.
    pub fn lose_next_response(&self) {
        self.server.lock().script.push_back(Scripted::LoseResponse);
    }

    /// Hold every call before it reaches the server until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.gate.send_replace(true);
    }

    pub fn resume(&self) {
        self.gate.send_replace(false);
    }

    /// Seed a record directly on the server.
    pub fn insert_remote(&self, record: Record) {
        let mut server = self.server.lock();
        server.records.retain(|r| r.id != record.id);
        server.records.push(record);
    }

    /// Delete a record server-side without going through the gateway.
    pub fn remove_remote(&self, id: &str) -> bool {
        let mut server = self.server.lock();
        let before = server.records.len();
        server.records.retain(|r| r.id != id);
        server.records.len() != before
    }

    /// Server-side records.
    pub fn remote_records(&self) -> Vec<Record> {
        self.server.lock().records.clone()
    }

    pub fn remote_record(&self, id: &str) -> Option<Record> {
        self.server.lock().records.iter().find(|r| r.id == id).cloned()
    }

    /// Calls received so far, including failed ones.
    pub fn calls(&self) -> Vec<GatewayCall> {
        self.server.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.server.lock().calls.len()
    }

    async fn enter(&self, call: GatewayCall) -> Result<Option<Scripted>> {
        let mut gate = self.gate.subscribe();
        self.server.lock().calls.push(call);
        // Sender lives in self, so the channel cannot close while we wait.
        let _ = gate.wait_for(|paused| !*paused).await;

        let mut guard = self.server.lock();
        if guard.offline {
            return Err(Error::Network("mock gateway offline".into()));
        }
        match guard.script.pop_front() {
            Some(Scripted::Fail(error)) => Err(error),
            other => Ok(other),
        }
    }

    fn lost(scripted: Option<Scripted>) -> Result<()> {
        match scripted {
            Some(Scripted::LoseResponse) => {
                Err(Error::Network("connection reset after request".into()))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteGateway for MockGateway {
    async fn list(&self) -> Result<Vec<Record>> {
        let scripted = self.enter(GatewayCall::List).await?;
        let records = self.server.lock().records.clone();
        Self::lost(scripted)?;
        Ok(records)
    }

    async fn create(&self, op_id: &str, input: &NewRecord) -> Result<Record> {
        let scripted = self
            .enter(GatewayCall::Create {
                op_id: op_id.to_string(),
                title: input.title.clone(),
            })
            .await?;

        let record = {
            let mut server = self.server.lock();
            let existing = server
                .idempotency
                .get(op_id)
                .and_then(|id| server.records.iter().find(|r| &r.id == id))
                .cloned();
            match existing {
                Some(record) => record,
                None => {
                    server.next_id += 1;
                    let id = format!("srv-{}", server.next_id);
                    let record = Record::new(id.clone(), input.clone(), self.clock.now());
                    server.records.push(record.clone());
                    server.idempotency.insert(op_id.to_string(), id);
                    record
                }
            }
        };

        Self::lost(scripted)?;
        Ok(record)
    }

    async fn update(&self, id: &str, patch: &RecordPatch) -> Result<Record> {
        let scripted = self
            .enter(GatewayCall::Update {
                id: id.to_string(),
                patch: patch.clone(),
            })
            .await?;

        let record = {
            let mut server = self.server.lock();
            let now = self.clock.now();
            let record = server
                .records
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            record.apply_patch(patch, now);
            record.clone()
        };

        Self::lost(scripted)?;
        Ok(record)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let scripted = self
            .enter(GatewayCall::Delete { id: id.to_string() })
            .await?;

        if !self.remove_remote(id) {
            return Err(Error::NotFound(id.to_string()));
        }
        Self::lost(scripted)
    }
}
