//! # Postsync Engine
//!
//! An offline-first sync engine for a posts CRUD service.
//!
//! Every local change is applied to the in-memory table immediately, written
//! to durable storage, and queued. Queued operations are delivered to the
//! server whenever it is reachable, retried with capped backoff until they
//! succeed or the server rejects them, and never lost across restarts.
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! A [`Record`] is a post: title, content, author and two timestamps. Records
//! created offline carry a temporary `local-` id until the server assigns a
//! permanent one; the engine then rewrites the id everywhere at once.
//!
//! ### Operations
//!
//! Changes are queued as [`PendingOp`]s in an [`OpQueue`]. Operations of one
//! record are delivered in order; records are independent of each other.
//! Updates to a record not yet sent are coalesced into a single operation.
//!
//! ### Reconciliation
//!
//! [`SyncEngine::refresh`] merges the server listing last-write-wins on
//! `updatedAt`. Records with pending local operations are left alone.
//!
//! ## Quick Start
//!
//! ```rust
//! use postsync_engine::{EngineConfig, MemoryKv, MockGateway, NewRecord, SyncEngine, SyncState};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let gateway = Arc::new(MockGateway::new());
//! let engine = SyncEngine::new(EngineConfig::default(), Arc::new(MemoryKv::new()), gateway.clone());
//! engine.load().await.unwrap();
//!
//! let post = engine
//!     .create_local(NewRecord::new("Hello", "First post", "ada"))
//!     .await
//!     .unwrap();
//! assert!(post.id.starts_with("local-"));
//!
//! engine.set_online(true);
//! engine.drain().await;
//!
//! let synced = &engine.records()[0];
//! assert_eq!(synced.id, "srv-1");
//! assert_eq!(engine.sync_state("srv-1"), Some(SyncState::Synced));
//! # }
//! ```
//!
//! ## Persistence
//!
//! State is saved as a versioned JSON [`Snapshot`] under a single key of a
//! [`KeyValueStore`]. [`FileKv`] writes atomically to a directory;
//! [`MemoryKv`] is for tests.

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod http;
pub mod operation;
pub mod persist;
pub mod queue;
pub mod reachability;
pub mod reconcile;
pub mod record;
pub mod snapshot;
pub mod state;
pub mod table;
pub mod validate;

// Re-export main types at crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, GatewayConfig, RetryPolicy};
pub use engine::{DrainReport, SyncEngine};
pub use error::{Error, ErrorKind};
pub use gateway::{GatewayCall, MockGateway, RemoteGateway};
pub use http::HttpGateway;
pub use operation::{OpKind, OperationId, PendingOp};
pub use persist::{DurableStore, FileKv, KeyValueStore, MemoryKv};
pub use queue::{Enqueued, OpQueue};
pub use reachability::{Reachability, ReachabilityMonitor};
pub use reconcile::MergeResult;
pub use record::{NewRecord, Record, RecordPatch};
pub use snapshot::{Snapshot, SnapshotMetadata, SNAPSHOT_FORMAT_VERSION};
pub use state::{SyncState, SyncStatus};
pub use table::{RecordTable, SubscriptionId};

/// Type aliases for clarity
pub type RecordId = String;
pub type Timestamp = chrono::DateTime<chrono::Utc>;
