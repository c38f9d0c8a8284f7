//! Network reachability signal.
//!
//! The host platform feeds observations into a [`ReachabilityMonitor`]; the
//! engine watches it. The state starts unknown and only actual transitions
//! are published.

use tokio::sync::watch;

/// Receiving side handed to the engine. `None` means no observation yet.
pub type Reachability = watch::Receiver<Option<bool>>;

/// Publishes online/offline transitions.
#[derive(Debug)]
pub struct ReachabilityMonitor {
    tx: watch::Sender<Option<bool>>,
}

impl Default for ReachabilityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ReachabilityMonitor {
    /// Create a monitor in the unknown state.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Subscribe to transitions.
    pub fn subscribe(&self) -> Reachability {
        self.tx.subscribe()
    }

    /// Report an observation. Returns true if it changed the state.
    pub fn set_online(&self, online: bool) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == Some(online) {
                false
            } else {
                *state = Some(online);
                true
            }
        })
    }

    /// Current state.
    pub fn current(&self) -> Option<bool> {
        *self.tx.borrow()
    }
}
