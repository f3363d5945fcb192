//! Master resolution capability.
//!
//! The storage node never caches who the master is. Every routed operation
//! asks its [`MasterResolver`] again, so a role change takes effect on the
//! next call.

use parking_lot::RwLock;
use std::net::SocketAddr;
use tracing::info;

/// Answers "who is master right now".
pub trait MasterResolver: Send + Sync {
    /// Returns the current master, or `None` if none can be resolved.
    fn master(&self) -> Option<SocketAddr>;

    /// Returns true if `address` is this node.
    fn is_local(&self, address: SocketAddr) -> bool;
}

/// A resolver with a fixed answer.
#[derive(Debug, Clone)]
pub struct StaticMaster {
    local: SocketAddr,
    master: Option<SocketAddr>,
}

impl StaticMaster {
    /// Creates a resolver for the node at `local` with a fixed master.
    #[must_use]
    pub fn new(local: SocketAddr, master: Option<SocketAddr>) -> Self {
        Self { local, master }
    }

    /// This node is its own master.
    #[must_use]
    pub fn local(local: SocketAddr) -> Self {
        Self::new(local, Some(local))
    }
}

impl MasterResolver for StaticMaster {
    fn master(&self) -> Option<SocketAddr> {
        self.master
    }

    fn is_local(&self, address: SocketAddr) -> bool {
        address == self.local
    }
}

/// A resolver whose answer an election mechanism updates at runtime.
#[derive(Debug)]
pub struct SwitchableMaster {
    local: SocketAddr,
    master: RwLock<Option<SocketAddr>>,
}

impl SwitchableMaster {
    /// Creates a resolver with no master.
    #[must_use]
    pub fn new(local: SocketAddr) -> Self {
        Self {
            local,
            master: RwLock::new(None),
        }
    }

    /// Records a newly elected master.
    pub fn set_master(&self, master: SocketAddr) {
        let mut current = self.master.write();
        if *current != Some(master) {
            info!(master = %master, local = master == self.local, "master changed");
        }
        *current = Some(master);
    }

    /// Forgets the master, e.g. after losing the majority.
    pub fn clear(&self) {
        if self.master.write().take().is_some() {
            info!("master lost");
        }
    }
}

impl MasterResolver for SwitchableMaster {
    fn master(&self) -> Option<SocketAddr> {
        *self.master.read()
    }

    fn is_local(&self, address: SocketAddr) -> bool {
        address == self.local
    }
}
