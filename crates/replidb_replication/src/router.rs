//! Per-operation route resolution.

use crate::policy::{OperationKind, ReplicationPolicy};
use crate::resolver::MasterResolver;
use replidb_core::{CoreError, CoreResult};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// Where one operation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// On the local engine.
    Local,
    /// On the master at this address.
    Remote(SocketAddr),
}

/// Resolves the route of each operation from the current master and the
/// replication policy.
#[derive(Clone)]
pub struct Router {
    resolver: Arc<dyn MasterResolver>,
    policy: Arc<dyn ReplicationPolicy>,
}

impl Router {
    /// Creates a router.
    pub fn new(resolver: Arc<dyn MasterResolver>, policy: Arc<dyn ReplicationPolicy>) -> Self {
        Self { resolver, policy }
    }

    /// Resolves where an operation of `kind` runs.
    ///
    /// The master is looked up on every call.
    ///
    /// # Errors
    ///
    /// Returns `ReplicationUnavailable` if no master can be resolved.
    pub fn resolve(&self, kind: OperationKind) -> CoreResult<Route> {
        let master = self.resolver.master().ok_or_else(|| {
            CoreError::replication_unavailable("a majority of servers is currently not available")
        })?;

        let route = if self.resolver.is_local(master) || !self.policy.is_master_restricted(kind) {
            Route::Local
        } else {
            Route::Remote(master)
        };
        debug!(kind = %kind, master = %master, route = ?route, "resolved route");
        Ok(route)
    }

    /// Returns the policy in use.
    #[must_use]
    pub fn policy(&self) -> &dyn ReplicationPolicy {
        self.policy.as_ref()
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("master", &self.resolver.master())
            .field("policy", &self.policy)
            .finish()
    }
}
