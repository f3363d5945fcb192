//! Configuration for the replication layer.

use crate::policy::{ReplicationPolicy, WriteRestriction};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for routing operations between replicas.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Address this node is reachable at.
    pub local_address: SocketAddr,
    /// Bound on every forwarded call.
    pub request_timeout: Duration,
    /// Which operations only the master may serve.
    pub policy: Arc<dyn ReplicationPolicy>,
}

impl ReplicationConfig {
    /// Creates a configuration with a 5 second timeout and write restriction.
    pub fn new(local_address: SocketAddr) -> Self {
        Self {
            local_address,
            request_timeout: Duration::from_secs(5),
            policy: Arc::new(WriteRestriction),
        }
    }

    /// Sets the request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the replication policy.
    #[must_use]
    pub fn with_policy(mut self, policy: impl ReplicationPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }
}
