//! In-process transport.
//!
//! Requests are encoded as CBOR, routed to the service registered under the
//! master's address and served on a separate thread, so the caller's timeout
//! holds even when the service stalls.

use crate::error::{RemoteError, RemoteResult};
use crate::remote::{RemoteAccessClient, RemoteRequest, RemoteResponse};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Encodes a message as CBOR.
///
/// # Errors
///
/// Returns `Codec` if serialization fails.
pub fn encode<T: Serialize>(message: &T) -> RemoteResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(message, &mut buf).map_err(|e| RemoteError::Codec(e.to_string()))?;
    Ok(buf)
}

/// Decodes a CBOR message.
///
/// # Errors
///
/// Returns `Codec` if the bytes are not a valid message.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> RemoteResult<T> {
    ciborium::de::from_reader(bytes).map_err(|e| RemoteError::Codec(e.to_string()))
}

/// Something that answers encoded requests.
pub trait RequestService: Send + Sync {
    /// Serves one encoded request and returns the encoded response.
    ///
    /// # Errors
    ///
    /// Returns a description of why the request could not be served.
    fn serve(&self, body: &[u8]) -> Result<Vec<u8>, String>;
}

/// A [`RemoteAccessClient`] that delivers requests to services registered
/// in the same process.
pub struct LoopbackClient {
    services: RwLock<HashMap<SocketAddr, Arc<dyn RequestService>>>,
    timeout: Duration,
}

impl LoopbackClient {
    /// Creates a client enforcing `timeout` on every call.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    /// Makes `service` reachable at `address`.
    pub fn register(&self, address: SocketAddr, service: Arc<dyn RequestService>) {
        self.services.write().insert(address, service);
    }

    /// Makes `address` unreachable. Returns false if nothing was registered.
    pub fn unregister(&self, address: SocketAddr) -> bool {
        self.services.write().remove(&address).is_some()
    }

    /// Returns the timeout applied to every call.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl RemoteAccessClient for LoopbackClient {
    fn call(&self, master: SocketAddr, request: RemoteRequest) -> RemoteResult<RemoteResponse> {
        let service = self
            .services
            .read()
            .get(&master)
            .cloned()
            .ok_or_else(|| RemoteError::Transport(format!("no service at {master}")))?;
        let body = encode(&request)?;

        let (tx, rx) = mpsc::sync_channel(1);
        thread::Builder::new()
            .name("replidb-loopback".into())
            .spawn(move || {
                // The caller may have timed out and dropped the receiver
                let _ = tx.send(service.serve(&body));
            })
            .map_err(|e| RemoteError::Transport(format!("failed to spawn request thread: {e}")))?;

        match rx.recv_timeout(self.timeout) {
            Ok(Ok(reply)) => {
                debug!(master = %master, bytes = reply.len(), "loopback reply");
                decode(&reply)
            }
            Ok(Err(message)) => Err(RemoteError::Transport(message)),
            Err(RecvTimeoutError::Timeout) => {
                warn!(master = %master, timeout = ?self.timeout, "loopback request timed out");
                Err(RemoteError::Timeout {
                    address: master,
                    timeout: self.timeout,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(RemoteError::Transport(
                "service dropped the request".into(),
            )),
        }
    }
}

impl std::fmt::Debug for LoopbackClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackClient")
            .field("services", &self.services.read().keys().collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .finish()
    }
}
