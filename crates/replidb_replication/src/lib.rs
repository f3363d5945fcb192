//! # replidb Replication
//!
//! Replication-aware routing for replidb.
//!
//! This crate provides:
//! - Master resolution queried on every call (static or switchable)
//! - Replication policies marking operations as master-restricted
//! - Per-call route resolution (`Local` or `Remote(master)`)
//! - A replicated database manager and database handles
//! - The remote-access client contract, a master-side handler and an
//!   in-process CBOR transport with bounded timeouts
//!
//! ## Routing
//!
//! ```text
//! resolve: no master           → ReplicationUnavailable
//!          master is self      → Local
//!          not restricted      → Local
//!          otherwise           → Remote(master)
//! ```
//!
//! ## Key Invariants
//!
//! - Local errors pass through unchanged
//! - Remote `DbUnavailable` becomes `NoSuchDatabase`
//! - Every other remote failure becomes `ReplicationFailure`
//! - Administrative operations are never forwarded
//! - Forwarded calls are never retried here

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod handler;
mod loopback;
mod manager;
mod policy;
mod remote;
mod resolver;
mod router;

pub use config::ReplicationConfig;
pub use error::{ErrorCode, RemoteError, RemoteResult};
pub use handler::RemoteAccessHandler;
pub use loopback::{decode, encode, LoopbackClient, RequestService};
pub use manager::{ReplicatedDatabase, ReplicatedDatabaseManager};
pub use policy::{MasterOnly, NoRestriction, OperationKind, ReplicationPolicy, WriteRestriction};
pub use remote::{MockClient, RemoteAccessClient, RemoteRecord, RemoteRequest, RemoteResponse};
pub use resolver::{MasterResolver, StaticMaster, SwitchableMaster};
pub use router::{Route, Router};
