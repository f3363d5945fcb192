//! Remote-access messages and the client contract used to reach the master.

use crate::error::{ErrorCode, RemoteError, RemoteResult};
use parking_lot::Mutex;
use replidb_core::{InsertRecord, InsertRecordGroup, Lsn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;

/// One key mutation carried by a forwarded insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Target index.
    pub index: u32,
    /// Key bytes.
    pub key: Vec<u8>,
    /// New value, or `None` to delete.
    pub value: Option<Vec<u8>>,
}

impl From<&InsertRecord> for RemoteRecord {
    fn from(record: &InsertRecord) -> Self {
        Self {
            index: record.index,
            key: record.key.clone(),
            value: record.value.clone(),
        }
    }
}

/// A request served by the master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteRequest {
    /// Resolve a database name to its id.
    GetDatabaseByName {
        /// Database name.
        name: String,
    },
    /// Resolve a database id to its name.
    GetDatabaseById {
        /// Database id.
        id: u32,
    },
    /// List every database.
    GetDatabases,
    /// Point lookup.
    Lookup {
        /// Database name.
        database: String,
        /// Index.
        index: u32,
        /// Key.
        key: Vec<u8>,
    },
    /// Prefix lookup.
    PrefixLookup {
        /// Database name.
        database: String,
        /// Index.
        index: u32,
        /// Key prefix.
        prefix: Vec<u8>,
    },
    /// Insert a record group.
    Insert {
        /// Database name.
        database: String,
        /// Mutations of the group, in order.
        records: Vec<RemoteRecord>,
    },
}

impl RemoteRequest {
    /// Builds an insert request from a record group.
    #[must_use]
    pub fn insert(database: &str, group: &InsertRecordGroup) -> Self {
        Self::Insert {
            database: database.to_string(),
            records: group.records().iter().map(RemoteRecord::from).collect(),
        }
    }
}

/// The master's answer to a [`RemoteRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteResponse {
    /// A database id.
    DatabaseId(u32),
    /// A database name.
    DatabaseName(String),
    /// Every database name with its id.
    Databases(BTreeMap<String, u32>),
    /// A looked-up value.
    Value(Option<Vec<u8>>),
    /// Key/value pairs in key order.
    Entries(Vec<(Vec<u8>, Vec<u8>)>),
    /// LSN assigned to an insert.
    Inserted {
        /// View id.
        view_id: u32,
        /// Sequence number.
        sequence_no: u64,
    },
    /// The request failed.
    Error {
        /// Error code.
        code: ErrorCode,
        /// Description.
        message: String,
    },
}

impl RemoteResponse {
    fn kind(&self) -> &'static str {
        match self {
            Self::DatabaseId(_) => "database id",
            Self::DatabaseName(_) => "database name",
            Self::Databases(_) => "databases",
            Self::Value(_) => "value",
            Self::Entries(_) => "entries",
            Self::Inserted { .. } => "inserted",
            Self::Error { .. } => "error",
        }
    }

    /// Turns an `Error` response into a `RemoteError::Code`.
    fn into_result(self) -> RemoteResult<Self> {
        match self {
            Self::Error { code, message } => Err(RemoteError::code(code, message)),
            other => Ok(other),
        }
    }
}

fn unexpected(expected: &'static str, actual: &RemoteResponse) -> RemoteError {
    RemoteError::UnexpectedResponse {
        expected,
        actual: actual.kind(),
    }
}

/// Client used to forward requests to the master.
///
/// Implementors provide [`RemoteAccessClient::call`]; the typed methods
/// decode the matching response kind. Every call must respect a bounded
/// timeout and report its expiry as [`RemoteError::Timeout`].
pub trait RemoteAccessClient: Send + Sync {
    /// Sends a request to `master` and waits for its response.
    ///
    /// # Errors
    ///
    /// Returns a transport, codec or timeout error. An `Error` response is
    /// returned as `Ok`; the typed methods convert it.
    fn call(&self, master: SocketAddr, request: RemoteRequest) -> RemoteResult<RemoteResponse>;

    /// Resolves a database name to its id on the master.
    ///
    /// # Errors
    ///
    /// `DbUnavailable` if the master has no such database.
    fn get_database_by_name(&self, name: &str, master: SocketAddr) -> RemoteResult<u32> {
        let request = RemoteRequest::GetDatabaseByName {
            name: name.to_string(),
        };
        match self.call(master, request)?.into_result()? {
            RemoteResponse::DatabaseId(id) => Ok(id),
            other => Err(unexpected("database id", &other)),
        }
    }

    /// Resolves a database id to its name on the master.
    ///
    /// # Errors
    ///
    /// `DbUnavailable` if the master has no such database.
    fn get_database_by_id(&self, id: u32, master: SocketAddr) -> RemoteResult<String> {
        match self
            .call(master, RemoteRequest::GetDatabaseById { id })?
            .into_result()?
        {
            RemoteResponse::DatabaseName(name) => Ok(name),
            other => Err(unexpected("database name", &other)),
        }
    }

    /// Lists the master's databases.
    ///
    /// # Errors
    ///
    /// Any remote failure.
    fn get_databases(&self, master: SocketAddr) -> RemoteResult<BTreeMap<String, u32>> {
        match self.call(master, RemoteRequest::GetDatabases)?.into_result()? {
            RemoteResponse::Databases(map) => Ok(map),
            other => Err(unexpected("databases", &other)),
        }
    }

    /// Looks up a key on the master.
    ///
    /// # Errors
    ///
    /// Any remote failure.
    fn lookup(
        &self,
        database: &str,
        index: u32,
        key: &[u8],
        master: SocketAddr,
    ) -> RemoteResult<Option<Vec<u8>>> {
        let request = RemoteRequest::Lookup {
            database: database.to_string(),
            index,
            key: key.to_vec(),
        };
        match self.call(master, request)?.into_result()? {
            RemoteResponse::Value(value) => Ok(value),
            other => Err(unexpected("value", &other)),
        }
    }

    /// Runs a prefix lookup on the master.
    ///
    /// # Errors
    ///
    /// Any remote failure.
    fn prefix_lookup(
        &self,
        database: &str,
        index: u32,
        prefix: &[u8],
        master: SocketAddr,
    ) -> RemoteResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let request = RemoteRequest::PrefixLookup {
            database: database.to_string(),
            index,
            prefix: prefix.to_vec(),
        };
        match self.call(master, request)?.into_result()? {
            RemoteResponse::Entries(entries) => Ok(entries),
            other => Err(unexpected("entries", &other)),
        }
    }

    /// Inserts a record group on the master.
    ///
    /// # Errors
    ///
    /// Any remote failure.
    fn insert(
        &self,
        database: &str,
        group: &InsertRecordGroup,
        master: SocketAddr,
    ) -> RemoteResult<Lsn> {
        match self
            .call(master, RemoteRequest::insert(database, group))?
            .into_result()?
        {
            RemoteResponse::Inserted {
                view_id,
                sequence_no,
            } => Ok(Lsn::new(view_id, sequence_no)),
            other => Err(unexpected("inserted", &other)),
        }
    }
}

/// A client that answers from a queue of canned responses.
#[derive(Debug, Default)]
pub struct MockClient {
    responses: Mutex<VecDeque<RemoteResult<RemoteResponse>>>,
    requests: Mutex<Vec<(SocketAddr, RemoteRequest)>>,
}

impl MockClient {
    /// Creates a client with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response.
    pub fn push_response(&self, response: RemoteResponse) {
        self.responses.lock().push_back(Ok(response));
    }

    /// Queues a failure.
    pub fn push_error(&self, error: RemoteError) {
        self.responses.lock().push_back(Err(error));
    }

    /// Returns every request received so far.
    pub fn requests(&self) -> Vec<(SocketAddr, RemoteRequest)> {
        self.requests.lock().clone()
    }
}

impl RemoteAccessClient for MockClient {
    fn call(&self, master: SocketAddr, request: RemoteRequest) -> RemoteResult<RemoteResponse> {
        self.requests.lock().push((master, request));
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(RemoteError::Transport("no mock response queued".into())))
    }
}
