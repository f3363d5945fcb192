//! Master-side dispatcher for forwarded requests.

use crate::error::ErrorCode;
use crate::loopback::{decode, encode, RequestService};
use crate::remote::{RemoteRequest, RemoteResponse};
use replidb_core::{CoreError, CoreResult, DatabaseId, DatabaseManager};
use tracing::{debug, warn};

/// Serves [`RemoteRequest`]s against the local engine.
#[derive(Debug, Clone)]
pub struct RemoteAccessHandler {
    manager: DatabaseManager,
}

impl RemoteAccessHandler {
    /// Creates a handler serving `manager`.
    #[must_use]
    pub fn new(manager: DatabaseManager) -> Self {
        Self { manager }
    }

    /// Serves one request. Failures are reported as `Error` responses.
    #[must_use]
    pub fn handle(&self, request: RemoteRequest) -> RemoteResponse {
        debug!(request = ?request, "serving remote request");
        self.dispatch(request).unwrap_or_else(|e| {
            let code = error_code(&e);
            if code != ErrorCode::DbUnavailable {
                warn!(error = %e, code = ?code, "remote request failed");
            }
            RemoteResponse::Error {
                code,
                message: e.to_string(),
            }
        })
    }

    fn dispatch(&self, request: RemoteRequest) -> CoreResult<RemoteResponse> {
        let manager = &self.manager;
        let response = match request {
            RemoteRequest::GetDatabaseByName { name } => {
                RemoteResponse::DatabaseId(manager.get_database(&name)?.id().as_u32())
            }
            RemoteRequest::GetDatabaseById { id } => RemoteResponse::DatabaseName(
                manager
                    .get_database_by_id(DatabaseId::new(id))?
                    .name()
                    .to_string(),
            ),
            RemoteRequest::GetDatabases => RemoteResponse::Databases(
                manager
                    .databases()
                    .into_iter()
                    .map(|(name, id)| (name, id.as_u32()))
                    .collect(),
            ),
            RemoteRequest::Lookup {
                database,
                index,
                key,
            } => RemoteResponse::Value(manager.get_database(&database)?.lookup(index as usize, &key)?),
            RemoteRequest::PrefixLookup {
                database,
                index,
                prefix,
            } => RemoteResponse::Entries(
                manager
                    .get_database(&database)?
                    .prefix_lookup(index as usize, &prefix)?,
            ),
            RemoteRequest::Insert { database, records } => {
                let db = manager.get_database(&database)?;
                let mut group = db.create_insert_group();
                for record in records {
                    match record.value {
                        Some(value) => group.add_insert(record.index, record.key, value),
                        None => group.add_delete(record.index, record.key),
                    };
                }
                let lsn = db.insert(group)?;
                RemoteResponse::Inserted {
                    view_id: lsn.view_id(),
                    sequence_no: lsn.sequence_no(),
                }
            }
        };
        Ok(response)
    }
}

impl RequestService for RemoteAccessHandler {
    fn serve(&self, body: &[u8]) -> Result<Vec<u8>, String> {
        let request: RemoteRequest = decode(body).map_err(|e| e.to_string())?;
        encode(&self.handle(request)).map_err(|e| e.to_string())
    }
}

fn error_code(err: &CoreError) -> ErrorCode {
    match err {
        CoreError::NoSuchDatabase { .. } => ErrorCode::DbUnavailable,
        CoreError::ShuttingDown => ErrorCode::ServiceUnavailable,
        CoreError::ReplicationUnavailable { .. } => ErrorCode::ServiceUnavailable,
        CoreError::Io(_) | CoreError::Storage(_) => ErrorCode::InternalError,
        _ => ErrorCode::Unknown,
    }
}
