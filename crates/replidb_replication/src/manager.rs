//! Replication-aware database manager and database handles.
//!
//! Every call resolves a [`Route`] first. `Local` delegates to the engine
//! and passes its errors through unchanged; `Remote` forwards the call to
//! the master and translates the failure.

use crate::config::ReplicationConfig;
use crate::policy::OperationKind;
use crate::remote::RemoteAccessClient;
use crate::resolver::MasterResolver;
use crate::router::{Route, Router};
use parking_lot::ReentrantMutexGuard;
use replidb_core::{
    CoreError, CoreResult, Database, DatabaseId, DatabaseManager, DatabaseRecord,
    InsertRecordGroup, Lsn,
};
use replidb_storage::KeyValue;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Shared by the manager and its handles.
struct Context {
    local: DatabaseManager,
    router: Router,
    client: Arc<dyn RemoteAccessClient>,
}

impl Context {
    fn route(&self, kind: OperationKind) -> CoreResult<Route> {
        self.router.resolve(kind)
    }
}

/// A [`DatabaseManager`] that serves master-restricted operations from the
/// current master.
#[derive(Clone)]
pub struct ReplicatedDatabaseManager {
    context: Arc<Context>,
}

impl ReplicatedDatabaseManager {
    /// Wraps `local`, resolving the master through `resolver` and reaching
    /// it through `client`.
    pub fn new(
        local: DatabaseManager,
        config: &ReplicationConfig,
        resolver: Arc<dyn MasterResolver>,
        client: Arc<dyn RemoteAccessClient>,
    ) -> Self {
        Self {
            context: Arc::new(Context {
                local,
                router: Router::new(resolver, Arc::clone(&config.policy)),
                client,
            }),
        }
    }

    /// Returns the router used for every call.
    #[must_use]
    pub fn router(&self) -> &Router {
        &self.context.router
    }

    /// Returns the local manager.
    #[must_use]
    pub fn local(&self) -> &DatabaseManager {
        &self.context.local
    }

    fn management_route(&self) -> CoreResult<Route> {
        self.context.route(OperationKind::DatabaseModification)
    }

    /// Fails with `UnsupportedOnReplica` unless this node may modify
    /// databases itself.
    fn require_local(&self, operation: &'static str) -> CoreResult<()> {
        match self.management_route()? {
            Route::Local => Ok(()),
            Route::Remote(master) => {
                debug!(operation, master = %master, "rejected on replica");
                Err(CoreError::UnsupportedOnReplica { operation })
            }
        }
    }

    /// Looks up a database by name, on the master if required.
    ///
    /// # Errors
    ///
    /// - `NoSuchDatabase` if the (local or remote) master has no such database
    /// - `ReplicationUnavailable` if no master is known
    /// - `ReplicationFailure` for any other remote failure
    pub fn get_database(&self, name: &str) -> CoreResult<ReplicatedDatabase> {
        match self.management_route()? {
            Route::Local => {
                let db = self.context.local.get_database(name)?;
                Ok(self.handle(db.name(), db.id()))
            }
            Route::Remote(master) => {
                let id = self
                    .context
                    .client
                    .get_database_by_name(name, master)
                    .map_err(|e| e.into_core(name))?;
                Ok(self.handle(name, DatabaseId::new(id)))
            }
        }
    }

    /// Looks up a database by id, on the master if required.
    ///
    /// # Errors
    ///
    /// Same as [`ReplicatedDatabaseManager::get_database`].
    pub fn get_database_by_id(&self, id: DatabaseId) -> CoreResult<ReplicatedDatabase> {
        match self.management_route()? {
            Route::Local => {
                let db = self.context.local.get_database_by_id(id)?;
                Ok(self.handle(db.name(), db.id()))
            }
            Route::Remote(master) => {
                let name = self
                    .context
                    .client
                    .get_database_by_id(id.as_u32(), master)
                    .map_err(|e| e.into_core(&format!("#{}", id.as_u32())))?;
                Ok(self.handle(&name, id))
            }
        }
    }

    /// Returns every database name with its id, from the master if required.
    ///
    /// # Errors
    ///
    /// `ReplicationUnavailable` or `ReplicationFailure`.
    pub fn databases(&self) -> CoreResult<BTreeMap<String, DatabaseId>> {
        match self.management_route()? {
            Route::Local => Ok(self.context.local.databases()),
            Route::Remote(master) => {
                let map = self
                    .context
                    .client
                    .get_databases(master)
                    .map_err(|e| CoreError::replication_failure(e.to_string()))?;
                Ok(map
                    .into_iter()
                    .map(|(name, id)| (name, DatabaseId::new(id)))
                    .collect())
            }
        }
    }

    /// Creates a database. Only the master may do so.
    ///
    /// # Errors
    ///
    /// `UnsupportedOnReplica` on a replica, otherwise as
    /// [`DatabaseManager::create_database`].
    pub fn create_database(&self, name: &str, num_indices: u32) -> CoreResult<ReplicatedDatabase> {
        self.require_local("create_database")?;
        let db = self.context.local.create_database(name, num_indices)?;
        Ok(self.handle(db.name(), db.id()))
    }

    /// Copies a database. Only the master may do so.
    ///
    /// # Errors
    ///
    /// `UnsupportedOnReplica` on a replica, otherwise as
    /// [`DatabaseManager::copy_database`].
    pub fn copy_database(&self, source: &str, dest: &str) -> CoreResult<ReplicatedDatabase> {
        self.require_local("copy_database")?;
        let db = self.context.local.copy_database(source, dest)?;
        Ok(self.handle(db.name(), db.id()))
    }

    /// Deletes a database. Only the master may do so.
    ///
    /// # Errors
    ///
    /// `UnsupportedOnReplica` on a replica, otherwise as
    /// [`DatabaseManager::delete_database`].
    pub fn delete_database(&self, name: &str) -> CoreResult<()> {
        self.require_local("delete_database")?;
        self.context.local.delete_database(name)
    }

    /// Returns the next database id.
    ///
    /// # Errors
    ///
    /// `UnsupportedOnReplica` unless this node may modify databases.
    pub fn next_db_id(&self) -> CoreResult<u32> {
        self.require_local("next_db_id")?;
        Ok(self.context.local.next_db_id())
    }

    /// Overrides the database id counter.
    ///
    /// # Errors
    ///
    /// `UnsupportedOnReplica` unless this node may modify databases.
    pub fn set_next_db_id(&self, id: u32) -> CoreResult<()> {
        self.require_local("set_next_db_id")?;
        self.context.local.set_next_db_id(id)
    }

    /// Returns every database id.
    ///
    /// # Errors
    ///
    /// `UnsupportedOnReplica` unless this node may modify databases.
    pub fn all_database_ids(&self) -> CoreResult<Vec<DatabaseId>> {
        self.require_local("all_database_ids")?;
        Ok(self.context.local.all_database_ids())
    }

    /// Registers a database record directly.
    ///
    /// # Errors
    ///
    /// `UnsupportedOnReplica` unless this node may modify databases.
    pub fn put_database(&self, record: DatabaseRecord) -> CoreResult<()> {
        self.require_local("put_database")?;
        self.context.local.put_database(record)
    }

    /// Deletes a database by id.
    ///
    /// # Errors
    ///
    /// `UnsupportedOnReplica` unless this node may modify databases.
    pub fn remove_database_by_id(&self, id: DatabaseId) -> CoreResult<Option<DatabaseRecord>> {
        self.require_local("remove_database_by_id")?;
        self.context.local.remove_database_by_id(id)
    }

    /// The local metadata lock. Never forwarded.
    pub fn modification_lock(&self) -> ReentrantMutexGuard<'_, ()> {
        self.context.local.modification_lock()
    }

    fn handle(&self, name: &str, id: DatabaseId) -> ReplicatedDatabase {
        ReplicatedDatabase {
            name: name.to_string(),
            id,
            context: Arc::clone(&self.context),
        }
    }
}

impl fmt::Debug for ReplicatedDatabaseManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatedDatabaseManager")
            .field("router", &self.context.router)
            .finish_non_exhaustive()
    }
}

/// Handle to a database that routes each call.
#[derive(Clone)]
pub struct ReplicatedDatabase {
    name: String,
    id: DatabaseId,
    context: Arc<Context>,
}

impl ReplicatedDatabase {
    /// Returns the database name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the database id.
    #[must_use]
    pub fn id(&self) -> DatabaseId {
        self.id
    }

    /// Starts an empty insert group for this database.
    #[must_use]
    pub fn create_insert_group(&self) -> InsertRecordGroup {
        InsertRecordGroup::new(self.id)
    }

    fn local(&self) -> CoreResult<Database> {
        self.context.local.get_database(&self.name)
    }

    /// Inserts a group, on the master if required.
    ///
    /// # Errors
    ///
    /// Local errors pass through; remote failures are translated.
    pub fn insert(&self, group: InsertRecordGroup) -> CoreResult<Lsn> {
        match self.context.route(OperationKind::Insert)? {
            Route::Local => self.local()?.insert(group),
            Route::Remote(master) => self
                .context
                .client
                .insert(&self.name, &group, master)
                .map_err(|e| e.into_core(&self.name)),
        }
    }

    /// Looks up a key, on the master if required.
    ///
    /// # Errors
    ///
    /// Local errors pass through; remote failures are translated.
    pub fn lookup(&self, index: usize, key: &[u8]) -> CoreResult<Option<Vec<u8>>> {
        match self.context.route(OperationKind::Lookup)? {
            Route::Local => self.local()?.lookup(index, key),
            Route::Remote(master) => self
                .context
                .client
                .lookup(&self.name, remote_index(index)?, key, master)
                .map_err(|e| e.into_core(&self.name)),
        }
    }

    /// Returns every entry whose key starts with `prefix`, on the master if
    /// required.
    ///
    /// # Errors
    ///
    /// Local errors pass through; remote failures are translated.
    pub fn prefix_lookup(&self, index: usize, prefix: &[u8]) -> CoreResult<Vec<KeyValue>> {
        match self.context.route(OperationKind::Lookup)? {
            Route::Local => self.local()?.prefix_lookup(index, prefix),
            Route::Remote(master) => self
                .context
                .client
                .prefix_lookup(&self.name, remote_index(index)?, prefix, master)
                .map_err(|e| e.into_core(&self.name)),
        }
    }
}

fn remote_index(index: usize) -> CoreResult<u32> {
    u32::try_from(index).map_err(|_| CoreError::invalid_argument(format!("index {index} out of range")))
}

impl fmt::Debug for ReplicatedDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatedDatabase")
            .field("name", &self.name)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCode, RemoteError};
    use crate::policy::{MasterOnly, WriteRestriction};
    use crate::remote::{MockClient, RemoteResponse};
    use crate::resolver::StaticMaster;
    use replidb_core::{Config, Engine};
    use std::net::SocketAddr;
    use tempfile::{tempdir, TempDir};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    struct Fixture {
        _dir: TempDir,
        engine: Engine,
        client: Arc<MockClient>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let engine = Engine::open(Config::new(dir.path())).unwrap();
            Self {
                _dir: dir,
                engine,
                client: Arc::new(MockClient::new()),
            }
        }

        fn manager(&self, master: Option<SocketAddr>, config: ReplicationConfig) -> ReplicatedDatabaseManager {
            ReplicatedDatabaseManager::new(
                self.engine.database_manager(),
                &config,
                Arc::new(StaticMaster::new(addr(1), master)),
                self.client.clone(),
            )
        }
    }

    #[test]
    fn local_master_serves_everything_locally() {
        let fx = Fixture::new();
        let config = ReplicationConfig::new(addr(1)).with_policy(MasterOnly);
        let manager = fx.manager(Some(addr(1)), config);

        let db = manager.create_database("users", 1).unwrap();
        let mut group = db.create_insert_group();
        group.add_insert(0, b"k".to_vec(), b"v".to_vec());
        db.insert(group).unwrap();
        assert_eq!(db.lookup(0, b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(manager.all_database_ids().unwrap(), vec![db.id()]);
        assert!(fx.client.requests().is_empty());
    }

    #[test]
    fn remote_db_unavailable_is_no_such_database() {
        let fx = Fixture::new();
        let manager = fx.manager(Some(addr(2)), ReplicationConfig::new(addr(1)));
        fx.client.push_response(RemoteResponse::Error {
            code: ErrorCode::DbUnavailable,
            message: "no such database: x".into(),
        });

        assert!(matches!(
            manager.get_database("x"),
            Err(CoreError::NoSuchDatabase { name }) if name == "x"
        ));
    }

    #[test]
    fn remote_transport_failure_is_replication_failure() {
        let fx = Fixture::new();
        let manager = fx.manager(Some(addr(2)), ReplicationConfig::new(addr(1)));
        fx.client.push_error(RemoteError::Transport("connection reset".into()));
        assert!(matches!(
            manager.get_database("x"),
            Err(CoreError::ReplicationFailure { .. })
        ));

        fx.client.push_error(RemoteError::code(ErrorCode::DbUnavailable, "gone"));
        assert!(matches!(
            manager.databases(),
            Err(CoreError::ReplicationFailure { .. })
        ));
    }

    #[test]
    fn administration_is_rejected_on_replicas() {
        let fx = Fixture::new();
        let manager = fx.manager(Some(addr(2)), ReplicationConfig::new(addr(1)));

        assert!(matches!(
            manager.set_next_db_id(5),
            Err(CoreError::UnsupportedOnReplica { operation: "set_next_db_id" })
        ));
        assert!(matches!(
            manager.all_database_ids(),
            Err(CoreError::UnsupportedOnReplica { .. })
        ));
        assert!(matches!(
            manager.put_database(DatabaseRecord::new(DatabaseId::new(9), "x", 1)),
            Err(CoreError::UnsupportedOnReplica { .. })
        ));
        assert!(matches!(
            manager.create_database("x", 1),
            Err(CoreError::UnsupportedOnReplica { .. })
        ));
        assert!(fx.client.requests().is_empty());
    }

    #[test]
    fn no_master_is_replication_unavailable() {
        let fx = Fixture::new();
        let manager = fx.manager(None, ReplicationConfig::new(addr(1)));
        assert!(matches!(
            manager.get_database("x"),
            Err(CoreError::ReplicationUnavailable { .. })
        ));
        assert!(matches!(
            manager.next_db_id(),
            Err(CoreError::ReplicationUnavailable { .. })
        ));
    }

    #[test]
    fn write_restriction_reads_locally_and_writes_remotely() {
        let fx = Fixture::new();
        let local = fx.engine.database_manager().create_database("users", 1).unwrap();
        let mut group = local.create_insert_group();
        group.add_insert(0, b"k".to_vec(), b"replica".to_vec());
        local.insert(group).unwrap();

        let manager = fx.manager(
            Some(addr(2)),
            ReplicationConfig::new(addr(1)).with_policy(WriteRestriction),
        );
        fx.client.push_response(RemoteResponse::DatabaseId(1));
        let db = manager.get_database("users").unwrap();

        assert_eq!(db.lookup(0, b"k").unwrap(), Some(b"replica".to_vec()));

        fx.client.push_response(RemoteResponse::Inserted {
            view_id: 3,
            sequence_no: 12,
        });
        let mut group = db.create_insert_group();
        group.add_insert(0, b"k".to_vec(), b"master".to_vec());
        assert_eq!(db.insert(group).unwrap(), Lsn::new(3, 12));

        // The forwarded insert did not touch the local engine
        assert_eq!(local.lookup(0, b"k").unwrap(), Some(b"replica".to_vec()));
        assert_eq!(fx.client.requests().len(), 2);
    }
}
