//! Integration tests: a replica routing through a loopback transport to a
//! master engine.

use replidb_core::{Config, CoreError, Engine, Lsn};
use replidb_replication::{
    LoopbackClient, MasterOnly, RemoteAccessHandler, ReplicatedDatabaseManager, ReplicationConfig,
    RequestService, StaticMaster, SwitchableMaster, WriteRestriction,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

const MASTER: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), 7001);
const REPLICA: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), 7002);

/// A service that never answers in time.
struct Unresponsive;

impl RequestService for Unresponsive {
    fn serve(&self, _body: &[u8]) -> Result<Vec<u8>, String> {
        thread::sleep(Duration::from_millis(300));
        Err("unreachable".into())
    }
}

fn replica_manager(
    engine: &Engine,
    config: &ReplicationConfig,
    client: &Arc<LoopbackClient>,
    master: Option<SocketAddr>,
) -> ReplicatedDatabaseManager {
    ReplicatedDatabaseManager::new(
        engine.database_manager(),
        config,
        Arc::new(StaticMaster::new(REPLICA, master)),
        client.clone(),
    )
}

#[test]
fn replica_forwards_to_master() {
    let master_dir = tempdir().unwrap();
    let replica_dir = tempdir().unwrap();
    let master = Engine::open(Config::new(master_dir.path())).unwrap();
    let replica = Engine::open(Config::new(replica_dir.path())).unwrap();

    let users = master.database_manager().create_database("users", 1).unwrap();
    let mut group = users.create_insert_group();
    group.add_insert(0, b"ada".to_vec(), b"lovelace".to_vec());
    users.insert(group).unwrap();

    let client = Arc::new(LoopbackClient::new(Duration::from_secs(2)));
    client.register(MASTER, Arc::new(RemoteAccessHandler::new(master.database_manager())));
    let config = ReplicationConfig::new(REPLICA).with_policy(MasterOnly);
    let manager = replica_manager(&replica, &config, &client, Some(MASTER));

    // The replica has no local databases; the master answers
    let db = manager.get_database("users").unwrap();
    assert_eq!(db.id(), users.id());
    assert_eq!(db.lookup(0, b"ada").unwrap(), Some(b"lovelace".to_vec()));

    let mut group = db.create_insert_group();
    group.add_insert(0, b"alan".to_vec(), b"turing".to_vec());
    let lsn = db.insert(group).unwrap();
    assert_eq!(lsn, Lsn::new(1, 3));
    assert_eq!(users.lookup(0, b"alan").unwrap(), Some(b"turing".to_vec()));

    let entries = db.prefix_lookup(0, b"a").unwrap();
    assert_eq!(entries.len(), 2);

    let listing = manager.databases().unwrap();
    assert_eq!(listing.get("users"), Some(&users.id()));
    assert_eq!(manager.get_database_by_id(users.id()).unwrap().name(), "users");

    // Nothing was logged on the replica
    assert_eq!(replica.next_lsn().unwrap(), Lsn::FIRST);
}

#[test]
fn missing_database_on_master_is_no_such_database() {
    let master_dir = tempdir().unwrap();
    let replica_dir = tempdir().unwrap();
    let master = Engine::open(Config::new(master_dir.path())).unwrap();
    let replica = Engine::open(Config::new(replica_dir.path())).unwrap();

    // Exists locally only; the master is authoritative
    replica.database_manager().create_database("x", 1).unwrap();

    let client = Arc::new(LoopbackClient::new(Duration::from_secs(2)));
    client.register(MASTER, Arc::new(RemoteAccessHandler::new(master.database_manager())));
    let manager = replica_manager(&replica, &ReplicationConfig::new(REPLICA), &client, Some(MASTER));

    assert!(matches!(
        manager.get_database("x"),
        Err(CoreError::NoSuchDatabase { name }) if name == "x"
    ));
}

#[test]
fn master_timeout_is_replication_failure() {
    let replica_dir = tempdir().unwrap();
    let replica = Engine::open(Config::new(replica_dir.path())).unwrap();

    let client = Arc::new(LoopbackClient::new(Duration::from_millis(30)));
    client.register(MASTER, Arc::new(Unresponsive));
    let manager = replica_manager(&replica, &ReplicationConfig::new(REPLICA), &client, Some(MASTER));

    let err = manager.get_database("users").unwrap_err();
    assert!(matches!(err, CoreError::ReplicationFailure { .. }));
    assert!(err.to_string().contains("timed out"));
}

#[test]
fn unreachable_master_is_replication_failure() {
    let replica_dir = tempdir().unwrap();
    let replica = Engine::open(Config::new(replica_dir.path())).unwrap();
    let client = Arc::new(LoopbackClient::new(Duration::from_secs(1)));
    let manager = replica_manager(&replica, &ReplicationConfig::new(REPLICA), &client, Some(MASTER));

    assert!(matches!(
        manager.get_database("users"),
        Err(CoreError::ReplicationFailure { .. })
    ));
}

#[test]
fn role_change_takes_effect_on_next_call() {
    let master_dir = tempdir().unwrap();
    let replica_dir = tempdir().unwrap();
    let master = Engine::open(Config::new(master_dir.path())).unwrap();
    let replica = Engine::open(Config::new(replica_dir.path())).unwrap();
    master.database_manager().create_database("users", 1).unwrap();

    let client = Arc::new(LoopbackClient::new(Duration::from_secs(2)));
    client.register(MASTER, Arc::new(RemoteAccessHandler::new(master.database_manager())));
    let resolver = Arc::new(SwitchableMaster::new(REPLICA));
    let config = ReplicationConfig::new(REPLICA).with_policy(WriteRestriction);
    let manager = ReplicatedDatabaseManager::new(
        replica.database_manager(),
        &config,
        resolver.clone(),
        client.clone(),
    );

    assert!(matches!(
        manager.create_database("local", 1),
        Err(CoreError::ReplicationUnavailable { .. })
    ));

    resolver.set_master(MASTER);
    assert!(matches!(
        manager.create_database("local", 1),
        Err(CoreError::UnsupportedOnReplica { .. })
    ));
    assert!(manager.get_database("users").is_ok());

    // This node is elected
    resolver.set_master(REPLICA);
    let db = manager.create_database("local", 1).unwrap();
    let mut group = db.create_insert_group();
    group.add_insert(0, b"k".to_vec(), b"v".to_vec());
    assert_eq!(db.insert(group).unwrap(), Lsn::new(1, 2));
    assert!(manager.get_database("users").is_err());
}
