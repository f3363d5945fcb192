//! Replication policies: which operations only the master may serve.

use std::fmt;

/// Kinds of operations a policy classifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Creating, copying, deleting or resolving databases, and the
    /// administrative operations on the database registry.
    DatabaseModification,
    /// Inserting a record group.
    Insert,
    /// Point and prefix lookups.
    Lookup,
    /// Creating or deleting persistent snapshots.
    SnapshotManipulation,
}

impl OperationKind {
    /// Every kind, in declaration order.
    pub const ALL: [Self; 4] = [
        Self::DatabaseModification,
        Self::Insert,
        Self::Lookup,
        Self::SnapshotManipulation,
    ];
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DatabaseModification => "database-modification",
            Self::Insert => "insert",
            Self::Lookup => "lookup",
            Self::SnapshotManipulation => "snapshot-manipulation",
        };
        f.write_str(name)
    }
}

/// Decides whether an operation must run on the master.
pub trait ReplicationPolicy: Send + Sync + fmt::Debug {
    /// Returns true if `kind` may only run on the master.
    fn is_master_restricted(&self, kind: OperationKind) -> bool;
}

/// Everything runs on the master.
#[derive(Debug, Clone, Copy, Default)]
pub struct MasterOnly;

impl ReplicationPolicy for MasterOnly {
    fn is_master_restricted(&self, _kind: OperationKind) -> bool {
        true
    }
}

/// Writes run on the master; lookups may be served by any replica.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteRestriction;

impl ReplicationPolicy for WriteRestriction {
    fn is_master_restricted(&self, kind: OperationKind) -> bool {
        !matches!(kind, OperationKind::Lookup)
    }
}

/// Every replica serves everything locally.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRestriction;

impl ReplicationPolicy for NoRestriction {
    fn is_master_restricted(&self, _kind: OperationKind) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policies() {
        for kind in OperationKind::ALL {
            assert!(MasterOnly.is_master_restricted(kind));
            assert!(!NoRestriction.is_master_restricted(kind));
        }
        assert!(!WriteRestriction.is_master_restricted(OperationKind::Lookup));
        assert!(WriteRestriction.is_master_restricted(OperationKind::Insert));
        assert!(WriteRestriction.is_master_restricted(OperationKind::DatabaseModification));
        assert!(WriteRestriction.is_master_restricted(OperationKind::SnapshotManipulation));
    }

    #[test]
    fn kind_display() {
        assert_eq!(OperationKind::Insert.to_string(), "insert");
    }
}
