//! Core type definitions for replidb.

use std::fmt;

/// Log sequence number: a position in the replicated write stream.
///
/// Ordered by view first, then by sequence number. A view is an epoch of
/// mastership; a new view restarts sequence numbers at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn {
    view_id: u32,
    sequence_no: u64,
}

impl Lsn {
    /// The position before anything was ever logged.
    pub const ZERO: Self = Self::new(0, 0);

    /// The first LSN a freshly initialized engine hands out.
    pub const FIRST: Self = Self::new(1, 1);

    /// Creates an LSN.
    #[must_use]
    pub const fn new(view_id: u32, sequence_no: u64) -> Self {
        Self {
            view_id,
            sequence_no,
        }
    }

    /// Returns the view id.
    #[must_use]
    pub const fn view_id(self) -> u32 {
        self.view_id
    }

    /// Returns the sequence number within the view.
    #[must_use]
    pub const fn sequence_no(self) -> u64 {
        self.sequence_no
    }

    /// Returns the next LSN in the same view, saturating at `u64::MAX`.
    ///
    /// Use [`Lsn::checked_next`] for LSNs read from disk.
    #[must_use]
    pub const fn next(self) -> Self {
        Self::new(self.view_id, self.sequence_no.saturating_add(1))
    }

    /// Returns the next LSN in the same view, or `None` if the sequence
    /// numbers of the view are exhausted.
    #[must_use]
    pub const fn checked_next(self) -> Option<Self> {
        match self.sequence_no.checked_add(1) {
            Some(sequence_no) => Some(Self::new(self.view_id, sequence_no)),
            None => None,
        }
    }

    /// Returns the LSN one step before this one in the same view.
    ///
    /// `(v, 0).prev()` stays at `(v, 0)`.
    #[must_use]
    pub const fn prev(self) -> Self {
        Self::new(self.view_id, self.sequence_no.saturating_sub(1))
    }

    /// Parses the `view.sequence` form produced by `Display`.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let (view, seq) = text.split_once('.')?;
        Some(Self::new(view.parse().ok()?, seq.parse().ok()?))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.view_id, self.sequence_no)
    }
}

/// Identifier for a database.
///
/// Database ids are assigned from a persistent counter and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DatabaseId(pub u32);

impl DatabaseId {
    /// Creates a new database ID.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "db:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn view_dominates_sequence() {
        assert!(Lsn::new(1, 1_000) < Lsn::new(2, 1));
        assert!(Lsn::new(1, 7) < Lsn::new(1, 8));
        assert!(Lsn::ZERO < Lsn::FIRST);
    }

    #[test]
    fn next_and_prev() {
        let lsn = Lsn::new(3, 9);
        assert_eq!(lsn.next(), Lsn::new(3, 10));
        assert_eq!(lsn.prev(), Lsn::new(3, 8));
        assert_eq!(Lsn::new(2, 0).prev(), Lsn::new(2, 0));
    }

    #[test]
    fn next_at_the_end_of_a_view() {
        let last = Lsn::new(1, u64::MAX);
        assert_eq!(last.checked_next(), None);
        assert_eq!(last.next(), last);
        assert_eq!(Lsn::new(1, 5).checked_next(), Some(Lsn::new(1, 6)));
    }

    #[test]
    fn display_and_parse() {
        let lsn = Lsn::new(4, 120);
        assert_eq!(lsn.to_string(), "4.120");
        assert_eq!(Lsn::parse("4.120"), Some(lsn));
        assert_eq!(Lsn::parse("4"), None);
        assert_eq!(Lsn::parse("a.1"), None);
    }

    #[test]
    fn database_id_display() {
        assert_eq!(DatabaseId::new(7).to_string(), "db:7");
    }

    proptest! {
        #[test]
        fn order_matches_tuple_order(a in any::<(u32, u64)>(), b in any::<(u32, u64)>()) {
            let (x, y) = (Lsn::new(a.0, a.1), Lsn::new(b.0, b.1));
            prop_assert_eq!(x.cmp(&y), a.cmp(&b));
        }
    }
}
