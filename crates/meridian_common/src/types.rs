use std::fmt;

use serde::{Deserialize, Serialize};

/// Transaction identifier.
///
/// Ids are 64-bit and never wrap, so ordering is plain integer ordering.
/// Values below [`Xid::FIRST_NORMAL`] are permanent ids with fixed meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Xid(pub u64);

impl Xid {
    pub const INVALID: Xid = Xid(0);
    pub const BOOTSTRAP: Xid = Xid(1);
    pub const FROZEN: Xid = Xid(2);
    pub const FIRST_NORMAL: Xid = Xid(3);

    pub fn is_valid(self) -> bool {
        self != Xid::INVALID
    }

    /// True for ids handed out to ordinary transactions.
    pub fn is_normal(self) -> bool {
        self.0 >= Xid::FIRST_NORMAL.0
    }

    pub fn precedes(self, other: Xid) -> bool {
        self.0 < other.0
    }

    pub fn follows_or_equals(self, other: Xid) -> bool {
        self.0 >= other.0
    }

    pub fn next(self) -> Xid {
        Xid(self.0 + 1)
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Commit sequence number.
///
/// A CSN is a wall-clock reading in nanoseconds since the Unix epoch, forced
/// strictly increasing by the generator. Snapshots carry one as their
/// visibility boundary.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Csn(pub u64);

impl Csn {
    pub const NSECS_PER_SEC: u64 = 1_000_000_000;

    /// Whole seconds, rounded down.
    pub fn seconds(self) -> u64 {
        self.0 / Self::NSECS_PER_SEC
    }

    pub fn from_secs(secs: u64) -> Csn {
        Csn(secs.saturating_mul(Self::NSECS_PER_SEC))
    }

    pub fn plus_secs(self, secs: u64) -> Csn {
        Csn(self.0.saturating_add(secs.saturating_mul(Self::NSECS_PER_SEC)))
    }

    /// True for values that can be stored as a commit CSN: above the
    /// sentinel encodings and below the top of the range, so the generator
    /// can still step past it.
    pub fn is_normal(self) -> bool {
        self.0 >= XidCsn::FIRST_NORMAL_RAW && self.0 < u64::MAX
    }
}

impl fmt::Display for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The commit state recorded for one transaction id.
///
/// Sentinels are never compared numerically with concrete CSNs; callers match
/// on the variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XidCsn {
    /// Still running (or never recorded).
    InProgress,
    /// Removed from the running set, final CSN not yet published.
    InDoubt,
    Aborted,
    /// Permanently visible: bootstrap/frozen ids and ids below the horizon.
    Frozen,
    Committed(Csn),
}

impl XidCsn {
    const RAW_IN_PROGRESS: u64 = 0;
    const RAW_ABORTED: u64 = 1;
    const RAW_FROZEN: u64 = 2;
    const RAW_IN_DOUBT: u64 = 3;

    /// Smallest raw value that encodes a concrete CSN.
    pub const FIRST_NORMAL_RAW: u64 = 4;

    /// Encoding used by per-backend atomic slots and the CSN log.
    pub fn to_raw(self) -> u64 {
        match self {
            XidCsn::InProgress => Self::RAW_IN_PROGRESS,
            XidCsn::Aborted => Self::RAW_ABORTED,
            XidCsn::Frozen => Self::RAW_FROZEN,
            XidCsn::InDoubt => Self::RAW_IN_DOUBT,
            XidCsn::Committed(csn) => csn.0,
        }
    }

    pub fn from_raw(raw: u64) -> XidCsn {
        match raw {
            Self::RAW_IN_PROGRESS => XidCsn::InProgress,
            Self::RAW_ABORTED => XidCsn::Aborted,
            Self::RAW_FROZEN => XidCsn::Frozen,
            Self::RAW_IN_DOUBT => XidCsn::InDoubt,
            csn => XidCsn::Committed(Csn(csn)),
        }
    }

    pub fn is_in_progress(self) -> bool {
        matches!(self, XidCsn::InProgress)
    }

    pub fn is_in_doubt(self) -> bool {
        matches!(self, XidCsn::InDoubt)
    }

    pub fn is_aborted(self) -> bool {
        matches!(self, XidCsn::Aborted)
    }

    pub fn is_frozen(self) -> bool {
        matches!(self, XidCsn::Frozen)
    }

    pub fn csn(self) -> Option<Csn> {
        match self {
            XidCsn::Committed(csn) => Some(csn),
            _ => None,
        }
    }
}

impl fmt::Display for XidCsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XidCsn::InProgress => write!(f, "in-progress"),
            XidCsn::InDoubt => write!(f, "in-doubt"),
            XidCsn::Aborted => write!(f, "aborted"),
            XidCsn::Frozen => write!(f, "frozen"),
            XidCsn::Committed(csn) => write!(f, "committed@{csn}"),
        }
    }
}

/// Catalog id of a foreign server definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerId(pub u32);

/// Catalog id of a local role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub u32);

/// Catalog id of a user mapping: the identity a remote connection is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserMappingId(pub u32);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for UserMappingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Isolation level of the local transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// True when one snapshot is held for the whole transaction.
    pub fn uses_xact_snapshot(self) -> bool {
        matches!(self, IsolationLevel::RepeatableRead | IsolationLevel::Serializable)
    }

    pub fn is_serializable(self) -> bool {
        matches!(self, IsolationLevel::Serializable)
    }
}
