//! Collaborator seams for durable CSN storage.
//!
//! The on-disk commit-status log and the WAL live outside this crate; the
//! protocol only needs "set CSN for xid", "get CSN for xid" and "log this
//! CSN". In-memory implementations back tests and embedded use.

use dashmap::DashMap;
use parking_lot::Mutex;

use meridian_common::error::CsnError;
use meridian_common::types::{Csn, Xid, XidCsn};

/// Commit-status log keyed by transaction id.
pub trait CsnLog: Send + Sync {
    /// Record `csn` for a top-level transaction and all of its
    /// subtransactions as one batch.
    fn set_csn(&self, xid: Xid, subxids: &[Xid], csn: XidCsn) -> Result<(), CsnError>;

    /// Stored state for `xid`; ids never written read as `InProgress`.
    fn get_csn(&self, xid: Xid) -> Result<XidCsn, CsnError>;
}

/// Write-ahead logging of CSN assignments.
pub trait CsnWal: Send + Sync {
    /// Durably record that CSNs up to `csn` may have been handed out.
    fn log_csn_assignment(&self, csn: Csn) -> Result<(), CsnError>;
}

/// In-memory commit-status log.
#[derive(Default)]
pub struct MemCsnLog {
    entries: DashMap<Xid, u64>,
}

impl MemCsnLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop entries for ids that precede `oldest`. Lookups below the CSN
    /// horizon never reach the log, so they are safe to forget.
    pub fn truncate(&self, oldest: Xid) {
        self.entries.retain(|xid, _| !xid.precedes(oldest));
    }
}

impl CsnLog for MemCsnLog {
    fn set_csn(&self, xid: Xid, subxids: &[Xid], csn: XidCsn) -> Result<(), CsnError> {
        let raw = csn.to_raw();
        // Subtransactions first, so a reader that sees the top-level state
        // also sees every child in the same state.
        for sub in subxids {
            self.entries.insert(*sub, raw);
        }
        self.entries.insert(xid, raw);
        Ok(())
    }

    fn get_csn(&self, xid: Xid) -> Result<XidCsn, CsnError> {
        Ok(self
            .entries
            .get(&xid)
            .map(|raw| XidCsn::from_raw(*raw))
            .unwrap_or(XidCsn::InProgress))
    }
}

/// In-memory WAL sink remembering every logged assignment.
#[derive(Default)]
pub struct MemCsnWal {
    records: Mutex<Vec<Csn>>,
}

impl MemCsnWal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_logged(&self) -> Option<Csn> {
        self.records.lock().last().copied()
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().len()
    }
}

impl CsnWal for MemCsnWal {
    fn log_csn_assignment(&self, csn: Csn) -> Result<(), CsnError> {
        self.records.lock().push(csn);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwritten_xid_reads_in_progress() {
        let log = MemCsnLog::new();
        assert_eq!(log.get_csn(Xid(42)).unwrap(), XidCsn::InProgress);
    }

    #[test]
    fn test_set_csn_covers_subtransactions() {
        let log = MemCsnLog::new();
        let csn = XidCsn::Committed(Csn(1_000));
        log.set_csn(Xid(10), &[Xid(11), Xid(12)], csn).unwrap();
        assert_eq!(log.get_csn(Xid(10)).unwrap(), csn);
        assert_eq!(log.get_csn(Xid(11)).unwrap(), csn);
        assert_eq!(log.get_csn(Xid(12)).unwrap(), csn);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_truncate_keeps_newer_entries() {
        let log = MemCsnLog::new();
        log.set_csn(Xid(5), &[], XidCsn::Aborted).unwrap();
        log.set_csn(Xid(9), &[], XidCsn::Aborted).unwrap();
        log.truncate(Xid(6));
        assert_eq!(log.get_csn(Xid(5)).unwrap(), XidCsn::InProgress);
        assert_eq!(log.get_csn(Xid(9)).unwrap(), XidCsn::Aborted);
    }
}
