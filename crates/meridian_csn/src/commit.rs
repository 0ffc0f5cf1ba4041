//! Local commit/abort protocol around the CSN log.
//!
//! Commit goes through three steps:
//!
//! 1. `precommit`: mark the transaction in-doubt in its slot and the log,
//!    before it leaves the running set.
//! 2. [`ProcArray::end_transaction`](crate::proc_array::ProcArray::end_transaction):
//!    leave the running set and fix the commit CSN under the same lock.
//! 3. `commit`: publish the CSN to the log for the xid and all subxids.
//!
//! Readers that meet the in-doubt marker between 1 and 3 wait on the
//! transaction's lock and re-read.

use std::sync::Arc;

use meridian_common::error::CsnError;
use meridian_common::types::{Csn, Xid, XidCsn};

use crate::clock::CsnGenerator;
use crate::csn_log::CsnLog;
use crate::proc_array::ProcSlot;

pub struct CommitProtocol {
    log: Arc<dyn CsnLog>,
    enabled: bool,
}

impl CommitProtocol {
    pub fn new(log: Arc<dyn CsnLog>, enabled: bool) -> Self {
        Self { log, enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Mark `xid` in-doubt. A slot that already carries a CSN was decided by
    /// the global commit path and is left alone. An in-doubt slot (global
    /// prepare, or an earlier attempt that failed) is logged again.
    pub fn precommit(&self, slot: &ProcSlot, xid: Xid, subxids: &[Xid]) -> Result<(), CsnError> {
        if !self.enabled || !xid.is_valid() {
            return Ok(());
        }
        match slot.compare_exchange(XidCsn::InProgress, XidCsn::InDoubt) {
            Ok(_) | Err(XidCsn::InDoubt) => self.log.set_csn(xid, subxids, XidCsn::InDoubt),
            Err(XidCsn::Committed(_)) => {
                debug_assert!(matches!(self.log.get_csn(xid), Ok(XidCsn::InDoubt)));
                Ok(())
            }
            Err(other) => Err(CsnError::UnexpectedXidCsn {
                xid,
                state: other.to_string(),
            }),
        }
    }

    /// Publish the CSN decided in the slot for `xid` and its subxids, then
    /// reset the slot.
    pub fn commit(
        &self,
        slot: &ProcSlot,
        xid: Xid,
        subxids: &[Xid],
    ) -> Result<Option<Csn>, CsnError> {
        if !self.enabled || !xid.is_valid() {
            return Ok(None);
        }
        let assigned = slot.load();
        let csn = assigned.csn().ok_or_else(|| CsnError::UnexpectedXidCsn {
            xid,
            state: assigned.to_string(),
        })?;
        self.log.set_csn(xid, subxids, XidCsn::Committed(csn))?;
        slot.store(XidCsn::InProgress);
        tracing::trace!(xid = xid.0, csn = csn.0, subxacts = subxids.len(), "transaction committed");
        Ok(Some(csn))
    }

    /// Record the abort for `xid` and its subxids and reset the slot. Must
    /// run before the transaction leaves the running set.
    pub fn abort(&self, slot: &ProcSlot, xid: Xid, subxids: &[Xid]) -> Result<(), CsnError> {
        if !self.enabled || !xid.is_valid() {
            return Ok(());
        }
        self.log.set_csn(xid, subxids, XidCsn::Aborted)?;
        slot.store(XidCsn::InProgress);
        Ok(())
    }

    /// Participant side of a global commit: mark the prepared transaction
    /// in-doubt and propose a local CSN for it.
    pub fn prepare_global(
        &self,
        slot: &ProcSlot,
        xid: Xid,
        subxids: &[Xid],
        generator: &CsnGenerator,
    ) -> Result<Csn, CsnError> {
        if !self.enabled {
            return Err(CsnError::Disabled);
        }
        match slot.compare_exchange(XidCsn::InProgress, XidCsn::InDoubt) {
            Ok(_) => self.log.set_csn(xid, subxids, XidCsn::InDoubt)?,
            Err(XidCsn::InDoubt) => {}
            Err(other) => {
                return Err(CsnError::UnexpectedXidCsn {
                    xid,
                    state: other.to_string(),
                })
            }
        }
        generator.generate()
    }

    /// Fix the agreed global CSN in the slot; the later commit publishes it.
    /// The local clock state is advanced so later CSNs stay above it.
    pub fn assign_global(
        &self,
        slot: &ProcSlot,
        xid: Xid,
        csn: Csn,
        generator: &CsnGenerator,
    ) -> Result<(), CsnError> {
        if !self.enabled {
            return Err(CsnError::Disabled);
        }
        if !csn.is_normal() {
            return Err(CsnError::InvalidCsn(csn));
        }
        match slot.load() {
            XidCsn::InDoubt | XidCsn::Committed(_) => {}
            other => {
                return Err(CsnError::UnexpectedXidCsn {
                    xid,
                    state: other.to_string(),
                })
            }
        }
        generator.advance_to(csn);
        slot.store(XidCsn::Committed(csn));
        Ok(())
    }
}
