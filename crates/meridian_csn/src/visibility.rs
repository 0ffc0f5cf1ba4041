//! CSN-based visibility checks.

use std::cell::Cell;
use std::sync::Arc;
use std::time::Instant;

use meridian_common::error::CsnError;
use meridian_common::types::{Xid, XidCsn};
use meridian_observability::record_in_doubt_wait;

use crate::clock::CsnGenerator;
use crate::csn_log::CsnLog;
use crate::proc_array::{Snapshot, XactLockTable};

/// Per-backend visibility oracle.
///
/// Caches the CSN horizon read from the shared clock state on first use.
pub struct VisibilityOracle {
    log: Arc<dyn CsnLog>,
    generator: Arc<CsnGenerator>,
    locks: Arc<XactLockTable>,
    horizon: Cell<Xid>,
}

impl VisibilityOracle {
    pub fn new(
        log: Arc<dyn CsnLog>,
        generator: Arc<CsnGenerator>,
        locks: Arc<XactLockTable>,
    ) -> Self {
        Self {
            log,
            generator,
            locks,
            horizon: Cell::new(Xid::INVALID),
        }
    }

    fn horizon(&self, transaction_xmin: Xid) -> Xid {
        let mut horizon = self.horizon.get();
        if horizon == Xid::INVALID {
            horizon = match self.generator.xmin_for_csn() {
                Xid::INVALID => Xid::FROZEN,
                xmin => xmin,
            };
            self.horizon.set(horizon);
        }
        // An unset shared horizon stays at FROZEN; otherwise nothing below
        // the transaction's own xmin can still be running.
        if horizon != Xid::FROZEN
            && transaction_xmin.is_valid()
            && horizon.precedes(transaction_xmin)
        {
            horizon = transaction_xmin;
        }
        horizon
    }

    /// Commit state of `xid` as seen by a transaction whose xmin is
    /// `transaction_xmin`. Never returns `InDoubt`: an in-doubt transaction
    /// is waited for, then re-read.
    pub fn xid_csn(&self, xid: Xid, transaction_xmin: Xid) -> Result<XidCsn, CsnError> {
        if !xid.is_normal() {
            return Ok(if xid.is_valid() {
                XidCsn::Frozen
            } else {
                XidCsn::Aborted
            });
        }

        if xid.precedes(self.horizon(transaction_xmin)) {
            return Ok(XidCsn::Frozen);
        }

        let mut state = self.log.get_csn(xid)?;
        if state.is_in_doubt() {
            let started = Instant::now();
            self.locks.wait(xid);
            record_in_doubt_wait(started.elapsed().as_micros() as u64);
            state = self.log.get_csn(xid)?;
            if !(state.csn().is_some() || state.is_aborted()) {
                return Err(CsnError::UnexpectedXidCsn {
                    xid,
                    state: state.to_string(),
                });
            }
        }

        match state {
            XidCsn::InDoubt => Err(CsnError::UnexpectedXidCsn {
                xid,
                state: state.to_string(),
            }),
            other => Ok(other),
        }
    }

    /// True when the effects of `xid` must not be seen by `snapshot`.
    /// Aborted transactions are invisible without consulting any other log.
    pub fn is_invisible(&self, xid: Xid, snapshot: &Snapshot) -> Result<bool, CsnError> {
        let state = self.xid_csn(xid, snapshot.xmin)?;
        let invisible = match state {
            XidCsn::Frozen => false,
            XidCsn::Committed(csn) => csn >= snapshot.snapshot_csn,
            XidCsn::InProgress | XidCsn::Aborted => true,
            XidCsn::InDoubt => {
                return Err(CsnError::UnexpectedXidCsn {
                    xid,
                    state: state.to_string(),
                })
            }
        };

        if !snapshot.imported && matches!(state, XidCsn::Committed(_) | XidCsn::InProgress) {
            debug_assert_eq!(
                invisible,
                snapshot.xid_in_local_snapshot(xid),
                "CSN and local snapshot disagree on xid {xid}"
            );
        }
        Ok(invisible)
    }
}
