//! Commit-sequence-number snapshot isolation.
//!
//! Every committed transaction gets a CSN from a strictly increasing
//! wall-clock generator, and every snapshot carries one. A row version is
//! visible iff its writer committed with a CSN below the snapshot's. Because
//! CSNs are clock readings, a snapshot CSN taken on one node can be
//! imported on another, which is what makes cross-node snapshots
//! consistent.
//!
//! [`CsnContext`] is built once at node start and shared by every backend.

pub mod clock;
pub mod commit;
pub mod csn_log;
pub mod proc_array;
pub mod snapshot;
pub mod visibility;
pub mod xmin_map;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use meridian_common::config::CsnConfig;
use meridian_common::error::{ConfigError, CsnError};
use meridian_common::types::{Csn, Xid};

pub use clock::{ClockSource, CsnGenerator, ManualClock, SystemClock};
pub use commit::CommitProtocol;
pub use csn_log::{CsnLog, CsnWal, MemCsnLog, MemCsnWal};
pub use proc_array::{Backend, BackendId, ProcArray, ProcSlot, Snapshot, XactLockGuard, XactLockTable};
pub use snapshot::{PreparedXact, PreparedXacts};
pub use visibility::VisibilityOracle;
pub use xmin_map::{SecondRing, XminMap};

/// An open local write transaction. Holds the transaction's xid locks
/// until it commits, aborts or is prepared.
#[derive(Debug)]
pub struct LocalXact {
    pub xid: Xid,
    pub subxids: Vec<Xid>,
    guard: XactLockGuard,
}

impl LocalXact {
    fn into_guard(self) -> XactLockGuard {
        self.guard
    }
}

/// Shared CSN state for one node.
pub struct CsnContext {
    config: CsnConfig,
    generator: Arc<CsnGenerator>,
    xmin_map: Option<Arc<XminMap>>,
    log: Arc<dyn CsnLog>,
    proc_array: Arc<ProcArray>,
    locks: Arc<XactLockTable>,
    commit: CommitProtocol,
    prepared: PreparedXacts,
}

impl CsnContext {
    pub fn new(
        config: CsnConfig,
        clock: Arc<dyn ClockSource>,
        log: Arc<dyn CsnLog>,
        wal: Arc<dyn CsnWal>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let generator = Arc::new(CsnGenerator::new(clock, wal, config.wal_assign_interval_secs));
        let xmin_map = (config.csn_snapshot_defer_time > 0)
            .then(|| Arc::new(XminMap::new(config.csn_snapshot_defer_time)));
        let proc_array = Arc::new(ProcArray::new(generator.clone()));
        let commit = CommitProtocol::new(log.clone(), config.enable_csn_snapshot);
        tracing::info!(
            enable_csn_snapshot = config.enable_csn_snapshot,
            defer_time_secs = config.csn_snapshot_defer_time,
            "CSN context created"
        );
        Ok(Self {
            config,
            generator,
            xmin_map,
            log,
            proc_array,
            locks: Arc::new(XactLockTable::new()),
            commit,
            prepared: PreparedXacts::new(),
        })
    }

    /// In-memory node with the system clock.
    pub fn in_memory(config: CsnConfig) -> Result<Self, ConfigError> {
        Self::new(
            config,
            Arc::new(SystemClock),
            Arc::new(MemCsnLog::new()),
            Arc::new(MemCsnWal::new()),
        )
    }

    /// Node start: seed the deferral map with the oldest active xid and,
    /// when CSN snapshots are on, fix the CSN horizon.
    pub fn startup(&self) {
        if let Some(map) = &self.xmin_map {
            map.startup(self.proc_array.oldest_xid_considered_running());
        }
        if self.config.enable_csn_snapshot {
            self.mark_csn_horizon();
        }
    }

    /// Resume after crash recovery.
    pub fn restore_after_recovery(&self, last_logged: Csn, next_xid: Xid) {
        self.proc_array.set_next_xid(next_xid);
        self.generator.restore_after_recovery(last_logged);
    }

    /// From now on, xids at or above the next one to be assigned are judged
    /// by CSN; older ones read as frozen.
    pub fn mark_csn_horizon(&self) {
        self.generator.set_xmin_for_csn(self.proc_array.next_xid());
    }

    pub fn config(&self) -> &CsnConfig {
        &self.config
    }

    pub fn generator(&self) -> &CsnGenerator {
        &self.generator
    }

    pub fn xmin_map(&self) -> Option<&XminMap> {
        self.xmin_map.as_deref()
    }

    pub fn proc_array(&self) -> &ProcArray {
        &self.proc_array
    }

    pub fn locks(&self) -> &Arc<XactLockTable> {
        &self.locks
    }

    pub fn commit_protocol(&self) -> &CommitProtocol {
        &self.commit
    }

    pub fn prepared(&self) -> &PreparedXacts {
        &self.prepared
    }

    pub fn generate_csn(&self) -> Result<Csn, CsnError> {
        self.generator.generate()
    }

    pub fn register_backend(&self) -> Backend {
        self.proc_array.register_backend()
    }

    /// Visibility oracle for one backend.
    pub fn oracle(&self) -> Result<VisibilityOracle, CsnError> {
        if !self.config.enable_csn_snapshot {
            return Err(CsnError::Disabled);
        }
        Ok(VisibilityOracle::new(
            self.log.clone(),
            self.generator.clone(),
            self.locks.clone(),
        ))
    }

    pub fn begin_transaction(&self, backend: &Backend) -> Result<LocalXact, CsnError> {
        let xid = self.proc_array.assign_xid(backend.id)?;
        Ok(LocalXact {
            xid,
            subxids: Vec::new(),
            guard: self.locks.lock(xid),
        })
    }

    pub fn begin_subtransaction(
        &self,
        backend: &Backend,
        xact: &mut LocalXact,
    ) -> Result<Xid, CsnError> {
        let sub = self.proc_array.assign_subxid(backend.id)?;
        xact.guard.add(sub);
        xact.subxids.push(sub);
        Ok(sub)
    }

    /// Local snapshot. The first snapshot of every second also records the
    /// oldest running xid in the deferral map.
    pub fn take_snapshot(&self, backend: &Backend) -> Result<Snapshot, CsnError> {
        let snapshot = self.proc_array.take_snapshot(backend.id)?;
        if let Some(map) = &self.xmin_map {
            map.record_snapshot(snapshot.snapshot_csn, || {
                self.proc_array.oldest_xid_considered_running()
            });
        }
        Ok(snapshot)
    }

    /// Commit `xact`; returns its CSN when CSN snapshots are on.
    pub fn commit_transaction(
        &self,
        backend: &Backend,
        xact: LocalXact,
    ) -> Result<Option<Csn>, CsnError> {
        self.commit.precommit(&backend.slot, xact.xid, &xact.subxids)?;
        let assigned =
            self.proc_array
                .end_transaction(backend.id, true, self.commit.is_enabled())?;
        let csn = self.commit.commit(&backend.slot, xact.xid, &xact.subxids)?;
        debug_assert_eq!(assigned, csn);
        drop(xact);
        Ok(csn)
    }

    pub fn abort_transaction(&self, backend: &Backend, xact: LocalXact) -> Result<(), CsnError> {
        self.commit.abort(&backend.slot, xact.xid, &xact.subxids)?;
        self.proc_array.end_transaction(backend.id, false, false)?;
        drop(xact);
        Ok(())
    }

    /// End a transaction that never wrote: only the advertised xmin goes.
    pub fn end_read_only(&self, backend: &Backend) -> Result<(), CsnError> {
        self.proc_array.end_transaction(backend.id, false, false)?;
        Ok(())
    }

    /// Horizon below which dead row versions may be reclaimed.
    pub fn vacuum_horizon(&self) -> Xid {
        self.proc_array
            .oldest_xmin_for_vacuum(self.xmin_map.as_ref().map(|m| m.deferred_xmin()))
    }
}
