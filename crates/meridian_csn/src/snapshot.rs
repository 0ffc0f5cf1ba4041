//! Cross-node snapshot import and the participant side of global commit.

use dashmap::mapref::one::Ref;
use dashmap::DashMap;

use meridian_common::error::CsnError;
use meridian_common::types::{Csn, Xid};

use crate::proc_array::{Backend, Snapshot, XactLockGuard};
use crate::{CsnContext, LocalXact};

/// A locally prepared transaction waiting for its global outcome.
#[derive(Debug)]
pub struct PreparedXact {
    pub xid: Xid,
    pub subxids: Vec<Xid>,
    pub backend: Backend,
    guard: XactLockGuard,
}

/// Prepared transactions keyed by global transaction identifier.
#[derive(Default)]
pub struct PreparedXacts {
    by_gid: DashMap<String, PreparedXact>,
}

impl PreparedXacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, gid: &str) -> bool {
        self.by_gid.contains_key(gid)
    }

    pub fn gids(&self) -> Vec<String> {
        let mut gids: Vec<String> = self.by_gid.iter().map(|e| e.key().clone()).collect();
        gids.sort();
        gids
    }

    pub fn len(&self) -> usize {
        self.by_gid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_gid.is_empty()
    }
}

impl CsnContext {
    /// Adopt a snapshot CSN decided on another node.
    ///
    /// The backend's xmin is lowered to the one recorded for that moment so
    /// the versions the snapshot needs stay around; a CSN older than the
    /// deferral window fails with `SnapshotTooOld`.
    pub fn import_snapshot(&self, backend: &Backend, csn: Csn) -> Result<Snapshot, CsnError> {
        if !self.config().enable_csn_snapshot {
            return Err(CsnError::Disabled);
        }
        if !csn.is_normal() {
            return Err(CsnError::InvalidCsn(csn));
        }
        let map = self.xmin_map().ok_or(CsnError::XminMapUnavailable)?;
        let xmin = map.xmin_for_snapshot(csn)?;

        let local_now = self.generator().clock_now();
        let desync_nanos = self.config().snapshot_desync_warn_ms.saturating_mul(1_000_000);
        if csn.0 > local_now.0.saturating_add(desync_nanos) {
            tracing::warn!(
                imported_csn = csn.0,
                local_clock = local_now.0,
                ahead_ms = (csn.0 - local_now.0) / 1_000_000,
                "imported snapshot is ahead of the local clock"
            );
        }
        self.generator().advance_to(csn);

        let mut snapshot = self.proc_array().take_snapshot(backend.id)?;
        self.proc_array().set_imported_xmin(backend.id, xmin)?;
        snapshot.xmin = snapshot.xmin.min(xmin);
        snapshot.snapshot_csn = csn;
        snapshot.imported = true;
        tracing::debug!(backend = backend.id.0, csn = csn.0, xmin = xmin.0, "imported snapshot");
        Ok(snapshot)
    }

    /// CSN another node should import to see the same data as `snapshot`.
    pub fn export_snapshot(&self, snapshot: &Snapshot) -> Result<Csn, CsnError> {
        if !self.config().enable_csn_snapshot {
            return Err(CsnError::Disabled);
        }
        Ok(snapshot.snapshot_csn)
    }

    /// Prepare the backend's transaction under `gid`. The transaction stays
    /// in the running set, and its lock stays held, until
    /// [`commit_prepared`](Self::commit_prepared) or
    /// [`rollback_prepared`](Self::rollback_prepared).
    pub fn prepare_transaction(
        &self,
        backend: &Backend,
        xact: LocalXact,
        gid: &str,
    ) -> Result<(), CsnError> {
        if self.prepared().contains(gid) {
            return Err(CsnError::DuplicatePreparedXact(gid.to_string()));
        }
        let (prepared_backend, xid, subxids) = self.proc_array().transfer_to_prepared(backend.id)?;
        debug_assert_eq!(xid, xact.xid);
        self.prepared().by_gid.insert(
            gid.to_string(),
            PreparedXact {
                xid,
                subxids,
                backend: prepared_backend,
                guard: xact.into_guard(),
            },
        );
        tracing::debug!(gid, xid = xid.0, "transaction prepared");
        Ok(())
    }

    /// Mark the prepared transaction in-doubt and propose a CSN for it.
    pub fn csn_snapshot_prepare(&self, gid: &str) -> Result<Csn, CsnError> {
        let entry = self.prepared_entry(gid)?;
        let csn = self.commit_protocol().prepare_global(
            &entry.backend.slot,
            entry.xid,
            &entry.subxids,
            self.generator(),
        )?;
        tracing::debug!(gid, xid = entry.xid.0, csn = csn.0, "proposed global CSN");
        Ok(csn)
    }

    /// Fix the agreed global CSN for the prepared transaction.
    pub fn csn_snapshot_assign(&self, gid: &str, csn: Csn) -> Result<(), CsnError> {
        let entry = self.prepared_entry(gid)?;
        self.commit_protocol()
            .assign_global(&entry.backend.slot, entry.xid, csn, self.generator())?;
        tracing::debug!(gid, xid = entry.xid.0, csn = csn.0, "assigned global CSN");
        Ok(())
    }

    /// Coordinator side of the CSN exchange: propose a CSN for the backend's
    /// own open transaction.
    pub fn csn_prepare_current(&self, backend: &Backend, xact: &LocalXact) -> Result<Csn, CsnError> {
        self.commit_protocol().prepare_global(
            &backend.slot,
            xact.xid,
            &xact.subxids,
            self.generator(),
        )
    }

    /// Fix the agreed global CSN for the backend's own transaction; the next
    /// [`commit_transaction`](Self::commit_transaction) publishes it.
    pub fn csn_assign_current(
        &self,
        backend: &Backend,
        xact: &LocalXact,
        csn: Csn,
    ) -> Result<(), CsnError> {
        self.commit_protocol()
            .assign_global(&backend.slot, xact.xid, csn, self.generator())?;
        tracing::debug!(xid = xact.xid.0, csn = csn.0, "assigned global CSN to local transaction");
        Ok(())
    }

    /// Commit a prepared transaction, with its assigned global CSN if one
    /// was fixed.
    ///
    /// The entry, and with it the transaction's lock, stays registered until
    /// every step has succeeded; each step can be repeated, so a failed
    /// attempt leaves a transaction that can still be committed or rolled
    /// back.
    pub fn commit_prepared(&self, gid: &str) -> Result<Option<Csn>, CsnError> {
        let csn = {
            let entry = self.prepared_entry(gid)?;
            let protocol = self.commit_protocol();
            protocol.precommit(&entry.backend.slot, entry.xid, &entry.subxids)?;
            self.proc_array()
                .end_transaction(entry.backend.id, true, protocol.is_enabled())?;
            protocol.commit(&entry.backend.slot, entry.xid, &entry.subxids)?
        };
        let xid = self.release_prepared(gid);
        tracing::debug!(
            gid,
            xid = xid.map(|x| x.0),
            csn = csn.map(|c| c.0),
            "committed prepared transaction"
        );
        Ok(csn)
    }

    pub fn rollback_prepared(&self, gid: &str) -> Result<(), CsnError> {
        {
            let entry = self.prepared_entry(gid)?;
            self.commit_protocol()
                .abort(&entry.backend.slot, entry.xid, &entry.subxids)?;
            self.proc_array()
                .end_transaction(entry.backend.id, false, false)?;
        }
        let xid = self.release_prepared(gid);
        tracing::debug!(gid, xid = xid.map(|x| x.0), "rolled back prepared transaction");
        Ok(())
    }

    fn prepared_entry(&self, gid: &str) -> Result<Ref<'_, String, PreparedXact>, CsnError> {
        self.prepared()
            .by_gid
            .get(gid)
            .ok_or_else(|| CsnError::UnknownPreparedXact(gid.to_string()))
    }

    /// Forget a resolved prepared transaction: its backend goes away and its
    /// lock is released, waking readers that waited on it.
    fn release_prepared(&self, gid: &str) -> Option<Xid> {
        let (_, prepared) = self.prepared().by_gid.remove(gid)?;
        self.proc_array().unregister_backend(prepared.backend.id);
        drop(prepared.guard);
        Some(prepared.xid)
    }
}
