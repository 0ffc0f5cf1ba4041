//! Running-transaction registry, per-backend CSN slots and transaction
//! locks.
//!
//! Commit CSNs and snapshot CSNs are both generated while holding the
//! registry lock, so a transaction's removal from the running set and its
//! CSN are ordered consistently against every snapshot.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use meridian_common::error::CsnError;
use meridian_common::types::{Csn, Xid, XidCsn};

use crate::clock::CsnGenerator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendId(pub u32);

/// Per-backend atomic holding the CSN state of the backend's current
/// transaction. `InProgress` whenever no commit is under way.
#[derive(Debug, Default)]
pub struct ProcSlot {
    assigned_xid_csn: AtomicU64,
}

impl ProcSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self) -> XidCsn {
        XidCsn::from_raw(self.assigned_xid_csn.load(Ordering::Acquire))
    }

    pub fn store(&self, value: XidCsn) {
        self.assigned_xid_csn.store(value.to_raw(), Ordering::Release);
    }

    /// Swap `current` for `new`; on mismatch returns the value found.
    pub fn compare_exchange(&self, current: XidCsn, new: XidCsn) -> Result<XidCsn, XidCsn> {
        self.assigned_xid_csn
            .compare_exchange(
                current.to_raw(),
                new.to_raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(XidCsn::from_raw)
            .map_err(XidCsn::from_raw)
    }
}

/// Handle a backend (or a prepared transaction) uses to talk to the
/// registry.
#[derive(Debug, Clone)]
pub struct Backend {
    pub id: BackendId,
    pub slot: Arc<ProcSlot>,
}

/// A point-in-time view of which transactions are visible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Every xid below this had finished when the snapshot was taken.
    pub xmin: Xid,
    /// First xid not yet assigned when the snapshot was taken.
    pub xmax: Xid,
    /// Xids (top-level and sub) running at capture, sorted.
    pub xip: Vec<Xid>,
    pub snapshot_csn: Csn,
    /// True when `snapshot_csn` came from another node.
    pub imported: bool,
}

impl Snapshot {
    /// Xid-based answer: was `xid` still running as far as this snapshot
    /// knows? Commit status is not consulted.
    pub fn xid_in_local_snapshot(&self, xid: Xid) -> bool {
        if xid.precedes(self.xmin) {
            return false;
        }
        if xid.follows_or_equals(self.xmax) {
            return true;
        }
        self.xip.binary_search(&xid).is_ok()
    }
}

#[derive(Debug)]
struct ProcEntry {
    xid: Option<Xid>,
    subxids: Vec<Xid>,
    /// Effective xmin, possibly lowered by an imported snapshot.
    xmin: Option<Xid>,
    /// Xmin from the backend's own local snapshot. The deferral map reads
    /// this one so imported xmins do not feed back into it.
    original_xmin: Option<Xid>,
    slot: Arc<ProcSlot>,
}

impl ProcEntry {
    fn new(slot: Arc<ProcSlot>) -> Self {
        Self {
            xid: None,
            subxids: Vec::new(),
            xmin: None,
            original_xmin: None,
            slot,
        }
    }
}

struct ProcArrayState {
    procs: HashMap<BackendId, ProcEntry>,
    next_xid: Xid,
    next_backend: u32,
    latest_completed: Xid,
}

impl ProcArrayState {
    fn entry(&mut self, id: BackendId) -> Result<&mut ProcEntry, CsnError> {
        self.procs.get_mut(&id).ok_or(CsnError::UnknownBackend(id.0))
    }

    fn allocate_xid(&mut self) -> Xid {
        let xid = self.next_xid;
        self.next_xid = xid.next();
        xid
    }
}

/// Registry of running transactions.
pub struct ProcArray {
    state: Mutex<ProcArrayState>,
    generator: Arc<CsnGenerator>,
}

impl ProcArray {
    pub fn new(generator: Arc<CsnGenerator>) -> Self {
        Self {
            state: Mutex::new(ProcArrayState {
                procs: HashMap::new(),
                next_xid: Xid::FIRST_NORMAL,
                next_backend: 1,
                latest_completed: Xid::INVALID,
            }),
            generator,
        }
    }

    pub fn register_backend(&self) -> Backend {
        let mut state = self.state.lock();
        let id = BackendId(state.next_backend);
        state.next_backend += 1;
        let slot = Arc::new(ProcSlot::new());
        state.procs.insert(id, ProcEntry::new(slot.clone()));
        Backend { id, slot }
    }

    pub fn unregister_backend(&self, id: BackendId) {
        self.state.lock().procs.remove(&id);
    }

    /// Assign a top-level xid to the backend's transaction (idempotent).
    pub fn assign_xid(&self, id: BackendId) -> Result<Xid, CsnError> {
        let mut state = self.state.lock();
        if let Some(xid) = state.entry(id)?.xid {
            return Ok(xid);
        }
        let xid = state.allocate_xid();
        state.entry(id)?.xid = Some(xid);
        Ok(xid)
    }

    /// Assign a subtransaction xid; the top-level xid is assigned first if
    /// needed.
    pub fn assign_subxid(&self, id: BackendId) -> Result<Xid, CsnError> {
        let mut state = self.state.lock();
        if state.entry(id)?.xid.is_none() {
            let top = state.allocate_xid();
            state.entry(id)?.xid = Some(top);
        }
        let sub = state.allocate_xid();
        state.entry(id)?.subxids.push(sub);
        Ok(sub)
    }

    /// Capture the running set and a fresh snapshot CSN.
    pub fn take_snapshot(&self, id: BackendId) -> Result<Snapshot, CsnError> {
        let mut state = self.state.lock();
        if !state.procs.contains_key(&id) {
            return Err(CsnError::UnknownBackend(id.0));
        }

        let xmax = state.next_xid;
        let mut xip: Vec<Xid> = state
            .procs
            .values()
            .flat_map(|p| p.xid.iter().chain(p.subxids.iter()).copied())
            .collect();
        xip.sort_unstable();
        let xmin = xip.first().copied().unwrap_or(xmax);
        let snapshot_csn = self.generator.generate()?;

        let entry = state.entry(id)?;
        if entry.xmin.is_none() {
            entry.xmin = Some(xmin);
            entry.original_xmin = Some(xmin);
        }

        Ok(Snapshot {
            xmin,
            xmax,
            xip,
            snapshot_csn,
            imported: false,
        })
    }

    /// Lower the backend's advertised xmin to one mapped from an imported
    /// snapshot. The original xmin is kept for the deferral map.
    pub fn set_imported_xmin(&self, id: BackendId, xmin: Xid) -> Result<(), CsnError> {
        let mut state = self.state.lock();
        let entry = state.entry(id)?;
        entry.xmin = Some(match entry.xmin {
            Some(current) => current.min(xmin),
            None => xmin,
        });
        Ok(())
    }

    /// Remove the backend's transaction from the running set.
    ///
    /// On commit with `assign_csn`, the commit CSN is decided here under the
    /// registry lock: an already-assigned CSN in the slot (global commit) is
    /// kept, otherwise a fresh one is generated and stored in the slot.
    pub fn end_transaction(
        &self,
        id: BackendId,
        committed: bool,
        assign_csn: bool,
    ) -> Result<Option<Csn>, CsnError> {
        let mut state = self.state.lock();
        let generator = &self.generator;
        let entry = state.entry(id)?;

        let Some(xid) = entry.xid else {
            entry.xmin = None;
            entry.original_xmin = None;
            return Ok(None);
        };

        let csn = if committed && assign_csn {
            match entry.slot.load() {
                XidCsn::Committed(csn) => Some(csn),
                XidCsn::InDoubt => {
                    let csn = generator.generate()?;
                    entry.slot.store(XidCsn::Committed(csn));
                    Some(csn)
                }
                other => {
                    return Err(CsnError::UnexpectedXidCsn {
                        xid,
                        state: other.to_string(),
                    })
                }
            }
        } else {
            None
        };

        entry.xid = None;
        entry.subxids.clear();
        entry.xmin = None;
        entry.original_xmin = None;
        if xid > state.latest_completed {
            state.latest_completed = xid;
        }
        Ok(csn)
    }

    /// Move the backend's transaction onto a fresh prepared-transaction
    /// entry so the backend can go on with other work while the
    /// transaction stays in the running set.
    pub fn transfer_to_prepared(&self, id: BackendId) -> Result<(Backend, Xid, Vec<Xid>), CsnError> {
        let mut state = self.state.lock();
        let entry = state.entry(id)?;
        let xid = entry.xid.take().ok_or_else(|| CsnError::UnexpectedXidCsn {
            xid: Xid::INVALID,
            state: "no transaction to prepare".into(),
        })?;
        let subxids = std::mem::take(&mut entry.subxids);
        entry.xmin = None;
        entry.original_xmin = None;

        let prepared_id = BackendId(state.next_backend);
        state.next_backend += 1;
        let slot = Arc::new(ProcSlot::new());
        let mut prepared = ProcEntry::new(slot.clone());
        prepared.xid = Some(xid);
        prepared.subxids = subxids.clone();
        state.procs.insert(prepared_id, prepared);
        Ok((
            Backend {
                id: prepared_id,
                slot,
            },
            xid,
            subxids,
        ))
    }

    /// Oldest xid still considered running, ignoring xmins lowered by
    /// imported snapshots. Feeds the xmin deferral map.
    pub fn oldest_xid_considered_running(&self) -> Xid {
        let state = self.state.lock();
        state
            .procs
            .values()
            .flat_map(|p| p.xid.into_iter().chain(p.original_xmin))
            .min()
            .unwrap_or(state.next_xid)
    }

    /// Horizon below which dead row versions may be reclaimed, held back by
    /// `deferred` when the deferral map is active.
    pub fn oldest_xmin_for_vacuum(&self, deferred: Option<Xid>) -> Xid {
        let state = self.state.lock();
        let running = state
            .procs
            .values()
            .flat_map(|p| p.xid.into_iter().chain(p.xmin))
            .min()
            .unwrap_or(state.next_xid);
        match deferred {
            Some(d) if d.is_valid() => running.min(d),
            _ => running,
        }
    }

    pub fn next_xid(&self) -> Xid {
        self.state.lock().next_xid
    }

    /// Used by recovery to resume xid assignment.
    pub fn set_next_xid(&self, next: Xid) {
        let mut state = self.state.lock();
        if next > state.next_xid {
            state.next_xid = next;
        }
    }

    pub fn latest_completed(&self) -> Xid {
        self.state.lock().latest_completed
    }

    pub fn running_xids(&self) -> Vec<Xid> {
        let state = self.state.lock();
        let mut xids: Vec<Xid> = state.procs.values().filter_map(|p| p.xid).collect();
        xids.sort_unstable();
        xids
    }

    pub fn backend_xmin(&self, id: BackendId) -> Option<Xid> {
        self.state.lock().procs.get(&id).and_then(|p| p.xmin)
    }
}

/// Per-transaction locks. The owner holds its xid lock until the commit or
/// abort is fully published; other backends block on it to learn the
/// outcome of an in-doubt transaction.
#[derive(Default)]
pub struct XactLockTable {
    held: Mutex<HashSet<Xid>>,
    released: Condvar,
}

impl XactLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock on `xid` for its owning transaction.
    pub fn lock(self: &Arc<Self>, xid: Xid) -> XactLockGuard {
        self.held.lock().insert(xid);
        XactLockGuard {
            table: self.clone(),
            xids: vec![xid],
        }
    }

    pub fn is_held(&self, xid: Xid) -> bool {
        self.held.lock().contains(&xid)
    }

    /// Block until `xid` is no longer locked.
    pub fn wait(&self, xid: Xid) {
        let mut held = self.held.lock();
        while held.contains(&xid) {
            self.released.wait(&mut held);
        }
    }

    fn release(&self, xids: &[Xid]) {
        let mut held = self.held.lock();
        for xid in xids {
            held.remove(xid);
        }
        drop(held);
        self.released.notify_all();
    }
}

/// Holds a transaction's xid locks; releases them on drop.
pub struct XactLockGuard {
    table: Arc<XactLockTable>,
    xids: Vec<Xid>,
}

impl XactLockGuard {
    /// Also lock a subtransaction xid under this guard.
    pub fn add(&mut self, xid: Xid) {
        self.table.held.lock().insert(xid);
        self.xids.push(xid);
    }

    pub fn xids(&self) -> &[Xid] {
        &self.xids
    }
}

impl Drop for XactLockGuard {
    fn drop(&mut self) {
        self.table.release(&self.xids);
    }
}

impl std::fmt::Debug for XactLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XactLockGuard").field("xids", &self.xids).finish()
    }
}
