//! Xmin deferral map.
//!
//! Remembers, for each of the last `defer_time` seconds of CSN time, the
//! oldest xid still considered running at that second. A snapshot imported
//! from the recent past is given the xmin recorded for its second, and the
//! oldest retained entry holds back vacuum so the row versions such a
//! snapshot needs survive.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use meridian_common::error::CsnError;
use meridian_common::types::{Csn, Xid};
use meridian_observability::{record_deferred_xmin, record_snapshot_too_old};

/// Fixed-capacity ring addressed by logical second.
///
/// Second `s` lives in slot `s % capacity`. Only the `capacity` seconds
/// ending at the head second are addressable.
#[derive(Debug, Clone)]
pub struct SecondRing<T: Copy> {
    slots: Box<[T]>,
    head: usize,
    head_second: u64,
}

impl<T: Copy> SecondRing<T> {
    /// Ring of `capacity` slots (at least one), all holding `fill`.
    pub fn new(capacity: usize, fill: T) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![fill; capacity].into_boxed_slice(),
            head: 0,
            head_second: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn head_second(&self) -> u64 {
        self.head_second
    }

    fn slot_of(&self, second: u64) -> usize {
        (second % self.slots.len() as u64) as usize
    }

    /// Overwrite every slot with `value`.
    pub fn fill(&mut self, value: T) {
        self.slots.iter_mut().for_each(|s| *s = value);
    }

    pub fn head_value(&self) -> T {
        self.slots[self.head]
    }

    /// Value of the oldest addressable second (the slot after the head).
    pub fn oldest_value(&self) -> T {
        self.slots[(self.head + 1) % self.slots.len()]
    }

    /// Write `value` at `second`, which becomes the new head. The seconds
    /// skipped since the previous head, at most `capacity - 1` of them, take
    /// `backfill`.
    pub fn write_at(&mut self, second: u64, value: T, backfill: T) {
        let cap = self.slots.len() as u64;
        let gap = second.saturating_sub(self.head_second).min(cap);
        let head = self.slot_of(second);
        self.slots[head] = value;
        for back in 1..gap {
            let idx = (second - back) % cap;
            self.slots[idx as usize] = backfill;
        }
        self.head = head;
        self.head_second = second;
    }

    /// Value recorded for the nearest second at or before `second`.
    /// Seconds newer than the head read the head; seconds that fell out of
    /// the ring read `None`.
    pub fn read_at_or_before(&self, second: u64) -> Option<T> {
        if second >= self.head_second {
            return Some(self.head_value());
        }
        if self.head_second - second < self.slots.len() as u64 {
            Some(self.slots[self.slot_of(second)])
        } else {
            None
        }
    }
}

/// Per-second record of the oldest running xid, sized by the deferral
/// window in seconds.
pub struct XminMap {
    ring: RwLock<SecondRing<Xid>>,
    /// Mirror of the ring's head second, readable without the lock.
    last_csn_seconds: AtomicU64,
    /// Published horizon: never moves backwards.
    deferred_xmin: AtomicU64,
}

impl XminMap {
    pub fn new(defer_secs: u64) -> Self {
        Self {
            ring: RwLock::new(SecondRing::new(defer_secs as usize, Xid::INVALID)),
            last_csn_seconds: AtomicU64::new(0),
            deferred_xmin: AtomicU64::new(Xid::INVALID.0),
        }
    }

    pub fn window_secs(&self) -> u64 {
        self.ring.read().capacity() as u64
    }

    /// Seed every slot with the oldest active xid at node start.
    pub fn startup(&self, oldest_active: Xid) {
        let mut ring = self.ring.write();
        ring.fill(oldest_active);
        self.deferred_xmin.store(oldest_active.0, Ordering::Release);
        tracing::info!(
            oldest_active = oldest_active.0,
            window_secs = ring.capacity(),
            "xmin deferral map initialized"
        );
    }

    /// Note that a snapshot with `snapshot_csn` was taken. The first snapshot
    /// of each new second records the current oldest running xid;
    /// `oldest_running` is only evaluated then.
    pub fn record_snapshot<F>(&self, snapshot_csn: Csn, oldest_running: F)
    where
        F: FnOnce() -> Xid,
    {
        // Round up: the entry covers every snapshot taken during this second.
        let csn_seconds = snapshot_csn.seconds() + 1;
        if self.last_csn_seconds.load(Ordering::Acquire) >= csn_seconds {
            return;
        }

        let mut ring = self.ring.write();
        if self.last_csn_seconds.load(Ordering::Acquire) >= csn_seconds {
            return;
        }
        let current = oldest_running();
        let previous = ring.head_value();
        ring.write_at(csn_seconds, current, previous);
        self.last_csn_seconds.store(csn_seconds, Ordering::Release);
        let oldest = ring.oldest_value();
        drop(ring);

        let prev_horizon = self.deferred_xmin.fetch_max(oldest.0, Ordering::AcqRel);
        if oldest.0 > prev_horizon {
            record_deferred_xmin(oldest.0);
        }
        tracing::trace!(
            csn_seconds,
            oldest_running = current.0,
            deferred_xmin = oldest.0.max(prev_horizon),
            "xmin map advanced"
        );
    }

    /// Xmin a snapshot taken at `snapshot_csn` must use.
    pub fn xmin_for_snapshot(&self, snapshot_csn: Csn) -> Result<Xid, CsnError> {
        // Round down: the slot for a second holds the xmin of its start.
        let csn_seconds = snapshot_csn.seconds();
        let ring = self.ring.read();
        match ring.read_at_or_before(csn_seconds) {
            Some(xmin) => Ok(xmin),
            None => {
                record_snapshot_too_old();
                Err(CsnError::SnapshotTooOld {
                    snapshot_csn,
                    window_secs: ring.capacity() as u64,
                })
            }
        }
    }

    /// Oldest xmin any importable snapshot may still need.
    pub fn deferred_xmin(&self) -> Xid {
        Xid(self.deferred_xmin.load(Ordering::Acquire))
    }

    pub fn last_csn_seconds(&self) -> u64 {
        self.last_csn_seconds.load(Ordering::Acquire)
    }
}
