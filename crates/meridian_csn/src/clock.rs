//! CSN generation and the shared clock state behind it.
//!
//! A CSN is the local wall clock in nanoseconds, but clocks stall and step
//! backwards, so the generator remembers the largest value it handed out and
//! never returns anything at or below it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use meridian_common::error::CsnError;
use meridian_common::types::{Csn, Xid, XidCsn};
use meridian_observability::{record_csn_generated, record_csn_wal_assignment};

use crate::csn_log::CsnWal;

/// Source of wall-clock readings.
pub trait ClockSource: Send + Sync {
    /// Nanoseconds since the Unix epoch.
    fn now_nanos(&self) -> u64;
}

/// The operating system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now_nanos(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }
}

/// Hand-driven clock for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new(start_nanos: u64) -> Self {
        Self {
            nanos: AtomicU64::new(start_nanos),
        }
    }

    pub fn set(&self, nanos: u64) {
        self.nanos.store(nanos, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl ClockSource for ManualClock {
    fn now_nanos(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }
}

/// Shared clock state, guarded by the generator's mutex.
#[derive(Debug, Clone, Copy)]
struct ClockState {
    /// Largest CSN handed out so far.
    last_max_csn: Csn,
    /// Highest CSN covered by a WAL assignment record.
    last_csn_log_wal: Csn,
    /// First xid whose visibility is decided by CSN; INVALID until set.
    xmin_for_csn: Xid,
}

/// Process-wide CSN generator. Constructed once at startup and shared by
/// reference with every backend.
pub struct CsnGenerator {
    state: Mutex<ClockState>,
    clock: Arc<dyn ClockSource>,
    wal: Arc<dyn CsnWal>,
    wal_interval_secs: u64,
}

impl CsnGenerator {
    pub fn new(clock: Arc<dyn ClockSource>, wal: Arc<dyn CsnWal>, wal_interval_secs: u64) -> Self {
        Self {
            state: Mutex::new(ClockState {
                last_max_csn: Csn(0),
                last_csn_log_wal: Csn(0),
                xmin_for_csn: Xid::INVALID,
            }),
            clock,
            wal,
            wal_interval_secs,
        }
    }

    /// Current wall-clock reading, without touching the shared state.
    pub fn clock_now(&self) -> Csn {
        Csn(self.clock.now_nanos())
    }

    /// Produce a CSN strictly greater than every CSN produced before.
    ///
    /// Fails if the WAL assignment record cannot be written or the CSN range
    /// is used up; the caller's transaction must not proceed in either case.
    pub fn generate(&self) -> Result<Csn, CsnError> {
        let candidate = self.clock.now_nanos().max(XidCsn::FIRST_NORMAL_RAW);
        let mut state = self.state.lock();

        let bumped = candidate <= state.last_max_csn.0;
        let csn = if bumped {
            let next = state
                .last_max_csn
                .0
                .checked_add(1)
                .ok_or(CsnError::CsnExhausted(state.last_max_csn))?;
            state.last_max_csn = Csn(next);
            state.last_max_csn
        } else {
            state.last_max_csn = Csn(candidate);
            Csn(candidate)
        };

        // Reserve a stretch of CSN space ahead of us in one WAL record, so a
        // restart resumes above anything handed out before the crash.
        if csn >= state.last_csn_log_wal {
            let reserved = csn.plus_secs(self.wal_interval_secs);
            self.wal.log_csn_assignment(reserved)?;
            state.last_csn_log_wal = reserved;
            record_csn_wal_assignment();
        }
        drop(state);

        record_csn_generated(bumped);
        Ok(csn)
    }

    /// Make sure every later CSN is above `csn`. Used when a CSN decided
    /// elsewhere (imported snapshot, agreed global commit CSN) enters this
    /// node.
    pub fn advance_to(&self, csn: Csn) {
        let mut state = self.state.lock();
        if csn > state.last_max_csn {
            state.last_max_csn = csn;
        }
    }

    /// Resume after crash recovery from the last logged assignment.
    pub fn restore_after_recovery(&self, last_logged: Csn) {
        let mut state = self.state.lock();
        if last_logged > state.last_max_csn {
            state.last_max_csn = last_logged;
        }
        state.last_csn_log_wal = last_logged;
        tracing::info!(last_logged = last_logged.0, "restored CSN clock state from WAL");
    }

    pub fn last_max_csn(&self) -> Csn {
        self.state.lock().last_max_csn
    }

    pub fn last_csn_log_wal(&self) -> Csn {
        self.state.lock().last_csn_log_wal
    }

    /// Record the xid from which CSN lookups become authoritative. Called
    /// when snapshots switch from xid-based to CSN-based, with the next xid
    /// to be assigned.
    pub fn set_xmin_for_csn(&self, next_xid: Xid) {
        self.state.lock().xmin_for_csn = next_xid;
        tracing::debug!(xmin_for_csn = next_xid.0, "CSN horizon set");
    }

    pub fn xmin_for_csn(&self) -> Xid {
        self.state.lock().xmin_for_csn
    }
}
