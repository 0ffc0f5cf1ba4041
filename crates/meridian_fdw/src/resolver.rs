//! Resolver for prepared foreign transactions.
//!
//! Every two-phase participant is tracked here from just before its
//! `PREPARE TRANSACTION` until its prepared transaction is resolved. The
//! coordinator resolves participants itself on the normal path and hands
//! anything it could not finish over to the resolver, which retries from its
//! own connection cache.
//!
//! # Invariants
//! - A participant handed over in `Committing` is only ever committed, one in
//!   `Aborting` only ever rolled back.
//! - A participant handed over before a decision (`Preparing`, `Prepared`)
//!   is rolled back: a prepare is not a commit.
//! - Resolution is idempotent: a prepared transaction the remote no longer
//!   has counts as resolved.
//! - A participant that fails `max_attempts` times is moved to the abandoned
//!   set with its decision intact. It is never resolved again until an
//!   operator re-queues it, and never dropped unless an operator discards it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use meridian_common::config::FdwConfig;
use meridian_common::error::FdwError;
use meridian_common::types::Xid;
use meridian_observability::record_resolver_sweep;

use crate::connection::ConnectionCache;
use crate::fdw_xact::ForeignXact;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdwXactStatus {
    /// `PREPARE TRANSACTION` sent, outcome not yet known.
    Preparing,
    Prepared,
    /// The local transaction committed; the participant must commit.
    Committing,
    /// The local transaction aborted; the participant must roll back.
    Aborting,
}

impl FdwXactStatus {
    fn resolves_by_commit(self) -> bool {
        matches!(self, FdwXactStatus::Committing)
    }
}

#[derive(Debug, Clone)]
pub struct PendingFdwXact {
    pub local_xid: Xid,
    pub fx: ForeignXact,
    pub status: FdwXactStatus,
    pub registered_at: Instant,
    /// Set once the coordinator has given the participant up.
    pub in_doubt: bool,
    pub attempts: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ResolverMetrics {
    pub total_resolved: u64,
    pub resolved_committed: u64,
    pub resolved_rolled_back: u64,
    /// Tracked participants, in doubt or not.
    pub currently_pending: usize,
    pub currently_in_doubt: usize,
    pub currently_abandoned: usize,
    pub resolution_failures: u64,
    pub sweeps_run: u64,
    pub last_sweep_us: u64,
}

pub struct FdwXactResolver {
    pending: RwLock<HashMap<String, PendingFdwXact>>,
    abandoned: RwLock<HashMap<String, PendingFdwXact>>,
    cache: Mutex<ConnectionCache>,
    sweep_interval: Duration,
    max_attempts: u32,
    max_per_sweep: usize,
    metrics: RwLock<ResolverMetrics>,
    total_resolved: AtomicU64,
}

impl FdwXactResolver {
    /// `cache` must be the resolver's own: it is used from the sweep thread.
    pub fn new(cache: ConnectionCache, config: &FdwConfig) -> Arc<Self> {
        Self::with_limits(
            cache,
            Duration::from_millis(config.resolution_retry_interval_ms),
            config.max_resolution_attempts,
            100,
        )
    }

    pub fn with_limits(
        cache: ConnectionCache,
        sweep_interval: Duration,
        max_attempts: u32,
        max_per_sweep: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            pending: RwLock::new(HashMap::new()),
            abandoned: RwLock::new(HashMap::new()),
            cache: Mutex::new(cache),
            sweep_interval,
            max_attempts,
            max_per_sweep,
            metrics: RwLock::new(ResolverMetrics::default()),
            total_resolved: AtomicU64::new(0),
        })
    }

    /// Track a participant about to be prepared.
    pub fn register(&self, local_xid: Xid, fx: ForeignXact) {
        let id = fx.fdwxact_id.clone();
        self.pending.write().insert(
            id,
            PendingFdwXact {
                local_xid,
                fx,
                status: FdwXactStatus::Preparing,
                registered_at: Instant::now(),
                in_doubt: false,
                attempts: 0,
                last_error: None,
            },
        );
    }

    pub fn set_status(&self, fdwxact_id: &str, status: FdwXactStatus) {
        if let Some(p) = self.pending.write().get_mut(fdwxact_id) {
            p.status = status;
        }
    }

    /// The coordinator resolved the participant itself.
    pub fn forget(&self, fdwxact_id: &str) {
        self.pending.write().remove(fdwxact_id);
    }

    /// The coordinator could not resolve the participant; retry from here.
    pub fn hand_over(&self, fdwxact_id: &str, status: FdwXactStatus, error: &FdwError) {
        let mut pending = self.pending.write();
        let Some(p) = pending.get_mut(fdwxact_id) else {
            return;
        };
        p.status = status;
        p.in_doubt = true;
        p.attempts += 1;
        p.last_error = Some(error.to_string());
        tracing::warn!(
            fdwxact_id,
            server = %p.fx.server_name,
            local_xid = p.local_xid.0,
            status = ?status,
            error = %error,
            "foreign transaction handed to resolver"
        );
        self.abandon_if_exhausted(&mut pending, fdwxact_id);
    }

    /// Move an in-doubt entry that used up its attempts to the abandoned
    /// set. The caller holds the `pending` write lock.
    fn abandon_if_exhausted(
        &self,
        pending: &mut HashMap<String, PendingFdwXact>,
        fdwxact_id: &str,
    ) {
        let exhausted = pending
            .get(fdwxact_id)
            .is_some_and(|p| p.in_doubt && p.attempts >= self.max_attempts);
        if !exhausted {
            return;
        }
        if let Some(p) = pending.remove(fdwxact_id) {
            tracing::error!(
                fdwxact_id,
                server = %p.fx.server_name,
                local_xid = p.local_xid.0,
                status = ?p.status,
                attempts = p.attempts,
                "foreign transaction abandoned after max resolution attempts, manual resolution required"
            );
            self.abandoned.write().insert(fdwxact_id.to_string(), p);
        }
    }

    /// Run one resolution pass over in-doubt participants. Returns how many
    /// were resolved.
    pub fn sweep(&self) -> usize {
        let start = Instant::now();
        let mut committed = 0usize;
        let mut rolled_back = 0usize;
        let mut failures = 0usize;

        let candidates: Vec<PendingFdwXact> = {
            let pending = self.pending.read();
            pending
                .values()
                .filter(|p| p.in_doubt && p.attempts < self.max_attempts)
                .take(self.max_per_sweep)
                .cloned()
                .collect()
        };

        let mut to_remove: Vec<String> = Vec::new();
        let mut to_update: Vec<(String, u32, String)> = Vec::new();

        {
            let mut cache = self.cache.lock();
            for p in &candidates {
                let commit = p.status.resolves_by_commit();
                let mut fx = p.fx.clone();
                fx.one_phase = false;
                let result = if commit {
                    cache.commit_foreign(&fx)
                } else {
                    cache.rollback_foreign(&fx)
                };

                match result {
                    Ok(()) => {
                        if commit {
                            committed += 1;
                        } else {
                            rolled_back += 1;
                        }
                        tracing::info!(
                            fdwxact_id = %fx.fdwxact_id,
                            server = %fx.server_name,
                            commit,
                            attempts = p.attempts + 1,
                            "in-doubt foreign transaction resolved"
                        );
                        to_remove.push(fx.fdwxact_id);
                    }
                    Err(e) => {
                        failures += 1;
                        let attempts = p.attempts + 1;
                        tracing::warn!(
                            fdwxact_id = %fx.fdwxact_id,
                            attempts,
                            error = %e,
                            "foreign transaction resolution failed"
                        );
                        to_update.push((fx.fdwxact_id, attempts, e.to_string()));
                    }
                }
            }
            cache.end_transaction();
        }

        {
            let mut pending = self.pending.write();
            for id in &to_remove {
                pending.remove(id);
            }
            for (id, attempts, err) in to_update {
                if let Some(p) = pending.get_mut(&id) {
                    p.attempts = attempts;
                    p.last_error = Some(err);
                }
                self.abandon_if_exhausted(&mut pending, &id);
            }
        }

        let resolved = committed + rolled_back;
        let elapsed_us = start.elapsed().as_micros() as u64;
        let (pending_count, in_doubt_count) = self.counts();
        let abandoned_count = self.abandoned_count();
        {
            let mut m = self.metrics.write();
            m.total_resolved += resolved as u64;
            m.resolved_committed += committed as u64;
            m.resolved_rolled_back += rolled_back as u64;
            m.resolution_failures += failures as u64;
            m.sweeps_run += 1;
            m.last_sweep_us = elapsed_us;
            m.currently_pending = pending_count;
            m.currently_in_doubt = in_doubt_count;
            m.currently_abandoned = abandoned_count;
        }
        self.total_resolved.fetch_add(resolved as u64, Ordering::Relaxed);
        record_resolver_sweep(resolved, failures, in_doubt_count, elapsed_us);

        resolved
    }

    fn counts(&self) -> (usize, usize) {
        let pending = self.pending.read();
        (pending.len(), pending.values().filter(|p| p.in_doubt).count())
    }

    /// Start the background sweep thread.
    pub fn start(self: &Arc<Self>) -> std::io::Result<FdwXactResolverHandle> {
        let resolver = Arc::clone(self);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let thread = std::thread::Builder::new()
            .name("meridian-fdwxact-resolver".into())
            .spawn(move || {
                tracing::info!("foreign transaction resolver started");
                while !stop_flag.load(Ordering::Relaxed) {
                    let resolved = resolver.sweep();
                    if resolved > 0 {
                        tracing::info!(resolved, "foreign transaction resolver sweep completed");
                    }
                    let deadline = Instant::now() + resolver.sweep_interval;
                    while !stop_flag.load(Ordering::Relaxed) && Instant::now() < deadline {
                        std::thread::sleep(Duration::from_millis(10).min(resolver.sweep_interval));
                    }
                }
                tracing::info!("foreign transaction resolver stopped");
            })?;

        Ok(FdwXactResolverHandle {
            stop,
            thread: Some(thread),
        })
    }

    pub fn metrics(&self) -> ResolverMetrics {
        let mut m = self.metrics.read().clone();
        let (pending, in_doubt) = self.counts();
        m.currently_pending = pending;
        m.currently_in_doubt = in_doubt;
        m.currently_abandoned = self.abandoned_count();
        m
    }

    pub fn list_pending(&self) -> Vec<PendingFdwXact> {
        let mut list: Vec<PendingFdwXact> = self.pending.read().values().cloned().collect();
        list.sort_by(|a, b| a.fx.fdwxact_id.cmp(&b.fx.fdwxact_id));
        list
    }

    /// Tracked or abandoned entry for `fdwxact_id`.
    pub fn get(&self, fdwxact_id: &str) -> Option<PendingFdwXact> {
        if let Some(p) = self.pending.read().get(fdwxact_id) {
            return Some(p.clone());
        }
        self.abandoned.read().get(fdwxact_id).cloned()
    }

    pub fn list_abandoned(&self) -> Vec<PendingFdwXact> {
        let mut list: Vec<PendingFdwXact> = self.abandoned.read().values().cloned().collect();
        list.sort_by(|a, b| a.fx.fdwxact_id.cmp(&b.fx.fdwxact_id));
        list
    }

    pub fn abandoned_count(&self) -> usize {
        self.abandoned.read().len()
    }

    /// Put an abandoned entry back in the queue with a fresh attempt budget.
    pub fn retry_abandoned(&self, fdwxact_id: &str) -> bool {
        let mut pending = self.pending.write();
        let Some(mut p) = self.abandoned.write().remove(fdwxact_id) else {
            return false;
        };
        p.attempts = 0;
        tracing::info!(fdwxact_id, "abandoned foreign transaction re-queued");
        pending.insert(fdwxact_id.to_string(), p);
        true
    }

    /// Drop an abandoned entry an operator resolved by hand.
    pub fn discard_abandoned(&self, fdwxact_id: &str) -> Option<PendingFdwXact> {
        let p = self.abandoned.write().remove(fdwxact_id)?;
        tracing::info!(fdwxact_id, status = ?p.status, "abandoned foreign transaction discarded");
        Some(p)
    }

    pub fn in_doubt_count(&self) -> usize {
        self.counts().1
    }

    pub fn total_resolved(&self) -> u64 {
        self.total_resolved.load(Ordering::Relaxed)
    }
}

/// Stops and joins the sweep thread when dropped.
pub struct FdwXactResolverHandle {
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl FdwXactResolverHandle {
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for FdwXactResolverHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
