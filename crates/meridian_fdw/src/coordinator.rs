//! Commit coordinator for transactions that touched foreign servers.
//!
//! Protocol for a two-phase commit:
//! 1. **Prepare**: every remote writer runs `PREPARE TRANSACTION`. If any
//!    prepare fails, every participant and the local transaction abort.
//! 2. **CSN exchange** (global snapshots on): each prepared participant and
//!    the local transaction propose a CSN; the maximum is assigned to all of
//!    them so every node publishes the same commit CSN.
//! 3. **Local commit**: the decision point.
//! 4. **Resolve**: `COMMIT PREPARED` on every participant. Failures past the
//!    decision are handed to the resolver, never reported as a failed commit.
//!
//! Read-only participants are committed in one phase after the writers.

use std::sync::Arc;
use std::time::Instant;

use meridian_common::config::{FdwConfig, ForeignTwophaseCommit};
use meridian_common::error::{FdwError, MeridianError};
use meridian_common::types::{Csn, ServerId, UserId, Xid};
use meridian_csn::{Backend, CsnContext, LocalXact};

use crate::connection::{ConnectionCache, Participant};
use crate::fdw_xact::ForeignXact;
use crate::resolver::{FdwXactResolver, FdwXactStatus};

/// Identifier of a participant's prepared transaction.
pub fn fdwxact_id(xid: Xid, server: ServerId, user: UserId) -> String {
    format!("fx_{}_{}_{}", xid.0, server.0, user.0)
}

#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub two_phase: bool,
    /// Local transaction id; assigned for every two-phase commit.
    pub xid: Option<Xid>,
    /// Commit CSN of the local transaction, when CSN snapshots are on.
    pub csn: Option<Csn>,
    pub participants: usize,
    /// Prepared transactions left to the resolver.
    pub handed_to_resolver: Vec<String>,
    pub prepare_latency_us: u64,
    pub commit_latency_us: u64,
}

pub struct ForeignTxnCoordinator {
    csn: Arc<CsnContext>,
    config: FdwConfig,
    resolver: Arc<FdwXactResolver>,
}

impl ForeignTxnCoordinator {
    pub fn new(csn: Arc<CsnContext>, config: FdwConfig, resolver: Arc<FdwXactResolver>) -> Self {
        Self {
            csn,
            config,
            resolver,
        }
    }

    pub fn resolver(&self) -> &Arc<FdwXactResolver> {
        &self.resolver
    }

    /// Two-phase commit is used when it is required and more than one node,
    /// local or remote, was written to.
    pub fn requires_two_phase(&self, participants: &[Participant], local_wrote: bool) -> bool {
        let writers = participants.iter().filter(|p| p.modified).count() + usize::from(local_wrote);
        self.config.foreign_twophase_commit == ForeignTwophaseCommit::Required && writers > 1
    }

    /// Commit the local transaction `local` (if it wrote) together with every
    /// foreign participant registered in `cache`.
    pub fn commit(
        &self,
        cache: &mut ConnectionCache,
        backend: &Backend,
        local: Option<LocalXact>,
    ) -> Result<CommitOutcome, MeridianError> {
        let participants = cache.participants().to_vec();
        let two_phase = self.requires_two_phase(&participants, local.is_some());
        let result = if two_phase {
            self.commit_two_phase(cache, backend, local, &participants)
        } else {
            self.commit_one_phase(cache, backend, local, &participants)
        };
        cache.end_transaction();
        result
    }

    fn commit_one_phase(
        &self,
        cache: &mut ConnectionCache,
        backend: &Backend,
        local: Option<LocalXact>,
        participants: &[Participant],
    ) -> Result<CommitOutcome, MeridianError> {
        let start = Instant::now();
        let remote: Vec<ForeignXact> = participants
            .iter()
            .map(|p| ForeignXact::from_participant(p, String::new(), true))
            .collect();

        // Remote transactions commit before the local one.
        for (i, fx) in remote.iter().enumerate() {
            if let Err(e) = cache.commit_foreign(fx) {
                tracing::warn!(server = %fx.server_name, error = %e, "remote commit failed, aborting");
                for rest in &remote[i..] {
                    let _ = cache.rollback_foreign(rest);
                }
                self.abort_local(backend, local);
                return Err(e.into());
            }
        }

        let xid = local.as_ref().map(|xact| xact.xid);
        let csn = match local {
            Some(xact) => self.csn.commit_transaction(backend, xact)?,
            None => {
                self.csn.end_read_only(backend)?;
                None
            }
        };
        Ok(CommitOutcome {
            two_phase: false,
            xid,
            csn,
            participants: participants.len(),
            handed_to_resolver: Vec::new(),
            prepare_latency_us: 0,
            commit_latency_us: start.elapsed().as_micros() as u64,
        })
    }

    fn commit_two_phase(
        &self,
        cache: &mut ConnectionCache,
        backend: &Backend,
        local: Option<LocalXact>,
        participants: &[Participant],
    ) -> Result<CommitOutcome, MeridianError> {
        // Identifiers need a local xid even if only remote nodes were written.
        let local = match local {
            Some(xact) => xact,
            None => self.csn.begin_transaction(backend)?,
        };
        let xid = local.xid;

        let (writers, readers): (Vec<&Participant>, Vec<&Participant>) =
            participants.iter().partition(|p| p.modified);
        let writers: Vec<ForeignXact> = writers
            .into_iter()
            .map(|p| ForeignXact::from_participant(p, fdwxact_id(xid, p.server, p.user), false))
            .collect();
        let readers: Vec<ForeignXact> = readers
            .into_iter()
            .map(|p| ForeignXact::from_participant(p, String::new(), true))
            .collect();

        // ── Phase 1: Prepare ──
        let prepare_start = Instant::now();
        for (i, fx) in writers.iter().enumerate() {
            self.resolver.register(xid, fx.clone());
            if let Err(e) = cache.prepare_foreign(fx) {
                tracing::warn!(
                    server = %fx.server_name,
                    fdwxact_id = %fx.fdwxact_id,
                    error = %e,
                    "prepare failed, aborting distributed transaction"
                );
                self.abort_after_prepare_failure(cache, &writers[..i], &writers[i..], &readers, &e);
                self.abort_local(backend, Some(local));
                return Err(e.into());
            }
            self.resolver.set_status(&fx.fdwxact_id, FdwXactStatus::Prepared);
        }

        if self.csn.config().enable_csn_snapshot {
            if let Err(e) = self.exchange_csn(cache, backend, &local, &writers) {
                self.abort_prepared(cache, &writers, &e);
                self.rollback_readers(cache, &readers);
                self.abort_local(backend, Some(local));
                return Err(e);
            }
        }
        let prepare_latency_us = prepare_start.elapsed().as_micros() as u64;

        // The local commit is the decision.
        let commit_start = Instant::now();
        let csn = match self.csn.commit_transaction(backend, local) {
            Ok(csn) => csn,
            Err(e) => {
                self.abort_prepared(cache, &writers, &e);
                self.rollback_readers(cache, &readers);
                return Err(e.into());
            }
        };

        // ── Phase 2: Commit ──
        let mut handed_to_resolver = Vec::new();
        for fx in &writers {
            self.resolver.set_status(&fx.fdwxact_id, FdwXactStatus::Committing);
            match cache.commit_foreign(fx) {
                Ok(()) => self.resolver.forget(&fx.fdwxact_id),
                Err(e) => {
                    self.resolver
                        .hand_over(&fx.fdwxact_id, FdwXactStatus::Committing, &e);
                    handed_to_resolver.push(fx.fdwxact_id.clone());
                }
            }
        }
        for fx in &readers {
            if let Err(e) = cache.commit_foreign(fx) {
                tracing::warn!(server = %fx.server_name, error = %e, "read-only participant commit failed");
                let _ = cache.rollback_foreign(fx);
            }
        }

        tracing::debug!(
            xid = xid.0,
            writers = writers.len(),
            readers = readers.len(),
            csn = csn.map(|c| c.0),
            unresolved = handed_to_resolver.len(),
            "distributed transaction committed"
        );
        Ok(CommitOutcome {
            two_phase: true,
            xid: Some(xid),
            csn,
            participants: participants.len(),
            handed_to_resolver,
            prepare_latency_us,
            commit_latency_us: commit_start.elapsed().as_micros() as u64,
        })
    }

    /// Agree on one commit CSN: the maximum of every participant's proposal
    /// and the local one.
    fn exchange_csn(
        &self,
        cache: &mut ConnectionCache,
        backend: &Backend,
        local: &LocalXact,
        writers: &[ForeignXact],
    ) -> Result<Csn, MeridianError> {
        let mut max_csn = self.csn.csn_prepare_current(backend, local)?;
        for fx in writers {
            max_csn = max_csn.max(cache.prepare_csn_snapshot(fx)?);
        }
        for fx in writers {
            cache.assign_global_csn(fx, max_csn)?;
        }
        self.csn.csn_assign_current(backend, local, max_csn)?;
        tracing::debug!(xid = local.xid.0, csn = max_csn.0, participants = writers.len(), "agreed global CSN");
        Ok(max_csn)
    }

    /// Roll back the whole transaction: every participant in one phase,
    /// then the local transaction.
    pub fn rollback(&self, cache: &mut ConnectionCache, backend: &Backend, local: Option<LocalXact>) {
        let participants = cache.participants().to_vec();
        for p in &participants {
            let fx = ForeignXact::from_participant(p, String::new(), true);
            let _ = cache.rollback_foreign(&fx);
        }
        self.abort_local(backend, local);
        cache.end_transaction();
    }

    fn abort_after_prepare_failure(
        &self,
        cache: &mut ConnectionCache,
        prepared: &[ForeignXact],
        unprepared: &[ForeignXact],
        readers: &[ForeignXact],
        cause: &FdwError,
    ) {
        self.abort_prepared(cache, prepared, cause);
        for (i, fx) in unprepared.iter().enumerate() {
            let mut one_phase = fx.clone();
            one_phase.one_phase = true;
            let _ = cache.rollback_foreign(&one_phase);
            // The failed prepare may still have gone through on a lost link.
            if i == 0 && cause.is_connection_failure() {
                self.resolver
                    .hand_over(&fx.fdwxact_id, FdwXactStatus::Aborting, cause);
            } else {
                self.resolver.forget(&fx.fdwxact_id);
            }
        }
        self.rollback_readers(cache, readers);
    }

    fn abort_prepared(
        &self,
        cache: &mut ConnectionCache,
        prepared: &[ForeignXact],
        cause: &dyn std::fmt::Display,
    ) {
        for fx in prepared {
            self.resolver.set_status(&fx.fdwxact_id, FdwXactStatus::Aborting);
            match cache.rollback_foreign(fx) {
                Ok(()) => self.resolver.forget(&fx.fdwxact_id),
                Err(e) => {
                    tracing::warn!(fdwxact_id = %fx.fdwxact_id, cause = %cause, error = %e, "could not roll back prepared foreign transaction");
                    self.resolver
                        .hand_over(&fx.fdwxact_id, FdwXactStatus::Aborting, &e);
                }
            }
        }
    }

    fn rollback_readers(&self, cache: &mut ConnectionCache, readers: &[ForeignXact]) {
        for fx in readers {
            let _ = cache.rollback_foreign(fx);
        }
    }

    fn abort_local(&self, backend: &Backend, local: Option<LocalXact>) {
        let result = match local {
            Some(xact) => self.csn.abort_transaction(backend, xact),
            None => self.csn.end_read_only(backend),
        };
        if let Err(e) = result {
            tracing::error!(error = %e, "could not abort local transaction");
        }
    }
}
