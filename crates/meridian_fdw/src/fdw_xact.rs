//! Foreign transaction resolution on one participant.
//!
//! These run at the end of the local transaction, once per participant,
//! and always finish with the entry's end-of-transaction reset.

use std::time::Duration;

use meridian_common::error::FdwError;
use meridian_common::types::{Csn, ServerId, UserId, UserMappingId};
use meridian_observability::record_fdw_xact;

use crate::connection::{make_new_connection, ConnCacheEntry, ConnectionCache, Participant, XactState};
use crate::link::{exec_cleanup_query, LinkStatus, RemoteTxnStatus};

/// One participant's share of a distributed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignXact {
    pub mapping: UserMappingId,
    pub server: ServerId,
    pub server_name: String,
    pub user: UserId,
    /// Prepared transaction identifier on the remote server.
    pub fdwxact_id: String,
    /// Commit or roll back the open remote transaction directly instead of
    /// resolving a prepared one.
    pub one_phase: bool,
}

impl ForeignXact {
    pub fn from_participant(p: &Participant, fdwxact_id: String, one_phase: bool) -> Self {
        Self {
            mapping: p.mapping,
            server: p.server,
            server_name: p.server_name.clone(),
            user: p.user,
            fdwxact_id,
            one_phase,
        }
    }
}

impl ConnectionCache {
    fn open_entry(&mut self, mapping: UserMappingId) -> Result<&mut ConnCacheEntry, FdwError> {
        match self.entries.get_mut(&mapping) {
            Some(entry) if entry.link.is_some() => Ok(entry),
            _ => Err(FdwError::NoRemoteTransaction(mapping.0)),
        }
    }

    /// `PREPARE TRANSACTION` the participant's open remote transaction.
    pub fn prepare_foreign(&mut self, fx: &ForeignXact) -> Result<(), FdwError> {
        let result = self.prepare_inner(fx);
        record_fdw_xact("prepare", true, result.is_ok());
        result
    }

    fn prepare_inner(&mut self, fx: &ForeignXact) -> Result<(), FdwError> {
        let entry = self.open_entry(fx.mapping)?;
        entry.reject_incomplete_state_change()?;

        let sql = format!("PREPARE TRANSACTION '{}'", fx.fdwxact_id);
        entry.run_transition(|link| link.execute(&sql)).map_err(|e| {
            e.with_context(format!(
                "could not prepare transaction on server {} with ID {}",
                fx.server_name, fx.fdwxact_id
            ))
        })?;
        tracing::debug!(server = %fx.server_name, fdwxact_id = %fx.fdwxact_id, "prepared foreign transaction");

        entry.deallocate_if_needed();
        self.cleanup_entry(fx.mapping);
        Ok(())
    }

    /// Commit the participant: directly when one-phase, otherwise by
    /// resolving its prepared transaction.
    pub fn commit_foreign(&mut self, fx: &ForeignXact) -> Result<(), FdwError> {
        let result = if fx.one_phase {
            self.commit_one_phase(fx)
        } else {
            self.end_prepared(fx, true)
        };
        record_fdw_xact("commit", !fx.one_phase, result.is_ok());
        result
    }

    fn commit_one_phase(&mut self, fx: &ForeignXact) -> Result<(), FdwError> {
        let entry = self.open_entry(fx.mapping)?;
        entry.reject_incomplete_state_change()?;

        entry
            .run_transition(|link| link.execute("COMMIT TRANSACTION"))
            .map_err(|e| e.with_context(format!("could not commit transaction on server {}", fx.server_name)))?;

        entry.deallocate_if_needed();
        self.cleanup_entry(fx.mapping);
        Ok(())
    }

    /// Roll back the participant.
    ///
    /// One-phase rollback never fails: cleanup problems are logged and leave
    /// the link marked unsafe, so it is discarded instead of reused.
    pub fn rollback_foreign(&mut self, fx: &ForeignXact) -> Result<(), FdwError> {
        let result = if fx.one_phase {
            self.rollback_one_phase(fx);
            Ok(())
        } else {
            self.end_prepared(fx, false)
        };
        record_fdw_xact("rollback", !fx.one_phase, result.is_ok());
        result
    }

    fn rollback_one_phase(&mut self, fx: &ForeignXact) {
        let deadline = Duration::from_millis(self.config.cleanup_timeout_ms);
        let Some(entry) = self.entries.get_mut(&fx.mapping) else {
            return;
        };

        // Nothing was ever opened, or the link is already beyond saving.
        if entry.link.is_none() || entry.state.is_unsafe() {
            self.cleanup_entry(fx.mapping);
            return;
        }

        let depth = entry.state.depth();
        entry.state = XactState::Transitioning(depth);
        entry.have_error = true;

        let mut failed = false;
        if let Some(link) = entry.link.as_deref_mut() {
            if link.transaction_status() == RemoteTxnStatus::Active && !link.cancel(deadline) {
                failed = true;
            } else if !exec_cleanup_query(link, "ABORT TRANSACTION", deadline, false) {
                failed = true;
            } else if entry.have_prep_stmt
                && entry.have_error
                && !exec_cleanup_query(link, "DEALLOCATE ALL", deadline, true)
            {
                failed = true;
            }
        }
        if failed {
            tracing::warn!(server = %fx.server_name, "could not abort remote transaction cleanly");
        }
        entry.state = if failed {
            XactState::Unsafe(depth)
        } else {
            XactState::Open(depth)
        };

        self.cleanup_entry(fx.mapping);
    }

    /// `COMMIT PREPARED` / `ROLLBACK PREPARED`.
    ///
    /// The resolving session may not be the one that prepared, so a link is
    /// opened when there is none. A prepared transaction that the remote no
    /// longer knows counts as already resolved.
    fn end_prepared(&mut self, fx: &ForeignXact, commit: bool) -> Result<(), FdwError> {
        let mapping = self.catalog.user_mapping(fx.mapping)?;
        let ConnectionCache {
            entries,
            catalog,
            connector,
            config,
            ..
        } = self;
        let entry = entries
            .entry(fx.mapping)
            .or_insert_with(|| ConnCacheEntry::new(fx.mapping));

        if entry
            .link
            .as_deref()
            .is_some_and(|link| link.status() != LinkStatus::Ok)
        {
            entry.disconnect();
        }
        if entry.link.is_none() {
            make_new_connection(entry, &mapping, &**catalog, &**connector, config)?;
        }

        let verb = if commit { "COMMIT" } else { "ROLLBACK" };
        let sql = format!("{verb} PREPARED '{}'", fx.fdwxact_id);
        // No transition guard: a prepared transaction gets no further abort
        // callbacks, and a broken link is replaced on the next attempt.
        match entry.link_mut()?.execute(&sql) {
            Ok(()) => {}
            Err(e) if e.is_undefined_object() => {
                tracing::debug!(
                    server = %fx.server_name,
                    fdwxact_id = %fx.fdwxact_id,
                    "prepared foreign transaction not found, treating as resolved"
                );
            }
            Err(e) => return Err(e),
        }
        tracing::debug!(
            server = %fx.server_name,
            fdwxact_id = %fx.fdwxact_id,
            action = if commit { "commit" } else { "rollback" },
            "resolved prepared foreign transaction"
        );

        self.cleanup_entry(fx.mapping);
        Ok(())
    }

    /// Ask the participant to mark its prepared transaction in-doubt and
    /// propose a CSN for it.
    pub fn prepare_csn_snapshot(&mut self, fx: &ForeignXact) -> Result<Csn, FdwError> {
        let result = self.prepare_csn_inner(fx);
        record_fdw_xact("csn_prepare", true, result.is_ok());
        result
    }

    fn prepare_csn_inner(&mut self, fx: &ForeignXact) -> Result<Csn, FdwError> {
        let entry = self.open_entry(fx.mapping)?;
        let sql = format!("SELECT csn_snapshot_prepare('{}')", fx.fdwxact_id);
        let resp = entry
            .run_transition(|link| link.query_scalar(&sql))
            .map_err(|e| e.with_context(format!("could not prepare CSN snapshot with ID {}", fx.fdwxact_id)))?;

        let csn = resp
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| FdwError::InvalidCsnResponse {
                function: "csn_snapshot_prepare",
                fdwxact_id: fx.fdwxact_id.clone(),
            })?;

        self.cleanup_entry(fx.mapping);
        Ok(Csn(csn))
    }

    /// Push the agreed global CSN to the participant's prepared transaction.
    pub fn assign_global_csn(&mut self, fx: &ForeignXact, csn: Csn) -> Result<(), FdwError> {
        let result = self.assign_csn_inner(fx, csn);
        record_fdw_xact("csn_assign", true, result.is_ok());
        result
    }

    fn assign_csn_inner(&mut self, fx: &ForeignXact, csn: Csn) -> Result<(), FdwError> {
        let entry = self.open_entry(fx.mapping)?;
        let sql = format!("SELECT csn_snapshot_assign('{}', {})", fx.fdwxact_id, csn.0);
        entry.link_mut()?.query_scalar(&sql).map_err(|e| {
            e.with_context(format!(
                "could not assign global CSN to prepared transaction with ID {}",
                fx.fdwxact_id
            ))
        })?;
        tracing::debug!(
            server = %fx.server_name,
            fdwxact_id = %fx.fdwxact_id,
            csn = csn.0,
            "global CSN assigned to prepared foreign transaction"
        );

        self.cleanup_entry(fx.mapping);
        Ok(())
    }
}
