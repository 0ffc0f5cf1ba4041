//! Per-session cache of remote connections.
//!
//! One entry per user mapping. An entry keeps its link across local
//! transactions and mirrors the local (sub)transaction nesting on the remote
//! side: a top-level remote transaction at depth 1 plus one savepoint per
//! local subtransaction level.
//!
//! Every state-changing remote command runs inside
//! [`ConnCacheEntry::run_transition`]. If that command fails the entry is
//! left [`XactState::Unsafe`]: the remote transaction state is unknown, so
//! the link is never reused and is discarded at transaction end.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use meridian_common::config::FdwConfig;
use meridian_common::error::FdwError;
use meridian_common::types::{Csn, IsolationLevel, ServerId, UserId, UserMappingId};
use meridian_observability::record_connection_event;

use crate::catalog::{catalog_hash, ConnParams, ForeignCatalog, ForeignServer, UserMapping};
use crate::inval::{CatalogCache, CatalogInvalidation, CatalogObserver, InvalidationInbox};
use crate::link::{exec_cleanup_query, Connector, LinkStatus, RemoteLink, RemoteTxnStatus};
use crate::xact::{LocalXactState, SubXactEvent, SubXactObserver};

/// Remote transaction state of one cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XactState {
    /// No remote transaction open.
    Idle,
    /// Remote transaction open at the given depth (1 = top level).
    Open(u32),
    /// A state-changing command is in flight.
    Transitioning(u32),
    /// A state change was interrupted; the remote state is unknown.
    Unsafe(u32),
}

impl XactState {
    pub fn depth(self) -> u32 {
        match self {
            XactState::Idle => 0,
            XactState::Open(d) | XactState::Transitioning(d) | XactState::Unsafe(d) => d,
        }
    }

    /// Transitioning counts too: a transition that never settled was
    /// interrupted.
    pub fn is_unsafe(self) -> bool {
        matches!(self, XactState::Transitioning(_) | XactState::Unsafe(_))
    }

    fn settled(depth: u32) -> Self {
        if depth == 0 {
            XactState::Idle
        } else {
            XactState::Open(depth)
        }
    }

    fn with_depth(self, depth: u32) -> Self {
        match self {
            XactState::Unsafe(_) | XactState::Transitioning(_) => XactState::Unsafe(depth),
            _ => XactState::settled(depth),
        }
    }
}

/// A foreign server taking part in the current local transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub mapping: UserMappingId,
    pub server: ServerId,
    pub server_name: String,
    pub user: UserId,
    /// Written to during this transaction.
    pub modified: bool,
}

/// Read-only view of an entry, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub server_name: String,
    pub state: XactState,
    pub connected: bool,
    pub invalidated: bool,
    pub have_prep_stmt: bool,
    pub have_error: bool,
    pub modified: bool,
    pub imported_csn: Option<Csn>,
}

pub(crate) struct ConnCacheEntry {
    pub(crate) key: UserMappingId,
    pub(crate) link: Option<Box<dyn RemoteLink>>,
    pub(crate) state: XactState,
    pub(crate) have_prep_stmt: bool,
    pub(crate) have_error: bool,
    pub(crate) invalidated: bool,
    pub(crate) modified: bool,
    pub(crate) imported_csn: Option<Csn>,
    pub(crate) server: ServerId,
    pub(crate) server_name: String,
    pub(crate) user: UserId,
    server_hash: u32,
    mapping_hash: u32,
}

impl ConnCacheEntry {
    pub(crate) fn new(key: UserMappingId) -> Self {
        Self {
            key,
            link: None,
            state: XactState::Idle,
            have_prep_stmt: false,
            have_error: false,
            invalidated: false,
            modified: false,
            imported_csn: None,
            server: ServerId(0),
            server_name: String::new(),
            user: UserId(0),
            server_hash: 0,
            mapping_hash: 0,
        }
    }

    fn reset_for(&mut self, server: &ForeignServer, mapping: &UserMapping) {
        self.state = XactState::Idle;
        self.have_prep_stmt = false;
        self.have_error = false;
        self.invalidated = false;
        self.modified = false;
        self.imported_csn = None;
        self.server = server.id;
        self.server_name = server.name.clone();
        self.user = mapping.user;
        self.server_hash = catalog_hash(server.id.0);
        self.mapping_hash = catalog_hash(mapping.id.0);
    }

    pub(crate) fn disconnect(&mut self) {
        if self.link.take().is_some() {
            tracing::debug!(server = %self.server_name, mapping = self.key.0, "closed remote connection");
            record_connection_event("disconnect");
        }
    }

    pub(crate) fn link_mut(&mut self) -> Result<&mut dyn RemoteLink, FdwError> {
        match self.link.as_deref_mut() {
            Some(link) => Ok(link),
            None => Err(FdwError::NoRemoteTransaction(self.key.0)),
        }
    }

    /// Fail fast on an entry whose last state change never completed. The
    /// link is dropped so nothing else is sent on it.
    pub(crate) fn reject_incomplete_state_change(&mut self) -> Result<(), FdwError> {
        if self.link.is_none() || !self.state.is_unsafe() {
            return Ok(());
        }
        self.disconnect();
        record_connection_event("reject");
        Err(FdwError::ConnectionUnsafe {
            server: self.server_name.clone(),
        })
    }

    /// Run a command that changes the remote transaction state. On error the
    /// entry stays unsafe at its current depth.
    pub(crate) fn run_transition<T>(
        &mut self,
        command: impl FnOnce(&mut dyn RemoteLink) -> Result<T, FdwError>,
    ) -> Result<T, FdwError> {
        let depth = self.state.depth();
        self.state = XactState::Transitioning(depth);
        let result = match self.link.as_deref_mut() {
            Some(link) => command(link),
            None => Err(FdwError::RemoteTransactionLost {
                server: self.server_name.clone(),
                detail: "no connection".into(),
            }),
        };
        self.state = match result {
            Ok(_) => XactState::settled(depth),
            Err(_) => XactState::Unsafe(depth),
        };
        result
    }

    /// Best-effort `DEALLOCATE ALL` after errors may have orphaned prepared
    /// statements. Its own failure is ignored.
    pub(crate) fn deallocate_if_needed(&mut self) {
        if !(self.have_prep_stmt && self.have_error) {
            return;
        }
        if let Some(link) = self.link.as_deref_mut() {
            if let Err(e) = link.execute("DEALLOCATE ALL") {
                tracing::debug!(server = %self.server_name, error = %e, "DEALLOCATE ALL failed");
            }
        }
    }

    /// Reset per-transaction state. A link that is unhealthy, not idle, or
    /// was caught mid-transition is discarded.
    pub(crate) fn cleanup_after_transaction(&mut self) {
        self.have_prep_stmt = false;
        self.have_error = false;
        self.imported_csn = None;

        let discard = self.link.as_deref().is_some_and(|link| {
            link.status() != LinkStatus::Ok
                || link.transaction_status() != RemoteTxnStatus::Idle
                || self.state.is_unsafe()
        });
        if discard {
            tracing::debug!(server = %self.server_name, state = ?self.state, "discarding connection");
            record_connection_event("discard");
            self.link = None;
        }
        self.state = XactState::Idle;
    }

    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            server_name: self.server_name.clone(),
            state: self.state,
            connected: self.link.is_some(),
            invalidated: self.invalidated,
            have_prep_stmt: self.have_prep_stmt,
            have_error: self.have_error,
            modified: self.modified,
            imported_csn: self.imported_csn,
        }
    }
}

/// A live remote connection handed out for the current transaction.
pub struct ConnectionHandle<'a> {
    mapping: UserMappingId,
    server_name: &'a str,
    link: &'a mut dyn RemoteLink,
}

impl ConnectionHandle<'_> {
    pub fn mapping(&self) -> UserMappingId {
        self.mapping
    }

    pub fn server_name(&self) -> &str {
        self.server_name
    }

    pub fn link(&mut self) -> &mut dyn RemoteLink {
        &mut *self.link
    }

    pub fn execute(&mut self, sql: &str) -> Result<(), FdwError> {
        self.link.execute(sql)
    }

    pub fn query_scalar(&mut self, sql: &str) -> Result<Option<String>, FdwError> {
        self.link.query_scalar(sql)
    }
}

pub struct ConnectionCache {
    pub(crate) entries: HashMap<UserMappingId, ConnCacheEntry>,
    pub(crate) catalog: Arc<dyn ForeignCatalog>,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) config: FdwConfig,
    inbox: Option<Arc<InvalidationInbox>>,
    participants: Vec<Participant>,
    xact_got_connection: bool,
    pub(crate) cursor_number: u32,
    prep_stmt_number: u32,
}

impl ConnectionCache {
    pub fn new(
        catalog: Arc<dyn ForeignCatalog>,
        connector: Arc<dyn Connector>,
        config: FdwConfig,
    ) -> Self {
        Self {
            entries: HashMap::new(),
            catalog,
            connector,
            config,
            inbox: None,
            participants: Vec::new(),
            xact_got_connection: false,
            cursor_number: 0,
            prep_stmt_number: 0,
        }
    }

    /// Receive catalog invalidations from `inbox` at every acquisition.
    pub fn with_invalidations(mut self, inbox: Arc<InvalidationInbox>) -> Self {
        self.inbox = Some(inbox);
        self
    }

    pub fn config(&self) -> &FdwConfig {
        &self.config
    }

    fn cleanup_deadline(&self) -> Duration {
        Duration::from_millis(self.config.cleanup_timeout_ms)
    }

    /// Process catalog invalidations queued since the last call.
    pub fn accept_invalidations(&mut self) {
        if let Some(inbox) = self.inbox.clone() {
            inbox.deliver(self);
        }
    }

    /// Connection for `mapping` with a remote transaction open at the local
    /// nesting level of `xact`.
    ///
    /// A connection-level failure while opening the top-level remote
    /// transaction is retried once on a fresh connection.
    pub fn acquire(
        &mut self,
        mapping_id: UserMappingId,
        xact: &LocalXactState,
        will_prep_stmt: bool,
    ) -> Result<ConnectionHandle<'_>, FdwError> {
        self.accept_invalidations();
        let mapping = self.catalog.user_mapping(mapping_id)?;
        self.xact_got_connection = true;

        let Self {
            entries,
            catalog,
            connector,
            config,
            participants,
            ..
        } = self;
        let entry = entries
            .entry(mapping_id)
            .or_insert_with(|| ConnCacheEntry::new(mapping_id));

        entry.reject_incomplete_state_change()?;

        if entry.link.is_some() && entry.invalidated && entry.state.depth() == 0 {
            tracing::debug!(
                server = %entry.server_name,
                mapping = mapping_id.0,
                "closing connection for option changes to take effect"
            );
            entry.disconnect();
        }

        if entry.link.is_none() {
            make_new_connection(entry, &mapping, &**catalog, &**connector, config)?;
        }

        if let Err(e) = begin_remote_xact(entry, xact, participants) {
            let link_bad = entry
                .link
                .as_deref()
                .is_some_and(|link| link.status() == LinkStatus::Bad);
            if !(e.is_connection_failure() && link_bad && entry.state.depth() == 0) {
                return Err(e);
            }
            tracing::debug!(
                server = %entry.server_name,
                error = %e,
                "could not start remote transaction on a broken connection, retrying"
            );
            record_connection_event("retry");
            entry.disconnect();
            make_new_connection(entry, &mapping, &**catalog, &**connector, config)?;
            begin_remote_xact(entry, xact, participants)?;
        }

        entry.have_prep_stmt |= will_prep_stmt;

        let ConnCacheEntry {
            link, server_name, ..
        } = entry;
        let link = link
            .as_deref_mut()
            .ok_or(FdwError::NoRemoteTransaction(mapping_id.0))?;
        Ok(ConnectionHandle {
            mapping: mapping_id,
            server_name: server_name.as_str(),
            link,
        })
    }

    /// Record that the current transaction wrote through `mapping`.
    pub fn mark_modified(&mut self, mapping: UserMappingId) {
        let Some(entry) = self.entries.get_mut(&mapping) else {
            return;
        };
        if !entry.modified {
            register_participant(&mut self.participants, entry, true);
            entry.modified = true;
        }
    }

    /// Cursor names only need to be unique within a transaction.
    pub fn next_cursor_number(&mut self) -> u32 {
        self.cursor_number = self.cursor_number.wrapping_add(1);
        self.cursor_number
    }

    /// Never reset within a session: stale statements may survive a
    /// transaction on some connection.
    pub fn next_prep_stmt_number(&mut self) -> u32 {
        self.prep_stmt_number = self.prep_stmt_number.wrapping_add(1);
        self.prep_stmt_number
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    /// Forget the transaction's participants once every one of them has
    /// been resolved.
    pub fn end_transaction(&mut self) {
        self.participants.clear();
        self.xact_got_connection = false;
        self.cursor_number = 0;
    }

    pub fn connection_info(&self, mapping: UserMappingId) -> Option<ConnectionInfo> {
        self.entries.get(&mapping).map(ConnCacheEntry::info)
    }

    pub fn open_connections(&self) -> usize {
        self.entries.values().filter(|e| e.link.is_some()).count()
    }

    /// Run the end-of-transaction reset for one entry.
    pub(crate) fn cleanup_entry(&mut self, mapping: UserMappingId) {
        if let Some(entry) = self.entries.get_mut(&mapping) {
            entry.cleanup_after_transaction();
        }
        self.cursor_number = 0;
    }

    fn abort_subxact(entry: &mut ConnCacheEntry, level: u32, deadline: Duration) {
        let depth = entry.state.depth();
        entry.state = XactState::Transitioning(depth);
        entry.have_error = true;

        let failed = match entry.link.as_deref_mut() {
            None => true,
            Some(link) => {
                if link.transaction_status() == RemoteTxnStatus::Active && !link.cancel(deadline) {
                    true
                } else {
                    let sql = format!("ROLLBACK TO SAVEPOINT s{level}; RELEASE SAVEPOINT s{level}");
                    !exec_cleanup_query(link, &sql, deadline, false)
                }
            }
        };
        if failed {
            tracing::warn!(server = %entry.server_name, level, "remote subtransaction abort cleanup failed");
        }
        entry.state = if failed {
            XactState::Unsafe(depth)
        } else {
            XactState::Open(depth)
        };
    }
}

impl SubXactObserver for ConnectionCache {
    fn on_subxact(&mut self, event: SubXactEvent, level: u32) -> Result<(), FdwError> {
        if !matches!(event, SubXactEvent::PreCommitSub | SubXactEvent::AbortSub) {
            return Ok(());
        }
        if !self.xact_got_connection {
            return Ok(());
        }
        let deadline = self.cleanup_deadline();

        for entry in self.entries.values_mut() {
            let depth = entry.state.depth();
            if entry.link.is_none() || depth < level {
                continue;
            }
            if depth > level {
                return Err(FdwError::MissedSubxactCleanup(depth));
            }

            match event {
                SubXactEvent::PreCommitSub => {
                    entry.reject_incomplete_state_change()?;
                    let sql = format!("RELEASE SAVEPOINT s{level}");
                    entry.run_transition(|link| link.execute(&sql))?;
                }
                _ => {
                    if !entry.state.is_unsafe() {
                        Self::abort_subxact(entry, level, deadline);
                    }
                }
            }
            entry.state = entry.state.with_depth(depth - 1);
        }
        Ok(())
    }
}

impl CatalogObserver for ConnectionCache {
    /// Connections are not closed here: one may carry an open transaction.
    /// The next acquisition at depth 0 replaces it.
    fn on_invalidation(&mut self, inval: CatalogInvalidation) {
        for entry in self.entries.values_mut() {
            if entry.link.is_none() {
                continue;
            }
            let hit = inval.is_reset()
                || match inval.cache {
                    CatalogCache::ForeignServer => entry.server_hash == inval.hash,
                    CatalogCache::UserMapping => entry.mapping_hash == inval.hash,
                };
            if hit && !entry.invalidated {
                entry.invalidated = true;
                record_connection_event("invalidate");
                tracing::debug!(server = %entry.server_name, mapping = entry.key.0, "connection invalidated");
            }
        }
    }
}

fn register_participant(participants: &mut Vec<Participant>, entry: &ConnCacheEntry, modified: bool) {
    match participants.iter_mut().find(|p| p.mapping == entry.key) {
        Some(p) => p.modified |= modified,
        None => participants.push(Participant {
            mapping: entry.key,
            server: entry.server,
            server_name: entry.server_name.clone(),
            user: entry.user,
            modified,
        }),
    }
}

/// Reset `entry` for `mapping` and open a configured link.
pub(crate) fn make_new_connection(
    entry: &mut ConnCacheEntry,
    mapping: &UserMapping,
    catalog: &dyn ForeignCatalog,
    connector: &dyn Connector,
    config: &FdwConfig,
) -> Result<(), FdwError> {
    let server = catalog.server(mapping.server)?;
    entry.reset_for(&server, mapping);
    let link = connect_server(&server, mapping, catalog, connector, &config.application_name)?;
    entry.link = Some(link);
    record_connection_event("connect");
    tracing::debug!(server = %server.name, mapping = mapping.id.0, "new remote connection");
    Ok(())
}

fn connect_server(
    server: &ForeignServer,
    mapping: &UserMapping,
    catalog: &dyn ForeignCatalog,
    connector: &dyn Connector,
    application_name: &str,
) -> Result<Box<dyn RemoteLink>, FdwError> {
    let params = ConnParams::assemble(server, mapping, application_name);
    let superuser = catalog.is_superuser(mapping.user);
    check_conn_params(&params, mapping, superuser)?;

    let mut link = connector.connect(&params)?;

    // A non-superuser must not ride on the local server's own identity.
    if !superuser && mapping.password_required() && !link.used_password() {
        return Err(FdwError::PasswordRequired {
            detail: "Non-superuser cannot connect if the server does not request a password."
                .into(),
        });
    }

    configure_remote_session(link.as_mut())?;
    Ok(link)
}

/// Non-superusers must bring their own password unless the mapping waives
/// it, so nothing is picked up from the local server's environment.
fn check_conn_params(params: &ConnParams, mapping: &UserMapping, superuser: bool) -> Result<(), FdwError> {
    if superuser || params.has_password() || !mapping.password_required() {
        return Ok(());
    }
    Err(FdwError::PasswordRequired {
        detail: "Non-superusers must provide a password in the user mapping.".into(),
    })
}

/// Session settings that make remote output unambiguous, set once per link.
fn configure_remote_session(link: &mut dyn RemoteLink) -> Result<(), FdwError> {
    let version = link.server_version();
    link.execute("SET search_path = pg_catalog")?;
    link.execute("SET timezone = 'UTC'")?;
    link.execute("SET datestyle = ISO")?;
    if version >= 80400 {
        link.execute("SET intervalstyle = postgres")?;
    }
    if version >= 90000 {
        link.execute("SET extra_float_digits = 3")
    } else {
        link.execute("SET extra_float_digits = 2")
    }
}

/// Open the remote transaction if needed, push the global snapshot, then
/// stack savepoints up to the local nesting level.
///
/// Remote transactions are at least REPEATABLE READ so that several scans
/// within one local query share a snapshot.
fn begin_remote_xact(
    entry: &mut ConnCacheEntry,
    xact: &LocalXactState,
    participants: &mut Vec<Participant>,
) -> Result<(), FdwError> {
    if entry.state.depth() == 0 {
        tracing::trace!(server = %entry.server_name, "starting remote transaction");
        if xact.global_csn().is_some() && xact.isolation() != IsolationLevel::RepeatableRead {
            return Err(FdwError::GlobalSnapshotIsolation);
        }
        register_participant(participants, entry, false);

        let sql = if xact.isolation().is_serializable() {
            "START TRANSACTION ISOLATION LEVEL SERIALIZABLE"
        } else {
            "START TRANSACTION ISOLATION LEVEL REPEATABLE READ"
        };
        entry.run_transition(|link| link.execute(sql))?;
        entry.state = XactState::Open(1);
        entry.modified = false;
    }

    sync_csn_snapshot(entry, xact)?;

    while entry.state.depth() < xact.nest_level() {
        let next = entry.state.depth() + 1;
        let sql = format!("SAVEPOINT s{next}");
        entry.run_transition(|link| link.execute(&sql))?;
        entry.state = XactState::Open(next);
    }
    Ok(())
}

/// Push the local snapshot CSN to the remote session when it changed.
fn sync_csn_snapshot(entry: &mut ConnCacheEntry, xact: &LocalXactState) -> Result<(), FdwError> {
    let Some(csn) = xact.global_csn() else {
        return Ok(());
    };
    if entry.imported_csn == Some(csn) {
        return Ok(());
    }
    entry.imported_csn = Some(csn);
    let sql = format!("SELECT csn_snapshot_import({})", csn.0);
    entry
        .run_transition(|link| link.query_scalar(&sql))
        .map_err(|e| e.with_context("failed to import CSN snapshot in remote server"))?;
    Ok(())
}
