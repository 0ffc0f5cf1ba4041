//! Loopback cluster for integration tests.
//!
//! Each [`Node`] is a full CSN context. A [`LoopbackConnector`] opens links
//! that run the remote SQL surface directly against the named node, so a
//! commit coordinated on one node really prepares, assigns and commits on
//! another.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use meridian_common::config::{CsnConfig, FdwConfig, ForeignTwophaseCommit};
use meridian_common::error::{CsnError, FdwError};
use meridian_common::types::{Csn, ServerId, UserId, UserMappingId, Xid, XidCsn};
use meridian_csn::{Backend, CsnContext, CsnLog, LocalXact, ManualClock, MemCsnLog, MemCsnWal, Snapshot};
use meridian_fdw::link::txn_status_after;
use meridian_fdw::{
    ConnParams, ConnectionCache, Connector, ForeignServer, ForeignTxnCoordinator, FdwXactResolver,
    LinkStatus, MemCatalog, RemoteLink, RemoteTxnStatus, UserMapping,
};

pub const START: u64 = 1_000 * Csn::NSECS_PER_SEC;
pub const APP_USER: UserId = UserId(100);

pub struct Node {
    pub name: String,
    pub ctx: Arc<CsnContext>,
    pub log: Arc<MemCsnLog>,
    pub clock: Arc<ManualClock>,
    /// Keys written through links, with the writing xid.
    rows: Mutex<Vec<(String, Xid)>>,
    /// Snapshots imported through links, in order.
    imported: Mutex<Vec<Snapshot>>,
    /// Commands whose next execution drops the link.
    drop_on: Mutex<Vec<String>>,
}

impl Node {
    pub fn new(name: &str, clock_start: u64) -> Arc<Self> {
        let clock = Arc::new(ManualClock::new(clock_start));
        let log = Arc::new(MemCsnLog::new());
        let config = CsnConfig {
            enable_csn_snapshot: true,
            csn_snapshot_defer_time: 30,
            ..CsnConfig::default()
        };
        let ctx = CsnContext::new(config, clock.clone(), log.clone(), Arc::new(MemCsnWal::new()))
            .expect("valid CSN config");
        ctx.startup();
        Arc::new(Self {
            name: name.into(),
            ctx: Arc::new(ctx),
            log,
            clock,
            rows: Mutex::new(Vec::new()),
            imported: Mutex::new(Vec::new()),
            drop_on: Mutex::new(Vec::new()),
        })
    }

    pub fn writer_of(&self, key: &str) -> Option<Xid> {
        self.rows
            .lock()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, xid)| *xid)
    }

    pub fn last_imported(&self) -> Option<Snapshot> {
        self.imported.lock().last().cloned()
    }

    pub fn csn_of(&self, xid: Xid) -> XidCsn {
        self.log.get_csn(xid).expect("csn log readable")
    }

    pub fn drop_link_on(&self, sql_prefix: &str) {
        self.drop_on.lock().push(sql_prefix.into());
    }

    fn take_drop(&self, sql: &str) -> bool {
        let mut drop_on = self.drop_on.lock();
        match drop_on.iter().position(|p| sql.starts_with(p.as_str())) {
            Some(i) => {
                drop_on.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn is_visible(&self, xid: Xid, snapshot: &Snapshot) -> bool {
        !self
            .ctx
            .oracle()
            .and_then(|o| o.is_invisible(xid, snapshot))
            .expect("visibility check")
    }
}

pub struct LoopbackConnector {
    nodes: HashMap<String, Arc<Node>>,
}

impl LoopbackConnector {
    pub fn new(nodes: &[Arc<Node>]) -> Self {
        Self {
            nodes: nodes.iter().map(|n| (n.name.clone(), n.clone())).collect(),
        }
    }
}

impl Connector for LoopbackConnector {
    fn connect(&self, params: &ConnParams) -> Result<Box<dyn RemoteLink>, FdwError> {
        let node = self
            .nodes
            .get(&params.server_name)
            .ok_or_else(|| FdwError::ConnectFailed {
                server: params.server_name.clone(),
                detail: "no such node".into(),
            })?
            .clone();
        let backend = node.ctx.register_backend();
        Ok(Box::new(LoopbackLink {
            node,
            backend,
            xact: None,
            txn: RemoteTxnStatus::Idle,
            bad: false,
        }))
    }
}

struct LoopbackLink {
    node: Arc<Node>,
    backend: Backend,
    xact: Option<LocalXact>,
    txn: RemoteTxnStatus,
    bad: bool,
}

fn quoted(sql: &str) -> Option<&str> {
    let start = sql.find('\'')? + 1;
    let len = sql[start..].find('\'')?;
    Some(&sql[start..start + len])
}

fn trailing_number(sql: &str) -> Option<u64> {
    let at = sql.rfind(|c: char| c == '(' || c == ' ')?;
    sql[at + 1..].trim_end_matches(')').trim().parse().ok()
}

fn csn_error(e: CsnError, sql: &str) -> FdwError {
    let sqlstate = match e {
        CsnError::UnknownPreparedXact(_) => FdwError::UNDEFINED_OBJECT,
        CsnError::SnapshotTooOld { .. } => "72000",
        CsnError::InvalidCsn(_) => "22023",
        _ => "XX000",
    };
    FdwError::remote(Some(sqlstate.into()), e.to_string(), Some(sql))
}

impl LoopbackLink {
    fn end_local(&mut self, commit: bool) -> Result<(), CsnError> {
        let ctx = &self.node.ctx;
        match self.xact.take() {
            Some(xact) if commit => ctx.commit_transaction(&self.backend, xact).map(|_| ()),
            Some(xact) => ctx.abort_transaction(&self.backend, xact),
            None => ctx.end_read_only(&self.backend),
        }
    }

    fn dispatch(&mut self, sql: &str) -> Result<Option<String>, CsnError> {
        let ctx = self.node.ctx.clone();
        if sql.starts_with("SET ")
            || sql.starts_with("SAVEPOINT ")
            || sql.starts_with("RELEASE SAVEPOINT ")
            || sql.starts_with("ROLLBACK TO SAVEPOINT ")
            || sql == "DEALLOCATE ALL"
            || sql.starts_with("START TRANSACTION")
        {
            return Ok(None);
        }
        if sql.starts_with("SELECT csn_snapshot_import(") {
            let csn = Csn(trailing_number(sql).unwrap_or(0));
            let snapshot = ctx.import_snapshot(&self.backend, csn)?;
            self.node.imported.lock().push(snapshot);
            return Ok(None);
        }
        if let Some(key) = sql.strip_prefix("INSERT ") {
            let xid = match &self.xact {
                Some(xact) => xact.xid,
                None => {
                    let xact = ctx.begin_transaction(&self.backend)?;
                    let xid = xact.xid;
                    self.xact = Some(xact);
                    xid
                }
            };
            self.node.rows.lock().push((key.to_string(), xid));
            return Ok(None);
        }
        if sql.starts_with("PREPARE TRANSACTION ") {
            let gid = quoted(sql).unwrap_or_default();
            return match self.xact.take() {
                Some(xact) => ctx.prepare_transaction(&self.backend, xact, gid).map(|_| None),
                None => ctx.end_read_only(&self.backend).map(|_| None),
            };
        }
        if sql.starts_with("SELECT csn_snapshot_prepare(") {
            let gid = quoted(sql).unwrap_or_default();
            return ctx.csn_snapshot_prepare(gid).map(|csn| Some(csn.0.to_string()));
        }
        if sql.starts_with("SELECT csn_snapshot_assign(") {
            let gid = quoted(sql).unwrap_or_default();
            let csn = Csn(trailing_number(sql).unwrap_or(0));
            return ctx.csn_snapshot_assign(gid, csn).map(|_| None);
        }
        if sql.starts_with("COMMIT PREPARED ") {
            return ctx.commit_prepared(quoted(sql).unwrap_or_default()).map(|_| None);
        }
        if sql.starts_with("ROLLBACK PREPARED ") {
            return ctx.rollback_prepared(quoted(sql).unwrap_or_default()).map(|_| None);
        }
        if sql == "COMMIT TRANSACTION" {
            return self.end_local(true).map(|_| None);
        }
        if sql == "ABORT TRANSACTION" {
            return self.end_local(false).map(|_| None);
        }
        Err(CsnError::UnexpectedXidCsn {
            xid: Xid::INVALID,
            state: format!("unsupported command {sql}"),
        })
    }

    fn run(&mut self, sql: &str) -> Result<Option<String>, FdwError> {
        if self.bad {
            return Err(FdwError::remote(None, "no connection to the server", Some(sql)));
        }
        if self.node.take_drop(sql) {
            self.bad = true;
            self.txn = RemoteTxnStatus::Unknown;
            return Err(FdwError::remote(
                None,
                "server closed the connection unexpectedly",
                Some(sql),
            ));
        }
        match self.dispatch(sql) {
            Ok(value) => {
                self.txn = txn_status_after(self.txn, sql, true);
                Ok(value)
            }
            Err(e) => {
                self.txn = txn_status_after(self.txn, sql, false);
                Err(csn_error(e, sql))
            }
        }
    }
}

impl Drop for LoopbackLink {
    fn drop(&mut self) {
        // A dropped session aborts whatever it had open.
        if let Some(xact) = self.xact.take() {
            let _ = self.node.ctx.abort_transaction(&self.backend, xact);
        }
        self.node.ctx.proc_array().unregister_backend(self.backend.id);
    }
}

impl RemoteLink for LoopbackLink {
    fn execute(&mut self, sql: &str) -> Result<(), FdwError> {
        self.run(sql).map(|_| ())
    }

    fn query_scalar(&mut self, sql: &str) -> Result<Option<String>, FdwError> {
        self.run(sql)
    }

    fn execute_with_deadline(&mut self, sql: &str, _deadline: Duration) -> Result<(), FdwError> {
        self.run(sql).map(|_| ())
    }

    fn cancel(&mut self, _deadline: Duration) -> bool {
        !self.bad
    }

    fn status(&self) -> LinkStatus {
        if self.bad {
            LinkStatus::Bad
        } else {
            LinkStatus::Ok
        }
    }

    fn transaction_status(&self) -> RemoteTxnStatus {
        self.txn
    }

    fn server_version(&self) -> u32 {
        160000
    }

    fn used_password(&self) -> bool {
        true
    }
}

/// A coordinator node plus remote nodes reachable from it through one user
/// mapping each; mapping `i + 1` points at `remotes[i]`.
pub struct Cluster {
    pub local: Arc<Node>,
    pub remotes: Vec<Arc<Node>>,
    pub catalog: Arc<MemCatalog>,
    pub connector: Arc<LoopbackConnector>,
    pub config: FdwConfig,
}

impl Cluster {
    pub fn new(local: Arc<Node>, remotes: Vec<Arc<Node>>) -> Self {
        meridian_observability::init_tracing();
        let catalog = Arc::new(MemCatalog::new());
        for (i, node) in remotes.iter().enumerate() {
            let id = i as u32 + 1;
            catalog.upsert_server(ForeignServer {
                id: ServerId(id),
                name: node.name.clone(),
                options: vec![("host".into(), node.name.clone())],
            });
            catalog.upsert_user_mapping(UserMapping {
                id: UserMappingId(id),
                server: ServerId(id),
                user: APP_USER,
                options: vec![
                    ("user".into(), "app".into()),
                    ("password".into(), "secret".into()),
                ],
            });
        }
        let connector = Arc::new(LoopbackConnector::new(&remotes));
        Self {
            local,
            remotes,
            catalog,
            connector,
            config: FdwConfig {
                foreign_twophase_commit: ForeignTwophaseCommit::Required,
                ..FdwConfig::default()
            },
        }
    }

    pub fn session_cache(&self) -> ConnectionCache {
        ConnectionCache::new(self.catalog.clone(), self.connector.clone(), self.config.clone())
    }

    pub fn coordinator(&self) -> ForeignTxnCoordinator {
        let resolver = FdwXactResolver::new(self.session_cache(), &self.config);
        ForeignTxnCoordinator::new(self.local.ctx.clone(), self.config.clone(), resolver)
    }
}

pub fn mapping_of(i: usize) -> UserMappingId {
    UserMappingId(i as u32 + 1)
}
