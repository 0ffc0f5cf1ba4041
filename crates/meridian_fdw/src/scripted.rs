//! In-memory remote links driven by a shared script.
//!
//! Every link opened by a [`ScriptedConnector`] records the SQL it is sent
//! in one shared log and consults the script for injected failures, canned
//! query results and session properties. Used for exercising the cache and
//! the commit protocol without a live server.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use meridian_common::error::FdwError;

use crate::catalog::ConnParams;
use crate::link::{txn_status_after, Connector, LinkStatus, RemoteLink, RemoteTxnStatus};

/// A failure injected into the next matching command(s).
#[derive(Debug, Clone)]
pub struct Fault {
    /// Only commands sent to this server; `None` matches every server.
    pub server: Option<String>,
    pub sql_prefix: String,
    /// `None` reports a connection failure.
    pub sqlstate: Option<String>,
    /// Leave the link in a bad state.
    pub break_link: bool,
    pub times: u32,
}

impl Fault {
    pub fn remote(sql_prefix: &str, sqlstate: &str) -> Self {
        Self {
            server: None,
            sql_prefix: sql_prefix.into(),
            sqlstate: Some(sqlstate.into()),
            break_link: false,
            times: 1,
        }
    }

    pub fn broken_link(sql_prefix: &str) -> Self {
        Self {
            server: None,
            sql_prefix: sql_prefix.into(),
            sqlstate: None,
            break_link: true,
            times: 1,
        }
    }

    pub fn on_server(mut self, server: &str) -> Self {
        self.server = Some(server.into());
        self
    }

    pub fn times(mut self, times: u32) -> Self {
        self.times = times;
        self
    }

    fn matches(&self, server: &str, sql: &str) -> bool {
        self.times > 0
            && self.server.as_deref().map_or(true, |s| s == server)
            && sql.starts_with(&self.sql_prefix)
    }
}

#[derive(Debug)]
struct ScriptState {
    log: Vec<(String, String)>,
    faults: Vec<Fault>,
    scalars: Vec<(String, String)>,
    connects: HashMap<String, u32>,
    refuse_connect: HashMap<String, String>,
    /// Servers whose links report a still-running command.
    busy: HashMap<String, bool>,
    cancel_fails: bool,
    server_version: u32,
    used_password: bool,
}

/// Shared script and SQL log.
#[derive(Debug)]
pub struct RemoteScript {
    state: Mutex<ScriptState>,
}

impl Default for RemoteScript {
    fn default() -> Self {
        Self {
            state: Mutex::new(ScriptState {
                log: Vec::new(),
                faults: Vec::new(),
                scalars: Vec::new(),
                connects: HashMap::new(),
                refuse_connect: HashMap::new(),
                busy: HashMap::new(),
                cancel_fails: false,
                server_version: 160000,
                used_password: true,
            }),
        }
    }
}

impl RemoteScript {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inject(&self, fault: Fault) {
        self.state.lock().faults.push(fault);
    }

    /// Result for queries starting with `sql_prefix`; the latest
    /// registration wins.
    pub fn respond(&self, sql_prefix: &str, value: &str) {
        self.state
            .lock()
            .scalars
            .push((sql_prefix.into(), value.into()));
    }

    pub fn refuse_connections(&self, server: &str, detail: &str) {
        self.state
            .lock()
            .refuse_connect
            .insert(server.into(), detail.into());
    }

    pub fn accept_connections(&self, server: &str) {
        self.state.lock().refuse_connect.remove(server);
    }

    pub fn set_busy(&self, server: &str, busy: bool) {
        self.state.lock().busy.insert(server.into(), busy);
    }

    pub fn set_cancel_fails(&self, fails: bool) {
        self.state.lock().cancel_fails = fails;
    }

    pub fn set_server_version(&self, version: u32) {
        self.state.lock().server_version = version;
    }

    pub fn set_used_password(&self, used: bool) {
        self.state.lock().used_password = used;
    }

    pub fn connects(&self, server: &str) -> u32 {
        self.state.lock().connects.get(server).copied().unwrap_or(0)
    }

    /// Every command sent to `server`, in order.
    pub fn sql_for(&self, server: &str) -> Vec<String> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|(s, _)| s == server)
            .map(|(_, sql)| sql.clone())
            .collect()
    }

    /// Commands sent to `server` after session setup (`SET ...`).
    pub fn xact_sql_for(&self, server: &str) -> Vec<String> {
        self.sql_for(server)
            .into_iter()
            .filter(|sql| !sql.starts_with("SET "))
            .collect()
    }

    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    fn record(&self, server: &str, sql: &str) -> Option<Fault> {
        let mut state = self.state.lock();
        state.log.push((server.into(), sql.into()));
        let fault = state.faults.iter_mut().find(|f| f.matches(server, sql))?;
        fault.times -= 1;
        Some(fault.clone())
    }

    fn scalar(&self, sql: &str) -> Option<String> {
        self.state
            .lock()
            .scalars
            .iter()
            .rev()
            .find(|(prefix, _)| sql.starts_with(prefix.as_str()))
            .map(|(_, v)| v.clone())
    }
}

pub struct ScriptedConnector {
    script: Arc<RemoteScript>,
}

impl ScriptedConnector {
    pub fn new(script: Arc<RemoteScript>) -> Self {
        Self { script }
    }
}

impl Connector for ScriptedConnector {
    fn connect(&self, params: &ConnParams) -> Result<Box<dyn RemoteLink>, FdwError> {
        let server = params.server_name.clone();
        let mut state = self.script.state.lock();
        if let Some(detail) = state.refuse_connect.get(&server) {
            return Err(FdwError::ConnectFailed {
                server,
                detail: detail.clone(),
            });
        }
        *state.connects.entry(server.clone()).or_insert(0) += 1;
        let server_version = state.server_version;
        let used_password = state.used_password;
        drop(state);

        Ok(Box::new(ScriptedLink {
            server,
            script: Arc::clone(&self.script),
            status: LinkStatus::Ok,
            txn: RemoteTxnStatus::Idle,
            server_version,
            used_password,
        }))
    }
}

pub struct ScriptedLink {
    server: String,
    script: Arc<RemoteScript>,
    status: LinkStatus,
    txn: RemoteTxnStatus,
    server_version: u32,
    used_password: bool,
}

impl ScriptedLink {
    fn run(&mut self, sql: &str) -> Result<(), FdwError> {
        if self.status == LinkStatus::Bad {
            return Err(FdwError::remote(None, "no connection to the server", Some(sql)));
        }
        match self.script.record(&self.server, sql) {
            None => {
                self.txn = txn_status_after(self.txn, sql, true);
                Ok(())
            }
            Some(fault) => {
                if fault.break_link {
                    self.status = LinkStatus::Bad;
                    self.txn = RemoteTxnStatus::Unknown;
                } else {
                    self.txn = txn_status_after(self.txn, sql, false);
                }
                Err(FdwError::remote(fault.sqlstate, "injected failure", Some(sql)))
            }
        }
    }
}

impl RemoteLink for ScriptedLink {
    fn execute(&mut self, sql: &str) -> Result<(), FdwError> {
        self.run(sql)
    }

    fn query_scalar(&mut self, sql: &str) -> Result<Option<String>, FdwError> {
        self.run(sql)?;
        Ok(self.script.scalar(sql))
    }

    fn execute_with_deadline(&mut self, sql: &str, _deadline: Duration) -> Result<(), FdwError> {
        self.run(sql)
    }

    fn cancel(&mut self, _deadline: Duration) -> bool {
        let mut state = self.script.state.lock();
        state.log.push((self.server.clone(), "<cancel>".into()));
        if state.cancel_fails {
            return false;
        }
        state.busy.insert(self.server.clone(), false);
        true
    }

    fn status(&self) -> LinkStatus {
        self.status
    }

    fn transaction_status(&self) -> RemoteTxnStatus {
        let busy = self
            .script
            .state
            .lock()
            .busy
            .get(&self.server)
            .copied()
            .unwrap_or(false);
        if busy && self.status == LinkStatus::Ok {
            RemoteTxnStatus::Active
        } else {
            self.txn
        }
    }

    fn server_version(&self) -> u32 {
        self.server_version
    }

    fn used_password(&self) -> bool {
        self.used_password
    }
}
