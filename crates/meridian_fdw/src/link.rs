//! Remote link contract.
//!
//! A [`RemoteLink`] is one live session on a foreign server. All calls
//! block; the connection cache owns every link and never shares one
//! between sessions.

use std::time::Duration;

use meridian_common::error::FdwError;

use crate::catalog::ConnParams;

/// Health of the underlying socket/session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Ok,
    Bad,
}

/// Transaction status the remote session reports after the last command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteTxnStatus {
    /// No transaction open.
    Idle,
    /// A command is still executing.
    Active,
    /// Inside a healthy transaction block.
    InTrans,
    /// Inside a failed transaction block.
    InError,
    /// The session state cannot be determined (broken link).
    Unknown,
}

pub trait RemoteLink: Send {
    /// Run a command that returns no rows.
    fn execute(&mut self, sql: &str) -> Result<(), FdwError>;

    /// Run a query and return the first column of the first row.
    fn query_scalar(&mut self, sql: &str) -> Result<Option<String>, FdwError>;

    /// Run a command, giving up once `deadline` has elapsed.
    ///
    /// A timeout is reported as a connection failure (no SQLSTATE).
    fn execute_with_deadline(&mut self, sql: &str, deadline: Duration) -> Result<(), FdwError>;

    /// Cancel the in-flight command and drain its result within `deadline`.
    /// Returns false when the cancel could not be sent or the result never
    /// arrived.
    fn cancel(&mut self, deadline: Duration) -> bool;

    fn status(&self) -> LinkStatus;

    fn transaction_status(&self) -> RemoteTxnStatus;

    /// Remote server version in `PG_VERSION_NUM` form (e.g. 90600).
    fn server_version(&self) -> u32;

    /// Whether authentication used a password. Links that cannot observe the
    /// authentication exchange report whether one was supplied; the check
    /// after connecting then repeats the one made on the parameters.
    fn used_password(&self) -> bool;
}

/// Opens links. One connector is shared by every session of a node.
pub trait Connector: Send + Sync {
    fn connect(&self, params: &ConnParams) -> Result<Box<dyn RemoteLink>, FdwError>;
}

/// Run a cleanup command during abort.
///
/// True when the command succeeded, or when it failed with a remote error
/// and `ignore_errors` is set. A timeout or a connection-level failure is
/// always false: the link is presumed dead.
pub fn exec_cleanup_query(
    link: &mut dyn RemoteLink,
    sql: &str,
    deadline: Duration,
    ignore_errors: bool,
) -> bool {
    match link.execute_with_deadline(sql, deadline) {
        Ok(()) => true,
        Err(e) if e.is_connection_failure() => {
            tracing::warn!(sql, error = %e, "cleanup command failed on a dead link");
            false
        }
        Err(e) => {
            tracing::warn!(sql, error = %e, "cleanup command failed");
            ignore_errors
        }
    }
}

/// Transaction status after `sql` ran on a session that was in `current`,
/// for links that cannot read it off the protocol.
pub fn txn_status_after(current: RemoteTxnStatus, sql: &str, ok: bool) -> RemoteTxnStatus {
    if !ok {
        return match current {
            RemoteTxnStatus::Idle => RemoteTxnStatus::Idle,
            _ => RemoteTxnStatus::InError,
        };
    }
    let head = sql.trim_start().to_ascii_uppercase();
    if head.starts_with("START TRANSACTION")
        || head.starts_with("BEGIN")
        || head.starts_with("ROLLBACK TO SAVEPOINT")
    {
        RemoteTxnStatus::InTrans
    } else if [
        "COMMIT TRANSACTION",
        "ABORT TRANSACTION",
        "ROLLBACK TRANSACTION",
        "PREPARE TRANSACTION",
    ]
    .iter()
    .any(|verb| head.starts_with(verb))
    {
        RemoteTxnStatus::Idle
    } else {
        current
    }
}
