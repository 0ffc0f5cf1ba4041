use thiserror::Error;

use crate::types::{Csn, Xid};

/// Convenience alias for `Result<T, MeridianError>`.
pub type MeridianResult<T> = Result<T, MeridianError>;

/// Error classification for retry/escalation decisions.
///
/// - `UserError`: bad configuration or credentials, unsupported isolation
/// - `Retryable`: the transaction failed but a fresh attempt may succeed
/// - `Transient`: the remote side is unreachable or slow; retry after back-off
/// - `InternalBug`: should never happen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Retryable,
    Transient,
    InternalBug,
}

/// Top-level error type that all crate-specific errors convert into.
#[derive(Error, Debug)]
pub enum MeridianError {
    #[error("CSN error: {0}")]
    Csn(#[from] CsnError),

    #[error("Foreign transaction error: {0}")]
    Fdw(#[from] FdwError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),

    /// Internal bug: should never occur in production.
    /// Always carries a unique `error_code` and `debug_context` for post-mortem.
    #[error("InternalBug [{error_code}]: {message} | context: {debug_context}")]
    InternalBug {
        error_code: &'static str,
        message: String,
        debug_context: String,
    },
}

/// Commit-sequence-number subsystem errors.
#[derive(Error, Debug)]
pub enum CsnError {
    /// The snapshot points further into the past than the xmin deferral map
    /// retains; the row versions it needs may already be reclaimed.
    #[error("snapshot too old: CSN {snapshot_csn} is older than the {window_secs}s retention window")]
    SnapshotTooOld { snapshot_csn: Csn, window_secs: u64 },

    #[error("could not write CSN log for transaction {xid}: {reason}")]
    LogWrite { xid: Xid, reason: String },

    #[error("could not read CSN log for transaction {xid}: {reason}")]
    LogRead { xid: Xid, reason: String },

    #[error("could not log CSN assignment: {0}")]
    WalWrite(String),

    #[error("CSN snapshots are disabled")]
    Disabled,

    #[error("transaction {xid} has unexpected CSN state {state}")]
    UnexpectedXidCsn { xid: Xid, state: String },

    #[error("xmin deferral map is not configured (csn_snapshot_defer_time = 0)")]
    XminMapUnavailable,

    #[error("prepared transaction {0} is not known to this node")]
    UnknownPreparedXact(String),

    #[error("transaction identifier \"{0}\" is already in use")]
    DuplicatePreparedXact(String),

    #[error("backend {0} is not registered")]
    UnknownBackend(u32),

    /// A CSN received from another node collides with the sentinel encodings
    /// or leaves no room above it.
    #[error("CSN {0} is out of range")]
    InvalidCsn(Csn),

    #[error("CSN space exhausted at {0}")]
    CsnExhausted(Csn),
}

/// Foreign (remote) transaction and connection errors.
#[derive(Error, Debug)]
pub enum FdwError {
    /// A previous transaction-state change on this connection was interrupted,
    /// so the remote transaction state is unknown.
    #[error("connection to server \"{server}\" was lost")]
    ConnectionUnsafe { server: String },

    #[error("password is required: {detail}")]
    PasswordRequired { detail: String },

    /// The link dropped while a transaction-state change was in flight.
    #[error("remote transaction on server \"{server}\" was lost: {detail}")]
    RemoteTransactionLost { server: String, detail: String },

    #[error("could not connect to server \"{server}\": {detail}")]
    ConnectFailed { server: String, detail: String },

    #[error("remote error{}: {message}{}", sqlstate_tag(.sqlstate), sql_tag(.sql))]
    Remote {
        sqlstate: Option<String>,
        message: String,
        sql: Option<String>,
    },

    #[error("missed cleaning up remote subtransaction at level {0}")]
    MissedSubxactCleanup(u32),

    #[error("global snapshots are only supported with REPEATABLE READ isolation level")]
    GlobalSnapshotIsolation,

    #[error("{function} returned invalid data for prepared transaction with ID {fdwxact_id}")]
    InvalidCsnResponse {
        function: &'static str,
        fdwxact_id: String,
    },

    #[error("catalog lookup failed: {0}")]
    Catalog(String),

    #[error("no open remote transaction for user mapping {0}")]
    NoRemoteTransaction(u32),
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn sqlstate_tag(sqlstate: &Option<String>) -> String {
    sqlstate
        .as_deref()
        .map(|s| format!(" [{s}]"))
        .unwrap_or_default()
}

fn sql_tag(sql: &Option<String>) -> String {
    sql.as_deref()
        .map(|s| format!(" (remote SQL command: {s})"))
        .unwrap_or_default()
}

// ── MeridianError classification & helpers ───────────────────────────────────

impl MeridianError {
    /// Classify this error for retry/escalation decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MeridianError::Config(_) => ErrorKind::UserError,
            MeridianError::Fdw(FdwError::PasswordRequired { .. }) => ErrorKind::UserError,
            MeridianError::Fdw(FdwError::GlobalSnapshotIsolation) => ErrorKind::UserError,
            MeridianError::Fdw(FdwError::Catalog(_)) => ErrorKind::UserError,
            MeridianError::Csn(CsnError::Disabled) => ErrorKind::UserError,
            MeridianError::Csn(CsnError::XminMapUnavailable) => ErrorKind::UserError,
            MeridianError::Csn(CsnError::InvalidCsn(_)) => ErrorKind::UserError,

            MeridianError::Csn(CsnError::SnapshotTooOld { .. }) => ErrorKind::Retryable,
            MeridianError::Fdw(FdwError::ConnectionUnsafe { .. }) => ErrorKind::Retryable,
            MeridianError::Fdw(FdwError::RemoteTransactionLost { .. }) => ErrorKind::Retryable,

            MeridianError::Fdw(FdwError::ConnectFailed { .. }) => ErrorKind::Transient,
            MeridianError::Fdw(FdwError::Remote { .. }) => ErrorKind::Transient,

            MeridianError::InternalBug { .. } => ErrorKind::InternalBug,
            _ => ErrorKind::InternalBug,
        }
    }

    /// Returns true if the client should retry this operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable)
    }

    /// Returns true if this is a user/configuration error.
    pub fn is_user_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::UserError)
    }

    /// Returns true if this is a transient remote error.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    /// Map to a PostgreSQL SQLSTATE code.
    pub fn pg_sqlstate(&self) -> String {
        let code = match self {
            MeridianError::Csn(CsnError::SnapshotTooOld { .. }) => "72000", // snapshot_too_old
            MeridianError::Csn(CsnError::InvalidCsn(_)) => "22023", // invalid_parameter_value
            MeridianError::Fdw(FdwError::ConnectionUnsafe { .. }) => "08000", // connection_exception
            MeridianError::Fdw(FdwError::RemoteTransactionLost { .. }) => "08006", // connection_failure
            MeridianError::Fdw(FdwError::ConnectFailed { .. }) => "08001", // sqlclient_unable_to_establish_sqlconnection
            MeridianError::Fdw(FdwError::PasswordRequired { .. }) => "2F003", // prohibited_sql_statement_attempted
            MeridianError::Fdw(FdwError::GlobalSnapshotIsolation) => "0A000", // feature_not_supported
            MeridianError::Fdw(FdwError::Remote {
                sqlstate: Some(code),
                ..
            }) => return code.clone(),
            MeridianError::Fdw(FdwError::Remote { sqlstate: None, .. }) => "08006",
            MeridianError::Config(_) => "F0000", // config_file_error
            _ => "XX000",                         // internal_error
        };
        code.to_string()
    }

    /// Construct an internal bug error with error code and context.
    pub fn internal_bug(
        error_code: &'static str,
        message: impl Into<String>,
        debug_context: impl Into<String>,
    ) -> Self {
        MeridianError::InternalBug {
            error_code,
            message: message.into(),
            debug_context: debug_context.into(),
        }
    }

    /// Add context string to an error, **preserving error classification**
    /// for structured variants.
    pub fn with_context(self, ctx: impl Into<String>) -> Self {
        let ctx = ctx.into();
        match self {
            MeridianError::Internal(msg) => MeridianError::Internal(format!("{ctx}: {msg}")),
            MeridianError::InternalBug {
                error_code,
                message,
                debug_context,
            } => MeridianError::InternalBug {
                error_code,
                message: format!("{ctx}: {message}"),
                debug_context,
            },
            MeridianError::Fdw(FdwError::Remote {
                sqlstate,
                message,
                sql,
            }) => MeridianError::Fdw(FdwError::Remote {
                sqlstate,
                message: format!("{ctx}: {message}"),
                sql,
            }),
            other => other,
        }
    }
}

impl FdwError {
    /// SQLSTATE for an undefined object; tolerated when resolving prepared
    /// transactions that no longer exist.
    pub const UNDEFINED_OBJECT: &'static str = "42704";
    pub const CONNECTION_FAILURE: &'static str = "08006";

    pub fn remote(
        sqlstate: Option<String>,
        message: impl Into<String>,
        sql: Option<&str>,
    ) -> Self {
        FdwError::Remote {
            sqlstate,
            message: message.into(),
            sql: sql.map(str::to_owned),
        }
    }

    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            FdwError::Remote { sqlstate, .. } => sqlstate.as_deref(),
            _ => None,
        }
    }

    pub fn is_undefined_object(&self) -> bool {
        self.sqlstate() == Some(Self::UNDEFINED_OBJECT)
    }

    /// Prefix the message of a remote error; other variants pass through.
    pub fn with_context(self, ctx: impl Into<String>) -> Self {
        match self {
            FdwError::Remote {
                sqlstate,
                message,
                sql,
            } => FdwError::Remote {
                sqlstate,
                message: format!("{}: {message}", ctx.into()),
                sql,
            },
            other => other,
        }
    }

    /// Connection-level failure as reported by the remote link.
    pub fn is_connection_failure(&self) -> bool {
        match self {
            FdwError::Remote { sqlstate, .. } => {
                sqlstate.as_deref().map_or(true, |s| s == Self::CONNECTION_FAILURE)
            }
            FdwError::RemoteTransactionLost { .. } | FdwError::ConnectFailed { .. } => true,
            _ => false,
        }
    }
}
