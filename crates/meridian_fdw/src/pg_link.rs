//! [`RemoteLink`] over the PostgreSQL wire protocol.
//!
//! Each link owns a single-threaded tokio runtime that drives its connection
//! task; calls block on it, so the cache above stays synchronous.

use std::time::Duration;

use tokio::runtime::{Builder, Runtime};
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};

use meridian_common::error::FdwError;

use crate::catalog::ConnParams;
use crate::link::{txn_status_after, Connector, LinkStatus, RemoteLink, RemoteTxnStatus};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connects with `tokio-postgres`, without TLS.
#[derive(Debug, Default)]
pub struct PgConnector;

impl PgConnector {
    fn config(params: &ConnParams) -> Result<Config, FdwError> {
        let mut config = Config::new();
        config.host(params.get("host").unwrap_or("localhost"));
        if let Some(port) = params.get("port") {
            let port = port.parse::<u16>().map_err(|_| FdwError::ConnectFailed {
                server: params.server_name.clone(),
                detail: format!("invalid port \"{port}\""),
            })?;
            config.port(port);
        }
        if let Some(dbname) = params.get("dbname") {
            config.dbname(dbname);
        }
        if let Some(user) = params.get("user") {
            config.user(user);
        }
        if let Some(password) = params.get("password") {
            config.password(password);
        }
        match params.get("application_name") {
            Some(name) => config.application_name(name),
            None => config.application_name(params.get("fallback_application_name").unwrap_or("")),
        };
        if let Some(options) = params.get("options") {
            config.options(options);
        }
        let timeout = params
            .get("connect_timeout")
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|&secs| secs > 0)
            .map_or(DEFAULT_CONNECT_TIMEOUT, Duration::from_secs);
        config.connect_timeout(timeout);
        Ok(config)
    }
}

impl Connector for PgConnector {
    fn connect(&self, params: &ConnParams) -> Result<Box<dyn RemoteLink>, FdwError> {
        let connect_failed = |detail: String| FdwError::ConnectFailed {
            server: params.server_name.clone(),
            detail,
        };
        let config = Self::config(params)?;
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| connect_failed(e.to_string()))?;

        let client = runtime.block_on(async {
            let (client, connection) = config.connect(NoTls).await?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::warn!(error = %e, "remote connection error");
                }
            });
            Ok::<_, tokio_postgres::Error>(client)
        });
        let client = client.map_err(|e| connect_failed(e.to_string()))?;

        let mut link = PgLink {
            runtime,
            client,
            txn: RemoteTxnStatus::Idle,
            server_version: 0,
            // tokio-postgres does not say which authentication method ran.
            used_password: params.has_password(),
        };
        let version = link
            .query_scalar("SHOW server_version_num")
            .map_err(|e| connect_failed(e.to_string()))?;
        link.server_version = version.and_then(|v| v.trim().parse().ok()).unwrap_or(0);
        Ok(Box::new(link))
    }
}

pub struct PgLink {
    runtime: Runtime,
    client: Client,
    txn: RemoteTxnStatus,
    server_version: u32,
    used_password: bool,
}

fn map_error(e: tokio_postgres::Error, sql: &str) -> FdwError {
    let sqlstate = if e.is_closed() {
        None
    } else {
        e.code().map(|c| c.code().to_owned())
    };
    let message = match e.as_db_error() {
        Some(db) => db.message().to_owned(),
        None => e.to_string(),
    };
    FdwError::remote(sqlstate, message, Some(sql))
}

impl PgLink {
    fn simple_query(
        &mut self,
        sql: &str,
        deadline: Option<Duration>,
    ) -> Result<Vec<SimpleQueryMessage>, FdwError> {
        let client = &self.client;
        let result = match deadline {
            None => self.runtime.block_on(client.simple_query(sql)),
            Some(deadline) => {
                match self
                    .runtime
                    .block_on(async { tokio::time::timeout(deadline, client.simple_query(sql)).await })
                {
                    Ok(result) => result,
                    Err(_) => {
                        self.txn = RemoteTxnStatus::Active;
                        return Err(FdwError::remote(
                            None,
                            format!("command timed out after {} ms", deadline.as_millis()),
                            Some(sql),
                        ));
                    }
                }
            }
        };
        match result {
            Ok(messages) => {
                self.txn = txn_status_after(self.txn, sql, true);
                Ok(messages)
            }
            Err(e) => {
                self.txn = if e.is_closed() {
                    RemoteTxnStatus::Unknown
                } else {
                    txn_status_after(self.txn, sql, false)
                };
                Err(map_error(e, sql))
            }
        }
    }
}

impl RemoteLink for PgLink {
    fn execute(&mut self, sql: &str) -> Result<(), FdwError> {
        self.simple_query(sql, None).map(|_| ())
    }

    fn query_scalar(&mut self, sql: &str) -> Result<Option<String>, FdwError> {
        let messages = self.simple_query(sql, None)?;
        Ok(messages.iter().find_map(|m| match m {
            SimpleQueryMessage::Row(row) => row.get(0).map(str::to_owned),
            _ => None,
        }))
    }

    fn execute_with_deadline(&mut self, sql: &str, deadline: Duration) -> Result<(), FdwError> {
        self.simple_query(sql, Some(deadline)).map(|_| ())
    }

    fn cancel(&mut self, deadline: Duration) -> bool {
        let token = self.client.cancel_token();
        let sent = self
            .runtime
            .block_on(async { tokio::time::timeout(deadline, token.cancel_query(NoTls)).await });
        match sent {
            Ok(Ok(())) => {
                self.txn = RemoteTxnStatus::InError;
                true
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "could not send cancel request");
                false
            }
            Err(_) => {
                tracing::warn!("cancel request timed out");
                false
            }
        }
    }

    fn status(&self) -> LinkStatus {
        if self.client.is_closed() {
            LinkStatus::Bad
        } else {
            LinkStatus::Ok
        }
    }

    fn transaction_status(&self) -> RemoteTxnStatus {
        if self.client.is_closed() {
            RemoteTxnStatus::Unknown
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
