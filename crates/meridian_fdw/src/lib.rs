//! Foreign transactions over remote PostgreSQL-compatible servers.
//!
//! [`ConnectionCache`] keeps one link per user mapping for the lifetime of
//! a session and mirrors the local transaction and its subtransactions on
//! each remote server it touches. At commit, [`ForeignTxnCoordinator`]
//! finishes every participant: one-phase when at most one node wrote,
//! otherwise two-phase with an agreed global CSN, handing anything it cannot
//! finish to the [`FdwXactResolver`].

pub mod catalog;
pub mod connection;
pub mod coordinator;
pub mod fdw_xact;
pub mod inval;
pub mod link;
pub mod pg_link;
pub mod resolver;
pub mod scripted;
pub mod xact;


pub use catalog::{catalog_hash, ConnParams, ForeignCatalog, ForeignServer, MemCatalog, UserMapping};
pub use connection::{ConnectionCache, ConnectionHandle, ConnectionInfo, Participant, XactState};
pub use coordinator::{fdwxact_id, CommitOutcome, ForeignTxnCoordinator};
pub use fdw_xact::ForeignXact;
pub use inval::{CatalogCache, CatalogInvalidation, CatalogObserver, InvalidationBus, InvalidationInbox};
pub use link::{Connector, LinkStatus, RemoteLink, RemoteTxnStatus};
pub use pg_link::{PgConnector, PgLink};
pub use resolver::{FdwXactResolver, FdwXactResolverHandle, FdwXactStatus, PendingFdwXact, ResolverMetrics};
pub use scripted::{Fault, RemoteScript, ScriptedConnector, ScriptedLink};
pub use xact::{LocalXactState, SubXactEvent, SubXactObserver};
