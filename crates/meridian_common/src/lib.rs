//! Shared building blocks for meridian: identifier newtypes, the error
//! taxonomy and node configuration.

pub mod config;
pub mod error;
pub mod types;

pub use config::{CsnConfig, FdwConfig, ForeignTwophaseCommit, MeridianConfig};
pub use error::{
    ConfigError, CsnError, ErrorKind, FdwError, MeridianError, MeridianResult,
};
pub use types::{Csn, IsolationLevel, ServerId, UserId, UserMappingId, Xid, XidCsn};
