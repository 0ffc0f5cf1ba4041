use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level node configuration (`meridian.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeridianConfig {
    #[serde(default)]
    pub csn: CsnConfig,
    #[serde(default)]
    pub fdw: FdwConfig,
}

/// CSN snapshot section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CsnConfig {
    /// Participate in global (cross-node) CSN snapshots.
    pub enable_csn_snapshot: bool,
    /// Seconds the oldest-xmin horizon is held back so snapshots imported
    /// from the past still see the row versions they need. Also sizes the
    /// xmin deferral map (0 = no map).
    pub csn_snapshot_defer_time: u64,
    /// How far ahead of a freshly generated CSN the WAL assignment record
    /// reaches, in seconds. A restart resumes from the logged value.
    pub wal_assign_interval_secs: u64,
    /// Warn when an imported snapshot CSN is ahead of the local clock by more
    /// than this many milliseconds.
    pub snapshot_desync_warn_ms: u64,
}

impl Default for CsnConfig {
    fn default() -> Self {
        Self {
            enable_csn_snapshot: false,
            csn_snapshot_defer_time: 0,
            wal_assign_interval_secs: 5,
            snapshot_desync_warn_ms: 1000,
        }
    }
}

impl CsnConfig {
    /// Shared clock state is needed whenever either feature is on.
    pub fn needs_clock_state(&self) -> bool {
        self.enable_csn_snapshot || self.csn_snapshot_defer_time > 0
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wal_assign_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "csn.wal_assign_interval_secs",
                reason: "must be at least 1 second".into(),
            });
        }
        if self.csn_snapshot_defer_time > u64::from(u32::MAX) {
            return Err(ConfigError::Invalid {
                field: "csn.csn_snapshot_defer_time",
                reason: format!("{} seconds is out of range", self.csn_snapshot_defer_time),
            });
        }
        Ok(())
    }
}

/// Whether writes on more than one node must go through two-phase commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForeignTwophaseCommit {
    /// Commit every remote participant in one phase.
    #[default]
    Disabled,
    /// Every foreign server written to must support two-phase commit.
    Required,
}

/// Foreign-server connection and transaction section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FdwConfig {
    pub foreign_twophase_commit: ForeignTwophaseCommit,
    /// Deadline for abort-time cleanup commands and cancel requests. Past it
    /// the connection is presumed dead and discarded.
    pub cleanup_timeout_ms: u64,
    /// Reported to the remote server when the user mapping sets none.
    pub application_name: String,
    /// Pause between in-doubt resolver sweeps.
    pub resolution_retry_interval_ms: u64,
    /// Attempts before an unresolved foreign transaction needs an operator.
    pub max_resolution_attempts: u32,
}

impl Default for FdwConfig {
    fn default() -> Self {
        Self {
            foreign_twophase_commit: ForeignTwophaseCommit::Disabled,
            cleanup_timeout_ms: 30_000,
            application_name: "meridian_fdw".into(),
            resolution_retry_interval_ms: 5_000,
            max_resolution_attempts: 10,
        }
    }
}

impl FdwConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cleanup_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "fdw.cleanup_timeout_ms",
                reason: "abort cleanup needs a finite, non-zero deadline".into(),
            });
        }
        if self.max_resolution_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "fdw.max_resolution_attempts",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

impl MeridianConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.csn.validate()?;
        self.fdw.validate()
    }

    /// Parse and validate configuration text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: MeridianConfig =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::info!(
            path = %path.display(),
            enable_csn_snapshot = config.csn.enable_csn_snapshot,
            defer_time_secs = config.csn.csn_snapshot_defer_time,
            "loaded configuration"
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = MeridianConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.csn.needs_clock_state());
        assert_eq!(config.fdw.cleanup_timeout_ms, 30_000);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = MeridianConfig::from_toml_str(
            r#"
            [csn]
            enable_csn_snapshot = true
            csn_snapshot_defer_time = 30

            [fdw]
            foreign_twophase_commit = "required"
            "#,
        )
        .unwrap();
        assert!(config.csn.enable_csn_snapshot);
        assert_eq!(config.csn.csn_snapshot_defer_time, 30);
        assert_eq!(config.csn.wal_assign_interval_secs, 5);
        assert_eq!(
            config.fdw.foreign_twophase_commit,
            ForeignTwophaseCommit::Required
        );
        assert_eq!(config.fdw.application_name, "meridian_fdw");
    }

    #[test]
    fn test_zero_cleanup_timeout_rejected() {
        let err = MeridianConfig::from_toml_str("[fdw]\ncleanup_timeout_ms = 0\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "fdw.cleanup_timeout_ms",
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_twophase_level_rejected() {
        let err = MeridianConfig::from_toml_str("[fdw]\nforeign_twophase_commit = \"maybe\"\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[csn]\ncsn_snapshot_defer_time = 12").unwrap();
        let config = MeridianConfig::load(file.path()).unwrap();
        assert_eq!(config.csn.csn_snapshot_defer_time, 12);
        assert!(config.csn.needs_clock_state());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = MeridianConfig::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
