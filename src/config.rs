//! Settings of a sensor, loadable from TOML
//!
//! ```toml
//! connection = "10.0.0.1 && 10.0.0.2 || unix"
//! analyzer_id = 1234
//! spool_dir = "/var/spool/prelude/my-sensor"
//! permission = "idmef:w admin:r"
//! quota_bytes = 10485760
//! ```

use crate::connection::{ConnectionError, ParsePermissionError, Permission};
use crate::manager::{ManagerConfig, PoolFlags};
use crate::timer::BackoffPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Connection string is empty")]
    EmptyConnectionString,
    #[error("Unexpected '{0}' in connection string, an address is expected")]
    MisplacedOperator(String),
    #[error("Missing '&&' or '||' before '{0}' in connection string")]
    MissingOperator(String),
    #[error("Connection string ends with '{0}'")]
    DanglingOperator(String),
    #[error("{0} appears more than once in connection string")]
    DuplicateEndpoint(String),
    #[error("Invalid endpoint in connection string")]
    Endpoint(#[from] ConnectionError),
    #[error("Invalid permission")]
    Permission(#[from] ParsePermissionError),
    #[error("Invalid backoff: {0}")]
    Backoff(String),
    #[error("Failed to read settings from {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse settings")]
    Toml(#[from] toml::de::Error),
}

/// Longest reconnection delay accepted, a week
const MAX_BACKOFF_LIMIT_SEC: u64 = 7 * 24 * 3600;
/// Longest input polling interval accepted, an hour
const MAX_POLL_INTERVAL_SEC: u64 = 3600;

fn default_connection() -> String {
    "unix".to_owned()
}

fn default_spool_dir() -> PathBuf {
    PathBuf::from("/var/spool/prelude")
}

fn default_permission() -> String {
    "idmef:w".to_owned()
}

fn default_initial_backoff() -> u64 {
    10
}

fn default_max_backoff() -> u64 {
    3600
}

fn default_backoff_factor() -> u32 {
    2
}

fn default_poll_interval() -> u64 {
    1
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Manager topology, e.g. `a && b || c`
    #[serde(default = "default_connection")]
    pub connection: String,
    /// Identifier declared to managers after authentication
    #[serde(default)]
    pub analyzer_id: u64,
    /// Root of the failover spools, one subdirectory per destination
    #[serde(default = "default_spool_dir")]
    pub spool_dir: PathBuf,
    /// Permission managers must grant, e.g. `idmef:w admin:r`
    #[serde(default = "default_permission")]
    pub permission: String,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_sec: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_sec: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: u32,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_sec: u64,
    /// Size limit of each spool. Unlimited if unset.
    #[serde(default)]
    pub quota_bytes: Option<u64>,
    /// Retry dead connections
    #[serde(default = "default_true")]
    pub reconnect: bool,
    /// Spool what can't be delivered
    #[serde(default = "default_true")]
    pub failover: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            connection: default_connection(),
            analyzer_id: 0,
            spool_dir: default_spool_dir(),
            permission: default_permission(),
            initial_backoff_sec: default_initial_backoff(),
            max_backoff_sec: default_max_backoff(),
            backoff_factor: default_backoff_factor(),
            poll_interval_sec: default_poll_interval(),
            quota_bytes: None,
            reconnect: true,
            failover: true,
        }
    }
}

impl Settings {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn required_permission(&self) -> Result<Permission, ConfigError> {
        Ok(self.permission.parse()?)
    }

    pub fn backoff(&self) -> Result<BackoffPolicy, ConfigError> {
        if self.initial_backoff_sec == 0 {
            return Err(ConfigError::Backoff("initial delay must be at least 1s".into()));
        }
        if self.max_backoff_sec < self.initial_backoff_sec {
            return Err(ConfigError::Backoff(format!(
                "maximum {}s is below initial {}s",
                self.max_backoff_sec, self.initial_backoff_sec
            )));
        }
        if self.max_backoff_sec > MAX_BACKOFF_LIMIT_SEC {
            return Err(ConfigError::Backoff(format!(
                "maximum {}s is above the {}s limit",
                self.max_backoff_sec, MAX_BACKOFF_LIMIT_SEC
            )));
        }
        if self.backoff_factor < 1 {
            return Err(ConfigError::Backoff("factor must be at least 1".into()));
        }
        Ok(BackoffPolicy {
            initial: Duration::from_secs(self.initial_backoff_sec),
            max: Duration::from_secs(self.max_backoff_sec),
            factor: self.backoff_factor,
        })
    }

    /// Interval between input polls, between a second and an hour
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_sec.clamp(1, MAX_POLL_INTERVAL_SEC))
    }

    pub fn flags(&self) -> PoolFlags {
        let mut flags = PoolFlags::empty();
        flags.set(PoolFlags::RECONNECT, self.reconnect);
        flags.set(PoolFlags::FAILOVER, self.failover);
        flags
    }

    /// Validated settings for a [`ConnectionManager`](crate::manager::ConnectionManager)
    pub fn manager_config(&self) -> Result<ManagerConfig, ConfigError> {
        Ok(ManagerConfig {
            topology: self.connection.parse()?,
            analyzer_id: self.analyzer_id,
            spool_dir: self.spool_dir.clone(),
            quota: self.quota_bytes,
            required: self.required_permission()?,
            backoff: self.backoff()?,
            poll_interval: self.poll_interval(),
            flags: self.flags(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let settings = Settings::from_toml("").unwrap();
        assert_eq!(settings.connection, "unix");
        assert_eq!(settings.backoff().unwrap(), BackoffPolicy::default());
        assert_eq!(settings.poll_interval_sec, 1);
        assert_eq!(settings.flags(), PoolFlags::RECONNECT | PoolFlags::FAILOVER);
        assert_eq!(
            settings.required_permission().unwrap(),
            Permission::IDMEF_WRITE
        );
    }

    #[test]
    fn full_file() {
        let settings = Settings::from_toml(
            r#"
            connection = "10.0.0.1 && 10.0.0.2 || 10.0.0.3:5553"
            analyzer_id = 1234
            spool_dir = "/tmp/spool"
            permission = "idmef:w admin:rw"
            max_backoff_sec = 600
            quota_bytes = 4096
            reconnect = false
            "#,
        )
        .unwrap();
        let config = settings.manager_config().unwrap();
        assert_eq!(config.topology.groups().len(), 2);
        assert_eq!(config.analyzer_id, 1234);
        assert_eq!(config.quota, Some(4096));
        assert_eq!(config.backoff.max, Duration::from_secs(600));
        assert!(!config.flags.contains(PoolFlags::RECONNECT));
        assert!(config.required.contains(Permission::ADMIN_WRITE));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            Settings::from_toml("unknown_key = 1"),
            Err(ConfigError::Toml(_))
        ));
        let settings = Settings {
            connection: "a &&".into(),
            ..Default::default()
        };
        assert!(matches!(
            settings.manager_config(),
            Err(ConfigError::DanglingOperator(_))
        ));
        let settings = Settings {
            permission: "idmef:x".into(),
            ..Default::default()
        };
        assert!(matches!(
            settings.manager_config(),
            Err(ConfigError::Permission(_))
        ));
        let settings = Settings {
            initial_backoff_sec: 100,
            max_backoff_sec: 10,
            ..Default::default()
        };
        assert!(matches!(settings.backoff(), Err(ConfigError::Backoff(_))));
    }

    #[test]
    fn delays_are_bounded() {
        let settings = Settings {
            max_backoff_sec: u64::MAX,
            ..Default::default()
        };
        assert!(matches!(settings.backoff(), Err(ConfigError::Backoff(_))));
        let settings = Settings {
            max_backoff_sec: MAX_BACKOFF_LIMIT_SEC,
            ..Default::default()
        };
        assert_eq!(
            settings.backoff().unwrap().max,
            Duration::from_secs(MAX_BACKOFF_LIMIT_SEC)
        );

        let settings = Settings {
            poll_interval_sec: u64::MAX,
            ..Default::default()
        };
        assert_eq!(settings.poll_interval(), Duration::from_secs(3600));
        let settings = Settings {
            poll_interval_sec: 0,
            ..Default::default()
        };
        assert_eq!(settings.poll_interval(), Duration::from_secs(1));
    }
}
