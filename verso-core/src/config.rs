//! Configuration types
//!
//! Loaded from environment variables with sensible defaults for development.

use crate::constants::{DEFAULT_LMDB_MAX_SIZE_MB, DEFAULT_POOL, DEFAULT_RECONNECT_INTERVAL_MS};
use crate::error::{ConfigError, VersoResult};
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for the cache middleware.
#[derive(Debug, Clone, PartialEq)]
pub struct VersoConfig {
    /// Pool used by operations that do not name one. `CacheManager::from_config`
    /// registers its store under this name.
    pub default_pool: String,

    /// TTL applied to entries of operations that do not set their own.
    /// `None` keeps entries until the store evicts them.
    pub default_ttl: Option<Duration>,

    /// How long an unreachable far tier is skipped before it is probed again.
    pub reconnect_interval: Duration,

    /// Upper bound on how long a coalesced waiter waits for its leader.
    pub coalesce_timeout: Option<Duration>,

    /// Directory for the LMDB store. `None` disables it.
    pub lmdb_path: Option<PathBuf>,

    /// LMDB map size in megabytes.
    pub lmdb_max_size_mb: usize,
}

impl Default for VersoConfig {
    fn default() -> Self {
        Self {
            default_pool: DEFAULT_POOL.to_string(),
            default_ttl: None,
            reconnect_interval: Duration::from_millis(DEFAULT_RECONNECT_INTERVAL_MS),
            coalesce_timeout: None,
            lmdb_path: None,
            lmdb_max_size_mb: DEFAULT_LMDB_MAX_SIZE_MB,
        }
    }
}

impl VersoConfig {
    /// Create VersoConfig from environment variables.
    ///
    /// Environment variables:
    /// - `VERSO_DEFAULT_POOL`: Pool name for operations without one (default: "default")
    /// - `VERSO_DEFAULT_TTL_MS`: Entry TTL in milliseconds (default: none)
    /// - `VERSO_RECONNECT_INTERVAL_MS`: Far-tier retry interval (default: 60000)
    /// - `VERSO_COALESCE_TIMEOUT_MS`: Coalesced waiter timeout (default: none)
    /// - `VERSO_LMDB_PATH`: LMDB directory (default: none)
    /// - `VERSO_LMDB_MAX_SIZE_MB`: LMDB map size (default: 64)
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Values that do not parse fall back to
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let env_millis = |name: &str| {
            lookup(name)
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
        };

        let default_pool = lookup("VERSO_DEFAULT_POOL")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.default_pool);

        let default_ttl = env_millis("VERSO_DEFAULT_TTL_MS").or(defaults.default_ttl);

        let reconnect_interval =
            env_millis("VERSO_RECONNECT_INTERVAL_MS").unwrap_or(defaults.reconnect_interval);

        let coalesce_timeout =
            env_millis("VERSO_COALESCE_TIMEOUT_MS").or(defaults.coalesce_timeout);

        let lmdb_path = lookup("VERSO_LMDB_PATH")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let lmdb_max_size_mb = lookup("VERSO_LMDB_MAX_SIZE_MB")
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(defaults.lmdb_max_size_mb);

        Self {
            default_pool,
            default_ttl,
            reconnect_interval,
            coalesce_timeout,
            lmdb_path,
            lmdb_max_size_mb,
        }
    }

    pub fn with_default_pool(mut self, pool: impl Into<String>) -> Self {
        self.default_pool = pool.into();
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn with_coalesce_timeout(mut self, timeout: Duration) -> Self {
        self.coalesce_timeout = Some(timeout);
        self
    }

    pub fn with_lmdb(mut self, path: impl Into<PathBuf>, max_size_mb: usize) -> Self {
        self.lmdb_path = Some(path.into());
        self.lmdb_max_size_mb = max_size_mb;
        self
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - default_pool is not blank
    /// - reconnect_interval and any TTL/timeout are positive
    /// - lmdb_max_size_mb > 0 when an LMDB path is set
    pub fn validate(&self) -> VersoResult<()> {
        if self.default_pool.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "default_pool".to_string(),
                value: self.default_pool.clone(),
                reason: "default_pool must not be blank".to_string(),
            }
            .into());
        }

        if self.reconnect_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "reconnect_interval".to_string(),
                value: format!("{:?}", self.reconnect_interval),
                reason: "reconnect_interval must be positive".to_string(),
            }
            .into());
        }

        if let Some(ttl) = self.default_ttl {
            if ttl.is_zero() {
                return Err(ConfigError::InvalidValue {
                    field: "default_ttl".to_string(),
                    value: format!("{:?}", ttl),
                    reason: "default_ttl must be positive when set".to_string(),
                }
                .into());
            }
        }

        if let Some(timeout) = self.coalesce_timeout {
            if timeout.is_zero() {
                return Err(ConfigError::InvalidValue {
                    field: "coalesce_timeout".to_string(),
                    value: format!("{:?}", timeout),
                    reason: "coalesce_timeout must be positive when set".to_string(),
                }
                .into());
            }
        }

        if self.lmdb_path.is_some() && self.lmdb_max_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "lmdb_max_size_mb".to_string(),
                value: self.lmdb_max_size_mb.to_string(),
                reason: "lmdb_max_size_mb must be greater than 0".to_string(),
            }
            .into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VersoError;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_is_valid() {
        let config = VersoConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_pool, DEFAULT_POOL);
        assert_eq!(config.reconnect_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_builder_setters() {
        let config = VersoConfig::default()
            .with_default_pool("photos")
            .with_default_ttl(Duration::from_secs(30))
            .with_reconnect_interval(Duration::from_secs(5))
            .with_coalesce_timeout(Duration::from_millis(250))
            .with_lmdb("/tmp/verso", 16);

        assert_eq!(config.default_pool, "photos");
        assert_eq!(config.default_ttl, Some(Duration::from_secs(30)));
        assert_eq!(config.reconnect_interval, Duration::from_secs(5));
        assert_eq!(config.coalesce_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.lmdb_path, Some(PathBuf::from("/tmp/verso")));
        assert_eq!(config.lmdb_max_size_mb, 16);
        assert!(config.validate().is_ok());
    }

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_from_lookup_reads_every_variable() {
        let config = VersoConfig::from_lookup(lookup_from(&[
            ("VERSO_DEFAULT_POOL", " photos "),
            ("VERSO_DEFAULT_TTL_MS", "1500"),
            ("VERSO_RECONNECT_INTERVAL_MS", "250"),
            ("VERSO_COALESCE_TIMEOUT_MS", " 40 "),
            ("VERSO_LMDB_PATH", "/var/cache/verso"),
            ("VERSO_LMDB_MAX_SIZE_MB", "128"),
        ]));

        assert_eq!(config.default_pool, "photos");
        assert_eq!(config.default_ttl, Some(Duration::from_millis(1500)));
        assert_eq!(config.reconnect_interval, Duration::from_millis(250));
        assert_eq!(config.coalesce_timeout, Some(Duration::from_millis(40)));
        assert_eq!(config.lmdb_path, Some(PathBuf::from("/var/cache/verso")));
        assert_eq!(config.lmdb_max_size_mb, 128);
    }

    #[test]
    fn test_from_lookup_falls_back_on_unparseable_values() {
        let config = VersoConfig::from_lookup(lookup_from(&[
            ("VERSO_DEFAULT_POOL", "   "),
            ("VERSO_DEFAULT_TTL_MS", "soon"),
            ("VERSO_RECONNECT_INTERVAL_MS", "-1"),
            ("VERSO_COALESCE_TIMEOUT_MS", "1.5"),
            ("VERSO_LMDB_PATH", ""),
            ("VERSO_LMDB_MAX_SIZE_MB", "lots"),
        ]));

        assert_eq!(config, VersoConfig::default());
    }

    #[test]
    fn test_from_lookup_with_nothing_set_is_default() {
        assert_eq!(VersoConfig::from_lookup(|_| None), VersoConfig::default());
    }

    #[test]
    fn test_blank_pool_rejected() {
        let config = VersoConfig::default().with_default_pool("  ");
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            VersoError::Config(ConfigError::InvalidValue { ref field, .. }) if field == "default_pool"
        ));
    }

    #[test]
    fn test_zero_reconnect_interval_rejected() {
        let config = VersoConfig::default().with_reconnect_interval(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let config = VersoConfig::default().with_default_ttl(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_lmdb_size_rejected() {
        let config = VersoConfig::default().with_lmdb("/tmp/verso", 0);
        assert!(config.validate().is_err());
    }
}
