//! # Orchestrator Configuration
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     FUOTA_DATABASE_PATH=/var/lib/fuota/fuota.db                        │
//! │     FUOTA_MAX_RETRY_COUNT=8                                            │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/fuota-orchestrator/fuota.toml (Linux)                    │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [database]
//! path = "/var/lib/fuota/fuota.db"
//! max_connections = 5
//! claim_lease_secs = 60
//!
//! [scheduler]
//! batch_size = 10
//! max_retry_count = 5
//! initial_retry_interval_secs = 60
//! max_retry_interval_secs = 3600
//!
//! [network_server]
//! connect_timeout_secs = 10
//! ```

use chrono::Duration as ChronoDuration;
use fuota_core::{ExponentialBackoff, DEFAULT_BATCH_SIZE, DEFAULT_MAX_RETRY_COUNT};
use fuota_db::DbConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{NsError, NsResult};

// =============================================================================
// Database Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite database file.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long a claimed row stays invisible to other workers.
    #[serde(default = "default_claim_lease")]
    pub claim_lease_secs: u64,

    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

fn default_database_path() -> PathBuf {
    directories::ProjectDirs::from("io", "fuota", "fuota-orchestrator")
        .map(|dirs| dirs.data_local_dir().join("fuota.db"))
        .unwrap_or_else(|| PathBuf::from("fuota.db"))
}

fn default_max_connections() -> u32 {
    5
}

fn default_claim_lease() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: default_database_path(),
            max_connections: default_max_connections(),
            claim_lease_secs: default_claim_lease(),
            run_migrations: true,
        }
    }
}

// =============================================================================
// Scheduler Settings
// =============================================================================

/// Knobs read by the step executor when it polls the claim queues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Rows claimed per poll.
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,

    /// Sessions with this many attempts are no longer dispatched.
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: i32,

    #[serde(default = "default_initial_retry_interval")]
    pub initial_retry_interval_secs: i64,

    #[serde(default = "default_max_retry_interval")]
    pub max_retry_interval_secs: i64,
}

fn default_batch_size() -> i64 {
    DEFAULT_BATCH_SIZE
}

fn default_max_retry_count() -> i32 {
    DEFAULT_MAX_RETRY_COUNT
}

fn default_initial_retry_interval() -> i64 {
    60
}

fn default_max_retry_interval() -> i64 {
    3600
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        SchedulerSettings {
            batch_size: default_batch_size(),
            max_retry_count: default_max_retry_count(),
            initial_retry_interval_secs: default_initial_retry_interval(),
            max_retry_interval_secs: default_max_retry_interval(),
        }
    }
}

// =============================================================================
// Network Server Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkServerSettings {
    /// Upper bound on establishing a client connection (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for NetworkServerSettings {
    fn default() -> Self {
        NetworkServerSettings {
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FuotaConfig {
    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub scheduler: SchedulerSettings,

    #[serde(default)]
    pub network_server: NetworkServerSettings,
}

impl FuotaConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (fuota.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> NsResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load config: {}. Using defaults.", e);
            Self::default()
        })
    }

    pub fn save(&self, config_path: Option<PathBuf>) -> NsResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| NsError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| NsError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| NsError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Config saved");
        Ok(())
    }

    pub fn validate(&self) -> NsResult<()> {
        if self.database.path.as_os_str().is_empty() {
            return Err(NsError::InvalidConfig("database.path must be set".into()));
        }
        if self.database.max_connections == 0 {
            return Err(NsError::InvalidConfig(
                "database.max_connections must be greater than 0".into(),
            ));
        }
        if self.database.claim_lease_secs == 0 {
            return Err(NsError::InvalidConfig(
                "database.claim_lease_secs must be greater than 0".into(),
            ));
        }
        if self.scheduler.batch_size <= 0 {
            return Err(NsError::InvalidConfig(
                "scheduler.batch_size must be greater than 0".into(),
            ));
        }
        if self.scheduler.max_retry_count <= 0 {
            return Err(NsError::InvalidConfig(
                "scheduler.max_retry_count must be greater than 0".into(),
            ));
        }
        if self.scheduler.initial_retry_interval_secs < 0
            || self.scheduler.max_retry_interval_secs < self.scheduler.initial_retry_interval_secs
        {
            return Err(NsError::InvalidConfig(format!(
                "retry interval range {}..={} seconds is invalid",
                self.scheduler.initial_retry_interval_secs, self.scheduler.max_retry_interval_secs
            )));
        }
        if self.network_server.connect_timeout_secs == 0 {
            return Err(NsError::InvalidConfig(
                "network_server.connect_timeout_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies `FUOTA_*` overrides read through `lookup`.
    ///
    /// Values that fail to parse are logged and ignored.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("FUOTA_DATABASE_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = PathBuf::from(path);
        }

        override_parsed(&lookup, "FUOTA_DB_MAX_CONNECTIONS", &mut self.database.max_connections);
        override_parsed(&lookup, "FUOTA_CLAIM_LEASE_SECS", &mut self.database.claim_lease_secs);
        override_parsed(&lookup, "FUOTA_BATCH_SIZE", &mut self.scheduler.batch_size);
        override_parsed(&lookup, "FUOTA_MAX_RETRY_COUNT", &mut self.scheduler.max_retry_count);
        override_parsed(
            &lookup,
            "FUOTA_NS_CONNECT_TIMEOUT_SECS",
            &mut self.network_server.connect_timeout_secs,
        );
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("io", "fuota", "fuota-orchestrator")
            .map(|dirs| dirs.config_dir().join("fuota.toml"))
    }

    // =========================================================================
    // Bridges
    // =========================================================================

    /// Pool configuration for [`fuota_db::Database::new`].
    pub fn db_config(&self) -> DbConfig {
        DbConfig::new(&self.database.path)
            .max_connections(self.database.max_connections)
            .run_migrations(self.database.run_migrations)
            .claim_lease(Duration::from_secs(self.database.claim_lease_secs))
    }

    /// Backoff the step executor applies when rescheduling a session.
    pub fn retry_policy(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            ChronoDuration::seconds(self.scheduler.initial_retry_interval_secs),
            ChronoDuration::seconds(self.scheduler.max_retry_interval_secs),
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.network_server.connect_timeout_secs)
    }
}

fn override_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    if let Some(raw) = lookup(key) {
        match raw.parse::<T>() {
            Ok(value) => {
                debug!(key, value = %raw, "Overriding setting from environment");
                *target = value;
            }
            Err(_) => warn!(key, value = %raw, "Ignoring unparsable environment override"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = FuotaConfig::default();
        assert_eq!(config.scheduler.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.scheduler.max_retry_count, DEFAULT_MAX_RETRY_COUNT);
        assert_eq!(config.database.claim_lease_secs, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = FuotaConfig::default();

        config.scheduler.batch_size = 0;
        assert!(config.validate().is_err());

        config.scheduler.batch_size = 10;
        config.scheduler.max_retry_interval_secs = 1;
        assert!(config.validate().is_err());

        config.scheduler.max_retry_interval_secs = 3600;
        config.database.claim_lease_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("FUOTA_DATABASE_PATH", "/tmp/override.db"),
            ("FUOTA_BATCH_SIZE", "25"),
            ("FUOTA_MAX_RETRY_COUNT", "not-a-number"),
            ("FUOTA_CLAIM_LEASE_SECS", "120"),
        ]
        .into_iter()
        .collect();

        let mut config = FuotaConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.database.path, PathBuf::from("/tmp/override.db"));
        assert_eq!(config.scheduler.batch_size, 25);
        assert_eq!(config.scheduler.max_retry_count, DEFAULT_MAX_RETRY_COUNT);
        assert_eq!(config.database.claim_lease_secs, 120);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: FuotaConfig = toml::from_str(
            r#"
            [scheduler]
            max_retry_count = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.scheduler.max_retry_count, 8);
        assert_eq!(config.scheduler.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.network_server.connect_timeout_secs, 10);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("fuota.toml");

        let mut config = FuotaConfig::default();
        config.database.path = dir.path().join("fuota.db");
        config.scheduler.batch_size = 42;
        config.save(Some(path.clone())).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("[database]"));
        assert!(contents.contains("[scheduler]"));

        let loaded: FuotaConfig = toml::from_str(&contents).unwrap();
        assert_eq!(loaded.scheduler.batch_size, 42);
        assert_eq!(loaded.database.path, config.database.path);
    }

    #[test]
    fn test_bridges() {
        let mut config = FuotaConfig::default();
        config.scheduler.initial_retry_interval_secs = 30;
        config.scheduler.max_retry_interval_secs = 90;
        config.database.claim_lease_secs = 15;

        let policy = config.retry_policy();
        assert_eq!(policy.initial, ChronoDuration::seconds(30));
        assert_eq!(policy.max, ChronoDuration::seconds(90));

        let db = config.db_config();
        assert_eq!(db.claim_lease, Duration::from_secs(15));
        assert_eq!(db.max_connections, 5);
    }
}
