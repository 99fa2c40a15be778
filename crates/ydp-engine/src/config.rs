//! Engine configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// Engine Configuration Constants
// ============================================================================

/// Default path of the ecosystem model.
pub const DEFAULT_MODEL_PATH: &str = "demos/yellow_starter.yaml";

/// Default merge database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/datasurface_merge";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

/// Default bound on a source capture in seconds.
pub const DEFAULT_CAPTURE_TIMEOUT_SECS: u64 = 120;

/// Default bound on a merge-store commit in seconds.
pub const DEFAULT_MERGE_TIMEOUT_SECS: u64 = 60;

/// Default bound on one replica target's cycle in seconds.
pub const DEFAULT_REPLICATION_TIMEOUT_SECS: u64 = 120;

/// Default bound on a transformer run in seconds.
pub const DEFAULT_TRANSFORMER_TIMEOUT_SECS: u64 = 300;

/// Default time given to in-flight work at shutdown in seconds.
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub model_path: PathBuf,
    pub database: DatabaseConfig,
    pub timeouts: TimeoutConfig,
    pub scheduler: SchedulerConfig,
    pub shutdown_grace_secs: u64,
}

/// Merge database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

/// Per-operation deadlines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub capture_secs: u64,
    pub merge_secs: u64,
    pub replication_secs: u64,
    pub transformer_secs: u64,
}

impl TimeoutConfig {
    pub fn capture(&self) -> Duration {
        Duration::from_secs(self.capture_secs)
    }

    pub fn merge(&self) -> Duration {
        Duration::from_secs(self.merge_secs)
    }

    pub fn replication(&self) -> Duration {
        Duration::from_secs(self.replication_secs)
    }

    pub fn transformer(&self) -> Duration {
        Duration::from_secs(self.transformer_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            capture_secs: DEFAULT_CAPTURE_TIMEOUT_SECS,
            merge_secs: DEFAULT_MERGE_TIMEOUT_SECS,
            replication_secs: DEFAULT_REPLICATION_TIMEOUT_SECS,
            transformer_secs: DEFAULT_TRANSFORMER_TIMEOUT_SECS,
        }
    }
}

/// Which cron loops `ydp run` starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub ingestion_enabled: bool,
    pub replication_enabled: bool,
    pub transformers_enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            ingestion_enabled: true,
            replication_enabled: true,
            transformers_enabled: true,
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl EngineConfig {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = EngineConfig {
            model_path: std::env::var("YDP_MODEL_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_MODEL_PATH)),
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_or(
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
                min_connections: env_or(
                    "DATABASE_MIN_CONNECTIONS",
                    DEFAULT_DATABASE_MIN_CONNECTIONS,
                ),
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
                idle_timeout_secs: env_or("DATABASE_IDLE_TIMEOUT", DEFAULT_DATABASE_IDLE_TIMEOUT_SECS),
            },
            timeouts: TimeoutConfig {
                capture_secs: env_or("YDP_CAPTURE_TIMEOUT", DEFAULT_CAPTURE_TIMEOUT_SECS),
                merge_secs: env_or("YDP_MERGE_TIMEOUT", DEFAULT_MERGE_TIMEOUT_SECS),
                replication_secs: env_or("YDP_REPLICATION_TIMEOUT", DEFAULT_REPLICATION_TIMEOUT_SECS),
                transformer_secs: env_or("YDP_TRANSFORMER_TIMEOUT", DEFAULT_TRANSFORMER_TIMEOUT_SECS),
            },
            scheduler: SchedulerConfig {
                ingestion_enabled: env_or("YDP_INGESTION_ENABLED", true),
                replication_enabled: env_or("YDP_REPLICATION_ENABLED", true),
                transformers_enabled: env_or("YDP_TRANSFORMERS_ENABLED", true),
            },
            shutdown_grace_secs: env_or("YDP_SHUTDOWN_GRACE", DEFAULT_SHUTDOWN_GRACE_SECS),
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.model_path.as_os_str().is_empty() {
            anyhow::bail!("Model path cannot be empty");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        let t = &self.timeouts;
        if t.capture_secs == 0 || t.merge_secs == 0 || t.replication_secs == 0 || t.transformer_secs == 0
        {
            anyhow::bail!("Operation timeouts must be greater than 0");
        }

        if !self.scheduler.ingestion_enabled
            && !self.scheduler.replication_enabled
            && !self.scheduler.transformers_enabled
        {
            tracing::warn!("All schedulers disabled - `ydp run` will idle until shutdown");
        }

        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
            },
            timeouts: TimeoutConfig::default(),
            scheduler: SchedulerConfig::default(),
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_is_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_pool_bounds_checked() {
        let mut config = EngineConfig::default();
        config.database.min_connections = 20;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = EngineConfig::default();
        config.timeouts.merge_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("YDP_CAPTURE_TIMEOUT", "7");
        std::env::set_var("YDP_REPLICATION_ENABLED", "false");
        std::env::set_var("YDP_MODEL_PATH", "/etc/ydp/eco.yaml");

        let config = EngineConfig::load().unwrap();
        assert_eq!(config.timeouts.capture(), Duration::from_secs(7));
        assert!(!config.scheduler.replication_enabled);
        assert_eq!(config.model_path, PathBuf::from("/etc/ydp/eco.yaml"));

        std::env::remove_var("YDP_CAPTURE_TIMEOUT");
        std::env::remove_var("YDP_REPLICATION_ENABLED");
        std::env::remove_var("YDP_MODEL_PATH");
    }
}
