//! Configuration for the ledger

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Storage configuration
    pub storage: StorageConfig,

    /// Conflict retry configuration
    pub retry: RetryConfig,

    /// Idempotency configuration
    pub idempotency: IdempotencyConfig,

    /// Recovery configuration
    pub recovery: RecoveryConfig,

    /// Audit configuration
    pub audit: AuditConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/ledger"),
            service_name: "account-ledger".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            storage: StorageConfig::default(),
            retry: RetryConfig::default(),
            idempotency: IdempotencyConfig::default(),
            recovery: RecoveryConfig::default(),
            audit: AuditConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Durable RocksDB store under `data_dir`
    RocksDb,
    /// Volatile in-process store
    Memory,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend
    pub backend: StorageBackend,

    /// fsync the WAL on every commit
    pub sync_writes: bool,

    /// Number of striped account locks guarding read-check-write cycles
    pub lock_stripes: usize,

    /// RocksDB tuning
    pub rocksdb: RocksDBConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::RocksDb,
            sync_writes: true,
            lock_stripes: 64,
            rocksdb: RocksDBConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            max_background_jobs: 4,
            enable_statistics: false,
        }
    }
}

/// Version conflict retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry (ms)
    pub initial_delay_ms: u64,

    /// Delay cap (ms)
    pub max_delay_ms: u64,

    /// Exponential growth factor
    pub backoff_multiplier: f64,

    /// Relative jitter (0.0 - 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 4,
            initial_delay_ms: 2,
            max_delay_ms: 100,
            backoff_multiplier: 2.0,
            jitter_factor: 0.5, // hot accounts need wide spreading
        }
    }
}

/// Idempotency configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// In-flight reservations older than this may be taken over (ms)
    pub reservation_ttl_ms: u64,

    /// How long a duplicate request polls an in-flight reservation for its result
    pub in_flight_wait: RetryConfig,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            reservation_ttl_ms: 30_000,
            in_flight_wait: RetryConfig {
                max_retries: 10,
                initial_delay_ms: 5,
                max_delay_ms: 200,
                backoff_multiplier: 2.0,
                jitter_factor: 0.2,
            },
        }
    }
}

/// Recovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Resolve orphaned transfers when the ledger opens
    pub run_on_startup: bool,

    /// Only TransferOut records older than this count as orphans (ms)
    pub orphan_grace_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            run_on_startup: true,
            orphan_grace_ms: 60_000,
        }
    }
}

/// Audit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Append Failed records for rejected operations
    pub record_failed_transactions: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            record_failed_transactions: true,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,

    /// Emit JSON lines
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// In-memory configuration for tests and embedding
    pub fn in_memory() -> Self {
        let mut config = Config::default();
        config.storage.backend = StorageBackend::Memory;
        config.recovery.run_on_startup = false;
        config
    }

    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(backend) = std::env::var("LEDGER_STORAGE_BACKEND") {
            config.storage.backend = match backend.to_ascii_lowercase().as_str() {
                "rocksdb" => StorageBackend::RocksDb,
                "memory" => StorageBackend::Memory,
                other => {
                    return Err(crate::Error::Config(format!(
                        "Unknown storage backend: {}",
                        other
                    )))
                }
            };
        }

        if let Ok(retries) = std::env::var("LEDGER_MAX_RETRIES") {
            config.retry.max_retries = retries.parse().map_err(|e| {
                crate::Error::Config(format!("Invalid LEDGER_MAX_RETRIES: {}", e))
            })?;
        }

        if let Ok(level) = std::env::var("LEDGER_LOG_LEVEL") {
            config.logging.level = level;
        }

        if let Ok(json) = std::env::var("LEDGER_LOG_JSON") {
            config.logging.json = matches!(json.as_str(), "1" | "true" | "yes");
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot work with
    pub fn validate(&self) -> crate::Result<()> {
        if self.storage.lock_stripes == 0 {
            return Err(crate::Error::Config(
                "storage.lock_stripes must be at least 1".to_string(),
            ));
        }
        self.retry.validate("retry")?;
        self.idempotency
            .in_flight_wait
            .validate("idempotency.in_flight_wait")?;
        Ok(())
    }
}

impl RetryConfig {
    fn validate(&self, section: &str) -> crate::Result<()> {
        if self.backoff_multiplier < 1.0 {
            return Err(crate::Error::Config(format!(
                "{}.backoff_multiplier must be >= 1.0",
                section
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(crate::Error::Config(format!(
                "{}.jitter_factor must be within 0.0..=1.0",
                section
            )));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(crate::Error::Config(format!(
                "{0}.initial_delay_ms exceeds {0}.max_delay_ms",
                section
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "account-ledger");
        assert_eq!(config.storage.backend, StorageBackend::RocksDb);
        assert_eq!(config.retry.max_retries, 4);
        assert!(config.audit.record_failed_transactions);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            data_dir = "/tmp/ledger"

            [storage]
            backend = "memory"

            [retry]
            max_retries = 7
            "#,
        )
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/ledger"));
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.storage.lock_stripes, 64);
        assert_eq!(config.retry.max_retries, 7);
        assert_eq!(config.retry.max_delay_ms, 100);
    }

    #[test]
    fn test_validate_rejects_bad_retry() {
        let mut config = Config::default();
        config.retry.jitter_factor = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.storage.lock_stripes = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.idempotency.in_flight_wait.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_in_flight_wait_from_toml() {
        let config: Config = toml::from_str(
            r#"
            [idempotency.in_flight_wait]
            max_retries = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.idempotency.reservation_ttl_ms, 30_000);
        assert_eq!(config.idempotency.in_flight_wait.max_retries, 3);
        assert_eq!(config.idempotency.in_flight_wait.initial_delay_ms, 2);
    }
}
