//! Ledger facade
//!
//! Wires the configured store, metrics and transaction engine together and
//! runs startup recovery.
//!
//! # Example
//!
//! ```no_run
//! use account_ledger::{AccountType, Config, Currency, CustomerId, Ledger, Money};
//! use rust_decimal::Decimal;
//!
//! #[tokio::main]
//! async fn main() -> account_ledger::Result<()> {
//!     let ledger = Ledger::open(Config::default()).await?;
//!     let engine = ledger.engine();
//!
//!     let opening = Money::new(Decimal::from(100), Currency::USD)?;
//!     let account = engine
//!         .create_account(CustomerId::new("CUST-1"), AccountType::Checking, opening)
//!         .await?;
//!
//!     let amount = Money::new(Decimal::from(50), Currency::USD)?;
//!     engine
//!         .deposit(&account.account_id, amount, Some("dep-1".to_string()), None)
//!         .await?;
//!
//!     ledger.shutdown().await
//! }
//! ```

use crate::config::{Config, StorageBackend};
use crate::engine::TransactionEngine;
use crate::metrics::Metrics;
use crate::storage::{LedgerStore, MemoryStore, RocksStore};
use crate::Result;
use std::sync::Arc;
use std::time::Duration;

/// Main ledger interface
#[derive(Debug)]
pub struct Ledger {
    /// Transaction engine
    engine: Arc<TransactionEngine>,

    /// Metrics shared with the engine
    metrics: Metrics,

    /// Configuration
    config: Config,
}

impl Ledger {
    /// Open ledger with configuration
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;

        let store: Arc<dyn LedgerStore> = match config.storage.backend {
            StorageBackend::RocksDb => Arc::new(RocksStore::open(&config)?),
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
        };

        Self::with_store(config, store).await
    }

    /// Open ledger over an existing store
    pub async fn with_store(config: Config, store: Arc<dyn LedgerStore>) -> Result<Self> {
        let metrics = Metrics::new()?;
        let engine = Arc::new(TransactionEngine::new(store, &config, metrics.clone()));

        if config.recovery.run_on_startup {
            let grace = Duration::from_millis(config.recovery.orphan_grace_ms);
            let report = engine.recover_orphaned_transfers(grace).await?;
            if !report.unresolved.is_empty() {
                tracing::warn!(
                    unresolved = report.unresolved.len(),
                    "Orphaned transfers remain after startup recovery"
                );
            }
        }

        tracing::info!(
            service = %config.service_name,
            version = %config.service_version,
            backend = ?config.storage.backend,
            "Ledger opened"
        );

        Ok(Self {
            engine,
            metrics,
            config,
        })
    }

    /// Transaction engine
    pub fn engine(&self) -> &Arc<TransactionEngine> {
        &self.engine
    }

    /// Metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Close the ledger (graceful shutdown)
    pub async fn shutdown(self) -> Result<()> {
        tracing::info!(service = %self.config.service_name, "Ledger shutting down");
        drop(self.engine);
        Ok(())
    }
}
