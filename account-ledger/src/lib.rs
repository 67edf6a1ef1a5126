//! Account Ledger
//!
//! Account balances and money movements with optimistic concurrency.
//!
//! # Architecture
//!
//! - **Versioned accounts**: Every mutation is a compare-and-swap on the account version
//! - **Atomic commits**: Balance change and transaction record land in one write
//! - **Idempotency**: Client keys are reserved in the store and completed by the commit
//! - **Hash chain**: Each record links to the previous one on its account
//!
//! # Invariants
//!
//! - No balance is ever negative
//! - Replaying committed history reproduces the balance exactly
//! - A transfer is fully applied or fully compensated, never half visible
//! - At most one committed transaction per `(account, idempotency key)`

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod idempotency;
pub mod ids;
pub mod ledger;
pub mod metrics;
pub mod recovery;
pub mod retry;
pub mod storage;
pub mod types;

// Re-exports
pub use audit::{AccountAudit, AuditIssue};
pub use config::Config;
pub use engine::TransactionEngine;
pub use error::{Error, Result};
pub use ledger::Ledger;
pub use metrics::Metrics;
pub use recovery::RecoveryReport;
pub use storage::{LedgerStore, MemoryStore, RocksStore};
pub use types::{
    Account, AccountId, AccountStatus, AccountType, Currency, CustomerId, Money, Transaction,
    TransactionId, TransactionStatus, TransactionType, TransferId,
};
