//! Error types for the ledger

use crate::types::{AccountId, AccountStatus, Currency, Money, TransactionId, TransferId};
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Amount is zero, negative, overflowing or too precise for its currency
    #[error("Invalid amount {amount}: {reason}")]
    InvalidAmount {
        /// Offending amount as supplied
        amount: String,
        /// What is wrong with it
        reason: String,
    },

    /// Currency of the request does not match the account
    #[error("Currency mismatch on account {account_id}: expected {expected}, got {actual}")]
    CurrencyMismatch {
        /// Account whose currency was violated
        account_id: AccountId,
        /// Account currency
        expected: Currency,
        /// Requested currency
        actual: Currency,
    },

    /// Debit would drive the balance negative
    #[error("Insufficient funds on account {account_id}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        /// Debited account
        account_id: AccountId,
        /// Balance at validation time
        balance: Money,
        /// Requested debit
        requested: Money,
    },

    /// Account is frozen or closed
    #[error("Account {account_id} is not active ({status})")]
    AccountNotActive {
        /// Account
        account_id: AccountId,
        /// Current status
        status: AccountStatus,
    },

    /// Account not found
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// Account id already taken
    #[error("Account already exists: {0}")]
    AccountExists(AccountId),

    /// Transfer source and destination are identical
    #[error("Cannot transfer from account {0} to itself")]
    SameAccount(AccountId),

    /// Version conflicts persisted through every retry
    #[error("Concurrent modification of account {account_id} after {attempts} attempts")]
    ConcurrentModification {
        /// Contended account
        account_id: AccountId,
        /// Attempts made, including the first
        attempts: u32,
    },

    /// Credit leg failed and the debit was reversed
    #[error("Transfer {transfer_id} failed and was compensated: {reason}")]
    TransferFailed {
        /// Transfer
        transfer_id: TransferId,
        /// Why the credit leg failed
        reason: String,
    },

    /// Another request holding the same idempotency key is in flight
    #[error("Request with idempotency key {key} on account {account_id} is already in progress")]
    DuplicateRequest {
        /// Account the key is scoped to
        account_id: AccountId,
        /// Idempotency key
        key: String,
    },

    /// Idempotency key was already used for a different request
    #[error("Idempotency key {key} on account {account_id} was used by transaction {transaction_id} with different parameters")]
    IdempotencyKeyReused {
        /// Account the key is scoped to
        account_id: AccountId,
        /// Idempotency key
        key: String,
        /// Transaction that owns the key
        transaction_id: TransactionId,
    },

    /// Status change not allowed
    #[error("Account {account_id} cannot go from {from} to {to}")]
    InvalidStatusTransition {
        /// Account
        account_id: AccountId,
        /// Current status
        from: AccountStatus,
        /// Requested status
        to: AccountStatus,
    },

    /// Transaction not found
    #[error("Transaction not found: {0}")]
    TransactionNotFound(TransactionId),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the caller may retry the same request with the same idempotency key.
    ///
    /// Validation failures are terminal; only contention and storage hiccups qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConcurrentModification { .. }
                | Error::DuplicateRequest { .. }
                | Error::Storage(_)
        )
    }

    /// Stable snake_case name, used as the metrics outcome label
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidAmount { .. } => "invalid_amount",
            Error::CurrencyMismatch { .. } => "currency_mismatch",
            Error::InsufficientFunds { .. } => "insufficient_funds",
            Error::AccountNotActive { .. } => "account_not_active",
            Error::AccountNotFound(_) => "account_not_found",
            Error::AccountExists(_) => "account_exists",
            Error::SameAccount(_) => "same_account",
            Error::ConcurrentModification { .. } => "concurrent_modification",
            Error::TransferFailed { .. } => "transfer_failed",
            Error::DuplicateRequest { .. } => "duplicate_request",
            Error::IdempotencyKeyReused { .. } => "idempotency_key_reused",
            Error::InvalidStatusTransition { .. } => "invalid_status_transition",
            Error::TransactionNotFound(_) => "transaction_not_found",
            Error::Storage(_) => "storage",
            Error::Serialization(_) => "serialization",
            Error::Config(_) => "config",
            Error::Metrics(_) => "metrics",
            Error::Io(_) => "io",
        }
    }

    pub(crate) fn invalid_amount(amount: impl ToString, reason: impl Into<String>) -> Self {
        Error::InvalidAmount {
            amount: amount.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<prometheus::Error> for Error {
    fn from(err: prometheus::Error) -> Self {
        Error::Metrics(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        let account_id = AccountId::new("ACC-1");

        assert!(Error::ConcurrentModification {
            account_id: account_id.clone(),
            attempts: 5,
        }
        .is_retryable());
        assert!(Error::DuplicateRequest {
            account_id: account_id.clone(),
            key: "k".to_string(),
        }
        .is_retryable());

        assert!(!Error::AccountNotFound(account_id.clone()).is_retryable());
        assert!(!Error::SameAccount(account_id).is_retryable());
        assert!(!Error::invalid_amount("-1", "must be positive").is_retryable());
    }

    #[test]
    fn test_error_carries_detail() {
        let err = Error::InsufficientFunds {
            account_id: AccountId::new("ACC-7"),
            balance: Money::new(rust_decimal::Decimal::new(3000, 2), Currency::USD).unwrap(),
            requested: Money::new(rust_decimal::Decimal::new(5000, 2), Currency::USD).unwrap(),
        };
        assert_eq!(
            err.to_string(),
            "Insufficient funds on account ACC-7: balance 30.00 USD, requested 50.00 USD"
        );
    }
}
