//! Ledger store contract and implementations
//!
//! The store exclusively owns persisted account and transaction state. All
//! cross-request coordination goes through its atomic primitives:
//!
//! - `compare_and_swap_account` - single-account optimistic update
//! - `append_transaction` - append with `(account_id, idempotency_key)` uniqueness
//! - `commit` - CAS updates, appended records and an idempotency claim, all or nothing
//! - `reserve_idempotency_key` - in-flight reservation backing the idempotency guard

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::RocksStore;

use crate::types::{
    Account, AccountId, CustomerId, Transaction, TransactionId, TransactionStatus, TransactionType,
    TransferId,
};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome of a single-account compare-and-swap
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// Stored; carries the account as persisted (version bumped)
    Swapped(Account),
    /// Stored version differs from the expected one
    VersionConflict {
        /// Version the caller read
        expected: u64,
        /// Version currently stored
        actual: u64,
    },
    /// No such account
    NotFound,
}

/// Outcome of a transaction append
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Appended
    Appended,
    /// `(account_id, idempotency_key)` already taken; carries the owner when committed
    DuplicateKey(Option<Transaction>),
}

/// One account update inside a batch
#[derive(Debug, Clone)]
pub struct AccountUpdate {
    /// Version the caller read
    pub expected_version: u64,
    /// New account state; stored with `expected_version + 1`
    pub account: Account,
}

/// Atomic multi-record write
#[derive(Debug, Clone, Default)]
pub struct LedgerBatch {
    /// Account CAS updates
    pub updates: Vec<AccountUpdate>,
    /// Records to append
    pub transactions: Vec<Transaction>,
    /// Token of the idempotency reservation this batch completes
    pub reservation: Option<Uuid>,
}

/// Outcome of an atomic batch commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Everything stored; carries the accounts as persisted
    Committed(Vec<Account>),
    /// One of the accounts moved on
    VersionConflict {
        /// Conflicting account
        account_id: AccountId,
        /// Version the caller read
        expected: u64,
        /// Version currently stored
        actual: u64,
    },
    /// One of the accounts does not exist
    AccountNotFound(AccountId),
    /// An idempotency key is owned by someone else
    DuplicateKey {
        /// Account the key is scoped to
        account_id: AccountId,
        /// Idempotency key
        key: String,
        /// Owner, when it already committed
        existing: Option<Transaction>,
    },
}

/// State of an idempotency reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyState {
    /// A request holds the key and has not committed yet
    InFlight,
    /// The key belongs to a committed transaction
    Completed(TransactionId),
}

/// Idempotency reservation `(account_id, key) -> state`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyReservation {
    /// Account the key is scoped to
    pub account_id: AccountId,
    /// Client key
    pub key: String,
    /// Token identifying the holder
    pub token: Uuid,
    /// State
    pub state: KeyState,
    /// When the holder reserved it
    pub reserved_at: DateTime<Utc>,
}

/// Outcome of a reservation attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// Caller now holds the key (fresh or taken over from a stale holder)
    Reserved,
    /// Someone else holds or completed the key
    Existing(KeyReservation),
}

/// Durable keyed storage for accounts and transactions
#[async_trait]
pub trait LedgerStore: Send + Sync + std::fmt::Debug {
    /// Whether `commit` accepts batches touching more than one account
    fn supports_multi_account_commit(&self) -> bool;

    /// Insert a new account, with its opening transaction if any
    async fn create_account(&self, account: &Account, opening: Option<&Transaction>) -> Result<()>;

    /// Get account by ID (`Error::AccountNotFound` when absent)
    async fn get_account(&self, account_id: &AccountId) -> Result<Account>;

    /// Accounts owned by a customer, in creation order
    async fn list_accounts_by_customer(&self, customer_id: &CustomerId) -> Result<Vec<Account>>;

    /// Store `account` with version `expected_version + 1` iff the stored version matches
    async fn compare_and_swap_account(
        &self,
        expected_version: u64,
        account: &Account,
    ) -> Result<CasOutcome>;

    /// Append a record; keyed non-failed records claim their idempotency key
    async fn append_transaction(&self, record: &Transaction) -> Result<AppendOutcome>;

    /// Apply a batch atomically
    async fn commit(&self, batch: &LedgerBatch) -> Result<CommitOutcome>;

    /// Get transaction by ID
    async fn get_transaction(&self, transaction_id: &TransactionId) -> Result<Option<Transaction>>;

    /// Committed transaction owning `(account_id, key)`
    async fn find_by_idempotency_key(
        &self,
        account_id: &AccountId,
        key: &str,
    ) -> Result<Option<Transaction>>;

    /// All records of an account in append order
    async fn account_history(&self, account_id: &AccountId) -> Result<Vec<Transaction>>;

    /// All legs of a transfer in append order
    async fn transfer_legs(&self, transfer_id: &TransferId) -> Result<Vec<Transaction>>;

    /// Committed records of a type across the ledger, in append order
    async fn committed_of_type(&self, tx_type: TransactionType) -> Result<Vec<Transaction>>;

    /// Reserve `(account_id, key)`; in-flight holders reserved before `stale_before` are replaced
    async fn reserve_idempotency_key(
        &self,
        reservation: &KeyReservation,
        stale_before: DateTime<Utc>,
    ) -> Result<ReserveOutcome>;

    /// Drop an in-flight reservation held by `token`; no-op otherwise
    async fn release_idempotency_key(
        &self,
        account_id: &AccountId,
        key: &str,
        token: Uuid,
    ) -> Result<()>;
}

/// Decide whether `record` may claim `existing` for its key
///
/// Returns `true` when the claim is allowed: free key, or an in-flight
/// reservation held by `token`.
pub(crate) fn may_claim(existing: Option<&KeyReservation>, token: Option<Uuid>) -> bool {
    match existing {
        None => true,
        Some(held) => held.state == KeyState::InFlight && Some(held.token) == token,
    }
}

/// Whether a record takes part in idempotency indexing
pub(crate) fn claims_key(record: &Transaction) -> Option<&str> {
    match record.status {
        TransactionStatus::Failed => None,
        _ => record.idempotency_key.as_deref(),
    }
}
