//! Core types for the ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (Decimal for money)
//! - Immutability of committed records

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Hash of an empty chain
pub const GENESIS_HASH: [u8; 32] = [0u8; 32];

/// Account identifier (opaque, immutable once created)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    /// Create new account ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Owning customer reference (external entity)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CustomerId(String);

impl CustomerId {
    /// Create new customer ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CustomerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Wrap a UUID
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier shared by all legs of one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransferId(Uuid);

impl TransferId {
    /// Wrap a UUID
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ISO 4217 currency code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Currency {
    /// US Dollar
    USD,
    /// Euro
    EUR,
    /// British Pound
    GBP,
    /// UAE Dirham
    AED,
    /// Indian Rupee
    INR,
    /// Swiss Franc
    CHF,
    /// Canadian Dollar
    CAD,
    /// Japanese Yen
    JPY,
}

impl Currency {
    /// ISO 4217 code
    pub fn code(&self) -> &'static str {
        match self {
            Currency::USD => "USD",
            Currency::EUR => "EUR",
            Currency::GBP => "GBP",
            Currency::AED => "AED",
            Currency::INR => "INR",
            Currency::CHF => "CHF",
            Currency::CAD => "CAD",
            Currency::JPY => "JPY",
        }
    }

    /// Number of decimal places of the minor unit
    pub fn minor_units(&self) -> u32 {
        match self {
            Currency::JPY => 0,
            _ => 2,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Unknown currency code
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown currency code: {0}")]
pub struct ParseCurrencyError(String);

impl FromStr for Currency {
    type Err = ParseCurrencyError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "USD" => Ok(Currency::USD),
            "EUR" => Ok(Currency::EUR),
            "GBP" => Ok(Currency::GBP),
            "AED" => Ok(Currency::AED),
            "INR" => Ok(Currency::INR),
            "CHF" => Ok(Currency::CHF),
            "CAD" => Ok(Currency::CAD),
            "JPY" => Ok(Currency::JPY),
            _ => Err(ParseCurrencyError(s.to_string())),
        }
    }
}

/// Fixed-precision amount in a currency
///
/// The amount is always held at exactly the currency's minor-unit scale,
/// so `Money` values compare and display consistently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "UncheckedMoney")]
pub struct Money {
    amount: Decimal,
    currency: Currency,
}

/// Wire form of `Money`; decoded values go through `Money::new`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct UncheckedMoney {
    amount: Decimal,
    currency: Currency,
}

impl TryFrom<UncheckedMoney> for Money {
    type Error = Error;

    fn try_from(raw: UncheckedMoney) -> Result<Self> {
        Money::new(raw.amount, raw.currency)
    }
}

impl Money {
    /// Create money, rejecting amounts more precise than the currency allows
    pub fn new(amount: Decimal, currency: Currency) -> Result<Self> {
        let minor_units = currency.minor_units();
        if amount.normalize().scale() > minor_units {
            return Err(Error::invalid_amount(
                format!("{} {}", amount, currency),
                format!("{} allows at most {} decimal places", currency, minor_units),
            ));
        }

        let mut amount = amount;
        amount.rescale(minor_units);
        Ok(Self { amount, currency })
    }

    /// Zero in the given currency
    pub fn zero(currency: Currency) -> Self {
        let mut amount = Decimal::ZERO;
        amount.rescale(currency.minor_units());
        Self { amount, currency }
    }

    /// Amount
    pub fn amount(&self) -> Decimal {
        self.amount
    }

    /// Currency
    pub fn currency(&self) -> Currency {
        self.currency
    }

    /// Strictly greater than zero
    pub fn is_positive(&self) -> bool {
        self.amount > Decimal::ZERO
    }

    /// Strictly less than zero
    pub fn is_negative(&self) -> bool {
        self.amount < Decimal::ZERO
    }

    /// Exactly zero
    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }

    /// Sum; `None` on currency mismatch or overflow
    pub fn checked_add(&self, other: &Money) -> Option<Money> {
        if self.currency != other.currency {
            return None;
        }
        let amount = self.amount.checked_add(other.amount)?;
        Some(Self {
            amount,
            currency: self.currency,
        })
    }

    /// Difference; `None` on currency mismatch or overflow
    pub fn checked_sub(&self, other: &Money) -> Option<Money> {
        if self.currency != other.currency {
            return None;
        }
        let amount = self.amount.checked_sub(other.amount)?;
        Some(Self {
            amount,
            currency: self.currency,
        })
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

/// Account product type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountType {
    /// Everyday account
    Checking,
    /// Savings account
    Savings,
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountType::Checking => write!(f, "CHECKING"),
            AccountType::Savings => write!(f, "SAVINGS"),
        }
    }
}

/// Account status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AccountStatus {
    /// Accepts all operations
    Active = 1,
    /// Temporarily blocked; only compensating credits are applied
    Frozen = 2,
    /// Terminal
    Closed = 3,
}

impl AccountStatus {
    /// Whether a status change is allowed (balance rules are checked separately)
    pub fn can_transition_to(&self, next: AccountStatus) -> bool {
        matches!(
            (self, next),
            (AccountStatus::Active, AccountStatus::Frozen)
                | (AccountStatus::Frozen, AccountStatus::Active)
                | (AccountStatus::Active, AccountStatus::Closed)
                | (AccountStatus::Frozen, AccountStatus::Closed)
        )
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountStatus::Active => write!(f, "ACTIVE"),
            AccountStatus::Frozen => write!(f, "FROZEN"),
            AccountStatus::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Account entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account ID
    pub account_id: AccountId,

    /// Owning customer
    pub customer_id: CustomerId,

    /// Product type
    pub account_type: AccountType,

    /// Current balance; its currency is the account currency
    pub balance: Money,

    /// Status
    pub status: AccountStatus,

    /// Optimistic concurrency version, +1 per committed mutation
    pub version: u64,

    /// Entry hash of the last committed transaction
    pub head_hash: [u8; 32],

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Account currency (immutable)
    pub fn currency(&self) -> Currency {
        self.balance.currency()
    }

    /// Whether the account accepts regular operations
    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }
}

/// Transaction type; direction of the balance effect is encoded here
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransactionType {
    /// Credit from outside the ledger
    Deposit = 1,
    /// Debit to outside the ledger
    Withdrawal = 2,
    /// Debit leg of a transfer
    TransferOut = 3,
    /// Credit leg of a transfer
    TransferIn = 4,
    /// Credit offsetting a TransferOut whose credit leg failed
    Reversal = 5,
}

impl TransactionType {
    /// Whether the type increases the balance
    pub fn is_credit(&self) -> bool {
        matches!(
            self,
            TransactionType::Deposit | TransactionType::TransferIn | TransactionType::Reversal
        )
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionType::Deposit => write!(f, "DEPOSIT"),
            TransactionType::Withdrawal => write!(f, "WITHDRAWAL"),
            TransactionType::TransferOut => write!(f, "TRANSFER_OUT"),
            TransactionType::TransferIn => write!(f, "TRANSFER_IN"),
            TransactionType::Reversal => write!(f, "REVERSAL"),
        }
    }
}

/// Transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransactionStatus {
    /// Built, not yet applied
    Pending = 1,
    /// Applied to the balance (immutable)
    Committed = 2,
    /// Rejected; kept for audit, never affects balances
    Failed = 3,
}

/// Ledger transaction record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique transaction ID
    pub transaction_id: TransactionId,

    /// Type of transaction
    pub tx_type: TransactionType,

    /// Account this record belongs to
    pub account_id: AccountId,

    /// Other side of a transfer or reversal
    pub counterparty_account_id: Option<AccountId>,

    /// Transfer this leg belongs to
    pub transfer_id: Option<TransferId>,

    /// Positive magnitude
    pub amount: Money,

    /// Balance right after this transaction (unchanged balance for failures)
    pub resulting_balance: Money,

    /// Account version right after this transaction
    pub account_version: u64,

    /// Status
    pub status: TransactionStatus,

    /// Client-supplied idempotency key
    pub idempotency_key: Option<String>,

    /// Free-text description
    pub description: Option<String>,

    /// Why the transaction failed
    pub failure_reason: Option<String>,

    /// Entry hash of the previous committed transaction on the account
    pub previous_hash: [u8; 32],

    /// Hash of this entry
    pub entry_hash: [u8; 32],

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// Build a pending transaction
    pub fn pending(
        transaction_id: TransactionId,
        tx_type: TransactionType,
        account_id: AccountId,
        amount: Money,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            transaction_id,
            tx_type,
            account_id,
            counterparty_account_id: None,
            transfer_id: None,
            amount,
            resulting_balance: Money::zero(amount.currency()),
            account_version: 0,
            status: TransactionStatus::Pending,
            idempotency_key: None,
            description: None,
            failure_reason: None,
            previous_hash: GENESIS_HASH,
            entry_hash: GENESIS_HASH,
            created_at,
        }
    }

    /// Attach the counterparty and transfer of a transfer leg
    pub fn with_transfer(mut self, transfer_id: TransferId, counterparty: AccountId) -> Self {
        self.transfer_id = Some(transfer_id);
        self.counterparty_account_id = Some(counterparty);
        self
    }

    /// Attach an idempotency key
    pub fn with_idempotency_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key;
        self
    }

    /// Attach a description
    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    /// Mark committed on top of `account` after the mutation
    pub fn commit(mut self, mutated: &Account, previous_hash: [u8; 32]) -> Self {
        self.status = TransactionStatus::Committed;
        self.resulting_balance = mutated.balance;
        self.account_version = mutated.version;
        self.previous_hash = previous_hash;
        self.entry_hash = self.compute_hash();
        self
    }

    /// Mark failed against the account state that was observed
    ///
    /// Failed records never hold an idempotency key, so a retry may reuse it.
    pub fn fail(mut self, observed: &Account, reason: impl Into<String>) -> Self {
        self.status = TransactionStatus::Failed;
        self.resulting_balance = observed.balance;
        self.account_version = observed.version;
        self.previous_hash = observed.head_hash;
        self.idempotency_key = None;
        self.failure_reason = Some(reason.into());
        self.entry_hash = self.compute_hash();
        self
    }

    /// Signed balance effect of a committed record
    pub fn effect(&self) -> Decimal {
        match self.status {
            TransactionStatus::Committed if self.tx_type.is_credit() => self.amount.amount(),
            TransactionStatus::Committed => -self.amount.amount(),
            _ => Decimal::ZERO,
        }
    }

    /// Whether this record applied to the balance
    pub fn is_committed(&self) -> bool {
        self.status == TransactionStatus::Committed
    }

    /// Compute entry hash
    pub fn compute_hash(&self) -> [u8; 32] {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(self.transaction_id.as_uuid().as_bytes());
        hasher.update([self.tx_type as u8, self.status as u8]);
        hasher.update(self.account_id.as_str().as_bytes());
        if let Some(counterparty) = &self.counterparty_account_id {
            hasher.update(counterparty.as_str().as_bytes());
        }
        if let Some(transfer_id) = &self.transfer_id {
            hasher.update(transfer_id.as_uuid().as_bytes());
        }
        hasher.update(self.amount.to_string().as_bytes());
        hasher.update(self.resulting_balance.to_string().as_bytes());
        hasher.update(self.account_version.to_be_bytes());
        hasher.update(self.previous_hash);
        hasher.update(self.created_at.timestamp_nanos_opt().unwrap_or(0).to_be_bytes());

        hasher.finalize().into()
    }

    /// Whether a replayed request asks for the same economic effect
    pub fn matches_request(
        &self,
        tx_type: TransactionType,
        amount: &Money,
        counterparty: Option<&AccountId>,
    ) -> bool {
        self.tx_type == tx_type
            && &self.amount == amount
            && self.counterparty_account_id.as_ref() == counterparty
    }
}
