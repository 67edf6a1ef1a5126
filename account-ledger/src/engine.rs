//! Transaction engine
//!
//! Validates and applies deposits, withdrawals and transfers against a
//! [`LedgerStore`]. Every mutation is an optimistic read-validate-commit
//! cycle: the account is read, the operation is validated against that
//! snapshot, and the new state plus its transaction record are committed in
//! one atomic batch conditioned on the version that was read. Losing a race
//! re-runs the whole cycle, so balance checks always see the latest state.

use crate::config::Config;
use crate::idempotency::{IdempotencyGuard, Reservation};
use crate::ids::{Clock, IdGenerator, SystemClock, UuidV7Generator};
use crate::metrics::Metrics;
use crate::retry::RetryPolicy;
use crate::storage::{AccountUpdate, CasOutcome, CommitOutcome, LedgerBatch, LedgerStore};
use crate::types::{
    Account, AccountId, AccountStatus, AccountType, CustomerId, Money, Transaction, TransactionId,
    TransactionType, TransferId, GENESIS_HASH,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::slice;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Idempotency key of the credit leg of a transfer
pub fn credit_key(transfer_id: &TransferId) -> String {
    format!("transfer/{}/in", transfer_id)
}

/// Idempotency key of the reversal compensating a transfer
pub fn reversal_key(transfer_id: &TransferId) -> String {
    format!("transfer/{}/reversal", transfer_id)
}

/// One account-side effect of an operation
#[derive(Debug, Clone)]
pub(crate) struct Leg {
    pub tx_type: TransactionType,
    pub account_id: AccountId,
    pub amount: Money,
    pub idempotency_key: Option<String>,
    pub description: Option<String>,
    pub transfer: Option<(TransferId, AccountId)>,
}

impl Leg {
    pub fn new(tx_type: TransactionType, account_id: AccountId, amount: Money) -> Self {
        Self {
            tx_type,
            account_id,
            amount,
            idempotency_key: None,
            description: None,
            transfer: None,
        }
    }

    pub fn keyed(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key;
        self
    }

    pub fn described(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    pub fn in_transfer(mut self, transfer_id: TransferId, counterparty: AccountId) -> Self {
        self.transfer = Some((transfer_id, counterparty));
        self
    }

    /// Credit leg completing the transfer `debit` belongs to
    pub fn credit_for(debit: &Transaction) -> Result<Self> {
        let (transfer_id, destination) = transfer_of(debit)?;
        Ok(Self::new(TransactionType::TransferIn, destination, debit.amount)
            .keyed(Some(credit_key(&transfer_id)))
            .described(debit.description.clone())
            .in_transfer(transfer_id, debit.account_id.clone()))
    }

    fn counterparty(&self) -> Option<&AccountId> {
        self.transfer.as_ref().map(|(_, counterparty)| counterparty)
    }

    fn pending(&self, transaction_id: TransactionId, now: DateTime<Utc>) -> Transaction {
        let record = Transaction::pending(
            transaction_id,
            self.tx_type,
            self.account_id.clone(),
            self.amount,
            now,
        )
        .with_idempotency_key(self.idempotency_key.clone())
        .with_description(self.description.clone());

        match &self.transfer {
            Some((transfer_id, counterparty)) => {
                record.with_transfer(*transfer_id, counterparty.clone())
            }
            None => record,
        }
    }

    /// Validate against `account` and compute the resulting balance
    pub fn check(&self, account: &Account) -> Result<Money> {
        if account.currency() != self.amount.currency() {
            return Err(Error::CurrencyMismatch {
                account_id: account.account_id.clone(),
                expected: account.currency(),
                actual: self.amount.currency(),
            });
        }

        // Compensation must land even on a frozen or closed account; the
        // status is left as is
        if !account.is_active() && self.tx_type != TransactionType::Reversal {
            return Err(Error::AccountNotActive {
                account_id: account.account_id.clone(),
                status: account.status,
            });
        }

        let next = if self.tx_type.is_credit() {
            account.balance.checked_add(&self.amount)
        } else {
            account.balance.checked_sub(&self.amount)
        }
        .ok_or_else(|| Error::invalid_amount(self.amount, "balance out of range"))?;

        if next.is_negative() {
            return Err(Error::InsufficientFunds {
                account_id: account.account_id.clone(),
                balance: account.balance,
                requested: self.amount,
            });
        }

        Ok(next)
    }
}

/// Transfer id and destination of a transfer leg
pub(crate) fn transfer_of(record: &Transaction) -> Result<(TransferId, AccountId)> {
    match (&record.transfer_id, &record.counterparty_account_id) {
        (Some(transfer_id), Some(counterparty)) => Ok((*transfer_id, counterparty.clone())),
        _ => Err(Error::Storage(format!(
            "transaction {} is not a transfer leg",
            record.transaction_id
        ))),
    }
}

/// Result of a committed batch of legs
#[derive(Debug)]
pub(crate) enum Applied {
    /// Records as committed, in leg order
    Committed(Vec<Transaction>),
    /// Idempotency key already owned by another request (its record, once committed)
    Superseded(Option<Transaction>),
}

fn single(records: Vec<Transaction>) -> Result<Transaction> {
    records
        .into_iter()
        .next()
        .ok_or_else(|| Error::Storage("commit returned no transaction".to_string()))
}

fn validate_amount(amount: &Money) -> Result<()> {
    if !amount.is_positive() {
        return Err(Error::invalid_amount(amount, "must be greater than zero"));
    }
    Ok(())
}

/// Deposit, withdrawal and transfer processing
#[derive(Debug, Clone)]
pub struct TransactionEngine {
    store: Arc<dyn LedgerStore>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    guard: IdempotencyGuard,
    retry: RetryPolicy,
    metrics: Metrics,
    reservation_ttl: Duration,
    in_flight_wait: RetryPolicy,
    record_failures: bool,
}

impl TransactionEngine {
    /// Create engine over a store
    pub fn new(store: Arc<dyn LedgerStore>, config: &Config, metrics: Metrics) -> Self {
        let ids: Arc<dyn IdGenerator> = Arc::new(UuidV7Generator);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let reservation_ttl = Duration::from_millis(config.idempotency.reservation_ttl_ms);
        let in_flight_wait = RetryPolicy::new(config.idempotency.in_flight_wait.clone());

        Self {
            guard: IdempotencyGuard::new(
                store.clone(),
                ids.clone(),
                clock.clone(),
                reservation_ttl,
                in_flight_wait.clone(),
            ),
            store,
            ids,
            clock,
            retry: RetryPolicy::new(config.retry.clone()),
            metrics,
            reservation_ttl,
            in_flight_wait,
            record_failures: config.audit.record_failed_transactions,
        }
    }

    /// Replace the identifier source
    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self.rebuild_guard();
        self
    }

    /// Replace the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self.rebuild_guard();
        self
    }

    fn rebuild_guard(&mut self) {
        self.guard = IdempotencyGuard::new(
            self.store.clone(),
            self.ids.clone(),
            self.clock.clone(),
            self.reservation_ttl,
            self.in_flight_wait.clone(),
        );
    }

    pub(crate) fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub(crate) fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    // Accounts

    /// Open an account; a positive opening balance is booked as a deposit
    pub async fn create_account(
        &self,
        customer_id: CustomerId,
        account_type: AccountType,
        initial_balance: Money,
    ) -> Result<Account> {
        let started = Instant::now();
        let result = self
            .open_account(customer_id, account_type, initial_balance)
            .await;
        self.observe("create_account", started, &result);
        result
    }

    async fn open_account(
        &self,
        customer_id: CustomerId,
        account_type: AccountType,
        initial_balance: Money,
    ) -> Result<Account> {
        if initial_balance.is_negative() {
            return Err(Error::invalid_amount(
                initial_balance,
                "opening balance cannot be negative",
            ));
        }

        let now = self.clock.now();
        let mut account = Account {
            account_id: self.ids.account_id(),
            customer_id,
            account_type,
            balance: Money::zero(initial_balance.currency()),
            status: AccountStatus::Active,
            version: 0,
            head_hash: GENESIS_HASH,
            created_at: now,
            updated_at: now,
        };

        let opening = if initial_balance.is_positive() {
            account.balance = initial_balance;
            account.version = 1;
            let record = Leg::new(
                TransactionType::Deposit,
                account.account_id.clone(),
                initial_balance,
            )
            .described(Some("Opening balance".to_string()))
            .pending(self.ids.transaction_id(), now)
            .commit(&account, GENESIS_HASH);
            account.head_hash = record.entry_hash;
            Some(record)
        } else {
            None
        };

        self.store.create_account(&account, opening.as_ref()).await?;

        tracing::info!(
            account_id = %account.account_id,
            customer_id = %account.customer_id,
            account_type = %account.account_type,
            balance = %account.balance,
            "Account created"
        );

        Ok(account)
    }

    /// Freeze an active account
    pub async fn freeze_account(&self, account_id: &AccountId) -> Result<Account> {
        self.change_status(account_id, AccountStatus::Frozen).await
    }

    /// Reactivate a frozen account
    pub async fn unfreeze_account(&self, account_id: &AccountId) -> Result<Account> {
        self.change_status(account_id, AccountStatus::Active).await
    }

    /// Close an account; the balance must be zero
    pub async fn close_account(&self, account_id: &AccountId) -> Result<Account> {
        self.change_status(account_id, AccountStatus::Closed).await
    }

    async fn change_status(&self, account_id: &AccountId, next: AccountStatus) -> Result<Account> {
        let started = Instant::now();
        let result = self.apply_status(account_id, next).await;
        self.observe("change_status", started, &result);
        result
    }

    async fn apply_status(&self, account_id: &AccountId, next: AccountStatus) -> Result<Account> {
        let mut attempt = 0;
        loop {
            let account = self.store.get_account(account_id).await?;

            let closing_with_funds = next == AccountStatus::Closed && !account.balance.is_zero();
            if !account.status.can_transition_to(next) || closing_with_funds {
                return Err(Error::InvalidStatusTransition {
                    account_id: account_id.clone(),
                    from: account.status,
                    to: next,
                });
            }

            let mut updated = account.clone();
            updated.status = next;
            updated.updated_at = self.clock.now();

            match self
                .store
                .compare_and_swap_account(account.version, &updated)
                .await?
            {
                CasOutcome::Swapped(stored) => {
                    tracing::info!(
                        account_id = %account_id,
                        from = %account.status,
                        to = %next,
                        version = stored.version,
                        "Account status changed"
                    );
                    return Ok(stored);
                }
                CasOutcome::VersionConflict { .. } => {
                    self.metrics.record_conflict("change_status");
                    if !self.retry.should_retry(attempt) {
                        return Err(Error::ConcurrentModification {
                            account_id: account_id.clone(),
                            attempts: self.retry.max_attempts(),
                        });
                    }
                    self.retry.backoff(attempt).await;
                    attempt += 1;
                }
                CasOutcome::NotFound => return Err(Error::AccountNotFound(account_id.clone())),
            }
        }
    }

    // Money movements

    /// Credit an account
    pub async fn deposit(
        &self,
        account_id: &AccountId,
        amount: Money,
        idempotency_key: Option<String>,
        description: Option<String>,
    ) -> Result<Transaction> {
        let started = Instant::now();
        let leg = Leg::new(TransactionType::Deposit, account_id.clone(), amount)
            .keyed(idempotency_key)
            .described(description);
        let result = self.apply_single("deposit", leg).await;
        self.observe("deposit", started, &result);
        result
    }

    /// Debit an account; never drives the balance below zero
    pub async fn withdraw(
        &self,
        account_id: &AccountId,
        amount: Money,
        idempotency_key: Option<String>,
        description: Option<String>,
    ) -> Result<Transaction> {
        let started = Instant::now();
        let leg = Leg::new(TransactionType::Withdrawal, account_id.clone(), amount)
            .keyed(idempotency_key)
            .described(description);
        let result = self.apply_single("withdraw", leg).await;
        self.observe("withdraw", started, &result);
        result
    }

    async fn apply_single(&self, operation: &'static str, leg: Leg) -> Result<Transaction> {
        validate_amount(&leg.amount)?;

        let Some(key) = leg.idempotency_key.clone() else {
            return self.commit_single(operation, &leg, None).await;
        };

        match self.guard.check_and_reserve(&leg.account_id, &key).await? {
            Reservation::AlreadyProcessed(prior) => self.replay(prior, &leg, &key),
            Reservation::FirstSeen(token) => {
                let result = self.commit_single(operation, &leg, Some(token)).await;
                if result.is_err() {
                    self.guard.release(&leg.account_id, &key, token).await;
                }
                result
            }
        }
    }

    async fn commit_single(
        &self,
        operation: &'static str,
        leg: &Leg,
        token: Option<Uuid>,
    ) -> Result<Transaction> {
        match self
            .commit_legs(operation, slice::from_ref(leg), token)
            .await?
        {
            Applied::Committed(records) => {
                let record = single(records)?;
                tracing::debug!(
                    transaction_id = %record.transaction_id,
                    account_id = %record.account_id,
                    tx_type = %record.tx_type,
                    amount = %record.amount,
                    balance = %record.resulting_balance,
                    "Transaction committed"
                );
                Ok(record)
            }
            Applied::Superseded(existing) => self.superseded(existing, leg),
        }
    }

    /// Move money between two accounts of the same currency
    ///
    /// Returns the `(TransferOut, TransferIn)` pair. On stores without
    /// multi-account commits a failed credit is compensated with a reversal
    /// on the source before `TransferFailed` is returned.
    pub async fn transfer(
        &self,
        from: &AccountId,
        to: &AccountId,
        amount: Money,
        idempotency_key: Option<String>,
        description: Option<String>,
    ) -> Result<(Transaction, Transaction)> {
        let started = Instant::now();
        let result = self
            .apply_transfer(from, to, amount, idempotency_key, description)
            .await;
        self.observe("transfer", started, &result);
        result
    }

    async fn apply_transfer(
        &self,
        from: &AccountId,
        to: &AccountId,
        amount: Money,
        idempotency_key: Option<String>,
        description: Option<String>,
    ) -> Result<(Transaction, Transaction)> {
        if from == to {
            return Err(Error::SameAccount(from.clone()));
        }
        validate_amount(&amount)?;

        let transfer_id = self.ids.transfer_id();
        let debit = Leg::new(TransactionType::TransferOut, from.clone(), amount)
            .keyed(idempotency_key.clone())
            .described(description.clone())
            .in_transfer(transfer_id, to.clone());
        let credit = Leg::new(TransactionType::TransferIn, to.clone(), amount)
            .keyed(Some(credit_key(&transfer_id)))
            .described(description)
            .in_transfer(transfer_id, from.clone());

        let Some(key) = idempotency_key else {
            return self.run_transfer(&debit, &credit, None).await;
        };

        match self.guard.check_and_reserve(from, &key).await? {
            Reservation::AlreadyProcessed(prior) => self.replay_transfer(prior, &debit, &key).await,
            Reservation::FirstSeen(token) => {
                let result = self.run_transfer(&debit, &credit, Some(token)).await;
                if result.is_err() {
                    // No-op once the debit committed and completed the key
                    self.guard.release(from, &key, token).await;
                }
                result
            }
        }
    }

    async fn run_transfer(
        &self,
        debit: &Leg,
        credit: &Leg,
        token: Option<Uuid>,
    ) -> Result<(Transaction, Transaction)> {
        let (out, inn) = if self.store.supports_multi_account_commit() {
            self.transfer_atomic(debit, credit, token).await?
        } else {
            self.transfer_compensating(debit, credit, token).await?
        };

        tracing::debug!(
            transfer_id = ?out.transfer_id,
            from = %out.account_id,
            to = %inn.account_id,
            amount = %out.amount,
            "Transfer committed"
        );

        Ok((out, inn))
    }

    async fn transfer_atomic(
        &self,
        debit: &Leg,
        credit: &Leg,
        token: Option<Uuid>,
    ) -> Result<(Transaction, Transaction)> {
        let legs = [debit.clone(), credit.clone()];
        match self.commit_legs("transfer", &legs, token).await? {
            Applied::Committed(records) => {
                let mut records = records.into_iter();
                match (records.next(), records.next()) {
                    (Some(out), Some(inn)) => Ok((out, inn)),
                    _ => Err(Error::Storage(
                        "transfer commit returned fewer than two legs".to_string(),
                    )),
                }
            }
            Applied::Superseded(existing) => self.superseded_transfer(existing, debit).await,
        }
    }

    async fn transfer_compensating(
        &self,
        debit: &Leg,
        credit: &Leg,
        token: Option<Uuid>,
    ) -> Result<(Transaction, Transaction)> {
        // Reject up front what would certainly fail the credit
        let destination = self.store.get_account(&credit.account_id).await?;
        if let Err(e) = credit.check(&destination) {
            let source = self.store.get_account(&debit.account_id).await?;
            let now = self.clock.now();
            self.record_failure(debit, &source, &e, now).await;
            return Err(e);
        }

        let out = match self
            .commit_legs("transfer", slice::from_ref(debit), token)
            .await?
        {
            Applied::Committed(records) => single(records)?,
            Applied::Superseded(existing) => {
                return self.superseded_transfer(existing, debit).await
            }
        };

        match self
            .commit_legs("transfer", slice::from_ref(credit), None)
            .await
        {
            Ok(Applied::Committed(records)) => Ok((out, single(records)?)),
            // Recovery got there first
            Ok(Applied::Superseded(Some(inn))) => Ok((out, inn)),
            Ok(Applied::Superseded(None)) => Err(Error::DuplicateRequest {
                account_id: credit.account_id.clone(),
                key: credit.idempotency_key.clone().unwrap_or_default(),
            }),
            Err(e) => {
                let (transfer_id, _) = transfer_of(&out)?;
                let reason = e.to_string();
                tracing::warn!(
                    transfer_id = %transfer_id,
                    error = %e,
                    "Transfer credit failed, compensating"
                );

                if let Err(comp) = self.compensate(&out, &reason).await {
                    tracing::error!(
                        transfer_id = %transfer_id,
                        error = %comp,
                        "Compensation failed, transfer left for recovery"
                    );
                    return Err(comp);
                }

                Err(Error::TransferFailed {
                    transfer_id,
                    reason,
                })
            }
        }
    }

    /// Book a reversal offsetting `debit` on its account
    pub(crate) async fn compensate(&self, debit: &Transaction, reason: &str) -> Result<Transaction> {
        let (transfer_id, destination) = transfer_of(debit)?;
        let leg = Leg::new(TransactionType::Reversal, debit.account_id.clone(), debit.amount)
            .keyed(Some(reversal_key(&transfer_id)))
            .described(Some(format!(
                "Reversal of transfer {}: {}",
                transfer_id, reason
            )))
            .in_transfer(transfer_id, destination);

        let reversal = match self
            .commit_legs("compensation", slice::from_ref(&leg), None)
            .await?
        {
            Applied::Committed(records) => single(records)?,
            Applied::Superseded(Some(existing)) => return Ok(existing),
            Applied::Superseded(None) => {
                return Err(Error::DuplicateRequest {
                    account_id: leg.account_id.clone(),
                    key: reversal_key(&transfer_id),
                })
            }
        };

        self.metrics.record_compensation();
        tracing::warn!(
            transfer_id = %transfer_id,
            account_id = %reversal.account_id,
            amount = %reversal.amount,
            "Transfer compensated"
        );

        Ok(reversal)
    }

    // Core cycle

    /// Read, validate and atomically commit `legs`, retrying on version conflicts
    ///
    /// Legs must touch distinct accounts. Accounts are read in id order.
    pub(crate) async fn commit_legs(
        &self,
        operation: &'static str,
        legs: &[Leg],
        token: Option<Uuid>,
    ) -> Result<Applied> {
        let mut scope: Vec<&AccountId> = legs.iter().map(|leg| &leg.account_id).collect();
        scope.sort();
        scope.dedup();

        let mut attempt = 0;
        loop {
            let mut accounts = Vec::with_capacity(scope.len());
            for account_id in &scope {
                accounts.push(self.store.get_account(account_id).await?);
            }
            let now = self.clock.now();

            let mut updates = Vec::with_capacity(legs.len());
            let mut records = Vec::with_capacity(legs.len());
            for leg in legs {
                let account = accounts
                    .iter()
                    .find(|a| a.account_id == leg.account_id)
                    .ok_or_else(|| Error::AccountNotFound(leg.account_id.clone()))?;

                let balance = match leg.check(account) {
                    Ok(balance) => balance,
                    Err(e) => {
                        self.record_failure(leg, account, &e, now).await;
                        return Err(e);
                    }
                };

                let mut mutated = account.clone();
                mutated.balance = balance;
                mutated.version = account.version + 1;
                mutated.updated_at = now;

                let record = leg
                    .pending(self.ids.transaction_id(), now)
                    .commit(&mutated, account.head_hash);
                mutated.head_hash = record.entry_hash;

                updates.push(AccountUpdate {
                    expected_version: account.version,
                    account: mutated,
                });
                records.push(record);
            }

            let batch = LedgerBatch {
                updates,
                transactions: records,
                reservation: token,
            };

            let outcome = self.store.commit(&batch).await?;
            match outcome {
                CommitOutcome::Committed(_) => return Ok(Applied::Committed(batch.transactions)),
                CommitOutcome::VersionConflict {
                    account_id,
                    expected,
                    actual,
                } => {
                    self.metrics.record_conflict(operation);
                    tracing::debug!(
                        account_id = %account_id,
                        expected,
                        actual,
                        attempt,
                        "Version conflict"
                    );

                    if !self.retry.should_retry(attempt) {
                        let err = Error::ConcurrentModification {
                            account_id,
                            attempts: self.retry.max_attempts(),
                        };
                        if let Some(leg) = legs.first() {
                            if let Some(account) =
                                accounts.iter().find(|a| a.account_id == leg.account_id)
                            {
                                self.record_failure(leg, account, &err, now).await;
                            }
                        }
                        return Err(err);
                    }

                    self.retry.backoff(attempt).await;
                    attempt += 1;
                }
                CommitOutcome::AccountNotFound(account_id) => {
                    return Err(Error::AccountNotFound(account_id))
                }
                CommitOutcome::DuplicateKey { existing, .. } => {
                    return Ok(Applied::Superseded(existing))
                }
            }
        }
    }

    /// Append a Failed record for audit
    async fn record_failure(&self, leg: &Leg, observed: &Account, err: &Error, now: DateTime<Utc>) {
        if !self.record_failures {
            return;
        }

        let record = leg
            .pending(self.ids.transaction_id(), now)
            .fail(observed, err.to_string());

        if let Err(e) = self.store.append_transaction(&record).await {
            tracing::warn!(
                account_id = %leg.account_id,
                error = %e,
                "Failed to record rejected transaction"
            );
        }
    }

    // Idempotent replays

    fn replay(&self, prior: Transaction, leg: &Leg, key: &str) -> Result<Transaction> {
        if !prior.matches_request(leg.tx_type, &leg.amount, leg.counterparty()) {
            return Err(Error::IdempotencyKeyReused {
                account_id: leg.account_id.clone(),
                key: key.to_string(),
                transaction_id: prior.transaction_id,
            });
        }

        self.metrics.record_replay();
        tracing::debug!(
            transaction_id = %prior.transaction_id,
            key = %key,
            "Idempotent replay"
        );
        Ok(prior)
    }

    fn superseded(&self, existing: Option<Transaction>, leg: &Leg) -> Result<Transaction> {
        let key = leg.idempotency_key.clone().unwrap_or_default();
        match existing {
            Some(prior) => self.replay(prior, leg, &key),
            None => Err(Error::DuplicateRequest {
                account_id: leg.account_id.clone(),
                key,
            }),
        }
    }

    async fn superseded_transfer(
        &self,
        existing: Option<Transaction>,
        debit: &Leg,
    ) -> Result<(Transaction, Transaction)> {
        let key = debit.idempotency_key.clone().unwrap_or_default();
        match existing {
            Some(prior) => self.replay_transfer(prior, debit, &key).await,
            None => Err(Error::DuplicateRequest {
                account_id: debit.account_id.clone(),
                key,
            }),
        }
    }

    async fn replay_transfer(
        &self,
        prior: Transaction,
        debit: &Leg,
        key: &str,
    ) -> Result<(Transaction, Transaction)> {
        let out = self.replay(prior, debit, key)?;
        let (transfer_id, _) = transfer_of(&out)?;
        let legs = self.store.transfer_legs(&transfer_id).await?;

        if legs
            .iter()
            .any(|leg| leg.tx_type == TransactionType::Reversal && leg.is_committed())
        {
            return Err(Error::TransferFailed {
                transfer_id,
                reason: "credit failed and the debit was reversed".to_string(),
            });
        }

        match legs
            .into_iter()
            .find(|leg| leg.tx_type == TransactionType::TransferIn && leg.is_committed())
        {
            Some(inn) => Ok((out, inn)),
            // Debit committed, credit still pending or awaiting recovery
            None => Err(Error::DuplicateRequest {
                account_id: out.account_id.clone(),
                key: key.to_string(),
            }),
        }
    }

    // Queries

    /// Get account by ID
    pub async fn get_account(&self, account_id: &AccountId) -> Result<Account> {
        self.store.get_account(account_id).await
    }

    /// Current balance
    pub async fn get_balance(&self, account_id: &AccountId) -> Result<Money> {
        Ok(self.store.get_account(account_id).await?.balance)
    }

    /// Accounts owned by a customer
    pub async fn list_accounts_by_customer(&self, customer_id: &CustomerId) -> Result<Vec<Account>> {
        self.store.list_accounts_by_customer(customer_id).await
    }

    /// All records of an account in append order, Failed ones included
    pub async fn get_history(&self, account_id: &AccountId) -> Result<Vec<Transaction>> {
        // Distinguish unknown accounts from empty histories
        self.store.get_account(account_id).await?;
        self.store.account_history(account_id).await
    }

    /// Get transaction by ID
    pub async fn get_transaction(&self, transaction_id: &TransactionId) -> Result<Transaction> {
        self.store
            .get_transaction(transaction_id)
            .await?
            .ok_or(Error::TransactionNotFound(*transaction_id))
    }

    fn observe<T>(&self, operation: &'static str, started: Instant, result: &Result<T>) {
        let outcome = match result {
            Ok(_) => "ok",
            Err(e) => {
                if e.is_retryable() {
                    tracing::warn!(operation, error = %e, "Operation failed");
                } else {
                    tracing::debug!(operation, error = %e, "Operation rejected");
                }
                e.kind()
            }
        };
        self.metrics
            .record_operation(operation, outcome, started.elapsed());
    }
}
