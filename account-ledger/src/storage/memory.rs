//! In-process ledger store
//!
//! One `RwLock` guards every map, so each operation is linearizable. Nothing
//! survives the process; use [`super::RocksStore`] for durability.

use super::{
    claims_key, may_claim, AccountUpdate, AppendOutcome, CasOutcome, CommitOutcome, KeyReservation,
    KeyState, LedgerBatch, LedgerStore, ReserveOutcome,
};
use crate::types::{
    Account, AccountId, CustomerId, Transaction, TransactionId, TransactionType, TransferId,
};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Default)]
struct Inner {
    accounts: HashMap<AccountId, Account>,
    customers: HashMap<CustomerId, Vec<AccountId>>,
    transactions: HashMap<TransactionId, Transaction>,
    /// Global append order
    log: Vec<TransactionId>,
    history: HashMap<AccountId, Vec<TransactionId>>,
    transfers: HashMap<TransferId, Vec<TransactionId>>,
    keys: HashMap<(AccountId, String), KeyReservation>,
}

impl Inner {
    fn append(&mut self, record: &Transaction, token: Option<Uuid>) {
        let id = record.transaction_id;

        if let Some(key) = claims_key(record) {
            self.keys.insert(
                (record.account_id.clone(), key.to_string()),
                KeyReservation {
                    account_id: record.account_id.clone(),
                    key: key.to_string(),
                    token: token.unwrap_or_else(Uuid::nil),
                    state: KeyState::Completed(id),
                    reserved_at: record.created_at,
                },
            );
        }

        self.log.push(id);
        self.history
            .entry(record.account_id.clone())
            .or_default()
            .push(id);
        if let Some(transfer_id) = record.transfer_id {
            self.transfers.entry(transfer_id).or_default().push(id);
        }
        self.transactions.insert(id, record.clone());
    }

    fn completed_owner(&self, reservation: Option<&KeyReservation>) -> Option<Transaction> {
        match reservation.map(|r| r.state) {
            Some(KeyState::Completed(id)) => self.transactions.get(&id).cloned(),
            _ => None,
        }
    }

    fn apply_batch(&mut self, batch: &LedgerBatch, multi_account: bool) -> Result<CommitOutcome> {
        if batch.updates.len() > 1 && !multi_account {
            return Err(Error::Storage(
                "multi-account commit not supported by this store".to_string(),
            ));
        }

        // Validate everything before touching anything
        for AccountUpdate {
            expected_version,
            account,
        } in &batch.updates
        {
            let Some(stored) = self.accounts.get(&account.account_id) else {
                return Ok(CommitOutcome::AccountNotFound(account.account_id.clone()));
            };
            if stored.version != *expected_version {
                return Ok(CommitOutcome::VersionConflict {
                    account_id: account.account_id.clone(),
                    expected: *expected_version,
                    actual: stored.version,
                });
            }
        }

        for record in &batch.transactions {
            if self.transactions.contains_key(&record.transaction_id) {
                return Err(Error::Storage(format!(
                    "duplicate transaction id {}",
                    record.transaction_id
                )));
            }
            if let Some(key) = claims_key(record) {
                let held = self.keys.get(&(record.account_id.clone(), key.to_string()));
                if !may_claim(held, batch.reservation) {
                    return Ok(CommitOutcome::DuplicateKey {
                        account_id: record.account_id.clone(),
                        key: key.to_string(),
                        existing: self.completed_owner(held),
                    });
                }
            }
        }

        let mut stored_accounts = Vec::with_capacity(batch.updates.len());
        for update in &batch.updates {
            let mut account = update.account.clone();
            account.version = update.expected_version + 1;
            self.accounts
                .insert(account.account_id.clone(), account.clone());
            stored_accounts.push(account);
        }

        for record in &batch.transactions {
            self.append(record, batch.reservation);
        }

        Ok(CommitOutcome::Committed(stored_accounts))
    }

    fn collect(&self, ids: Option<&Vec<TransactionId>>) -> Vec<Transaction> {
        ids.map(|ids| {
            ids.iter()
                .filter_map(|id| self.transactions.get(id).cloned())
                .collect()
        })
        .unwrap_or_default()
    }
}

/// Volatile store backed by hash maps
#[derive(Debug)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    multi_account: bool,
}

impl MemoryStore {
    /// Store with atomic multi-account commits
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            multi_account: true,
        }
    }

    /// Store that only commits one account per batch
    ///
    /// Transfers against it go through the debit/credit/compensate path.
    pub fn single_account_commits() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            multi_account: false,
        }
    }

    /// Number of stored transactions
    pub fn transaction_count(&self) -> usize {
        self.inner.read().log.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    fn supports_multi_account_commit(&self) -> bool {
        self.multi_account
    }

    async fn create_account(&self, account: &Account, opening: Option<&Transaction>) -> Result<()> {
        let mut inner = self.inner.write();

        if inner.accounts.contains_key(&account.account_id) {
            return Err(Error::AccountExists(account.account_id.clone()));
        }

        inner
            .accounts
            .insert(account.account_id.clone(), account.clone());
        inner
            .customers
            .entry(account.customer_id.clone())
            .or_default()
            .push(account.account_id.clone());
        if let Some(record) = opening {
            inner.append(record, None);
        }

        Ok(())
    }

    async fn get_account(&self, account_id: &AccountId) -> Result<Account> {
        self.inner
            .read()
            .accounts
            .get(account_id)
            .cloned()
            .ok_or_else(|| Error::AccountNotFound(account_id.clone()))
    }

    async fn list_accounts_by_customer(&self, customer_id: &CustomerId) -> Result<Vec<Account>> {
        let inner = self.inner.read();
        Ok(inner
            .customers
            .get(customer_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.accounts.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn compare_and_swap_account(
        &self,
        expected_version: u64,
        account: &Account,
    ) -> Result<CasOutcome> {
        let batch = LedgerBatch {
            updates: vec![AccountUpdate {
                expected_version,
                account: account.clone(),
            }],
            ..Default::default()
        };

        match self.inner.write().apply_batch(&batch, self.multi_account)? {
            CommitOutcome::Committed(mut accounts) => Ok(CasOutcome::Swapped(accounts.remove(0))),
            CommitOutcome::VersionConflict {
                expected, actual, ..
            } => Ok(CasOutcome::VersionConflict { expected, actual }),
            CommitOutcome::AccountNotFound(_) => Ok(CasOutcome::NotFound),
            CommitOutcome::DuplicateKey { .. } => Err(Error::Storage(
                "unexpected idempotency conflict on account swap".to_string(),
            )),
        }
    }

    async fn append_transaction(&self, record: &Transaction) -> Result<AppendOutcome> {
        let batch = LedgerBatch {
            transactions: vec![record.clone()],
            ..Default::default()
        };

        match self.inner.write().apply_batch(&batch, self.multi_account)? {
            CommitOutcome::DuplicateKey { existing, .. } => Ok(AppendOutcome::DuplicateKey(existing)),
            _ => Ok(AppendOutcome::Appended),
        }
    }

    async fn commit(&self, batch: &LedgerBatch) -> Result<CommitOutcome> {
        self.inner.write().apply_batch(batch, self.multi_account)
    }

    async fn get_transaction(&self, transaction_id: &TransactionId) -> Result<Option<Transaction>> {
        Ok(self.inner.read().transactions.get(transaction_id).cloned())
    }

    async fn find_by_idempotency_key(
        &self,
        account_id: &AccountId,
        key: &str,
    ) -> Result<Option<Transaction>> {
        let inner = self.inner.read();
        let held = inner.keys.get(&(account_id.clone(), key.to_string()));
        Ok(inner.completed_owner(held))
    }

    async fn account_history(&self, account_id: &AccountId) -> Result<Vec<Transaction>> {
        let inner = self.inner.read();
        Ok(inner.collect(inner.history.get(account_id)))
    }

    async fn transfer_legs(&self, transfer_id: &TransferId) -> Result<Vec<Transaction>> {
        let inner = self.inner.read();
        Ok(inner.collect(inner.transfers.get(transfer_id)))
    }

    async fn committed_of_type(&self, tx_type: TransactionType) -> Result<Vec<Transaction>> {
        let inner = self.inner.read();
        Ok(inner
            .log
            .iter()
            .filter_map(|id| inner.transactions.get(id))
            .filter(|tx| tx.tx_type == tx_type && tx.is_committed())
            .cloned()
            .collect())
    }

    async fn reserve_idempotency_key(
        &self,
        reservation: &KeyReservation,
        stale_before: DateTime<Utc>,
    ) -> Result<ReserveOutcome> {
        let mut inner = self.inner.write();
        let slot = (reservation.account_id.clone(), reservation.key.clone());

        if let Some(held) = inner.keys.get(&slot) {
            let stale = held.state == KeyState::InFlight && held.reserved_at < stale_before;
            if !stale {
                return Ok(ReserveOutcome::Existing(held.clone()));
            }
            tracing::warn!(
                account_id = %reservation.account_id,
                key = %reservation.key,
                "Taking over stale idempotency reservation"
            );
        }

        inner.keys.insert(slot, reservation.clone());
        Ok(ReserveOutcome::Reserved)
    }

    async fn release_idempotency_key(
        &self,
        account_id: &AccountId,
        key: &str,
        token: Uuid,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let slot = (account_id.clone(), key.to_string());

        let held_by_caller = inner
            .keys
            .get(&slot)
            .map(|held| held.state == KeyState::InFlight && held.token == token)
            .unwrap_or(false);
        if held_by_caller {
            inner.keys.remove(&slot);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccountStatus, AccountType, Currency, Money, GENESIS_HASH};
    use rust_decimal::Decimal;

    fn usd(cents: i64) -> Money {
        Money::new(Decimal::new(cents, 2), Currency::USD).unwrap()
    }

    fn test_account(id: &str, cents: i64) -> Account {
        Account {
            account_id: AccountId::new(id),
            customer_id: CustomerId::new("CUST-1"),
            account_type: AccountType::Checking,
            balance: usd(cents),
            status: AccountStatus::Active,
            version: 0,
            head_hash: GENESIS_HASH,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn deposit(account: &Account, key: Option<&str>) -> Transaction {
        Transaction::pending(
            TransactionId::from_uuid(Uuid::now_v7()),
            TransactionType::Deposit,
            account.account_id.clone(),
            usd(1000),
            Utc::now(),
        )
        .with_idempotency_key(key.map(str::to_string))
        .commit(account, account.head_hash)
    }

    #[tokio::test]
    async fn test_create_and_get_account() {
        let store = MemoryStore::new();
        let account = test_account("ACC-1", 10000);

        store.create_account(&account, None).await.unwrap();
        assert_eq!(store.get_account(&account.account_id).await.unwrap(), account);

        let err = store.create_account(&account, None).await.unwrap_err();
        assert!(matches!(err, Error::AccountExists(_)));

        let err = store.get_account(&AccountId::new("nope")).await.unwrap_err();
        assert!(matches!(err, Error::AccountNotFound(_)));
    }

    #[tokio::test]
    async fn test_compare_and_swap_bumps_version() {
        let store = MemoryStore::new();
        let account = test_account("ACC-1", 10000);
        store.create_account(&account, None).await.unwrap();

        let mut next = account.clone();
        next.balance = usd(15000);

        let stored = match store.compare_and_swap_account(0, &next).await.unwrap() {
            CasOutcome::Swapped(stored) => stored,
            other => panic!("expected swap, got {:?}", other),
        };
        assert_eq!(stored.version, 1);
        assert_eq!(stored.balance, usd(15000));

        // Stale version loses
        let outcome = store.compare_and_swap_account(0, &next).await.unwrap();
        assert_eq!(
            outcome,
            CasOutcome::VersionConflict {
                expected: 0,
                actual: 1
            }
        );

        let ghost = test_account("ACC-GHOST", 0);
        assert_eq!(
            store.compare_and_swap_account(0, &ghost).await.unwrap(),
            CasOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn test_append_rejects_duplicate_key() {
        let store = MemoryStore::new();
        let account = test_account("ACC-1", 0);
        store.create_account(&account, None).await.unwrap();

        let first = deposit(&account, Some("key-1"));
        assert_eq!(
            store.append_transaction(&first).await.unwrap(),
            AppendOutcome::Appended
        );

        let second = deposit(&account, Some("key-1"));
        assert_eq!(
            store.append_transaction(&second).await.unwrap(),
            AppendOutcome::DuplicateKey(Some(first.clone()))
        );

        let found = store
            .find_by_idempotency_key(&account.account_id, "key-1")
            .await
            .unwrap();
        assert_eq!(found, Some(first));
        assert_eq!(store.transaction_count(), 1);
    }

    #[tokio::test]
    async fn test_reservation_lifecycle() {
        let store = MemoryStore::new();
        let account_id = AccountId::new("ACC-1");
        let now = Utc::now();

        let mine = KeyReservation {
            account_id: account_id.clone(),
            key: "key-1".to_string(),
            token: Uuid::new_v4(),
            state: KeyState::InFlight,
            reserved_at: now,
        };
        let theirs = KeyReservation {
            token: Uuid::new_v4(),
            ..mine.clone()
        };
        let long_ago = now - chrono::Duration::seconds(60);

        assert_eq!(
            store.reserve_idempotency_key(&mine, long_ago).await.unwrap(),
            ReserveOutcome::Reserved
        );
        assert_eq!(
            store.reserve_idempotency_key(&theirs, long_ago).await.unwrap(),
            ReserveOutcome::Existing(mine.clone())
        );

        // Stale in-flight reservations can be taken over
        let later = now + chrono::Duration::seconds(1);
        assert_eq!(
            store.reserve_idempotency_key(&theirs, later).await.unwrap(),
            ReserveOutcome::Reserved
        );

        // Releasing with the wrong token is a no-op
        store
            .release_idempotency_key(&account_id, "key-1", mine.token)
            .await
            .unwrap();
        assert!(matches!(
            store.reserve_idempotency_key(&mine, long_ago).await.unwrap(),
            ReserveOutcome::Existing(_)
        ));

        store
            .release_idempotency_key(&account_id, "key-1", theirs.token)
            .await
            .unwrap();
        assert_eq!(
            store.reserve_idempotency_key(&mine, long_ago).await.unwrap(),
            ReserveOutcome::Reserved
        );
    }

    #[tokio::test]
    async fn test_single_account_store_rejects_multi_account_batch() {
        let store = MemoryStore::single_account_commits();
        let a = test_account("ACC-A", 100);
        let b = test_account("ACC-B", 100);
        store.create_account(&a, None).await.unwrap();
        store.create_account(&b, None).await.unwrap();

        let batch = LedgerBatch {
            updates: vec![
                AccountUpdate {
                    expected_version: 0,
                    account: a,
                },
                AccountUpdate {
                    expected_version: 0,
                    account: b,
                },
            ],
            ..Default::default()
        };
        assert!(!store.supports_multi_account_commit());
        assert!(store.commit(&batch).await.is_err());
    }
}
