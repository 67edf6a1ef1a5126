//! End-to-end scenarios for the transaction engine
//!
//! Covers the reference scenarios, contention on hot accounts, transfer
//! compensation on stores without multi-account commits, and recovery of
//! transfers interrupted between debit and credit.

use account_ledger::config::Config;
use account_ledger::storage::{
    AppendOutcome, CasOutcome, CommitOutcome, KeyReservation, LedgerBatch, ReserveOutcome,
};
use account_ledger::{
    Account, AccountId, AccountType, Currency, CustomerId, Error, LedgerStore, MemoryStore,
    Metrics, Money, Result, RocksStore, Transaction, TransactionId, TransactionStatus,
    TransactionEngine, TransactionType, TransferId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

fn usd(units: i64) -> Money {
    Money::new(Decimal::from(units), Currency::USD).unwrap()
}

fn engine_over(store: Arc<dyn LedgerStore>, config: &Config) -> Arc<TransactionEngine> {
    Arc::new(TransactionEngine::new(store, config, Metrics::new().unwrap()))
}

fn memory_engine() -> Arc<TransactionEngine> {
    engine_over(Arc::new(MemoryStore::new()), &Config::in_memory())
}

/// Config that lets every contender through eventually
fn patient_config() -> Config {
    let mut config = Config::in_memory();
    config.retry.max_retries = 200;
    config.retry.initial_delay_ms = 0;
    config.retry.max_delay_ms = 2;
    config
}

async fn open(engine: &TransactionEngine, customer: &str, balance: i64) -> AccountId {
    engine
        .create_account(CustomerId::new(customer), AccountType::Checking, usd(balance))
        .await
        .unwrap()
        .account_id
}

#[tokio::test]
async fn test_deposit_scenario() {
    let engine = memory_engine();
    let a = open(&engine, "CUST-1", 100).await;

    let tx = engine.deposit(&a, usd(50), None, None).await.unwrap();

    assert_eq!(tx.amount, usd(50));
    assert_eq!(tx.resulting_balance, usd(150));
    assert_eq!(tx.status, TransactionStatus::Committed);
    assert_eq!(engine.get_balance(&a).await.unwrap(), usd(150));
}

#[tokio::test]
async fn test_insufficient_funds_scenario() {
    let engine = memory_engine();
    let a = open(&engine, "CUST-1", 30).await;

    let err = engine.withdraw(&a, usd(50), None, None).await.unwrap_err();

    assert!(matches!(err, Error::InsufficientFunds { .. }));
    assert!(!err.is_retryable());
    assert_eq!(engine.get_balance(&a).await.unwrap(), usd(30));
}

async fn check_transfer_scenario(engine: &TransactionEngine) {
    let a = open(engine, "CUST-1", 100).await;
    let b = open(engine, "CUST-2", 10).await;

    let (out, inn) = engine.transfer(&a, &b, usd(40), None, None).await.unwrap();

    assert_eq!(engine.get_balance(&a).await.unwrap(), usd(60));
    assert_eq!(engine.get_balance(&b).await.unwrap(), usd(50));
    assert_eq!(out.tx_type, TransactionType::TransferOut);
    assert_eq!(inn.tx_type, TransactionType::TransferIn);
    assert!(out.transfer_id.is_some());
    assert_eq!(out.transfer_id, inn.transfer_id);
    assert_eq!(out.resulting_balance, usd(60));
    assert_eq!(inn.resulting_balance, usd(50));
    assert_eq!(out.counterparty_account_id.as_ref(), Some(&b));
    assert_eq!(inn.counterparty_account_id.as_ref(), Some(&a));
}

#[tokio::test]
async fn test_transfer_scenario_on_every_store() {
    check_transfer_scenario(&memory_engine()).await;

    let single = engine_over(
        Arc::new(MemoryStore::single_account_commits()),
        &Config::in_memory(),
    );
    check_transfer_scenario(&single).await;

    let temp_dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.data_dir = temp_dir.path().to_path_buf();
    config.storage.sync_writes = false;
    let rocks = engine_over(Arc::new(RocksStore::open(&config).unwrap()), &config);
    check_transfer_scenario(&rocks).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_withdrawals_scenario() {
    let engine = memory_engine();
    let a = open(&engine, "CUST-1", 100).await;

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let engine = engine.clone();
            let a = a.clone();
            tokio::spawn(async move { engine.withdraw(&a, usd(60), None, None).await })
        })
        .collect();

    let mut committed = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => committed += 1,
            Err(Error::InsufficientFunds { .. }) => rejected += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!((committed, rejected), (1, 1));
    assert_eq!(engine.get_balance(&a).await.unwrap(), usd(40));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hot_account_deposits_all_land() {
    let engine = engine_over(Arc::new(MemoryStore::new()), &patient_config());
    let a = open(&engine, "CUST-1", 0).await;

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let engine = engine.clone();
            let a = a.clone();
            tokio::spawn(async move { engine.deposit(&a, usd(1), None, None).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let account = engine.get_account(&a).await.unwrap();
    assert_eq!(account.balance, usd(50));
    assert_eq!(account.version, 50);

    let audit = engine.audit_account(&a).await.unwrap();
    assert!(audit.is_consistent(), "{:?}", audit.issues);
    assert_eq!(audit.committed_records, 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_opposing_transfers_conserve_money() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = patient_config();
    config.data_dir = temp_dir.path().to_path_buf();
    config.storage.sync_writes = false;
    let engine = engine_over(Arc::new(RocksStore::open(&config).unwrap()), &config);

    let a = open(&engine, "CUST-1", 100).await;
    let b = open(&engine, "CUST-2", 100).await;

    let handles: Vec<_> = (0..40)
        .map(|i| {
            let engine = engine.clone();
            let (from, to) = if i % 2 == 0 {
                (a.clone(), b.clone())
            } else {
                (b.clone(), a.clone())
            };
            tokio::spawn(async move { engine.transfer(&from, &to, usd(3), None, None).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let total = engine.get_balance(&a).await.unwrap().amount()
        + engine.get_balance(&b).await.unwrap().amount();
    assert_eq!(total, Decimal::from(200));
    assert_eq!(engine.get_balance(&a).await.unwrap(), usd(100));

    for account_id in [&a, &b] {
        let audit = engine.audit_account(account_id).await.unwrap();
        assert!(audit.is_consistent(), "{:?}", audit.issues);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicates_apply_once() {
    let engine = memory_engine();
    let a = open(&engine, "CUST-1", 0).await;

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let engine = engine.clone();
            let a = a.clone();
            tokio::spawn(async move {
                engine
                    .deposit(&a, usd(25), Some("pay-42".to_string()), None)
                    .await
            })
        })
        .collect();

    // Losers wait for the winner and return its transaction
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().unwrap().transaction_id);
    }

    assert_eq!(ids.len(), 10);
    assert!(ids.iter().all(|id| *id == ids[0]));
    assert_eq!(engine.get_balance(&a).await.unwrap(), usd(25));

    // Late retry with the same key replays
    let replay = engine
        .deposit(&a, usd(25), Some("pay-42".to_string()), None)
        .await
        .unwrap();
    assert_eq!(replay.transaction_id, ids[0]);
}

#[tokio::test]
async fn test_accounts_by_customer() {
    let engine = memory_engine();
    let first = open(&engine, "CUST-1", 10).await;
    let second = open(&engine, "CUST-1", 20).await;
    open(&engine, "CUST-2", 30).await;

    let accounts = engine
        .list_accounts_by_customer(&CustomerId::new("CUST-1"))
        .await
        .unwrap();
    let ids: Vec<&AccountId> = accounts.iter().map(|a| &a.account_id).collect();
    assert_eq!(ids, vec![&first, &second]);

    assert!(engine
        .list_accounts_by_customer(&CustomerId::new("CUST-404"))
        .await
        .unwrap()
        .is_empty());
    assert!(matches!(
        engine.get_history(&AccountId::new("ACC-404")).await,
        Err(Error::AccountNotFound(_))
    ));
}

/// Single-account store that can be told to fail credit or reversal commits,
/// or to report every account write as a version conflict
#[derive(Debug)]
struct FlakyStore {
    inner: MemoryStore,
    fail_credits: AtomicBool,
    fail_reversals: AtomicBool,
    always_conflict: AtomicBool,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::single_account_commits(),
            fail_credits: AtomicBool::new(false),
            fail_reversals: AtomicBool::new(false),
            always_conflict: AtomicBool::new(false),
        }
    }

    fn conflicting(&self) -> bool {
        self.always_conflict.load(Ordering::SeqCst)
    }

    fn injected(&self, batch: &LedgerBatch) -> bool {
        batch.transactions.iter().any(|tx| match tx.tx_type {
            TransactionType::TransferIn => self.fail_credits.load(Ordering::SeqCst),
            TransactionType::Reversal => self.fail_reversals.load(Ordering::SeqCst),
            _ => false,
        })
    }
}

#[async_trait]
impl LedgerStore for FlakyStore {
    fn supports_multi_account_commit(&self) -> bool {
        false
    }

    async fn create_account(&self, account: &Account, opening: Option<&Transaction>) -> Result<()> {
        self.inner.create_account(account, opening).await
    }

    async fn get_account(&self, account_id: &AccountId) -> Result<Account> {
        self.inner.get_account(account_id).await
    }

    async fn list_accounts_by_customer(&self, customer_id: &CustomerId) -> Result<Vec<Account>> {
        self.inner.list_accounts_by_customer(customer_id).await
    }

    async fn compare_and_swap_account(
        &self,
        expected_version: u64,
        account: &Account,
    ) -> Result<CasOutcome> {
        if self.conflicting() {
            return Ok(CasOutcome::VersionConflict {
                expected: expected_version,
                actual: expected_version + 1,
            });
        }
        self.inner
            .compare_and_swap_account(expected_version, account)
            .await
    }

    async fn append_transaction(&self, record: &Transaction) -> Result<AppendOutcome> {
        self.inner.append_transaction(record).await
    }

    async fn commit(&self, batch: &LedgerBatch) -> Result<CommitOutcome> {
        if self.injected(batch) {
            return Err(Error::Storage("injected write failure".to_string()));
        }
        if let (true, Some(update)) = (self.conflicting(), batch.updates.first()) {
            return Ok(CommitOutcome::VersionConflict {
                account_id: update.account.account_id.clone(),
                expected: update.expected_version,
                actual: update.expected_version + 1,
            });
        }
        self.inner.commit(batch).await
    }

    async fn get_transaction(&self, transaction_id: &TransactionId) -> Result<Option<Transaction>> {
        self.inner.get_transaction(transaction_id).await
    }

    async fn find_by_idempotency_key(
        &self,
        account_id: &AccountId,
        key: &str,
    ) -> Result<Option<Transaction>> {
        self.inner.find_by_idempotency_key(account_id, key).await
    }

    async fn account_history(&self, account_id: &AccountId) -> Result<Vec<Transaction>> {
        self.inner.account_history(account_id).await
    }

    async fn transfer_legs(&self, transfer_id: &TransferId) -> Result<Vec<Transaction>> {
        self.inner.transfer_legs(transfer_id).await
    }

    async fn committed_of_type(&self, tx_type: TransactionType) -> Result<Vec<Transaction>> {
        self.inner.committed_of_type(tx_type).await
    }

    async fn reserve_idempotency_key(
        &self,
        reservation: &KeyReservation,
        stale_before: DateTime<Utc>,
    ) -> Result<ReserveOutcome> {
        self.inner
            .reserve_idempotency_key(reservation, stale_before)
            .await
    }

    async fn release_idempotency_key(
        &self,
        account_id: &AccountId,
        key: &str,
        token: Uuid,
    ) -> Result<()> {
        self.inner
            .release_idempotency_key(account_id, key, token)
            .await
    }
}

#[tokio::test]
async fn test_failed_credit_is_compensated() {
    let store = Arc::new(FlakyStore::new());
    let metrics = Metrics::new().unwrap();
    let engine = TransactionEngine::new(store.clone(), &Config::in_memory(), metrics.clone());
    let a = open(&engine, "CUST-1", 100).await;
    let b = open(&engine, "CUST-2", 10).await;

    store.fail_credits.store(true, Ordering::SeqCst);
    let err = engine
        .transfer(&a, &b, usd(40), Some("t-1".to_string()), None)
        .await
        .unwrap_err();

    let transfer_id = match err {
        Error::TransferFailed { transfer_id, .. } => transfer_id,
        other => panic!("expected TransferFailed, got {}", other),
    };
    assert_eq!(engine.get_balance(&a).await.unwrap(), usd(100));
    assert_eq!(engine.get_balance(&b).await.unwrap(), usd(10));
    assert_eq!(metrics.compensations_total.get(), 1);

    let legs = store.transfer_legs(&transfer_id).await.unwrap();
    let types: Vec<TransactionType> = legs
        .iter()
        .filter(|leg| leg.is_committed())
        .map(|leg| leg.tx_type)
        .collect();
    assert_eq!(
        types,
        vec![TransactionType::TransferOut, TransactionType::Reversal]
    );

    // Replaying the key reports the same outcome without moving money
    store.fail_credits.store(false, Ordering::SeqCst);
    let again = engine
        .transfer(&a, &b, usd(40), Some("t-1".to_string()), None)
        .await
        .unwrap_err();
    assert!(matches!(again, Error::TransferFailed { .. }));
    assert_eq!(engine.get_balance(&a).await.unwrap(), usd(100));

    assert!(engine.audit_account(&a).await.unwrap().is_consistent());
}

#[tokio::test]
async fn test_interrupted_transfer_is_recovered() {
    let store = Arc::new(FlakyStore::new());
    let engine = engine_over(store.clone(), &Config::in_memory());
    let a = open(&engine, "CUST-1", 100).await;
    let b = open(&engine, "CUST-2", 10).await;

    // Credit and compensation both fail: only the debit is durable
    store.fail_credits.store(true, Ordering::SeqCst);
    store.fail_reversals.store(true, Ordering::SeqCst);
    let err = engine
        .transfer(&a, &b, usd(40), Some("t-2".to_string()), None)
        .await
        .unwrap_err();
    assert!(err.is_retryable(), "{}", err);
    assert_eq!(engine.get_balance(&a).await.unwrap(), usd(60));

    // The transfer is neither done nor undone yet
    let pending = engine
        .transfer(&a, &b, usd(40), Some("t-2".to_string()), None)
        .await
        .unwrap_err();
    assert!(matches!(pending, Error::DuplicateRequest { .. }));

    store.fail_credits.store(false, Ordering::SeqCst);
    store.fail_reversals.store(false, Ordering::SeqCst);
    let report = engine
        .recover_orphaned_transfers(Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(report.completed, 1);
    assert!(report.unresolved.is_empty());

    assert_eq!(engine.get_balance(&a).await.unwrap(), usd(60));
    assert_eq!(engine.get_balance(&b).await.unwrap(), usd(50));

    let (out, inn) = engine
        .transfer(&a, &b, usd(40), Some("t-2".to_string()), None)
        .await
        .unwrap();
    assert_eq!(out.transfer_id, inn.transfer_id);
    assert_eq!(engine.get_balance(&a).await.unwrap(), usd(60));
}

#[tokio::test]
async fn test_retries_exhausted_reports_concurrent_modification() {
    let store = Arc::new(FlakyStore::new());
    let mut config = Config::in_memory();
    config.retry.max_retries = 0;
    let engine = engine_over(store.clone(), &config);
    let a = open(&engine, "CUST-1", 100).await;
    let before = engine.get_account(&a).await.unwrap();

    store.always_conflict.store(true, Ordering::SeqCst);
    let err = engine
        .deposit(&a, usd(25), Some("dep-1".to_string()), None)
        .await
        .unwrap_err();
    match err {
        Error::ConcurrentModification {
            ref account_id,
            attempts,
        } => {
            assert_eq!(account_id, &a);
            assert_eq!(attempts, 1);
        }
        ref other => panic!("expected ConcurrentModification, got {}", other),
    }
    assert!(err.is_retryable());

    let err = engine.freeze_account(&a).await.unwrap_err();
    assert!(matches!(err, Error::ConcurrentModification { attempts: 1, .. }));

    store.always_conflict.store(false, Ordering::SeqCst);
    let after = engine.get_account(&a).await.unwrap();
    assert_eq!(after.balance, usd(100));
    assert_eq!(after.version, before.version);
    assert_eq!(after.status, before.status);

    // The rejection is on record and did not burn the key
    let history = engine.get_history(&a).await.unwrap();
    let failed = history.last().unwrap();
    assert_eq!(failed.status, TransactionStatus::Failed);
    assert_eq!(failed.tx_type, TransactionType::Deposit);
    assert_eq!(failed.amount, usd(25));

    let tx = engine
        .deposit(&a, usd(25), Some("dep-1".to_string()), None)
        .await
        .unwrap();
    assert_eq!(tx.resulting_balance, usd(125));
}
