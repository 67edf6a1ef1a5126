//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `accounts` - Current account state (key: account_id)
//! - `transactions` - Transaction records (key: transaction_id)
//! - `history` - Per-account index (key: account_id || 0x00 || seq)
//! - `transfers` - Transfer legs index (key: transfer_id || seq)
//! - `idempotency` - Key reservations (key: account_id || 0x00 || idempotency_key)
//! - `customers` - Accounts per customer (key: customer_id || 0x00 || seq)
//! - `log` - Global append order (key: seq)
//!
//! Read-check-write cycles run under striped account locks, taken in stripe
//! order; the writes themselves are a single `WriteBatch`.

use super::{
    claims_key, may_claim, AccountUpdate, AppendOutcome, CasOutcome, CommitOutcome, KeyReservation,
    KeyState, LedgerBatch, LedgerStore, ReserveOutcome,
};
use crate::config::Config;
use crate::types::{
    Account, AccountId, CustomerId, Transaction, TransactionId, TransactionType, TransferId,
};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch,
    WriteOptions, DB,
};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Column family names
const CF_ACCOUNTS: &str = "accounts";
const CF_TRANSACTIONS: &str = "transactions";
const CF_HISTORY: &str = "history";
const CF_TRANSFERS: &str = "transfers";
const CF_IDEMPOTENCY: &str = "idempotency";
const CF_CUSTOMERS: &str = "customers";
const CF_LOG: &str = "log";

/// Durable ledger store backed by RocksDB
pub struct RocksStore {
    db: DB,
    locks: Vec<Mutex<()>>,
    next_seq: AtomicU64,
    sync_writes: bool,
}

impl fmt::Debug for RocksStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RocksStore")
            .field("path", &self.db.path())
            .field("lock_stripes", &self.locks.len())
            .field("next_seq", &self.next_seq.load(Ordering::Relaxed))
            .finish()
    }
}

impl RocksStore {
    /// Open or create database under `config.data_dir`
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;
        std::fs::create_dir_all(path)?;

        let tuning = &config.storage.rocksdb;
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(tuning.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(tuning.max_write_buffer_number);
        db_opts.set_max_background_jobs(tuning.max_background_jobs);
        if tuning.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_ACCOUNTS, Self::cf_options_point_lookup()),
            ColumnFamilyDescriptor::new(CF_TRANSACTIONS, Self::cf_options_records()),
            ColumnFamilyDescriptor::new(CF_HISTORY, Self::cf_options_index()),
            ColumnFamilyDescriptor::new(CF_TRANSFERS, Self::cf_options_index()),
            ColumnFamilyDescriptor::new(CF_IDEMPOTENCY, Self::cf_options_point_lookup()),
            ColumnFamilyDescriptor::new(CF_CUSTOMERS, Self::cf_options_index()),
            ColumnFamilyDescriptor::new(CF_LOG, Self::cf_options_index()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;
        let next_seq = Self::recover_sequence(&db)?;

        tracing::info!(
            path = ?path,
            next_seq,
            lock_stripes = config.storage.lock_stripes,
            "Opened RocksDB ledger store"
        );

        Ok(Self {
            db,
            locks: (0..config.storage.lock_stripes.max(1))
                .map(|_| Mutex::new(()))
                .collect(),
            next_seq: AtomicU64::new(next_seq),
            sync_writes: config.storage.sync_writes,
        })
    }

    /// Database path
    pub fn path(&self) -> &Path {
        self.db.path()
    }

    // Column family options

    fn cf_options_point_lookup() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_options_records() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_index() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    /// Next free sequence number; the log and the customer index share it
    fn recover_sequence(db: &DB) -> Result<u64> {
        let handle = |name: &str| {
            db.cf_handle(name)
                .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
        };

        let mut next = 0;
        if let Some(item) = db.iterator_cf(handle(CF_LOG)?, IteratorMode::End).next() {
            let (key, _) = item?;
            next = decode_seq(&key)? + 1;
        }

        // Customer keys are scoped, so the last key is not the highest sequence
        for item in db.iterator_cf(handle(CF_CUSTOMERS)?, IteratorMode::Start) {
            let (key, _) = item?;
            let suffix = key.len().checked_sub(8).map(|start| &key[start..]);
            let seq = decode_seq(suffix.unwrap_or(&key[..]))?;
            next = next.max(seq + 1);
        }

        Ok(next)
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        self.db.write_opt(batch, &opts)?;
        Ok(())
    }

    // Locking

    fn stripe_of(&self, account_id: &AccountId) -> usize {
        let mut hasher = DefaultHasher::new();
        account_id.hash(&mut hasher);
        (hasher.finish() % self.locks.len() as u64) as usize
    }

    /// Lock the stripes of all accounts, in stripe order
    fn lock_accounts<'a>(
        &self,
        accounts: impl IntoIterator<Item = &'a AccountId>,
    ) -> Vec<MutexGuard<'_, ()>> {
        let mut stripes: Vec<usize> = accounts.into_iter().map(|id| self.stripe_of(id)).collect();
        stripes.sort_unstable();
        stripes.dedup();
        stripes.into_iter().map(|i| self.locks[i].lock()).collect()
    }

    // Reads

    fn load<T: serde::de::DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf_handle(cf_name)?;
        match self.db.get_cf(cf, key)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    fn load_account(&self, account_id: &AccountId) -> Result<Option<Account>> {
        self.load(CF_ACCOUNTS, account_id.as_str().as_bytes())
    }

    fn load_transaction(&self, transaction_id: &TransactionId) -> Result<Option<Transaction>> {
        self.load(CF_TRANSACTIONS, transaction_id.as_uuid().as_bytes())
    }

    fn load_reservation(&self, account_id: &AccountId, key: &str) -> Result<Option<KeyReservation>> {
        self.load(CF_IDEMPOTENCY, &scoped_key(account_id.as_str(), key.as_bytes()))
    }

    fn completed_owner(&self, reservation: Option<&KeyReservation>) -> Result<Option<Transaction>> {
        match reservation.map(|r| r.state) {
            Some(KeyState::Completed(id)) => self.load_transaction(&id),
            _ => Ok(None),
        }
    }

    /// Values of an index whose keys start with `prefix`, in key order
    fn scan_prefix(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<Box<[u8]>>> {
        let cf = self.cf_handle(cf_name)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        let mut values = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            values.push(value);
        }
        Ok(values)
    }

    fn transactions_in_index(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<Transaction>> {
        let mut records = Vec::new();
        for value in self.scan_prefix(cf_name, prefix)? {
            let id = decode_transaction_id(&value)?;
            let record = self.load_transaction(&id)?.ok_or_else(|| {
                Error::Storage(format!("index points at missing transaction {}", id))
            })?;
            records.push(record);
        }
        Ok(records)
    }

    // Writes

    /// Stage a record with its indices and key claim
    fn stage_record(
        &self,
        batch: &mut WriteBatch,
        record: &Transaction,
        token: Option<Uuid>,
    ) -> Result<()> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst).to_be_bytes();
        let id = record.transaction_id.as_uuid().as_bytes();

        batch.put_cf(
            self.cf_handle(CF_TRANSACTIONS)?,
            id,
            bincode::serialize(record)?,
        );
        batch.put_cf(self.cf_handle(CF_LOG)?, seq, id);
        batch.put_cf(
            self.cf_handle(CF_HISTORY)?,
            scoped_key(record.account_id.as_str(), &seq),
            id,
        );

        if let Some(transfer_id) = &record.transfer_id {
            let mut key = transfer_id.as_uuid().as_bytes().to_vec();
            key.extend_from_slice(&seq);
            batch.put_cf(self.cf_handle(CF_TRANSFERS)?, key, id);
        }

        if let Some(key) = claims_key(record) {
            let reservation = KeyReservation {
                account_id: record.account_id.clone(),
                key: key.to_string(),
                token: token.unwrap_or_else(Uuid::nil),
                state: KeyState::Completed(record.transaction_id),
                reserved_at: record.created_at,
            };
            batch.put_cf(
                self.cf_handle(CF_IDEMPOTENCY)?,
                scoped_key(record.account_id.as_str(), key.as_bytes()),
                bincode::serialize(&reservation)?,
            );
        }

        Ok(())
    }

    fn commit_locked(&self, ledger_batch: &LedgerBatch) -> Result<CommitOutcome> {
        let scopes = ledger_batch
            .updates
            .iter()
            .map(|u| &u.account.account_id)
            .chain(ledger_batch.transactions.iter().map(|t| &t.account_id));
        let _guards = self.lock_accounts(scopes);

        for AccountUpdate {
            expected_version,
            account,
        } in &ledger_batch.updates
        {
            let Some(stored) = self.load_account(&account.account_id)? else {
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

        for record in &ledger_batch.transactions {
            if self.load_transaction(&record.transaction_id)?.is_some() {
                return Err(Error::Storage(format!(
                    "duplicate transaction id {}",
                    record.transaction_id
                )));
            }
            if let Some(key) = claims_key(record) {
                let held = self.load_reservation(&record.account_id, key)?;
                if !may_claim(held.as_ref(), ledger_batch.reservation) {
                    return Ok(CommitOutcome::DuplicateKey {
                        account_id: record.account_id.clone(),
                        key: key.to_string(),
                        existing: self.completed_owner(held.as_ref())?,
                    });
                }
            }
        }

        let mut batch = WriteBatch::default();
        let cf_accounts = self.cf_handle(CF_ACCOUNTS)?;
        let mut stored_accounts = Vec::with_capacity(ledger_batch.updates.len());
        for update in &ledger_batch.updates {
            let mut account = update.account.clone();
            account.version = update.expected_version + 1;
            batch.put_cf(
                cf_accounts,
                account.account_id.as_str().as_bytes(),
                bincode::serialize(&account)?,
            );
            stored_accounts.push(account);
        }
        for record in &ledger_batch.transactions {
            self.stage_record(&mut batch, record, ledger_batch.reservation)?;
        }

        self.write(batch)?;

        tracing::debug!(
            accounts = stored_accounts.len(),
            transactions = ledger_batch.transactions.len(),
            "Ledger batch committed"
        );

        Ok(CommitOutcome::Committed(stored_accounts))
    }
}

#[async_trait]
impl LedgerStore for RocksStore {
    fn supports_multi_account_commit(&self) -> bool {
        true
    }

    async fn create_account(&self, account: &Account, opening: Option<&Transaction>) -> Result<()> {
        let _guards = self.lock_accounts([&account.account_id]);

        if self.load_account(&account.account_id)?.is_some() {
            return Err(Error::AccountExists(account.account_id.clone()));
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf_handle(CF_ACCOUNTS)?,
            account.account_id.as_str().as_bytes(),
            bincode::serialize(account)?,
        );

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst).to_be_bytes();
        batch.put_cf(
            self.cf_handle(CF_CUSTOMERS)?,
            scoped_key(account.customer_id.as_str(), &seq),
            account.account_id.as_str().as_bytes(),
        );

        if let Some(record) = opening {
            self.stage_record(&mut batch, record, None)?;
        }

        self.write(batch)?;

        tracing::debug!(account_id = %account.account_id, "Account stored");
        Ok(())
    }

    async fn get_account(&self, account_id: &AccountId) -> Result<Account> {
        self.load_account(account_id)?
            .ok_or_else(|| Error::AccountNotFound(account_id.clone()))
    }

    async fn list_accounts_by_customer(&self, customer_id: &CustomerId) -> Result<Vec<Account>> {
        let prefix = scoped_key(customer_id.as_str(), &[]);

        let mut accounts = Vec::new();
        for value in self.scan_prefix(CF_CUSTOMERS, &prefix)? {
            let account_id = AccountId::new(String::from_utf8_lossy(&value).into_owned());
            if let Some(account) = self.load_account(&account_id)? {
                accounts.push(account);
            }
        }
        Ok(accounts)
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

        match self.commit_locked(&batch)? {
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

        match self.commit_locked(&batch)? {
            CommitOutcome::DuplicateKey { existing, .. } => Ok(AppendOutcome::DuplicateKey(existing)),
            _ => Ok(AppendOutcome::Appended),
        }
    }

    async fn commit(&self, batch: &LedgerBatch) -> Result<CommitOutcome> {
        self.commit_locked(batch)
    }

    async fn get_transaction(&self, transaction_id: &TransactionId) -> Result<Option<Transaction>> {
        self.load_transaction(transaction_id)
    }

    async fn find_by_idempotency_key(
        &self,
        account_id: &AccountId,
        key: &str,
    ) -> Result<Option<Transaction>> {
        let held = self.load_reservation(account_id, key)?;
        self.completed_owner(held.as_ref())
    }

    async fn account_history(&self, account_id: &AccountId) -> Result<Vec<Transaction>> {
        self.transactions_in_index(CF_HISTORY, &scoped_key(account_id.as_str(), &[]))
    }

    async fn transfer_legs(&self, transfer_id: &TransferId) -> Result<Vec<Transaction>> {
        self.transactions_in_index(CF_TRANSFERS, transfer_id.as_uuid().as_bytes())
    }

    async fn committed_of_type(&self, tx_type: TransactionType) -> Result<Vec<Transaction>> {
        let cf = self.cf_handle(CF_LOG)?;

        let mut records = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let id = decode_transaction_id(&value)?;
            if let Some(record) = self.load_transaction(&id)? {
                if record.tx_type == tx_type && record.is_committed() {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    async fn reserve_idempotency_key(
        &self,
        reservation: &KeyReservation,
        stale_before: DateTime<Utc>,
    ) -> Result<ReserveOutcome> {
        let _guards = self.lock_accounts([&reservation.account_id]);

        if let Some(held) = self.load_reservation(&reservation.account_id, &reservation.key)? {
            let stale = held.state == KeyState::InFlight && held.reserved_at < stale_before;
            if !stale {
                return Ok(ReserveOutcome::Existing(held));
            }
            tracing::warn!(
                account_id = %reservation.account_id,
                key = %reservation.key,
                "Taking over stale idempotency reservation"
            );
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf_handle(CF_IDEMPOTENCY)?,
            scoped_key(reservation.account_id.as_str(), reservation.key.as_bytes()),
            bincode::serialize(reservation)?,
        );
        self.write(batch)?;

        Ok(ReserveOutcome::Reserved)
    }

    async fn release_idempotency_key(
        &self,
        account_id: &AccountId,
        key: &str,
        token: Uuid,
    ) -> Result<()> {
        let _guards = self.lock_accounts([account_id]);

        let held_by_caller = self
            .load_reservation(account_id, key)?
            .map(|held| held.state == KeyState::InFlight && held.token == token)
            .unwrap_or(false);

        if held_by_caller {
            let mut batch = WriteBatch::default();
            batch.delete_cf(
                self.cf_handle(CF_IDEMPOTENCY)?,
                scoped_key(account_id.as_str(), key.as_bytes()),
            );
            self.write(batch)?;
        }

        Ok(())
    }
}

// Key helpers

fn scoped_key(scope: &str, suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(scope.len() + 1 + suffix.len());
    key.extend_from_slice(scope.as_bytes());
    key.push(0x00); // Separator
    key.extend_from_slice(suffix);
    key
}

fn decode_seq(key: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| Error::Storage(format!("malformed log key of {} bytes", key.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

fn decode_transaction_id(value: &[u8]) -> Result<TransactionId> {
    let bytes: [u8; 16] = value
        .try_into()
        .map_err(|_| Error::Storage(format!("malformed transaction id of {} bytes", value.len())))?;
    Ok(TransactionId::from_uuid(Uuid::from_bytes(bytes)))
}
