//! Account audit by history replay
//!
//! Replaying an account's committed records in append order must reproduce
//! its stored balance, and the records must form an unbroken SHA-256 chain
//! ending at the account's head hash.

use crate::engine::TransactionEngine;
use crate::types::{AccountId, Money, TransactionId, GENESIS_HASH};
use crate::Result;

/// Inconsistency found by an audit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditIssue {
    /// Replayed balance differs from the stored one
    BalanceMismatch {
        /// Stored balance
        stored: Money,
        /// Balance from replay
        replayed: Money,
    },
    /// A record's resulting balance differs from the running total
    ResultingBalanceMismatch {
        /// Record
        transaction_id: TransactionId,
        /// Running total
        expected: Money,
        /// What the record says
        recorded: Money,
    },
    /// A record's amount is in a foreign currency
    CurrencyMismatch {
        /// Record
        transaction_id: TransactionId,
    },
    /// Record versions do not strictly increase
    VersionNotIncreasing {
        /// Record
        transaction_id: TransactionId,
        /// Version of the previous record
        previous: u64,
        /// Version of this record
        current: u64,
    },
    /// Last record claims a version newer than the account
    VersionAhead {
        /// Version of the last record
        record_version: u64,
        /// Stored account version
        stored_version: u64,
    },
    /// `previous_hash` does not point at the prior record
    BrokenChain {
        /// Record
        transaction_id: TransactionId,
    },
    /// Stored entry hash does not match the record contents
    TamperedEntry {
        /// Record
        transaction_id: TransactionId,
    },
    /// Last entry hash differs from the account head hash
    HeadMismatch,
}

/// Result of auditing one account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountAudit {
    /// Audited account
    pub account_id: AccountId,
    /// Stored balance
    pub stored_balance: Money,
    /// Balance from replaying committed records
    pub replayed_balance: Money,
    /// Stored account version
    pub stored_version: u64,
    /// Committed records replayed
    pub committed_records: usize,
    /// Failed records skipped
    pub failed_records: usize,
    /// Inconsistencies, empty when the account is sound
    pub issues: Vec<AuditIssue>,
}

impl AccountAudit {
    /// Whether no issue was found
    pub fn is_consistent(&self) -> bool {
        self.issues.is_empty()
    }
}

impl TransactionEngine {
    /// Replay an account's history and check it against the stored state
    pub async fn audit_account(&self, account_id: &AccountId) -> Result<AccountAudit> {
        let account = self.store().get_account(account_id).await?;
        let history = self.store().account_history(account_id).await?;

        let mut issues = Vec::new();
        let mut running = Money::zero(account.currency());
        let mut head = GENESIS_HASH;
        let mut last_version = 0u64;
        let mut committed_records = 0;
        let mut failed_records = 0;

        for record in history.iter() {
            if !record.is_committed() {
                failed_records += 1;
                continue;
            }
            committed_records += 1;
            let transaction_id = record.transaction_id;

            if record.amount.currency() != account.currency() {
                issues.push(AuditIssue::CurrencyMismatch { transaction_id });
                continue;
            }

            let next = if record.tx_type.is_credit() {
                running.checked_add(&record.amount)
            } else {
                running.checked_sub(&record.amount)
            };
            if let Some(next) = next {
                running = next;
            }
            if running != record.resulting_balance {
                issues.push(AuditIssue::ResultingBalanceMismatch {
                    transaction_id,
                    expected: running,
                    recorded: record.resulting_balance,
                });
            }

            if record.account_version <= last_version {
                issues.push(AuditIssue::VersionNotIncreasing {
                    transaction_id,
                    previous: last_version,
                    current: record.account_version,
                });
            }
            last_version = record.account_version;

            if record.previous_hash != head {
                issues.push(AuditIssue::BrokenChain { transaction_id });
            }
            if record.compute_hash() != record.entry_hash {
                issues.push(AuditIssue::TamperedEntry { transaction_id });
            }
            head = record.entry_hash;
        }

        if running != account.balance {
            issues.push(AuditIssue::BalanceMismatch {
                stored: account.balance,
                replayed: running,
            });
        }
        // Status changes bump the version without a record
        if last_version > account.version {
            issues.push(AuditIssue::VersionAhead {
                record_version: last_version,
                stored_version: account.version,
            });
        }
        if head != account.head_hash {
            issues.push(AuditIssue::HeadMismatch);
        }

        if !issues.is_empty() {
            tracing::error!(
                account_id = %account_id,
                issues = issues.len(),
                "Account audit found inconsistencies"
            );
        }

        Ok(AccountAudit {
            account_id: account_id.clone(),
            stored_balance: account.balance,
            replayed_balance: running,
            stored_version: account.version,
            committed_records,
            failed_records,
            issues,
        })
    }
}
