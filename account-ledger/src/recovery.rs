//! Orphaned transfer recovery
//!
//! On stores without multi-account commits a transfer is a debit followed by
//! a credit. A crash in between leaves a committed TransferOut with neither a
//! TransferIn nor a Reversal. Recovery finishes such transfers: it books the
//! credit when the destination still accepts it, and reverses the debit
//! otherwise. Both legs carry keys derived from the transfer id, so a
//! transfer is never credited or reversed twice.

use crate::engine::{transfer_of, Applied, Leg, TransactionEngine};
use crate::types::{Transaction, TransactionType, TransferId};
use crate::Result;
use std::slice;
use std::time::Duration;

/// Outcome of a recovery pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Orphaned transfers found
    pub scanned: usize,
    /// Completed with a TransferIn
    pub completed: usize,
    /// Reversed on the source account
    pub compensated: usize,
    /// Left for a later pass (contention or storage errors)
    pub unresolved: Vec<TransferId>,
}

enum Resolution {
    Completed,
    Compensated,
    Unresolved,
}

impl TransactionEngine {
    /// Resolve TransferOut records older than `grace` that were never credited or reversed
    ///
    /// Stores with multi-account commits write both legs in one batch and
    /// never hold orphans; the ledger scan is skipped for them.
    pub async fn recover_orphaned_transfers(&self, grace: Duration) -> Result<RecoveryReport> {
        if self.store().supports_multi_account_commit() {
            tracing::debug!("Store commits transfers atomically, skipping orphan scan");
            return Ok(RecoveryReport::default());
        }

        let grace = chrono::Duration::from_std(grace)
            .map_err(|e| crate::Error::Config(format!("orphan grace out of range: {}", e)))?;
        let cutoff = self.clock().now() - grace;

        let mut report = RecoveryReport::default();
        for debit in self
            .store()
            .committed_of_type(TransactionType::TransferOut)
            .await?
        {
            if debit.created_at > cutoff || !self.is_orphan(&debit).await? {
                continue;
            }
            report.scanned += 1;

            let (transfer_id, _) = transfer_of(&debit)?;
            match self.resolve(&debit).await {
                Resolution::Completed => report.completed += 1,
                Resolution::Compensated => report.compensated += 1,
                Resolution::Unresolved => report.unresolved.push(transfer_id),
            }
        }

        if report.scanned > 0 {
            tracing::info!(
                scanned = report.scanned,
                completed = report.completed,
                compensated = report.compensated,
                unresolved = report.unresolved.len(),
                "Recovered orphaned transfers"
            );
        }

        Ok(report)
    }

    async fn is_orphan(&self, debit: &Transaction) -> Result<bool> {
        let (transfer_id, _) = transfer_of(debit)?;
        let legs = self.store().transfer_legs(&transfer_id).await?;

        Ok(!legs.iter().any(|leg| {
            leg.is_committed()
                && matches!(
                    leg.tx_type,
                    TransactionType::TransferIn | TransactionType::Reversal
                )
        }))
    }

    async fn resolve(&self, debit: &Transaction) -> Resolution {
        let credit = match Leg::credit_for(debit) {
            Ok(credit) => credit,
            Err(e) => {
                tracing::error!(
                    transaction_id = %debit.transaction_id,
                    error = %e,
                    "Malformed transfer leg"
                );
                return Resolution::Unresolved;
            }
        };

        match self
            .commit_legs("recovery", slice::from_ref(&credit), None)
            .await
        {
            Ok(Applied::Committed(_)) | Ok(Applied::Superseded(Some(_))) => {
                self.metrics().record_orphan("completed");
                tracing::info!(
                    transaction_id = %debit.transaction_id,
                    to = %credit.account_id,
                    "Orphaned transfer completed"
                );
                Resolution::Completed
            }
            Ok(Applied::Superseded(None)) => Resolution::Unresolved,
            Err(e) if e.is_retryable() => {
                tracing::warn!(
                    transaction_id = %debit.transaction_id,
                    error = %e,
                    "Orphaned transfer left for a later pass"
                );
                Resolution::Unresolved
            }
            Err(e) => match self.compensate(debit, &e.to_string()).await {
                Ok(_) => {
                    self.metrics().record_orphan("compensated");
                    Resolution::Compensated
                }
                Err(comp) => {
                    tracing::error!(
                        transaction_id = %debit.transaction_id,
                        error = %comp,
                        "Failed to compensate orphaned transfer"
                    );
                    Resolution::Unresolved
                }
            },
        }
    }
}
