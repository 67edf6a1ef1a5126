//! Idempotency guard
//!
//! Keys are scoped per account. A request first reserves `(account_id, key)`
//! in the store; the commit that applies its mutation verifies the
//! reservation token and marks the key completed in the same atomic write.
//! Exactly one request per key can commit; a concurrent duplicate waits for
//! the holder and observes its transaction.

use crate::ids::{Clock, IdGenerator};
use crate::retry::RetryPolicy;
use crate::storage::{KeyReservation, KeyState, LedgerStore, ReserveOutcome};
use crate::types::{AccountId, Transaction};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Result of a reservation attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// Key is new; the token must accompany the commit
    FirstSeen(Uuid),
    /// Key belongs to a committed transaction
    AlreadyProcessed(Transaction),
}

/// Reserves and releases idempotency keys
#[derive(Debug, Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn LedgerStore>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    wait: RetryPolicy,
}

impl IdempotencyGuard {
    /// Create guard over a store
    pub fn new(
        store: Arc<dyn LedgerStore>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
        wait: RetryPolicy,
    ) -> Self {
        Self {
            store,
            ids,
            clock,
            ttl,
            wait,
        }
    }

    /// Reserve `(account_id, key)` or return the transaction that owns it
    ///
    /// While another request holds the key, polls until it completes
    /// (`AlreadyProcessed`), is released (`FirstSeen`) or goes stale
    /// (taken over, `FirstSeen`). Fails with `DuplicateRequest` when the
    /// holder is still in flight after the wait schedule runs out.
    pub async fn check_and_reserve(&self, account_id: &AccountId, key: &str) -> Result<Reservation> {
        let token = self.ids.reservation_token();
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| Error::Config(format!("reservation ttl out of range: {}", e)))?;

        let mut attempt = 0;
        loop {
            let now = self.clock.now();
            let reservation = KeyReservation {
                account_id: account_id.clone(),
                key: key.to_string(),
                token,
                state: KeyState::InFlight,
                reserved_at: now,
            };

            match self.store.reserve_idempotency_key(&reservation, now - ttl).await? {
                ReserveOutcome::Reserved => return Ok(Reservation::FirstSeen(token)),
                ReserveOutcome::Existing(KeyReservation {
                    state: KeyState::Completed(transaction_id),
                    ..
                }) => {
                    let prior = self
                        .store
                        .get_transaction(&transaction_id)
                        .await?
                        .ok_or(Error::TransactionNotFound(transaction_id))?;
                    return Ok(Reservation::AlreadyProcessed(prior));
                }
                ReserveOutcome::Existing(_) => {
                    if !self.wait.should_retry(attempt) {
                        return Err(Error::DuplicateRequest {
                            account_id: account_id.clone(),
                            key: key.to_string(),
                        });
                    }
                    tracing::debug!(
                        account_id = %account_id,
                        key = %key,
                        attempt,
                        "Idempotency key in flight, waiting for holder"
                    );
                    self.wait.backoff(attempt).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Give up a reservation after a terminal failure so the key can be reused
    pub async fn release(&self, account_id: &AccountId, key: &str, token: Uuid) {
        if let Err(e) = self
            .store
            .release_idempotency_key(account_id, key, token)
            .await
        {
            // The reservation expires after the ttl anyway
            tracing::warn!(
                account_id = %account_id,
                key = %key,
                error = %e,
                "Failed to release idempotency reservation"
            );
        }
    }
}
