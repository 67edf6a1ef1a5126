//! Identifier generation and time source consumed by the engine

use crate::types::{AccountId, TransactionId, TransferId};
use chrono::{DateTime, Utc};
use std::fmt::Debug;
use uuid::Uuid;

/// Produces globally unique identifiers
pub trait IdGenerator: Send + Sync + Debug {
    /// New account ID
    fn account_id(&self) -> AccountId;

    /// New transaction ID
    fn transaction_id(&self) -> TransactionId;

    /// New transfer ID
    fn transfer_id(&self) -> TransferId;

    /// New idempotency reservation token
    fn reservation_token(&self) -> Uuid;
}

/// Time source for `created_at` stamps and reservation expiry
pub trait Clock: Send + Sync + Debug {
    /// Current time
    fn now(&self) -> DateTime<Utc>;
}

/// UUIDv7 identifiers (time-ordered)
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidV7Generator;

impl IdGenerator for UuidV7Generator {
    fn account_id(&self) -> AccountId {
        AccountId::new(format!("ACC-{}", Uuid::now_v7().simple()))
    }

    fn transaction_id(&self) -> TransactionId {
        TransactionId::from_uuid(Uuid::now_v7())
    }

    fn transfer_id(&self) -> TransferId {
        TransferId::from_uuid(Uuid::now_v7())
    }

    fn reservation_token(&self) -> Uuid {
        Uuid::new_v4()
    }
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
