//! Contracts the monitors require from the persistence layer.
//!
//! The monitors own no storage: payments are created by the platform's
//! payment service, events are delivered by the webhook service, and the
//! monitors only read and advance state through these traits. All writes are
//! guarded on the current status so repeating a call (after a crash, a
//! duplicate notification, or a concurrent sweep) is a no-op rather than a
//! double transition.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use time::OffsetDateTime;

use crate::model::{Chain, ChainTransaction, EventType, NewTransaction, Payment, ViewingKey};

/// Failure surfaced by a store operation.
#[derive(Debug)]
pub(crate) enum StoreError {
    /// A transaction record already exists for the same
    /// `(chain, txid, address)`.
    AlreadyExists,
    /// Any other backend failure.
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    pub(crate) fn backend(e: impl std::error::Error + Send + Sync + 'static) -> Self {
        StoreError::Backend(Box::new(e))
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::AlreadyExists => write!(f, "record already exists"),
            StoreError::Backend(e) => write!(f, "store backend error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::AlreadyExists => None,
            StoreError::Backend(e) => Some(e.as_ref()),
        }
    }
}

pub(crate) type StoreResult<T> = Result<T, StoreError>;

/// Read and advance payment state.
#[async_trait]
pub(crate) trait PaymentStore: Send + Sync {
    async fn find_by_id(&self, id: &str) -> StoreResult<Option<Payment>>;

    async fn find_by_address(&self, chain: Chain, address: &str) -> StoreResult<Option<Payment>>;

    /// Every payment on `chain` the monitor should be watching.
    async fn non_terminal_by_chain(&self, chain: Chain) -> StoreResult<Vec<Payment>>;

    /// Pending payments whose expiry has passed as of `now`.
    async fn find_expired(&self, chain: Chain, now: OffsetDateTime) -> StoreResult<Vec<Payment>>;

    /// `pending → detected`, linking `txid`. Returns `false` if the payment
    /// was no longer pending (the transition already happened).
    async fn mark_detected(&self, id: &str, txid: &str, at: OffsetDateTime) -> StoreResult<bool>;

    /// `detected → confirmed`. Returns `false` if the payment was not
    /// detected.
    async fn mark_confirmed(&self, id: &str, at: OffsetDateTime) -> StoreResult<bool>;

    /// `pending → expired`. Returns `false` if the payment was not pending.
    async fn mark_expired(&self, id: &str) -> StoreResult<bool>;

    /// `detected → pending`, clearing the transaction link. Only the reorg
    /// path calls this. Returns `false` if the payment was not detected.
    async fn reset_to_pending(&self, id: &str) -> StoreResult<bool>;

    async fn set_confirmations(&self, id: &str, confirmations: u32) -> StoreResult<()>;
}

/// Record and update observed chain transactions.
#[async_trait]
pub(crate) trait TransactionStore: Send + Sync {
    /// Inserts a new record. Fails with [`StoreError::AlreadyExists`] when a
    /// record for the same `(chain, txid, address)` exists; concurrent
    /// detections of one deposit rely on this to collapse into one record.
    async fn create(&self, tx: NewTransaction) -> StoreResult<ChainTransaction>;

    async fn find_by_outpoint(
        &self,
        chain: Chain,
        txid: &str,
        address: &str,
    ) -> StoreResult<Option<ChainTransaction>>;

    async fn find_by_txid(&self, chain: Chain, txid: &str) -> StoreResult<Vec<ChainTransaction>>;

    /// Records on `chain` still being tracked toward `threshold`: below it,
    /// or at it but not yet retired by the confirmation sweep. A deposit
    /// first observed deep in the chain enters at or past the threshold and
    /// must still be swept once.
    async fn find_unconfirmed(
        &self,
        chain: Chain,
        threshold: u32,
    ) -> StoreResult<Vec<ChainTransaction>>;

    /// Updates the observed confirmation count, and the block fields once
    /// the transaction is mined. Block fields are only rewritten by the
    /// reorg path.
    async fn update_confirmations(
        &self,
        id: &str,
        confirmations: i64,
        block_hash: Option<&str>,
        block_height: Option<u64>,
    ) -> StoreResult<()>;

    async fn mark_confirmed(&self, id: &str, at: OffsetDateTime) -> StoreResult<()>;

    /// Removes a record whose transaction vanished from the chain, so a
    /// later re-detection can insert it fresh. Only the reorg path calls
    /// this.
    async fn remove(&self, id: &str) -> StoreResult<()>;
}

/// Record outbound notification events. Delivery is not the monitor's
/// concern; rows are created `pending` and never touched again by this
/// process.
#[async_trait]
pub(crate) trait EventStore: Send + Sync {
    async fn create(
        &self,
        merchant_id: &str,
        payment_id: &str,
        event_type: EventType,
        payload: Value,
    ) -> StoreResult<()>;
}

/// Per-chain persistent scan cursor.
#[async_trait]
pub(crate) trait CursorStore: Send + Sync {
    async fn get(&self, chain: Chain) -> StoreResult<Option<u64>>;

    /// Never moves the cursor backwards.
    async fn advance(&self, chain: Chain, height: u64) -> StoreResult<()>;
}

/// Viewing keys issued by the wallet service for shielded addresses.
#[async_trait]
pub(crate) trait ViewingKeyStore: Send + Sync {
    async fn viewing_key_for_address(&self, address: &str) -> StoreResult<Option<ViewingKey>>;
}

/// The bundle of store handles a monitor runs against.
#[derive(Clone)]
pub(crate) struct Stores {
    pub(crate) payments: Arc<dyn PaymentStore>,
    pub(crate) transactions: Arc<dyn TransactionStore>,
    pub(crate) events: Arc<dyn EventStore>,
    pub(crate) cursors: Arc<dyn CursorStore>,
    pub(crate) viewing_keys: Arc<dyn ViewingKeyStore>,
}
