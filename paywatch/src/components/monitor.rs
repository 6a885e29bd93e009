//! The chain monitors.
//!
//! # Design
//!
//! Each configured chain gets a monitor built from the same three routines:
//!
//! - **match-and-detect** ([`record_deposit`]): an observed output paying a
//!   watched address becomes a transaction record and, on first observation,
//!   a `pending → detected` transition with a `payment.detected` event.
//! - **block scanning** ([`scan_new_blocks`]): every block between the
//!   persistent cursor and the chain tip is checked against the address
//!   book, then the cursor advances. Restart resumes from the cursor, so a
//!   block is never silently skipped.
//! - **confirmation sweep** ([`update_confirmations`]): every recorded
//!   transaction below the confirmation threshold is re-checked against the
//!   node, payments cross `detected → confirmed` at the threshold, and
//!   transactions that vanish from the node's view feed the reorg heuristic.
//!
//! How the routines are driven differs per chain: [`bitcoin`] consumes push
//! notifications with a reconciliation sweep as backstop, [`zcash`] polls.
//! Both also run the expiry sweep ([`expire_overdue`]) and refresh the
//! address book from the database on a timer.
//!
//! Every write is status-guarded in the store layer, so the routines are
//! idempotent: replaying a notification, overlapping a sweep with the intake
//! path, or restarting mid-scan converges to the same state.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};

use secrecy::SecretString;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{Error, ErrorKind};
use crate::model::{
    Chain, ChainTransaction, Deposit, EventType, NewTransaction, PaymentStatus, event_payload,
};
use crate::store::{
    CursorStore as _, EventStore as _, PaymentStore, StoreError, Stores, TransactionStore as _,
    ViewingKeyStore,
};

use super::rpc::{Block, ChainRpc, RpcError};

pub(crate) mod bitcoin;
pub(crate) mod zcash;

#[cfg(test)]
pub(crate) mod testing;

#[cfg(test)]
mod tests;

/// Consecutive sweeps a transaction must be missing from the node before the
/// reorg handling kicks in.
const REORG_MISS_SWEEPS: u32 = 3;

#[derive(Debug)]
pub(crate) enum MonitorError {
    Rpc(RpcError),
    Store(StoreError),
}

impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorError::Rpc(e) => write!(f, "{e}"),
            MonitorError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for MonitorError {}

impl From<RpcError> for MonitorError {
    fn from(e: RpcError) -> Self {
        Self::Rpc(e)
    }
}

impl From<StoreError> for MonitorError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<MonitorError> for Error {
    fn from(e: MonitorError) -> Self {
        ErrorKind::Monitor.context(e).into()
    }
}

/// A shielded address the monitor watches, with the payment it belongs to
/// and the capability to see into it.
pub(crate) struct ShieldedEntry {
    pub(crate) payment_id: String,
    pub(crate) key: SecretString,
    pub(crate) birthday: Option<u64>,
}

/// The set of addresses belonging to payments worth watching.
///
/// Rebuilt wholesale from the database on every refresh; between refreshes
/// it is an immutable snapshot, so the intake path reads it without locks
/// beyond one pointer clone.
#[derive(Default)]
pub(crate) struct Snapshot {
    transparent: HashSet<String>,
    shielded: HashMap<String, ShieldedEntry>,
}

impl Snapshot {
    pub(crate) fn contains_transparent(&self, address: &str) -> bool {
        self.transparent.contains(address)
    }

    pub(crate) fn transparent(&self) -> impl Iterator<Item = &str> {
        self.transparent.iter().map(String::as_str)
    }

    pub(crate) fn shielded(&self) -> impl Iterator<Item = (&str, &ShieldedEntry)> {
        self.shielded.iter().map(|(addr, entry)| (addr.as_str(), entry))
    }

    pub(crate) fn watched(&self) -> usize {
        self.transparent.len() + self.shielded.len()
    }
}

/// Atomically swappable [`Snapshot`] holder.
pub(crate) struct AddressBook {
    snapshot: RwLock<Arc<Snapshot>>,
}

impl AddressBook {
    pub(crate) fn new(snapshot: Snapshot) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub(crate) fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.read().unwrap().clone()
    }

    /// Replaces the snapshot. Readers holding the previous snapshot finish
    /// against it; there is never a partially-updated view.
    pub(crate) fn replace(&self, snapshot: Snapshot) {
        *self.snapshot.write().unwrap() = Arc::new(snapshot);
    }
}

/// Whether a Zcash address is shielded (Sapling, Sprout, or unified) rather
/// than transparent.
pub(crate) fn is_shielded_address(address: &str) -> bool {
    address.starts_with('z') || address.starts_with('u')
}

/// Builds a fresh snapshot from the payments worth watching on `chain`.
///
/// Shielded addresses without a viewing key cannot be scanned; they are
/// logged and left out rather than failing the refresh.
pub(crate) async fn load_snapshot(
    chain: Chain,
    payments: &dyn PaymentStore,
    viewing_keys: &dyn ViewingKeyStore,
) -> Result<Snapshot, StoreError> {
    let mut snapshot = Snapshot::default();

    for payment in payments.non_terminal_by_chain(chain).await? {
        if chain == Chain::Zcash && is_shielded_address(&payment.address) {
            match viewing_keys.viewing_key_for_address(&payment.address).await? {
                Some(viewing_key) => {
                    snapshot.shielded.insert(
                        payment.address.clone(),
                        ShieldedEntry {
                            payment_id: payment.id.clone(),
                            key: viewing_key.key,
                            birthday: viewing_key.birthday,
                        },
                    );
                }
                None => {
                    warn!(
                        payment = %payment.id,
                        address = %payment.address,
                        "no viewing key for shielded address, cannot monitor it",
                    );
                }
            }
        } else {
            snapshot.transparent.insert(payment.address.clone());
        }
    }

    Ok(snapshot)
}

/// The match-and-detect routine. Idempotent: running it twice for the same
/// `(payment, txid, address)` leaves the same state as running it once.
///
/// Matching is by exact address string equality, re-validated against the
/// repository since the snapshot can be stale. The observed amount is
/// recorded as-is; under- and overpayment policy belongs to the payment
/// service, not the monitor.
pub(crate) async fn record_deposit(
    stores: &Stores,
    chain: Chain,
    deposit: Deposit,
) -> Result<(), StoreError> {
    let Some(payment) = stores.payments.find_by_address(chain, &deposit.address).await? else {
        return Ok(());
    };
    if !payment.status.is_monitorable() {
        return Ok(());
    }

    let existing = stores
        .transactions
        .find_by_outpoint(chain, &deposit.txid, &deposit.address)
        .await?;

    let record = match existing {
        // Normally a done deal, but if an earlier run stopped between the
        // insert and the transition, finish the transition now.
        Some(record) => {
            if payment.status != PaymentStatus::Pending {
                return Ok(());
            }
            record
        }
        None => {
            let new = NewTransaction {
                payment_id: payment.id.clone(),
                chain,
                txid: deposit.txid.clone(),
                address: deposit.address.clone(),
                amount: deposit.amount,
                confirmations: deposit.confirmations.max(0),
                block_height: deposit.block_height,
                block_hash: deposit.block_hash.clone(),
                shielded: deposit.shielded,
                memo: deposit.memo.clone(),
            };
            match stores.transactions.create(new).await {
                Ok(record) => record,
                // A concurrent detection of the same output won the race.
                Err(StoreError::AlreadyExists) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    };

    let now = OffsetDateTime::now_utc();
    if stores
        .payments
        .mark_detected(&payment.id, &record.txid, now)
        .await?
    {
        let payload = event_payload(&payment, Some(&record), now);
        stores
            .events
            .create(
                &payment.merchant_id,
                &payment.id,
                EventType::PaymentDetected,
                payload,
            )
            .await?;
        info!(
            payment = %payment.id,
            txid = %record.txid,
            amount = %record.amount,
            shielded = record.shielded,
            "payment detected",
        );
    }

    Ok(())
}

/// Tracks transactions that have gone missing from the node's view across
/// consecutive sweeps.
#[derive(Debug, Default)]
pub(crate) struct ReorgTracker {
    misses: HashMap<String, u32>,
}

impl ReorgTracker {
    fn record_miss(&mut self, txid: &str) -> u32 {
        let count = self.misses.entry(txid.into()).or_insert(0);
        *count += 1;
        *count
    }

    fn clear(&mut self, txid: &str) {
        self.misses.remove(txid);
    }
}

/// The confirmation sweep.
///
/// Re-checks every recorded transaction below `threshold`, fills in block
/// metadata once mined, keeps the payment's confirmation counter current,
/// and fires `detected → confirmed` at the threshold. A transaction the
/// node no longer knows feeds [`ReorgTracker`]; see [`suspected_reorg`].
pub(crate) async fn update_confirmations<C>(
    rpc: &C,
    stores: &Stores,
    chain: Chain,
    threshold: u32,
    reorg: &mut ReorgTracker,
) -> Result<(), MonitorError>
where
    C: ChainRpc + ?Sized,
{
    let watched = stores.transactions.find_unconfirmed(chain, threshold).await?;

    for record in watched {
        let confirmations = match rpc.confirmations(&record.txid).await {
            Ok(confirmations) => confirmations,
            Err(e) => {
                warn!(
                    txid = %record.txid,
                    error = %e,
                    "confirmation lookup failed, retrying next sweep",
                );
                continue;
            }
        };

        if confirmations < 0 {
            suspected_reorg(stores, &record, reorg).await?;
            continue;
        }
        reorg.clear(&record.txid);

        // Fill in block metadata once the transaction is mined.
        let (block_hash, block_height) = if record.block_hash.is_some() || confirmations == 0 {
            (record.block_hash.clone(), record.block_height)
        } else {
            match block_location(rpc, &record.txid).await {
                Ok(location) => location,
                Err(e) => {
                    warn!(txid = %record.txid, error = %e, "block lookup failed");
                    (None, None)
                }
            }
        };

        if confirmations != record.confirmations
            || block_hash != record.block_hash
            || block_height != record.block_height
        {
            stores
                .transactions
                .update_confirmations(&record.id, confirmations, block_hash.as_deref(), block_height)
                .await?;
        }

        // Retire the record once it reaches the threshold, whatever the
        // payment's state; this is what bounds the watched set.
        if confirmations >= i64::from(threshold) && record.confirmed_at.is_none() {
            stores
                .transactions
                .mark_confirmed(&record.id, OffsetDateTime::now_utc())
                .await?;
        }

        let Some(mut payment) = stores.payments.find_by_id(&record.payment_id).await? else {
            warn!(
                payment = %record.payment_id,
                txid = %record.txid,
                "transaction record references an unknown payment",
            );
            continue;
        };
        if !payment.status.is_monitorable() {
            continue;
        }

        // A pending payment with a transaction record means an earlier run
        // stopped between the insert and the transition; finish it now.
        if payment.status == PaymentStatus::Pending {
            let now = OffsetDateTime::now_utc();
            if stores
                .payments
                .mark_detected(&payment.id, &record.txid, now)
                .await?
            {
                let payload = event_payload(&payment, Some(&record), now);
                stores
                    .events
                    .create(
                        &payment.merchant_id,
                        &payment.id,
                        EventType::PaymentDetected,
                        payload,
                    )
                    .await?;
                info!(payment = %payment.id, txid = %record.txid, "payment detected");
                payment.status = PaymentStatus::Detected;
                payment.txid = Some(record.txid.clone());
            }
        }

        let observed = u32::try_from(confirmations).unwrap_or(u32::MAX);
        if observed != payment.confirmations {
            stores.payments.set_confirmations(&payment.id, observed).await?;
        }

        if confirmations >= i64::from(threshold) && payment.status == PaymentStatus::Detected {
            let now = OffsetDateTime::now_utc();
            if stores.payments.mark_confirmed(&payment.id, now).await? {
                let mut confirmed = record.clone();
                confirmed.confirmations = confirmations;
                confirmed.block_hash = block_hash;
                confirmed.block_height = block_height;
                let payload = event_payload(&payment, Some(&confirmed), now);
                stores
                    .events
                    .create(
                        &payment.merchant_id,
                        &payment.id,
                        EventType::PaymentConfirmed,
                        payload,
                    )
                    .await?;
                info!(
                    payment = %payment.id,
                    txid = %record.txid,
                    confirmations,
                    "payment confirmed",
                );
            }
        }
    }

    Ok(())
}

async fn block_location<C>(
    rpc: &C,
    txid: &str,
) -> Result<(Option<String>, Option<u64>), MonitorError>
where
    C: ChainRpc + ?Sized,
{
    let tx = rpc.raw_transaction(txid).await?;
    let Some(block_hash) = tx.blockhash else {
        return Ok((None, None));
    };
    let info = rpc.block_info(&block_hash).await?;
    Ok((Some(info.hash), Some(info.height)))
}

/// Handles a transaction the node has stopped reporting.
///
/// After [`REORG_MISS_SWEEPS`] consecutive misses, a `detected` payment is
/// returned to `pending` and its transaction record removed so the deposit
/// can be re-detected wherever it lands. A `confirmed` payment is never
/// rolled back (downstream owns it once `payment.confirmed` has fired), but
/// a `payment.failed` event is recorded so the platform can adjudicate.
async fn suspected_reorg(
    stores: &Stores,
    record: &ChainTransaction,
    reorg: &mut ReorgTracker,
) -> Result<(), StoreError> {
    let misses = reorg.record_miss(&record.txid);
    warn!(
        txid = %record.txid,
        misses,
        "transaction missing from the node, suspected reorg",
    );
    if misses < REORG_MISS_SWEEPS {
        return Ok(());
    }
    reorg.clear(&record.txid);

    let Some(payment) = stores.payments.find_by_id(&record.payment_id).await? else {
        return Ok(());
    };

    match payment.status {
        PaymentStatus::Detected => {
            stores.transactions.remove(&record.id).await?;
            if stores.payments.reset_to_pending(&payment.id).await? {
                warn!(
                    payment = %payment.id,
                    txid = %record.txid,
                    "linked transaction vanished, payment returned to pending",
                );
            }
        }
        // An interrupted detection left the payment pending; just drop the
        // orphaned record.
        PaymentStatus::Pending => {
            stores.transactions.remove(&record.id).await?;
        }
        PaymentStatus::Confirmed => {
            stores.transactions.remove(&record.id).await?;
            let now = OffsetDateTime::now_utc();
            let mut payload = event_payload(&payment, Some(record), now);
            payload
                .as_object_mut()
                .expect("payload is an object")
                .insert(
                    "reason".into(),
                    "linked transaction missing after reorg".into(),
                );
            stores
                .events
                .create(
                    &payment.merchant_id,
                    &payment.id,
                    EventType::PaymentFailed,
                    payload,
                )
                .await?;
            warn!(
                payment = %payment.id,
                txid = %record.txid,
                "confirmed payment's transaction vanished, flagged for review",
            );
        }
        _ => {}
    }

    Ok(())
}

/// Result of one [`scan_new_blocks`] call.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ScanOutcome {
    pub(crate) cursor: u64,
    pub(crate) tip: u64,
}

impl ScanOutcome {
    pub(crate) fn caught_up(&self) -> bool {
        self.cursor >= self.tip
    }
}

/// Scans blocks `cursor + 1 ..= tip` (bounded by `max_blocks`) against the
/// address book and advances the cursor.
///
/// The cursor advances after each block so an interrupted scan resumes at
/// the first unscanned block. On the very first run there is no cursor and
/// nothing before now can pay a watched payment, so the cursor initializes
/// to the tip without scanning.
pub(crate) async fn scan_new_blocks<C>(
    rpc: &C,
    stores: &Stores,
    book: &AddressBook,
    chain: Chain,
    max_blocks: u32,
    shutdown: &watch::Receiver<bool>,
) -> Result<ScanOutcome, MonitorError>
where
    C: ChainRpc + ?Sized,
{
    let tip = rpc.block_count().await?;
    let cursor = match stores.cursors.get(chain).await? {
        Some(cursor) => cursor,
        None => {
            info!(chain = %chain, tip, "no stored cursor, starting at the chain tip");
            stores.cursors.advance(chain, tip).await?;
            return Ok(ScanOutcome { cursor: tip, tip });
        }
    };
    if tip <= cursor {
        return Ok(ScanOutcome { cursor, tip });
    }

    let end = tip.min(cursor + u64::from(max_blocks));
    for height in (cursor + 1)..=end {
        if *shutdown.borrow() {
            return Ok(ScanOutcome {
                cursor: height - 1,
                tip,
            });
        }
        let hash = rpc.block_hash(height).await?;
        let block = rpc.block(&hash).await?;
        scan_block(stores, book, chain, &block).await?;
        stores.cursors.advance(chain, height).await?;
    }

    debug!(chain = %chain, from = cursor + 1, to = end, tip, "scanned blocks");
    Ok(ScanOutcome { cursor: end, tip })
}

async fn scan_block(
    stores: &Stores,
    book: &AddressBook,
    chain: Chain,
    block: &Block,
) -> Result<(), StoreError> {
    let snapshot = book.snapshot();
    if snapshot.transparent.is_empty() {
        return Ok(());
    }

    for tx in &block.tx {
        for output in &tx.vout {
            for address in output.script_pub_key.destinations() {
                if snapshot.contains_transparent(address) {
                    record_deposit(
                        stores,
                        chain,
                        Deposit {
                            txid: tx.txid.clone(),
                            address: address.to_owned(),
                            amount: output.value,
                            confirmations: block.confirmations.max(0),
                            block_hash: Some(block.hash.clone()),
                            block_height: Some(block.height),
                            shielded: false,
                            memo: None,
                        },
                    )
                    .await?;
                }
            }
        }
    }

    Ok(())
}

/// The expiry sweep: `pending → expired` for payments past their expiry.
///
/// A payment that has reached `detected` is never expired, even if it
/// confirms after the deadline.
pub(crate) async fn expire_overdue(stores: &Stores, chain: Chain) -> Result<(), StoreError> {
    let now = OffsetDateTime::now_utc();
    for payment in stores.payments.find_expired(chain, now).await? {
        if stores.payments.mark_expired(&payment.id).await? {
            let payload = event_payload(&payment, None, now);
            stores
                .events
                .create(
                    &payment.merchant_id,
                    &payment.id,
                    EventType::PaymentExpired,
                    payload,
                )
                .await?;
            info!(payment = %payment.id, "payment expired without a deposit");
        }
    }
    Ok(())
}
