//! Core types shared by the monitors and the persistence layer.
//!
//! Monetary amounts are [`Decimal`] end to end; they enter the process as
//! arbitrary-precision JSON numbers at the RPC boundary and are persisted as
//! exact decimal text. Nothing here touches `f64`.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use secrecy::SecretString;
use serde_json::{Value, json};
use time::OffsetDateTime;

/// The chain a payment or transaction belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Chain {
    /// Bitcoin-family chain, monitored via push notifications.
    Bitcoin,
    /// Zcash-family chain, monitored by polling; supports shielded addresses.
    Zcash,
}

impl Chain {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Chain::Bitcoin => "btc",
            Chain::Zcash => "zec",
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Chain {
    type Err = UnknownChain;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "btc" => Ok(Chain::Bitcoin),
            "zec" => Ok(Chain::Zcash),
            other => Err(UnknownChain(other.into())),
        }
    }
}

/// A chain tag that is not one of the chains this monitor knows.
#[derive(Debug)]
pub(crate) struct UnknownChain(pub(crate) String);

impl fmt::Display for UnknownChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown chain tag '{}'", self.0)
    }
}

impl std::error::Error for UnknownChain {}

/// Payment lifecycle state.
///
/// The monitor drives `pending → detected → confirmed` and `pending →
/// expired`. Every other state belongs to the upstream platform (refunds,
/// settlement, manual intervention) and is carried opaquely so the monitor
/// can recognize it as out of scope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum PaymentStatus {
    Pending,
    Detected,
    Confirmed,
    Expired,
    Failed,
    /// A state owned by a collaborator; the monitor never touches these
    /// payments.
    Other(String),
}

impl PaymentStatus {
    pub(crate) fn as_str(&self) -> &str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Detected => "detected",
            PaymentStatus::Confirmed => "confirmed",
            PaymentStatus::Expired => "expired",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Other(s) => s,
        }
    }

    pub(crate) fn parse(s: &str) -> Self {
        match s {
            "pending" => PaymentStatus::Pending,
            "detected" => PaymentStatus::Detected,
            "confirmed" => PaymentStatus::Confirmed,
            "expired" => PaymentStatus::Expired,
            "failed" => PaymentStatus::Failed,
            other => PaymentStatus::Other(other.into()),
        }
    }

    /// Whether the monitor may act on a payment in this state.
    pub(crate) fn is_monitorable(&self) -> bool {
        matches!(self, PaymentStatus::Pending | PaymentStatus::Detected)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A merchant-originated request to receive a fixed amount at one address.
#[derive(Clone, Debug)]
pub(crate) struct Payment {
    pub(crate) id: String,
    pub(crate) merchant_id: String,
    pub(crate) order_id: String,
    pub(crate) chain: Chain,
    pub(crate) address: String,
    pub(crate) amount: Decimal,
    pub(crate) status: PaymentStatus,
    pub(crate) confirmations: u32,
    /// Set on detection and stable from then on.
    pub(crate) txid: Option<String>,
    pub(crate) detected_at: Option<OffsetDateTime>,
    pub(crate) confirmed_at: Option<OffsetDateTime>,
    pub(crate) expires_at: OffsetDateTime,
}

/// An on-chain transaction observed paying a specific payment.
#[derive(Clone, Debug)]
pub(crate) struct ChainTransaction {
    pub(crate) id: String,
    pub(crate) payment_id: String,
    pub(crate) chain: Chain,
    pub(crate) txid: String,
    pub(crate) address: String,
    pub(crate) amount: Decimal,
    /// Last observed confirmation count. Zero while in the mempool.
    pub(crate) confirmations: i64,
    /// Unset while the transaction is in the mempool.
    pub(crate) block_height: Option<u64>,
    pub(crate) block_hash: Option<String>,
    pub(crate) shielded: bool,
    pub(crate) memo: Option<String>,
    pub(crate) detected_at: OffsetDateTime,
    pub(crate) confirmed_at: Option<OffsetDateTime>,
}

/// Fields for a new [`ChainTransaction`] record.
///
/// The record id and `detected_at` are assigned by the store.
#[derive(Clone, Debug)]
pub(crate) struct NewTransaction {
    pub(crate) payment_id: String,
    pub(crate) chain: Chain,
    pub(crate) txid: String,
    pub(crate) address: String,
    pub(crate) amount: Decimal,
    pub(crate) confirmations: i64,
    pub(crate) block_height: Option<u64>,
    pub(crate) block_hash: Option<String>,
    pub(crate) shielded: bool,
    pub(crate) memo: Option<String>,
}

/// An output observed paying a watched address, normalized by a monitor
/// from whichever source surfaced it (block scan, mempool, notification,
/// UTXO listing, shielded receipt).
#[derive(Clone, Debug)]
pub(crate) struct Deposit {
    pub(crate) txid: String,
    pub(crate) address: String,
    pub(crate) amount: Decimal,
    /// Zero for mempool observations.
    pub(crate) confirmations: i64,
    pub(crate) block_hash: Option<String>,
    pub(crate) block_height: Option<u64>,
    pub(crate) shielded: bool,
    pub(crate) memo: Option<String>,
}

/// Outbound notification types recorded for the delivery service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EventType {
    PaymentDetected,
    PaymentConfirmed,
    PaymentExpired,
    PaymentFailed,
}

impl EventType {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            EventType::PaymentDetected => "payment.detected",
            EventType::PaymentConfirmed => "payment.confirmed",
            EventType::PaymentExpired => "payment.expired",
            EventType::PaymentFailed => "payment.failed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A viewing capability for a shielded address, held by the wallet service.
///
/// The monitor only forwards the key to the node; it never derives anything
/// from it.
#[derive(Clone)]
pub(crate) struct ViewingKey {
    pub(crate) key: SecretString,
    /// Height at which the address was issued. A rescan starting here is
    /// guaranteed to see every payment the address ever received.
    pub(crate) birthday: Option<u64>,
}

impl fmt::Debug for ViewingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewingKey")
            .field("birthday", &self.birthday)
            .finish_non_exhaustive()
    }
}

/// Builds the JSON payload recorded with every outbound event.
///
/// Shape: `{payment_id, order_id, txid, amount, confirmations, is_shielded?,
/// memo?, timestamp}`. The amount is the observed deposit amount when a
/// transaction is attached, otherwise the requested payment amount.
pub(crate) fn event_payload(
    payment: &Payment,
    tx: Option<&ChainTransaction>,
    at: OffsetDateTime,
) -> Value {
    let mut payload = json!({
        "payment_id": payment.id,
        "order_id": payment.order_id,
        "txid": tx.map(|tx| tx.txid.clone()),
        "amount": tx.map(|tx| tx.amount).unwrap_or(payment.amount).to_string(),
        "confirmations": tx.map(|tx| tx.confirmations).unwrap_or(i64::from(payment.confirmations)),
        "timestamp": at.unix_timestamp(),
    });

    if let Some(tx) = tx.filter(|tx| tx.shielded) {
        let fields = payload.as_object_mut().expect("payload is an object");
        fields.insert("is_shielded".into(), Value::Bool(true));
        if let Some(memo) = &tx.memo {
            fields.insert("memo".into(), Value::String(memo.clone()));
        }
    }

    payload
}
