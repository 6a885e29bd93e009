//! Documentation about the database structure.
//!
//! The structure is managed by [`Database::open`], which applies the
//! migrations (defined in [`migrations`]) that produce it.
//!
//! The SQL code in this module's constants encodes the current database
//! structure, as represented internally by SQLite. We do not use these
//! constants at runtime; instead we check the output of the migrations in a
//! test, to pin the expected database structure.
//!
//! [`Database::open`]: super::Database::open
//! [`migrations`]: super::migrations

// The constants in this module are only used in tests, but `#[cfg(test)]`
// prevents them from showing up in `cargo doc --document-private-items`.
#![allow(dead_code)]

/// Payment requests, owned by the payment service.
///
/// The monitor only advances `status`, `confirmations`, `txid`,
/// `detected_at`, and `confirmed_at`, always guarded on the current status.
///
/// ### Columns
///
/// - `chain`: chain tag, `btc` or `zec`.
/// - `amount`: requested amount as exact decimal text, 8 fractional digits.
/// - `status`: `pending`, `detected`, `confirmed`, `expired`, `failed`, or a
///   state owned by a collaborator.
/// - `txid`: hash of the detected transaction, `NULL` until detection.
/// - `detected_at`, `confirmed_at`: unix timestamps, `NULL` until reached.
/// - `expires_at`: unix timestamp after which an undetected payment expires.
pub(crate) const TABLE_PAYMENTS: &str = r#"
CREATE TABLE payments (
    id TEXT PRIMARY KEY,
    merchant_id TEXT NOT NULL,
    order_id TEXT NOT NULL,
    chain TEXT NOT NULL,
    address TEXT NOT NULL,
    amount TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    confirmations INTEGER NOT NULL DEFAULT 0,
    txid TEXT,
    detected_at INTEGER,
    confirmed_at INTEGER,
    expires_at INTEGER NOT NULL
)
"#;

pub(crate) const INDEX_PAYMENTS_CHAIN_STATUS: &str = r#"
CREATE INDEX idx_payments_chain_status ON payments (chain, status)
"#;

pub(crate) const INDEX_PAYMENTS_CHAIN_ADDRESS: &str = r#"
CREATE INDEX idx_payments_chain_address ON payments (chain, address)
"#;

/// Observed on-chain transactions, one row per `(chain, txid, address)`.
///
/// The uniqueness constraint is what collapses concurrent detections of the
/// same deposit into a single record.
///
/// ### Columns
///
/// - `amount`: observed amount as exact decimal text.
/// - `confirmations`: last observed count; 0 while in the mempool.
/// - `block_height`, `block_hash`: `NULL` while in the mempool; rewritten
///   only by the reorg handling.
/// - `shielded`: whether the deposit arrived at a shielded address.
/// - `memo`: decoded shielded memo text, when present.
pub(crate) const TABLE_CHAIN_TRANSACTIONS: &str = r#"
CREATE TABLE chain_transactions (
    id TEXT PRIMARY KEY,
    payment_id TEXT NOT NULL REFERENCES payments (id),
    chain TEXT NOT NULL,
    txid TEXT NOT NULL,
    address TEXT NOT NULL,
    amount TEXT NOT NULL,
    confirmations INTEGER NOT NULL DEFAULT 0,
    block_height INTEGER,
    block_hash TEXT,
    shielded INTEGER NOT NULL DEFAULT 0,
    memo TEXT,
    detected_at INTEGER NOT NULL,
    confirmed_at INTEGER,
    UNIQUE (chain, txid, address)
)
"#;

pub(crate) const INDEX_CHAIN_TRANSACTIONS_UNCONFIRMED: &str = r#"
CREATE INDEX idx_chain_transactions_unconfirmed ON chain_transactions (chain, confirmations)
"#;

/// Outbound notification events.
///
/// The monitor inserts rows with `delivery_status = 'pending'` and never
/// reads them back; the delivery service owns everything after that.
pub(crate) const TABLE_EVENTS: &str = r#"
CREATE TABLE events (
    id TEXT PRIMARY KEY,
    merchant_id TEXT NOT NULL,
    payment_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    delivery_status TEXT NOT NULL DEFAULT 'pending',
    created_at INTEGER NOT NULL
)
"#;

/// The per-chain scan cursor: the highest block height fully reconciled
/// against the watched address set. Monotonically non-decreasing.
pub(crate) const TABLE_CHAIN_CURSORS: &str = r#"
CREATE TABLE chain_cursors (
    chain TEXT PRIMARY KEY,
    height INTEGER NOT NULL
)
"#;

/// Viewing keys issued by the wallet service for shielded addresses.
///
/// ### Columns
///
/// - `key`: the viewing key material.
/// - `birthday`: block height at which the address was issued, or `NULL`
///   when unknown.
pub(crate) const TABLE_VIEWING_KEYS: &str = r#"
CREATE TABLE viewing_keys (
    address TEXT PRIMARY KEY,
    key TEXT NOT NULL,
    birthday INTEGER
)
"#;
