//! SQLite implementations of the store contracts.
//!
//! Status transitions are expressed as `UPDATE … WHERE status = ?` so a
//! repeated or racing call affects zero rows instead of double-firing; the
//! caller learns whether *its* call performed the transition from the
//! returned flag.

use std::str::FromStr;

use async_trait::async_trait;
use rusqlite::{OptionalExtension, Row, named_params};
use rust_decimal::Decimal;
use secrecy::SecretString;
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::model::{
    Chain, ChainTransaction, EventType, NewTransaction, Payment, PaymentStatus, ViewingKey,
};
use crate::store::{
    CursorStore, EventStore, PaymentStore, StoreResult, TransactionStore, ViewingKeyStore,
};

use super::DbExecutor;

fn invalid_column(e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
}

fn chain_from_row(row: &Row<'_>) -> rusqlite::Result<Chain> {
    let tag: String = row.get("chain")?;
    Chain::from_str(&tag).map_err(invalid_column)
}

fn amount_from_row(row: &Row<'_>) -> rusqlite::Result<Decimal> {
    let text: String = row.get("amount")?;
    Decimal::from_str(&text).map_err(invalid_column)
}

fn timestamp(value: i64) -> rusqlite::Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(value).map_err(invalid_column)
}

fn timestamp_opt(value: Option<i64>) -> rusqlite::Result<Option<OffsetDateTime>> {
    value.map(timestamp).transpose()
}

fn payment_from_row(row: &Row<'_>) -> rusqlite::Result<Payment> {
    let status: String = row.get("status")?;
    Ok(Payment {
        id: row.get("id")?,
        merchant_id: row.get("merchant_id")?,
        order_id: row.get("order_id")?,
        chain: chain_from_row(row)?,
        address: row.get("address")?,
        amount: amount_from_row(row)?,
        status: PaymentStatus::parse(&status),
        confirmations: row.get("confirmations")?,
        txid: row.get("txid")?,
        detected_at: timestamp_opt(row.get("detected_at")?)?,
        confirmed_at: timestamp_opt(row.get("confirmed_at")?)?,
        expires_at: timestamp(row.get("expires_at")?)?,
    })
}

fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<ChainTransaction> {
    Ok(ChainTransaction {
        id: row.get("id")?,
        payment_id: row.get("payment_id")?,
        chain: chain_from_row(row)?,
        txid: row.get("txid")?,
        address: row.get("address")?,
        amount: amount_from_row(row)?,
        confirmations: row.get("confirmations")?,
        block_height: row.get("block_height")?,
        block_hash: row.get("block_hash")?,
        shielded: row.get("shielded")?,
        memo: row.get("memo")?,
        detected_at: timestamp(row.get("detected_at")?)?,
        confirmed_at: timestamp_opt(row.get("confirmed_at")?)?,
    })
}

pub(super) struct SqlitePaymentStore {
    db: DbExecutor,
}

impl SqlitePaymentStore {
    pub(super) fn new(db: DbExecutor) -> Self {
        Self { db }
    }

    /// Inserts a payment row. In production payments are created by the
    /// payment service; this exists to seed test databases.
    #[cfg(test)]
    pub(super) async fn insert(&self, payment: &Payment) -> StoreResult<()> {
        let payment = payment.clone();
        self.db
            .write(move |conn| {
                conn.execute(
                    "INSERT INTO payments (
                        id, merchant_id, order_id, chain, address, amount, status,
                        confirmations, txid, detected_at, confirmed_at, expires_at
                    )
                    VALUES (
                        :id, :merchant_id, :order_id, :chain, :address, :amount, :status,
                        :confirmations, :txid, :detected_at, :confirmed_at, :expires_at
                    )",
                    named_params! {
                        ":id": payment.id,
                        ":merchant_id": payment.merchant_id,
                        ":order_id": payment.order_id,
                        ":chain": payment.chain.as_str(),
                        ":address": payment.address,
                        ":amount": payment.amount.to_string(),
                        ":status": payment.status.as_str(),
                        ":confirmations": payment.confirmations,
                        ":txid": payment.txid,
                        ":detected_at": payment.detected_at.map(|at| at.unix_timestamp()),
                        ":confirmed_at": payment.confirmed_at.map(|at| at.unix_timestamp()),
                        ":expires_at": payment.expires_at.unix_timestamp(),
                    },
                )?;
                Ok(())
            })
            .await
    }
}

#[async_trait]
impl PaymentStore for SqlitePaymentStore {
    async fn find_by_id(&self, id: &str) -> StoreResult<Option<Payment>> {
        let id = id.to_owned();
        self.db
            .read(move |conn| {
                conn.query_row(
                    "SELECT * FROM payments WHERE id = :id",
                    named_params! { ":id": id },
                    payment_from_row,
                )
                .optional()
            })
            .await
    }

    async fn find_by_address(&self, chain: Chain, address: &str) -> StoreResult<Option<Payment>> {
        let address = address.to_owned();
        self.db
            .read(move |conn| {
                conn.query_row(
                    "SELECT * FROM payments
                    WHERE chain = :chain AND address = :address
                    ORDER BY rowid DESC
                    LIMIT 1",
                    named_params! { ":chain": chain.as_str(), ":address": address },
                    payment_from_row,
                )
                .optional()
            })
            .await
    }

    async fn non_terminal_by_chain(&self, chain: Chain) -> StoreResult<Vec<Payment>> {
        self.db
            .read(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT * FROM payments
                    WHERE chain = :chain AND status IN ('pending', 'detected')",
                )?;
                let rows = stmt.query_map(
                    named_params! { ":chain": chain.as_str() },
                    payment_from_row,
                )?;
                rows.collect()
            })
            .await
    }

    async fn find_expired(&self, chain: Chain, now: OffsetDateTime) -> StoreResult<Vec<Payment>> {
        self.db
            .read(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT * FROM payments
                    WHERE chain = :chain AND status = 'pending' AND expires_at < :now",
                )?;
                let rows = stmt.query_map(
                    named_params! { ":chain": chain.as_str(), ":now": now.unix_timestamp() },
                    payment_from_row,
                )?;
                rows.collect()
            })
            .await
    }

    async fn mark_detected(&self, id: &str, txid: &str, at: OffsetDateTime) -> StoreResult<bool> {
        let id = id.to_owned();
        let txid = txid.to_owned();
        self.db
            .write(move |conn| {
                let changed = conn.execute(
                    "UPDATE payments
                    SET status = 'detected', txid = :txid, detected_at = :at
                    WHERE id = :id AND status = 'pending'",
                    named_params! { ":id": id, ":txid": txid, ":at": at.unix_timestamp() },
                )?;
                Ok(changed == 1)
            })
            .await
    }

    async fn mark_confirmed(&self, id: &str, at: OffsetDateTime) -> StoreResult<bool> {
        let id = id.to_owned();
        self.db
            .write(move |conn| {
                let changed = conn.execute(
                    "UPDATE payments
                    SET status = 'confirmed', confirmed_at = :at
                    WHERE id = :id AND status = 'detected'",
                    named_params! { ":id": id, ":at": at.unix_timestamp() },
                )?;
                Ok(changed == 1)
            })
            .await
    }

    async fn mark_expired(&self, id: &str) -> StoreResult<bool> {
        let id = id.to_owned();
        self.db
            .write(move |conn| {
                let changed = conn.execute(
                    "UPDATE payments
                    SET status = 'expired'
                    WHERE id = :id AND status = 'pending'",
                    named_params! { ":id": id },
                )?;
                Ok(changed == 1)
            })
            .await
    }

    async fn reset_to_pending(&self, id: &str) -> StoreResult<bool> {
        let id = id.to_owned();
        self.db
            .write(move |conn| {
                let changed = conn.execute(
                    "UPDATE payments
                    SET status = 'pending', txid = NULL, detected_at = NULL
                    WHERE id = :id AND status = 'detected'",
                    named_params! { ":id": id },
                )?;
                Ok(changed == 1)
            })
            .await
    }

    async fn set_confirmations(&self, id: &str, confirmations: u32) -> StoreResult<()> {
        let id = id.to_owned();
        self.db
            .write(move |conn| {
                conn.execute(
                    "UPDATE payments SET confirmations = :confirmations WHERE id = :id",
                    named_params! { ":id": id, ":confirmations": confirmations },
                )?;
                Ok(())
            })
            .await
    }
}

pub(super) struct SqliteTransactionStore {
    db: DbExecutor,
}

impl SqliteTransactionStore {
    pub(super) fn new(db: DbExecutor) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TransactionStore for SqliteTransactionStore {
    async fn create(&self, tx: NewTransaction) -> StoreResult<ChainTransaction> {
        let record = ChainTransaction {
            id: Uuid::new_v4().to_string(),
            payment_id: tx.payment_id,
            chain: tx.chain,
            txid: tx.txid,
            address: tx.address,
            amount: tx.amount,
            confirmations: tx.confirmations,
            block_height: tx.block_height,
            block_hash: tx.block_hash,
            shielded: tx.shielded,
            memo: tx.memo,
            detected_at: OffsetDateTime::now_utc(),
            confirmed_at: None,
        };

        let row = record.clone();
        self.db
            .write(move |conn| {
                conn.execute(
                    "INSERT INTO chain_transactions (
                        id, payment_id, chain, txid, address, amount, confirmations,
                        block_height, block_hash, shielded, memo, detected_at
                    )
                    VALUES (
                        :id, :payment_id, :chain, :txid, :address, :amount, :confirmations,
                        :block_height, :block_hash, :shielded, :memo, :detected_at
                    )",
                    named_params! {
                        ":id": row.id,
                        ":payment_id": row.payment_id,
                        ":chain": row.chain.as_str(),
                        ":txid": row.txid,
                        ":address": row.address,
                        ":amount": row.amount.to_string(),
                        ":confirmations": row.confirmations,
                        ":block_height": row.block_height,
                        ":block_hash": row.block_hash,
                        ":shielded": row.shielded,
                        ":memo": row.memo,
                        ":detected_at": row.detected_at.unix_timestamp(),
                    },
                )?;
                Ok(())
            })
            .await?;

        Ok(record)
    }

    async fn find_by_outpoint(
        &self,
        chain: Chain,
        txid: &str,
        address: &str,
    ) -> StoreResult<Option<ChainTransaction>> {
        let txid = txid.to_owned();
        let address = address.to_owned();
        self.db
            .read(move |conn| {
                conn.query_row(
                    "SELECT * FROM chain_transactions
                    WHERE chain = :chain AND txid = :txid AND address = :address",
                    named_params! {
                        ":chain": chain.as_str(),
                        ":txid": txid,
                        ":address": address,
                    },
                    transaction_from_row,
                )
                .optional()
            })
            .await
    }

    async fn find_by_txid(&self, chain: Chain, txid: &str) -> StoreResult<Vec<ChainTransaction>> {
        let txid = txid.to_owned();
        self.db
            .read(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT * FROM chain_transactions
                    WHERE chain = :chain AND txid = :txid",
                )?;
                let rows = stmt.query_map(
                    named_params! { ":chain": chain.as_str(), ":txid": txid },
                    transaction_from_row,
                )?;
                rows.collect()
            })
            .await
    }

    async fn find_unconfirmed(
        &self,
        chain: Chain,
        threshold: u32,
    ) -> StoreResult<Vec<ChainTransaction>> {
        self.db
            .read(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT * FROM chain_transactions
                    WHERE chain = :chain
                        AND (confirmations < :threshold OR confirmed_at IS NULL)",
                )?;
                let rows = stmt.query_map(
                    named_params! { ":chain": chain.as_str(), ":threshold": threshold },
                    transaction_from_row,
                )?;
                rows.collect()
            })
            .await
    }

    async fn update_confirmations(
        &self,
        id: &str,
        confirmations: i64,
        block_hash: Option<&str>,
        block_height: Option<u64>,
    ) -> StoreResult<()> {
        let id = id.to_owned();
        let block_hash = block_hash.map(str::to_owned);
        self.db
            .write(move |conn| {
                conn.execute(
                    "UPDATE chain_transactions
                    SET confirmations = :confirmations,
                        block_hash = :block_hash,
                        block_height = :block_height
                    WHERE id = :id",
                    named_params! {
                        ":id": id,
                        ":confirmations": confirmations,
                        ":block_hash": block_hash,
                        ":block_height": block_height,
                    },
                )?;
                Ok(())
            })
            .await
    }

    async fn mark_confirmed(&self, id: &str, at: OffsetDateTime) -> StoreResult<()> {
        let id = id.to_owned();
        self.db
            .write(move |conn| {
                conn.execute(
                    "UPDATE chain_transactions
                    SET confirmed_at = :at
                    WHERE id = :id AND confirmed_at IS NULL",
                    named_params! { ":id": id, ":at": at.unix_timestamp() },
                )?;
                Ok(())
            })
            .await
    }

    async fn remove(&self, id: &str) -> StoreResult<()> {
        let id = id.to_owned();
        self.db
            .write(move |conn| {
                conn.execute(
                    "DELETE FROM chain_transactions WHERE id = :id",
                    named_params! { ":id": id },
                )?;
                Ok(())
            })
            .await
    }
}

pub(super) struct SqliteEventStore {
    db: DbExecutor,
}

impl SqliteEventStore {
    pub(super) fn new(db: DbExecutor) -> Self {
        Self { db }
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn create(
        &self,
        merchant_id: &str,
        payment_id: &str,
        event_type: EventType,
        payload: Value,
    ) -> StoreResult<()> {
        let id = Uuid::new_v4().to_string();
        let merchant_id = merchant_id.to_owned();
        let payment_id = payment_id.to_owned();
        let created_at = OffsetDateTime::now_utc().unix_timestamp();
        self.db
            .write(move |conn| {
                conn.execute(
                    "INSERT INTO events (id, merchant_id, payment_id, event_type, payload, created_at)
                    VALUES (:id, :merchant_id, :payment_id, :event_type, :payload, :created_at)",
                    named_params! {
                        ":id": id,
                        ":merchant_id": merchant_id,
                        ":payment_id": payment_id,
                        ":event_type": event_type.as_str(),
                        ":payload": payload.to_string(),
                        ":created_at": created_at,
                    },
                )?;
                Ok(())
            })
            .await
    }
}

pub(super) struct SqliteCursorStore {
    db: DbExecutor,
}

impl SqliteCursorStore {
    pub(super) fn new(db: DbExecutor) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CursorStore for SqliteCursorStore {
    async fn get(&self, chain: Chain) -> StoreResult<Option<u64>> {
        self.db
            .read(move |conn| {
                conn.query_row(
                    "SELECT height FROM chain_cursors WHERE chain = :chain",
                    named_params! { ":chain": chain.as_str() },
                    |row| row.get(0),
                )
                .optional()
            })
            .await
    }

    async fn advance(&self, chain: Chain, height: u64) -> StoreResult<()> {
        self.db
            .write(move |conn| {
                conn.execute(
                    "INSERT INTO chain_cursors (chain, height)
                    VALUES (:chain, :height)
                    ON CONFLICT (chain) DO UPDATE SET height = MAX(height, excluded.height)",
                    named_params! { ":chain": chain.as_str(), ":height": height },
                )?;
                Ok(())
            })
            .await
    }
}

pub(super) struct SqliteViewingKeyStore {
    db: DbExecutor,
}

impl SqliteViewingKeyStore {
    pub(super) fn new(db: DbExecutor) -> Self {
        Self { db }
    }

    /// Inserts a viewing key row. In production these are written by the
    /// wallet service; this exists to seed test databases.
    #[cfg(test)]
    pub(super) async fn insert(
        &self,
        address: &str,
        key: &str,
        birthday: Option<u64>,
    ) -> StoreResult<()> {
        let address = address.to_owned();
        let key = key.to_owned();
        self.db
            .write(move |conn| {
                conn.execute(
                    "INSERT INTO viewing_keys (address, key, birthday)
                    VALUES (:address, :key, :birthday)",
                    named_params! { ":address": address, ":key": key, ":birthday": birthday },
                )?;
                Ok(())
            })
            .await
    }
}

#[async_trait]
impl ViewingKeyStore for SqliteViewingKeyStore {
    async fn viewing_key_for_address(&self, address: &str) -> StoreResult<Option<ViewingKey>> {
        let address = address.to_owned();
        self.db
            .read(move |conn| {
                conn.query_row(
                    "SELECT key, birthday FROM viewing_keys WHERE address = :address",
                    named_params! { ":address": address },
                    |row| {
                        let key: String = row.get("key")?;
                        Ok(ViewingKey {
                            key: SecretString::new(key),
                            birthday: row.get("birthday")?,
                        })
                    },
                )
                .optional()
            })
            .await
    }
}
