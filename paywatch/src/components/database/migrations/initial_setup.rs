use std::collections::HashSet;

use schemerz_rusqlite::RusqliteMigration;
use uuid::Uuid;

use super::MigrationError;

pub(super) const MIGRATION_ID: Uuid = Uuid::from_u128(0x5b7e1d92_40cf_4aa1_8a6e_02f1c39d85ba);

pub(super) struct Migration;

impl schemerz::Migration<Uuid> for Migration {
    fn id(&self) -> Uuid {
        MIGRATION_ID
    }

    fn dependencies(&self) -> HashSet<Uuid> {
        HashSet::new()
    }

    fn description(&self) -> &'static str {
        "Initializes the payment monitoring tables."
    }
}

impl RusqliteMigration for Migration {
    type Error = MigrationError;

    fn up(&self, transaction: &rusqlite::Transaction<'_>) -> Result<(), Self::Error> {
        transaction.execute_batch(
            "CREATE TABLE payments (
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
            );
            CREATE INDEX idx_payments_chain_status ON payments (chain, status);
            CREATE INDEX idx_payments_chain_address ON payments (chain, address);
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
            );
            CREATE INDEX idx_chain_transactions_unconfirmed
                ON chain_transactions (chain, confirmations);
            CREATE TABLE events (
                id TEXT PRIMARY KEY,
                merchant_id TEXT NOT NULL,
                payment_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                delivery_status TEXT NOT NULL DEFAULT 'pending',
                created_at INTEGER NOT NULL
            );
            CREATE TABLE chain_cursors (
                chain TEXT PRIMARY KEY,
                height INTEGER NOT NULL
            );
            CREATE TABLE viewing_keys (
                address TEXT PRIMARY KEY,
                key TEXT NOT NULL,
                birthday INTEGER
            );",
        )?;

        Ok(())
    }

    fn down(&self, _transaction: &rusqlite::Transaction<'_>) -> Result<(), Self::Error> {
        Ok(())
    }
}
