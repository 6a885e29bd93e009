//! Zcash-family monitor.
//!
//! Poll-driven: the node offers no push interface, so every poll tick scans
//! new blocks from the persistent cursor, sweeps the transparent addresses
//! via `listunspent`, sweeps the shielded addresses via
//! `z_listreceivedbyaddress`, and runs the confirmation and expiry sweeps.
//!
//! Shielded scanning only sees what the node's imported viewing keys can
//! decrypt, so key import is part of the monitor's contract: keys are
//! imported at their birthday height (or a bounded lookback when the
//! birthday is unknown) so a payment that arrived before the import is
//! still found, and failed imports are retried on every refresh.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use secrecy::ExposeSecret;
use tokio::sync::{Mutex, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::PaywatchConfig;
use crate::error::{Error, ErrorKind};
use crate::model::{Chain, Deposit};
use crate::store::{Stores, TransactionStore as _};

use super::super::TaskHandle;
use super::super::rpc::memo;
use super::super::rpc::zcash::{RescanPolicy, ZcashChain};
use super::{
    AddressBook, MonitorError, ReorgTracker, expire_overdue, load_snapshot, record_deposit,
    scan_new_blocks, update_confirmations,
};

#[derive(Debug)]
pub(crate) struct ZcashMonitor {}

impl ZcashMonitor {
    /// Brings the monitor up and spawns its tasks: the poll loop and the
    /// address-book refresh (which also imports newly appearing viewing
    /// keys).
    ///
    /// Startup is fatal on failure, as for the Bitcoin monitor.
    pub(crate) async fn spawn(
        config: &PaywatchConfig,
        rpc: Arc<dyn ZcashChain>,
        stores: Stores,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(TaskHandle, TaskHandle), Error> {
        let Some(section) = config.zcash.clone() else {
            return Err(ErrorKind::Config
                .context("zcash monitor spawned without a [zcash] section")
                .into());
        };
        let max_blocks = config.monitor.catch_up_max_blocks_per_tick;
        let lookback = config.monitor.viewing_key_lookback_blocks;

        let node = rpc
            .blockchain_info()
            .await
            .map_err(|e| ErrorKind::Init.context(e))?;
        info!(
            network = %node.chain,
            height = node.blocks,
            "connected to zcash node",
        );

        let snapshot = load_snapshot(
            Chain::Zcash,
            stores.payments.as_ref(),
            stores.viewing_keys.as_ref(),
        )
        .await
        .map_err(|e| ErrorKind::Init.context(e))?;
        info!(watched = snapshot.watched(), "loaded zcash address book");
        let book = Arc::new(AddressBook::new(snapshot));

        let imported = Arc::new(Mutex::new(HashSet::new()));
        {
            let mut imported = imported.lock().await;
            import_viewing_keys(rpc.as_ref(), &book, &mut imported, lookback)
                .await
                .map_err(|e| ErrorKind::Init.context(e))?;
        }

        // Close the gap between the stored cursor and the tip before steady
        // polling; the first poll tick covers the mempool-equivalent
        // zero-confirmation listings.
        loop {
            let outcome =
                scan_new_blocks(rpc.as_ref(), &stores, &book, Chain::Zcash, max_blocks, &shutdown)
                    .await
                    .map_err(|e| ErrorKind::Init.context(e))?;
            if outcome.caught_up() || *shutdown.borrow() {
                break;
            }
        }

        let poll_task = {
            let rpc = rpc.clone();
            let stores = stores.clone();
            let book = book.clone();
            let shutdown = shutdown.clone();
            let threshold = section.confirmation_threshold;
            let interval = section.poll_interval_ms;
            crate::spawn!("Zcash poll", async move {
                poll_loop(rpc, stores, book, threshold, max_blocks, interval, shutdown).await?;
                Ok(())
            })
        };

        let refresh_task = {
            let interval = section.address_refresh_ms;
            crate::spawn!("Zcash address refresh", async move {
                refresh_loop(rpc, stores, book, imported, lookback, interval, shutdown).await?;
                Ok(())
            })
        };

        Ok((poll_task, refresh_task))
    }
}

/// Submits viewing keys the node has not been given this process lifetime.
///
/// `start_height` is the key's birthday, never the current tip: importing at
/// the tip with rescan disabled would silently lose any payment that arrived
/// between issuance and import. An unknown birthday falls back to a bounded
/// lookback window with a full rescan. A failed import stays out of
/// `imported` so the next refresh retries it.
pub(super) async fn import_viewing_keys(
    rpc: &dyn ZcashChain,
    book: &AddressBook,
    imported: &mut HashSet<String>,
    lookback: u64,
) -> Result<(), MonitorError> {
    let snapshot = book.snapshot();
    let pending: Vec<_> = snapshot
        .shielded()
        .filter(|(address, _)| !imported.contains(*address))
        .collect();
    if pending.is_empty() {
        return Ok(());
    }

    let tip = rpc.block_count().await?;

    for (address, entry) in pending {
        let (start_height, rescan) = match entry.birthday {
            Some(birthday) => (birthday, RescanPolicy::WhenKeyIsNew),
            None => (tip.saturating_sub(lookback), RescanPolicy::Yes),
        };

        match rpc
            .z_import_viewing_key(entry.key.expose_secret(), rescan, start_height)
            .await
        {
            Ok(()) => {
                info!(address, start_height, "imported viewing key");
                imported.insert(address.to_owned());
            }
            Err(e) => {
                warn!(address, error = %e, "viewing key import failed, will retry");
            }
        }
    }

    Ok(())
}

/// One poll tick: new blocks, transparent sweep, shielded sweep,
/// confirmation update, expiry sweep.
pub(super) async fn poll_tick(
    rpc: &dyn ZcashChain,
    stores: &Stores,
    book: &AddressBook,
    reorg: &mut ReorgTracker,
    threshold: u32,
    max_blocks: u32,
    shutdown: &watch::Receiver<bool>,
) -> Result<(), MonitorError> {
    scan_new_blocks(rpc, stores, book, Chain::Zcash, max_blocks, shutdown).await?;
    sweep_transparent(rpc, stores, book).await?;
    sweep_shielded(rpc, stores, book).await?;
    update_confirmations(rpc, stores, Chain::Zcash, threshold, reorg).await?;
    expire_overdue(stores, Chain::Zcash).await?;
    Ok(())
}

/// Polls `listunspent` for every transparent address. Zero-confirmation
/// outputs are mempool observations and detect immediately.
pub(super) async fn sweep_transparent(
    rpc: &dyn ZcashChain,
    stores: &Stores,
    book: &AddressBook,
) -> Result<(), MonitorError> {
    let snapshot = book.snapshot();

    for address in snapshot.transparent() {
        let unspent = match rpc.list_unspent(0, &[address]).await {
            Ok(unspent) => unspent,
            Err(e) => {
                warn!(address, error = %e, "listunspent failed, retrying next tick");
                continue;
            }
        };

        for utxo in unspent {
            if utxo.address.as_deref().is_some_and(|a| a != address) {
                continue;
            }
            record_deposit(
                stores,
                Chain::Zcash,
                Deposit {
                    txid: utxo.txid.clone(),
                    address: address.to_owned(),
                    amount: utxo.amount,
                    confirmations: utxo.confirmations.max(0),
                    block_hash: None,
                    block_height: None,
                    shielded: false,
                    memo: None,
                },
            )
            .await?;
        }
    }

    Ok(())
}

/// Polls `z_listreceivedbyaddress` for every shielded address.
///
/// The amount comes from the listing (outputs are encrypted on chain); the
/// raw transaction is fetched only for confirmation and block metadata. The
/// memo travels hex-encoded and is decoded here; an undecodable memo is
/// logged and the deposit recorded without it.
pub(super) async fn sweep_shielded(
    rpc: &dyn ZcashChain,
    stores: &Stores,
    book: &AddressBook,
) -> Result<(), MonitorError> {
    let snapshot = book.snapshot();

    for (address, entry) in snapshot.shielded() {
        let receipts = match rpc.z_list_received_by_address(address, 0).await {
            Ok(receipts) => receipts,
            // The node may still be rescanning after a key import.
            Err(e) => {
                warn!(
                    address,
                    payment = %entry.payment_id,
                    error = %e,
                    "shielded listing failed, retrying next tick",
                );
                continue;
            }
        };

        for receipt in receipts {
            if stores
                .transactions
                .find_by_outpoint(Chain::Zcash, &receipt.txid, address)
                .await?
                .is_some()
            {
                continue;
            }

            let decoded_memo = match receipt.memo.as_deref() {
                Some(hex_memo) => match memo::decode(hex_memo) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(
                            address,
                            txid = %receipt.txid,
                            error = %e,
                            "undecodable memo, recording deposit without it",
                        );
                        None
                    }
                },
                None => None,
            };

            let (confirmations, block_hash, block_height) =
                match rpc.raw_transaction(&receipt.txid).await {
                    Ok(tx) => {
                        let block_hash = tx.blockhash;
                        let block_height = match &block_hash {
                            Some(hash) => Some(rpc.block_info(hash).await?.height),
                            None => None,
                        };
                        (tx.confirmations.unwrap_or(0), block_hash, block_height)
                    }
                    Err(e) if e.is_not_found() => (receipt.confirmations.unwrap_or(0), None, None),
                    Err(e) => return Err(e.into()),
                };

            record_deposit(
                stores,
                Chain::Zcash,
                Deposit {
                    txid: receipt.txid.clone(),
                    address: address.to_owned(),
                    amount: receipt.amount,
                    confirmations: confirmations.max(0),
                    block_hash,
                    block_height,
                    shielded: true,
                    memo: decoded_memo,
                },
            )
            .await?;
        }
    }

    Ok(())
}

async fn poll_loop(
    rpc: Arc<dyn ZcashChain>,
    stores: Stores,
    book: Arc<AddressBook>,
    threshold: u32,
    max_blocks: u32,
    interval_ms: u64,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), MonitorError> {
    let mut reorg = ReorgTracker::default();
    let mut ticker = time::interval(Duration::from_millis(interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = poll_tick(
                    rpc.as_ref(), &stores, &book, &mut reorg, threshold, max_blocks, &shutdown,
                )
                .await
                {
                    warn!(error = %e, "poll tick failed, retrying next tick");
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn refresh_loop(
    rpc: Arc<dyn ZcashChain>,
    stores: Stores,
    book: Arc<AddressBook>,
    imported: Arc<Mutex<HashSet<String>>>,
    lookback: u64,
    interval_ms: u64,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), MonitorError> {
    let mut ticker = time::interval(Duration::from_millis(interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
            _ = ticker.tick() => {
                match load_snapshot(
                    Chain::Zcash,
                    stores.payments.as_ref(),
                    stores.viewing_keys.as_ref(),
                )
                .await
                {
                    Ok(snapshot) => {
                        debug!(watched = snapshot.watched(), "refreshed zcash address book");
                        book.replace(snapshot);

                        // New shielded addresses need their keys on the node
                        // before the next sweep can see them.
                        let mut imported = imported.lock().await;
                        if let Err(e) =
                            import_viewing_keys(rpc.as_ref(), &book, &mut imported, lookback).await
                        {
                            warn!(error = %e, "viewing key import pass failed, retrying next tick");
                        }
                    }
                    Err(e) => warn!(error = %e, "address book refresh failed, retrying next tick"),
                }
            }
        }
    }
}
