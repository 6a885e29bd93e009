//! Bitcoin-family monitor.
//!
//! Push-driven: the event stream delivers mempool transactions and new-block
//! hashes in near real time, and a periodic reconciliation sweep re-derives
//! everything from the node so a dropped notification can delay a detection
//! but never lose it. Block notifications are treated as hints only; the
//! scan always re-reads from the persistent cursor.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::PaywatchConfig;
use crate::error::{Error, ErrorKind};
use crate::model::{Chain, Deposit};
use crate::store::Stores;

use super::super::TaskHandle;
use super::super::rpc::bitcoin::BitcoinChain;
use super::super::stream::{EventStream, StreamEvent, StreamHealth, TOPIC_HASH_BLOCK, TOPIC_RAW_TX};
use super::{
    AddressBook, MonitorError, ReorgTracker, expire_overdue, load_snapshot, record_deposit,
    scan_new_blocks, update_confirmations,
};

#[derive(Debug)]
pub(crate) struct BitcoinMonitor {}

impl BitcoinMonitor {
    /// Brings the monitor up and spawns its tasks: the event stream, the
    /// notification intake, the reconciliation sweep, and the address-book
    /// refresh.
    ///
    /// Startup is fatal on failure: if the node is unreachable or the
    /// catch-up scan cannot complete, the monitor refuses to start.
    pub(crate) async fn spawn(
        config: &PaywatchConfig,
        rpc: Arc<dyn BitcoinChain>,
        stores: Stores,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(TaskHandle, TaskHandle, TaskHandle, TaskHandle), Error> {
        let Some(section) = config.bitcoin.clone() else {
            return Err(ErrorKind::Config
                .context("bitcoin monitor spawned without a [bitcoin] section")
                .into());
        };
        let max_blocks = config.monitor.catch_up_max_blocks_per_tick;

        let node = rpc
            .blockchain_info()
            .await
            .map_err(|e| ErrorKind::Init.context(e))?;
        info!(
            network = %node.chain,
            height = node.blocks,
            "connected to bitcoin node",
        );

        let snapshot = load_snapshot(
            Chain::Bitcoin,
            stores.payments.as_ref(),
            stores.viewing_keys.as_ref(),
        )
        .await
        .map_err(|e| ErrorKind::Init.context(e))?;
        info!(watched = snapshot.watched(), "loaded bitcoin address book");
        let book = Arc::new(AddressBook::new(snapshot));

        // Catch up before going event-driven: first the mempool, then every
        // block between the stored cursor and the tip.
        catch_up(rpc.as_ref(), &stores, &book, max_blocks, &shutdown)
            .await
            .map_err(|e| ErrorKind::Init.context(e))?;

        let mut stream = EventStream::new(
            &section.zmq_endpoint,
            config.stream.max_reconnect_attempts,
        );
        let raw_tx_rx = stream.register(TOPIC_RAW_TX);
        let block_rx = stream.register(TOPIC_HASH_BLOCK);
        let health = stream.health();

        let stream_task = crate::spawn!("Bitcoin event stream", {
            let shutdown = shutdown.clone();
            async move { stream.run(shutdown).await }
        });

        let reorg = Arc::new(Mutex::new(ReorgTracker::default()));

        let intake_task = {
            let rpc = rpc.clone();
            let stores = stores.clone();
            let book = book.clone();
            let reorg = reorg.clone();
            let shutdown = shutdown.clone();
            let threshold = section.confirmation_threshold;
            crate::spawn!("Bitcoin intake", async move {
                intake(
                    rpc, stores, book, reorg, raw_tx_rx, block_rx, threshold, max_blocks, shutdown,
                )
                .await?;
                Ok(())
            })
        };

        let reconcile_task = {
            let rpc = rpc.clone();
            let stores = stores.clone();
            let book = book.clone();
            let reorg = reorg.clone();
            let shutdown = shutdown.clone();
            let threshold = section.confirmation_threshold;
            let interval = section.reconcile_interval_ms;
            crate::spawn!("Bitcoin reconciliation", async move {
                reconcile_loop(
                    rpc, stores, book, reorg, health, threshold, max_blocks, interval, shutdown,
                )
                .await?;
                Ok(())
            })
        };

        let refresh_task = {
            let stores = stores.clone();
            let book = book.clone();
            let interval = section.address_refresh_ms;
            crate::spawn!("Bitcoin address refresh", async move {
                refresh_loop(stores, book, interval, shutdown).await?;
                Ok(())
            })
        };

        Ok((stream_task, intake_task, reconcile_task, refresh_task))
    }
}

pub(super) async fn catch_up(
    rpc: &dyn BitcoinChain,
    stores: &Stores,
    book: &AddressBook,
    max_blocks: u32,
    shutdown: &watch::Receiver<bool>,
) -> Result<(), MonitorError> {
    scan_mempool(rpc, stores, book).await?;
    loop {
        let outcome = scan_new_blocks(rpc, stores, book, Chain::Bitcoin, max_blocks, shutdown).await?;
        if outcome.caught_up() || *shutdown.borrow() {
            return Ok(());
        }
    }
}

/// Checks every mempool transaction against the address book. Run at
/// startup only; from then on the event stream carries mempool entries and
/// anything missed is caught once mined.
pub(super) async fn scan_mempool(
    rpc: &dyn BitcoinChain,
    stores: &Stores,
    book: &AddressBook,
) -> Result<(), MonitorError> {
    let snapshot = book.snapshot();
    if snapshot.watched() == 0 {
        return Ok(());
    }

    let txids = rpc.raw_mempool().await?;
    debug!(transactions = txids.len(), "scanning mempool");

    for txid in txids {
        let tx = match rpc.raw_transaction(&txid).await {
            Ok(tx) => tx,
            // Evicted or mined between the listing and the lookup.
            Err(e) if e.is_not_found() => continue,
            Err(e) => {
                warn!(txid = %txid, error = %e, "mempool transaction lookup failed");
                continue;
            }
        };

        for output in &tx.vout {
            for address in output.script_pub_key.destinations() {
                if snapshot.contains_transparent(address) {
                    record_deposit(
                        stores,
                        Chain::Bitcoin,
                        Deposit {
                            txid: tx.txid.clone(),
                            address: address.to_owned(),
                            amount: output.value,
                            confirmations: 0,
                            block_hash: None,
                            block_height: None,
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

/// Decodes a raw-transaction notification and runs match-and-detect for any
/// output paying a watched address.
pub(super) async fn handle_raw_tx(
    rpc: &dyn BitcoinChain,
    stores: &Stores,
    book: &AddressBook,
    payload: &[u8],
) -> Result<(), MonitorError> {
    let snapshot = book.snapshot();
    if snapshot.watched() == 0 {
        return Ok(());
    }

    let decoded = rpc.decode_raw_transaction(&hex::encode(payload)).await?;
    let matches: Vec<(String, Decimal)> = decoded
        .vout
        .iter()
        .flat_map(|output| {
            output
                .script_pub_key
                .destinations()
                .filter(|address| snapshot.contains_transparent(address))
                .map(move |address| (address.to_owned(), output.value))
        })
        .collect();
    if matches.is_empty() {
        return Ok(());
    }

    // Ask the node for the transaction's current standing. A transaction it
    // cannot report yet is a zero-confirmation mempool observation.
    let (confirmations, block_hash, block_height) = match rpc.raw_transaction(&decoded.txid).await {
        Ok(tx) => {
            let block_hash = tx.blockhash;
            let block_height = match &block_hash {
                Some(hash) => Some(rpc.block_info(hash).await?.height),
                None => None,
            };
            (tx.confirmations.unwrap_or(0), block_hash, block_height)
        }
        Err(e) if e.is_not_found() => (0, None, None),
        Err(e) => return Err(e.into()),
    };

    for (address, amount) in matches {
        record_deposit(
            stores,
            Chain::Bitcoin,
            Deposit {
                txid: decoded.txid.clone(),
                address,
                amount,
                confirmations,
                block_hash: block_hash.clone(),
                block_height,
                shielded: false,
                memo: None,
            },
        )
        .await?;
    }

    Ok(())
}

/// Scans any blocks behind the tip, then runs the confirmation sweep.
///
/// The lock serializes this between the notification path and the
/// reconciliation timer, so cursor writes have a single owner at a time.
async fn advance(
    rpc: &dyn BitcoinChain,
    stores: &Stores,
    book: &AddressBook,
    reorg: &Mutex<ReorgTracker>,
    threshold: u32,
    max_blocks: u32,
    shutdown: &watch::Receiver<bool>,
) -> Result<(), MonitorError> {
    let mut reorg = reorg.lock().await;
    scan_new_blocks(rpc, stores, book, Chain::Bitcoin, max_blocks, shutdown).await?;
    update_confirmations(rpc, stores, Chain::Bitcoin, threshold, &mut reorg).await
}

#[allow(clippy::too_many_arguments)]
async fn intake(
    rpc: Arc<dyn BitcoinChain>,
    stores: Stores,
    book: Arc<AddressBook>,
    reorg: Arc<Mutex<ReorgTracker>>,
    mut raw_tx_rx: mpsc::Receiver<StreamEvent>,
    mut block_rx: mpsc::Receiver<StreamEvent>,
    threshold: u32,
    max_blocks: u32,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), MonitorError> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
            event = raw_tx_rx.recv() => {
                // A closed channel means the stream task is gone; the
                // reconciliation sweep keeps the monitor correct.
                let Some(event) = event else { return Ok(()) };
                if let Err(e) = handle_raw_tx(rpc.as_ref(), &stores, &book, &event.payload).await {
                    warn!(error = %e, "failed to process transaction notification");
                }
            }
            event = block_rx.recv() => {
                let Some(event) = event else { return Ok(()) };
                debug!(block = %hex::encode(&event.payload), "new block notification");
                if let Err(e) = advance(
                    rpc.as_ref(), &stores, &book, &reorg, threshold, max_blocks, &shutdown,
                )
                .await
                {
                    warn!(error = %e, "failed to process block notification");
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn reconcile_loop(
    rpc: Arc<dyn BitcoinChain>,
    stores: Stores,
    book: Arc<AddressBook>,
    reorg: Arc<Mutex<ReorgTracker>>,
    health: watch::Receiver<StreamHealth>,
    threshold: u32,
    max_blocks: u32,
    interval_ms: u64,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), MonitorError> {
    let mut ticker = time::interval(Duration::from_millis(interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; catch-up already covered it.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
            _ = ticker.tick() => {
                if *health.borrow() == StreamHealth::Degraded {
                    debug!("event stream degraded, reconciliation is the only signal");
                }
                if let Err(e) = advance(
                    rpc.as_ref(), &stores, &book, &reorg, threshold, max_blocks, &shutdown,
                )
                .await
                {
                    warn!(error = %e, "reconciliation sweep failed, retrying next tick");
                }
                if let Err(e) = expire_overdue(&stores, Chain::Bitcoin).await {
                    warn!(error = %e, "expiry sweep failed, retrying next tick");
                }
            }
        }
    }
}

async fn refresh_loop(
    stores: Stores,
    book: Arc<AddressBook>,
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
                    Chain::Bitcoin,
                    stores.payments.as_ref(),
                    stores.viewing_keys.as_ref(),
                )
                .await
                {
                    Ok(snapshot) => {
                        debug!(watched = snapshot.watched(), "refreshed bitcoin address book");
                        book.replace(snapshot);
                    }
                    Err(e) => warn!(error = %e, "address book refresh failed, retrying next tick"),
                }
            }
        }
    }
}
