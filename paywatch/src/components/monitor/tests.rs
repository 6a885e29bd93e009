use std::collections::HashSet;
use std::sync::Arc;

use rust_decimal::Decimal;
use time::OffsetDateTime;
use tokio::sync::watch;

use crate::model::{Chain, EventType, Payment, PaymentStatus};
use crate::store::{CursorStore as _, Stores, TransactionStore as _};

use super::bitcoin as btc;
use super::testing::{FakeChain, MemoryBackend, tx_paying};
use super::zcash as zec;
use super::{
    AddressBook, ReorgTracker, expire_overdue, load_snapshot, scan_new_blocks,
    update_confirmations,
};

const THRESHOLD: u32 = 6;
const MAX_BLOCKS: u32 = 500;

fn setup() -> (Arc<MemoryBackend>, Stores) {
    let backend = Arc::new(MemoryBackend::default());
    let stores = MemoryBackend::stores(&backend);
    (backend, stores)
}

fn pending_payment(id: &str, chain: Chain, address: &str) -> Payment {
    Payment {
        id: id.into(),
        merchant_id: "m-1".into(),
        order_id: format!("order-{id}"),
        chain,
        address: address.into(),
        amount: Decimal::new(100_000_000, 8),
        status: PaymentStatus::Pending,
        confirmations: 0,
        txid: None,
        detected_at: None,
        confirmed_at: None,
        expires_at: OffsetDateTime::now_utc() + time::Duration::minutes(30),
    }
}

async fn build_book(stores: &Stores, chain: Chain) -> AddressBook {
    AddressBook::new(
        load_snapshot(chain, stores.payments.as_ref(), stores.viewing_keys.as_ref())
            .await
            .unwrap(),
    )
}

fn no_shutdown() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    // Keep the sender alive for the test's duration.
    std::mem::forget(tx);
    rx
}

#[tokio::test]
async fn bitcoin_happy_path_mempool_then_confirmed() {
    let (backend, stores) = setup();
    backend.add_payment(pending_payment("p1", Chain::Bitcoin, "bc1qa1"));
    let book = build_book(&stores, Chain::Bitcoin).await;

    let chain = FakeChain::new(100);
    stores.cursors.advance(Chain::Bitcoin, 100).await.unwrap();

    let tx1 = tx_paying("t1", "bc1qa1", "1.00000000");
    chain.add_to_mempool(tx1.clone());

    // Mempool observation: detected with zero confirmations, no block.
    btc::scan_mempool(&chain, &stores, &book).await.unwrap();

    let payment = backend.payment("p1");
    assert_eq!(payment.status, PaymentStatus::Detected);
    assert_eq!(payment.txid.as_deref(), Some("t1"));
    assert!(payment.detected_at.is_some());
    assert_eq!(
        backend.events_for("p1", EventType::PaymentDetected).len(),
        1
    );

    let records = backend.transactions();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].confirmations, 0);
    assert_eq!(records[0].block_height, None);
    assert_eq!(records[0].block_hash, None);

    // Mine the transaction plus five more blocks: six confirmations.
    chain.mine_block(vec![tx1]);
    chain.mine_empty_blocks(5);

    let shutdown = no_shutdown();
    let mut reorg = ReorgTracker::default();
    scan_new_blocks(&chain, &stores, &book, Chain::Bitcoin, MAX_BLOCKS, &shutdown)
        .await
        .unwrap();
    update_confirmations(&chain, &stores, Chain::Bitcoin, THRESHOLD, &mut reorg)
        .await
        .unwrap();

    let payment = backend.payment("p1");
    assert_eq!(payment.status, PaymentStatus::Confirmed);
    assert!(payment.confirmed_at.is_some());
    assert_eq!(payment.confirmations, 6);
    assert_eq!(
        backend.events_for("p1", EventType::PaymentConfirmed).len(),
        1
    );

    let records = backend.transactions();
    assert_eq!(records.len(), 1, "block scan must not duplicate the record");
    assert_eq!(records[0].confirmations, 6);
    assert_eq!(records[0].block_height, Some(101));
    assert_eq!(records[0].block_hash.as_deref(), Some("blk101"));
    assert!(records[0].confirmed_at.is_some());
}

#[tokio::test]
async fn threshold_boundary_is_exact() {
    let (backend, stores) = setup();
    backend.add_payment(pending_payment("p1", Chain::Bitcoin, "bc1qa1"));
    let book = build_book(&stores, Chain::Bitcoin).await;

    let chain = FakeChain::new(100);
    stores.cursors.advance(Chain::Bitcoin, 100).await.unwrap();

    chain.mine_block(vec![tx_paying("t1", "bc1qa1", "1.0")]);
    // threshold - 1 confirmations in total.
    chain.mine_empty_blocks(u64::from(THRESHOLD) - 2);

    let shutdown = no_shutdown();
    let mut reorg = ReorgTracker::default();
    scan_new_blocks(&chain, &stores, &book, Chain::Bitcoin, MAX_BLOCKS, &shutdown)
        .await
        .unwrap();
    update_confirmations(&chain, &stores, Chain::Bitcoin, THRESHOLD, &mut reorg)
        .await
        .unwrap();

    let payment = backend.payment("p1");
    assert_eq!(payment.status, PaymentStatus::Detected);
    assert_eq!(payment.confirmations, THRESHOLD - 1);
    assert!(backend.events_for("p1", EventType::PaymentConfirmed).is_empty());

    // One more block crosses the threshold exactly.
    chain.mine_empty_blocks(1);
    update_confirmations(&chain, &stores, Chain::Bitcoin, THRESHOLD, &mut reorg)
        .await
        .unwrap();

    let payment = backend.payment("p1");
    assert_eq!(payment.status, PaymentStatus::Confirmed);
    assert_eq!(
        backend.events_for("p1", EventType::PaymentConfirmed).len(),
        1
    );
}

#[tokio::test]
async fn bitcoin_catch_up_finds_deposits_missed_while_down() {
    let (backend, stores) = setup();
    backend.add_payment(pending_payment("p2", Chain::Bitcoin, "bc1qa2"));
    let book = build_book(&stores, Chain::Bitcoin).await;

    // The monitor was down: cursor persisted at 100, three blocks arrived,
    // one of them paying the watched address.
    let chain = FakeChain::new(100);
    stores.cursors.advance(Chain::Bitcoin, 100).await.unwrap();
    chain.mine_block(vec![tx_paying("t2", "bc1qa2", "0.50000000")]);
    chain.mine_empty_blocks(2);

    let shutdown = no_shutdown();
    btc::catch_up(&chain, &stores, &book, MAX_BLOCKS, &shutdown)
        .await
        .unwrap();

    let payment = backend.payment("p2");
    assert_eq!(payment.status, PaymentStatus::Detected);
    assert_eq!(stores.cursors.get(Chain::Bitcoin).await.unwrap(), Some(103));

    let records = backend.transactions();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].block_height, Some(101));
    assert_eq!(records[0].amount.to_string(), "0.50000000");

    // Three more blocks bring the total to six; the sweep confirms.
    chain.mine_empty_blocks(3);
    let mut reorg = ReorgTracker::default();
    update_confirmations(&chain, &stores, Chain::Bitcoin, THRESHOLD, &mut reorg)
        .await
        .unwrap();
    assert_eq!(backend.payment("p2").status, PaymentStatus::Confirmed);
}

#[tokio::test]
async fn cursor_resume_scans_exactly_the_gap() {
    let (backend, stores) = setup();
    backend.add_payment(pending_payment("p6", Chain::Bitcoin, "bc1qa6"));
    let book = build_book(&stores, Chain::Bitcoin).await;

    let chain = FakeChain::new(100);
    stores.cursors.advance(Chain::Bitcoin, 100).await.unwrap();

    // Fifty blocks arrive while the process is down; block 110 pays us.
    for height in 101..=150u64 {
        if height == 110 {
            chain.mine_block(vec![tx_paying("t6", "bc1qa6", "2.0")]);
        } else {
            chain.mine_empty_blocks(1);
        }
    }

    // A bounded sweep makes partial progress and persists it.
    let shutdown = no_shutdown();
    let outcome = scan_new_blocks(&chain, &stores, &book, Chain::Bitcoin, 20, &shutdown)
        .await
        .unwrap();
    assert_eq!(outcome.cursor, 120);
    assert!(!outcome.caught_up());
    assert_eq!(stores.cursors.get(Chain::Bitcoin).await.unwrap(), Some(120));
    assert_eq!(backend.payment("p6").status, PaymentStatus::Detected);
    assert_eq!(backend.transactions()[0].block_height, Some(110));

    // The next sweep finishes the gap.
    let outcome = scan_new_blocks(&chain, &stores, &book, Chain::Bitcoin, MAX_BLOCKS, &shutdown)
        .await
        .unwrap();
    assert_eq!(outcome.cursor, 150);
    assert!(outcome.caught_up());

    // 41 confirmations at the tip: straight to confirmed on the next sweep.
    let mut reorg = ReorgTracker::default();
    update_confirmations(&chain, &stores, Chain::Bitcoin, THRESHOLD, &mut reorg)
        .await
        .unwrap();
    assert_eq!(backend.payment("p6").status, PaymentStatus::Confirmed);
}

#[tokio::test]
async fn first_run_initializes_cursor_to_tip() {
    let (_backend, stores) = setup();
    let book = AddressBook::new(Default::default());

    let chain = FakeChain::new(500);
    let shutdown = no_shutdown();
    let outcome = scan_new_blocks(&chain, &stores, &book, Chain::Bitcoin, MAX_BLOCKS, &shutdown)
        .await
        .unwrap();
    assert_eq!(outcome.cursor, 500);
    assert_eq!(stores.cursors.get(Chain::Bitcoin).await.unwrap(), Some(500));
}

#[tokio::test]
async fn renotification_is_idempotent() {
    let (backend, stores) = setup();
    backend.add_payment(pending_payment("p5", Chain::Bitcoin, "bc1qa5"));
    let book = build_book(&stores, Chain::Bitcoin).await;

    let chain = FakeChain::new(100);
    let payload = b"raw-tx-5".to_vec();
    let tx5 = tx_paying("t5", "bc1qa5", "1.0");
    chain.add_decodable(&payload, tx5.clone());
    chain.add_to_mempool(tx5);

    btc::handle_raw_tx(&chain, &stores, &book, &payload)
        .await
        .unwrap();
    // The node relays the same transaction again.
    btc::handle_raw_tx(&chain, &stores, &book, &payload)
        .await
        .unwrap();

    assert_eq!(backend.transactions().len(), 1);
    assert_eq!(
        backend.events_for("p5", EventType::PaymentDetected).len(),
        1
    );
    assert_eq!(backend.payment("p5").status, PaymentStatus::Detected);
}

#[tokio::test]
async fn stale_cache_hits_are_revalidated_against_the_store() {
    let (backend, stores) = setup();
    backend.add_payment(pending_payment("p7", Chain::Bitcoin, "bc1qa7"));
    let book = build_book(&stores, Chain::Bitcoin).await;

    // The payment service expires the payment after the snapshot was taken.
    backend.force_status("p7", PaymentStatus::Expired);

    let chain = FakeChain::new(100);
    let payload = b"raw-tx-7".to_vec();
    let tx7 = tx_paying("t7", "bc1qa7", "1.0");
    chain.add_decodable(&payload, tx7.clone());
    chain.add_to_mempool(tx7);

    btc::handle_raw_tx(&chain, &stores, &book, &payload)
        .await
        .unwrap();

    assert!(backend.transactions().is_empty());
    assert!(backend.events().is_empty());
    assert_eq!(backend.payment("p7").status, PaymentStatus::Expired);
}

#[tokio::test]
async fn zcash_transparent_deposit_detects_and_confirms() {
    let (backend, stores) = setup();
    backend.add_payment(pending_payment("p3", Chain::Zcash, "t1qa3"));
    let book = build_book(&stores, Chain::Zcash).await;

    let chain = FakeChain::new(200);
    stores.cursors.advance(Chain::Zcash, 200).await.unwrap();

    let tx3 = tx_paying("t3", "t1qa3", "0.75000000");
    chain.add_to_mempool(tx3.clone());
    chain.set_unspent(
        "t1qa3",
        vec![super::super::rpc::zcash::Unspent {
            txid: "t3".into(),
            vout: 0,
            address: Some("t1qa3".into()),
            amount: "0.75000000".parse().unwrap(),
            confirmations: 0,
        }],
    );

    let shutdown = no_shutdown();
    let mut reorg = ReorgTracker::default();
    zec::poll_tick(
        &chain, &stores, &book, &mut reorg, THRESHOLD, MAX_BLOCKS, &shutdown,
    )
    .await
    .unwrap();

    let payment = backend.payment("p3");
    assert_eq!(payment.status, PaymentStatus::Detected);
    assert_eq!(backend.transactions()[0].confirmations, 0);

    // Mined plus five on top: the next poll confirms.
    chain.mine_block(vec![tx3]);
    chain.mine_empty_blocks(5);
    zec::poll_tick(
        &chain, &stores, &book, &mut reorg, THRESHOLD, MAX_BLOCKS, &shutdown,
    )
    .await
    .unwrap();

    let payment = backend.payment("p3");
    assert_eq!(payment.status, PaymentStatus::Confirmed);
    assert_eq!(
        backend.events_for("p3", EventType::PaymentConfirmed).len(),
        1
    );
}

#[tokio::test]
async fn zcash_shielded_deposit_carries_the_memo() {
    let (backend, stores) = setup();
    backend.add_payment(pending_payment("p4", Chain::Zcash, "zs1qa4"));
    backend.add_viewing_key("zs1qa4", "zxviews1qa4", Some(150));
    let book = build_book(&stores, Chain::Zcash).await;

    let chain = FakeChain::new(200);
    stores.cursors.advance(Chain::Zcash, 200).await.unwrap();

    // The key goes to the node at the address's birthday, not the tip.
    let mut imported = HashSet::new();
    zec::import_viewing_keys(&chain, &book, &mut imported, 10_000)
        .await
        .unwrap();
    let imports = chain.imports();
    assert_eq!(imports.len(), 1);
    assert_eq!(imports[0].key, "zxviews1qa4");
    assert_eq!(imports[0].start_height, 150);

    let tx4 = tx_paying("t4", "zs1qa4", "0.00000000");
    chain.mine_block(vec![tx4]);
    chain.set_shielded_received(
        "zs1qa4",
        vec![super::super::rpc::zcash::ShieldedReceipt {
            txid: "t4".into(),
            amount: "1.25000000".parse().unwrap(),
            memo: Some(hex::encode("order-42")),
            confirmations: Some(1),
            out_index: Some(0),
            change: false,
        }],
    );

    zec::sweep_shielded(&chain, &stores, &book).await.unwrap();

    let payment = backend.payment("p4");
    assert_eq!(payment.status, PaymentStatus::Detected);

    let records = backend.transactions();
    assert_eq!(records.len(), 1);
    assert!(records[0].shielded);
    assert_eq!(records[0].memo.as_deref(), Some("order-42"));
    // The amount is the node's decrypted view, not a transaction output.
    assert_eq!(records[0].amount.to_string(), "1.25000000");
    assert_eq!(records[0].block_height, Some(201));

    let detected = backend.events_for("p4", EventType::PaymentDetected);
    assert_eq!(detected.len(), 1);
    assert_eq!(detected[0].payload["is_shielded"], true);
    assert_eq!(detected[0].payload["memo"], "order-42");

    // A second sweep over the same listing records nothing new.
    zec::sweep_shielded(&chain, &stores, &book).await.unwrap();
    assert_eq!(backend.transactions().len(), 1);
}

#[tokio::test]
async fn viewing_key_imports_retry_after_failure_and_fall_back_without_birthday() {
    let (backend, stores) = setup();
    backend.add_payment(pending_payment("p8", Chain::Zcash, "zs1qa8"));
    backend.add_viewing_key("zs1qa8", "zxviews1qa8", None);
    let book = build_book(&stores, Chain::Zcash).await;

    let chain = FakeChain::new(20_000);
    let mut imported = HashSet::new();

    chain.set_fail_imports(true);
    zec::import_viewing_keys(&chain, &book, &mut imported, 10_000)
        .await
        .unwrap();
    assert!(imported.is_empty(), "failed imports must be retried later");

    chain.set_fail_imports(false);
    zec::import_viewing_keys(&chain, &book, &mut imported, 10_000)
        .await
        .unwrap();
    assert!(imported.contains("zs1qa8"));

    // Unknown birthday: bounded lookback with a full rescan.
    let imports = chain.imports();
    assert_eq!(imports.len(), 1);
    assert_eq!(imports[0].start_height, 10_000);
    assert_eq!(
        imports[0].rescan,
        super::super::rpc::zcash::RescanPolicy::Yes
    );

    // Already-imported keys are not resubmitted.
    zec::import_viewing_keys(&chain, &book, &mut imported, 10_000)
        .await
        .unwrap();
    assert_eq!(chain.imports().len(), 1);
}

#[tokio::test]
async fn expiry_spares_detected_payments() {
    let (backend, stores) = setup();

    let mut overdue = pending_payment("p-overdue", Chain::Bitcoin, "bc1qo");
    overdue.expires_at = OffsetDateTime::now_utc() - time::Duration::minutes(1);
    backend.add_payment(overdue);

    // Detected one second before expiry; it must survive and still confirm.
    let mut detected = pending_payment("p-detected", Chain::Bitcoin, "bc1qd");
    detected.expires_at = OffsetDateTime::now_utc() - time::Duration::minutes(1);
    backend.add_payment(detected);
    let book = build_book(&stores, Chain::Bitcoin).await;

    let chain = FakeChain::new(100);
    stores.cursors.advance(Chain::Bitcoin, 100).await.unwrap();
    let txd = tx_paying("td", "bc1qd", "1.0");
    chain.add_to_mempool(txd.clone());
    btc::scan_mempool(&chain, &stores, &book).await.unwrap();

    expire_overdue(&stores, Chain::Bitcoin).await.unwrap();

    assert_eq!(backend.payment("p-overdue").status, PaymentStatus::Expired);
    assert_eq!(
        backend
            .events_for("p-overdue", EventType::PaymentExpired)
            .len(),
        1
    );
    assert_eq!(backend.payment("p-detected").status, PaymentStatus::Detected);

    // The late deposit still confirms after the deadline.
    chain.mine_block(vec![txd]);
    chain.mine_empty_blocks(5);
    let shutdown = no_shutdown();
    let mut reorg = ReorgTracker::default();
    scan_new_blocks(&chain, &stores, &book, Chain::Bitcoin, MAX_BLOCKS, &shutdown)
        .await
        .unwrap();
    update_confirmations(&chain, &stores, Chain::Bitcoin, THRESHOLD, &mut reorg)
        .await
        .unwrap();
    assert_eq!(backend.payment("p-detected").status, PaymentStatus::Confirmed);
}

#[tokio::test]
async fn reorged_detection_returns_to_pending_after_three_misses() {
    let (backend, stores) = setup();
    backend.add_payment(pending_payment("p9", Chain::Bitcoin, "bc1qa9"));
    let book = build_book(&stores, Chain::Bitcoin).await;

    let chain = FakeChain::new(100);
    stores.cursors.advance(Chain::Bitcoin, 100).await.unwrap();
    let tx9 = tx_paying("t9", "bc1qa9", "1.0");
    chain.add_to_mempool(tx9.clone());
    btc::scan_mempool(&chain, &stores, &book).await.unwrap();
    assert_eq!(backend.payment("p9").status, PaymentStatus::Detected);

    // The transaction disappears from the node entirely.
    chain.vanish("t9");

    let mut reorg = ReorgTracker::default();
    for sweep in 1..=2 {
        update_confirmations(&chain, &stores, Chain::Bitcoin, THRESHOLD, &mut reorg)
            .await
            .unwrap();
        assert_eq!(
            backend.payment("p9").status,
            PaymentStatus::Detected,
            "sweep {sweep} must not yet reset the payment",
        );
    }

    update_confirmations(&chain, &stores, Chain::Bitcoin, THRESHOLD, &mut reorg)
        .await
        .unwrap();

    let payment = backend.payment("p9");
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert_eq!(payment.txid, None);
    assert!(backend.transactions().is_empty());
    assert!(backend.events_for("p9", EventType::PaymentFailed).is_empty());

    // The deposit re-appears in a new block and is detected afresh.
    chain.add_to_mempool(tx9.clone());
    chain.mine_block(vec![tx9]);
    let shutdown = no_shutdown();
    scan_new_blocks(&chain, &stores, &book, Chain::Bitcoin, MAX_BLOCKS, &shutdown)
        .await
        .unwrap();
    assert_eq!(backend.payment("p9").status, PaymentStatus::Detected);
    assert_eq!(backend.transactions().len(), 1);
}

#[tokio::test]
async fn confirmed_payments_are_never_rolled_back_by_a_reorg() {
    let (backend, stores) = setup();
    let mut payment = pending_payment("p10", Chain::Bitcoin, "bc1qa10");
    payment.status = PaymentStatus::Confirmed;
    payment.txid = Some("t10".into());
    backend.add_payment(payment);

    // A second deposit record for the confirmed payment, still shy of the
    // threshold, whose transaction the node has forgotten.
    stores
        .transactions
        .create(crate::model::NewTransaction {
            payment_id: "p10".into(),
            chain: Chain::Bitcoin,
            txid: "t10b".into(),
            address: "bc1qa10".into(),
            amount: Decimal::ONE,
            confirmations: 1,
            block_height: Some(90),
            block_hash: Some("blk90".into()),
            shielded: false,
            memo: None,
        })
        .await
        .unwrap();

    let chain = FakeChain::new(100);
    let mut reorg = ReorgTracker::default();
    for _ in 0..3 {
        update_confirmations(&chain, &stores, Chain::Bitcoin, THRESHOLD, &mut reorg)
            .await
            .unwrap();
    }

    let payment = backend.payment("p10");
    assert_eq!(payment.status, PaymentStatus::Confirmed, "never rolled back");

    let failed = backend.events_for("p10", EventType::PaymentFailed);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].payload["reason"], "linked transaction missing after reorg");

    // The vanished record is gone, so the sweep does not fire again.
    update_confirmations(&chain, &stores, Chain::Bitcoin, THRESHOLD, &mut reorg)
        .await
        .unwrap();
    assert_eq!(backend.events_for("p10", EventType::PaymentFailed).len(), 1);
}

#[tokio::test]
async fn interrupted_detection_is_finished_by_the_sweep() {
    let (backend, stores) = setup();
    backend.add_payment(pending_payment("p13", Chain::Bitcoin, "bc1qa13"));

    // A previous run recorded the transaction but stopped before the
    // payment transition.
    stores
        .transactions
        .create(crate::model::NewTransaction {
            payment_id: "p13".into(),
            chain: Chain::Bitcoin,
            txid: "t13".into(),
            address: "bc1qa13".into(),
            amount: Decimal::ONE,
            confirmations: 0,
            block_height: None,
            block_hash: None,
            shielded: false,
            memo: None,
        })
        .await
        .unwrap();

    let chain = FakeChain::new(100);
    chain.add_to_mempool(tx_paying("t13", "bc1qa13", "1.0"));
    chain.mine_block(vec![tx_paying("t13", "bc1qa13", "1.0")]);
    chain.mine_empty_blocks(5);

    let mut reorg = ReorgTracker::default();
    update_confirmations(&chain, &stores, Chain::Bitcoin, THRESHOLD, &mut reorg)
        .await
        .unwrap();

    // One sweep both finishes the detection and confirms at the threshold.
    let payment = backend.payment("p13");
    assert_eq!(payment.status, PaymentStatus::Confirmed);
    assert_eq!(payment.txid.as_deref(), Some("t13"));
    assert_eq!(
        backend.events_for("p13", EventType::PaymentDetected).len(),
        1
    );
    assert_eq!(
        backend.events_for("p13", EventType::PaymentConfirmed).len(),
        1
    );
}

#[tokio::test]
async fn address_book_swaps_are_atomic_for_readers() {
    let (backend, stores) = setup();
    backend.add_payment(pending_payment("p11", Chain::Bitcoin, "bc1qold"));
    let book = build_book(&stores, Chain::Bitcoin).await;

    let held = book.snapshot();
    assert!(held.contains_transparent("bc1qold"));

    backend.force_status("p11", PaymentStatus::Confirmed);
    backend.add_payment(pending_payment("p12", Chain::Bitcoin, "bc1qnew"));
    book.replace(
        load_snapshot(
            Chain::Bitcoin,
            stores.payments.as_ref(),
            stores.viewing_keys.as_ref(),
        )
        .await
        .unwrap(),
    );

    // The reader that grabbed the old snapshot still sees a consistent view;
    // new readers see only the new set.
    assert!(held.contains_transparent("bc1qold"));
    let fresh = book.snapshot();
    assert!(!fresh.contains_transparent("bc1qold"));
    assert!(fresh.contains_transparent("bc1qnew"));
}
