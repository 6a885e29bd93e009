//! Test doubles for the monitor routines: an in-memory store backend and a
//! scripted chain that stands in for both node families.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rust_decimal::Decimal;
use secrecy::SecretString;
use serde_json::Value;
use time::OffsetDateTime;

use crate::model::{
    Chain, ChainTransaction, EventType, NewTransaction, Payment, PaymentStatus, ViewingKey,
};
use crate::store::{
    CursorStore, EventStore, PaymentStore, StoreError, StoreResult, Stores, TransactionStore,
    ViewingKeyStore,
};

use super::super::rpc::bitcoin::{BitcoinChain, MempoolEntry};
use super::super::rpc::zcash::{RescanPolicy, ShieldedReceipt, Unspent, ZcashChain};
use super::super::rpc::{
    Block, BlockInfo, BlockchainInfo, ChainRpc, RawTransaction, RpcError, ScriptPubKey, TxOut,
};

#[derive(Clone, Debug)]
pub(crate) struct RecordedEvent {
    pub(crate) payment_id: String,
    pub(crate) event_type: EventType,
    pub(crate) payload: Value,
}

#[derive(Default)]
struct MemoryState {
    payments: Vec<Payment>,
    transactions: Vec<ChainTransaction>,
    events: Vec<RecordedEvent>,
    cursors: HashMap<Chain, u64>,
    viewing_keys: HashMap<String, ViewingKey>,
}

/// One struct implementing every store contract, so a test can inspect all
/// persisted state in one place.
#[derive(Default)]
pub(crate) struct MemoryBackend {
    state: Mutex<MemoryState>,
    next_record: AtomicU64,
}

impl MemoryBackend {
    pub(crate) fn stores(backend: &Arc<MemoryBackend>) -> Stores {
        Stores {
            payments: backend.clone(),
            transactions: backend.clone(),
            events: backend.clone(),
            cursors: backend.clone(),
            viewing_keys: backend.clone(),
        }
    }

    pub(crate) fn add_payment(&self, payment: Payment) {
        self.state.lock().unwrap().payments.push(payment);
    }

    pub(crate) fn add_viewing_key(&self, address: &str, key: &str, birthday: Option<u64>) {
        self.state.lock().unwrap().viewing_keys.insert(
            address.into(),
            ViewingKey {
                key: SecretString::new(key.into()),
                birthday,
            },
        );
    }

    /// Overwrites a payment's status directly, simulating a collaborator's
    /// transition behind the monitor's back.
    pub(crate) fn force_status(&self, id: &str, status: PaymentStatus) {
        let mut state = self.state.lock().unwrap();
        let payment = state
            .payments
            .iter_mut()
            .find(|p| p.id == id)
            .expect("payment exists");
        payment.status = status;
    }

    pub(crate) fn payment(&self, id: &str) -> Payment {
        self.state
            .lock()
            .unwrap()
            .payments
            .iter()
            .find(|p| p.id == id)
            .expect("payment exists")
            .clone()
    }

    pub(crate) fn transactions(&self) -> Vec<ChainTransaction> {
        self.state.lock().unwrap().transactions.clone()
    }

    pub(crate) fn events(&self) -> Vec<RecordedEvent> {
        self.state.lock().unwrap().events.clone()
    }

    pub(crate) fn events_for(&self, payment_id: &str, event_type: EventType) -> Vec<RecordedEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.payment_id == payment_id && e.event_type == event_type)
            .collect()
    }
}

#[async_trait]
impl PaymentStore for MemoryBackend {
    async fn find_by_id(&self, id: &str) -> StoreResult<Option<Payment>> {
        let state = self.state.lock().unwrap();
        Ok(state.payments.iter().find(|p| p.id == id).cloned())
    }

    async fn find_by_address(&self, chain: Chain, address: &str) -> StoreResult<Option<Payment>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .payments
            .iter()
            .rev()
            .find(|p| p.chain == chain && p.address == address)
            .cloned())
    }

    async fn non_terminal_by_chain(&self, chain: Chain) -> StoreResult<Vec<Payment>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .payments
            .iter()
            .filter(|p| p.chain == chain && p.status.is_monitorable())
            .cloned()
            .collect())
    }

    async fn find_expired(&self, chain: Chain, now: OffsetDateTime) -> StoreResult<Vec<Payment>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .payments
            .iter()
            .filter(|p| {
                p.chain == chain && p.status == PaymentStatus::Pending && p.expires_at < now
            })
            .cloned()
            .collect())
    }

    async fn mark_detected(&self, id: &str, txid: &str, at: OffsetDateTime) -> StoreResult<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(payment) = state.payments.iter_mut().find(|p| p.id == id) else {
            return Ok(false);
        };
        if payment.status != PaymentStatus::Pending {
            return Ok(false);
        }
        payment.status = PaymentStatus::Detected;
        payment.txid = Some(txid.into());
        payment.detected_at = Some(at);
        Ok(true)
    }

    async fn mark_confirmed(&self, id: &str, at: OffsetDateTime) -> StoreResult<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(payment) = state.payments.iter_mut().find(|p| p.id == id) else {
            return Ok(false);
        };
        if payment.status != PaymentStatus::Detected {
            return Ok(false);
        }
        payment.status = PaymentStatus::Confirmed;
        payment.confirmed_at = Some(at);
        Ok(true)
    }

    async fn mark_expired(&self, id: &str) -> StoreResult<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(payment) = state.payments.iter_mut().find(|p| p.id == id) else {
            return Ok(false);
        };
        if payment.status != PaymentStatus::Pending {
            return Ok(false);
        }
        payment.status = PaymentStatus::Expired;
        Ok(true)
    }

    async fn reset_to_pending(&self, id: &str) -> StoreResult<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(payment) = state.payments.iter_mut().find(|p| p.id == id) else {
            return Ok(false);
        };
        if payment.status != PaymentStatus::Detected {
            return Ok(false);
        }
        payment.status = PaymentStatus::Pending;
        payment.txid = None;
        payment.detected_at = None;
        Ok(true)
    }

    async fn set_confirmations(&self, id: &str, confirmations: u32) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(payment) = state.payments.iter_mut().find(|p| p.id == id) {
            payment.confirmations = confirmations;
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionStore for MemoryBackend {
    async fn create(&self, tx: NewTransaction) -> StoreResult<ChainTransaction> {
        let mut state = self.state.lock().unwrap();
        if state
            .transactions
            .iter()
            .any(|t| t.chain == tx.chain && t.txid == tx.txid && t.address == tx.address)
        {
            return Err(StoreError::AlreadyExists);
        }

        let record = ChainTransaction {
            id: format!("rec-{}", self.next_record.fetch_add(1, Ordering::SeqCst)),
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
        state.transactions.push(record.clone());
        Ok(record)
    }

    async fn find_by_outpoint(
        &self,
        chain: Chain,
        txid: &str,
        address: &str,
    ) -> StoreResult<Option<ChainTransaction>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .transactions
            .iter()
            .find(|t| t.chain == chain && t.txid == txid && t.address == address)
            .cloned())
    }

    async fn find_by_txid(&self, chain: Chain, txid: &str) -> StoreResult<Vec<ChainTransaction>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .transactions
            .iter()
            .filter(|t| t.chain == chain && t.txid == txid)
            .cloned()
            .collect())
    }

    async fn find_unconfirmed(
        &self,
        chain: Chain,
        threshold: u32,
    ) -> StoreResult<Vec<ChainTransaction>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .transactions
            .iter()
            .filter(|t| {
                t.chain == chain
                    && (t.confirmations < i64::from(threshold) || t.confirmed_at.is_none())
            })
            .cloned()
            .collect())
    }

    async fn update_confirmations(
        &self,
        id: &str,
        confirmations: i64,
        block_hash: Option<&str>,
        block_height: Option<u64>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.transactions.iter_mut().find(|t| t.id == id) {
            record.confirmations = confirmations;
            record.block_hash = block_hash.map(str::to_owned);
            record.block_height = block_height;
        }
        Ok(())
    }

    async fn mark_confirmed(&self, id: &str, at: OffsetDateTime) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.transactions.iter_mut().find(|t| t.id == id) {
            if record.confirmed_at.is_none() {
                record.confirmed_at = Some(at);
            }
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        state.transactions.retain(|t| t.id != id);
        Ok(())
    }
}

#[async_trait]
impl EventStore for MemoryBackend {
    async fn create(
        &self,
        _merchant_id: &str,
        payment_id: &str,
        event_type: EventType,
        payload: Value,
    ) -> StoreResult<()> {
        self.state.lock().unwrap().events.push(RecordedEvent {
            payment_id: payment_id.into(),
            event_type,
            payload,
        });
        Ok(())
    }
}

#[async_trait]
impl CursorStore for MemoryBackend {
    async fn get(&self, chain: Chain) -> StoreResult<Option<u64>> {
        Ok(self.state.lock().unwrap().cursors.get(&chain).copied())
    }

    async fn advance(&self, chain: Chain, height: u64) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        let entry = state.cursors.entry(chain).or_insert(height);
        *entry = (*entry).max(height);
        Ok(())
    }
}

#[async_trait]
impl ViewingKeyStore for MemoryBackend {
    async fn viewing_key_for_address(&self, address: &str) -> StoreResult<Option<ViewingKey>> {
        Ok(self.state.lock().unwrap().viewing_keys.get(address).cloned())
    }
}

/// A viewing key import observed by the fake node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ImportedKey {
    pub(crate) key: String,
    pub(crate) rescan: RescanPolicy,
    pub(crate) start_height: u64,
}

#[derive(Default)]
struct FakeChainState {
    height: u64,
    /// Height → block; blocks store zero confirmations, computed at read.
    blocks: BTreeMap<u64, Block>,
    /// Txid → (transaction, mined height if any).
    transactions: HashMap<String, (RawTransaction, Option<u64>)>,
    /// Hex payload → decoded transaction.
    decodable: HashMap<String, RawTransaction>,
    unspent: HashMap<String, Vec<Unspent>>,
    shielded: HashMap<String, Vec<ShieldedReceipt>>,
    imports: Vec<ImportedKey>,
}

/// A scripted chain implementing both node surfaces.
#[derive(Default)]
pub(crate) struct FakeChain {
    state: Mutex<FakeChainState>,
    fail_imports: AtomicBool,
}

fn not_found() -> RpcError {
    RpcError::Node {
        code: -5,
        message: "No such mempool or blockchain transaction".into(),
    }
}

/// A one-output transaction paying `address`.
pub(crate) fn tx_paying(txid: &str, address: &str, amount: &str) -> RawTransaction {
    RawTransaction {
        txid: txid.into(),
        vout: vec![TxOut {
            value: amount.parse::<Decimal>().unwrap(),
            n: 0,
            script_pub_key: ScriptPubKey {
                address: Some(address.into()),
                addresses: None,
            },
        }],
        confirmations: None,
        blockhash: None,
    }
}

impl FakeChain {
    pub(crate) fn new(height: u64) -> Self {
        let chain = Self::default();
        chain.state.lock().unwrap().height = height;
        chain
    }

    pub(crate) fn height(&self) -> u64 {
        self.state.lock().unwrap().height
    }

    pub(crate) fn add_to_mempool(&self, tx: RawTransaction) {
        let mut state = self.state.lock().unwrap();
        state.transactions.insert(tx.txid.clone(), (tx, None));
    }

    pub(crate) fn add_decodable(&self, payload: &[u8], tx: RawTransaction) {
        let mut state = self.state.lock().unwrap();
        state.decodable.insert(hex::encode(payload), tx);
    }

    /// Mines a block containing `txs` (removing them from the mempool) and
    /// returns its height.
    pub(crate) fn mine_block(&self, txs: Vec<RawTransaction>) -> u64 {
        let mut state = self.state.lock().unwrap();
        let height = state.height + 1;
        state.height = height;
        let hash = format!("blk{height}");

        for tx in &txs {
            state
                .transactions
                .insert(tx.txid.clone(), (tx.clone(), Some(height)));
        }
        state.blocks.insert(
            height,
            Block {
                hash,
                height,
                confirmations: 0,
                tx: txs,
            },
        );
        height
    }

    pub(crate) fn mine_empty_blocks(&self, count: u64) {
        for _ in 0..count {
            self.mine_block(Vec::new());
        }
    }

    /// Makes the node forget a transaction entirely, as after a reorg that
    /// dropped it.
    pub(crate) fn vanish(&self, txid: &str) {
        let mut state = self.state.lock().unwrap();
        state.transactions.remove(txid);
        for block in state.blocks.values_mut() {
            block.tx.retain(|tx| tx.txid != txid);
        }
    }

    pub(crate) fn set_unspent(&self, address: &str, utxos: Vec<Unspent>) {
        self.state
            .lock()
            .unwrap()
            .unspent
            .insert(address.into(), utxos);
    }

    pub(crate) fn set_shielded_received(&self, address: &str, receipts: Vec<ShieldedReceipt>) {
        self.state
            .lock()
            .unwrap()
            .shielded
            .insert(address.into(), receipts);
    }

    pub(crate) fn set_fail_imports(&self, fail: bool) {
        self.fail_imports.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn imports(&self) -> Vec<ImportedKey> {
        self.state.lock().unwrap().imports.clone()
    }

    fn confirmations_at(tip: u64, mined: Option<u64>) -> Option<i64> {
        mined.map(|height| (tip - height + 1) as i64)
    }
}

#[async_trait]
impl ChainRpc for FakeChain {
    async fn block_count(&self) -> Result<u64, RpcError> {
        Ok(self.height())
    }

    async fn block_hash(&self, height: u64) -> Result<String, RpcError> {
        let state = self.state.lock().unwrap();
        state
            .blocks
            .get(&height)
            .map(|block| block.hash.clone())
            .ok_or(RpcError::Node {
                code: -8,
                message: "Block height out of range".into(),
            })
    }

    async fn block(&self, hash: &str) -> Result<Block, RpcError> {
        let state = self.state.lock().unwrap();
        let tip = state.height;
        state
            .blocks
            .values()
            .find(|block| block.hash == hash)
            .map(|block| {
                let mut block = block.clone();
                block.confirmations = (tip - block.height + 1) as i64;
                block
            })
            .ok_or(not_found())
    }

    async fn block_info(&self, hash: &str) -> Result<BlockInfo, RpcError> {
        let block = self.block(hash).await?;
        Ok(BlockInfo {
            hash: block.hash,
            height: block.height,
        })
    }

    async fn blockchain_info(&self) -> Result<BlockchainInfo, RpcError> {
        Ok(BlockchainInfo {
            chain: "regtest".into(),
            blocks: self.height(),
        })
    }

    async fn validate_address(&self, _address: &str) -> Result<bool, RpcError> {
        Ok(true)
    }

    async fn raw_transaction(&self, txid: &str) -> Result<RawTransaction, RpcError> {
        let state = self.state.lock().unwrap();
        let tip = state.height;
        let (tx, mined) = state.transactions.get(txid).ok_or(not_found())?;
        let mut tx = tx.clone();
        tx.confirmations = Self::confirmations_at(tip, *mined);
        tx.blockhash = mined.map(|height| format!("blk{height}"));
        Ok(tx)
    }

    async fn confirmations(&self, txid: &str) -> Result<i64, RpcError> {
        match self.raw_transaction(txid).await {
            Ok(tx) => Ok(tx.confirmations.unwrap_or(0)),
            Err(e) if e.is_not_found() => Ok(-1),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl BitcoinChain for FakeChain {
    async fn decode_raw_transaction(&self, hex: &str) -> Result<RawTransaction, RpcError> {
        let state = self.state.lock().unwrap();
        state
            .decodable
            .get(hex)
            .cloned()
            .ok_or_else(|| RpcError::Protocol("TX decode failed".into()))
    }

    async fn raw_mempool(&self) -> Result<Vec<String>, RpcError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .transactions
            .iter()
            .filter(|(_, (_, mined))| mined.is_none())
            .map(|(txid, _)| txid.clone())
            .collect())
    }

    async fn mempool_entry(&self, txid: &str) -> Result<Option<MempoolEntry>, RpcError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .transactions
            .get(txid)
            .filter(|(_, mined)| mined.is_none())
            .map(|_| MempoolEntry {
                time: None,
                height: None,
            }))
    }

    async fn is_in_mempool(&self, txid: &str) -> Result<bool, RpcError> {
        Ok(self.mempool_entry(txid).await?.is_some())
    }
}

#[async_trait]
impl ZcashChain for FakeChain {
    async fn list_unspent(
        &self,
        min_conf: u32,
        addresses: &[&str],
    ) -> Result<Vec<Unspent>, RpcError> {
        let state = self.state.lock().unwrap();
        Ok(addresses
            .iter()
            .flat_map(|address| state.unspent.get(*address).cloned().unwrap_or_default())
            .filter(|utxo| utxo.confirmations >= i64::from(min_conf))
            .collect())
    }

    async fn z_list_received_by_address(
        &self,
        address: &str,
        min_conf: u32,
    ) -> Result<Vec<ShieldedReceipt>, RpcError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .shielded
            .get(address)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|receipt| receipt.confirmations.unwrap_or(0) >= i64::from(min_conf))
            .collect())
    }

    async fn z_validate_address(&self, _address: &str) -> Result<bool, RpcError> {
        Ok(true)
    }

    async fn z_import_viewing_key(
        &self,
        key: &str,
        rescan: RescanPolicy,
        start_height: u64,
    ) -> Result<(), RpcError> {
        if self.fail_imports.load(Ordering::SeqCst) {
            return Err(RpcError::Transport("connection reset".into()));
        }
        self.state.lock().unwrap().imports.push(ImportedKey {
            key: key.into(),
            rescan,
            start_height,
        });
        Ok(())
    }
}
