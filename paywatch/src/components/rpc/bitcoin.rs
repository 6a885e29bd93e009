//! Bitcoin-family RPC surface.

use async_trait::async_trait;
use secrecy::SecretString;
use serde::Deserialize;
use serde_json::json;

use crate::config::{BitcoinSection, RpcSection};

use super::{Block, BlockInfo, BlockchainInfo, ChainRpc, RawTransaction, RpcClient, RpcError};

/// The node-side view the Bitcoin monitor runs against.
#[async_trait]
pub(crate) trait BitcoinChain: ChainRpc {
    /// Decodes a raw transaction without requiring the node to know it.
    async fn decode_raw_transaction(&self, hex: &str) -> Result<RawTransaction, RpcError>;

    async fn raw_mempool(&self) -> Result<Vec<String>, RpcError>;

    /// `None` when the transaction is not in the mempool.
    async fn mempool_entry(&self, txid: &str) -> Result<Option<MempoolEntry>, RpcError>;

    async fn is_in_mempool(&self, txid: &str) -> Result<bool, RpcError>;
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct MempoolEntry {
    #[allow(dead_code)]
    #[serde(default)]
    pub(crate) time: Option<u64>,
    #[allow(dead_code)]
    #[serde(default)]
    pub(crate) height: Option<u64>,
}

/// JSON-RPC implementation of [`BitcoinChain`].
pub(crate) struct BitcoinRpcClient {
    inner: RpcClient,
}

impl BitcoinRpcClient {
    pub(crate) fn new(section: &BitcoinSection, options: &RpcSection) -> Result<Self, RpcError> {
        let password: SecretString = section.rpc_password.clone();
        Ok(Self {
            inner: RpcClient::new(&section.rpc_url, &section.rpc_user, password, options)?,
        })
    }
}

#[async_trait]
impl ChainRpc for BitcoinRpcClient {
    async fn block_count(&self) -> Result<u64, RpcError> {
        self.inner.get_block_count().await
    }

    async fn block_hash(&self, height: u64) -> Result<String, RpcError> {
        self.inner.get_block_hash(height).await
    }

    async fn block(&self, hash: &str) -> Result<Block, RpcError> {
        self.inner.get_block(hash).await
    }

    async fn block_info(&self, hash: &str) -> Result<BlockInfo, RpcError> {
        self.inner.get_block_info(hash).await
    }

    async fn blockchain_info(&self) -> Result<BlockchainInfo, RpcError> {
        self.inner.get_blockchain_info().await
    }

    async fn validate_address(&self, address: &str) -> Result<bool, RpcError> {
        self.inner.validate_address(address).await
    }

    async fn raw_transaction(&self, txid: &str) -> Result<RawTransaction, RpcError> {
        self.inner.get_raw_transaction(txid).await
    }

    async fn confirmations(&self, txid: &str) -> Result<i64, RpcError> {
        self.inner.get_confirmations(txid).await
    }
}

#[async_trait]
impl BitcoinChain for BitcoinRpcClient {
    async fn decode_raw_transaction(&self, hex: &str) -> Result<RawTransaction, RpcError> {
        self.inner.call("decoderawtransaction", json!([hex])).await
    }

    async fn raw_mempool(&self) -> Result<Vec<String>, RpcError> {
        self.inner.call("getrawmempool", json!([])).await
    }

    async fn mempool_entry(&self, txid: &str) -> Result<Option<MempoolEntry>, RpcError> {
        match self.inner.call("getmempoolentry", json!([txid])).await {
            Ok(entry) => Ok(Some(entry)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn is_in_mempool(&self, txid: &str) -> Result<bool, RpcError> {
        Ok(self.mempool_entry(txid).await?.is_some())
    }
}
