//! Zcash-family RPC surface.
//!
//! Adds the transparent UTXO listing and the shielded `z_*` calls on top of
//! the shared surface. Shielded amounts come from the node's decrypted view
//! (`z_listreceivedbyaddress`), never from transaction outputs, which are
//! encrypted on chain.

use async_trait::async_trait;
use rust_decimal::Decimal;
use secrecy::SecretString;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::config::{RpcSection, ZcashSection};

use super::{Block, BlockInfo, BlockchainInfo, ChainRpc, RawTransaction, RpcClient, RpcError};

/// `maxconf` argument for an unbounded `listunspent`.
const MAX_CONF: u32 = 9_999_999;

/// The node-side view the Zcash monitor runs against.
#[async_trait]
pub(crate) trait ZcashChain: ChainRpc {
    /// Unspent outputs paying `addresses`, including unconfirmed ones when
    /// `min_conf` is 0.
    async fn list_unspent(&self, min_conf: u32, addresses: &[&str])
    -> Result<Vec<Unspent>, RpcError>;

    /// Everything the imported viewing key for `address` can see.
    async fn z_list_received_by_address(
        &self,
        address: &str,
        min_conf: u32,
    ) -> Result<Vec<ShieldedReceipt>, RpcError>;

    async fn z_validate_address(&self, address: &str) -> Result<bool, RpcError>;

    /// Imports a viewing key, rescanning from `start_height` per `rescan`.
    /// Re-importing a known key is a no-op on the node.
    async fn z_import_viewing_key(
        &self,
        key: &str,
        rescan: RescanPolicy,
        start_height: u64,
    ) -> Result<(), RpcError>;
}

/// The node's rescan behavior on viewing-key import.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RescanPolicy {
    Yes,
    No,
    WhenKeyIsNew,
}

impl RescanPolicy {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            RescanPolicy::Yes => "yes",
            RescanPolicy::No => "no",
            RescanPolicy::WhenKeyIsNew => "whenkeyisnew",
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct Unspent {
    pub(crate) txid: String,
    #[allow(dead_code)]
    pub(crate) vout: u32,
    #[serde(default)]
    pub(crate) address: Option<String>,
    #[serde(with = "rust_decimal::serde::arbitrary_precision")]
    pub(crate) amount: Decimal,
    pub(crate) confirmations: i64,
}

/// One entry of `z_listreceivedbyaddress`.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct ShieldedReceipt {
    pub(crate) txid: String,
    #[serde(with = "rust_decimal::serde::arbitrary_precision")]
    pub(crate) amount: Decimal,
    /// Hex-encoded memo field; decode with [`super::memo`].
    #[serde(default)]
    pub(crate) memo: Option<String>,
    #[serde(default)]
    pub(crate) confirmations: Option<i64>,
    #[allow(dead_code)]
    #[serde(default, rename = "outindex")]
    pub(crate) out_index: Option<u32>,
    /// Set on outputs the node recognizes as change back to the wallet.
    #[allow(dead_code)]
    #[serde(default)]
    pub(crate) change: bool,
}

/// JSON-RPC implementation of [`ZcashChain`].
pub(crate) struct ZcashRpcClient {
    inner: RpcClient,
}

impl ZcashRpcClient {
    pub(crate) fn new(section: &ZcashSection, options: &RpcSection) -> Result<Self, RpcError> {
        let password: SecretString = section.rpc_password.clone();
        Ok(Self {
            inner: RpcClient::new(&section.rpc_url, &section.rpc_user, password, options)?,
        })
    }
}

#[async_trait]
impl ChainRpc for ZcashRpcClient {
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
impl ZcashChain for ZcashRpcClient {
    async fn list_unspent(
        &self,
        min_conf: u32,
        addresses: &[&str],
    ) -> Result<Vec<Unspent>, RpcError> {
        self.inner
            .call("listunspent", json!([min_conf, MAX_CONF, addresses]))
            .await
    }

    async fn z_list_received_by_address(
        &self,
        address: &str,
        min_conf: u32,
    ) -> Result<Vec<ShieldedReceipt>, RpcError> {
        self.inner
            .call("z_listreceivedbyaddress", json!([address, min_conf]))
            .await
    }

    async fn z_validate_address(&self, address: &str) -> Result<bool, RpcError> {
        #[derive(Deserialize)]
        struct Validation {
            #[serde(rename = "isvalid")]
            is_valid: bool,
        }

        let validation: Validation = self
            .inner
            .call("z_validateaddress", json!([address]))
            .await?;
        Ok(validation.is_valid)
    }

    async fn z_import_viewing_key(
        &self,
        key: &str,
        rescan: RescanPolicy,
        start_height: u64,
    ) -> Result<(), RpcError> {
        let _: Value = self
            .inner
            .call(
                "z_importviewingkey",
                json!([key, rescan.as_str(), start_height]),
            )
            .await?;
        Ok(())
    }
}
