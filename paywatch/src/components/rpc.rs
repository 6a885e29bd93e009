//! JSON-RPC access to chain nodes.
//!
//! Both chain families speak bitcoind-style JSON-RPC over HTTP with basic
//! auth. [`RpcClient`] is the shared transport: strictly sequential request
//! ids, a per-call timeout, and capped exponential retry for transient
//! failures. Chain-specific surfaces live in [`bitcoin`] and [`zcash`] and
//! are exposed to the monitors as traits so tests can substitute a scripted
//! chain.
//!
//! Node responses are decoded into schema-checked DTOs at this boundary.
//! Monetary fields deserialize through `serde_json`'s arbitrary-precision
//! numbers into [`Decimal`], so the node's decimal text is preserved exactly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tracing::warn;

use crate::config::RpcSection;

pub(crate) mod bitcoin;
pub(crate) mod memo;
pub(crate) mod zcash;

/// `RPC_METHOD_NOT_FOUND`
const METHOD_NOT_FOUND: i64 = -32601;
/// `RPC_INVALID_PARAMS`
const INVALID_PARAMS: i64 = -32602;
/// `RPC_INVALID_PARAMETER`
const INVALID_PARAMETER: i64 = -8;
/// `RPC_INVALID_ADDRESS_OR_KEY`: unknown transaction, block, or address.
const INVALID_ADDRESS_OR_KEY: i64 = -5;

const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Failure surfaced by a chain RPC call.
#[derive(Clone, Debug)]
pub(crate) enum RpcError {
    /// The node could not be reached: connection refused, timeout, DNS.
    Transport(String),
    /// The node answered with something that is not a JSON-RPC response.
    Protocol(String),
    /// The node returned a structured error.
    Node { code: i64, message: String },
}

impl RpcError {
    /// Whether retrying the same call can ever succeed.
    pub(crate) fn is_terminal(&self) -> bool {
        matches!(
            self,
            RpcError::Node { code, .. } if matches!(
                *code,
                METHOD_NOT_FOUND | INVALID_PARAMS | INVALID_PARAMETER | INVALID_ADDRESS_OR_KEY
            )
        )
    }

    /// Whether the node reported the queried object as unknown. Callers
    /// treat this as "not yet observed", not as a failure.
    pub(crate) fn is_not_found(&self) -> bool {
        matches!(
            self,
            RpcError::Node {
                code: INVALID_ADDRESS_OR_KEY,
                ..
            }
        )
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcError::Transport(e) => write!(f, "transport failure: {e}"),
            RpcError::Protocol(e) => write!(f, "protocol failure: {e}"),
            RpcError::Node { code, message } => write!(f, "node error {code}: {message}"),
        }
    }
}

impl std::error::Error for RpcError {}

#[derive(Deserialize)]
struct Envelope {
    result: Option<Value>,
    error: Option<NodeError>,
}

#[derive(Deserialize)]
struct NodeError {
    code: i64,
    message: String,
}

/// Shared JSON-RPC transport.
pub(crate) struct RpcClient {
    http: reqwest::Client,
    url: String,
    user: String,
    password: SecretString,
    next_id: AtomicU64,
    max_attempts: u32,
    retry_initial: Duration,
}

impl RpcClient {
    pub(crate) fn new(
        url: &str,
        user: &str,
        password: SecretString,
        options: &RpcSection,
    ) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(options.timeout_ms))
            .build()
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            url: url.into(),
            user: user.into(),
            password,
            next_id: AtomicU64::new(0),
            max_attempts: options.max_retries.max(1),
            retry_initial: Duration::from_millis(options.retry_initial_ms),
        })
    }

    /// Performs a call, retrying transient failures with exponential backoff.
    ///
    /// Terminal node errors (unknown method, bad parameters, unknown
    /// transaction or block) are returned immediately: retrying cannot
    /// change the answer.
    pub(crate) async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, RpcError> {
        let mut backoff = self.retry_initial;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.call_once(method, &params).await {
                Ok(result) => {
                    return serde_json::from_value(result).map_err(|e| {
                        RpcError::Protocol(format!("unexpected result shape for {method}: {e}"))
                    });
                }
                Err(e) if e.is_terminal() || attempt >= self.max_attempts => return Err(e),
                Err(e) => {
                    warn!(method, attempt, error = %e, "chain RPC call failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                }
            }
        }
    }

    async fn call_once(&self, method: &str, params: &Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = json!({
            "jsonrpc": "1.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(&self.url)
            .basic_auth(&self.user, Some(self.password.expose_secret()))
            .json(&request)
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        // Nodes report structured errors with non-2xx statuses; prefer the
        // body's error object over the bare HTTP status whenever it parses.
        let envelope: Envelope = match serde_json::from_slice(&body) {
            Ok(envelope) => envelope,
            Err(e) if status.is_success() => {
                return Err(RpcError::Protocol(format!("malformed response body: {e}")));
            }
            Err(_) => return Err(RpcError::Protocol(format!("HTTP {status}"))),
        };

        if let Some(error) = envelope.error {
            return Err(RpcError::Node {
                code: error.code,
                message: error.message,
            });
        }

        Ok(envelope.result.unwrap_or(Value::Null))
    }

    pub(crate) async fn get_block_count(&self) -> Result<u64, RpcError> {
        self.call("getblockcount", json!([])).await
    }

    pub(crate) async fn get_block_hash(&self, height: u64) -> Result<String, RpcError> {
        self.call("getblockhash", json!([height])).await
    }

    /// Fetches a block with its transactions decoded (verbosity 2).
    pub(crate) async fn get_block(&self, hash: &str) -> Result<Block, RpcError> {
        self.call("getblock", json!([hash, 2])).await
    }

    /// Fetches block metadata only (verbosity 1).
    pub(crate) async fn get_block_info(&self, hash: &str) -> Result<BlockInfo, RpcError> {
        self.call("getblock", json!([hash, 1])).await
    }

    pub(crate) async fn get_blockchain_info(&self) -> Result<BlockchainInfo, RpcError> {
        self.call("getblockchaininfo", json!([])).await
    }

    pub(crate) async fn validate_address(&self, address: &str) -> Result<bool, RpcError> {
        let validation: AddressValidation = self.call("validateaddress", json!([address])).await?;
        Ok(validation.is_valid)
    }

    pub(crate) async fn get_raw_transaction(&self, txid: &str) -> Result<RawTransaction, RpcError> {
        self.call("getrawtransaction", json!([txid, 1])).await
    }

    /// Current confirmation count for `txid`: 0 while in the mempool, −1 if
    /// the node does not know the transaction.
    pub(crate) async fn get_confirmations(&self, txid: &str) -> Result<i64, RpcError> {
        match self.get_raw_transaction(txid).await {
            Ok(tx) => Ok(tx.confirmations.unwrap_or(0)),
            Err(e) if e.is_not_found() => Ok(-1),
            Err(e) => Err(e),
        }
    }
}

/// The RPC surface shared by both chain families.
#[async_trait]
pub(crate) trait ChainRpc: Send + Sync {
    async fn block_count(&self) -> Result<u64, RpcError>;

    async fn block_hash(&self, height: u64) -> Result<String, RpcError>;

    /// Block with decoded transactions.
    async fn block(&self, hash: &str) -> Result<Block, RpcError>;

    /// Block metadata only.
    async fn block_info(&self, hash: &str) -> Result<BlockInfo, RpcError>;

    async fn blockchain_info(&self) -> Result<BlockchainInfo, RpcError>;

    async fn validate_address(&self, address: &str) -> Result<bool, RpcError>;

    async fn raw_transaction(&self, txid: &str) -> Result<RawTransaction, RpcError>;

    /// 0 while in the mempool, −1 if the node does not know the transaction.
    async fn confirmations(&self, txid: &str) -> Result<i64, RpcError>;
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct BlockchainInfo {
    pub(crate) chain: String,
    pub(crate) blocks: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct BlockInfo {
    pub(crate) hash: String,
    pub(crate) height: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct Block {
    pub(crate) hash: String,
    pub(crate) height: u64,
    pub(crate) confirmations: i64,
    pub(crate) tx: Vec<RawTransaction>,
}

/// A decoded transaction, as returned by `getrawtransaction` verbose,
/// `decoderawtransaction`, and the entries of `getblock` verbosity 2.
///
/// The confirmation and block fields are absent in the decode-only and
/// in-mempool cases.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct RawTransaction {
    pub(crate) txid: String,
    #[serde(default)]
    pub(crate) vout: Vec<TxOut>,
    #[serde(default)]
    pub(crate) confirmations: Option<i64>,
    #[serde(default)]
    pub(crate) blockhash: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct TxOut {
    #[serde(with = "rust_decimal::serde::arbitrary_precision")]
    pub(crate) value: Decimal,
    pub(crate) n: u32,
    #[serde(rename = "scriptPubKey", default)]
    pub(crate) script_pub_key: ScriptPubKey,
}

/// Destination of an output. Newer bitcoind reports a single `address`;
/// zcashd and older nodes report an `addresses` list.
#[derive(Clone, Debug, Default, Deserialize)]
pub(crate) struct ScriptPubKey {
    #[serde(default)]
    pub(crate) address: Option<String>,
    #[serde(default)]
    pub(crate) addresses: Option<Vec<String>>,
}

impl ScriptPubKey {
    pub(crate) fn destinations(&self) -> impl Iterator<Item = &str> {
        self.address
            .as_deref()
            .into_iter()
            .chain(self.addresses.iter().flatten().map(String::as_str))
    }
}

#[derive(Deserialize)]
struct AddressValidation {
    #[serde(rename = "isvalid")]
    is_valid: bool,
}
