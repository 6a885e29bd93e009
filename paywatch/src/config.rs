//! Paywatch Config
//!
//! Every tunable has a serde default so operators only write the sections
//! that differ from the defaults. A chain is monitored when its section is
//! present; an empty config starts nothing.

use std::path::PathBuf;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// Paywatch Configuration
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PaywatchConfig {
    /// Database settings.
    #[serde(default)]
    pub database: DatabaseSection,

    /// Bitcoin-family monitor settings. Absent means the monitor is disabled.
    pub bitcoin: Option<BitcoinSection>,

    /// Zcash-family monitor settings. Absent means the monitor is disabled.
    pub zcash: Option<ZcashSection>,

    /// Chain RPC transport settings, shared by both monitors.
    #[serde(default)]
    pub rpc: RpcSection,

    /// Event-stream subscriber settings (Bitcoin only).
    #[serde(default)]
    pub stream: StreamSection,

    /// Monitor scheduling settings, shared by both monitors.
    #[serde(default)]
    pub monitor: MonitorSection,
}

/// Default configuration settings.
impl Default for PaywatchConfig {
    fn default() -> Self {
        Self {
            database: DatabaseSection::default(),
            bitcoin: None,
            zcash: None,
            rpc: RpcSection::default(),
            stream: StreamSection::default(),
            monitor: MonitorSection::default(),
        }
    }
}

impl PaywatchConfig {
    /// Returns a commented example configuration.
    ///
    /// The output is a maintained literal rather than a serialization of the
    /// defaults, so it can carry comments; a test keeps it in sync with the
    /// config structure.
    pub fn generate_example() -> String {
        EXAMPLE_CONFIG.into()
    }
}

/// Database settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseSection {
    /// Path to the SQLite database shared with the payment platform.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

/// Bitcoin-family monitor settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BitcoinSection {
    /// URL of the node's JSON-RPC endpoint.
    pub rpc_url: String,

    /// RPC username.
    pub rpc_user: String,

    /// RPC password.
    #[serde(skip_serializing)]
    pub rpc_password: SecretString,

    /// ZMQ endpoint publishing `rawtx` and `hashblock` notifications.
    pub zmq_endpoint: String,

    /// Confirmations required before a payment is confirmed.
    #[serde(default = "default_confirmation_threshold")]
    pub confirmation_threshold: u32,

    /// Period of the reconciliation sweep, in milliseconds. The sweep is the
    /// correctness backstop for anything the event stream misses.
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,

    /// Period of the address-cache refresh, in milliseconds.
    #[serde(default = "default_address_refresh_ms")]
    pub address_refresh_ms: u64,
}

/// Zcash-family monitor settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ZcashSection {
    /// URL of the node's JSON-RPC endpoint.
    pub rpc_url: String,

    /// RPC username.
    pub rpc_user: String,

    /// RPC password.
    #[serde(skip_serializing)]
    pub rpc_password: SecretString,

    /// Confirmations required before a payment is confirmed.
    #[serde(default = "default_confirmation_threshold")]
    pub confirmation_threshold: u32,

    /// Polling period, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Period of the address-cache refresh, in milliseconds.
    #[serde(default = "default_address_refresh_ms")]
    pub address_refresh_ms: u64,
}

/// Chain RPC transport settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RpcSection {
    /// Attempts per call before the failure is surfaced.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial retry backoff, in milliseconds. Doubles per attempt.
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,

    /// Per-call timeout, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RpcSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_initial_ms: default_retry_initial_ms(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Event-stream subscriber settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StreamSection {
    /// Reconnection attempts before the stream reports itself degraded.
    /// Reconnection continues past this point; the monitor keeps running on
    /// its reconciliation sweep alone.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

/// Monitor scheduling settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorSection {
    /// Upper bound on blocks scanned by any one sweep.
    #[serde(default = "default_catch_up_max_blocks_per_tick")]
    pub catch_up_max_blocks_per_tick: u32,

    /// Grace period on shutdown before in-flight tasks are aborted, in
    /// milliseconds.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Rescan window used when importing a viewing key whose birthday is
    /// unknown, in blocks below the current tip.
    #[serde(default = "default_viewing_key_lookback_blocks")]
    pub viewing_key_lookback_blocks: u64,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            catch_up_max_blocks_per_tick: default_catch_up_max_blocks_per_tick(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            viewing_key_lookback_blocks: default_viewing_key_lookback_blocks(),
        }
    }
}

fn default_database_path() -> PathBuf {
    "paywatch.db".into()
}

fn default_confirmation_threshold() -> u32 {
    6
}

fn default_reconcile_interval_ms() -> u64 {
    10000
}

fn default_poll_interval_ms() -> u64 {
    15000
}

fn default_address_refresh_ms() -> u64 {
    60000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_initial_ms() -> u64 {
    1000
}

fn default_timeout_ms() -> u64 {
    30000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_catch_up_max_blocks_per_tick() -> u32 {
    500
}

fn default_shutdown_grace_ms() -> u64 {
    10000
}

fn default_viewing_key_lookback_blocks() -> u64 {
    10000
}

const EXAMPLE_CONFIG: &str = r#"# Paywatch example configuration.
#
# A chain is monitored when its section is present. Every commented-out
# setting shows its default.

[database]
# SQLite database shared with the payment platform.
path = "paywatch.db"

[bitcoin]
rpc_url = "http://127.0.0.1:8332"
rpc_user = "paywatch"
rpc_password = "change-me"
# bitcoind must be started with:
#   -zmqpubrawtx=tcp://127.0.0.1:28332 -zmqpubhashblock=tcp://127.0.0.1:28332
zmq_endpoint = "tcp://127.0.0.1:28332"
#confirmation_threshold = 6
#reconcile_interval_ms = 10000
#address_refresh_ms = 60000

[zcash]
rpc_url = "http://127.0.0.1:8232"
rpc_user = "paywatch"
rpc_password = "change-me"
#confirmation_threshold = 6
#poll_interval_ms = 15000
#address_refresh_ms = 60000

[rpc]
#max_retries = 3
#retry_initial_ms = 1000
#timeout_ms = 30000

[stream]
#max_reconnect_attempts = 10

[monitor]
#catch_up_max_blocks_per_tick = 500
#shutdown_grace_ms = 10000
#viewing_key_lookback_blocks = 10000
"#;
