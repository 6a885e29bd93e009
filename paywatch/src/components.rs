//! Components of Paywatch.

pub(crate) mod database;
pub(crate) mod monitor;
pub(crate) mod rpc;
pub(crate) mod stream;

/// Handle to a named long-running task spawned with [`crate::spawn!`].
pub(crate) type TaskHandle = tokio::task::JoinHandle<Result<(), crate::error::Error>>;
