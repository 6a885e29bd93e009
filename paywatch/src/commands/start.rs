//! `start` subcommand

use std::sync::Arc;
use std::time::Duration;

use abscissa_core::{FrameworkError, Runnable, Shutdown, config};
use futures::future::{join_all, select_all};
use tokio::sync::watch;

use crate::{
    cli::StartCmd,
    components::{
        TaskHandle,
        database::Database,
        monitor::{bitcoin::BitcoinMonitor, zcash::ZcashMonitor},
        rpc::{bitcoin::BitcoinRpcClient, zcash::ZcashRpcClient},
    },
    config::PaywatchConfig,
    error::{Error, ErrorKind},
    prelude::*,
};

impl StartCmd {
    async fn start(&self) -> Result<(), Error> {
        let config = APP.config();

        let db = Database::open(&config).await?;
        let stores = db.stores();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut names: Vec<&'static str> = Vec::new();
        let mut handles: Vec<TaskHandle> = Vec::new();

        if let Some(section) = &config.bitcoin {
            let rpc = Arc::new(
                BitcoinRpcClient::new(section, &config.rpc)
                    .map_err(|e| ErrorKind::Rpc.context(e))?,
            );
            let (stream, intake, reconcile, refresh) =
                BitcoinMonitor::spawn(&config, rpc, stores.clone(), shutdown_rx.clone()).await?;
            names.extend([
                "bitcoin event stream",
                "bitcoin intake",
                "bitcoin reconciliation",
                "bitcoin address refresh",
            ]);
            handles.extend([stream, intake, reconcile, refresh]);
        }

        if let Some(section) = &config.zcash {
            let rpc = Arc::new(
                ZcashRpcClient::new(section, &config.rpc)
                    .map_err(|e| ErrorKind::Rpc.context(e))?,
            );
            let (poll, refresh) =
                ZcashMonitor::spawn(&config, rpc, stores.clone(), shutdown_rx.clone()).await?;
            names.extend(["zcash poll", "zcash address refresh"]);
            handles.extend([poll, refresh]);
        }

        if handles.is_empty() {
            return Err(ErrorKind::Config
                .context("no chains configured; add a [bitcoin] or [zcash] section")
                .into());
        }

        info!("Spawned paywatch tasks");

        // Wait for an interrupt or for any task to exit.
        let mut tasks = select_all(handles);
        let finished = tokio::select! {
            _ = tokio::signal::ctrl_c() => None,
            finished = &mut tasks => Some(finished),
        };

        let mut remaining = match finished {
            Some((result, index, remaining)) => {
                info!(task = names[index], ?result, "Task exited; shutting down");
                remaining
            }
            None => {
                info!("Interrupt received; shutting down");
                tasks.into_inner()
            }
        };

        // Ask the remaining tasks to stop, give them the grace period, then
        // cut the stragglers loose.
        let _ = shutdown_tx.send(true);
        let grace = Duration::from_millis(config.monitor.shutdown_grace_ms);
        if tokio::time::timeout(grace, join_all(remaining.iter_mut()))
            .await
            .is_err()
        {
            warn!("Tasks did not stop within the grace period; aborting them");
            for task in &remaining {
                task.abort();
            }
        }

        Ok(())
    }
}

impl Runnable for StartCmd {
    fn run(&self) {
        match abscissa_tokio::run(&APP, self.start()) {
            Ok(Ok(())) => (),
            Ok(Err(e)) => {
                eprintln!("{}", e);
                APP.shutdown_with_exitcode(Shutdown::Forced, 1);
            }
            Err(e) => {
                eprintln!("{}", e);
                APP.shutdown_with_exitcode(Shutdown::Forced, 1);
            }
        }
    }
}

impl config::Override<PaywatchConfig> for StartCmd {
    fn override_config(&self, config: PaywatchConfig) -> Result<PaywatchConfig, FrameworkError> {
        Ok(config)
    }
}
