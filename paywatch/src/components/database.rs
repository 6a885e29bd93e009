//! SQLite persistence shared with the rest of the payment platform.
//!
//! The monitor is one of several processes over this database: the payment
//! service inserts payments, the delivery service drains events, and this
//! process advances payment state. The schema here is managed by
//! [`migrations`]; the store implementations in [`stores`] are the concrete
//! form of the contracts in [`crate::store`].

use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::{
    config::PaywatchConfig,
    error::{Error, ErrorKind},
    store::Stores,
};

mod connection;
pub(crate) use connection::DbExecutor;

mod migrations;
mod schema;
mod stores;


#[derive(Clone)]
pub(crate) struct Database {
    db: DbExecutor,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    pub(crate) async fn open(config: &PaywatchConfig) -> Result<Self, Error> {
        let path = &config.database.path;

        let db_exists = tokio::fs::try_exists(path)
            .await
            .map_err(|e| ErrorKind::Database.context(e))?;
        if db_exists {
            info!(path = %path.display(), "Applying latest database migrations");
        } else {
            info!(path = %path.display(), "Creating empty database");
        }

        let db = DbExecutor::open(path).map_err(|e| ErrorKind::Database.context(e))?;
        db.run_migrations()
            .await
            .map_err(|e| ErrorKind::Database.context(e))?;

        Ok(Self { db })
    }

    /// Store handles for the monitors.
    pub(crate) fn stores(&self) -> Stores {
        Stores {
            payments: Arc::new(stores::SqlitePaymentStore::new(self.db.clone())),
            transactions: Arc::new(stores::SqliteTransactionStore::new(self.db.clone())),
            events: Arc::new(stores::SqliteEventStore::new(self.db.clone())),
            cursors: Arc::new(stores::SqliteCursorStore::new(self.db.clone())),
            viewing_keys: Arc::new(stores::SqliteViewingKeyStore::new(self.db.clone())),
        }
    }
}
