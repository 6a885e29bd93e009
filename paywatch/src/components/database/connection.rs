use std::path::Path;
use std::sync::{Arc, RwLock};

use deadpool_sqlite::{Config, CreatePoolError, InteractError, Pool, Runtime};

use crate::store::StoreError;

/// Pooled access to the SQLite database.
///
/// Connection pools are thread-safe, but SQLite does not reliably follow the
/// busy handler under concurrent writers, so writes additionally hold a
/// process-wide lock. Reads share it.
#[derive(Clone)]
pub(crate) struct DbExecutor {
    pool: Pool,
    lock: Arc<RwLock<()>>,
}

impl DbExecutor {
    pub(super) fn open(path: &Path) -> Result<Self, CreatePoolError> {
        let pool = Config::new(path).create_pool(Runtime::Tokio1)?;
        Ok(Self {
            pool,
            lock: Arc::new(RwLock::new(())),
        })
    }

    pub(super) async fn run_migrations(&self) -> Result<(), StoreError> {
        let conn = self.pool.get().await.map_err(StoreError::backend)?;
        conn.interact(|conn| super::migrations::apply(conn))
            .await
            .map_err(interact_failed)?
            .map_err(StoreError::Backend)
    }

    /// Runs a read-only query on a pooled connection.
    pub(crate) async fn read<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let lock = self.lock.clone();
        let conn = self.pool.get().await.map_err(StoreError::backend)?;
        conn.interact(move |conn| {
            let _guard = lock.read().unwrap();
            f(conn)
        })
        .await
        .map_err(interact_failed)?
        .map_err(map_sqlite_error)
    }

    /// Runs a write on a pooled connection, serialized against all other
    /// writes.
    pub(crate) async fn write<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let lock = self.lock.clone();
        let conn = self.pool.get().await.map_err(StoreError::backend)?;
        conn.interact(move |conn| {
            let _guard = lock.write().unwrap();
            f(conn)
        })
        .await
        .map_err(interact_failed)?
        .map_err(map_sqlite_error)
    }
}

fn interact_failed(e: InteractError) -> StoreError {
    StoreError::Backend(e.to_string().into())
}

/// Uniqueness violations surface as [`StoreError::AlreadyExists`]; the only
/// constraint a monitor write can trip is the `(chain, txid, address)` index
/// on `chain_transactions`.
fn map_sqlite_error(e: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(code, _) = &e {
        if code.code == rusqlite::ErrorCode::ConstraintViolation {
            return StoreError::AlreadyExists;
        }
    }
    StoreError::backend(e)
}
