use std::fmt;

use rusqlite::Connection;
use schemerz::Migrator;
use schemerz_rusqlite::{RusqliteAdapter, RusqliteMigration};

mod initial_setup;

const MIGRATIONS_TABLE: &str = "paywatch_schema_migrations";

/// Error type shared by all Paywatch migrations.
#[derive(Debug)]
pub(super) struct MigrationError(rusqlite::Error);

impl From<rusqlite::Error> for MigrationError {
    fn from(e: rusqlite::Error) -> Self {
        MigrationError(e)
    }
}

impl fmt::Display for MigrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for MigrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

fn all() -> impl Iterator<Item = Box<dyn RusqliteMigration<Error = MigrationError>>> {
    [
        // initial_setup
        Box::new(initial_setup::Migration) as _,
    ]
    .into_iter()
}

/// Brings the database structure up to date.
pub(super) fn apply(
    conn: &mut Connection,
) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let adapter =
        RusqliteAdapter::<'_, MigrationError>::new(conn, Some(MIGRATIONS_TABLE.to_string()));
    adapter.init()?;

    let mut migrator = Migrator::new(adapter);
    migrator.register_multiple(&mut all())?;
    migrator.up(None)?;
    Ok(())
}
