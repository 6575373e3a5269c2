//! Embedded schema migrations.

use anyhow::anyhow;
use diesel::{Connection, SqliteConnection, connection::SimpleConnection};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use tracing::info;

use super::connection::sqlite_path;

/// Embedded Diesel migrations bundled with this crate.
///
/// Applied by [`run_sqlite`] to bring the store schema up to date.
pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Runs pending migrations on an already open connection.
///
/// Returns the number of migrations applied.
pub fn run_on(conn: &mut SqliteConnection) -> anyhow::Result<usize> {
    let applied = conn.run_pending_migrations(MIGRATIONS).map_err(|e| anyhow!(e))?;
    Ok(applied.len())
}

/// Runs pending Diesel migrations on the SQLite database at `url`.
///
/// Sets the journal mode to WAL first. `url` may be a bare path or carry a
/// `sqlite:` scheme.
pub fn run_sqlite(url: &str) -> anyhow::Result<()> {
    let mut conn = SqliteConnection::establish(sqlite_path(url))?;
    conn.batch_execute("PRAGMA journal_mode=WAL;")?;
    let applied = run_on(&mut conn)?;
    if applied > 0 {
        info!(applied, "applied store migrations");
    }
    Ok(())
}
