//! Store access: connection helpers, embedded migrations, and the shared [`Db`] handle.
//!
//! - [`connection::connect_sqlite`] applies WAL, foreign_keys=ON, and a 5000ms busy_timeout.
//! - [`migrate::run_sqlite`] applies the embedded migrations.
//! - [`Db`] owns one connection behind a mutex so every store operation is atomic
//!   with respect to the tick path and the priority refresh task.
//!
//! Example:
//! ```no_run
//! use price_collector::db::Db;
//!
//! let db_path = std::env::temp_dir().join("price_collector_example.db");
//! let db = Db::open(db_path.to_str().unwrap()).expect("open store");
//! db.with_conn(|_conn| Ok(())).unwrap();
//! ```

pub mod connection;
pub mod migrate;

use std::{path::Path, sync::Mutex};

use anyhow::bail;
use diesel::{Connection, SqliteConnection};

/// Shared handle to the collector's SQLite store.
pub struct Db {
    conn: Mutex<SqliteConnection>,
}

impl Db {
    /// Applies migrations and opens a tuned connection to `database_url`.
    pub fn open(database_url: &str) -> anyhow::Result<Self> {
        migrate::run_sqlite(database_url)?;
        let conn = connection::connect_sqlite(database_url)?;
        Ok(Self::from_connection(conn))
    }

    /// Opens a store that already exists, without migrating it.
    ///
    /// Read-only commands use this so a status query never changes the schema
    /// or creates an empty database file.
    pub fn open_existing(database_url: &str) -> anyhow::Result<Self> {
        let path = connection::sqlite_path(database_url);
        if path != ":memory:" && !Path::new(path).exists() {
            bail!("no store at {path}; run `migrate` first");
        }
        let conn = connection::connect_sqlite(database_url)?;
        Ok(Self::from_connection(conn))
    }

    /// Wraps an existing connection; the caller is responsible for migrations.
    pub fn from_connection(conn: SqliteConnection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Runs `f` with exclusive access to the connection.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut SqliteConnection) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        // a panic elsewhere does not invalidate the connection itself
        let mut guard = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }

    /// Runs `f` inside a transaction; any error rolls it back.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&mut SqliteConnection) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        self.with_conn(|conn| conn.transaction(f))
    }
}
