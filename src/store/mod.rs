//! # Event store
//!
//! SQLite-backed persistence for events, reconciler commit statuses and
//! users. Events carry a JSON blob payload plus denormalized columns so
//! the artifact filters run in SQL without parsing blobs.
//!
//! Only the `sqlite3` driver is implemented; requesting any other driver
//! is a startup error.

mod events;
mod gitops_commits;
mod users;

pub use events::ArtifactsQuery;

use anyhow::{Context, Result};
use r2d2_sqlite::SqliteConnectionManager;

pub type Pool = r2d2::Pool<SqliteConnectionManager>;
type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

#[derive(Clone)]
pub struct Store {
    pool: Pool,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    pub fn new(driver: &str, config: &str) -> Result<Store> {
        if driver != "sqlite3" {
            anyhow::bail!("unsupported database driver: {}", driver);
        }

        // An in-memory database exists per connection, so the pool must
        // not hand out more than one.
        let (manager, max_size) = if config == ":memory:" {
            (SqliteConnectionManager::memory(), 1)
        } else {
            (SqliteConnectionManager::file(config), 4)
        };
        let manager = manager
            .with_init(|conn| conn.busy_timeout(std::time::Duration::from_secs(5)));

        let pool = r2d2::Pool::builder()
            .max_size(max_size)
            .build(manager)
            .context("cannot open database")?;

        let store = Store { pool };
        store.migrate()?;
        Ok(store)
    }

    /// An in-memory store for tests.
    pub fn new_in_memory() -> Result<Store> {
        Store::new("sqlite3", ":memory:")
    }

    fn conn(&self) -> Result<PooledConnection> {
        self.pool.get().context("cannot get database connection")
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS users (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    login         TEXT UNIQUE NOT NULL,
    secret        TEXT NOT NULL,
    admin         INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS events (
    id            TEXT PRIMARY KEY,
    created       INTEGER NOT NULL,
    type          TEXT NOT NULL,
    blob          TEXT NOT NULL,
    status        TEXT NOT NULL,
    status_desc   TEXT NOT NULL DEFAULT '',
    repository    TEXT NOT NULL DEFAULT '',
    branch        TEXT NOT NULL DEFAULT '',
    event         TEXT,
    source_branch TEXT NOT NULL DEFAULT '',
    target_branch TEXT NOT NULL DEFAULT '',
    tag           TEXT NOT NULL DEFAULT '',
    sha           TEXT NOT NULL DEFAULT '',
    artifact_id   TEXT NOT NULL DEFAULT '',
    gitops_hashes TEXT NOT NULL DEFAULT '[]'
);
CREATE INDEX IF NOT EXISTS idx_events_status ON events (status);
CREATE INDEX IF NOT EXISTS idx_events_created ON events (created);
CREATE INDEX IF NOT EXISTS idx_events_artifact_id ON events (artifact_id);

CREATE TABLE IF NOT EXISTS gitops_commits (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    sha           TEXT UNIQUE NOT NULL,
    status        TEXT NOT NULL DEFAULT '',
    status_desc   TEXT NOT NULL DEFAULT ''
);
"#,
        )
        .context("cannot run migrations")?;
        Ok(())
    }
}
