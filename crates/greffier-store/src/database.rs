//! Database connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] plus the process
//! master key, and guarantees that migrations run before any other
//! operation. Data keys are wrapped with the master key on their way into
//! SQLite and unwrapped on the way out; the raw key material never reaches
//! disk (see [`crate::keys`]).

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::migrations;

/// Wrapper around a [`rusqlite::Connection`] and the master key.
pub struct Database {
    conn: Connection,
    master_key: [u8; 32],
}

impl Database {
    /// Open (or create) the default application database.
    ///
    /// The database file is placed in the platform-appropriate data directory:
    /// - Linux:   `~/.local/share/greffier/greffier.db`
    /// - macOS:   `~/Library/Application Support/com.greffier.greffier/greffier.db`
    /// - Windows: `{FOLDERID_RoamingAppData}\greffier\greffier\data\greffier.db`
    pub fn new(master_key: &[u8; 32]) -> Result<Self> {
        let project_dirs =
            ProjectDirs::from("com", "greffier", "greffier").ok_or(StoreError::NoDataDir)?;

        let data_dir = project_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join("greffier.db");

        tracing::info!(path = %db_path.display(), "opening database");

        Self::open_at(&db_path, master_key)
    }

    /// Open (or create) a database at an explicit path.
    ///
    /// This is useful for tests and for embedding the store inside custom
    /// directory layouts.
    pub fn open_at(path: &Path, master_key: &[u8; 32]) -> Result<Self> {
        let conn = Connection::open(path)?;

        // Recommended SQLite settings.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        // Run schema migrations.
        migrations::run_migrations(&conn)?;

        Ok(Self {
            conn,
            master_key: *master_key,
        })
    }

    /// Return a reference to the underlying `rusqlite::Connection`.
    ///
    /// Callers should prefer the typed CRUD helpers, but direct access is
    /// occasionally needed for transactions or ad-hoc queries.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Return a mutable reference to the underlying connection.
    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub(crate) fn master_key(&self) -> &[u8; 32] {
        &self.master_key
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().map(PathBuf::from)
    }
}
