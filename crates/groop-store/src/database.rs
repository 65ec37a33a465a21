//! Database connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees that
//! migrations are run before any other operation.
//!
//! Note: SQLCipher (encrypted SQLite) requires OpenSSL at build time. With the
//! default `sqlite-plain` feature the file is plain SQLite and relies on the
//! platform's app sandbox for at-rest protection of key material.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::migrations;

/// Wrapper around a [`rusqlite::Connection`].
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the default key database.
    ///
    /// The database file is placed in the platform-appropriate data directory:
    /// - Linux:   `~/.local/share/groop/keys.db`
    /// - macOS:   `~/Library/Application Support/app.groop.groop/keys.db`
    /// - Windows: `{FOLDERID_RoamingAppData}\groop\groop\data\keys.db`
    pub fn new() -> Result<Self> {
        let path = Self::default_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "opening key database");

        Self::open_at(&path)
    }

    /// Platform default location of the key database.
    pub fn default_path() -> Result<PathBuf> {
        let project_dirs =
            ProjectDirs::from("app", "groop", "groop").ok_or(StoreError::NoDataDir)?;
        Ok(project_dirs.data_dir().join("keys.db"))
    }

    /// Open (or create) a database at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // WAL is meaningless for in-memory databases, so only set it here.
        conn.pragma_update(None, "journal_mode", "WAL")?;

        Self::init(conn)
    }

    /// Open a private in-memory database. Nothing survives the handle.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;

        // Run schema migrations.
        migrations::run_migrations(&conn)?;

        Ok(Self { conn })
    }

    /// Return a reference to the underlying `rusqlite::Connection`.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Return a mutable reference to the underlying connection.
    ///
    /// Needed for transactions, which borrow the connection mutably.
    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn
            .path()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
    }
}
