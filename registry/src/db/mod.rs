//! Server record persistence
//!
//! Registered MCP servers live in one SQLite table, by default in
//! ~/.mcp-registry/registry.db. Process state is not stored here beyond the
//! `status` column the supervisor writes.

pub mod schema;
pub mod servers;

pub use servers::{
    ConnectionType, NewServer, ServerChanges, ServerFilter, ServerRecord, ServerStatistics,
    ServerStatus, UpdateOutcome,
};

use anyhow::{bail, Context, Result};
use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

/// Shared handle to the registry database
///
/// Clones share one connection. Every query holds the connection lock only
/// for its own statement, never across an `.await`.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open the registry database at its default location
    pub fn open() -> Result<Self> {
        let path = Self::default_path()?;
        Self::open_at(path)
    }

    /// Open or create a registry database at `path`
    ///
    /// Fails on a database written by a newer registry.
    pub fn open_at(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;

        tracing::info!("Registry database opened at {:?}", path);
        Ok(db)
    }

    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".mcp-registry").join("registry.db"))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        schema::create_tables(&conn)?;

        let version = schema::get_version(&conn)?;
        if version > schema::SCHEMA_VERSION {
            bail!(
                "Database schema version {} is newer than supported version {}",
                version,
                schema::SCHEMA_VERSION
            );
        }
        tracing::debug!(version, "Registry schema ready");
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("Database connection lock poisoned"))
    }
}
