//! Database module for Murmur Server
//!
//! A libSQL database holding conversations, participants, messages and
//! per-recipient delivery rows.
//!
//! Every query goes through one shared connection. An in-memory database is
//! private to the connection that opened it, so a second connection would see
//! an empty schema.

mod migrations;

use libsql::Connection;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument};

pub use migrations::MigrationRunner;

/// Database-specific errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Failed to connect to database: {0}")]
    ConnectionFailed(String),

    #[error("Database query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Internal database error: {0}")]
    Internal(#[from] libsql::Error),
}

/// Shared handle to a libsql database connection
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    name: String,
}

impl Database {
    /// Create a new in-memory database
    #[instrument(skip_all)]
    pub async fn in_memory(name: &str) -> Result<Self, DatabaseError> {
        debug!("Creating in-memory database: {}", name);
        let db = libsql::Builder::new_local(":memory:").build().await?;
        Self::from_libsql(name, db)
    }

    /// Create or open a local file-based database
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open_local(name: &str, path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        debug!("Opening local database '{}' at: {:?}", name, path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::ConnectionFailed(format!("Failed to create database directory: {}", e))
            })?;
        }

        let db = libsql::Builder::new_local(path).build().await?;
        let database = Self::from_libsql(name, db)?;
        info!("Opened database '{}' at {:?}", name, path);
        Ok(database)
    }

    fn from_libsql(name: &str, db: libsql::Database) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            name: name.to_string(),
        })
    }

    /// Get the database name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lock the shared connection.
    ///
    /// Hold the guard across every statement of a transaction.
    pub async fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    /// Check that the database answers a trivial query
    pub async fn health_check(&self) -> Result<bool, DatabaseError> {
        let conn = self.lock().await;
        let mut rows = conn
            .query("SELECT 1", ())
            .await
            .map_err(|e| DatabaseError::QueryFailed(e.to_string()))?;
        Ok(rows
            .next()
            .await
            .map_err(|e| DatabaseError::QueryFailed(e.to_string()))?
            .is_some())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("name", &self.name).finish()
    }
}
