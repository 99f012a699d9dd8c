//! Database migration system for Murmur Server
//!
//! Migrations are embedded SQL applied in version order and recorded in a
//! `_migrations` table, so running them twice is a no-op.

use super::Database;
use super::DatabaseError;
use tracing::{debug, info, instrument};

/// Represents a single database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number (must be unique and incrementing)
    pub version: i64,
    /// Description of what this migration does
    pub description: &'static str,
    /// SQL to execute for the migration
    pub sql: &'static str,
}

/// Initial schema: conversations, participants, messages, recipient rows
pub const V0001_INITIAL_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    name TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS conversation_participants (
    conversation_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    joined_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (conversation_id, user_id),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_participants_user ON conversation_participants(user_id);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    sender_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_created
    ON messages(conversation_id, created_at);

-- One row per recipient: that recipient's ciphertext and delivery status
CREATE TABLE IF NOT EXISTS message_recipients (
    message_id TEXT NOT NULL,
    recipient_id TEXT NOT NULL,
    content_a TEXT NOT NULL,
    content_b TEXT NOT NULL,
    content_p TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'SENT'
        CHECK (status IN ('SENT', 'RECEIVED', 'READ')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (message_id, recipient_id),
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_recipients_recipient ON message_recipients(recipient_id);
"#;

/// All migrations, in order
pub fn all() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial conversation and message schema",
        sql: V0001_INITIAL_SCHEMA,
    }]
}

/// Migration runner for applying migrations to a database
pub struct MigrationRunner {
    migrations: Vec<Migration>,
}

impl Default for MigrationRunner {
    fn default() -> Self {
        Self::new(all())
    }
}

impl MigrationRunner {
    /// Create a new migration runner with the given migrations
    pub fn new(migrations: Vec<Migration>) -> Self {
        let mut sorted = migrations;
        sorted.sort_by_key(|m| m.version);
        Self { migrations: sorted }
    }

    /// Run all pending migrations on the database
    #[instrument(skip_all, fields(db_name = %db.name()))]
    pub async fn run(&self, db: &Database) -> Result<Vec<i64>, DatabaseError> {
        let conn = db.lock().await;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
            (),
        )
        .await
        .map_err(|e| DatabaseError::MigrationFailed(format!("Failed to create migrations table: {}", e)))?;

        let mut applied: Vec<i64> = Vec::new();
        let mut rows = conn
            .query("SELECT version FROM _migrations ORDER BY version", ())
            .await
            .map_err(|e| DatabaseError::MigrationFailed(format!("Failed to query migrations: {}", e)))?;

        while let Some(row) = rows.next().await.map_err(|e| {
            DatabaseError::MigrationFailed(format!("Failed to read migration row: {}", e))
        })? {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::MigrationFailed(format!("Failed to get version from row: {}", e))
            })?;
            applied.push(version);
        }

        debug!("Already applied migrations: {:?}", applied);

        let mut newly_applied = Vec::new();
        for migration in &self.migrations {
            if applied.contains(&migration.version) {
                continue;
            }

            info!(
                "Applying migration v{}: {}",
                migration.version, migration.description
            );

            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::MigrationFailed(format!(
                    "Migration v{} failed: {}",
                    migration.version, e
                ))
            })?;

            conn.execute(
                "INSERT INTO _migrations (version, description) VALUES (?, ?)",
                (migration.version, migration.description),
            )
            .await
            .map_err(|e| {
                DatabaseError::MigrationFailed(format!(
                    "Failed to record migration v{}: {}",
                    migration.version, e
                ))
            })?;

            newly_applied.push(migration.version);
        }

        if newly_applied.is_empty() {
            debug!("No new migrations to apply");
        } else {
            info!("Applied {} new migrations", newly_applied.len());
        }

        Ok(newly_applied)
    }

    /// Get the current schema version
    #[instrument(skip_all, fields(db_name = %db.name()))]
    pub async fn current_version(&self, db: &Database) -> Result<Option<i64>, DatabaseError> {
        let conn = db.lock().await;
        let mut rows = conn
            .query(
                "SELECT name FROM sqlite_master WHERE type='table' AND name='_migrations'",
                (),
            )
            .await
            .map_err(|e| DatabaseError::QueryFailed(format!("Failed to check migrations table: {}", e)))?;

        if rows
            .next()
            .await
            .map_err(|e| DatabaseError::QueryFailed(format!("Failed to read result: {}", e)))?
            .is_none()
        {
            return Ok(None);
        }

        let mut rows = conn
            .query("SELECT MAX(version) FROM _migrations", ())
            .await
            .map_err(|e| DatabaseError::QueryFailed(format!("Failed to query max version: {}", e)))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::QueryFailed(format!("Failed to read max version: {}", e)))?
        {
            Some(row) => Ok(row.get::<i64>(0).ok()),
            None => Ok(None),
        }
    }

    /// Check if there are pending migrations
    pub async fn has_pending(&self, db: &Database) -> Result<bool, DatabaseError> {
        let current = self.current_version(db).await?.unwrap_or(0);
        let latest = self.migrations.last().map(|m| m.version).unwrap_or(0);
        Ok(current < latest)
    }
}
