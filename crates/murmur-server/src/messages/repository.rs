//! Message repository backed by libsql

use std::collections::BTreeSet;

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{params, Connection};
use murmur_relay::{
    ElGamalContent, Identity, MessageRecord, MessageStore, RecipientStatus, StoreError,
};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::types::{Conversation, HistoryEntry};
use crate::db::Database;

/// Repository for conversations, messages and recipient rows
#[derive(Debug, Clone)]
pub struct MessageRepository {
    db: Database,
}

fn store_error(context: &str, e: libsql::Error) -> StoreError {
    let message = format!("{context}: {e}");
    if message.contains("UNIQUE constraint failed") {
        StoreError::Conflict(message)
    } else {
        StoreError::Query(message)
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl MessageRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a conversation with the given participants
    #[instrument(skip(self, participants), fields(participants = participants.len()))]
    pub async fn create_conversation(
        &self,
        name: Option<&str>,
        participants: &[Identity],
    ) -> Result<Conversation, StoreError> {
        let participant_ids: Vec<Identity> = participants
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let id = Uuid::now_v7().to_string();

        let conn = self.db.lock().await;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| store_error("Failed to begin transaction", e))?;

        let inserted = async {
            tx.execute(
                "INSERT INTO conversations (id, name) VALUES (?1, ?2)",
                params![id.as_str(), name],
            )
            .await
            .map_err(|e| store_error("Failed to create conversation", e))?;

            for user in &participant_ids {
                tx.execute(
                    "INSERT INTO conversation_participants (conversation_id, user_id) VALUES (?1, ?2)",
                    params![id.as_str(), user.as_str()],
                )
                .await
                .map_err(|e| store_error("Failed to add participant", e))?;
            }
            Ok::<_, StoreError>(())
        }
        .await;

        if let Err(e) = inserted {
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "Rollback failed");
            }
            return Err(e);
        }
        tx.commit()
            .await
            .map_err(|e| store_error("Failed to commit conversation", e))?;

        debug!(conversation_id = %id, "Created conversation");
        Ok(Conversation {
            id,
            name: name.map(str::to_string),
            participant_ids,
        })
    }

    /// The most recent `limit` messages of a conversation as seen by
    /// `recipient`, oldest first
    #[instrument(skip(self), fields(recipient = %recipient))]
    pub async fn history(
        &self,
        conversation_id: &str,
        recipient: &Identity,
        limit: u32,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let conn = self.db.lock().await;
        let mut rows = conn
            .query(
                "SELECT m.id, m.conversation_id, m.sender_id, m.created_at,
                        r.content_a, r.content_b, r.content_p, r.status
                 FROM messages m
                 JOIN message_recipients r ON r.message_id = m.id
                 WHERE m.conversation_id = ?1 AND r.recipient_id = ?2
                 ORDER BY m.created_at DESC, m.id DESC
                 LIMIT ?3",
                params![conversation_id, recipient.as_str(), limit],
            )
            .await
            .map_err(|e| store_error("Failed to query history", e))?;

        let mut entries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| store_error("Failed to read history row", e))?
        {
            entries.push(row_to_entry(&row)?);
        }
        entries.reverse();
        Ok(entries)
    }

    async fn insert_message(conn: &Connection, record: &MessageRecord) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO messages (id, conversation_id, sender_id, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                record.id.as_str(),
                record.conversation_id.as_str(),
                record.sender_id.as_str(),
                timestamp(&record.created_at)
            ],
        )
        .await
        .map_err(|e| store_error("Failed to insert message", e))?;

        for (recipient, content) in &record.recipients {
            conn.execute(
                "INSERT INTO message_recipients (message_id, recipient_id, content_a, content_b, content_p, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.id.as_str(),
                    recipient.as_str(),
                    content.a.as_str(),
                    content.b.as_str(),
                    content.p.as_str(),
                    RecipientStatus::Sent.as_str()
                ],
            )
            .await
            .map_err(|e| store_error("Failed to insert recipient row", e))?;
        }
        Ok(())
    }
}

fn row_to_entry(row: &libsql::Row) -> Result<HistoryEntry, StoreError> {
    let column = |e: libsql::Error| store_error("Failed to decode history row", e);

    let created_at: String = row.get(3).map_err(column)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| StoreError::Query(format!("Invalid created_at '{created_at}': {e}")))?
        .with_timezone(&Utc);
    let status: String = row.get(7).map_err(column)?;

    Ok(HistoryEntry {
        id: row.get(0).map_err(column)?,
        conversation_id: row.get(1).map_err(column)?,
        sender_id: Identity::new(row.get::<String>(2).map_err(column)?),
        created_at,
        encrypted_content: ElGamalContent {
            a: row.get(4).map_err(column)?,
            b: row.get(5).map_err(column)?,
            p: row.get(6).map_err(column)?,
        },
        status: status.parse().map_err(StoreError::Query)?,
    })
}

impl MessageStore for MessageRepository {
    #[instrument(skip(self))]
    async fn conversation_members(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Vec<Identity>>, StoreError> {
        let conn = self.db.lock().await;

        let mut rows = conn
            .query(
                "SELECT 1 FROM conversations WHERE id = ?1",
                params![conversation_id],
            )
            .await
            .map_err(|e| store_error("Failed to look up conversation", e))?;
        if rows
            .next()
            .await
            .map_err(|e| store_error("Failed to look up conversation", e))?
            .is_none()
        {
            return Ok(None);
        }

        let mut rows = conn
            .query(
                "SELECT user_id FROM conversation_participants WHERE conversation_id = ?1 ORDER BY user_id",
                params![conversation_id],
            )
            .await
            .map_err(|e| store_error("Failed to query participants", e))?;

        let mut members = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| store_error("Failed to read participant row", e))?
        {
            let user: String = row
                .get(0)
                .map_err(|e| store_error("Failed to decode participant", e))?;
            members.push(Identity::new(user));
        }
        Ok(Some(members))
    }

    #[instrument(skip(self, record), fields(message_id = %record.id, conversation_id = %record.conversation_id))]
    async fn create_message(&self, record: &MessageRecord) -> Result<(), StoreError> {
        let conn = self.db.lock().await;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| store_error("Failed to begin transaction", e))?;

        if let Err(e) = Self::insert_message(&tx, record).await {
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "Rollback failed");
            }
            return Err(e);
        }
        tx.commit()
            .await
            .map_err(|e| store_error("Failed to commit message", e))?;

        debug!(recipients = record.recipients.len(), "Created message");
        Ok(())
    }

    #[instrument(skip(self), fields(recipient = %recipient_id))]
    async fn update_recipient_status(
        &self,
        message_id: &str,
        recipient_id: &Identity,
        status: RecipientStatus,
    ) -> Result<Option<Identity>, StoreError> {
        let conn = self.db.lock().await;

        let updated = conn
            .execute(
                "UPDATE message_recipients SET status = ?1, updated_at = ?2
                 WHERE message_id = ?3 AND recipient_id = ?4",
                params![
                    status.as_str(),
                    timestamp(&Utc::now()),
                    message_id,
                    recipient_id.as_str()
                ],
            )
            .await
            .map_err(|e| store_error("Failed to update recipient status", e))?;
        if updated == 0 {
            debug!("No recipient row matched");
            return Ok(None);
        }

        let mut rows = conn
            .query("SELECT sender_id FROM messages WHERE id = ?1", params![message_id])
            .await
            .map_err(|e| store_error("Failed to look up sender", e))?;
        match rows
            .next()
            .await
            .map_err(|e| store_error("Failed to look up sender", e))?
        {
            Some(row) => {
                let sender: String = row
                    .get(0)
                    .map_err(|e| store_error("Failed to decode sender", e))?;
                Ok(Some(Identity::new(sender)))
            }
            None => Ok(None),
        }
    }
}
