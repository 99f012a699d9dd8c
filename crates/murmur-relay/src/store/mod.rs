//! Persistence collaborator interface.
//!
//! The relay never talks to a database directly. The host supplies an
//! implementation of [`MessageStore`] (murmur-server uses libsql); tests use
//! [`MemoryStore`].

mod memory;

pub use memory::MemoryStore;

use std::collections::BTreeMap;
use std::future::Future;

use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::types::{ElGamalContent, Identity, RecipientStatus};

/// A message ready to be written, with one encrypted copy per recipient.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: Identity,
    pub created_at: DateTime<Utc>,
    pub recipients: BTreeMap<Identity, ElGamalContent>,
}

impl MessageRecord {
    /// Build a record with a fresh time-ordered id.
    pub fn new(
        conversation_id: impl Into<String>,
        sender_id: Identity,
        recipients: BTreeMap<Identity, ElGamalContent>,
    ) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            conversation_id: conversation_id.into(),
            sender_id,
            created_at: Utc::now(),
            recipients,
        }
    }
}

/// Conversation and message repository.
pub trait MessageStore: Send + Sync + 'static {
    /// Current members of a conversation, or `None` if it does not exist.
    fn conversation_members(
        &self,
        conversation_id: &str,
    ) -> impl Future<Output = Result<Option<Vec<Identity>>, StoreError>> + Send;

    /// Persist the message and every recipient row with status `SENT`.
    ///
    /// Implementations must write all rows or none.
    fn create_message(
        &self,
        record: &MessageRecord,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Set the status of the row owned by `recipient_id`.
    ///
    /// Returns the message's original sender, or `None` when no row matched
    /// both the message and the recipient.
    fn update_recipient_status(
        &self,
        message_id: &str,
        recipient_id: &Identity,
        status: RecipientStatus,
    ) -> impl Future<Output = Result<Option<Identity>, StoreError>> + Send;
}
