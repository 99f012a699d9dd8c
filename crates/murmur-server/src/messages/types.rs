//! Message domain types returned by the repository

use chrono::{DateTime, Utc};
use murmur_relay::{ElGamalContent, Identity, RecipientStatus};
use serde::{Deserialize, Serialize};

/// A conversation and its participants
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub name: Option<String>,
    pub participant_ids: Vec<Identity>,
}

/// One message as seen by a single recipient
///
/// Carries only that recipient's ciphertext and delivery status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: Identity,
    pub created_at: DateTime<Utc>,
    pub encrypted_content: ElGamalContent,
    pub status: RecipientStatus,
}
