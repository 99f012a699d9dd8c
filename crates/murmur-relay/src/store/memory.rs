use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;

use super::{MessageRecord, MessageStore};
use crate::error::StoreError;
use crate::types::{Identity, RecipientStatus};

#[derive(Default)]
struct Inner {
    conversations: HashMap<String, Vec<Identity>>,
    messages: HashMap<String, StoredMessage>,
}

struct StoredMessage {
    sender_id: Identity,
    statuses: HashMap<Identity, RecipientStatus>,
}

/// In-process store for tests and embedding without a database.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a conversation with the given members.
    pub async fn add_conversation(
        &self,
        conversation_id: impl Into<String>,
        members: impl IntoIterator<Item = Identity>,
    ) {
        let mut inner = self.inner.lock().await;
        inner
            .conversations
            .insert(conversation_id.into(), members.into_iter().collect());
    }

    /// Status of one recipient's row, if it exists.
    pub async fn recipient_status(
        &self,
        message_id: &str,
        recipient_id: &Identity,
    ) -> Option<RecipientStatus> {
        let inner = self.inner.lock().await;
        inner
            .messages
            .get(message_id)
            .and_then(|m| m.statuses.get(recipient_id).copied())
    }

    pub async fn message_count(&self) -> usize {
        self.inner.lock().await.messages.len()
    }

    /// Make every subsequent write fail with [`StoreError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store marked as failing".into()));
        }
        Ok(())
    }
}

impl MessageStore for MemoryStore {
    async fn conversation_members(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Vec<Identity>>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.conversations.get(conversation_id).cloned())
    }

    async fn create_message(&self, record: &MessageRecord) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        if inner.messages.contains_key(&record.id) {
            return Err(StoreError::Conflict(format!(
                "message {} already exists",
                record.id
            )));
        }
        let statuses = record
            .recipients
            .keys()
            .map(|id| (id.clone(), RecipientStatus::Sent))
            .collect();
        inner.messages.insert(
            record.id.clone(),
            StoredMessage {
                sender_id: record.sender_id.clone(),
                statuses,
            },
        );
        Ok(())
    }

    async fn update_recipient_status(
        &self,
        message_id: &str,
        recipient_id: &Identity,
        status: RecipientStatus,
    ) -> Result<Option<Identity>, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let Some(message) = inner.messages.get_mut(message_id) else {
            return Ok(None);
        };
        match message.statuses.get_mut(recipient_id) {
            Some(current) => {
                *current = status;
                Ok(Some(message.sender_id.clone()))
            }
            None => Ok(None),
        }
    }
}
