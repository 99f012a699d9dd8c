//! Message router.
//!
//! Turns decoded client envelopes into persistence writes and fan-out
//! requests. The router never touches the registry directly; it only sends
//! [`FanoutRequest`]s through the [`HubHandle`].

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use tracing::{debug, error, instrument, warn};

use crate::envelope::{
    Ack, DeliveredMessage, Envelope, EnvelopeType, FanoutRequest, IncomingMessage, StatusChange,
    StatusUpdate,
};
use crate::error::RelayError;
use crate::registry::{HubHandle, SendResult};
use crate::store::{MessageRecord, MessageStore};
use crate::types::Identity;

/// Consumer of envelopes arriving on an authenticated connection.
///
/// `auth`, `ping` and `pong` are handled by the connection itself and never
/// reach the handler. The returned envelope, if any, and any reported error
/// are queued back to the originating connection only. The queue is never
/// waited on: when it is full or closed the reply is dropped and counted in
/// `relay.replies.dropped`.
pub trait EnvelopeHandler: Send + Sync + 'static {
    fn handle(
        &self,
        origin: &Identity,
        envelope: Envelope,
    ) -> impl Future<Output = Result<Option<Envelope>, RelayError>> + Send;
}

/// Routes `message` and `message_status` envelopes.
pub struct MessageRouter<S> {
    store: Arc<S>,
    hub: HubHandle,
}

impl<S: MessageStore> MessageRouter<S> {
    pub fn new(store: Arc<S>, hub: HubHandle) -> Self {
        Self { store, hub }
    }

    /// Validate, persist and fan out a new message.
    ///
    /// The content map must have exactly one entry per current member and
    /// the sender must be a member. Every member, including the sender,
    /// receives the `message` envelope followed by a `conversation_update`.
    #[instrument(skip(self, message), fields(identity = %origin, conversation_id = %message.conversation_id))]
    pub async fn route_message(
        &self,
        origin: &Identity,
        message: IncomingMessage,
    ) -> Result<Ack, RelayError> {
        let members = self
            .store
            .conversation_members(&message.conversation_id)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to load conversation members");
                RelayError::Persistence(e)
            })?
            .ok_or_else(|| RelayError::ConversationNotFound(message.conversation_id.clone()))?;

        let members: BTreeSet<Identity> = members.into_iter().collect();
        if !members.contains(origin) {
            warn!("Sender is not a participant");
            return Err(RelayError::Forbidden(format!(
                "{origin} is not a participant of {}",
                message.conversation_id
            )));
        }

        let keys: BTreeSet<&Identity> = message.encrypted_contents.keys().collect();
        let missing: Vec<Identity> = members.iter().filter(|m| !keys.contains(m)).cloned().collect();
        let unexpected: Vec<Identity> = keys
            .iter()
            .filter(|k| !members.contains(**k))
            .map(|k| (*k).clone())
            .collect();
        if !missing.is_empty() || !unexpected.is_empty() {
            warn!(?missing, ?unexpected, "Recipient set does not match membership");
            return Err(RelayError::RecipientMismatch {
                missing,
                unexpected,
            });
        }

        let record = MessageRecord::new(
            message.conversation_id,
            origin.clone(),
            message.encrypted_contents,
        );
        self.store.create_message(&record).await.map_err(|e| {
            error!(message_id = %record.id, error = %e, "Failed to persist message");
            RelayError::Persistence(e)
        })?;
        debug!(message_id = %record.id, recipients = record.recipients.len(), "Message persisted");

        let message_id = record.id.clone();
        let delivered = DeliveredMessage {
            id: record.id,
            conversation_id: record.conversation_id,
            sender_id: record.sender_id,
            created_at: record.created_at,
            encrypted_contents: record.recipients,
        };
        let envelope = Envelope::new(EnvelopeType::Message, &delivered)?;
        self.publish(FanoutRequest::new(&envelope, members.iter().cloned())?)
            .await;

        let update = Envelope::empty(EnvelopeType::ConversationUpdate);
        self.publish(FanoutRequest::new(&update, members.into_iter())?)
            .await;

        Ok(Ack::received(message_id))
    }

    /// Update the caller's own recipient row and notify the original sender.
    #[instrument(skip(self, change), fields(identity = %origin, message_id = %change.message_id, status = %change.status))]
    pub async fn route_status(
        &self,
        origin: &Identity,
        change: StatusChange,
    ) -> Result<(), RelayError> {
        if !change.status.is_client_settable() {
            warn!("Rejected status transition");
            return Err(RelayError::InvalidStatus(change.status));
        }

        let sender = self
            .store
            .update_recipient_status(&change.message_id, origin, change.status)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to update recipient status");
                RelayError::Persistence(e)
            })?
            .ok_or_else(|| RelayError::MessageNotFound {
                message_id: change.message_id.clone(),
            })?;
        debug!(sender = %sender, "Recipient status updated");

        let update = StatusUpdate {
            message_id: change.message_id,
            status: change.status,
            user_id: origin.clone(),
        };
        let envelope = Envelope::new(EnvelopeType::StatusUpdate, &update)?;
        self.publish(FanoutRequest::new(&envelope, [sender])?).await;
        Ok(())
    }

    /// Fan out and wait until the hub has queued the frame for every live
    /// recipient, so replies to the originator are ordered after it.
    ///
    /// Persisted state is already committed; a stopped hub only costs
    /// real-time delivery.
    async fn publish(&self, request: FanoutRequest) {
        let kind = request.kind;
        match self.hub.deliver(request).await {
            Ok(report) => {
                let offline = report.with_outcome(SendResult::Offline);
                let dropped = report.with_outcome(SendResult::Dropped);
                if !offline.is_empty() || !dropped.is_empty() {
                    debug!(kind = kind.as_str(), ?offline, ?dropped, "Not delivered in real time");
                }
            }
            Err(e) => warn!(kind = kind.as_str(), error = %e, "Fan-out not queued"),
        }
    }
}

impl<S: MessageStore> EnvelopeHandler for MessageRouter<S> {
    async fn handle(
        &self,
        origin: &Identity,
        envelope: Envelope,
    ) -> Result<Option<Envelope>, RelayError> {
        match envelope.kind {
            EnvelopeType::Message => {
                let message: IncomingMessage = envelope.payload_as()?;
                let ack = self.route_message(origin, message).await?;
                Ok(Some(Envelope::new(EnvelopeType::Ack, &ack)?))
            }
            EnvelopeType::MessageStatus => {
                let change: StatusChange = envelope.payload_as()?;
                self.route_status(origin, change).await?;
                Ok(None)
            }
            other => Err(RelayError::protocol(format!(
                "unexpected {} envelope from client",
                other.as_str()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::registry::{ConnectionHandle, Hub};
    use crate::store::MemoryStore;
    use crate::types::{ElGamalContent, RecipientStatus};
    use std::collections::BTreeMap;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        router: MessageRouter<MemoryStore>,
        store: Arc<MemoryStore>,
        hub: HubHandle,
    }

    async fn fixture() -> Fixture {
        let (hub, _task) = Hub::spawn(&RelayConfig::default(), CancellationToken::new());
        let store = Arc::new(MemoryStore::new());
        store
            .add_conversation("c1", [Identity::new("alice"), Identity::new("bob")])
            .await;
        Fixture {
            router: MessageRouter::new(store.clone(), hub.clone()),
            store,
            hub,
        }
    }

    async fn connect(hub: &HubHandle, name: &str) -> mpsc::Receiver<Arc<str>> {
        let (handle, rx) = ConnectionHandle::new(Identity::new(name), 16);
        hub.register(handle).await.unwrap();
        rx
    }

    fn contents(names: &[&str]) -> BTreeMap<Identity, ElGamalContent> {
        names
            .iter()
            .map(|n| {
                (
                    Identity::from(*n),
                    ElGamalContent {
                        a: format!("{n}-a"),
                        b: "2".into(),
                        p: "7".into(),
                    },
                )
            })
            .collect()
    }

    fn incoming(names: &[&str]) -> IncomingMessage {
        IncomingMessage {
            conversation_id: "c1".into(),
            encrypted_contents: contents(names),
        }
    }

    async fn recv(rx: &mut mpsc::Receiver<Arc<str>>) -> Envelope {
        Envelope::decode(&rx.recv().await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_message_reaches_all_members() {
        let f = fixture().await;
        let mut alice = connect(&f.hub, "alice").await;
        let mut bob = connect(&f.hub, "bob").await;

        let ack = f
            .router
            .route_message(&Identity::new("alice"), incoming(&["alice", "bob"]))
            .await
            .unwrap();
        assert_eq!(ack.status, "received");

        for rx in [&mut alice, &mut bob] {
            let msg = recv(rx).await;
            assert_eq!(msg.kind, EnvelopeType::Message);
            let delivered: DeliveredMessage = msg.payload_as().unwrap();
            assert_eq!(delivered.id, ack.message_id);
            assert_eq!(delivered.sender_id, Identity::new("alice"));
            assert_eq!(recv(rx).await.kind, EnvelopeType::ConversationUpdate);
        }
        assert_eq!(f.store.message_count().await, 1);
    }

    #[tokio::test]
    async fn test_missing_member_is_rejected() {
        let f = fixture().await;
        let err = f
            .router
            .route_message(&Identity::new("alice"), incoming(&["alice"]))
            .await
            .unwrap_err();

        match err {
            RelayError::RecipientMismatch { missing, unexpected } => {
                assert_eq!(missing, vec![Identity::new("bob")]);
                assert!(unexpected.is_empty());
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(f.store.message_count().await, 0);
    }

    #[tokio::test]
    async fn test_extra_recipient_is_rejected() {
        let f = fixture().await;
        let err = f
            .router
            .route_message(&Identity::new("alice"), incoming(&["alice", "bob", "eve"]))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::RecipientMismatch { .. }));
        assert_eq!(f.store.message_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_conversation() {
        let f = fixture().await;
        let message = IncomingMessage {
            conversation_id: "nope".into(),
            encrypted_contents: contents(&["alice"]),
        };
        let err = f
            .router
            .route_message(&Identity::new("alice"), message)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::ConversationNotFound(_)));
    }

    #[tokio::test]
    async fn test_non_member_sender_is_forbidden() {
        let f = fixture().await;
        let err = f
            .router
            .route_message(&Identity::new("mallory"), incoming(&["alice", "bob"]))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Forbidden(_)));
        assert_eq!(f.store.message_count().await, 0);
    }

    #[tokio::test]
    async fn test_persistence_failure_sends_nothing() {
        let f = fixture().await;
        let mut bob = connect(&f.hub, "bob").await;
        f.store.set_failing(true);

        let err = f
            .router
            .route_message(&Identity::new("alice"), incoming(&["alice", "bob"]))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Persistence(_)));

        f.hub.connection_count().await.unwrap();
        assert!(bob.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_status_update_goes_only_to_sender() {
        let f = fixture().await;
        let mut alice = connect(&f.hub, "alice").await;
        let mut bob = connect(&f.hub, "bob").await;

        let ack = f
            .router
            .route_message(&Identity::new("alice"), incoming(&["alice", "bob"]))
            .await
            .unwrap();
        for rx in [&mut alice, &mut bob] {
            recv(rx).await;
            recv(rx).await;
        }

        f.router
            .route_status(
                &Identity::new("bob"),
                StatusChange {
                    message_id: ack.message_id.clone(),
                    status: RecipientStatus::Read,
                },
            )
            .await
            .unwrap();

        let update = recv(&mut alice).await;
        assert_eq!(update.kind, EnvelopeType::StatusUpdate);
        let payload: StatusUpdate = update.payload_as().unwrap();
        assert_eq!(payload.user_id, Identity::new("bob"));
        assert_eq!(payload.status, RecipientStatus::Read);

        f.hub.connection_count().await.unwrap();
        assert!(bob.try_recv().is_err());
        assert_eq!(
            f.store.recipient_status(&ack.message_id, &Identity::new("bob")).await,
            Some(RecipientStatus::Read)
        );
    }

    #[tokio::test]
    async fn test_status_on_foreign_row_is_not_found() {
        let f = fixture().await;
        let ack = f
            .router
            .route_message(&Identity::new("alice"), incoming(&["alice", "bob"]))
            .await
            .unwrap();

        let err = f
            .router
            .route_status(
                &Identity::new("mallory"),
                StatusChange {
                    message_id: ack.message_id.clone(),
                    status: RecipientStatus::Read,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::MessageNotFound { .. }));
        assert_eq!(
            f.store.recipient_status(&ack.message_id, &Identity::new("bob")).await,
            Some(RecipientStatus::Sent)
        );
    }

    #[tokio::test]
    async fn test_sent_status_is_not_client_settable() {
        let f = fixture().await;
        let err = f
            .router
            .route_status(
                &Identity::new("bob"),
                StatusChange {
                    message_id: "m1".into(),
                    status: RecipientStatus::Sent,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidStatus(RecipientStatus::Sent)));
    }

    #[tokio::test]
    async fn test_handle_dispatches_by_type() {
        let f = fixture().await;
        let envelope = Envelope::new(EnvelopeType::Message, &incoming(&["alice", "bob"])).unwrap();

        let reply = f
            .router
            .handle(&Identity::new("alice"), envelope)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.kind, EnvelopeType::Ack);

        let err = f
            .router
            .handle(&Identity::new("alice"), Envelope::empty(EnvelopeType::Ack))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Protocol(_)));
    }
}
