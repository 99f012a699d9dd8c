//! Connection Registry implementation.
//!
//! Tracks the live connection of each identity for fan-out. The registry is
//! a plain owned map; it is only ever touched by the hub task (see
//! [`super::hub`]), so it needs no interior locking.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::envelope::FanoutRequest;
use crate::types::Identity;

/// Identifies one physical connection, distinct from the identity it serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Last time a connection showed signs of life.
///
/// Refreshed by the inbound pump on every frame (including pongs), read by
/// the hub sweep.
#[derive(Debug)]
pub struct Liveness {
    epoch: Instant,
    last_seen_ms: AtomicU64,
}

impl Liveness {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
        }
    }

    /// Mark the connection as alive now.
    pub fn touch(&self) {
        let elapsed = self.epoch.elapsed().as_millis() as u64;
        self.last_seen_ms.store(elapsed, Ordering::Relaxed);
    }

    /// Time since the last [`touch`](Self::touch) (or creation).
    pub fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry-side handle to one connection.
///
/// Cloning is cheap. The `closed` token is the cancellation signal for the
/// connection's outbound pump: once cancelled, the pump drains what is
/// already queued, sends a close frame and exits.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    identity: Identity,
    outbox: mpsc::Sender<Arc<str>>,
    closed: CancellationToken,
    liveness: Arc<Liveness>,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end of its outbound queue.
    pub fn new(identity: Identity, capacity: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (outbox, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: ConnectionId::new(),
            identity,
            outbox,
            closed: CancellationToken::new(),
            liveness: Arc::new(Liveness::new()),
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    /// Token cancelled when the connection is closed.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Queue a frame without waiting.
    pub fn try_enqueue(&self, frame: Arc<str>) -> Result<(), mpsc::error::TrySendError<Arc<str>>> {
        if self.closed.is_cancelled() {
            return Err(mpsc::error::TrySendError::Closed(frame));
        }
        self.outbox.try_send(frame)
    }

    /// Close the outbound queue. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }
}

/// Outcome of offering a frame to one recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// Frame was queued for delivery
    Delivered,
    /// The recipient has no registered connection
    Offline,
    /// The recipient's queue was full or closed; it has been unregistered
    Dropped,
}

impl SendResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Offline => "offline",
            Self::Dropped => "dropped",
        }
    }
}

/// Per-recipient outcomes of one fan-out, in request order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub outcomes: Vec<(Identity, SendResult)>,
}

impl DeliveryReport {
    /// Outcome for one recipient, if it was addressed.
    pub fn outcome(&self, identity: &Identity) -> Option<SendResult> {
        self.outcomes
            .iter()
            .find(|(id, _)| id == identity)
            .map(|(_, result)| *result)
    }

    /// Recipients with the given outcome.
    pub fn with_outcome(&self, wanted: SendResult) -> Vec<Identity> {
        self.outcomes
            .iter()
            .filter(|(_, result)| *result == wanted)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Identity to connection map.
///
/// At most one entry per identity. Registering an identity that is already
/// present replaces the entry without closing the previous connection; the
/// replaced connection keeps running until its own transport ends or its
/// read deadline passes, but no longer receives fan-out.
///
/// ## Usage
///
/// ```ignore
/// let mut registry = ConnectionRegistry::new();
///
/// let (handle, rx) = ConnectionHandle::new(identity.clone(), 256);
/// registry.register(handle);
///
/// let report = registry.fan_out(&request);
///
/// registry.unregister(&identity);
/// ```
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: HashMap<Identity, ConnectionHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the connection for its identity.
    ///
    /// Returns the replaced handle, which is left open.
    #[instrument(skip(self, handle), fields(identity = %handle.identity(), connection = %handle.id()))]
    pub fn register(&mut self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let replaced = self.connections.insert(handle.identity.clone(), handle);
        match &replaced {
            Some(old) => info!(previous = %old.id(), "Replaced existing connection registration"),
            None => info!("Registered connection"),
        }
        replaced
    }

    /// Remove the identity's entry and close its outbound queue.
    ///
    /// Returns false if nothing was registered.
    #[instrument(skip(self), fields(identity = %identity))]
    pub fn unregister(&mut self, identity: &Identity) -> bool {
        match self.connections.remove(identity) {
            Some(handle) => {
                handle.close();
                info!(connection = %handle.id(), "Unregistered connection");
                true
            }
            None => {
                debug!("Connection was not registered");
                false
            }
        }
    }

    /// Like [`unregister`](Self::unregister), but only if the registered
    /// entry is still the given connection.
    ///
    /// A connection that was replaced by a newer registration uses this on
    /// its way out so it cannot remove its successor.
    #[instrument(skip(self), fields(identity = %identity, connection = %id))]
    pub fn unregister_connection(&mut self, identity: &Identity, id: ConnectionId) -> bool {
        match self.connections.get(identity) {
            Some(handle) if handle.id() == id => self.unregister(identity),
            Some(_) => {
                debug!("Connection was replaced, leaving current registration");
                false
            }
            None => false,
        }
    }

    pub fn is_connected(&self, identity: &Identity) -> bool {
        self.connections.contains_key(identity)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Offer the request's frame to every recipient without blocking.
    ///
    /// A recipient whose queue is full or closed is unregistered; the others
    /// are unaffected.
    #[instrument(skip(self, request), fields(kind = request.kind.as_str(), recipients = request.recipients.len()))]
    pub fn fan_out(&mut self, request: &FanoutRequest) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        for recipient in &request.recipients {
            let result = match self.connections.get(recipient) {
                None => {
                    debug!(recipient = %recipient, "Recipient offline");
                    SendResult::Offline
                }
                Some(handle) => match handle.try_enqueue(Arc::clone(&request.frame)) {
                    Ok(()) => SendResult::Delivered,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(recipient = %recipient, "Outbound queue full, dropping connection");
                        self.unregister(recipient);
                        SendResult::Dropped
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!(recipient = %recipient, "Outbound queue closed, removing stale entry");
                        self.unregister(recipient);
                        SendResult::Dropped
                    }
                },
            };
            report.outcomes.push((recipient.clone(), result));
        }

        report
    }

    /// Unregister every connection idle for longer than `timeout`.
    pub fn sweep(&mut self, timeout: Duration) -> Vec<Identity> {
        let stale: Vec<Identity> = self
            .connections
            .iter()
            .filter(|(_, handle)| handle.is_closed() || handle.liveness().idle() > timeout)
            .map(|(identity, _)| identity.clone())
            .collect();

        for identity in &stale {
            self.unregister(identity);
        }

        if !stale.is_empty() {
            info!(count = stale.len(), "Swept stale connections");
        }

        stale
    }

    /// Close and remove every connection.
    pub fn close_all(&mut self) {
        for (_, handle) in self.connections.drain() {
            handle.close();
        }
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connection_count", &self.connections.len())
            .finish()
    }
}
