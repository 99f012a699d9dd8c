//! Test utilities for relay integration tests.
//!
//! Provides an in-process duplex transport and a scripted client that speaks
//! the envelope protocol against a running hub and router.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc;
use futures::StreamExt;
use murmur_relay::envelope::IncomingMessage;
use murmur_relay::{
    serve, ElGamalContent, Envelope, EnvelopeType, Frame, Hub, HubHandle, Identity, MemoryStore,
    MessageRouter, RelayConfig, RelayError,
};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A running hub, store and router.
pub struct Relay {
    pub hub: HubHandle,
    pub store: Arc<MemoryStore>,
    pub router: Arc<MessageRouter<MemoryStore>>,
    pub config: RelayConfig,
    pub shutdown: CancellationToken,
}

impl Relay {
    pub fn start() -> Self {
        Self::with_config(RelayConfig::default())
    }

    pub fn with_config(config: RelayConfig) -> Self {
        init_tracing();
        let shutdown = CancellationToken::new();
        let (hub, _task) = Hub::spawn(&config, shutdown.clone());
        let store = Arc::new(MemoryStore::new());
        let router = Arc::new(MessageRouter::new(store.clone(), hub.clone()));
        Self {
            hub,
            store,
            router,
            config,
            shutdown,
        }
    }

    /// Create a conversation with the given members.
    pub async fn conversation(&self, id: &str, members: &[&str]) {
        self.store
            .add_conversation(id, members.iter().map(|m| Identity::from(*m)))
            .await;
    }

    /// Connect an authenticated client and wait until it is registered.
    pub async fn connect(&self, name: &str) -> TestClient {
        self.connect_with_transport_buffer(name, 1024).await
    }

    /// Connect a client whose transport accepts at most `buffer` unread
    /// frames before writes start to block.
    pub async fn connect_with_transport_buffer(&self, name: &str, buffer: usize) -> TestClient {
        let identity = Identity::new(name);
        let (to_server, server_in) = mpsc::unbounded();
        let (server_out, from_server) = mpsc::channel(buffer);

        let task = {
            let identity = identity.clone();
            let hub = self.hub.clone();
            let router = self.router.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                serve(identity, server_out, server_in, hub, router, &config).await
            })
        };

        let mut client = TestClient {
            identity,
            to_server,
            from_server,
            task,
        };
        // The inbound pump only starts once registration is applied.
        client.send_text(r#"{"type":"ping"}"#);
        client.expect(EnvelopeType::Pong).await;
        client
    }

    /// Poll the hub until the identity's registration matches `connected`.
    pub async fn wait_connected(&self, identity: &Identity, connected: bool) {
        timeout(DEFAULT_TIMEOUT, async {
            while self.hub.is_connected(identity).await.unwrap() != connected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("registration state did not settle");
    }

    /// Round-trip through the hub so every previously queued command has run.
    pub async fn settle(&self) {
        self.hub.connection_count().await.unwrap();
    }
}

/// Client side of an in-process connection.
pub struct TestClient {
    pub identity: Identity,
    pub to_server: mpsc::UnboundedSender<Result<Frame, Infallible>>,
    pub from_server: mpsc::Receiver<Frame>,
    pub task: JoinHandle<Result<(), RelayError>>,
}

impl TestClient {
    pub fn send(&self, envelope: &Envelope) {
        self.send_text(&envelope.encode().unwrap());
    }

    pub fn send_text(&self, text: &str) {
        self.to_server
            .unbounded_send(Ok(Frame::Text(text.to_string())))
            .unwrap();
    }

    /// Send a `message` envelope with one content entry per recipient.
    pub fn send_message(&self, conversation_id: &str, recipients: &[&str]) {
        let message = IncomingMessage {
            conversation_id: conversation_id.to_string(),
            encrypted_contents: contents(recipients),
        };
        self.send(&Envelope::new(EnvelopeType::Message, &message).unwrap());
    }

    /// Next envelope from the relay, skipping transport pings.
    pub async fn recv(&mut self) -> Envelope {
        timeout(DEFAULT_TIMEOUT, async {
            loop {
                match self.from_server.next().await {
                    Some(Frame::Text(text)) => return Envelope::decode(&text).unwrap(),
                    Some(Frame::Ping(_)) => continue,
                    other => panic!("{}: expected text frame, got {other:?}", self.identity),
                }
            }
        })
        .await
        .expect("timed out waiting for envelope")
    }

    /// Next envelope, asserting its type.
    pub async fn expect(&mut self, kind: EnvelopeType) -> Envelope {
        let envelope = self.recv().await;
        assert_eq!(envelope.kind, kind, "{}: unexpected envelope {envelope:?}", self.identity);
        envelope
    }

    /// Assert nothing was queued for this client ahead of a fresh ping.
    ///
    /// Call after [`Relay::settle`] so earlier fan-outs have been applied.
    pub async fn assert_idle(&mut self) {
        self.send_text(r#"{"type":"ping"}"#);
        self.expect(EnvelopeType::Pong).await;
    }

    /// Next non-ping frame, whatever it is.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        timeout(DEFAULT_TIMEOUT, async {
            loop {
                match self.from_server.next().await {
                    Some(Frame::Ping(_)) => continue,
                    other => return other,
                }
            }
        })
        .await
        .expect("timed out waiting for frame")
    }
}

pub fn contents(recipients: &[&str]) -> BTreeMap<Identity, ElGamalContent> {
    recipients
        .iter()
        .enumerate()
        .map(|(i, r)| {
            (
                Identity::from(*r),
                ElGamalContent {
                    a: (1000 + i).to_string(),
                    b: (2000 + i).to_string(),
                    p: "7919".to_string(),
                },
            )
        })
        .collect()
}
