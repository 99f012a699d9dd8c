//! Relay connections over WebSocket
//!
//! Authenticates the client, then hands the socket to [`murmur_relay::serve`]
//! as a [`Frame`] sink and stream.

use axum::{
    extract::{
        ws::{self, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::Response,
    routing::get,
    Router,
};
use futures::{future, SinkExt, StreamExt};
use murmur_relay::{
    authenticate_first_frame, authenticate_token, serve, AuthError, CloseFrame, Frame, Identity,
};
use serde::Deserialize;
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::ErrorResponse;
use crate::server::AppState;

/// Close reasons are limited to 123 bytes on the wire
const MAX_CLOSE_REASON: usize = 120;

/// Create the WebSocket router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .with_state(state)
}

/// Query parameters for the upgrade request
#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub token: Option<String>,
}

/// GET /ws
///
/// With `?token=` the identity is checked before upgrading and a bad token
/// is refused with 401. Without it the first frame must be an `auth`
/// envelope.
async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let identity = match params.token.as_deref() {
        Some(token) => match authenticate_token(state.validator.as_ref(), token) {
            Ok(identity) => Some(identity),
            Err(e) => {
                warn!("Rejected WebSocket upgrade: {}", e);
                return ErrorResponse::new("unauthorized", &e.to_string())
                    .respond(StatusCode::UNAUTHORIZED);
            }
        },
        None => None,
    };

    let max = state.relay.max_frame_bytes;
    ws.max_message_size(max)
        .max_frame_size(max)
        .on_upgrade(move |socket| handle_socket(socket, state, identity))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, identity: Option<Identity>) {
    let (sink, stream) = socket.split();
    let mut sink = sink.with(|frame: Frame| future::ready(Ok::<_, axum::Error>(into_message(frame))));
    let mut stream = stream.map(|message| message.map(from_message));

    let identity = match identity {
        Some(identity) => identity,
        None => {
            match authenticate_first_frame(
                &mut stream,
                state.validator.as_ref(),
                state.relay.auth_timeout(),
            )
            .await
            {
                Ok(identity) => identity,
                Err(e) => {
                    let close = CloseFrame::new(CloseFrame::POLICY_VIOLATION, close_reason(&e));
                    if let Err(err) = sink.send(Frame::Close(Some(close))).await {
                        debug!("Failed to send close frame: {}", err);
                    }
                    return;
                }
            }
        }
    };

    info!(identity = %identity, "WebSocket connection authenticated");
    if let Err(e) = serve(
        identity,
        sink,
        stream,
        state.hub.clone(),
        state.router.clone(),
        &state.relay,
    )
    .await
    {
        debug!("WebSocket connection ended: {}", e);
    }
}

fn close_reason(error: &AuthError) -> String {
    let mut reason = error.to_string();
    if reason.len() > MAX_CLOSE_REASON {
        let mut end = MAX_CLOSE_REASON;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
    }
    reason
}

fn into_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text),
        Frame::Binary(bytes) => Message::Binary(bytes),
        Frame::Ping(payload) => Message::Ping(payload),
        Frame::Pong(payload) => Message::Pong(payload),
        Frame::Close(close) => Message::Close(close.map(|c| ws::CloseFrame {
            code: c.code,
            reason: Cow::Owned(c.reason),
        })),
    }
}

fn from_message(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::Text(text),
        Message::Binary(bytes) => Frame::Binary(bytes),
        Message::Ping(payload) => Frame::Ping(payload),
        Message::Pong(payload) => Frame::Pong(payload),
        Message::Close(close) => Frame::Close(
            close.map(|c| CloseFrame::new(c.code, c.reason.into_owned())),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::test_tokens;
    use crate::server::{create_router, tests::create_test_state};
    use murmur_relay::envelope::{Ack, DeliveredMessage, StatusUpdate};
    use murmur_relay::{Envelope, EnvelopeType, RecipientStatus};
    use serde_json::json;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::{self, protocol::frame::coding::CloseCode};
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn spawn_server() -> (SocketAddr, Arc<AppState>) {
        let (state, _shutdown) = create_test_state().await;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = create_router(state.clone());
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (addr, state)
    }

    async fn send(client: &mut Client, value: serde_json::Value) {
        client
            .send(tungstenite::Message::Text(value.to_string()))
            .await
            .unwrap();
    }

    async fn recv(client: &mut Client) -> Envelope {
        timeout(TIMEOUT, async {
            loop {
                match client.next().await {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        return Envelope::decode(&text).unwrap()
                    }
                    Some(Ok(tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_))) => {
                        continue
                    }
                    other => panic!("expected text frame, got {other:?}"),
                }
            }
        })
        .await
        .expect("timed out waiting for envelope")
    }

    async fn expect(client: &mut Client, kind: EnvelopeType) -> Envelope {
        let envelope = recv(client).await;
        assert_eq!(envelope.kind, kind, "unexpected envelope {envelope:?}");
        envelope
    }

    /// Round-trip a ping so the connection is known to be registered.
    async fn ready(client: &mut Client) {
        send(client, json!({ "type": "ping" })).await;
        expect(client, EnvelopeType::Pong).await;
    }

    async fn connect_with_query_token(addr: SocketAddr, user: &str) -> Client {
        let url = format!("ws://{addr}/ws?token={}", test_tokens::token_for(user));
        let (mut client, _) = connect_async(url).await.unwrap();
        ready(&mut client).await;
        client
    }

    async fn connect_with_auth_frame(addr: SocketAddr, user: &str) -> Client {
        let (mut client, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        send(
            &mut client,
            json!({ "type": "auth", "payload": { "token": test_tokens::token_for(user) } }),
        )
        .await;
        ready(&mut client).await;
        client
    }

    #[tokio::test]
    async fn test_message_and_receipt_over_websocket() {
        let (addr, state) = spawn_server().await;
        let conversation = state
            .repository
            .create_conversation(None, &[Identity::new("alice"), Identity::new("bob")])
            .await
            .unwrap();

        let mut alice = connect_with_query_token(addr, "alice").await;
        let mut bob = connect_with_auth_frame(addr, "bob").await;
        assert_eq!(state.hub.connection_count().await.unwrap(), 2);

        let content = |n: &str| json!({ "a": format!("{n}-a"), "b": "2", "p": "7919" });
        send(
            &mut alice,
            json!({
                "type": "message",
                "payload": {
                    "conversationId": conversation.id,
                    "encryptedContents": { "alice": content("alice"), "bob": content("bob") }
                }
            }),
        )
        .await;

        let delivered: DeliveredMessage = expect(&mut bob, EnvelopeType::Message)
            .await
            .payload_as()
            .unwrap();
        assert_eq!(delivered.sender_id, Identity::new("alice"));
        expect(&mut bob, EnvelopeType::ConversationUpdate).await;

        expect(&mut alice, EnvelopeType::Message).await;
        expect(&mut alice, EnvelopeType::ConversationUpdate).await;
        let ack: Ack = expect(&mut alice, EnvelopeType::Ack)
            .await
            .payload_as()
            .unwrap();
        assert_eq!(ack.message_id, delivered.id);

        send(
            &mut bob,
            json!({
                "type": "message_status",
                "payload": { "messageId": delivered.id, "status": "READ" }
            }),
        )
        .await;

        let update: StatusUpdate = expect(&mut alice, EnvelopeType::StatusUpdate)
            .await
            .payload_as()
            .unwrap();
        assert_eq!(update.status, RecipientStatus::Read);
        assert_eq!(update.user_id, Identity::new("bob"));

        let history = state
            .repository
            .history(&conversation.id, &Identity::new("bob"), 10)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, RecipientStatus::Read);
    }

    #[tokio::test]
    async fn test_bad_query_token_is_refused_before_upgrade() {
        let (addr, state) = spawn_server().await;

        let err = connect_async(format!("ws://{addr}/ws?token=forged"))
            .await
            .unwrap_err();
        match err {
            tungstenite::Error::Http(response) => {
                assert_eq!(response.status(), StatusCode::UNAUTHORIZED)
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(state.hub.connection_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_non_auth_first_frame_closes_with_policy_violation() {
        let (addr, state) = spawn_server().await;
        let (mut client, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();

        send(&mut client, json!({ "type": "ping" })).await;

        let frame = timeout(TIMEOUT, client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match frame {
            tungstenite::Message::Close(Some(close)) => {
                assert_eq!(close.code, CloseCode::Policy);
                assert!(close.reason.contains("Authentication required"));
            }
            other => panic!("expected close frame, got {other:?}"),
        }
        assert_eq!(state.hub.connection_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_unregisters() {
        let (addr, state) = spawn_server().await;
        let mut client = connect_with_query_token(addr, "alice").await;
        assert!(state.hub.is_connected(&Identity::new("alice")).await.unwrap());

        client.close(None).await.unwrap();
        timeout(TIMEOUT, async {
            while state.hub.is_connected(&Identity::new("alice")).await.unwrap() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connection was not unregistered");
    }

    #[test]
    fn test_close_reason_is_truncated() {
        let long = AuthError::InvalidToken("x".repeat(300));
        assert!(close_reason(&long).len() <= MAX_CLOSE_REASON);
        assert_eq!(close_reason(&AuthError::Expired), "Token expired");
    }

    #[test]
    fn test_frame_conversion() {
        let close = into_message(Frame::Close(Some(CloseFrame::new(1008, "bad"))));
        match close {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, 1008);
                assert_eq!(frame.reason, "bad");
            }
            other => panic!("unexpected message {other:?}"),
        }
        assert_eq!(
            from_message(Message::Text("hi".into())),
            Frame::Text("hi".into())
        );
    }
}
