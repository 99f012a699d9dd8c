//! Per-connection pumps.
//!
//! A connection is served by two tasks:
//!
//! - the **inbound pump** reads frames, enforces the size cap, decodes
//!   envelopes and hands them to an [`EnvelopeHandler`] one at a time;
//! - the **outbound pump** drains the bounded outbound queue to the
//!   transport and sends a keepalive ping on a timer.
//!
//! The transport is abstracted as a `Sink<Frame>` / `Stream<Item = Result<Frame, _>>`
//! pair so the host can adapt any WebSocket implementation.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::RelayConfig;
use crate::envelope::{Envelope, EnvelopeType, ErrorPayload};
use crate::error::RelayError;
use crate::metrics;
use crate::registry::{ConnectionHandle, HubHandle};
use crate::router::EnvelopeHandler;
use crate::types::Identity;

/// Transport-level frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<CloseFrame>),
}

/// Close code and reason sent with a close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

impl CloseFrame {
    pub const NORMAL: u16 = 1000;
    pub const POLICY_VIOLATION: u16 = 1008;

    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn normal() -> Self {
        Self::new(Self::NORMAL, "")
    }
}

/// Register a connection for `identity` and serve it until the transport
/// ends or the hub closes it.
///
/// The identity must already be authenticated. On return the connection
/// has been unregistered exactly once and its transport closed.
#[instrument(skip_all, fields(identity = %identity))]
pub async fn serve<Si, St, E, H>(
    identity: Identity,
    sink: Si,
    stream: St,
    hub: HubHandle,
    handler: Arc<H>,
    config: &RelayConfig,
) -> Result<(), RelayError>
where
    Si: Sink<Frame> + Unpin + Send + 'static,
    Si::Error: Display,
    St: Stream<Item = Result<Frame, E>> + Unpin + Send,
    E: Display + Send,
    H: EnvelopeHandler,
{
    let (handle, outbox) = ConnectionHandle::new(identity.clone(), config.outbox_capacity);
    hub.register(handle.clone()).await?;
    info!(connection = %handle.id(), "Connection active");

    let outbound = tokio::spawn(outbound_pump(
        sink,
        outbox,
        handle.closed_token(),
        config.ping_interval(),
        config.write_timeout(),
    ));

    let result = inbound_pump(
        stream,
        &handle,
        handler.as_ref(),
        config.max_frame_bytes,
        config.liveness_timeout(),
    )
    .await;

    if let Err(e) = hub.unregister_connection(&identity, handle.id()).await {
        debug!(error = %e, "Hub gone during cleanup");
    }
    handle.close();

    let written = match outbound.await {
        Ok(written) => written,
        Err(e) => {
            warn!(error = %e, "Outbound pump panicked");
            Ok(())
        }
    };

    // A write failure wakes the inbound pump as a clean close; report it instead.
    let result = result.and(written);

    match &result {
        Ok(()) => info!(connection = %handle.id(), "Connection closed"),
        Err(e) => info!(connection = %handle.id(), error = %e, "Connection terminated"),
    }
    result
}

async fn inbound_pump<St, E, H>(
    mut stream: St,
    handle: &ConnectionHandle,
    handler: &H,
    max_frame_bytes: usize,
    read_deadline: Duration,
) -> Result<(), RelayError>
where
    St: Stream<Item = Result<Frame, E>> + Unpin + Send,
    E: Display + Send,
    H: EnvelopeHandler,
{
    let closed = handle.closed_token();

    loop {
        let next = tokio::select! {
            _ = closed.cancelled() => {
                debug!("Connection closed by hub");
                return Ok(());
            }
            next = tokio::time::timeout(read_deadline, stream.next()) => match next {
                Ok(next) => next,
                Err(_) => {
                    warn!(idle = ?read_deadline, "No frames within the liveness timeout");
                    return Err(RelayError::transport("read deadline exceeded"));
                }
            },
        };

        let frame = match next {
            None => return Ok(()),
            Some(Err(e)) => return Err(RelayError::transport(e.to_string())),
            Some(Ok(frame)) => frame,
        };
        handle.liveness().touch();

        let text = match frame {
            Frame::Text(text) => {
                check_size(text.len(), max_frame_bytes)?;
                text
            }
            Frame::Binary(bytes) => {
                check_size(bytes.len(), max_frame_bytes)?;
                match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        warn!("Ignoring non-UTF-8 binary frame");
                        continue;
                    }
                }
            }
            Frame::Ping(_) | Frame::Pong(_) => continue,
            Frame::Close(_) => {
                debug!("Client sent close frame");
                return Ok(());
            }
        };

        let envelope = match Envelope::decode(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable frame");
                continue;
            }
        };

        dispatch(handle, handler, envelope).await;
    }
}

fn check_size(size: usize, max: usize) -> Result<(), RelayError> {
    if size > max {
        warn!(size, max, "Inbound frame exceeds size cap");
        return Err(RelayError::FrameTooLarge { size, max });
    }
    Ok(())
}

async fn dispatch<H: EnvelopeHandler>(handle: &ConnectionHandle, handler: &H, envelope: Envelope) {
    let kind = envelope.kind;
    metrics::record_envelope(kind.as_str(), "inbound");
    let started = std::time::Instant::now();

    match kind {
        EnvelopeType::Ping => reply(handle, &Envelope::empty(EnvelopeType::Pong)),
        EnvelopeType::Pong => {}
        EnvelopeType::Auth => debug!("Ignoring auth envelope on authenticated connection"),
        _ => match handler.handle(handle.identity(), envelope).await {
            Ok(Some(response)) => reply(handle, &response),
            Ok(None) => {}
            Err(e) if e.is_reported() => {
                warn!(code = e.code(), error = %e, "Rejected envelope");
                match Envelope::new(EnvelopeType::Error, &ErrorPayload::from(&e)) {
                    Ok(envelope) => reply(handle, &envelope),
                    Err(e) => warn!(error = %e, "Failed to encode error envelope"),
                }
            }
            Err(e) => warn!(kind = kind.as_str(), error = %e, "Envelope not handled"),
        },
    }

    metrics::record_dispatch_latency(started.elapsed().as_secs_f64() * 1000.0, kind.as_str());
}

/// Queue a reply on the connection's own outbox.
fn reply(handle: &ConnectionHandle, envelope: &Envelope) {
    let frame = match envelope.to_frame() {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "Failed to encode reply");
            return;
        }
    };
    match handle.try_enqueue(frame) {
        Ok(()) => metrics::record_envelope(envelope.kind.as_str(), "outbound"),
        Err(_) => {
            warn!(kind = envelope.kind.as_str(), "Outbound queue unavailable, reply dropped");
            metrics::record_reply_dropped(envelope.kind.as_str());
        }
    }
}

async fn outbound_pump<Si>(
    mut sink: Si,
    mut outbox: mpsc::Receiver<Arc<str>>,
    closed: CancellationToken,
    ping_interval: Duration,
    write_timeout: Duration,
) -> Result<(), RelayError>
where
    Si: Sink<Frame> + Unpin + Send + 'static,
    Si::Error: Display,
{
    let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let result = loop {
        tokio::select! {
            _ = closed.cancelled() => {
                outbox.close();
                let mut drained = Ok(());
                while let Some(frame) = outbox.recv().await {
                    if let Err(e) = write(&mut sink, Frame::Text(frame.to_string()), write_timeout).await {
                        drained = Err(e);
                        break;
                    }
                }
                if drained.is_ok() {
                    let _ = write(&mut sink, Frame::Close(Some(CloseFrame::normal())), write_timeout).await;
                }
                break drained;
            }
            frame = outbox.recv() => {
                let Some(frame) = frame else {
                    let _ = write(&mut sink, Frame::Close(Some(CloseFrame::normal())), write_timeout).await;
                    break Ok(());
                };
                if let Err(e) = write(&mut sink, Frame::Text(frame.to_string()), write_timeout).await {
                    break Err(e);
                }
            }
            _ = ping.tick() => {
                if let Err(e) = write(&mut sink, Frame::Ping(Vec::new()), write_timeout).await {
                    warn!(error = %e, "Keepalive ping failed");
                    break Err(e);
                }
            }
        }
    };

    // Wake the inbound pump if the transport failed on this side.
    closed.cancel();
    result
}

async fn write<Si>(sink: &mut Si, frame: Frame, timeout: Duration) -> Result<(), RelayError>
where
    Si: Sink<Frame> + Unpin,
    Si::Error: Display,
{
    match tokio::time::timeout(timeout, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(RelayError::transport(e.to_string())),
        Err(_) => Err(RelayError::transport("write timed out")),
    }
}
