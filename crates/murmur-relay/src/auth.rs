//! Connection authentication.
//!
//! A connection is bound to an identity before it is registered, either from
//! a token presented with the upgrade request or from an `auth` envelope that
//! must be the first frame on the transport.

use std::fmt::Display;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::connection::Frame;
use crate::envelope::{AuthPayload, Envelope, EnvelopeType};
use crate::error::AuthError;
use crate::metrics;
use crate::types::Identity;

/// Resolves a bearer token to an identity.
pub trait TokenValidator: Send + Sync + 'static {
    fn validate(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Validate a token presented alongside the upgrade request.
pub fn authenticate_token<V: TokenValidator + ?Sized>(
    validator: &V,
    token: &str,
) -> Result<Identity, AuthError> {
    let result = if token.is_empty() {
        Err(AuthError::MissingToken)
    } else {
        validator.validate(token)
    };
    metrics::record_auth_attempt("upgrade", result.is_ok());
    result
}

/// Wait for an `auth` envelope as the first data frame and validate it.
///
/// Transport pings and pongs before it are skipped. Anything else, or no
/// frame within `timeout`, fails the handshake.
pub async fn authenticate_first_frame<St, E, V>(
    stream: &mut St,
    validator: &V,
    timeout: Duration,
) -> Result<Identity, AuthError>
where
    St: Stream<Item = Result<Frame, E>> + Unpin,
    E: Display,
    V: TokenValidator + ?Sized,
{
    let result = match tokio::time::timeout(timeout, first_auth_frame(stream)).await {
        Ok(Ok(token)) => validator.validate(&token),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(AuthError::Timeout),
    };

    match &result {
        Ok(identity) => debug!(identity = %identity, "First-frame authentication succeeded"),
        Err(e) => warn!(error = %e, "First-frame authentication failed"),
    }
    metrics::record_auth_attempt("first_frame", result.is_ok());
    result
}

async fn first_auth_frame<St, E>(stream: &mut St) -> Result<String, AuthError>
where
    St: Stream<Item = Result<Frame, E>> + Unpin,
    E: Display,
{
    loop {
        let text = match stream.next().await {
            None | Some(Ok(Frame::Close(_))) => return Err(AuthError::TransportClosed),
            Some(Err(e)) => {
                debug!(error = %e, "Transport error before authentication");
                return Err(AuthError::TransportClosed);
            }
            Some(Ok(Frame::Ping(_) | Frame::Pong(_))) => continue,
            Some(Ok(Frame::Text(text))) => text,
            Some(Ok(Frame::Binary(bytes))) => String::from_utf8(bytes)
                .map_err(|_| AuthError::AuthRequired("binary frame".into()))?,
        };

        let envelope =
            Envelope::decode(&text).map_err(|e| AuthError::AuthRequired(e.to_string()))?;
        if envelope.kind != EnvelopeType::Auth {
            return Err(AuthError::AuthRequired(format!(
                "expected auth, got {}",
                envelope.kind.as_str()
            )));
        }
        let payload: AuthPayload = envelope
            .payload_as()
            .map_err(|_| AuthError::MissingToken)?;
        if payload.token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        return Ok(payload.token);
    }
}
