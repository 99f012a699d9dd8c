//! Core domain types shared by the relay components.

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Opaque name of one authenticated principal.
///
/// The relay never interprets the contents; it is whatever the token
/// validator resolved for the connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Create an identity from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Identity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for Identity {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// ElGamal ciphertext for one recipient.
///
/// All three components are decimal-string big integers. The relay stores
/// and forwards them verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElGamalContent {
    pub a: String,
    pub b: String,
    pub p: String,
}

/// Delivery status of one recipient's copy of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecipientStatus {
    /// Persisted, not yet seen by the recipient's client
    Sent,
    /// Delivered to the recipient's client
    Received,
    /// Displayed to the recipient
    Read,
}

impl RecipientStatus {
    /// Storage/wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "SENT",
            Self::Received => "RECEIVED",
            Self::Read => "READ",
        }
    }

    /// Whether a client may request a transition to this status.
    ///
    /// `SENT` is only ever assigned by the relay when a message is created.
    pub fn is_client_settable(&self) -> bool {
        matches!(self, Self::Received | Self::Read)
    }
}

impl fmt::Display for RecipientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecipientStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SENT" => Ok(Self::Sent),
            "RECEIVED" => Ok(Self::Received),
            "READ" => Ok(Self::Read),
            other => Err(format!("unknown recipient status: {other}")),
        }
    }
}
