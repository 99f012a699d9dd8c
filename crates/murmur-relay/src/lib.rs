//! # murmur-relay
//!
//! Real-time fan-out relay for Murmur's end-to-end encrypted chat.
//!
//! This crate keeps the registry of live client connections and routes newly
//! created messages to every member of their conversation. It is designed to
//! be embedded in `murmur-server`, which supplies the WebSocket transport,
//! persistence and token validation.
//!
//! ## Architecture
//!
//! - **Hub**: one task owning the identity → connection map, driven by commands
//! - **Connection**: an inbound and an outbound pump per transport
//! - **Envelope**: the `{type, payload}` JSON wire format
//! - **MessageRouter**: validates and persists messages, then asks the hub to fan out
//!
//! ```text
//! wire → inbound pump → Envelope → MessageRouter → store
//!                                        │
//!                                        └─ FanoutRequest → Hub → outbound queues → wire
//! ```
//!
//! Slow consumers are cut off rather than waited for: a full outbound queue
//! unregisters that connection and leaves everyone else untouched.

pub mod auth;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod metrics;
pub mod registry;
pub mod router;
pub mod store;

mod error;
mod types;

pub use auth::{authenticate_first_frame, authenticate_token, TokenValidator};
pub use config::RelayConfig;
pub use connection::{serve, CloseFrame, Frame};
pub use envelope::{Envelope, EnvelopeType, FanoutRequest};
pub use error::{AuthError, RelayError, StoreError};
pub use registry::{ConnectionHandle, DeliveryReport, Hub, HubHandle, SendResult};
pub use router::{EnvelopeHandler, MessageRouter};
pub use store::{MemoryStore, MessageRecord, MessageStore};
pub use types::*;
