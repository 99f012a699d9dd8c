//! Connection Registry for real-time fan-out.
//!
//! A single hub task owns the identity → connection map. Connections and
//! the message router reach it only through [`HubHandle`] commands, so the
//! map is never shared or locked.
//!
//! ## Architecture
//!
//! ```text
//! Connection (alice) ──register/unregister──┐
//!                                            v
//! MessageRouter ──────fan_out──────────> Hub task ──try_send──> outbound queue (bob)
//!                                            ^                      │
//!                        sweep tick (30s) ───┘                      v
//!                                                            outbound pump → wire
//! ```

mod connection_registry;
mod hub;

pub use connection_registry::{
    ConnectionHandle, ConnectionId, ConnectionRegistry, DeliveryReport, Liveness, SendResult,
};
pub use hub::{Hub, HubHandle};
