//! Relay tuning knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Limits and timers for connections and the hub.
///
/// Durations are stored as whole seconds so the struct can be embedded in a
/// TOML/env-driven host configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Largest inbound frame accepted; anything bigger ends the connection.
    pub max_frame_bytes: usize,
    /// Capacity of each connection's outbound queue.
    pub outbox_capacity: usize,
    /// How long a connection may stay silent before the sweep removes it.
    pub liveness_timeout_secs: u64,
    /// How often the outbound pump sends a transport-level ping.
    pub ping_interval_secs: u64,
    /// Upper bound on a single transport write.
    pub write_timeout_secs: u64,
    /// Period of the hub's liveness sweep.
    pub sweep_interval_secs: u64,
    /// Capacity of the hub command channel.
    pub command_capacity: usize,
    /// Time allowed for a first-frame `auth` envelope.
    pub auth_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 512 * 1024,
            outbox_capacity: 256,
            liveness_timeout_secs: 60,
            ping_interval_secs: 54,
            write_timeout_secs: 10,
            sweep_interval_secs: 30,
            command_capacity: 1024,
            auth_timeout_secs: 10,
        }
    }
}

impl RelayConfig {
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    /// Derive the ping period from a liveness timeout (nine tenths of it).
    pub fn with_liveness_timeout(mut self, secs: u64) -> Self {
        self.liveness_timeout_secs = secs;
        self.ping_interval_secs = (secs * 9 / 10).max(1);
        self
    }
}
