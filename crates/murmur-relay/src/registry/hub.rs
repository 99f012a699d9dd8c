//! Hub coordination task.
//!
//! Owns the [`ConnectionRegistry`] and applies commands one at a time, so
//! register, unregister, fan-out and sweep never interleave. Everything else
//! talks to it through a cloneable [`HubHandle`].

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection_registry::{
    ConnectionHandle, ConnectionId, ConnectionRegistry, DeliveryReport, SendResult,
};
use crate::config::RelayConfig;
use crate::envelope::FanoutRequest;
use crate::error::RelayError;
use crate::metrics;
use crate::types::Identity;

enum HubCommand {
    Register {
        handle: ConnectionHandle,
        done: oneshot::Sender<()>,
    },
    Unregister {
        identity: Identity,
        connection: Option<ConnectionId>,
        done: oneshot::Sender<bool>,
    },
    FanOut {
        request: FanoutRequest,
        report: Option<oneshot::Sender<DeliveryReport>>,
    },
    Sweep {
        done: oneshot::Sender<Vec<Identity>>,
    },
    Stats {
        identity: Option<Identity>,
        reply: oneshot::Sender<(usize, bool)>,
    },
}

/// The coordination task.
pub struct Hub {
    registry: ConnectionRegistry,
    commands: mpsc::Receiver<HubCommand>,
    sweep_interval: Duration,
    liveness_timeout: Duration,
    shutdown: CancellationToken,
}

impl Hub {
    /// Start the hub on the current runtime.
    ///
    /// The task runs until `shutdown` is cancelled or every [`HubHandle`]
    /// is dropped. On exit all registered connections are closed.
    pub fn spawn(config: &RelayConfig, shutdown: CancellationToken) -> (HubHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.command_capacity.max(1));
        let hub = Self {
            registry: ConnectionRegistry::new(),
            commands: rx,
            sweep_interval: config.sweep_interval(),
            liveness_timeout: config.liveness_timeout(),
            shutdown,
        };
        let task = tokio::spawn(hub.run());
        (HubHandle { commands: tx }, task)
    }

    async fn run(mut self) {
        info!(
            sweep_interval_secs = self.sweep_interval.as_secs(),
            liveness_timeout_secs = self.liveness_timeout.as_secs(),
            "Hub started"
        );

        let mut sweep = interval_at(Instant::now() + self.sweep_interval, self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Hub shutting down");
                    break;
                }
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle(command),
                        None => {
                            debug!("All hub handles dropped");
                            break;
                        }
                    }
                }
                _ = sweep.tick() => {
                    self.sweep();
                }
            }
        }

        self.registry.close_all();
        metrics::record_connection_count(0);
    }

    fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register { handle, done } => {
                self.registry.register(handle);
                self.record_count();
                let _ = done.send(());
            }
            HubCommand::Unregister {
                identity,
                connection,
                done,
            } => {
                let removed = match connection {
                    Some(id) => self.registry.unregister_connection(&identity, id),
                    None => self.registry.unregister(&identity),
                };
                if removed {
                    self.record_count();
                }
                let _ = done.send(removed);
            }
            HubCommand::FanOut { request, report } => {
                let outcome = self.registry.fan_out(&request);
                for (_, result) in &outcome.outcomes {
                    metrics::record_delivery(request.kind.as_str(), result.as_str());
                }
                if outcome.outcomes.iter().any(|(_, r)| *r == SendResult::Dropped) {
                    self.record_count();
                }
                if let Some(report) = report {
                    let _ = report.send(outcome);
                }
            }
            HubCommand::Sweep { done } => {
                let swept = self.sweep();
                let _ = done.send(swept);
            }
            HubCommand::Stats { identity, reply } => {
                let connected = identity
                    .map(|id| self.registry.is_connected(&id))
                    .unwrap_or(false);
                let _ = reply.send((self.registry.connection_count(), connected));
            }
        }
    }

    fn sweep(&mut self) -> Vec<Identity> {
        let swept = self.registry.sweep(self.liveness_timeout);
        if !swept.is_empty() {
            self.record_count();
        }
        swept
    }

    fn record_count(&self) {
        metrics::record_connection_count(self.registry.connection_count() as i64);
    }
}

/// Cloneable handle to the hub task.
///
/// Every method fails with [`RelayError::HubClosed`] once the task is gone.
#[derive(Debug, Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    async fn send(&self, command: HubCommand) -> Result<(), RelayError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| RelayError::HubClosed)
    }

    /// Register a connection. Resolves once the registry has applied it.
    pub async fn register(&self, handle: ConnectionHandle) -> Result<(), RelayError> {
        let (done, rx) = oneshot::channel();
        self.send(HubCommand::Register { handle, done }).await?;
        rx.await.map_err(|_| RelayError::HubClosed)
    }

    /// Unregister whatever connection the identity has. No-op if absent.
    pub async fn unregister(&self, identity: &Identity) -> Result<bool, RelayError> {
        let (done, rx) = oneshot::channel();
        self.send(HubCommand::Unregister {
            identity: identity.clone(),
            connection: None,
            done,
        })
        .await?;
        rx.await.map_err(|_| RelayError::HubClosed)
    }

    /// Unregister the identity only if `id` is still its registered connection.
    pub async fn unregister_connection(
        &self,
        identity: &Identity,
        id: ConnectionId,
    ) -> Result<bool, RelayError> {
        let (done, rx) = oneshot::channel();
        self.send(HubCommand::Unregister {
            identity: identity.clone(),
            connection: Some(id),
            done,
        })
        .await?;
        rx.await.map_err(|_| RelayError::HubClosed)
    }

    /// Queue a fan-out without waiting for it to be applied.
    ///
    /// Requests issued in sequence from one task reach each recipient in
    /// the same sequence.
    pub async fn fan_out(&self, request: FanoutRequest) -> Result<(), RelayError> {
        if request.recipients.is_empty() {
            warn!(kind = request.kind.as_str(), "Fan-out with no recipients");
            return Ok(());
        }
        self.send(HubCommand::FanOut {
            request,
            report: None,
        })
        .await
    }

    /// Fan out and wait for the per-recipient outcomes.
    pub async fn deliver(&self, request: FanoutRequest) -> Result<DeliveryReport, RelayError> {
        let (report, rx) = oneshot::channel();
        self.send(HubCommand::FanOut {
            request,
            report: Some(report),
        })
        .await?;
        rx.await.map_err(|_| RelayError::HubClosed)
    }

    /// Run a liveness sweep now; returns the identities removed.
    pub async fn sweep(&self) -> Result<Vec<Identity>, RelayError> {
        let (done, rx) = oneshot::channel();
        self.send(HubCommand::Sweep { done }).await?;
        rx.await.map_err(|_| RelayError::HubClosed)
    }

    pub async fn connection_count(&self) -> Result<usize, RelayError> {
        self.stats(None).await.map(|(count, _)| count)
    }

    pub async fn is_connected(&self, identity: &Identity) -> Result<bool, RelayError> {
        self.stats(Some(identity.clone()))
            .await
            .map(|(_, connected)| connected)
    }

    async fn stats(&self, identity: Option<Identity>) -> Result<(usize, bool), RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Stats { identity, reply }).await?;
        rx.await.map_err(|_| RelayError::HubClosed)
    }
}
