//! Logging setup for Murmur Server.
//!
//! The relay library records OpenTelemetry instruments against the global
//! meter; without an installed provider those are no-ops, so only the
//! tracing subscriber is set up here.

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info,murmur_server=debug,murmur_relay=debug";

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the default filter. With `json` set, events are
/// written as one JSON object per line.
pub fn init(json: bool) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let registry = tracing_subscriber::registry().with(filter);

    let installed = if json {
        registry
            .with(fmt::layer().json().with_target(true).with_current_span(true))
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()
    };
    installed.context("Failed to install tracing subscriber")?;

    tracing::info!(json, "Telemetry initialized");
    Ok(())
}

/// Flush logs before exit.
pub fn shutdown() {
    tracing::info!("Telemetry shutdown complete");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        assert!(DEFAULT_FILTER.parse::<EnvFilter>().is_ok());
    }
}
