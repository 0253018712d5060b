//! Logging setup.
//!
//! `RUST_LOG` takes precedence over the level passed in.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is not set.
fn default_filter(level: Level) -> EnvFilter {
    EnvFilter::new(format!("stellarium_model_swarm={level},stellarium_swarm={level},warn"))
}

/// Install the global subscriber. Human-readable output unless `json`.
///
/// Calling this more than once keeps the first subscriber.
pub fn init(level: Level, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
    if installed.is_err() {
        tracing::debug!("Logging already initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init(Level::DEBUG, false);
        init(Level::INFO, true);
    }
}
