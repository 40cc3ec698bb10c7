//! Tracing subscriber setup

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{OpsError, Result};

/// Default directive when neither `RUST_LOG` nor the config sets one
pub const DEFAULT_FILTER: &str = "share_ops=info";

/// Install a global subscriber. `RUST_LOG` takes precedence over `default_filter`.
///
/// Fails instead of panicking when a subscriber is already installed.
pub fn init_logging(default_filter: Option<&str>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter.unwrap_or(DEFAULT_FILTER)))
        .map_err(|e| OpsError::InvalidConfig {
            message: format!("Failed to create log filter: {}", e),
        })?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| OpsError::InvalidConfig {
            message: format!("Logging already initialized: {}", e),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_an_error() {
        let _ = init_logging(Some("share_ops=debug"));
        assert!(matches!(
            init_logging(None),
            Err(OpsError::InvalidConfig { .. })
        ));
    }
}
