//! Operational logging setup.
//!
//! Library code logs through the `log` macros; `init_logging` routes those
//! records into a `tracing` subscriber so per-job spans and plain log lines
//! end up in one stream.

use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};
use crate::error::EngineError;

/// Installs the global subscriber. `RUST_LOG` takes precedence over
/// `config.level`.
///
/// Returns an error if a global logger or subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), EngineError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| EngineError::Logging(format!("invalid level '{}': {}", config.level, e)))?,
    };

    tracing_log::LogTracer::init().map_err(|e| EngineError::Logging(e.to_string()))?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.format {
        LogFormat::Text => {
            tracing::subscriber::set_global_default(registry.with(fmt::layer().with_target(true)))
        }
        LogFormat::Compact => {
            tracing::subscriber::set_global_default(registry.with(fmt::layer().compact()))
        }
        LogFormat::Json => tracing::subscriber::set_global_default(
            registry.with(fmt::layer().json().with_current_span(true)),
        ),
    };
    installed.map_err(|e| EngineError::Logging(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        let config = LoggingConfig::default();
        let _ = init_logging(&config);
        assert!(init_logging(&config).is_err());
    }
}
