//! Tracing subscriber setup and run metrics.
//!
//! Library code only emits `tracing` events; binaries call [`init_tracing`]
//! once to decide where they go.

mod metrics;

pub use metrics::{Metrics, NoOpMetrics, PrometheusMetrics};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};
use crate::errors::{JobflowError, Result};

/// Installs the global subscriber.
///
/// `RUST_LOG` wins over `config.filter` when set. Fails if a subscriber is
/// already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => parse_filter(&config.filter)?,
    };
    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.format {
        LogFormat::Pretty => registry.with(fmt::layer().with_target(true)).try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true).with_span_list(false))
            .try_init(),
    };
    installed.map_err(|e| JobflowError::Config(format!("cannot install tracing subscriber: {e}")))
}

/// Parses `EnvFilter` directives.
pub fn parse_filter(directives: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(directives)
        .map_err(|e| JobflowError::Config(format!("invalid log filter '{directives}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_filter() {
        assert!(parse_filter("jobflow=info").is_ok());
        assert!(parse_filter("jobflow=debug,reqwest=warn").is_ok());
        assert!(parse_filter("jobflow=loud").is_err());
    }
}
