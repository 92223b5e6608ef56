//! Tracing setup for the replication server processes.

use std::str::FromStr;

use strum_macros::{EnumString, VariantNames};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Output format of the process log.
#[derive(EnumString, VariantNames, Eq, PartialEq, Debug, Clone, Copy)]
#[strum(serialize_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines, for running interactively.
    Plain,
    /// One JSON object per line, for log shippers.
    Json,
}

impl LogFormat {
    pub fn from_config(s: &str) -> anyhow::Result<LogFormat> {
        use strum::VariantNames;
        match LogFormat::from_str(s) {
            Ok(format) => Ok(format),
            Err(_) => anyhow::bail!(
                "unknown log format {s:?}, expected one of {:?}",
                LogFormat::VARIANTS
            ),
        }
    }
}

/// Install the global tracing subscriber, writing to stderr.
///
/// The filter comes from `RUST_LOG` when set, and defaults to `info`:
/// replay progress and lifecycle messages, but not the per-record
/// chatter. Use `RUST_LOG=walreplay=trace` to watch records being
/// classified, or `RUST_LOG=walreplay::replicator=debug` for the
/// replication delay measurements.
pub fn init(format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Plain => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    }
    .map_err(|e| anyhow::anyhow!("failed to install the tracing subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_from_config() {
        assert_eq!(LogFormat::from_config("plain").unwrap(), LogFormat::Plain);
        assert_eq!(LogFormat::from_config("json").unwrap(), LogFormat::Json);
        let err = LogFormat::from_config("no such format").unwrap_err();
        assert!(err.to_string().contains("plain"));
    }
}
