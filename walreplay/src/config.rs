//! Runtime options for the replication core.
//!
//! Options arrive as a TOML fragment (usually a section of the server's
//! configuration file) and are validated into [`ReplicationConf`].

use std::time::Duration;

use anyhow::{ensure, Context};
use serde::Deserialize;

pub mod defaults {
    pub const DEFAULT_REPLICATION_PARALLEL_COUNT: i64 = 0;
    pub const DEFAULT_LOG_CALC_REPL_DELAY: bool = false;
    /// How long the driver naps when replay has caught up with the log.
    pub const DEFAULT_REPLAY_POLL_INTERVAL_MS: u64 = 1;
}

/// Validated replication options.
#[derive(Debug, Clone)]
pub struct ReplicationConf {
    /// Number of parallel redo workers; 0 replays synchronously on the
    /// driver thread.
    pub parallel_count: usize,
    /// Emit a debug line for every replication delay measurement.
    pub log_calc_repl_delay: bool,
    pub replay_poll_interval: Duration,
}

impl Default for ReplicationConf {
    fn default() -> ReplicationConf {
        ReplicationConf::from_raw(ReplicationConfToml::default())
            .expect("default replication configuration is valid")
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ReplicationConfToml {
    replication_parallel_count: i64,
    log_calc_repl_delay: bool,
    replay_poll_interval_ms: u64,
}

impl Default for ReplicationConfToml {
    fn default() -> ReplicationConfToml {
        ReplicationConfToml {
            replication_parallel_count: defaults::DEFAULT_REPLICATION_PARALLEL_COUNT,
            log_calc_repl_delay: defaults::DEFAULT_LOG_CALC_REPL_DELAY,
            replay_poll_interval_ms: defaults::DEFAULT_REPLAY_POLL_INTERVAL_MS,
        }
    }
}

impl ReplicationConf {
    pub fn parse(input: &str) -> anyhow::Result<ReplicationConf> {
        let raw: ReplicationConfToml =
            toml::from_str(input).context("failed to parse replication configuration")?;
        ReplicationConf::from_raw(raw)
    }

    fn from_raw(raw: ReplicationConfToml) -> anyhow::Result<ReplicationConf> {
        ensure!(
            raw.replication_parallel_count >= 0,
            "replication_parallel_count must be >= 0, got {}",
            raw.replication_parallel_count
        );
        Ok(ReplicationConf {
            parallel_count: raw.replication_parallel_count as usize,
            log_calc_repl_delay: raw.log_calc_repl_delay,
            replay_poll_interval: Duration::from_millis(raw.replay_poll_interval_ms),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_defaults() {
        let conf = ReplicationConf::parse("").unwrap();
        assert_eq!(conf.parallel_count, 0);
        assert!(!conf.log_calc_repl_delay);
        assert_eq!(conf.replay_poll_interval, Duration::from_millis(1));
    }

    #[test]
    fn all_fields_parse() {
        let conf = ReplicationConf::parse(
            r#"
replication_parallel_count = 4
log_calc_repl_delay = true
replay_poll_interval_ms = 10
"#,
        )
        .unwrap();
        assert_eq!(conf.parallel_count, 4);
        assert!(conf.log_calc_repl_delay);
        assert_eq!(conf.replay_poll_interval, Duration::from_millis(10));
    }

    #[test]
    fn negative_parallel_count_is_rejected() {
        assert!(ReplicationConf::parse("replication_parallel_count = -1").is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(ReplicationConf::parse("no_such_option = 1").is_err());
    }
}
