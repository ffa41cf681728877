//! The flat configuration the core consumes.
//!
//! Parsing files into this structure is the launcher's job; everything here
//! is already validated syntax-wise, and the supervisor validates the
//! cross-references (pipeline sources/sinks) at startup.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use riffle_replicators::SourceConfig;
use riffle_router::PipelineSpec;
use riffle_sinks::SinkConfig;
use serde::{Deserialize, Serialize};

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(30)
}

fn default_health_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_stats_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_staleness_threshold() -> Duration {
    Duration::from_secs(60)
}

fn default_flush_interval() -> Duration {
    Duration::from_millis(100)
}

/// Everything the core needs to run, keyed by component name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub sources: BTreeMap<String, SourceConfig>,
    pub sinks: BTreeMap<String, SinkConfig>,
    pub pipelines: BTreeMap<String, PipelineSpec>,

    /// Bound on clean shutdown; components exceeding it are force-stopped.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: Duration,
    /// Cadence of the degraded-component health scan.
    #[serde(default = "default_health_interval")]
    pub health_interval: Duration,
    /// Cadence of the statistics refresh (gauge emission).
    #[serde(default = "default_stats_interval")]
    pub stats_interval: Duration,
    /// A connected component with no activity for longer than this is
    /// reported degraded.
    #[serde(default = "default_staleness_threshold")]
    pub staleness_threshold: Duration,
    /// Sink batch coalescing window.
    #[serde(default = "default_flush_interval")]
    pub flush_interval: Duration,

    /// Directory for per-pipeline dead-letter files.
    #[serde(default)]
    pub dead_letter_dir: Option<PathBuf>,
    /// Connection string of the external position store, for sources whose
    /// cursor is client-side. Absent means server-side cursors only.
    #[serde(default)]
    pub position_store_dsn: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            sources: BTreeMap::new(),
            sinks: BTreeMap::new(),
            pipelines: BTreeMap::new(),
            shutdown_grace: default_shutdown_grace(),
            health_interval: default_health_interval(),
            stats_interval: default_stats_interval(),
            staleness_threshold: default_staleness_threshold(),
            flush_interval: default_flush_interval(),
            dead_letter_dir: None,
            position_store_dsn: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::default();
        assert_eq!(config.shutdown_grace, Duration::from_secs(30));
        assert_eq!(config.health_interval, Duration::from_secs(30));
        assert_eq!(config.staleness_threshold, Duration::from_secs(60));
        assert_eq!(config.flush_interval, Duration::from_millis(100));
    }

    #[test]
    fn deserializes_with_defaults_filled_in() {
        let json = serde_json::json!({
            "sources": {},
            "sinks": {},
            "pipelines": {}
        });
        let config: Config = serde_json::from_value(json).unwrap();
        assert_eq!(config.flush_interval, Duration::from_millis(100));
        assert!(config.dead_letter_dir.is_none());
    }
}
