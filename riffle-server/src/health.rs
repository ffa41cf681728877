//! Health evaluation and the periodic scan loop.
//!
//! Health is derived from the statistics registry: a component is healthy
//! while it is connected and has been active recently (or has had nothing
//! to do yet). The scan only reports; recovery is the owning connector's
//! reconnect machinery, never a restart from here.

use std::time::Duration;

use chrono::Utc;
use riffle_data::{SinkStats, SourceStats};
use riffle_util::shutdown::ShutdownReceiver;
use serde::Serialize;
use tracing::{debug, warn};

use crate::registry::Registry;
use crate::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Degraded,
}

fn freshness_health(
    connected: bool,
    last_activity: Option<chrono::DateTime<Utc>>,
    staleness_threshold: Duration,
) -> Health {
    if !connected {
        return Health::Degraded;
    }
    match last_activity {
        // Nothing attempted yet counts as healthy.
        None => Health::Healthy,
        Some(at) => {
            let age = Utc::now().signed_duration_since(at);
            if age.to_std().map_or(true, |age| age < staleness_threshold) {
                Health::Healthy
            } else {
                Health::Degraded
            }
        }
    }
}

pub fn source_health(stats: &SourceStats, staleness_threshold: Duration) -> Health {
    let snapshot = stats.snapshot();
    freshness_health(snapshot.connected, snapshot.last_event_time, staleness_threshold)
}

pub fn sink_health(stats: &SinkStats, staleness_threshold: Duration) -> Health {
    let snapshot = stats.snapshot();
    freshness_health(snapshot.connected, snapshot.last_write_time, staleness_threshold)
}

/// A pipeline is only as healthy as the worse of its two ends.
pub fn pipeline_health(source: Health, sink: Health) -> Health {
    if source == Health::Degraded || sink == Health::Degraded {
        Health::Degraded
    } else {
        Health::Healthy
    }
}

/// Periodically log degraded components until shutdown.
pub(crate) async fn health_scan_loop(
    registry: std::sync::Arc<Registry>,
    config: Config,
    mut shutdown: ShutdownReceiver,
) {
    let mut interval = tokio::time::interval(config.health_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = interval.tick() => {}
        }

        for (name, stats) in registry.sources() {
            if source_health(&stats, config.staleness_threshold) == Health::Degraded {
                warn!(source = %name, "source degraded");
                metrics::gauge!(crate::metrics::recorded::SOURCE_HEALTHY, "source" => name)
                    .set(0.0);
            } else {
                metrics::gauge!(crate::metrics::recorded::SOURCE_HEALTHY, "source" => name)
                    .set(1.0);
            }
        }
        for (name, stats) in registry.sinks() {
            if sink_health(&stats, config.staleness_threshold) == Health::Degraded {
                warn!(sink = %name, "sink degraded");
                metrics::gauge!(crate::metrics::recorded::SINK_HEALTHY, "sink" => name).set(0.0);
            } else {
                metrics::gauge!(crate::metrics::recorded::SINK_HEALTHY, "sink" => name).set(1.0);
            }
        }
        debug!("health scan complete");
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use riffle_data::ChangeOp;

    use super::*;

    const STALENESS: Duration = Duration::from_secs(60);

    #[test]
    fn disconnected_is_degraded() {
        let stats = SourceStats::default();
        assert_eq!(source_health(&stats, STALENESS), Health::Degraded);
    }

    #[test]
    fn connected_but_idle_is_healthy_before_first_event() {
        let stats = SourceStats::default();
        stats.set_connected(true);
        assert_eq!(source_health(&stats, STALENESS), Health::Healthy);
    }

    #[test]
    fn recent_activity_is_healthy() {
        let stats = SinkStats::default();
        stats.set_connected(true);
        stats.record_write(ChangeOp::Insert, true, Duration::from_millis(1));
        assert_eq!(sink_health(&stats, STALENESS), Health::Healthy);
    }

    #[test]
    fn stale_activity_is_degraded() {
        let stats = SinkStats::default();
        stats.set_connected(true);
        stats.record_write(ChangeOp::Insert, true, Duration::from_millis(1));
        // A zero threshold makes any recorded activity stale.
        assert_eq!(sink_health(&stats, Duration::ZERO), Health::Degraded);
    }

    #[test]
    fn pipeline_health_is_the_minimum() {
        assert_eq!(
            pipeline_health(Health::Healthy, Health::Healthy),
            Health::Healthy
        );
        assert_eq!(
            pipeline_health(Health::Healthy, Health::Degraded),
            Health::Degraded
        );
        assert_eq!(
            pipeline_health(Health::Degraded, Health::Healthy),
            Health::Degraded
        );
    }
}
