//! Metric names emitted by the supervisor's scan loops.
//!
//! Components emit their own counters at their own call sites; the names
//! here are the registry-derived gauges only.

pub mod recorded {
    /// 1.0 while a source is healthy, 0.0 while degraded. Labeled by
    /// source.
    pub const SOURCE_HEALTHY: &str = "riffle_source_healthy";

    /// 1.0 while a sink is healthy, 0.0 while degraded. Labeled by sink.
    pub const SINK_HEALTHY: &str = "riffle_sink_healthy";

    /// Estimated source lag (bytes or records, connector-specific).
    /// Labeled by source.
    pub const SOURCE_LAG: &str = "riffle_source_lag";

    /// Events a pipeline has taken in. Labeled by pipeline.
    pub const PIPELINE_EVENTS_IN: &str = "riffle_pipeline_events_in";

    /// Events a pipeline has dead-lettered. Labeled by pipeline.
    pub const PIPELINE_DEAD_LETTERED: &str = "riffle_pipeline_dead_lettered";
}
