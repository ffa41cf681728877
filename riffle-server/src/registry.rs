//! The statistics registry: one shared handle to every component's live
//! counters, for health scanning and operator tooling.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use riffle_data::{
    PipelineStats, PipelineStatsSnapshot, SinkStats, SinkStatsSnapshot, SourceStats,
    SourceStatsSnapshot,
};
use serde::Serialize;

/// Registry of component statistics, keyed by component name.
///
/// Counter mutation happens through the shared [`Arc`]s handed to the
/// components; the registry itself only reads.
#[derive(Debug, Default)]
pub struct Registry {
    sources: RwLock<BTreeMap<String, Arc<SourceStats>>>,
    sinks: RwLock<BTreeMap<String, Arc<SinkStats>>>,
    pipelines: RwLock<BTreeMap<String, Arc<PipelineStats>>>,
}

impl Registry {
    pub fn register_source(&self, name: &str, stats: Arc<SourceStats>) {
        self.sources.write().insert(name.to_owned(), stats);
    }

    pub fn register_sink(&self, name: &str, stats: Arc<SinkStats>) {
        self.sinks.write().insert(name.to_owned(), stats);
    }

    pub fn register_pipeline(&self, name: &str, stats: Arc<PipelineStats>) {
        self.pipelines.write().insert(name.to_owned(), stats);
    }

    pub fn source(&self, name: &str) -> Option<Arc<SourceStats>> {
        self.sources.read().get(name).cloned()
    }

    pub fn sink(&self, name: &str) -> Option<Arc<SinkStats>> {
        self.sinks.read().get(name).cloned()
    }

    pub fn sources(&self) -> BTreeMap<String, Arc<SourceStats>> {
        self.sources.read().clone()
    }

    pub fn sinks(&self) -> BTreeMap<String, Arc<SinkStats>> {
        self.sinks.read().clone()
    }

    pub fn pipelines(&self) -> BTreeMap<String, Arc<PipelineStats>> {
        self.pipelines.read().clone()
    }

    /// A consistent-enough point-in-time view of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sources: self
                .sources
                .read()
                .iter()
                .map(|(name, stats)| (name.clone(), stats.snapshot()))
                .collect(),
            sinks: self
                .sinks
                .read()
                .iter()
                .map(|(name, stats)| (name.clone(), stats.snapshot()))
                .collect(),
            pipelines: self
                .pipelines
                .read()
                .iter()
                .map(|(name, stats)| (name.clone(), stats.snapshot()))
                .collect(),
        }
    }
}

/// Serializable view of the whole registry, for operator tooling.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub sources: BTreeMap<String, SourceStatsSnapshot>,
    pub sinks: BTreeMap<String, SinkStatsSnapshot>,
    pub pipelines: BTreeMap<String, PipelineStatsSnapshot>,
}
