//! The router: matches incoming changes to pipelines and dispatches them
//! to sink ingest queues, tracking per-source watermarks for acking.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use riffle_data::Change;
use riffle_errors::{internal_err, RiffleError, RiffleResult};
use riffle_position::Position;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::pipeline::{Pipeline, PipelineSpec};
use crate::watermark::WatermarkTracker;

/// One change en route to (or retrying against) a sink, for one pipeline.
#[derive(Debug, Clone)]
pub struct SinkJob {
    pub pipeline: Arc<Pipeline>,
    pub change: Arc<Change>,
    /// Source the change came from, for completion reporting.
    pub source: String,
    /// Per-source ingress sequence number.
    pub seq: u64,
    /// Delivery attempt, 1-based.
    pub attempt: u32,
    /// Whether to write with upsert semantics (true on every retry).
    pub upsert: bool,
    pub first_seen: DateTime<Utc>,
    /// Dispatch time, for pipeline latency accounting.
    pub enqueued: Instant,
}

struct SourceEntry {
    tracker: Mutex<WatermarkTracker>,
    ack_tx: mpsc::UnboundedSender<Position>,
}

struct RouterInner {
    /// Sorted by name: matching iterates pipelines in deterministic order.
    pipelines: RwLock<BTreeMap<String, Arc<Pipeline>>>,
    sources: RwLock<HashMap<String, SourceEntry>>,
    sinks: RwLock<HashMap<String, mpsc::Sender<SinkJob>>>,
}

/// Shared handle to the routing engine. Cheap to clone; one per source
/// task, sink task, and the supervisor.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Router {
            inner: Arc::new(RouterInner {
                pipelines: RwLock::new(BTreeMap::new()),
                sources: RwLock::new(HashMap::new()),
                sinks: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register a source and the channel its acks flow back through.
    pub fn register_source(&self, name: &str, ack_tx: mpsc::UnboundedSender<Position>) {
        self.inner.sources.write().insert(
            name.to_owned(),
            SourceEntry {
                tracker: Mutex::new(WatermarkTracker::default()),
                ack_tx,
            },
        );
    }

    /// Register a sink's ingest queue.
    pub fn register_sink(&self, name: &str, tx: mpsc::Sender<SinkJob>) {
        self.inner.sinks.write().insert(name.to_owned(), tx);
    }

    /// Register a pipeline, validating its references and filter.
    pub fn register_pipeline(&self, name: &str, spec: &PipelineSpec) -> RiffleResult<Arc<Pipeline>> {
        if !self.inner.sources.read().contains_key(&spec.source) {
            return Err(RiffleError::UnknownSource(spec.source.clone()));
        }
        if !self.inner.sinks.read().contains_key(&spec.sink) {
            return Err(RiffleError::UnknownSink(spec.sink.clone()));
        }
        let mut pipelines = self.inner.pipelines.write();
        if pipelines.contains_key(name) {
            return Err(RiffleError::DuplicateName(name.to_owned()));
        }
        let pipeline = Pipeline::from_spec(name, spec)?;
        pipelines.insert(name.to_owned(), Arc::clone(&pipeline));
        Ok(pipeline)
    }

    pub fn enable(&self, name: &str) -> RiffleResult<()> {
        self.with_pipeline(name, |p| p.enable())
    }

    pub fn disable(&self, name: &str) -> RiffleResult<()> {
        self.with_pipeline(name, |p| p.disable())
    }

    fn with_pipeline(&self, name: &str, f: impl FnOnce(&Pipeline)) -> RiffleResult<()> {
        match self.inner.pipelines.read().get(name) {
            Some(p) => {
                f(p);
                Ok(())
            }
            None => Err(internal_err!("no such pipeline {name}")),
        }
    }

    /// Every registered pipeline, sorted by name.
    pub fn pipelines(&self) -> Vec<Arc<Pipeline>> {
        self.inner.pipelines.read().values().cloned().collect()
    }

    /// Route one change from `source`.
    ///
    /// Blocks when a matched sink's ingest queue is full; that is the
    /// back-pressure path, and it stalls the calling source task.
    pub async fn on_change(&self, source: &str, change: Change) -> RiffleResult<()> {
        let change = Arc::new(change);

        // Matching runs under the read lock; sends happen after it drops.
        let matched: Vec<Arc<Pipeline>> = {
            let pipelines = self.inner.pipelines.read();
            pipelines
                .values()
                .filter(|p| {
                    p.source_name() == source && p.is_enabled() && p.filter().matches(&change)
                })
                .cloned()
                .collect()
        };

        let (seq, immediate_ack) = {
            let sources = self.inner.sources.read();
            let entry = sources
                .get(source)
                .ok_or_else(|| internal_err!("unregistered source {source}"))?;
            let (seq, ackable) = entry
                .tracker
                .lock()
                .register(change.position().clone(), matched.len());
            if let Some(position) = &ackable {
                let _ = entry.ack_tx.send(position.clone());
            }
            (seq, ackable.is_some())
        };

        counter!("riffle_router_changes_total", "source" => source.to_owned()).increment(1);
        if immediate_ack {
            trace!(source, seq, "change matched no pipeline, acked through");
            return Ok(());
        }

        let now = Utc::now();
        for pipeline in matched {
            pipeline.stats().record_in();
            let tx = self
                .inner
                .sinks
                .read()
                .get(pipeline.sink_name())
                .cloned()
                .ok_or_else(|| internal_err!("unregistered sink {}", pipeline.sink_name()))?;
            let job = SinkJob {
                source: source.to_owned(),
                change: Arc::clone(&change),
                seq,
                attempt: 1,
                upsert: false,
                first_seen: now,
                enqueued: Instant::now(),
                pipeline,
            };
            tx.send(job)
                .await
                .map_err(|_| internal_err!("sink ingest queue closed"))?;
        }
        Ok(())
    }

    /// Record a terminal outcome for `(source, seq)` from one pipeline, and
    /// forward any newly ackable watermark to the source.
    pub fn complete(&self, source: &str, seq: u64) {
        let sources = self.inner.sources.read();
        let Some(entry) = sources.get(source) else {
            debug!(source, seq, "completion for unregistered source");
            return;
        };
        if let Some(position) = entry.tracker.lock().complete(seq) {
            let _ = entry.ack_tx.send(position);
        }
    }

    /// The current watermark of a source, if it has one.
    pub fn watermark(&self, source: &str) -> Option<Position> {
        self.inner
            .sources
            .read()
            .get(source)
            .and_then(|e| e.tracker.lock().watermark().cloned())
    }
}
