//! The lifecycle supervisor: owns every task, starts components in
//! dependency order, and binds everything to one root shutdown signal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use riffle_data::Change;
use riffle_errors::{internal_err, RiffleError, RiffleResult};
use riffle_position::Position;
use riffle_replicators::{
    build_connector, Connector, NoopPositionStore, PositionStore, PostgresPositionStore,
};
use riffle_router::{run_sink, FileDeadLetterStore, DeadLetterStore, Router};
use riffle_sinks::{build_sink, SinkWriter};
use riffle_util::shutdown::{self, ShutdownReceiver, ShutdownSender};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::health::health_scan_loop;
use crate::metrics::recorded;
use crate::registry::{Registry, StatsSnapshot};

/// Sink ingest queues hold this many batches' worth of changes.
const QUEUE_FACTOR: usize = 4;

/// Attempts to connect a component before startup fails.
const CONNECT_ATTEMPTS: u32 = 3;

/// How long the ack drain may starve while a source is idle.
const ACK_DRAIN_INTERVAL: Duration = Duration::from_millis(250);

/// The constructed-but-not-started component set.
///
/// [`Components::from_config`] builds the real connectors and sinks; tests
/// inject scripted ones through the same struct.
pub struct Components {
    pub connectors: HashMap<String, Box<dyn Connector>>,
    pub sinks: HashMap<String, Box<dyn SinkWriter>>,
    pub position_store: Arc<dyn PositionStore>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
}

impl Components {
    pub async fn from_config(config: &Config) -> RiffleResult<Self> {
        let mut connectors: HashMap<String, Box<dyn Connector>> = HashMap::new();
        for (name, source_config) in &config.sources {
            connectors.insert(
                name.clone(),
                build_connector(name, source_config, Default::default())?,
            );
        }
        let mut sinks: HashMap<String, Box<dyn SinkWriter>> = HashMap::new();
        for (name, sink_config) in &config.sinks {
            sinks.insert(name.clone(), build_sink(name, sink_config, Default::default())?);
        }
        let position_store: Arc<dyn PositionStore> = match &config.position_store_dsn {
            Some(dsn) => Arc::new(PostgresPositionStore::connect(dsn).await?),
            None => Arc::new(NoopPositionStore),
        };
        let dead_letter_dir = config
            .dead_letter_dir
            .clone()
            .unwrap_or_else(|| "dead-letters".into());
        Ok(Components {
            connectors,
            sinks,
            position_store,
            dead_letters: Arc::new(FileDeadLetterStore::new(dead_letter_dir)),
        })
    }
}

/// A running core. Dropping it does not stop anything; call
/// [`Supervisor::shutdown`].
pub struct Supervisor {
    shutdown_tx: ShutdownSender,
    tasks: Vec<(String, JoinHandle<()>)>,
    router: Router,
    registry: Arc<Registry>,
    shutdown_grace: Duration,
}

impl Supervisor {
    /// Construct components from configuration and start them.
    pub async fn start(config: Config) -> RiffleResult<Supervisor> {
        let components = Components::from_config(&config).await?;
        Self::start_with(config, components).await
    }

    /// Start pre-built components. Connects sinks first, then sources,
    /// registers pipelines once both sides are ready, and finally spawns
    /// the worker tasks.
    pub async fn start_with(config: Config, components: Components) -> RiffleResult<Supervisor> {
        let Components {
            mut connectors,
            sinks,
            position_store,
            dead_letters,
        } = components;

        for name in config.pipelines.values().map(|p| &p.source) {
            if !connectors.contains_key(name) {
                return Err(RiffleError::UnknownSource(name.clone()));
            }
        }
        for name in config.pipelines.values().map(|p| &p.sink) {
            if !sinks.contains_key(name) {
                return Err(RiffleError::UnknownSink(name.clone()));
            }
        }

        let registry = Arc::new(Registry::default());
        let router = Router::new();
        let (shutdown_tx, shutdown_rx) = shutdown::channel();
        let mut tasks: Vec<(String, JoinHandle<()>)> = Vec::new();

        // Sinks connect first: a source must never stream into nothing.
        let mut connected_sinks: HashMap<String, Box<dyn SinkWriter>> = HashMap::new();
        for (name, mut sink) in sinks {
            connect_sink_with_retry(&name, sink.as_mut()).await?;
            registry.register_sink(&name, sink.stats());
            connected_sinks.insert(name, sink);
        }

        // Then sources, seeded from the position store.
        let mut ack_channels: HashMap<String, mpsc::UnboundedReceiver<Position>> = HashMap::new();
        for (name, connector) in connectors.iter_mut() {
            if let Some(position) = position_store.load(name).await? {
                connector.seed_position(&position)?;
            }
            connect_source_with_retry(name, connector.as_mut()).await?;
            registry.register_source(name, connector.stats());
            let (ack_tx, ack_rx) = mpsc::unbounded_channel();
            router.register_source(name, ack_tx);
            ack_channels.insert(name.clone(), ack_rx);
        }

        // Sink ingest queues are bounded by the referencing pipelines'
        // batch sizes; a full queue is the back-pressure signal.
        let mut sink_queues: HashMap<String, mpsc::Sender<riffle_router::SinkJob>> =
            HashMap::new();
        let mut sink_queue_rxs = HashMap::new();
        for name in connected_sinks.keys() {
            let max_batch = config
                .pipelines
                .values()
                .filter(|p| &p.sink == name)
                .map(|p| p.batch_size)
                .max()
                .unwrap_or(1)
                .max(1);
            let (tx, rx) = mpsc::channel(max_batch * QUEUE_FACTOR);
            router.register_sink(name, tx.clone());
            sink_queues.insert(name.clone(), tx);
            sink_queue_rxs.insert(name.clone(), rx);
        }

        // Pipelines register only after both of their ends are ready.
        for (name, spec) in &config.pipelines {
            let pipeline = router.register_pipeline(name, spec)?;
            registry.register_pipeline(name, pipeline.stats());
            info!(
                pipeline = %name,
                source = %spec.source,
                sink = %spec.sink,
                enabled = spec.enabled,
                "pipeline registered"
            );
        }

        // Worker tasks: one per sink, one per source, plus the scan loops.
        for (name, sink) in connected_sinks {
            let rx = sink_queue_rxs
                .remove(&name)
                .ok_or_else(|| internal_err!("no ingest queue for sink {name}"))?;
            let tx = sink_queues
                .get(&name)
                .cloned()
                .ok_or_else(|| internal_err!("no ingest queue for sink {name}"))?;
            let task = tokio::spawn(run_sink(
                sink,
                rx,
                tx,
                router.clone(),
                Arc::clone(&dead_letters),
                config.flush_interval,
                shutdown_rx.clone(),
            ));
            tasks.push((format!("sink/{name}"), task));
        }

        for (name, connector) in connectors {
            let ack_rx = ack_channels
                .remove(&name)
                .ok_or_else(|| internal_err!("no ack channel for source {name}"))?;
            let task = tokio::spawn(source_task(
                name.clone(),
                connector,
                router.clone(),
                Arc::clone(&position_store),
                ack_rx,
                shutdown_rx.clone(),
            ));
            tasks.push((format!("source/{name}"), task));
        }

        tasks.push((
            "health-scan".into(),
            tokio::spawn(health_scan_loop(
                Arc::clone(&registry),
                config.clone(),
                shutdown_rx.clone(),
            )),
        ));
        tasks.push((
            "stats-refresh".into(),
            tokio::spawn(stats_refresh_loop(
                Arc::clone(&registry),
                config.stats_interval,
                shutdown_rx.clone(),
            )),
        ));
        drop(shutdown_rx);

        info!("riffle core started");
        Ok(Supervisor {
            shutdown_tx,
            tasks,
            router,
            registry,
            shutdown_grace: config.shutdown_grace,
        })
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.registry.snapshot()
    }

    /// Stop everything: sources first (they share the root signal and stop
    /// pulling), sinks finish their current batch, and positions get their
    /// final commit in the source tasks. Tasks exceeding the grace period
    /// are force-stopped and logged.
    pub async fn shutdown(self) -> RiffleResult<()> {
        info!("shutting down riffle core");
        self.shutdown_tx.signal();
        let deadline = tokio::time::Instant::now() + self.shutdown_grace;
        for (name, mut task) in self.tasks {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    error!(task = %name, %join_err, "task panicked during shutdown")
                }
                Err(_) => {
                    warn!(task = %name, grace = ?self.shutdown_grace, "task exceeded shutdown grace, force-stopping");
                    task.abort();
                }
            }
        }
        info!("riffle core stopped");
        Ok(())
    }
}

/// Retry a sink connect a few times with a short backoff before giving up
/// on startup.
async fn connect_sink_with_retry(name: &str, sink: &mut dyn SinkWriter) -> RiffleResult<()> {
    let mut delay = Duration::from_millis(500);
    for attempt in 1..=CONNECT_ATTEMPTS {
        match sink.connect().await {
            Ok(()) => return Ok(()),
            Err(err) if attempt < CONNECT_ATTEMPTS && err.is_transient() => {
                warn!(component = %name, attempt, %err, ?delay, "connect failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(err) => return Err(err),
        }
    }
    unreachable!("loop either returns or errors on the last attempt")
}

/// As [`connect_sink_with_retry`], for source connectors.
async fn connect_source_with_retry(name: &str, connector: &mut dyn Connector) -> RiffleResult<()> {
    let mut delay = Duration::from_millis(500);
    for attempt in 1..=CONNECT_ATTEMPTS {
        match connector.connect().await {
            Ok(()) => return Ok(()),
            Err(err) if attempt < CONNECT_ATTEMPTS && err.is_transient() => {
                warn!(component = %name, attempt, %err, ?delay, "connect failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(err) => return Err(err),
        }
    }
    unreachable!("loop either returns or errors on the last attempt")
}

/// The per-source pump: pull changes into the router, and feed router acks
/// back into the connector and the position store.
async fn source_task(
    name: String,
    mut connector: Box<dyn Connector>,
    router: Router,
    position_store: Arc<dyn PositionStore>,
    mut ack_rx: mpsc::UnboundedReceiver<Position>,
    mut shutdown: ShutdownReceiver,
) {
    loop {
        // Acks are non-blocking on the router side; they drain here,
        // between pulls. The commit is serialized by this task, so at most
        // one is in flight per source.
        if let Some(position) = drain_acks(&mut ack_rx, connector.as_mut(), &name) {
            if let Err(err) = position_store.commit(&name, &position).await {
                warn!(source = %name, %err, "position commit failed");
            }
        }

        let pulled = tokio::select! {
            _ = shutdown.recv() => break,
            pulled = tokio::time::timeout(ACK_DRAIN_INTERVAL, connector.next_change()) => pulled,
        };
        let change: Change = match pulled {
            // Idle window; loop around to drain acks.
            Err(_) => continue,
            Ok(Ok(change)) => change,
            Ok(Err(err)) => {
                // Transient errors were already absorbed by the connector's
                // own reconnect machinery; anything surfacing here stops
                // this source while the rest of the core keeps running.
                error!(source = %name, %err, "source stopped");
                break;
            }
        };

        if let Err(err) = router.on_change(&name, change).await {
            error!(source = %name, %err, "routing failed, stopping source");
            break;
        }
    }

    // Final drain and commit before letting go of the connector.
    if let Some(position) = drain_acks(&mut ack_rx, connector.as_mut(), &name) {
        if let Err(err) = position_store.commit(&name, &position).await {
            warn!(source = %name, %err, "final position commit failed");
        }
    }
    if let Err(err) = connector.disconnect().await {
        warn!(source = %name, %err, "source disconnect failed");
    }
    info!(source = %name, "source task stopped");
}

/// Apply every queued ack to the connector; returns the last one for the
/// position store.
fn drain_acks(
    ack_rx: &mut mpsc::UnboundedReceiver<Position>,
    connector: &mut dyn Connector,
    name: &str,
) -> Option<Position> {
    let mut last = None;
    while let Ok(position) = ack_rx.try_recv() {
        if let Err(err) = connector.ack(&position) {
            warn!(source = %name, %err, "ack rejected");
            continue;
        }
        last = Some(position);
    }
    last
}

/// Emit registry-derived gauges on a fixed cadence.
async fn stats_refresh_loop(
    registry: Arc<Registry>,
    interval: Duration,
    mut shutdown: ShutdownReceiver,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {}
        }
        for (name, stats) in registry.sources() {
            let snapshot = stats.snapshot();
            metrics::gauge!(recorded::SOURCE_LAG, "source" => name).set(snapshot.lag_estimate as f64);
        }
        for (name, stats) in registry.pipelines() {
            let snapshot = stats.snapshot();
            metrics::gauge!(recorded::PIPELINE_EVENTS_IN, "pipeline" => name.clone())
                .set(snapshot.events_in as f64);
            metrics::gauge!(recorded::PIPELINE_DEAD_LETTERED, "pipeline" => name)
                .set(snapshot.dead_lettered as f64);
        }
    }
}
