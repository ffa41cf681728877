//! End-to-end scenarios over scripted sources and in-memory sinks: the
//! full supervisor wiring, minus live servers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use riffle_data::{Change, ChangeMeta, ChangeOp, Row, SinkStats, SourceStats, TableIdent, Value};
use riffle_errors::WriteErrorKind;
use riffle_position::Position;
use riffle_replicators::testing::{ScriptedConnector, ScriptedSource};
use riffle_replicators::{Connector, MemoryPositionStore, PositionStore};
use riffle_router::{DeadLetterStore, MemoryDeadLetterStore, PipelineSpec, RetryPolicy,
    RetryPolicyKind};
use riffle_server::{Components, Config, Supervisor};
use riffle_sinks::testing::{MemorySink, MemorySinkState};
use riffle_sinks::SinkWriter;

fn pos(n: u64) -> Position {
    Position::from_bytes(n.to_be_bytes().to_vec())
}

fn row(cols: &[(&str, Value)]) -> Row {
    cols.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn insert(table: &str, position: u64, cols: &[(&str, Value)]) -> Change {
    Change::new(
        ChangeOp::Insert,
        TableIdent::new("app", "public", table),
        None,
        Some(row(cols)),
        ChangeMeta::default(),
        pos(position),
    )
    .unwrap()
}

fn update(table: &str, position: u64, cols: &[(&str, Value)]) -> Change {
    Change::new(
        ChangeOp::Update,
        TableIdent::new("app", "public", table),
        None,
        Some(row(cols)),
        ChangeMeta::default(),
        pos(position),
    )
    .unwrap()
}

fn delete(table: &str, position: u64, key: &[(&str, Value)]) -> Change {
    Change::new(
        ChangeOp::Delete,
        TableIdent::new("app", "public", table),
        Some(row(key)),
        None,
        ChangeMeta::default(),
        pos(position),
    )
    .unwrap()
}

struct Fixture {
    config: Config,
    source: Arc<ScriptedSource>,
    sink_states: HashMap<String, Arc<MemorySinkState>>,
    dead_letters: Arc<MemoryDeadLetterStore>,
    position_store: Arc<MemoryPositionStore>,
}

impl Fixture {
    /// One scripted source named `orders`, one in-memory sink per entry of
    /// `sinks`, and one pipeline per `(name, sink, filter)` triple.
    fn new(sinks: &[&str], pipelines: &[(&str, &str, Option<&str>)]) -> Fixture {
        let mut config = Config {
            flush_interval: Duration::from_millis(5),
            shutdown_grace: Duration::from_secs(5),
            ..Config::default()
        };
        for (name, sink, filter) in pipelines {
            config.pipelines.insert(
                name.to_string(),
                PipelineSpec {
                    source: "orders".into(),
                    sink: sink.to_string(),
                    filter_expression: filter.map(str::to_owned),
                    batch_size: 4,
                    retry_policy: RetryPolicy {
                        kind: RetryPolicyKind::Exponential,
                        base_delay: Duration::from_millis(5),
                        max_delay: Duration::from_millis(20),
                        jitter_fraction: 0.0,
                    },
                    max_retries: 2,
                    ..Default::default()
                },
            );
        }
        Fixture {
            config,
            source: Arc::new(ScriptedSource::default()),
            sink_states: sinks
                .iter()
                .map(|s| (s.to_string(), Arc::new(MemorySinkState::default())))
                .collect(),
            dead_letters: Arc::new(MemoryDeadLetterStore::default()),
            position_store: Arc::new(MemoryPositionStore::default()),
        }
    }

    fn components(&self) -> Components {
        let mut connectors: HashMap<String, Box<dyn Connector>> = HashMap::new();
        connectors.insert(
            "orders".into(),
            Box::new(ScriptedConnector::new(
                "orders",
                Arc::clone(&self.source),
                Arc::new(SourceStats::default()),
            )),
        );
        let mut sinks: HashMap<String, Box<dyn SinkWriter>> = HashMap::new();
        for (name, state) in &self.sink_states {
            sinks.insert(
                name.clone(),
                Box::new(MemorySink::new(
                    name,
                    Arc::clone(state),
                    Arc::new(SinkStats::default()),
                )),
            );
        }
        Components {
            connectors,
            sinks,
            position_store: Arc::clone(&self.position_store) as Arc<dyn PositionStore>,
            dead_letters: Arc::clone(&self.dead_letters) as Arc<dyn DeadLetterStore>,
        }
    }

    fn sink(&self, name: &str) -> &Arc<MemorySinkState> {
        &self.sink_states[name]
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within the deadline"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn single_table_insert_replication() {
    let fixture = Fixture::new(&["backup"], &[("orders-backup", "backup", None)]);
    let supervisor = Supervisor::start_with(fixture.config.clone(), fixture.components())
        .await
        .unwrap();

    fixture.source.push(insert(
        "orders",
        1,
        &[("id", Value::Int(7)), ("amount", Value::Int(100))],
    ));

    let key = row(&[("id", Value::Int(7))]);
    wait_until(|| fixture.sink("backup").row("orders", &key).is_some()).await;
    wait_until(|| fixture.source.watermark() == Some(pos(1))).await;

    let stored = fixture.sink("backup").row("orders", &key).unwrap();
    assert_eq!(stored["amount"], Value::Int(100));

    let stats = supervisor.stats();
    assert_eq!(stats.pipelines["orders-backup"].events_in, 1);
    assert_eq!(stats.pipelines["orders-backup"].events_ok, 1);
    assert_eq!(stats.sinks["backup"].writes_ok, 1);
    supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn update_after_insert_keeps_source_order() {
    let fixture = Fixture::new(&["backup"], &[("orders-backup", "backup", None)]);
    let supervisor = Supervisor::start_with(fixture.config.clone(), fixture.components())
        .await
        .unwrap();

    fixture.source.push(insert(
        "orders",
        1,
        &[("id", Value::Int(9)), ("amount", Value::Int(10))],
    ));
    fixture.source.push(update(
        "orders",
        2,
        &[("id", Value::Int(9)), ("amount", Value::Int(20))],
    ));

    wait_until(|| fixture.source.watermark() == Some(pos(2))).await;
    let key = row(&[("id", Value::Int(9))]);
    let stored = fixture.sink("backup").row("orders", &key).unwrap();
    assert_eq!(stored["amount"], Value::Int(20), "the update applied last");
    supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn delete_of_missing_row_succeeds() {
    let fixture = Fixture::new(&["backup"], &[("orders-backup", "backup", None)]);
    let supervisor = Supervisor::start_with(fixture.config.clone(), fixture.components())
        .await
        .unwrap();

    fixture
        .source
        .push(delete("orders", 1, &[("id", Value::Int(42))]));

    wait_until(|| fixture.source.watermark() == Some(pos(1))).await;
    let stats = supervisor.stats();
    assert_eq!(stats.sinks["backup"].writes_ok, 1);
    assert_eq!(stats.pipelines["orders-backup"].dead_lettered, 0);
    supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn schema_mismatch_dead_letters_and_advances_watermark() {
    let fixture = Fixture::new(&["backup"], &[("orders-backup", "backup", None)]);
    fixture
        .sink("backup")
        .inject_failure(WriteErrorKind::SchemaMismatch);
    let supervisor = Supervisor::start_with(fixture.config.clone(), fixture.components())
        .await
        .unwrap();

    fixture.source.push(insert(
        "orders",
        1,
        &[("id", Value::Int(1)), ("surprise", Value::Int(1))],
    ));

    wait_until(|| !fixture.dead_letters.records("orders-backup").is_empty()).await;
    wait_until(|| fixture.source.watermark() == Some(pos(1))).await;

    let records = fixture.dead_letters.records("orders-backup");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].attempts, 1);
    assert_eq!(records[0].last_error_kind, WriteErrorKind::SchemaMismatch);
    supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn fan_out_reaches_both_sinks_and_acks_once() {
    let fixture = Fixture::new(
        &["backup", "analytics"],
        &[
            ("orders-analytics", "analytics", None),
            ("orders-backup", "backup", None),
        ],
    );
    let supervisor = Supervisor::start_with(fixture.config.clone(), fixture.components())
        .await
        .unwrap();

    fixture.source.push(insert(
        "orders",
        1,
        &[("id", Value::Int(7)), ("amount", Value::Int(100))],
    ));

    let key = row(&[("id", Value::Int(7))]);
    wait_until(|| fixture.sink("backup").row("orders", &key).is_some()).await;
    wait_until(|| fixture.sink("analytics").row("orders", &key).is_some()).await;
    wait_until(|| fixture.source.watermark() == Some(pos(1))).await;

    // Exactly once in each sink, and exactly one ack.
    assert_eq!(fixture.sink("backup").row_count("orders"), 1);
    assert_eq!(fixture.sink("analytics").row_count("orders"), 1);
    assert_eq!(fixture.source.acked().len(), 1);
    supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn filtered_changes_never_reach_the_sink() {
    let fixture = Fixture::new(
        &["backup"],
        &[("orders-backup", "backup", Some("table:orders"))],
    );
    let supervisor = Supervisor::start_with(fixture.config.clone(), fixture.components())
        .await
        .unwrap();

    fixture
        .source
        .push(insert("users", 1, &[("id", Value::Int(1))]));
    fixture
        .source
        .push(insert("orders", 2, &[("id", Value::Int(2))]));

    wait_until(|| fixture.source.watermark() == Some(pos(2))).await;
    assert_eq!(fixture.sink("backup").row_count("users"), 0);
    assert_eq!(fixture.sink("backup").row_count("orders"), 1);
    supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn restart_and_replay_is_idempotent() {
    let fixture = Fixture::new(&["backup"], &[("orders-backup", "backup", None)]);
    let changes = vec![
        insert("orders", 1, &[("id", Value::Int(1)), ("amount", Value::Int(10))]),
        insert("orders", 2, &[("id", Value::Int(2)), ("amount", Value::Int(20))]),
        update("orders", 3, &[("id", Value::Int(1)), ("amount", Value::Int(11))]),
    ];

    // First run processes everything and stops cleanly.
    let supervisor = Supervisor::start_with(fixture.config.clone(), fixture.components())
        .await
        .unwrap();
    for c in &changes {
        fixture.source.push(c.clone());
    }
    wait_until(|| fixture.source.watermark() == Some(pos(3))).await;
    supervisor.shutdown().await.unwrap();

    // Second run replays the same changes against the surviving sink state.
    let supervisor = Supervisor::start_with(fixture.config.clone(), fixture.components())
        .await
        .unwrap();
    for c in &changes {
        fixture.source.push(c.clone());
    }
    // All three replayed writes have landed (three from each run).
    wait_until(|| fixture.sink("backup").applied().len() >= 6).await;
    supervisor.shutdown().await.unwrap();

    assert_eq!(fixture.sink("backup").row_count("orders"), 2);
    let one = fixture
        .sink("backup")
        .row("orders", &row(&[("id", Value::Int(1))]))
        .unwrap();
    assert_eq!(one["amount"], Value::Int(11));
}

#[tokio::test]
async fn pipeline_registration_is_validated_at_startup() {
    let fixture = Fixture::new(&["backup"], &[("orders-backup", "nowhere", None)]);
    let err = Supervisor::start_with(fixture.config.clone(), fixture.components())
        .await
        .unwrap_err();
    assert!(matches!(err, riffle_errors::RiffleError::UnknownSink(_)));
}
