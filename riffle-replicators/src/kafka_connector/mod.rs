//! Broker source connector: a Kafka consumer group over CDC topics.
//!
//! The broker keeps the durable cursor (committed group offsets), so this
//! connector needs no external position store. Offsets are *stored* only
//! when the router acks a position and *committed* by the client's
//! auto-commit of stored offsets; redelivery after an unclean reconnect is
//! expected and absorbed by sink idempotency.

mod envelope;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::{ClientConfig, Message};
use riffle_data::{Change, SourceStats};
use riffle_errors::{RiffleError, RiffleResult};
use riffle_position::kafka::BrokerOffset;
use riffle_position::Position;
use tracing::{info, warn};

use crate::{Connector, ConnectorHealth, ConnectorState, ReconnectBackoff, SourceConfig};

pub struct KafkaBrokerConnector {
    name: String,
    config: SourceConfig,
    stats: Arc<SourceStats>,
    state: ConnectorState,
    paused: Arc<AtomicBool>,
    consumer: Option<StreamConsumer>,
    /// Last stored offset per partition, to keep acks monotonic.
    stored: HashMap<i32, i64>,
    /// Topic each partition was last read from, for offset storage.
    partition_topics: HashMap<i32, String>,
    backoff: ReconnectBackoff,
}

impl KafkaBrokerConnector {
    pub fn new(name: &str, config: SourceConfig, stats: Arc<SourceStats>) -> Self {
        KafkaBrokerConnector {
            name: name.to_owned(),
            config,
            stats,
            state: ConnectorState::Created,
            paused: Arc::new(AtomicBool::new(false)),
            consumer: None,
            stored: HashMap::new(),
            partition_topics: HashMap::new(),
            backoff: ReconnectBackoff::new(),
        }
    }

    fn group_id(&self) -> String {
        self.config
            .slot_name
            .clone()
            .unwrap_or_else(|| format!("riffle-{}", self.name))
    }

    async fn reconnect(&mut self) -> RiffleResult<()> {
        self.state = ConnectorState::Reconnecting;
        loop {
            self.consumer = None;
            self.stats.set_connected(false);
            let delay = self.backoff.next_delay();
            warn!(source = %self.name, ?delay, "reconnecting broker consumer");
            tokio::time::sleep(delay).await;
            match self.connect().await {
                Ok(()) => {
                    self.backoff.reset();
                    return Ok(());
                }
                Err(err @ RiffleError::FatalSource(_)) => return Err(err),
                Err(err) => warn!(source = %self.name, %err, "reconnect attempt failed"),
            }
        }
    }
}

#[async_trait::async_trait]
impl Connector for KafkaBrokerConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&mut self) -> RiffleResult<()> {
        if self.consumer.is_some() {
            return Ok(());
        }
        self.state = ConnectorState::Connecting;
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.config.connection_string)
            .set("group.id", self.group_id())
            // The broker cursor only moves when the router has acked:
            // offsets are stored explicitly on ack and the client commits
            // stored offsets in the background.
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| RiffleError::ConnectFailed {
                target: self.name.clone(),
                detail: e.to_string(),
            })?;
        let topics: Vec<&str> = self.config.topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topics)
            .map_err(|e| RiffleError::ConnectFailed {
                target: self.name.clone(),
                detail: e.to_string(),
            })?;
        self.consumer = Some(consumer);
        self.state = ConnectorState::Streaming;
        self.stats.set_connected(true);
        info!(source = %self.name, ?topics, group = %self.group_id(), "broker consumer subscribed");
        Ok(())
    }

    async fn next_change(&mut self) -> RiffleResult<Change> {
        loop {
            if self.paused.load(Ordering::Relaxed) {
                // The client library keeps the group membership alive from
                // its own thread; we just stop pulling.
                self.state = ConnectorState::Paused;
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
            if self.state == ConnectorState::Paused {
                self.state = ConnectorState::Streaming;
            }

            let Some(consumer) = self.consumer.as_ref() else {
                return Err(RiffleError::Transient("connector not connected".into()));
            };

            let message = match consumer.recv().await {
                Ok(m) => m,
                Err(err) => {
                    warn!(source = %self.name, %err, "broker receive failed");
                    self.reconnect().await?;
                    continue;
                }
            };

            let Some(payload) = message.payload() else {
                // Tombstones carry no envelope.
                continue;
            };
            let position = BrokerOffset {
                partition: message.partition(),
                offset: message.offset(),
            }
            .to_position();
            self.partition_topics
                .insert(message.partition(), message.topic().to_owned());

            let key_columns = envelope::key_columns_of(message.key());
            match envelope::parse_envelope(payload, position, &key_columns) {
                Ok(change) => {
                    self.stats.record_event();
                    return Ok(change);
                }
                // Rejected at ingress: counted, never dispatched. The
                // offset will be covered by the next valid record's ack.
                Err(err) => {
                    self.stats.record_invalid();
                    warn!(
                        source = %self.name,
                        topic = message.topic(),
                        offset = message.offset(),
                        %err,
                        "dropping invalid envelope"
                    );
                }
            }
        }
    }

    fn ack(&mut self, position: &Position) -> RiffleResult<()> {
        let BrokerOffset { partition, offset } = BrokerOffset::from_position(position)?;
        if self.stored.get(&partition).is_some_and(|last| offset <= *last) {
            return Ok(());
        }
        let Some(consumer) = self.consumer.as_ref() else {
            return Ok(());
        };
        let Some(topic) = self.partition_topics.get(&partition) else {
            return Ok(());
        };
        // The committed offset is the next offset to consume.
        consumer
            .store_offset(topic, partition, offset + 1)
            .map_err(|e| RiffleError::Transient(format!("offset store: {e}")))?;
        self.stored.insert(partition, offset);
        Ok(())
    }

    fn pause(&mut self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    fn resume(&mut self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    fn health(&self) -> ConnectorHealth {
        let snapshot = self.stats.snapshot();
        ConnectorHealth {
            state: self.state,
            connected: snapshot.connected,
            last_event_time: snapshot.last_event_time,
            lag_estimate: None,
        }
    }

    fn stats(&self) -> Arc<SourceStats> {
        Arc::clone(&self.stats)
    }

    async fn disconnect(&mut self) -> RiffleResult<()> {
        self.consumer = None;
        self.state = ConnectorState::Stopped;
        self.stats.set_connected(false);
        info!(source = %self.name, "broker consumer disconnected");
        Ok(())
    }
}
