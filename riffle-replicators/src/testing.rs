//! Scripted in-process connector for tests of the router and supervisor.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use riffle_data::{Change, SourceStats};
use riffle_errors::RiffleResult;
use riffle_position::Position;

use crate::{Connector, ConnectorHealth, ConnectorState};

/// Shared state of a [`ScriptedConnector`], kept behind an `Arc` so tests
/// can feed changes in and observe acks.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    queue: Mutex<VecDeque<Change>>,
    acked: Mutex<Vec<Position>>,
}

impl ScriptedSource {
    /// Queue a change for the connector to emit.
    pub fn push(&self, change: Change) {
        self.queue.lock().push_back(change);
    }

    /// Every position acked so far, in ack order.
    pub fn acked(&self) -> Vec<Position> {
        self.acked.lock().clone()
    }

    /// The greatest acked position, if any.
    pub fn watermark(&self) -> Option<Position> {
        self.acked.lock().last().cloned()
    }
}

/// A [`Connector`] that emits pre-scripted changes and records acks.
pub struct ScriptedConnector {
    name: String,
    source: Arc<ScriptedSource>,
    stats: Arc<SourceStats>,
    state: ConnectorState,
    paused: bool,
}

impl ScriptedConnector {
    pub fn new(name: &str, source: Arc<ScriptedSource>, stats: Arc<SourceStats>) -> Self {
        ScriptedConnector {
            name: name.to_owned(),
            source,
            stats,
            state: ConnectorState::Created,
            paused: false,
        }
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&mut self) -> RiffleResult<()> {
        self.state = ConnectorState::Streaming;
        self.stats.set_connected(true);
        Ok(())
    }

    async fn next_change(&mut self) -> RiffleResult<Change> {
        loop {
            if !self.paused {
                if let Some(change) = self.source.queue.lock().pop_front() {
                    self.stats.record_event();
                    return Ok(change);
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }

    fn ack(&mut self, position: &Position) -> RiffleResult<()> {
        let mut acked = self.source.acked.lock();
        // Monotonic: the scripted source compares by emission order, which
        // tests encode as byte order.
        if acked.last().is_some_and(|last| position.as_bytes() <= last.as_bytes()) {
            return Ok(());
        }
        acked.push(position.clone());
        Ok(())
    }

    fn pause(&mut self) {
        self.paused = true;
        self.state = ConnectorState::Paused;
    }

    fn resume(&mut self) {
        self.paused = false;
        self.state = ConnectorState::Streaming;
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
        self.state = ConnectorState::Stopped;
        self.stats.set_connected(false);
        Ok(())
    }
}
