use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use riffle_util::time::{from_unix_millis, now_millis};
use serde::Serialize;

use crate::ChangeOp;

/// Smoothing factor for all latency averages.
pub const EMA_ALPHA: f64 = 0.2;

/// An exponential moving average that can be updated from any thread
/// without a lock. The current value is stored as f64 bits in an atomic.
#[derive(Debug, Default)]
pub struct Ema {
    bits: AtomicU64,
    samples: AtomicU64,
}

impl Ema {
    /// Fold one latency sample into the average.
    pub fn observe(&self, sample: Duration) {
        let sample = sample.as_secs_f64();
        self.samples.fetch_add(1, Ordering::Relaxed);
        let mut current = self.bits.load(Ordering::Relaxed);
        loop {
            let prev = f64::from_bits(current);
            let next = if self.samples.load(Ordering::Relaxed) <= 1 {
                sample
            } else {
                prev + EMA_ALPHA * (sample - prev)
            };
            match self.bits.compare_exchange_weak(
                current,
                next.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// The current average, or `None` before the first sample.
    pub fn value(&self) -> Option<Duration> {
        if self.samples.load(Ordering::Relaxed) == 0 {
            return None;
        }
        Some(Duration::from_secs_f64(f64::from_bits(
            self.bits.load(Ordering::Relaxed),
        )))
    }
}

/// Live counters for one source connector. Counters are monotonic; gauges
/// (connection flag, lag) move both ways.
#[derive(Debug, Default)]
pub struct SourceStats {
    connected: AtomicBool,
    last_event_ms: AtomicI64,
    events_emitted: AtomicU64,
    invalid_changes: AtomicU64,
    lag_estimate: AtomicU64,
}

impl SourceStats {
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn record_event(&self) {
        self.events_emitted.fetch_add(1, Ordering::Relaxed);
        self.last_event_ms.store(now_millis(), Ordering::Relaxed);
    }

    /// Count a change rejected at ingress for violating the model.
    pub fn record_invalid(&self) {
        self.invalid_changes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_lag_estimate(&self, lag: u64) {
        self.lag_estimate.store(lag, Ordering::Relaxed);
    }

    pub fn last_event_time(&self) -> Option<DateTime<Utc>> {
        from_unix_millis(self.last_event_ms.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> SourceStatsSnapshot {
        SourceStatsSnapshot {
            connected: self.is_connected(),
            last_event_time: self.last_event_time(),
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            invalid_changes: self.invalid_changes.load(Ordering::Relaxed),
            lag_estimate: self.lag_estimate.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`SourceStats`] for operator tooling.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatsSnapshot {
    pub connected: bool,
    pub last_event_time: Option<DateTime<Utc>>,
    pub events_emitted: u64,
    pub invalid_changes: u64,
    pub lag_estimate: u64,
}

/// Live counters for one sink writer.
#[derive(Debug, Default)]
pub struct SinkStats {
    connected: AtomicBool,
    writes_total: AtomicU64,
    writes_ok: AtomicU64,
    writes_failed: AtomicU64,
    last_write_ms: AtomicI64,
    latency: Ema,
    op_counts: [AtomicU64; ChangeOp::ALL.len()],
}

impl SinkStats {
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Record one write attempt outcome with its observed latency.
    pub fn record_write(&self, op: ChangeOp, ok: bool, latency: Duration) {
        if ok {
            self.writes_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.writes_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.writes_total.fetch_add(1, Ordering::Relaxed);
        self.op_counts[op.index()].fetch_add(1, Ordering::Relaxed);
        self.latency.observe(latency);
        self.last_write_ms.store(now_millis(), Ordering::Relaxed);
    }

    pub fn last_write_time(&self) -> Option<DateTime<Utc>> {
        from_unix_millis(self.last_write_ms.load(Ordering::Relaxed))
    }

    pub fn writes_total(&self) -> u64 {
        self.writes_total.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> SinkStatsSnapshot {
        let op_counts = ChangeOp::ALL
            .iter()
            .map(|op| (op.as_str(), self.op_counts[op.index()].load(Ordering::Relaxed)))
            .collect();
        SinkStatsSnapshot {
            connected: self.is_connected(),
            writes_total: self.writes_total(),
            writes_ok: self.writes_ok.load(Ordering::Relaxed),
            writes_failed: self.writes_failed.load(Ordering::Relaxed),
            avg_latency: self.latency.value(),
            last_write_time: self.last_write_time(),
            op_counts,
        }
    }
}

/// Point-in-time view of [`SinkStats`].
#[derive(Debug, Clone, Serialize)]
pub struct SinkStatsSnapshot {
    pub connected: bool,
    pub writes_total: u64,
    pub writes_ok: u64,
    pub writes_failed: u64,
    pub avg_latency: Option<Duration>,
    pub last_write_time: Option<DateTime<Utc>>,
    pub op_counts: Vec<(&'static str, u64)>,
}

/// Live counters for one pipeline.
#[derive(Debug, Default)]
pub struct PipelineStats {
    events_in: AtomicU64,
    events_ok: AtomicU64,
    events_failed: AtomicU64,
    dead_lettered: AtomicU64,
    latency: Ema,
}

impl PipelineStats {
    pub fn record_in(&self) {
        self.events_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ok(&self, latency: Duration) {
        self.events_ok.fetch_add(1, Ordering::Relaxed);
        self.latency.observe(latency);
    }

    pub fn record_failed(&self) {
        self.events_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_letter(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events_in(&self) -> u64 {
        self.events_in.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            events_in: self.events_in(),
            events_ok: self.events_ok.load(Ordering::Relaxed),
            events_failed: self.events_failed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            avg_latency: self.latency.value(),
        }
    }
}

/// Point-in-time view of [`PipelineStats`].
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatsSnapshot {
    pub events_in: u64,
    pub events_ok: u64,
    pub events_failed: u64,
    pub dead_lettered: u64,
    pub avg_latency: Option<Duration>,
}
