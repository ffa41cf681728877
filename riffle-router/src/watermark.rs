//! Per-source watermark tracking.
//!
//! The router assigns each incoming change a per-source sequence number at
//! ingress; a change is settled once every pipeline that matched it reaches
//! a terminal state. The watermark is the position of the greatest settled
//! contiguous prefix, which is exactly what may be acked to the source.
//! Positions themselves stay opaque here; only the emission order matters.

use std::collections::BTreeMap;

use riffle_position::Position;

#[derive(Debug)]
struct Pending {
    position: Position,
    remaining: usize,
}

/// Tracks outstanding deliveries for one source.
#[derive(Debug, Default)]
pub struct WatermarkTracker {
    next_seq: u64,
    pending: BTreeMap<u64, Pending>,
    watermark: Option<Position>,
}

impl WatermarkTracker {
    /// Register an incoming change that `matched` pipelines will process.
    /// Returns its sequence number and, when the change settles
    /// immediately (no matches), the newly ackable watermark.
    pub fn register(&mut self, position: Position, matched: usize) -> (u64, Option<Position>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(
            seq,
            Pending {
                position,
                remaining: matched,
            },
        );
        let ackable = if matched == 0 { self.drain() } else { None };
        (seq, ackable)
    }

    /// Record one pipeline reaching a terminal state for `seq`. Returns the
    /// newly ackable watermark, if the contiguous settled prefix advanced.
    pub fn complete(&mut self, seq: u64) -> Option<Position> {
        match self.pending.get_mut(&seq) {
            Some(entry) => entry.remaining = entry.remaining.saturating_sub(1),
            None => return None,
        }
        self.drain()
    }

    /// The greatest fully settled position, if any.
    pub fn watermark(&self) -> Option<&Position> {
        self.watermark.as_ref()
    }

    /// Number of unsettled changes.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn drain(&mut self) -> Option<Position> {
        let mut advanced = None;
        while let Some(entry) = self.pending.first_entry() {
            if entry.get().remaining > 0 {
                break;
            }
            advanced = Some(entry.remove().position);
        }
        if let Some(position) = advanced.clone() {
            self.watermark = Some(position);
        }
        advanced
    }
}
