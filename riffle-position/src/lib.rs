//! Source positions: opaque, per-source, totally ordered cursors.
//!
//! The routing core treats a [`Position`] as an opaque byte string; only the
//! source connector that produced it knows how to compare or decode it. The
//! per-source codecs here ([`postgres::Lsn`], [`kafka::BrokerOffset`],
//! [`mongo::ResumeToken`]) all encode so that the same logical cursor always
//! produces the same bytes, which the router relies on for watermark
//! bookkeeping and sinks rely on for fingerprinting.

pub mod kafka;
pub mod mongo;
pub mod postgres;

use std::fmt;

use serde::{Deserialize, Serialize};

/// An opaque cursor identifying progress within a single source.
///
/// Positions from different sources are never compared. Within one source
/// the connector's codec guarantees that equal cursors produce byte-equal
/// positions.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position(Vec<u8>);

impl Position {
    /// Wrap raw cursor bytes produced by a source codec.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Position(bytes)
    }

    /// The raw cursor bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether this is the zero-length "before everything" position.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Position({})", hex::encode(&self.0))
    }
}

// Rendered as hex so positions are greppable in logs without looking like
// something a human should interpret.
impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}
