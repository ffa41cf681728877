//! Broker (Kafka) positions.

use riffle_errors::{RiffleError, RiffleResult};
use serde::{Deserialize, Serialize};

use crate::Position;

/// A consumer position on one partition of a CDC topic.
///
/// Kafka offsets are totally ordered only within a partition; the connector
/// tracks and acknowledges offsets per partition, and CDC topics are
/// expected to be keyed so per-partition order is per-row order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BrokerOffset {
    /// Partition the record was read from.
    pub partition: i32,
    /// Offset of the record within that partition.
    pub offset: i64,
}

impl BrokerOffset {
    /// Encode as an opaque position: four big-endian partition bytes
    /// followed by eight big-endian offset bytes.
    pub fn to_position(self) -> Position {
        let mut bytes = Vec::with_capacity(12);
        bytes.extend_from_slice(&self.partition.to_be_bytes());
        bytes.extend_from_slice(&self.offset.to_be_bytes());
        Position::from_bytes(bytes)
    }

    /// Decode from an opaque position produced by
    /// [`BrokerOffset::to_position`].
    pub fn from_position(pos: &Position) -> RiffleResult<BrokerOffset> {
        let bytes = pos.as_bytes();
        if bytes.len() != 12 {
            return Err(RiffleError::ReplicationFailed(format!(
                "malformed broker position {pos}"
            )));
        }
        Ok(BrokerOffset {
            partition: i32::from_be_bytes(bytes[..4].try_into().expect("length checked")),
            offset: i64::from_be_bytes(bytes[4..].try_into().expect("length checked")),
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn round_trip() {
        let off = BrokerOffset {
            partition: 3,
            offset: 918_212,
        };
        assert_eq!(BrokerOffset::from_position(&off.to_position()).unwrap(), off);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(BrokerOffset::from_position(&Position::from_bytes(vec![1, 2, 3])).is_err());
    }
}
