//! Postgres WAL positions.

use std::fmt;
use std::str::FromStr;

use riffle_errors::{RiffleError, RiffleResult};
use serde::{Deserialize, Serialize};

use crate::Position;

/// A Postgres log sequence number.
///
/// Encoded into a [`Position`] as eight big-endian bytes, so byte order
/// equals numeric order.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The "start of stream" LSN.
    pub const ZERO: Lsn = Lsn(0);

    /// Encode as an opaque position.
    pub fn to_position(self) -> Position {
        Position::from_bytes(self.0.to_be_bytes().to_vec())
    }

    /// Decode from an opaque position produced by [`Lsn::to_position`].
    pub fn from_position(pos: &Position) -> RiffleResult<Lsn> {
        let bytes: [u8; 8] = pos
            .as_bytes()
            .try_into()
            .map_err(|_| RiffleError::ReplicationFailed(format!("malformed LSN position {pos}")))?;
        Ok(Lsn(u64::from_be_bytes(bytes)))
    }
}

// The canonical `XXXXXXXX/XXXXXXXX` rendering used by the server.
impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xffff_ffff)
    }
}

impl FromStr for Lsn {
    type Err = RiffleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s
            .split_once('/')
            .ok_or_else(|| RiffleError::ReplicationFailed(format!("malformed LSN {s:?}")))?;
        let hi = u64::from_str_radix(hi, 16)
            .map_err(|e| RiffleError::ReplicationFailed(format!("malformed LSN {s:?}: {e}")))?;
        let lo = u64::from_str_radix(lo, 16)
            .map_err(|e| RiffleError::ReplicationFailed(format!("malformed LSN {s:?}: {e}")))?;
        Ok(Lsn((hi << 32) | lo))
    }
}

impl From<u64> for Lsn {
    fn from(v: u64) -> Self {
        Lsn(v)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn parse_and_render() {
        let lsn: Lsn = "16/B374D848".parse().unwrap();
        assert_eq!(lsn.0, (0x16 << 32) | 0xB374_D848);
        assert_eq!(lsn.to_string(), "16/B374D848");
        assert_eq!("0/0".parse::<Lsn>().unwrap(), Lsn::ZERO);
    }

    #[test]
    fn rejects_garbage() {
        assert!("16".parse::<Lsn>().is_err());
        assert!("xx/yy".parse::<Lsn>().is_err());
    }

    #[test]
    fn position_bytes_preserve_order() {
        let a = Lsn(0x0000_0001_0000_0000).to_position();
        let b = Lsn(0x0000_0001_0000_0001).to_position();
        assert!(a.as_bytes() < b.as_bytes());
    }

    proptest! {
        #[test]
        fn position_round_trip(v in any::<u64>()) {
            let lsn = Lsn(v);
            prop_assert_eq!(Lsn::from_position(&lsn.to_position()).unwrap(), lsn);
        }

        #[test]
        fn display_round_trip(v in any::<u64>()) {
            let lsn = Lsn(v);
            prop_assert_eq!(lsn.to_string().parse::<Lsn>().unwrap(), lsn);
        }
    }
}
