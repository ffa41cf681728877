//! Document-store change stream positions.

use bson::Document;
use riffle_errors::{RiffleError, RiffleResult};
use serde::{Deserialize, Serialize};

use crate::Position;

/// A change-stream resume token.
///
/// The server hands these out as opaque BSON documents whose `_data` field
/// orders the stream; we encode the whole document so resuming is exact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeToken(pub Document);

impl ResumeToken {
    /// Encode as an opaque position (the BSON document bytes).
    pub fn to_position(&self) -> RiffleResult<Position> {
        let bytes = bson::to_vec(&self.0)
            .map_err(|e| RiffleError::Serialization(format!("resume token encode: {e}")))?;
        Ok(Position::from_bytes(bytes))
    }

    /// Decode from an opaque position produced by
    /// [`ResumeToken::to_position`].
    pub fn from_position(pos: &Position) -> RiffleResult<ResumeToken> {
        let doc = bson::from_slice(pos.as_bytes())
            .map_err(|e| RiffleError::PositionLost(format!("resume token decode: {e}")))?;
        Ok(ResumeToken(doc))
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn round_trip() {
        let token = ResumeToken(doc! { "_data": "8263A5..." });
        let pos = token.to_position().unwrap();
        assert_eq!(ResumeToken::from_position(&pos).unwrap(), token);
    }

    #[test]
    fn garbage_is_position_lost() {
        let err = ResumeToken::from_position(&Position::from_bytes(vec![0xff; 4])).unwrap_err();
        assert!(matches!(err, RiffleError::PositionLost(_)));
    }
}
