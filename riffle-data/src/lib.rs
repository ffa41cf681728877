//! The canonical change model: every source connector normalizes into these
//! types, and every sink writer consumes them. Nothing downstream of a
//! connector ever sees a driver-native row again.

mod change;
mod stats;
mod value;

pub use change::{
    fingerprint, key_of, Change, ChangeMeta, ChangeOp, Row, TableIdent, META_KEY_COLUMNS,
};
pub use stats::{
    Ema, PipelineStats, PipelineStatsSnapshot, SinkStats, SinkStatsSnapshot, SourceStats,
    SourceStatsSnapshot, EMA_ALPHA,
};
pub use value::Value;
