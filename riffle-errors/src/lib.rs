//! Error types shared by every crate in this workspace.
//!
//! The central [`RiffleError`] enum carries the error taxonomy of the core:
//! per-change failures (`InvalidChange`, write failures with a
//! [`WriteErrorKind`]), per-component failures (`ConnectFailed`,
//! `PositionLost`, `Fatal`), and plumbing failures. Per-change errors never
//! terminate a pipeline; per-component fatal errors stop that component only.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias used by all fallible core APIs.
pub type RiffleResult<T> = Result<T, RiffleError>;

/// Classification of a failed write, reported by sinks so the retry
/// controller can decide without string-matching driver messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteErrorKind {
    /// Recoverable: connection reset, deadlock, lock timeout, broker
    /// disconnect, statement timeout. Retried per policy.
    Transient,
    /// Unique-key violation on a plain insert. Subsequent attempts switch to
    /// upsert semantics.
    Conflict,
    /// Structural mismatch with the target: missing column, type error,
    /// missing table. Dead-lettered after the first attempt.
    SchemaMismatch,
    /// Delete of a row that does not exist. Treated as success.
    NotFound,
    /// Authentication / permission / programmer error. The pipeline is
    /// aborted until operator intervention.
    Fatal,
}

impl std::fmt::Display for WriteErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WriteErrorKind::Transient => "transient",
            WriteErrorKind::Conflict => "conflict",
            WriteErrorKind::SchemaMismatch => "schema_mismatch",
            WriteErrorKind::NotFound => "not_found",
            WriteErrorKind::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum RiffleError {
    /// A change record violated the model invariants and was rejected at
    /// ingress.
    #[error("invalid change: {reason}")]
    InvalidChange { reason: String },

    /// A source or sink failed to acquire its server-side resources.
    #[error("connect to {target} failed: {detail}")]
    ConnectFailed { target: String, detail: String },

    /// A recoverable streaming or write failure.
    #[error("transient failure: {0}")]
    Transient(String),

    /// A write conflicted with existing target state.
    #[error("write conflict: {0}")]
    Conflict(String),

    /// The change does not structurally fit the target.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// A source cursor (slot, offset, resume token) is no longer valid.
    #[error("source position lost: {0}")]
    PositionLost(String),

    /// Unrecoverable component failure; surfaced to the supervisor.
    #[error("fatal source error: {0}")]
    FatalSource(String),

    /// Replication protocol violation or decode failure.
    #[error("replication failed: {0}")]
    ReplicationFailed(String),

    /// A pipeline name was registered twice.
    #[error("duplicate pipeline name: {0}")]
    DuplicateName(String),

    /// A pipeline referenced a source that does not exist.
    #[error("unknown source: {0}")]
    UnknownSource(String),

    /// A pipeline referenced a sink that does not exist.
    #[error("unknown sink: {0}")]
    UnknownSink(String),

    /// A filter expression failed to parse.
    #[error("invalid filter expression: {0}")]
    InvalidFilter(String),

    /// Configuration rejected at construction time.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// An invariant the core itself is responsible for was violated.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl RiffleError {
    /// The write-failure classification for this error, if it is a
    /// per-change write error.
    pub fn write_kind(&self) -> Option<WriteErrorKind> {
        match self {
            RiffleError::Transient(_) | RiffleError::Io(_) | RiffleError::ConnectFailed { .. } => {
                Some(WriteErrorKind::Transient)
            }
            RiffleError::Conflict(_) => Some(WriteErrorKind::Conflict),
            RiffleError::SchemaMismatch(_) => Some(WriteErrorKind::SchemaMismatch),
            RiffleError::FatalSource(_) => Some(WriteErrorKind::Fatal),
            _ => None,
        }
    }

    /// Whether a streaming component should reconnect-and-retry after this
    /// error rather than stop.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RiffleError::Transient(_) | RiffleError::Io(_) | RiffleError::ConnectFailed { .. }
        )
    }
}

/// Construct a [`RiffleError::Internal`] with format args.
#[macro_export]
macro_rules! internal_err {
    ($($tt:tt)*) => {
        $crate::RiffleError::Internal(format!($($tt)*))
    };
}

/// Construct a [`RiffleError::InvalidChange`] with format args.
#[macro_export]
macro_rules! invalid_change_err {
    ($($tt:tt)*) => {
        $crate::RiffleError::InvalidChange { reason: format!($($tt)*) }
    };
}
