//! The pipeline routing engine: matches incoming changes to pipelines,
//! dispatches them to sink ingest queues, tracks per-source watermarks, and
//! runs the retry/dead-letter machinery around sink writes.

mod dead_letter;
mod filter;
mod pipeline;
mod retry;
mod router;
mod sink_task;
mod watermark;

pub use dead_letter::{DeadLetterRecord, DeadLetterStore, FileDeadLetterStore, MemoryDeadLetterStore};
pub use filter::FilterSpec;
pub use pipeline::{Pipeline, PipelineSpec};
pub use retry::{compute_backoff, decide, RetryDecision, RetryPolicy, RetryPolicyKind};
pub use router::{Router, SinkJob};
pub use sink_task::run_sink;
pub use watermark::WatermarkTracker;
