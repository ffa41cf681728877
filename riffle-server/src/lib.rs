//! Lifecycle supervision for the routing core: construct everything from
//! configuration, start it in dependency order, watch health, and take it
//! down cleanly.

mod config;
mod health;
mod registry;
mod supervisor;

pub mod metrics;

pub use config::Config;
pub use health::{pipeline_health, sink_health, source_health, Health};
pub use registry::{Registry, StatsSnapshot};
pub use supervisor::{Components, Supervisor};
