//! The pipeline: a named routing rule from one source to one sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use riffle_data::PipelineStats;
use riffle_errors::RiffleResult;
use serde::{Deserialize, Serialize};

use crate::filter::FilterSpec;
use crate::retry::RetryPolicy;

fn default_batch_size() -> usize {
    100
}

fn default_max_retries() -> u32 {
    3
}

fn default_enabled() -> bool {
    true
}

/// Static configuration for one pipeline, as handed to the core already
/// parsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub source: String,
    pub sink: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub filter_expression: Option<String>,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for PipelineSpec {
    fn default() -> Self {
        PipelineSpec {
            source: String::new(),
            sink: String::new(),
            enabled: true,
            batch_size: default_batch_size(),
            filter_expression: None,
            retry_policy: RetryPolicy::default(),
            max_retries: default_max_retries(),
        }
    }
}

/// A registered pipeline. Everything except the enabled flag and stats is
/// immutable after registration.
#[derive(Debug)]
pub struct Pipeline {
    name: String,
    source_name: String,
    sink_name: String,
    filter: FilterSpec,
    batch_size: usize,
    retry_policy: RetryPolicy,
    max_retries: u32,
    enabled: AtomicBool,
    created_at: DateTime<Utc>,
    enabled_at: Mutex<Option<DateTime<Utc>>>,
    disabled_at: Mutex<Option<DateTime<Utc>>>,
    stats: Arc<PipelineStats>,
}

impl Pipeline {
    /// Build from a spec, parsing the filter expression.
    pub fn from_spec(name: &str, spec: &PipelineSpec) -> RiffleResult<Arc<Pipeline>> {
        let filter = match spec.filter_expression.as_deref() {
            Some(expr) => FilterSpec::parse(expr)?,
            None => FilterSpec::match_all(),
        };
        let now = Utc::now();
        Ok(Arc::new(Pipeline {
            name: name.to_owned(),
            source_name: spec.source.clone(),
            sink_name: spec.sink.clone(),
            filter,
            batch_size: spec.batch_size.max(1),
            retry_policy: spec.retry_policy,
            max_retries: spec.max_retries,
            enabled: AtomicBool::new(spec.enabled),
            created_at: now,
            enabled_at: Mutex::new(spec.enabled.then_some(now)),
            disabled_at: Mutex::new(None),
            stats: Arc::new(PipelineStats::default()),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn sink_name(&self) -> &str {
        &self.sink_name
    }

    pub fn filter(&self) -> &FilterSpec {
        &self.filter
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn enable(&self) {
        if !self.enabled.swap(true, Ordering::Relaxed) {
            *self.enabled_at.lock() = Some(Utc::now());
        }
    }

    pub fn disable(&self) {
        if self.enabled.swap(false, Ordering::Relaxed) {
            *self.disabled_at.lock() = Some(Utc::now());
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn enabled_at(&self) -> Option<DateTime<Utc>> {
        *self.enabled_at.lock()
    }

    pub fn disabled_at(&self) -> Option<DateTime<Utc>> {
        *self.disabled_at.lock()
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enable_disable_stamp_transition_times() {
        let spec = PipelineSpec {
            source: "orders".into(),
            sink: "backup".into(),
            enabled: false,
            ..Default::default()
        };
        let p = Pipeline::from_spec("orders-backup", &spec).unwrap();
        assert!(!p.is_enabled());
        assert!(p.enabled_at().is_none());

        p.enable();
        assert!(p.is_enabled());
        assert!(p.enabled_at().is_some());

        p.disable();
        assert!(!p.is_enabled());
        assert!(p.disabled_at().is_some());
    }

    #[test]
    fn bad_filter_expression_fails_construction() {
        let spec = PipelineSpec {
            source: "orders".into(),
            sink: "backup".into(),
            filter_expression: Some("color:red".into()),
            ..Default::default()
        };
        assert!(Pipeline::from_spec("p", &spec).is_err());
    }

    #[test]
    fn batch_size_is_at_least_one() {
        let spec = PipelineSpec {
            source: "s".into(),
            sink: "k".into(),
            batch_size: 0,
            ..Default::default()
        };
        let p = Pipeline::from_spec("p", &spec).unwrap();
        assert_eq!(p.batch_size(), 1);
    }
}
