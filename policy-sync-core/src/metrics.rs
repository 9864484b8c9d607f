//! Counters and key-value observations.
//!
//! Components keep lock-free counters and expose them as a list of
//! [`Observation`]s. Shipping observations anywhere is the job of a
//! [`MetricsSink`] supplied by the embedding process.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Attribute values attached to an observation
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Str(String),
    Bool(bool),
    I64(i64),
    U64(u64),
}

/// Attribute map with deterministic ordering
pub type AttrMap = BTreeMap<String, AttrValue>;

/// One named measurement
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Observation {
    pub name: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: AttrMap,
}

impl Observation {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            attrs: AttrMap::new(),
        }
    }

    /// Attach an attribute
    pub fn with_attr(mut self, key: impl Into<String>, value: AttrValue) -> Self {
        self.attrs.insert(key.into(), value);
        self
    }
}

/// Monotonic event counter
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Gauge that only records the largest value seen
#[derive(Debug, Default)]
pub struct MaxGauge(AtomicU64);

impl MaxGauge {
    pub fn observe(&self, value: u64) {
        self.0.fetch_max(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Anything that can report its counters
pub trait MetricSource {
    /// Current values, prefixed by component
    fn observations(&self) -> Vec<Observation>;
}

/// Destination for observations (log, collector, file)
pub trait MetricsSink: Send + Sync {
    type Error;

    fn emit(&self, observations: &[Observation]) -> core::result::Result<(), Self::Error>;
}

/// Sink that writes each observation as a structured `tracing` event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    type Error = core::convert::Infallible;

    fn emit(&self, observations: &[Observation]) -> core::result::Result<(), Self::Error> {
        for obs in observations {
            tracing::info!(target: "policy_sync::metrics", name = %obs.name, value = obs.value, attrs = ?obs.attrs);
        }
        Ok(())
    }
}

/// Sink that keeps everything in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<Observation>>,
}

impl MemorySink {
    /// Everything emitted so far
    pub fn records(&self) -> Vec<Observation> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Latest value emitted under `name`
    pub fn latest(&self, name: &str) -> Option<f64> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|o| o.name == name)
            .map(|o| o.value)
    }
}

impl MetricsSink for MemorySink {
    type Error = core::convert::Infallible;

    fn emit(&self, observations: &[Observation]) -> core::result::Result<(), Self::Error> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(observations);
        Ok(())
    }
}

/// Build observations from `(name, value)` pairs under a common prefix
pub fn observe_all<'a>(
    prefix: &str,
    values: impl IntoIterator<Item = (&'a str, u64)>,
) -> Vec<Observation> {
    values
        .into_iter()
        .map(|(name, value)| Observation::new(format!("{prefix}.{name}"), value as f64))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_and_gauges() {
        let c = Counter::default();
        c.inc();
        c.add(4);
        assert_eq!(c.get(), 5);

        let g = MaxGauge::default();
        g.observe(3);
        g.observe(1);
        assert_eq!(g.get(), 3);
    }

    #[test]
    fn memory_sink_keeps_latest_value() {
        let sink = MemorySink::default();
        sink.emit(&observe_all("pipeline", [("queue_full", 1)])).unwrap();
        sink.emit(&observe_all("pipeline", [("queue_full", 50)])).unwrap();
        assert_eq!(sink.latest("pipeline.queue_full"), Some(50.0));
        assert_eq!(sink.records().len(), 2);
    }

    #[test]
    fn observation_attrs_serialize_untagged() {
        let obs = Observation::new("coordinator.round_abort", 2.0)
            .with_attr("reason", AttrValue::Str("quorum".into()));
        let json = serde_json::to_string(&obs).unwrap();
        assert!(json.contains(r#""reason":"quorum""#));
        let empty = serde_json::to_string(&Observation::new("x", 1.0)).unwrap();
        assert!(!empty.contains("attrs"));
    }
}
