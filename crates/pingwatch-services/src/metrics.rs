//! Metric series: the sink the scheduler writes to, and a Prometheus-backed
//! gauge registry that implements it.
//!
//! A series is a gauge name plus a label set. Setting a series creates it,
//! deleting it removes it from the exposition entirely, which is how expired
//! peers disappear from scrapes.

use std::collections::HashMap;

use dashmap::DashMap;
use prometheus::core::Collector;
use prometheus::{GaugeVec, Opts, Registry, TextEncoder};

/// Label pairs identifying one series within a gauge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.push((name.into(), value.into()));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn as_map(&self) -> HashMap<&str, &str> {
        self.iter().collect()
    }
}

/// Where metric samples go.
///
/// Implementations must tolerate `set` and `delete` arriving from different
/// tasks at the same time.
pub trait MetricsSink: Send + Sync {
    /// Create or overwrite a series.
    fn set(&self, name: &str, labels: &Labels, value: f64);

    /// Remove a series. Returns false if it did not exist.
    fn delete(&self, name: &str, labels: &Labels) -> bool;
}

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("prometheus: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// Gauge families registered on a private `prometheus::Registry`.
///
/// Every gauge has to be declared with `describe` before it is set.
#[derive(Default)]
pub struct GaugeRegistry {
    registry: Registry,
    gauges: DashMap<String, GaugeVec>,
}

impl GaugeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a gauge family with its help text and label names.
    pub fn describe(&self, name: &str, help: &str, label_names: &[&str]) -> Result<(), MetricsError> {
        let gauge = GaugeVec::new(Opts::new(name, help), label_names)?;
        self.registry.register(Box::new(gauge.clone()))?;
        self.gauges.insert(name.to_string(), gauge);
        Ok(())
    }

    /// Current value of one series, without creating it.
    pub fn get(&self, name: &str, labels: &Labels) -> Option<f64> {
        let gauge = self.gauges.get(name)?;
        let wanted = labels.as_map();
        let families = gauge.collect();
        families
            .iter()
            .flat_map(|family| family.get_metric())
            .find(|metric| {
                metric.get_label().len() == wanted.len()
                    && metric
                        .get_label()
                        .iter()
                        .all(|pair| wanted.get(pair.get_name()) == Some(&pair.get_value()))
            })
            .map(|metric| metric.get_gauge().get_value())
    }

    /// Number of live series under `name`.
    pub fn series_count(&self, name: &str) -> usize {
        self.gauges
            .get(name)
            .map(|gauge| gauge.collect().iter().map(|f| f.get_metric().len()).sum::<usize>())
            .unwrap_or(0)
    }

    /// Text exposition of every family that has at least one series.
    pub fn render(&self) -> Result<String, MetricsError> {
        Ok(TextEncoder::new().encode_to_string(&self.registry.gather())?)
    }
}

impl MetricsSink for GaugeRegistry {
    fn set(&self, name: &str, labels: &Labels, value: f64) {
        let Some(gauge) = self.gauges.get(name) else {
            tracing::warn!(metric = name, "set on undeclared gauge");
            return;
        };
        match gauge.get_metric_with(&labels.as_map()) {
            Ok(series) => series.set(value),
            Err(e) => tracing::warn!(metric = name, error = %e, "label set does not fit gauge"),
        }
    }

    fn delete(&self, name: &str, labels: &Labels) -> bool {
        self.gauges
            .get(name)
            .map(|gauge| gauge.remove(&labels.as_map()).is_ok())
            .unwrap_or(false)
    }
}
