//! Prometheus-backed `Observer`, exposed over `GET /metrics`.
//!
//! Counters/histograms register against a `prometheus::Registry` and are
//! served with `warp`. The registry is generic: any `record_metric` call
//! lazily registers a gauge under that name.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Mutex;

use lazy_static::lazy_static;
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};

use super::{Field, Observer};

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

pub struct PrometheusObserver {
    gauges: Mutex<HashMap<String, GaugeVec>>,
}

impl PrometheusObserver {
    pub fn new() -> Self {
        Self {
            gauges: Mutex::new(HashMap::new()),
        }
    }

    /// Render the current registry in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = REGISTRY.gather();
        encoder.encode(&metric_families, &mut buffer).ok();
        String::from_utf8(buffer).unwrap_or_default()
    }

    fn gauge_for<'a>(&self, name: &str, label_names: &[&'a str]) -> GaugeVec {
        let mut gauges = self.gauges.lock().expect("metrics mutex poisoned");
        if let Some(g) = gauges.get(name) {
            return g.clone();
        }
        let opts = Opts::new(name.to_string(), format!("tingly-box metric {name}"));
        let gauge = GaugeVec::new(opts, label_names).expect("invalid metric name/labels");
        REGISTRY
            .register(Box::new(gauge.clone()))
            .expect("metric already registered under a different label set");
        gauges.insert(name.to_string(), gauge.clone());
        gauge
    }
}

impl Default for PrometheusObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl Observer for PrometheusObserver {
    fn record_event(&self, _component: &str, _name: &str, _fields: &[Field]) {
        // Events are not metrics; the log observer handles these.
    }

    fn record_metric(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        let label_names: Vec<&str> = labels.iter().map(|(k, _)| *k).collect();
        let label_values: Vec<&str> = labels.iter().map(|(_, v)| *v).collect();
        let gauge = self.gauge_for(name, &label_names);
        gauge.with_label_values(&label_values).set(value);
    }

    fn name(&self) -> &str {
        "prometheus"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_metric_then_render_contains_value() {
        let obs = PrometheusObserver::new();
        obs.record_metric("tingly_test_metric_value", 42.0, &[("provider", "openai")]);
        let rendered = obs.render();
        assert!(rendered.contains("tingly_test_metric_value"));
    }
}
