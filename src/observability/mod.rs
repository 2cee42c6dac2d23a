//! Structured event/metric sink.
//!
//! `Observer` trait + `CompositeObserver` fan-out, extended with a
//! Prometheus-backed implementation so `/metrics` has something real
//! behind it.

use std::any::Any;
use std::sync::Arc;

mod log;
mod metrics;

pub use log::LogObserver;
pub use metrics::PrometheusObserver;

/// A single structured field attached to an event.
#[derive(Debug, Clone)]
pub struct Field {
    pub key: &'static str,
    pub value: String,
}

impl Field {
    pub fn new(key: &'static str, value: impl ToString) -> Self {
        Self {
            key,
            value: value.to_string(),
        }
    }
}

#[macro_export]
macro_rules! fields {
    ($($k:ident = $v:expr),* $(,)?) => {
        vec![$($crate::observability::Field::new(stringify!($k), $v)),*]
    };
}

/// Sink for structured events and numeric metrics.
pub trait Observer: Send + Sync {
    fn record_event(&self, component: &str, name: &str, fields: &[Field]);
    fn record_metric(&self, name: &str, value: f64, labels: &[(&str, &str)]);
    fn flush(&self) {}
    fn name(&self) -> &str;
    fn as_any(&self) -> &dyn Any;
}

/// Fans out to every registered observer.
pub struct CompositeObserver {
    observers: Vec<Arc<dyn Observer>>,
}

impl CompositeObserver {
    pub fn new(observers: Vec<Arc<dyn Observer>>) -> Self {
        Self { observers }
    }

    pub fn default_stack() -> Self {
        Self::new(vec![
            Arc::new(LogObserver::new()),
            Arc::new(PrometheusObserver::new()),
        ])
    }
}

impl Observer for CompositeObserver {
    fn record_event(&self, component: &str, name: &str, fields: &[Field]) {
        for o in &self.observers {
            o.record_event(component, name, fields);
        }
    }

    fn record_metric(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        for o in &self.observers {
            o.record_metric(name, value, labels);
        }
    }

    fn flush(&self) {
        for o in &self.observers {
            o.flush();
        }
    }

    fn name(&self) -> &str {
        "composite"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingObserver {
        events: AtomicUsize,
    }

    impl Observer for CountingObserver {
        fn record_event(&self, _component: &str, _name: &str, _fields: &[Field]) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }
        fn record_metric(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {}
        fn name(&self) -> &str {
            "counting"
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn composite_fans_out_to_all_observers() {
        let counter = Arc::new(CountingObserver {
            events: AtomicUsize::new(0),
        });
        let composite = CompositeObserver::new(vec![counter.clone()]);
        composite.record_event("rules", "rule.pointer_hydration_miss", &[]);
        composite.record_event("rules", "rule.pointer_hydration_miss", &[]);
        assert_eq!(counter.events.load(Ordering::SeqCst), 2);
    }
}
