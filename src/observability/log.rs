//! Stderr-backed `Observer`. Single-line, grep-friendly output.

use std::any::Any;

use super::{Field, Observer};

pub struct LogObserver;

impl LogObserver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LogObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl Observer for LogObserver {
    fn record_event(&self, component: &str, name: &str, fields: &[Field]) {
        let mut line = format!("[{component}] {name}");
        for f in fields {
            line.push(' ');
            line.push_str(f.key);
            line.push('=');
            line.push_str(&f.value);
        }
        eprintln!("{line}");
    }

    fn record_metric(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        let mut line = format!("[metric] {name}={value}");
        for (k, v) in labels {
            line.push(' ');
            line.push_str(k);
            line.push('=');
            line.push_str(v);
        }
        eprintln!("{line}");
    }

    fn name(&self) -> &str {
        "log"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
