//! Monotonic counters.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter.
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn help(&self) -> &'static str {
        self.help
    }

    /// Increment by one.
    pub fn inc(&self) {
        self.inc_by(1);
    }

    /// Increment by `n`.
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A counter split by a single label, e.g. cancellation reason.
#[derive(Debug)]
pub struct LabeledCounter {
    name: &'static str,
    help: &'static str,
    label: &'static str,
    values: DashMap<&'static str, AtomicU64>,
}

impl LabeledCounter {
    /// Create a new labeled counter.
    pub fn new(name: &'static str, help: &'static str, label: &'static str) -> Self {
        Self {
            name,
            help,
            label,
            values: DashMap::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn help(&self) -> &'static str {
        self.help
    }

    /// Name of the label dimension.
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Increment the series for `value`.
    pub fn inc(&self, value: &'static str) {
        self.values
            .entry(value)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Value of the series for `value`.
    pub fn get(&self, value: &str) -> u64 {
        self.values
            .get(value)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// All series sorted by label value.
    pub fn get_all(&self) -> Vec<(&'static str, u64)> {
        let mut all: Vec<_> = self
            .values
            .iter()
            .map(|e| (*e.key(), e.value().load(Ordering::Relaxed)))
            .collect();
        all.sort_unstable();
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new("test_counter", "A test counter");
        assert_eq!(counter.get(), 0);

        counter.inc();
        counter.inc_by(4);
        assert_eq!(counter.get(), 5);
    }

    #[test]
    fn test_labeled_counter() {
        let counter = LabeledCounter::new("cancellations", "Cancelled streams", "reason");

        counter.inc("node_left");
        counter.inc("node_left");
        counter.inc("topology_changed");

        assert_eq!(counter.get("node_left"), 2);
        assert_eq!(counter.get("class_error"), 0);
        assert_eq!(
            counter.get_all(),
            vec![("node_left", 2), ("topology_changed", 1)]
        );
    }
}
