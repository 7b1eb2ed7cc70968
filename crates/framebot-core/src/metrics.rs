// crates/framebot-core/src/metrics.rs
//
// Process-wide counter registry. Counters are created once, handed down as
// handles, and bumped lock-free; there is no exporter here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct MetricsRegistry {
    counters: Mutex<HashMap<String, Arc<Counter>>>,
}

impl MetricsRegistry {
    /// Fetch or create the named counter. The same name always yields the
    /// same counter for the life of the process.
    pub fn counter(&self, name: &str) -> Arc<Counter> {
        let mut counters = self.counters.lock();
        counters.entry(name.to_string()).or_default().clone()
    }

    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.counters
            .lock()
            .iter()
            .map(|(name, counter)| (name.clone(), counter.value()))
            .collect()
    }
}

/// The process-wide registry.
pub fn global() -> &'static MetricsRegistry {
    static REGISTRY: OnceLock<MetricsRegistry> = OnceLock::new();
    REGISTRY.get_or_init(MetricsRegistry::default)
}
