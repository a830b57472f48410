use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::trace;

pub const IDEMPOTENCY_REQUESTS_TOTAL: &str = "idempotency.requests.total";
pub const IDEMPOTENCY_CACHE_HITS: &str = "idempotency.cache.hits";
pub const TRANSACTIONS_CREATED: &str = "transactions.created";
pub const TRANSACTIONS_LISTED: &str = "transactions.listed";

/// Increment hook for named counters. Exporting them is the sink's concern.
pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &str);
}

/// Process-local counters, served as JSON on `GET /metrics`.
#[derive(Debug, Default)]
pub struct CounterRegistry {
    counters: Mutex<BTreeMap<String, u64>>,
}

impl CounterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .map(|counters| counters.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters
            .lock()
            .map(|counters| counters.clone())
            .unwrap_or_default()
    }
}

impl MetricsSink for CounterRegistry {
    fn increment(&self, name: &str) {
        // Telemetry never fails a request; a poisoned lock just drops the sample.
        if let Ok(mut counters) = self.counters.lock() {
            let value = counters.entry(name.to_string()).or_insert(0);
            *value += 1;
            trace!(counter = name, value = *value, "counter incremented");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CounterRegistry, IDEMPOTENCY_CACHE_HITS, IDEMPOTENCY_REQUESTS_TOTAL, MetricsSink};

    #[test]
    fn counts_per_name() {
        let registry = CounterRegistry::new();
        registry.increment(IDEMPOTENCY_REQUESTS_TOTAL);
        registry.increment(IDEMPOTENCY_REQUESTS_TOTAL);
        registry.increment(IDEMPOTENCY_CACHE_HITS);

        assert_eq!(registry.get(IDEMPOTENCY_REQUESTS_TOTAL), 2);
        assert_eq!(registry.get(IDEMPOTENCY_CACHE_HITS), 1);
        assert_eq!(registry.get("missing"), 0);
        assert_eq!(registry.snapshot().len(), 2);
    }
}
