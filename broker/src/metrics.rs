// Broker counters

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use engine_core::EngineKind;
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct BrokerMetrics {
    pub synthesis_count: Arc<AtomicU64>,
    pub total_synthesis_time_ms: Arc<AtomicU64>,
    pub cache_hits: Arc<AtomicU64>,
    pub cache_misses: Arc<AtomicU64>,
    pub azure_calls: Arc<AtomicU64>,
    pub edge_calls: Arc<AtomicU64>,
    pub retries: Arc<AtomicU64>,
    pub failovers: Arc<AtomicU64>,
    pub failures: Arc<AtomicU64>,
    pub batches: Arc<AtomicU64>,
}

impl BrokerMetrics {
    pub fn new() -> Self {
        Self {
            synthesis_count: Arc::new(AtomicU64::new(0)),
            total_synthesis_time_ms: Arc::new(AtomicU64::new(0)),
            cache_hits: Arc::new(AtomicU64::new(0)),
            cache_misses: Arc::new(AtomicU64::new(0)),
            azure_calls: Arc::new(AtomicU64::new(0)),
            edge_calls: Arc::new(AtomicU64::new(0)),
            retries: Arc::new(AtomicU64::new(0)),
            failovers: Arc::new(AtomicU64::new(0)),
            failures: Arc::new(AtomicU64::new(0)),
            batches: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn record_synthesis(&self, time_ms: u64, cache_hit: bool) {
        self.synthesis_count.fetch_add(1, Ordering::Relaxed);
        self.total_synthesis_time_ms.fetch_add(time_ms, Ordering::Relaxed);
        if cache_hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_provider_call(&self, engine: EngineKind) {
        let counter = match engine {
            EngineKind::Azure => &self.azure_calls,
            EngineKind::Edge => &self.edge_calls,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failover(&self) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn avg_synthesis_time_ms(&self) -> f64 {
        let count = self.synthesis_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        let total = self.total_synthesis_time_ms.load(Ordering::Relaxed);
        total as f64 / count as f64
    }

    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        (hits as f64 / total as f64) * 100.0
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            synthesis_count: self.synthesis_count.load(Ordering::Relaxed),
            avg_synthesis_time_ms: self.avg_synthesis_time_ms(),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_hit_rate: self.cache_hit_rate(),
            azure_calls: self.azure_calls.load(Ordering::Relaxed),
            edge_calls: self.edge_calls.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failovers: self.failovers.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
        }
    }
}

impl Default for BrokerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub synthesis_count: u64,
    pub avg_synthesis_time_ms: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub azure_calls: u64,
    pub edge_calls: u64,
    pub retries: u64,
    pub failovers: u64,
    pub failures: u64,
    pub batches: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_hit_rate() {
        let metrics = BrokerMetrics::new();
        assert_eq!(metrics.cache_hit_rate(), 0.0);
        metrics.record_synthesis(100, false);
        metrics.record_synthesis(0, true);
        metrics.record_synthesis(0, true);
        metrics.record_synthesis(20, false);
        assert_eq!(metrics.cache_hit_rate(), 50.0);
        assert_eq!(metrics.avg_synthesis_time_ms(), 30.0);
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = BrokerMetrics::new();
        let clone = metrics.clone();
        clone.record_provider_call(EngineKind::Edge);
        clone.record_failover();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.edge_calls, 1);
        assert_eq!(snapshot.azure_calls, 0);
        assert_eq!(snapshot.failovers, 1);
    }
}
