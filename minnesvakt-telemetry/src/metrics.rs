//! ## minnesvakt-telemetry::metrics
//! **Prometheus registry for allocation counters**
//!
//! ### Components:
//! - allocation/release counters incremented by the driver scenarios
//! - a live-bytes gauge mirroring the ledger's running total

use prometheus::{Counter, Gauge, Registry};

#[derive(Debug, Clone)]
pub struct MetricsRecorder {
    pub registry: prometheus::Registry,
    pub tracked_allocations: prometheus::Counter,
    pub tracked_releases: prometheus::Counter,
    pub live_bytes: prometheus::Gauge,
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRecorder {
    pub fn new() -> Self {
        let registry = Registry::new();
        let tracked_allocations = Counter::new(
            "minnesvakt_allocations_total",
            "Total tracked allocations performed",
        )
        .unwrap();
        let tracked_releases = Counter::new(
            "minnesvakt_releases_total",
            "Total tracked releases performed",
        )
        .unwrap();
        let live_bytes = Gauge::new("minnesvakt_live_bytes", "Bytes currently tracked as live").unwrap();

        registry
            .register(Box::new(tracked_allocations.clone()))
            .unwrap();
        registry
            .register(Box::new(tracked_releases.clone()))
            .unwrap();
        registry.register(Box::new(live_bytes.clone())).unwrap();

        Self {
            registry,
            tracked_allocations,
            tracked_releases,
            live_bytes,
        }
    }

    pub fn gather_metrics(&self) -> Result<String, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::<u8>::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer).unwrap())
    }

    pub fn inc_allocations(&self) {
        self.tracked_allocations.inc();
    }

    pub fn inc_releases(&self) {
        self.tracked_releases.inc();
    }

    pub fn set_live_bytes(&self, bytes: usize) {
        self.live_bytes.set(bytes as f64);
    }
}
