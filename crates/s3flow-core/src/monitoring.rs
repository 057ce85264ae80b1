//! Prometheus metrics for the ingestion pipeline, feature-gated behind
//! `monitoring` so a build with no scrape endpoint configured can drop the
//! dependency entirely.

use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};

/// Per-bucket counters and gauges tracking product lifecycle and outbound
/// event volume. Each instance owns its own [`Registry`] rather than
/// registering into a process-wide global, so a caller wiring up several
/// bucket caches in one process (or a test constructing more than one
/// `Metrics`) never collides on metric names.
pub struct Metrics {
    registry: Registry,
    products_created_total: IntCounterVec,
    products_dropped_total: IntCounterVec,
    events_emitted_total: IntCounterVec,
    live_products: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let products_created_total = IntCounterVec::new(
            Opts::new("s3flow_products_created_total", "Products added to the cache"),
            &["bucket"],
        )?;
        let products_dropped_total = IntCounterVec::new(
            Opts::new("s3flow_products_dropped_total", "Products removed from the cache by age-out or preview removal"),
            &["bucket"],
        )?;
        let events_emitted_total = IntCounterVec::new(
            Opts::new("s3flow_events_emitted_total", "Outbound events emitted to fan-out subscribers"),
            &["bucket", "event_type"],
        )?;
        let live_products = IntGaugeVec::new(
            Opts::new("s3flow_live_products", "Products currently held in the cache"),
            &["bucket"],
        )?;

        registry.register(Box::new(products_created_total.clone()))?;
        registry.register(Box::new(products_dropped_total.clone()))?;
        registry.register(Box::new(events_emitted_total.clone()))?;
        registry.register(Box::new(live_products.clone()))?;

        Ok(Self {
            registry,
            products_created_total,
            products_dropped_total,
            events_emitted_total,
            live_products,
        })
    }

    #[cfg(test)]
    pub fn new_for_test() -> Self {
        Self::new().expect("metric definitions are static and well-formed")
    }

    pub fn record_products_created(&self, bucket: &str) {
        self.products_created_total.with_label_values(&[bucket]).inc();
        self.live_products.with_label_values(&[bucket]).inc();
    }

    pub fn record_products_dropped(&self, bucket: &str) {
        self.products_dropped_total.with_label_values(&[bucket]).inc();
        self.live_products.with_label_values(&[bucket]).dec();
    }

    pub fn record_event_emitted(&self, bucket: &str, event_type: &str) {
        self.events_emitted_total.with_label_values(&[bucket, event_type]).inc();
    }

    /// Renders the current metric set in Prometheus text exposition format,
    /// for mounting behind a `/metrics` scrape endpoint.
    pub fn export(&self) -> Result<String, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&families, &mut buf)?;
        Ok(String::from_utf8(buf).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment_per_bucket_label() {
        let metrics = Metrics::new().unwrap();
        metrics.record_products_created("alpha");
        metrics.record_products_created("alpha");
        metrics.record_products_created("beta");

        let exported = metrics.export().unwrap();
        assert!(exported.contains("s3flow_products_created_total{bucket=\"alpha\"} 2"));
        assert!(exported.contains("s3flow_products_created_total{bucket=\"beta\"} 1"));
    }

    #[test]
    fn live_products_gauge_tracks_create_and_drop() {
        let metrics = Metrics::new().unwrap();
        metrics.record_products_created("alpha");
        metrics.record_products_created("alpha");
        metrics.record_products_dropped("alpha");

        let exported = metrics.export().unwrap();
        assert!(exported.contains("s3flow_live_products{bucket=\"alpha\"} 1"));
    }
}
