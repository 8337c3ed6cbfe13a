use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, Registry, TextEncoder};
use std::sync::OnceLock;
use tracing::warn;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

struct MemoryMetrics {
    operations: IntCounterVec,
    consolidations: IntCounterVec,
    cache_events: IntCounterVec,
    context_bytes: Histogram,
}

static METRICS: OnceLock<Option<MemoryMetrics>> = OnceLock::new();

fn build() -> prometheus::Result<MemoryMetrics> {
    let operations = IntCounterVec::new(
        prometheus::opts!("memory_operations_total", "Memory operations by outcome"),
        &["operation", "status"],
    )?;
    let consolidations = IntCounterVec::new(
        prometheus::opts!("memory_consolidations_total", "Consolidation passes by outcome"),
        &["outcome"],
    )?;
    let cache_events = IntCounterVec::new(
        prometheus::opts!("memory_cache_events_total", "Cache hits, misses and timeouts"),
        &["event"],
    )?;
    let context_bytes = Histogram::with_opts(
        HistogramOpts::new("memory_context_bytes", "Serialized size of assembled context bundles")
            .buckets(prometheus::exponential_buckets(256.0, 2.0, 12)?),
    )?;

    REGISTRY.register(Box::new(operations.clone()))?;
    REGISTRY.register(Box::new(consolidations.clone()))?;
    REGISTRY.register(Box::new(cache_events.clone()))?;
    REGISTRY.register(Box::new(context_bytes.clone()))?;

    Ok(MemoryMetrics {
        operations,
        consolidations,
        cache_events,
        context_bytes,
    })
}

fn metrics() -> Option<&'static MemoryMetrics> {
    METRICS
        .get_or_init(|| match build() {
            Ok(metrics) => Some(metrics),
            Err(e) => {
                warn!("Metrics disabled: {}", e);
                None
            }
        })
        .as_ref()
}

/// Registers the collectors. Recording also registers lazily.
pub fn init_metrics() {
    let _ = metrics();
}

pub fn record_operation(operation: &str, status: &str) {
    if let Some(m) = metrics() {
        m.operations.with_label_values(&[operation, status]).inc();
    }
}

pub fn record_consolidation(outcome: &str) {
    if let Some(m) = metrics() {
        m.consolidations.with_label_values(&[outcome]).inc();
    }
}

pub fn record_cache_event(event: &str) {
    if let Some(m) = metrics() {
        m.cache_events.with_label_values(&[event]).inc();
    }
}

pub fn observe_context_bytes(bytes: usize) {
    if let Some(m) = metrics() {
        m.context_bytes.observe(bytes as f64);
    }
}

/// Prometheus text exposition of every registered metric.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_recorded_series() {
        init_metrics();
        record_operation("append_message", "ok");
        record_consolidation("completed");
        observe_context_bytes(1024);

        let text = render();
        assert!(text.contains("memory_operations_total"));
        assert!(text.contains("operation=\"append_message\""));
        assert!(text.contains("memory_consolidations_total"));
        assert!(text.contains("memory_context_bytes_bucket"));
    }
}
