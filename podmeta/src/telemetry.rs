//! OpenTelemetry metrics export module
//!
//! Exports pod metadata cache metrics to an OpenTelemetry Collector.
//!
//! ## OTLP Endpoint
//! Taken from `OTEL_EXPORTER_OTLP_ENDPOINT`. Without it the `record_*`
//! helpers are no-ops.

use anyhow::{Context, Result};
use log::info;
use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Metric export interval in seconds
const METRIC_EXPORT_INTERVAL_SECS: u64 = 30;

/// Global metrics handle
static METRICS: OnceLock<PodMetaMetrics> = OnceLock::new();

/// Global MeterProvider for graceful shutdown
static METER_PROVIDER: OnceLock<SdkMeterProvider> = OnceLock::new();

/// Table sizes read by the observable gauge callbacks.
static POD_TABLE_SIZE: AtomicU64 = AtomicU64::new(0);
static OWNER_TABLE_SIZE: AtomicU64 = AtomicU64::new(0);
static SERVICE_TABLE_SIZE: AtomicU64 = AtomicU64::new(0);

/// podmeta metrics collection
///
/// Note: Do NOT add _total suffix to Counter names (Prometheus adds it automatically)
pub struct PodMetaMetrics {
    pub pod_added: Counter<u64>,
    pub pod_updated: Counter<u64>,
    pub pod_deleted: Counter<u64>,
    pub ip_lookup_miss: Counter<u64>,

    // Owners, services and namespaces, labelled by `kind`
    pub other_added: Counter<u64>,
    pub other_updated: Counter<u64>,
    pub other_deleted: Counter<u64>,
}

impl PodMetaMetrics {
    fn new(meter: &Meter) -> Self {
        let counter = |name: &'static str, description: &'static str| {
            meter
                .u64_counter(name)
                .with_description(description)
                .with_unit("events")
                .build()
        };
        Self {
            pod_added: counter("pod_added", "Number of pod add events received"),
            pod_updated: counter("pod_updated", "Number of pod update events received"),
            pod_deleted: counter("pod_deleted", "Number of pod delete events received"),
            ip_lookup_miss: counter(
                "ip_lookup_miss",
                "Number of pod lookups that found no cached pod",
            ),
            other_added: counter("other_added", "Number of non-pod add events received"),
            other_updated: counter("other_updated", "Number of non-pod update events received"),
            other_deleted: counter("other_deleted", "Number of non-pod delete events received"),
        }
    }
}

/// Priority:
/// 1. OTEL_EXPORTER_OTLP_ENDPOINT environment variable
/// 2. If not set, metrics are disabled (no default fallback)
fn get_otlp_endpoint() -> Option<String> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;
    if endpoint.is_empty() {
        return None;
    }

    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        Some(format!("http://{}", endpoint))
    } else {
        Some(endpoint)
    }
}

/// Initialize OpenTelemetry metrics provider
///
/// Configures metrics export to OTLP Collector via gRPC.
/// Skips initialization if OTEL_EXPORTER_OTLP_ENDPOINT is not set.
pub fn init_metrics() -> Result<()> {
    let endpoint = match get_otlp_endpoint() {
        Some(ep) => ep,
        None => {
            info!("OTEL_EXPORTER_OTLP_ENDPOINT not set. Metrics export disabled.");
            return Ok(());
        }
    };

    info!("Initializing OpenTelemetry metrics exporter");
    info!("OTLP endpoint: {}", endpoint);

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(&endpoint)
        .with_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to create OTLP metric exporter")?;

    let reader = PeriodicReader::builder(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_interval(Duration::from_secs(METRIC_EXPORT_INTERVAL_SECS))
        .build();

    let resource = Resource::default().merge(&Resource::new(vec![
        KeyValue::new("service.name", "podmeta"),
        KeyValue::new("telemetry.sdk.language", "rust"),
    ]));

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(provider.clone());
    let _ = METER_PROVIDER.set(provider);

    let meter = global::meter("podmeta");

    for (name, description, size) in [
        ("pod_table_size", "Number of identifiers in the pod table", &POD_TABLE_SIZE),
        ("owner_table_size", "Number of cached owner objects", &OWNER_TABLE_SIZE),
        ("service_table_size", "Number of pods with known services", &SERVICE_TABLE_SIZE),
    ] {
        let _gauge = meter
            .u64_observable_gauge(name)
            .with_description(description)
            .with_unit("entries")
            .with_callback(move |observer| observer.observe(size.load(Ordering::Relaxed), &[]))
            .build();
    }

    let _ = METRICS.set(PodMetaMetrics::new(&meter));

    info!("OpenTelemetry metrics initialized successfully");
    Ok(())
}

pub fn metrics() -> Option<&'static PodMetaMetrics> {
    METRICS.get()
}

// === Pod table helpers ===

pub fn record_pod_added() {
    if let Some(m) = metrics() {
        m.pod_added.add(1, &[]);
    }
}

pub fn record_pod_updated() {
    if let Some(m) = metrics() {
        m.pod_updated.add(1, &[]);
    }
}

pub fn record_pod_deleted() {
    if let Some(m) = metrics() {
        m.pod_deleted.add(1, &[]);
    }
}

pub fn record_ip_lookup_miss() {
    if let Some(m) = metrics() {
        m.ip_lookup_miss.add(1, &[]);
    }
}

pub fn record_pod_table_size(size: usize) {
    POD_TABLE_SIZE.store(size as u64, Ordering::Relaxed);
}

// === Owner index helpers ===

pub fn record_other_added(kind: &str) {
    if let Some(m) = metrics() {
        m.other_added.add(1, &[KeyValue::new("kind", kind.to_string())]);
    }
}

pub fn record_other_updated(kind: &str) {
    if let Some(m) = metrics() {
        m.other_updated.add(1, &[KeyValue::new("kind", kind.to_string())]);
    }
}

pub fn record_other_deleted(kind: &str) {
    if let Some(m) = metrics() {
        m.other_deleted.add(1, &[KeyValue::new("kind", kind.to_string())]);
    }
}

pub fn record_owner_table_size(size: usize) {
    OWNER_TABLE_SIZE.store(size as u64, Ordering::Relaxed);
}

pub fn record_service_table_size(size: usize) {
    SERVICE_TABLE_SIZE.store(size as u64, Ordering::Relaxed);
}

/// Shutdown OpenTelemetry (graceful shutdown)
/// Flushes pending metrics and shuts down the MeterProvider
pub fn shutdown_metrics() {
    if let Some(provider) = METER_PROVIDER.get() {
        info!("Shutting down OpenTelemetry metrics...");
        if let Err(e) = provider.shutdown() {
            log::warn!("Failed to shutdown MeterProvider: {}", e);
        } else {
            info!("OpenTelemetry metrics shutdown complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_get_otlp_endpoint_not_set() {
        unsafe {
            std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT");
        }
        assert!(get_otlp_endpoint().is_none());
    }

    #[test]
    #[serial]
    fn test_get_otlp_endpoint_empty() {
        unsafe {
            std::env::set_var("OTEL_EXPORTER_OTLP_ENDPOINT", "");
        }
        assert!(get_otlp_endpoint().is_none());
        unsafe {
            std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT");
        }
    }

    #[test]
    #[serial]
    fn test_get_otlp_endpoint_adds_http_prefix() {
        unsafe {
            std::env::set_var("OTEL_EXPORTER_OTLP_ENDPOINT", "collector:4317");
        }
        assert_eq!(
            get_otlp_endpoint(),
            Some("http://collector:4317".to_string())
        );
        unsafe {
            std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT");
        }
    }

    #[test]
    #[serial]
    fn test_init_metrics_without_endpoint_is_noop() {
        unsafe {
            std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT");
        }
        assert!(init_metrics().is_ok());
        assert!(metrics().is_none());
        record_pod_added();
        record_other_deleted("ReplicaSet");
    }

    #[test]
    fn test_table_sizes_are_stored() {
        record_owner_table_size(7);
        assert_eq!(OWNER_TABLE_SIZE.load(Ordering::Relaxed), 7);
    }
}
