//! OpenTelemetry metrics export
//!
//! Counts what the probes reported and what the transport lost, so a test
//! run can be checked for silent drops. Export is enabled only when an OTLP
//! endpoint is configured (`OTEL_EXPORTER_OTLP_ENDPOINT`).

use anyhow::{Context, Result};
use log::{info, warn};
use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};
use std::time::Duration;

/// Metric export interval in seconds
const METRIC_EXPORT_INTERVAL_SECS: u64 = 30;

static METRICS: OnceLock<VhostWatchMetrics> = OnceLock::new();

static METER_PROVIDER: OnceLock<SdkMeterProvider> = OnceLock::new();

/// Attached probes, read by the `active_probes` gauge callback.
static ACTIVE_PROBES: OnceLock<RwLock<HashMap<String, u64>>> = OnceLock::new();

fn active_probes_map() -> &'static RwLock<HashMap<String, u64>> {
    ACTIVE_PROBES.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Note: Do NOT add _total suffix to Counter names (Prometheus adds it automatically)
pub struct VhostWatchMetrics {
    pub ioctl_events: Counter<u64>,
    pub thread_create_events: Counter<u64>,
    pub dropped_records: Counter<u64>,
    pub pinned_workers: Counter<u64>,
}

impl VhostWatchMetrics {
    fn new(meter: &Meter) -> Self {
        Self {
            ioctl_events: meter
                .u64_counter("vhost_ioctl_events")
                .with_description("Number of vhost_net_ioctl entries observed")
                .with_unit("events")
                .build(),
            thread_create_events: meter
                .u64_counter("vhost_thread_create_events")
                .with_description("Number of vhost worker kthreads created")
                .with_unit("events")
                .build(),
            dropped_records: meter
                .u64_counter("dropped_records")
                .with_description("Records lost in the perf buffers or the host queues")
                .with_unit("records")
                .build(),
            pinned_workers: meter
                .u64_counter("pinned_workers")
                .with_description("Number of vhost workers whose affinity was changed")
                .with_unit("workers")
                .build(),
        }
    }
}

/// Adds a scheme to bare `host:port` endpoints. Empty means disabled.
fn normalize_endpoint(endpoint: &str) -> Option<String> {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        return None;
    }

    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        Some(format!("http://{}", endpoint))
    } else {
        Some(endpoint.to_string())
    }
}

/// Initialize the OTLP metrics pipeline.
///
/// Skips initialization when no endpoint is configured.
pub fn init_metrics(endpoint: Option<&str>) -> Result<()> {
    let Some(endpoint) = endpoint.and_then(normalize_endpoint) else {
        info!("OTEL_EXPORTER_OTLP_ENDPOINT not set. Metrics export disabled.");
        return Ok(());
    };

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
        KeyValue::new("service.name", "vhostwatch"),
        KeyValue::new("telemetry.sdk.language", "rust"),
    ]));

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(provider.clone());
    let _ = METER_PROVIDER.set(provider);

    let meter = global::meter("vhostwatch");

    let _active_probes_gauge = meter
        .u64_observable_gauge("active_probes")
        .with_description("Number of currently attached eBPF probes")
        .with_unit("probes")
        .with_callback(|observer| {
            if let Ok(probes) = active_probes_map().read() {
                for (probe_name, count) in probes.iter() {
                    observer.observe(*count, &[KeyValue::new("probe", probe_name.clone())]);
                }
            }
        })
        .build();

    let _ = METRICS.set(VhostWatchMetrics::new(&meter));

    info!("OpenTelemetry metrics initialized");
    Ok(())
}

pub fn metrics() -> Option<&'static VhostWatchMetrics> {
    METRICS.get()
}

pub fn record_active_probe(probe_name: &str, count: u64) {
    if let Ok(mut probes) = active_probes_map().write() {
        probes.insert(probe_name.to_string(), count);
    }
}

pub fn record_ioctl_event(command: &str, cpu: u32) {
    if let Some(m) = metrics() {
        let attrs = [
            KeyValue::new("command", command.to_string()),
            KeyValue::new("cpu", cpu as i64),
        ];
        m.ioctl_events.add(1, &attrs);
    }
}

pub fn record_thread_create_event(cpu: u32) {
    if let Some(m) = metrics() {
        m.thread_create_events
            .add(1, &[KeyValue::new("cpu", cpu as i64)]);
    }
}

/// `stage` is `perf` for kernel-side losses and `queue` for host-side ones.
pub fn record_dropped(channel: &str, stage: &'static str, count: u64) {
    if let Some(m) = metrics() {
        let attrs = [
            KeyValue::new("channel", channel.to_string()),
            KeyValue::new("stage", stage),
        ];
        m.dropped_records.add(count, &attrs);
    }
}

pub fn record_pinned_workers(count: u64) {
    if let Some(m) = metrics() {
        m.pinned_workers.add(count, &[]);
    }
}

/// Flushes pending metrics and shuts down the MeterProvider.
pub fn shutdown_metrics() {
    if let Some(provider) = METER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            warn!("Failed to shutdown MeterProvider: {}", e);
        } else {
            info!("OpenTelemetry metrics shutdown complete");
        }
    }
}
