use std::time::Instant;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

// ---------------------------------------------------------------------------
// Metrics catalog
// ---------------------------------------------------------------------------

/// Register all metric descriptors at startup.
///
/// Call once after the recorder is installed and before any metric is
/// recorded. Descriptors provide human-readable help text for Prometheus.
pub fn describe_all_metrics() {
    // -- Remote fetch --
    describe_counter!(
        "mediaproxy_fetch_total",
        "Remote fetch attempts by outcome (stored, failed_transient, failed_permanent)"
    );
    describe_histogram!(
        "mediaproxy_fetch_duration_seconds",
        "Remote fetch latency including decode and store"
    );
    describe_counter!(
        "mediaproxy_lookup_urls_total",
        "URLs presented to lookup, by result (filtered, existing, created)"
    );

    // -- Image service --
    describe_counter!(
        "mediaproxy_variant_cache_hits_total",
        "Resized variants served from the variants store"
    );
    describe_counter!(
        "mediaproxy_variant_cache_misses_total",
        "Resized variants produced from the original"
    );
    describe_histogram!(
        "mediaproxy_resize_duration_seconds",
        "Time to resize and re-encode one image"
    );

    // -- Metadata --
    describe_counter!(
        "mediaproxy_metadata_cache_hits_total",
        "Media records served from memcache"
    );
    describe_counter!(
        "mediaproxy_metadata_cache_misses_total",
        "Media records read through to the metadata store"
    );

    // -- Storage --
    describe_histogram!(
        "mediaproxy_storage_put_duration_seconds",
        "Object store PUT latency"
    );
    describe_histogram!(
        "mediaproxy_storage_get_duration_seconds",
        "Object store GET latency"
    );
    describe_counter!(
        "mediaproxy_storage_errors_total",
        "Object store operation errors"
    );
    describe_counter!(
        "mediaproxy_storage_retries_total",
        "Object store operation retries"
    );
    describe_counter!(
        "mediaproxy_background_write_failures_total",
        "Fire-and-forget writes that failed (variant, cache_fill, metadata)"
    );

    // -- System --
    describe_gauge!("mediaproxy_uptime_seconds", "Process uptime");
    describe_counter!(
        "mediaproxy_panic_total",
        "Total panics caught (should always be 0)"
    );
}

// ---------------------------------------------------------------------------
// Metric recording helpers
// ---------------------------------------------------------------------------

// -- Fetch --

pub fn inc_fetch(outcome: &str) {
    counter!("mediaproxy_fetch_total", "outcome" => outcome.to_string()).increment(1);
}

pub fn record_fetch_duration(seconds: f64) {
    histogram!("mediaproxy_fetch_duration_seconds").record(seconds);
}

pub fn add_lookup_urls(result: &str, count: u64) {
    counter!("mediaproxy_lookup_urls_total", "result" => result.to_string()).increment(count);
}

// -- Image service --

pub fn inc_variant_cache_hit() {
    counter!("mediaproxy_variant_cache_hits_total").increment(1);
}

pub fn inc_variant_cache_miss() {
    counter!("mediaproxy_variant_cache_misses_total").increment(1);
}

pub fn record_resize_duration(seconds: f64) {
    histogram!("mediaproxy_resize_duration_seconds").record(seconds);
}

// -- Metadata --

pub fn add_metadata_cache_hits(count: u64) {
    counter!("mediaproxy_metadata_cache_hits_total").increment(count);
}

pub fn add_metadata_cache_misses(count: u64) {
    counter!("mediaproxy_metadata_cache_misses_total").increment(count);
}

// -- Storage --

pub fn record_storage_put_duration(store: &str, seconds: f64) {
    histogram!("mediaproxy_storage_put_duration_seconds", "store" => store.to_string())
        .record(seconds);
}

pub fn record_storage_get_duration(store: &str, seconds: f64) {
    histogram!("mediaproxy_storage_get_duration_seconds", "store" => store.to_string())
        .record(seconds);
}

pub fn inc_storage_error(operation: &str) {
    counter!("mediaproxy_storage_errors_total", "operation" => operation.to_string()).increment(1);
}

pub fn inc_storage_retries(operation: &str) {
    counter!("mediaproxy_storage_retries_total", "operation" => operation.to_string()).increment(1);
}

pub fn inc_background_write_failure(kind: &str) {
    counter!("mediaproxy_background_write_failures_total", "kind" => kind.to_string())
        .increment(1);
}

// -- System --

pub fn set_uptime_seconds(seconds: f64) {
    gauge!("mediaproxy_uptime_seconds").set(seconds);
}

pub fn inc_panic_total() {
    counter!("mediaproxy_panic_total").increment(1);
}

// ---------------------------------------------------------------------------
// Uptime tracking task
// ---------------------------------------------------------------------------

/// Update the uptime gauge every second until cancelled.
pub async fn run_uptime_task(start_time: Instant, cancel: tokio_util::sync::CancellationToken) {
    let interval = std::time::Duration::from_secs(1);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {
                set_uptime_seconds(start_time.elapsed().as_secs_f64());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Prometheus recorder installation
// ---------------------------------------------------------------------------

/// Install the global Prometheus recorder and return the render handle.
pub fn install_prometheus_recorder(
) -> Result<metrics_exporter_prometheus::PrometheusHandle, metrics_exporter_prometheus::BuildError>
{
    metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()
}
