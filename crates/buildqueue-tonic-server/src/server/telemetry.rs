//! # Telemetry Features
//!
//! Logs always go to the console through `tracing_subscriber::fmt`. Spans and
//! metrics are exported via OpenTelemetry when the matching features are
//! enabled.
//!
//! ## Feature matrix
//!
//! - `tracing`: Enables OpenTelemetry distributed tracing (via spans), and
//!   the `tracing` events of the `buildqueue` engine.
//! - `metrics`: Enables OpenTelemetry metrics (via counters, histograms, etc.).
//! - `otlp`: Enables the OTLP/gRPC exporter. The endpoint is read from
//!   `OTEL_EXPORTER_OTLP_ENDPOINT`, the compression from `OTLP_COMPRESSION`
//!   (`gzip` or `zstd`, optional).
//! - `stdout`: Enables the stdout exporter.
//!
//! ## Feature constraints
//!
//! - Exporters require using at least one of: `tracing` or `metrics`.
//! - Both `otlp` and `stdout` exporters can be enabled at the same time.
//!
//! ## Example usage
//!
//! ```bash
//! cargo run --features tracing,metrics,otlp
//! cargo run --features tracing,stdout
//! ```

#[cfg(all(feature = "otlp", not(any(feature = "tracing", feature = "metrics"))))]
compile_error!("The 'otlp' feature requires at least one of 'tracing' or 'metrics' to be enabled.");

#[cfg(all(feature = "stdout", not(any(feature = "tracing", feature = "metrics"))))]
compile_error!(
    "The 'stdout' feature requires at least one of 'tracing' or 'metrics' to be enabled."
);

use buildqueue::LeaseExpiry;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(all(feature = "otlp", any(feature = "metrics", feature = "tracing")))]
use opentelemetry_otlp::{Compression, Protocol, WithExportConfig, WithTonicConfig};
#[cfg(all(feature = "otlp", feature = "metrics"))]
use opentelemetry_sdk::metrics::Temporality;

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_semantic_conventions as semvcns;

#[cfg(feature = "tracing")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "tracing")]
use opentelemetry_sdk::propagation::TraceContextPropagator;
#[cfg(feature = "tracing")]
use opentelemetry_sdk::trace as sdktrace;

pub struct TelemetryProviders {
    #[cfg(feature = "tracing")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and shuts down every exporter. Errors are printed, not
    /// returned, since logging may already be gone.
    pub fn shutdown(&self) {
        #[cfg(feature = "tracing")]
        {
            if let Err(err) = self.tracer_provider.force_flush() {
                eprintln!("Error flushing traces: {err:#?}");
            }
            if let Err(err) = self.tracer_provider.shutdown() {
                eprintln!("Error shutting down tracer: {err:#?}");
            }
        }

        #[cfg(feature = "metrics")]
        {
            if let Err(err) = self.meter_provider.force_flush() {
                eprintln!("Error flushing metrics: {err:#?}");
            }
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("Error shutting down meter: {err:#?}");
            }
        }
    }
}

pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "tracing")]
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    #[cfg(feature = "tracing")]
    let tracer_provider = init_tracer()?;

    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics()?;

    #[cfg(any(feature = "metrics", feature = "tracing"))]
    let scope = InstrumentationScope::builder("buildqueue")
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true),
        );

    #[cfg(feature = "tracing")]
    let registry = {
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());
        registry.with(
            tracing_opentelemetry::layer()
                .with_tracer(tracer_provider.tracer_with_scope(scope.clone()))
                .with_error_records_to_exceptions(true),
        )
    };

    #[cfg(feature = "metrics")]
    let registry = {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let meter = opentelemetry::global::meter_with_scope(scope);
        init_metric_handles(meter);

        registry.with(tracing_opentelemetry::MetricsLayer::new(
            meter_provider.clone(),
        ))
    };

    registry.init();

    Ok(TelemetryProviders {
        #[cfg(feature = "tracing")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(any(feature = "metrics", feature = "tracing"))]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name("buildqueue")
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

#[cfg(all(feature = "otlp", any(feature = "metrics", feature = "tracing")))]
fn otlp_compression() -> anyhow::Result<Option<Compression>> {
    use std::str::FromStr;

    match std::env::var("OTLP_COMPRESSION") {
        Ok(raw) => Ok(Some(Compression::from_str(&raw.to_ascii_lowercase())?)),
        Err(_) => Ok(None),
    }
}

#[cfg(feature = "metrics")]
fn init_metrics() -> anyhow::Result<sdkmetrics::SdkMeterProvider> {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::MetricExporter;
        let exporter = MetricExporter::default();
        let reader = opentelemetry_sdk::metrics::PeriodicReader::builder(exporter)
            .with_interval(std::time::Duration::from_secs(5))
            .build();

        builder.with_reader(reader)
    };

    #[cfg(feature = "otlp")]
    let builder = {
        use anyhow::Context;

        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_timeout(std::time::Duration::from_secs(10))
            .with_protocol(Protocol::Grpc)
            .with_temporality(Temporality::Delta);
        let exporter = match otlp_compression()? {
            Some(compression) => exporter.with_compression(compression),
            None => exporter,
        };
        let exporter = exporter
            .build()
            .context("failed to build metrics exporter")?;

        builder.with_periodic_exporter(exporter)
    };

    Ok(builder.build())
}

#[cfg(feature = "tracing")]
fn init_tracer() -> anyhow::Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::SpanExporter;
        let exporter = SpanExporter::default();
        let batch = sdktrace::BatchSpanProcessor::builder(exporter)
            .with_batch_config(
                sdktrace::BatchConfigBuilder::default()
                    .with_scheduled_delay(std::time::Duration::from_secs(5))
                    .with_max_queue_size(2048)
                    .build(),
            )
            .build();
        builder.with_span_processor(batch)
    };

    #[cfg(feature = "otlp")]
    let builder = {
        use anyhow::Context;

        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_timeout(std::time::Duration::from_secs(10))
            .with_protocol(Protocol::Grpc);
        let exporter = match otlp_compression()? {
            Some(compression) => exporter.with_compression(compression),
            None => exporter,
        };
        let exporter = exporter
            .build()
            .context("failed to build tracer exporter")?;

        let batch = sdktrace::BatchSpanProcessor::builder(exporter)
            .with_batch_config(
                sdktrace::BatchConfigBuilder::default()
                    .with_scheduled_delay(std::time::Duration::from_secs(5))
                    .with_max_queue_size(2048)
                    .build(),
            )
            .build();

        builder.with_span_processor(batch)
    };

    Ok(builder.build())
}

#[cfg(feature = "metrics")]
static EXECUTIONS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static ASSIGNMENTS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static REPORTS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static LEASES_EXPIRED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static OPERATIONS_REQUEUED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static OPERATIONS_EVICTED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static STREAMS_INFLIGHT: OnceLock<UpDownCounter<i64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static POLL_DURATION_MS: OnceLock<Histogram<f64>> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: Meter) {
    let _ = EXECUTIONS.set(
        meter
            .u64_counter("executions")
            .with_description("Execute requests by admission outcome")
            .build(),
    );

    let _ = ASSIGNMENTS.set(
        meter
            .u64_counter("work_assignments")
            .with_description("Operations handed to workers")
            .build(),
    );

    let _ = REPORTS.set(
        meter
            .u64_counter("progress_reports")
            .with_description("Worker reports by outcome")
            .build(),
    );

    let _ = LEASES_EXPIRED.set(
        meter
            .u64_counter("leases_expired")
            .with_description("Worker leases that lapsed, idle or executing")
            .build(),
    );

    let _ = OPERATIONS_REQUEUED.set(
        meter
            .u64_counter("operations_requeued")
            .with_description("Executing operations returned to the queue by lease expiry")
            .build(),
    );

    let _ = OPERATIONS_EVICTED.set(
        meter
            .u64_counter("operations_evicted")
            .with_description("Finished operations dropped after retention")
            .build(),
    );

    let _ = STREAMS_INFLIGHT.set(
        meter
            .i64_up_down_counter("streams_inflight")
            .with_description("Concurrent operation update streams")
            .build(),
    );

    let _ = POLL_DURATION_MS.set(
        meter
            .f64_histogram("poll_duration")
            .with_unit("ms")
            .with_description("Time a PollForWork call spent waiting")
            .build(),
    );
}

/// Counts one execute request. `outcome` is `created`, `deduplicated`,
/// `cache_hit` or `rejected`.
#[cfg(feature = "metrics")]
pub fn record_execution(outcome: &'static str) {
    if let Some(counter) = EXECUTIONS.get() {
        counter.add(1, &[KeyValue::new("outcome", outcome)]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_execution(_outcome: &'static str) {}

#[cfg(feature = "metrics")]
pub fn increment_assignments() {
    if let Some(counter) = ASSIGNMENTS.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_assignments() {}

/// Counts one worker report. `outcome` is `accepted`, `stale`,
/// `not_assigned` or `cancelled`.
#[cfg(feature = "metrics")]
pub fn record_report(outcome: &'static str) {
    if let Some(counter) = REPORTS.get() {
        counter.add(1, &[KeyValue::new("outcome", outcome)]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_report(_outcome: &'static str) {}

/// Records one lease expiry pass. Requeued work is counted with outcome
/// `requeued`, work that found no room in the full queue with `displaced`.
#[cfg(feature = "metrics")]
pub fn record_lease_expiry(expiry: &LeaseExpiry) {
    if let Some(counter) = LEASES_EXPIRED.get() {
        counter.add(expiry.expired as u64, &[]);
    }
    if let Some(counter) = OPERATIONS_REQUEUED.get() {
        counter.add(
            expiry.requeued as u64,
            &[KeyValue::new("outcome", "requeued")],
        );
        counter.add(
            expiry.displaced as u64,
            &[KeyValue::new("outcome", "displaced")],
        );
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_lease_expiry(_expiry: &LeaseExpiry) {}

#[cfg(feature = "metrics")]
pub fn record_operations_evicted(count: u64) {
    if let Some(counter) = OPERATIONS_EVICTED.get() {
        counter.add(count, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_operations_evicted(_count: u64) {}

#[cfg(feature = "metrics")]
pub fn increment_streams_inflight() {
    if let Some(counter) = STREAMS_INFLIGHT.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_streams_inflight() {}

#[cfg(feature = "metrics")]
pub fn decrement_streams_inflight() {
    if let Some(counter) = STREAMS_INFLIGHT.get() {
        counter.add(-1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn decrement_streams_inflight() {}

#[cfg(feature = "metrics")]
pub fn record_poll_duration(duration_ms: f64) {
    if let Some(histogram) = POLL_DURATION_MS.get() {
        histogram.record(duration_ms, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_poll_duration(_duration_ms: f64) {}
