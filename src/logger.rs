use std::{
    fmt,
    path::{Path, PathBuf},
    sync::OnceLock,
    time::Duration,
};

use anyhow::Result;
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram},
};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, WithExportConfig};
use opentelemetry_sdk::{Resource, logs::SdkLoggerProvider, metrics::SdkMeterProvider};
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Registry, fmt as tfmt, prelude::*};

/// Target of the one-line-per-cycle JSON events.
pub const CYCLE_TARGET: &str = "cycle";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub log_level: String,
    /// Rolling text log plus JSON cycle log are written here when set.
    pub log_dir: Option<PathBuf>,
    /// OTLP (gRPC) collector; takes precedence over `log_dir`.
    pub otel_endpoint: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            otel_endpoint: None,
        }
    }
}

/// Keeps exporters alive; flush them with [`TelemetryGuard::shutdown`] before exit.
pub enum TelemetryGuard {
    Otlp {
        logger_provider: SdkLoggerProvider,
        meter_provider: SdkMeterProvider,
    },
    Files,
    Stderr,
}

impl TelemetryGuard {
    pub fn shutdown(self) {
        if let TelemetryGuard::Otlp {
            logger_provider,
            meter_provider,
        } = self
        {
            if let Err(e) = meter_provider.shutdown() {
                error!("metrics shutdown failed: {e}");
            }
            if let Err(e) = logger_provider.shutdown() {
                error!("log shutdown failed: {e}");
            }
        }
    }
}

impl fmt::Debug for TelemetryGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryGuard::Otlp { .. } => f.write_str("TelemetryGuard::Otlp"),
            TelemetryGuard::Files => f.write_str("TelemetryGuard::Files"),
            TelemetryGuard::Stderr => f.write_str("TelemetryGuard::Stderr"),
        }
    }
}

/// Install the global subscriber: OTLP when an endpoint is configured,
/// rolling files when a log directory is, stderr otherwise.
pub fn init_tracing(config: &LogConfig) -> Result<TelemetryGuard> {
    if let Some(endpoint) = &config.otel_endpoint {
        init_otlp(&config.log_level, endpoint)
    } else if let Some(dir) = &config.log_dir {
        init_files(&config.log_level, dir)
    } else {
        tfmt()
            .with_env_filter(EnvFilter::new(&config.log_level))
            .with_writer(std::io::stderr)
            .with_target(false)
            .try_init()
            .map_err(|e| anyhow::anyhow!(e))?;
        Ok(TelemetryGuard::Stderr)
    }
}

static RESOURCE: OnceLock<Resource> = OnceLock::new();
fn get_resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name("convoflow").build())
        .clone()
}

fn init_otlp(log_level: &str, endpoint: &str) -> Result<TelemetryGuard> {
    let log_exporter = LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;
    let logger_provider = SdkLoggerProvider::builder()
        .with_batch_exporter(log_exporter)
        .with_resource(get_resource())
        .build();

    let metric_exporter = MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;
    let meter_provider = SdkMeterProvider::builder()
        .with_periodic_exporter(metric_exporter)
        .with_resource(get_resource())
        .build();

    // exporter internals must not feed back into the exporter
    let otel_filter = EnvFilter::new(log_level)
        .add_directive("hyper=off".parse()?)
        .add_directive("tonic=off".parse()?)
        .add_directive("h2=off".parse()?)
        .add_directive("tower=off".parse()?);
    let otel_layer = OpenTelemetryTracingBridge::new(&logger_provider).with_filter(otel_filter);
    let fmt_layer = tfmt::layer()
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .with_filter(EnvFilter::new(log_level));

    Registry::default().with(otel_layer).with(fmt_layer).try_init()?;
    global::set_meter_provider(meter_provider.clone());
    info!(%endpoint, "OpenTelemetry export enabled");

    Ok(TelemetryGuard::Otlp {
        logger_provider,
        meter_provider,
    })
}

fn init_files(log_level: &str, dir: &Path) -> Result<TelemetryGuard> {
    std::fs::create_dir_all(dir)?;
    let text_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("convoflow")
        .filename_suffix("log")
        .build(dir)?;
    let cycle_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("cycles")
        .filename_suffix("jsonl")
        .build(dir)?;

    let text_layer = tfmt::layer()
        .with_writer(text_appender)
        .with_ansi(false)
        .with_filter(EnvFilter::new(log_level));
    let cycle_layer = tfmt::layer()
        .json()
        .with_writer(cycle_appender)
        .with_target(true)
        .with_filter(EnvFilter::new(format!("{CYCLE_TARGET}=info")));

    Registry::default().with(text_layer).with(cycle_layer).try_init()?;
    Ok(TelemetryGuard::Files)
}

/// Per-cycle counters and latency, taken from the global meter so they are
/// no-ops until an OTLP meter provider is installed.
#[derive(Clone)]
pub struct CycleMetrics {
    started: Counter<u64>,
    completed: Counter<u64>,
    failed: Counter<u64>,
    latency_ms: Histogram<f64>,
}

impl fmt::Debug for CycleMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CycleMetrics")
    }
}

impl Default for CycleMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CycleMetrics {
    pub fn new() -> Self {
        let meter = global::meter("convoflow");
        Self {
            started: meter
                .u64_counter("cycles_started")
                .with_description("Inbound messages accepted for processing")
                .build(),
            completed: meter
                .u64_counter("cycles_completed")
                .with_description("Cycles finished, by outcome")
                .build(),
            failed: meter.u64_counter("cycles_failed").build(),
            latency_ms: meter
                .f64_histogram("cycle_latency_ms")
                .with_description("Time to process one inbound message")
                .with_unit("ms")
                .build(),
        }
    }

    pub fn started(&self) {
        self.started.add(1, &[]);
    }

    /// Count one finished cycle and emit its JSON cycle event.
    pub fn finished(&self, tenant: &str, outcome: &'static str, elapsed: Duration) {
        let latency_ms = elapsed.as_secs_f64() * 1_000.0;
        self.latency_ms.record(latency_ms, &[KeyValue::new("outcome", outcome)]);
        self.completed.add(1, &[KeyValue::new("outcome", outcome)]);
        tracing::event!(
            target: CYCLE_TARGET,
            tracing::Level::INFO,
            tenant,
            outcome,
            latency_ms,
            status = "ok",
        );
    }

    pub fn failed(&self, tenant: &str, err: &dyn fmt::Display, elapsed: Duration) {
        let latency_ms = elapsed.as_secs_f64() * 1_000.0;
        self.latency_ms.record(latency_ms, &[KeyValue::new("outcome", "failed")]);
        self.failed.add(1, &[]);
        error!(%tenant, error = %err, "cycle failed after {latency_ms:.1} ms");
        tracing::event!(
            target: CYCLE_TARGET,
            tracing::Level::INFO,
            tenant,
            outcome = "failed",
            latency_ms,
            status = "error",
        );
    }
}
