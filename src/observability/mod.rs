//! Observability: structured logging setup and the schema-stamped,
//! redacted JSONL sinks under `<data_dir>/observability/`.

pub mod redact;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Which of the three observability streams a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    RuntimeEvents,
    ToolTraces,
    UsageEvents,
}

impl Stream {
    fn filename(self) -> &'static str {
        match self {
            Stream::RuntimeEvents => "runtime-events.jsonl",
            Stream::ToolTraces => "tool-traces.jsonl",
            Stream::UsageEvents => "usage-events.jsonl",
        }
    }

    fn name(self) -> &'static str {
        match self {
            Stream::RuntimeEvents => "runtime",
            Stream::ToolTraces => "tool",
            Stream::UsageEvents => "usage",
        }
    }
}

/// The uniform envelope every observability record is stamped with.
/// Resolves the §9 Open Question: enforced here once, not per call site.
#[derive(Debug, Serialize)]
struct StampedRecord {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,
    stream: &'static str,
    timestamp: String,
    payload: Value,
}

/// Appends schema-stamped, redacted JSON lines to the three observability
/// files. Writes are serialized per-stream with a `tokio::sync::Mutex` and
/// use plain append (not atomic temp+rename) since these are monotonically
/// growing logs, not mutable records — a torn trailing line is tolerated by
/// readers, matching the subagent job store's own read tolerance.
#[derive(Clone)]
pub struct ObservabilitySink {
    dir: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl ObservabilitySink {
    pub async fn new(dir: PathBuf) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub async fn emit(&self, stream: Stream, payload: Value) -> anyhow::Result<()> {
        let redacted = redact::redact_value(&payload);
        let record = StampedRecord {
            schema_version: 1,
            stream: stream.name(),
            timestamp: Utc::now().to_rfc3339(),
            payload: redacted,
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let path = self.dir.join(stream.filename());
        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Initialize the global `tracing` subscriber: an `EnvFilter` built from
/// `directive`, a human-readable console layer, and a non-blocking rolling
/// file writer under `<data_dir>/drost.log`.
///
/// Returns the appender guard — it must be held for the process lifetime or
/// buffered log lines are dropped on exit.
pub fn init_tracing(
    directive: &str,
    data_dir: &Path,
) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"));

    let file_appender = tracing_appender::rolling::daily(data_dir, "drost.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let console_layer = fmt::layer().with_target(false);
    let file_layer = fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_ansi(false);

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer);

    #[cfg(feature = "tracing-otlp")]
    let registry = {
        use tracing_opentelemetry::OpenTelemetryLayer;
        match crate::observability::otlp::build_tracer() {
            Some(tracer) => registry.with(OpenTelemetryLayer::new(tracer)),
            None => registry,
        }
    };

    registry.try_init().ok();
    Ok(guard)
}

#[cfg(feature = "tracing-otlp")]
mod otlp {
    //! Optional OTLP export, active only when `OTEL_EXPORTER_OTLP_ENDPOINT`
    //! is set. Mirrors the teacher's own optional telemetry feature gate.

    pub fn build_tracer() -> Option<opentelemetry_sdk::trace::Tracer> {
        let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .ok()?;
        let provider = opentelemetry_sdk::trace::TracerProvider::builder()
            .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
            .build();
        use opentelemetry::trace::TracerProvider as _;
        Some(provider.tracer("drost"))
    }
}
