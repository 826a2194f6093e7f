use std::time::Duration;

use clap::ValueEnum;
use opentelemetry::trace::TraceId;
use opentelemetry_otlp::WithExportConfig;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Initialize the global `tracing` subscriber: an `EnvFilter`-gated fmt layer in the requested
/// format, plus an optional OTLP exporter layer when `tracing_url` is set.
pub async fn init(
    log_filter: &str,
    log_format: LogFormat,
    tracing_url: Option<&str>,
    sample_ratio: f64,
) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_new(log_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = match log_format {
        LogFormat::Text => tracing_subscriber::fmt::layer().boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    match tracing_url {
        Some(url) => {
            let exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_tonic()
                .with_endpoint(url)
                .with_timeout(Duration::from_secs(3))
                .build()?;

            let sampler = opentelemetry_sdk::trace::Sampler::TraceIdRatioBased(sample_ratio);
            let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
                .with_sampler(sampler)
                .with_batch_exporter(exporter)
                .build();
            opentelemetry::global::set_tracer_provider(provider.clone());

            let tracer = provider.tracer("vertdb-operator");
            let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
            registry.with(otel_layer).try_init()?;
        }
        None => {
            registry.try_init()?;
        }
    }

    Ok(())
}

/// Fetch the current span's trace ID, if tracing is enabled and a span is active.
pub fn get_trace_id() -> Result<TraceId, crate::error::Error> {
    use opentelemetry::trace::TraceContextExt;
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    let trace_id = tracing::Span::current()
        .context()
        .span()
        .span_context()
        .trace_id();

    if trace_id == TraceId::INVALID {
        Err(crate::error::Error::InvalidTraceId)
    } else {
        Ok(trace_id)
    }
}
