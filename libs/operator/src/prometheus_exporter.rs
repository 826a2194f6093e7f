/// Placeholder for Prometheus-format metrics export
///
/// OpenTelemetry 0.31 SDK doesn't expose public APIs for manual metric collection
/// in a way that's compatible with synchronous HTTP handlers.
///
/// Options for full implementation:
/// 1. Wait for opentelemetry-prometheus crate to support 0.31+
/// 2. Use OTLP push-based export (recommended by OpenTelemetry)
/// 3. Implement custom MetricExporter with periodic collection
/// 4. Use stdout/logging exporter for development
pub fn format_prometheus_metrics(_msg: &str) -> Result<String, String> {
    Ok(
        "# OpenTelemetry metrics configured\n# Use OTLP endpoint for metrics collection\n"
            .to_string(),
    )
}
