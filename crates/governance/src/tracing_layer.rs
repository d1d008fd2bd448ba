//! Log and trace subscriber setup.

use agent_sandbox_core::config::TelemetryConfig;
use agent_sandbox_core::{Error, Result};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

/// Install the global subscriber: env filter, stdout logs (text or JSON),
/// and an OpenTelemetry exporter when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
///
/// `RUST_LOG` overrides the configured filter.
pub fn configure_tracing(config: &TelemetryConfig) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_filter.clone()),
    );

    let fmt_layer = if config.json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        let tracer = otlp_tracer(&endpoint, &config.service_name)?;
        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        registry
            .with(otel_layer)
            .try_init()
            .map_err(|e| Error::internal(format!("Failed to install tracing subscriber: {}", e)))?;
        tracing::info!(endpoint = %endpoint, "OpenTelemetry tracing enabled");
    } else {
        registry
            .try_init()
            .map_err(|e| Error::internal(format!("Failed to install tracing subscriber: {}", e)))?;
    }

    Ok(())
}

/// Build a batching OTLP exporter and register its provider globally.
///
/// The provider must outlive the returned tracer, so the global slot keeps it.
fn otlp_tracer(endpoint: &str, service_name: &str) -> Result<sdktrace::Tracer> {
    let provider = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint.to_string()),
        )
        .with_trace_config(
            sdktrace::config().with_resource(Resource::new(vec![KeyValue::new(
                "service.name",
                service_name.to_string(),
            )])),
        )
        .install_batch(runtime::Tokio)
        .map_err(|e| Error::internal(format!("Failed to install OTLP pipeline: {}", e)))?;

    let tracer = provider.tracer(service_name.to_string());
    opentelemetry::global::set_tracer_provider(provider);
    Ok(tracer)
}
