//! Tracing initialization: structured JSON logging, plus OTLP/gRPC span
//! export when an endpoint is configured.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_sdk::Resource;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use elida_domain::config::ObservabilityConfig;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,elida_gateway=debug"))
}

/// Initialize the global subscriber. With `otlp_endpoint` set, every
/// span — including the per-session-record spans — is also exported to
/// the collector.
pub fn init(observability: &ObservabilityConfig) -> anyhow::Result<()> {
    let Some(endpoint) = &observability.otlp_endpoint else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .json()
            .init();
        return Ok(());
    };

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;
    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(Sampler::TraceIdRatioBased(observability.sample_rate))
        .with_resource(
            Resource::builder()
                .with_service_name(observability.service_name.clone())
                .build(),
        )
        .build();
    let tracer = provider.tracer("elida");
    opentelemetry::global::set_tracer_provider(provider);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().json())
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .init();

    tracing::info!(endpoint = %endpoint, "OTLP trace export enabled");
    Ok(())
}
