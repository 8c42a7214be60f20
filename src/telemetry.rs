//! Logging and trace export for echo-proxy.
//!
//! Every event goes through one `tracing` subscriber. Spans are also exported
//! over OTLP when `telemetry.otlp_enabled` is set, under the configured
//! `service_name` (`echo-proxy` unless overridden), so the proxy's spans join
//! the caller's trace through the `traceparent` header read in
//! [`crate::middleware`].

use opentelemetry::trace::TracerProvider;
use tracing_subscriber::{
    EnvFilter,
    fmt::format::FmtSpan,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LoggingFormat, TelemetryConfig};

/// Flushes and shuts down the OTLP exporter when dropped.
pub struct OtelGuard {
    tracer_provider: Option<opentelemetry_sdk::trace::SdkTracerProvider>,
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.as_mut()
            && let Err(err) = provider.shutdown()
        {
            eprintln!("{err:?}");
        }
    }
}

/// Instrumentation scope of the spans this binary emits.
const TRACER_NAME: &str = env!("CARGO_PKG_NAME");

/// Identifies the proxy instance to the collector: service name and the
/// crate version it was built from.
fn resource(service_name: &str) -> opentelemetry_sdk::Resource {
    opentelemetry_sdk::Resource::builder()
        .with_service_name(service_name.to_owned())
        .with_schema_url(
            [
                opentelemetry::KeyValue::new(
                    opentelemetry_semantic_conventions::attribute::SERVICE_VERSION,
                    env!("CARGO_PKG_VERSION"),
                ),
                opentelemetry::KeyValue::new(
                    opentelemetry_semantic_conventions::attribute::SERVICE_NAME,
                    service_name.to_owned(),
                ),
            ],
            opentelemetry_semantic_conventions::SCHEMA_URL,
        )
        .with_attributes(vec![opentelemetry::KeyValue::new(
            "entity.name",
            service_name.to_owned(),
        )])
        .build()
}

fn init_tracer_provider(
    service_name: &str,
) -> anyhow::Result<opentelemetry_sdk::trace::SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .build()?;

    Ok(opentelemetry_sdk::trace::SdkTracerProvider::builder()
        .with_sampler(opentelemetry_sdk::trace::Sampler::ParentBased(Box::new(
            opentelemetry_sdk::trace::Sampler::TraceIdRatioBased(1.0),
        )))
        .with_id_generator(opentelemetry_sdk::trace::RandomIdGenerator::default())
        .with_resource(resource(service_name))
        .with_batch_exporter(exporter)
        .build())
}

fn env_filter(config: &TelemetryConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{},axum={}",
            tracing::Level::from(config.level),
            tracing::Level::from(config.axum_level),
        ))
    })
}

/// Installs the global subscriber. `RUST_LOG` takes precedence over the
/// configured levels.
pub fn init(config: &TelemetryConfig) -> anyhow::Result<OtelGuard> {
    let fmt_layer = match config.format {
        LoggingFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true)
            .with_file(true)
            .boxed(),
        LoggingFormat::Pretty => tracing_subscriber::fmt::layer()
            .pretty()
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .boxed(),
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter(config))
        .with(fmt_layer);

    if !config.otlp_enabled {
        registry.try_init()?;
        return Ok(OtelGuard {
            tracer_provider: None,
        });
    }

    opentelemetry::global::set_text_map_propagator(
        opentelemetry_sdk::propagation::TraceContextPropagator::new(),
    );

    let tracer_provider = init_tracer_provider(&config.service_name)?;
    let tracer = tracer_provider.tracer(TRACER_NAME);

    registry
        .with(tracing_opentelemetry::OpenTelemetryLayer::new(tracer))
        .try_init()?;

    Ok(OtelGuard {
        tracer_provider: Some(tracer_provider),
    })
}
