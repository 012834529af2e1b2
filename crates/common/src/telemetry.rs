use crate::Environment;
use crate::logging::install_subscriber;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource,
    metrics::{PeriodicReader, SdkMeterProvider},
    propagation::TraceContextPropagator,
    trace::{Sampler, SdkTracerProvider},
};
use std::time::Duration;

const METRICS_EXPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Initializes tracing and metrics providers on creation and shuts them down
/// gracefully when dropped.
///
/// The OTLP exporters need a Tokio runtime; create the guard inside one and
/// keep that runtime alive as long as the guard.
///
/// # Example
/// ```ignore
/// let runtime = tokio::runtime::Runtime::new()?;
/// let _telemetry = runtime.block_on(async {
///     TelemetryGuard::init("socket-forward-proxy", "http://localhost:4317", Environment::Production)
/// })?;
/// ```
pub struct TelemetryGuard {
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
}

impl TelemetryGuard {
    /// Initialize OpenTelemetry with OTLP export and install the tracing
    /// subscriber, bridging `tracing` spans to OpenTelemetry.
    ///
    /// # Arguments
    /// * `service_name` - Name of this service (appears in traces/metrics)
    /// * `endpoint` - OTLP collector endpoint (e.g., "http://localhost:4317")
    /// * `environment` - Production uses JSON logs, Development uses pretty logs
    pub fn init(
        service_name: &str,
        endpoint: &str,
        environment: Environment,
    ) -> anyhow::Result<Self> {
        global::set_text_map_propagator(TraceContextPropagator::new());

        let resource = service_resource(service_name, &environment);
        let tracer_provider = build_tracer_provider(resource.clone(), endpoint)?;
        global::set_tracer_provider(tracer_provider.clone());

        let meter_provider = build_meter_provider(resource, endpoint)?;
        global::set_meter_provider(meter_provider.clone());

        let otel_layer =
            tracing_opentelemetry::layer().with_tracer(global::tracer(service_name.to_string()));
        install_subscriber(otel_layer, environment);

        tracing::info!(service = service_name, endpoint, "Telemetry initialized");
        Ok(Self {
            tracer_provider,
            meter_provider,
        })
    }
}

fn service_resource(service_name: &str, environment: &Environment) -> Resource {
    Resource::builder()
        .with_attributes([
            KeyValue::new(
                opentelemetry_semantic_conventions::attribute::SERVICE_NAME,
                service_name.to_string(),
            ),
            KeyValue::new(
                opentelemetry_semantic_conventions::attribute::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            ),
            KeyValue::new("deployment.environment", environment.as_str()),
        ])
        .build()
}

fn build_tracer_provider(resource: Resource, endpoint: &str) -> anyhow::Result<SdkTracerProvider> {
    let span_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    Ok(SdkTracerProvider::builder()
        .with_resource(resource)
        .with_sampler(Sampler::ParentBased(Box::new(Sampler::AlwaysOn)))
        .with_batch_exporter(span_exporter)
        .build())
}

fn build_meter_provider(resource: Resource, endpoint: &str) -> anyhow::Result<SdkMeterProvider> {
    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let reader = PeriodicReader::builder(metric_exporter)
        .with_interval(METRICS_EXPORT_INTERVAL)
        .build();

    Ok(SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build())
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Err(e) = self.tracer_provider.shutdown() {
            eprintln!("Failed to shutdown tracer provider: {:?}", e);
        }
        if let Err(e) = self.meter_provider.shutdown() {
            eprintln!("Failed to shutdown meter provider: {:?}", e);
        }
    }
}
