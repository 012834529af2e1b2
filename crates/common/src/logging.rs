use crate::config::Environment;
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber: pretty output for development, JSON
/// for production.
///
/// Uses RUST_LOG for filtering (defaults to "info" if not set). Spans are
/// also handed to OpenTelemetry, which drops them unless a global tracer
/// provider was installed (see `TelemetryGuard`).
pub fn setup_logging(environment: Environment) {
    install_subscriber(tracing_opentelemetry::layer(), environment);
}

pub(crate) fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install `otel_layer` plus the formatting layer matching `environment`.
pub(crate) fn install_subscriber<L>(otel_layer: L, environment: Environment)
where
    L: Layer<Registry> + Send + Sync + 'static,
{
    let registry = tracing_subscriber::registry()
        .with(otel_layer)
        .with(env_filter());

    let result = match environment {
        Environment::Production => registry
            .with(tracing_subscriber::fmt::layer().json().with_level(true))
            .try_init(),
        Environment::Development => registry
            .with(tracing_subscriber::fmt::layer().pretty().with_ansi(true))
            .try_init(),
    };

    if let Err(e) = result {
        eprintln!("Tracing subscriber already installed: {}", e);
    }
}
