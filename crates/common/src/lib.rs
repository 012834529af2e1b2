pub mod config;
pub mod logging;
pub mod retry;
pub mod telemetry;
pub mod wait;

pub use config::Environment;
pub use logging::setup_logging;
pub use retry::{RetryPolicy, retry_with_backoff};
pub use telemetry::TelemetryGuard;
pub use wait::wait_for_resource;
