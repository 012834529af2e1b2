use anyhow::{Context, bail};
use common::{RetryPolicy, TelemetryGuard, retry_with_backoff, setup_logging};
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    flag,
};
use socket_forward_proxy::{
    ProxyConfig, Role,
    guest::{self, GuestOptions},
    host,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use vsoc::{SharedSegment, SocketForwardRegion, regions::default_layout};

const SERVICE_NAME: &str = "socket-forward-proxy";
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn main() -> anyhow::Result<()> {
    let config = ProxyConfig::from_env()?;

    // TelemetryGuard requires a Tokio runtime for async OTLP exporters.
    // We must keep the runtime alive for the batch exporter to work.
    let (_telemetry, _runtime) = if let Some(endpoint) = config.otel_endpoint.as_ref() {
        let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
        let guard = rt.block_on(async {
            TelemetryGuard::init(SERVICE_NAME, endpoint, config.environment.clone())
        })?;
        (Some(guard), Some(rt))
    } else {
        setup_logging(config.environment.clone());
        (None, None)
    };

    tracing::info!("Socket forward proxy starting with config: {:?}", config);

    if config.role == Role::Guest && !nix::unistd::Uid::current().is_root() {
        bail!("The guest proxy must run as root");
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    flag::register(SIGTERM, Arc::clone(&shutdown))?;
    flag::register(SIGINT, Arc::clone(&shutdown))?;

    let segment = open_segment(&config)?;
    let region = SocketForwardRegion::open(&segment, config.role.side())
        .context("Shared memory has no usable socket forward region")?;
    region.clean_up_previous_connections();
    let _worker = region
        .start_worker()
        .context("Failed to start signal worker")?;

    tracing::info!(role = config.role.as_str(), generation = region.generation(), "Channel ready");

    let role_region = Arc::clone(&region);
    let role_config = config.clone();
    let role = thread::Builder::new()
        .name(config.role.as_str().to_string())
        .spawn(move || match role_config.role {
            Role::Host => host::run_host(role_region, &role_config),
            Role::Guest => guest::run_guest(role_region, &GuestOptions::from(&role_config)),
        })
        .context("Failed to start main loop")?;

    while !shutdown.load(Ordering::Relaxed) && !role.is_finished() {
        thread::sleep(SHUTDOWN_POLL_INTERVAL);
    }

    if role.is_finished() {
        return match role.join() {
            Ok(result) => result,
            Err(_) => bail!("Main loop panicked"),
        };
    }

    tracing::info!("Shutdown signal received, tearing down channel");
    region.shutdown();
    Ok(())
}

fn open_segment(config: &ProxyConfig) -> anyhow::Result<Arc<SharedSegment>> {
    match config.role {
        Role::Host => {
            let layout = default_layout().context("Invalid region layout")?;
            SharedSegment::open_or_create(&config.shm_path, &layout)
                .with_context(|| format!("Failed to set up shared memory at {}", config.shm_path))
        }
        Role::Guest => retry_with_backoff(
            || SharedSegment::open(&config.shm_path),
            &RetryPolicy::default(),
            "Open shared memory",
        )
        .with_context(|| format!("Failed to open shared memory at {}", config.shm_path)),
    }
}
