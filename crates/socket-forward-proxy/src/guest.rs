//! Guest role: accept forwarded connections and dial the local service.

use crate::config::ProxyConfig;
use crate::forward::launch_workers;
use anyhow::bail;
use common::wait_for_resource;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;
use vsoc::SocketForwardRegion;

#[derive(Debug, Clone)]
pub struct GuestOptions {
    /// Address local services listen on
    pub service_host: String,
    pub dial_retry_interval: Duration,
}

impl Default for GuestOptions {
    fn default() -> Self {
        Self {
            service_host: "127.0.0.1".to_string(),
            dial_retry_interval: Duration::from_secs(1),
        }
    }
}

impl From<&ProxyConfig> for GuestOptions {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            service_host: config.service_host.clone(),
            dial_retry_interval: config.dial_retry_interval,
        }
    }
}

/// Dial `port`, retrying until the service accepts.
pub fn open_socket_connection(options: &GuestOptions, port: u16) -> TcpStream {
    wait_for_resource(
        || TcpStream::connect((options.service_host.as_str(), port)),
        options.dial_retry_interval,
        &format!("service on port {}", port),
    )
}

/// Forward every accepted connection to its local port until this side is
/// shut down. Returns an error if accepting stops for any other reason.
pub fn run_guest(region: Arc<SocketForwardRegion>, options: &GuestOptions) -> anyhow::Result<()> {
    tracing::info!("Starting guest main loop");
    while let Some(connection) = region.accept_connection() {
        let requested = connection.0.port();
        let Ok(port) = u16::try_from(requested) else {
            tracing::error!(port = requested, "Connection requested an invalid port");
            continue;
        };

        let stream = open_socket_connection(options, port);
        tracing::info!(port, "Socket opened");
        if let Err(e) = launch_workers(connection, stream, port) {
            tracing::error!(error = %e, port, "Could not start forwarding workers");
        }
    }
    if !region.is_torn_down() {
        bail!("Stopped accepting connections without a shutdown request");
    }
    Ok(())
}
