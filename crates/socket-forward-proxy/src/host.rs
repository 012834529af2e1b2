//! Host role: local listeners whose clients are forwarded to the guest.

use crate::config::{PortPair, ProxyConfig};
use crate::forward::launch_workers;
use crate::maintainer::launch_connection_maintainer;
use anyhow::{Context, bail};
use std::net::TcpListener;
use std::sync::{Arc, mpsc};
use std::thread;
use vsoc::SocketForwardRegion;

/// Bind every host port on loopback. Any failure aborts startup.
pub fn bind_listeners(ports: &[PortPair]) -> anyhow::Result<Vec<(PortPair, TcpListener)>> {
    ports
        .iter()
        .map(|pair| {
            let listener = TcpListener::bind(("127.0.0.1", pair.host_port))
                .with_context(|| format!("Could not start server on port {}", pair.host_port))?;
            Ok((*pair, listener))
        })
        .collect()
}

/// Accept clients on `listener` and forward each one to `pair.guest_port`.
/// Returns `Ok` once this side is shut down, and an error if a connection
/// can't be opened otherwise.
pub fn serve_port(region: Arc<SocketForwardRegion>, pair: PortPair, listener: TcpListener) -> anyhow::Result<()> {
    tracing::info!(
        host_port = pair.host_port,
        guest_port = pair.guest_port,
        "Starting server"
    );
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e, host_port = pair.host_port, "Error accepting client socket");
                continue;
            }
        };
        tracing::info!(peer = ?stream.peer_addr().ok(), host_port = pair.host_port, "Client socket accepted");

        let Some(connection) = region.open_connection(u32::from(pair.guest_port)) else {
            if region.is_torn_down() {
                tracing::info!(host_port = pair.host_port, "Shut down, stopping server");
                return Ok(());
            }
            bail!("Could not open a connection to guest port {}", pair.guest_port);
        };
        if let Err(e) = launch_workers(connection, stream, pair.guest_port) {
            tracing::error!(error = %e, guest_port = pair.guest_port, "Could not start forwarding workers");
        }
    }
    Ok(())
}

/// Serve every configured port pair until this side is shut down. The first
/// server to fail ends the role with its error.
pub fn run_host(region: Arc<SocketForwardRegion>, config: &ProxyConfig) -> anyhow::Result<()> {
    if config.ports.is_empty() {
        bail!("No ports to forward");
    }
    let listeners = bind_listeners(&config.ports)?;

    let (done_tx, done_rx) = mpsc::channel();
    for (pair, listener) in listeners {
        if config.maintain_adb_connections {
            launch_connection_maintainer(pair.host_port, config.adb_daemon_port)
                .context("Failed to start adb connection maintainer")?;
        }
        let region = Arc::clone(&region);
        let done = done_tx.clone();
        thread::Builder::new()
            .name(format!("server-{}", pair.host_port))
            .spawn(move || {
                let _ = done.send(serve_port(region, pair, listener));
            })
            .context("Failed to start server thread")?;
    }
    drop(done_tx);

    // Ends when every server thread has exited, including by panicking.
    for result in done_rx {
        result?;
    }
    if !region.is_torn_down() {
        bail!("Servers stopped without a shutdown request");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_listeners_fails_when_port_taken() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let pair = PortPair {
            guest_port: 5000,
            host_port: port,
        };

        let err = bind_listeners(&[pair]).unwrap_err();
        assert!(err.to_string().contains(&port.to_string()), "{}", err);
    }

    #[test]
    fn test_bind_listeners_keeps_pair_order() {
        let pairs = [
            PortPair {
                guest_port: 5000,
                host_port: 0,
            },
            PortPair {
                guest_port: 5555,
                host_port: 0,
            },
        ];
        let listeners = bind_listeners(&pairs).unwrap();
        let guest_ports: Vec<u16> = listeners.iter().map(|(pair, _)| pair.guest_port).collect();
        assert_eq!(guest_ports, vec![5000, 5555]);
    }
}
