//! Keeps the local adb server connected to a forwarded port.
//!
//! The adb server speaks a framed text protocol: every request is four
//! lowercase hex digits giving the length of the body, followed by the body.
//! Replies start with a four byte status, `OKAY` or `FAIL`, and list-style
//! replies then carry another hex length and that many bytes.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_ADB_DAEMON_PORT: u16 = 5037;
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const HOST_PREFIX: &str = "host:";
const OKAY: &[u8; 4] = b"OKAY";

#[derive(Debug, Error)]
pub enum AdbError {
    #[error("adb server I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("adb server replied {0:?}")]
    Rejected(String),

    #[error("invalid length prefix {0:?}")]
    InvalidLength(String),
}

/// Frame a host service request.
pub fn make_message(user_message: &str) -> String {
    format!(
        "{:04x}{}{}",
        HOST_PREFIX.len() + user_message.len(),
        HOST_PREFIX,
        user_message
    )
}

/// How the adb server names a device reachable on a local port.
pub fn device_serial(port: u16) -> String {
    format!("127.0.0.1:{}", port)
}

pub fn make_connect_message(port: u16) -> String {
    make_message(&format!("connect:{}", device_serial(port)))
}

fn read_status(stream: &mut TcpStream) -> Result<(), AdbError> {
    let mut status = [0u8; 4];
    stream.read_exact(&mut status)?;
    if &status == OKAY {
        Ok(())
    } else {
        Err(AdbError::Rejected(String::from_utf8_lossy(&status).into_owned()))
    }
}

fn read_length_prefixed(stream: &mut TcpStream) -> Result<String, AdbError> {
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix)?;
    let prefix = String::from_utf8_lossy(&prefix).into_owned();
    let length = usize::from_str_radix(&prefix, 16).map_err(|_| AdbError::InvalidLength(prefix))?;

    let mut body = vec![0u8; length];
    stream.read_exact(&mut body)?;
    Ok(String::from_utf8_lossy(&body).into_owned())
}

/// Talks to the adb server on behalf of one forwarded port.
#[derive(Debug, Clone)]
pub struct ConnectionMaintainer {
    port: u16,
    daemon_port: u16,
    poll_interval: Duration,
}

impl ConnectionMaintainer {
    pub fn new(port: u16, daemon_port: u16) -> Self {
        Self {
            port,
            daemon_port,
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn request(&self, message: &str) -> Result<TcpStream, AdbError> {
        let mut stream = TcpStream::connect(("127.0.0.1", self.daemon_port))?;
        stream.write_all(message.as_bytes())?;
        read_status(&mut stream)?;
        Ok(stream)
    }

    /// Ask the adb server to connect to the forwarded port once.
    pub fn connect(&self) -> Result<(), AdbError> {
        self.request(&make_connect_message(self.port)).map(|_| ())
    }

    /// Device list as reported by the adb server.
    pub fn devices(&self) -> Result<String, AdbError> {
        let mut stream = self.request(&make_message("devices"))?;
        read_length_prefixed(&mut stream)
    }

    /// Retry `connect` until the adb server accepts it.
    pub fn establish_connection(&self) {
        loop {
            match self.connect() {
                Ok(()) => {
                    tracing::info!(port = self.port, "adb connection established");
                    return;
                }
                Err(e) => tracing::debug!(port = self.port, error = %e, "adb connect failed"),
            }
            thread::sleep(self.poll_interval);
        }
    }

    /// Poll the device list until the forwarded port disappears from it or
    /// the adb server can't be queried.
    pub fn wait_for_disconnection(&self) {
        let serial = device_serial(self.port);
        loop {
            match self.devices() {
                Ok(devices) if devices.contains(&serial) => {}
                Ok(_) => {
                    tracing::info!(port = self.port, "adb device disconnected");
                    return;
                }
                Err(e) => {
                    tracing::info!(port = self.port, error = %e, "adb device list unavailable");
                    return;
                }
            }
            thread::sleep(self.poll_interval);
        }
    }

    pub fn run(&self) -> ! {
        loop {
            self.establish_connection();
            self.wait_for_disconnection();
        }
    }
}

/// Keep the adb server connected to `port` from a detached thread.
pub fn launch_connection_maintainer(port: u16, daemon_port: u16) -> io::Result<JoinHandle<()>> {
    let maintainer = ConnectionMaintainer::new(port, daemon_port);
    thread::Builder::new()
        .name(format!("adb-maintainer-{}", port))
        .spawn(move || {
            maintainer.run();
        })
}
