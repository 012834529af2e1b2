//! Byte pumps between a TCP stream and one half of a shared memory
//! connection.

use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Meter},
};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::thread;
use vsoc::Packet;

const METER_NAME: &str = "socket-forward-proxy";

/// Anything that accepts forwarded packets. Returns false once the peer is
/// gone and nothing more will be delivered.
pub trait PacketSink {
    fn send(&mut self, packet: &Packet) -> bool;
}

/// Anything that produces forwarded packets. Leaves an end-of-stream packet
/// in `packet` when the stream is over.
pub trait PacketSource {
    fn recv(&mut self, packet: &mut Packet);
}

impl PacketSink for vsoc::Sender {
    fn send(&mut self, packet: &Packet) -> bool {
        vsoc::Sender::send(self, packet)
    }
}

impl PacketSource for vsoc::Receiver {
    fn recv(&mut self, packet: &mut Packet) {
        self.recv_into(packet)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Direction {
    SocketToChannel,
    ChannelToSocket,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::SocketToChannel => "socket_to_channel",
            Direction::ChannelToSocket => "channel_to_socket",
        }
    }
}

#[derive(Clone)]
pub struct ForwardMetrics {
    connections: Counter<u64>,
    bytes: Counter<u64>,
}

impl ForwardMetrics {
    pub fn new() -> Self {
        Self::from_meter(&global::meter(METER_NAME))
    }

    fn from_meter(meter: &Meter) -> Self {
        Self {
            connections: meter
                .u64_counter("socket_forward_connections_total")
                .with_description("Connections handed to forwarding workers")
                .build(),
            bytes: meter
                .u64_counter("socket_forward_bytes_total")
                .with_description("Payload bytes forwarded")
                .build(),
        }
    }

    pub fn record_connection(&self) {
        self.connections.add(1, &[]);
    }

    pub fn record_bytes(&self, direction: Direction, bytes: usize) {
        self.bytes.add(
            bytes as u64,
            &[KeyValue::new("direction", direction.as_str())],
        );
    }
}

impl Default for ForwardMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Write half of a client socket. Dropping it half-closes the socket.
pub struct SocketSender {
    stream: TcpStream,
}

impl SocketSender {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Write all of `payload`, retrying partial writes.
    pub fn send_all(&mut self, payload: &[u8]) -> io::Result<()> {
        self.stream.write_all(payload)
    }
}

impl Drop for SocketSender {
    fn drop(&mut self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Write) {
            tracing::debug!(error = %e, "Socket write shutdown failed");
        }
    }
}

/// Read half of a client socket.
pub struct SocketReceiver {
    stream: TcpStream,
}

impl SocketReceiver {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Fill `packet` with whatever the socket has. An empty packet means the
    /// client closed its side or the read failed.
    pub fn recv(&mut self, packet: &mut Packet) {
        let read = loop {
            match self.stream.read(packet.payload_buffer_mut()) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "Socket read failed");
                    break 0;
                }
            }
        };
        packet.set_payload_length(read);
    }
}

/// Copy socket bytes into `sink` until the client stops sending or the peer
/// stops receiving. Dropping `sink` afterwards ends the stream.
pub fn socket_to_channel<S: PacketSink>(mut socket: SocketReceiver, mut sink: S, metrics: &ForwardMetrics) {
    let mut packet = Packet::make_data();
    loop {
        socket.recv(&mut packet);
        if packet.is_empty() {
            break;
        }
        if !sink.send(&packet) {
            tracing::debug!("Peer stopped receiving");
            break;
        }
        metrics.record_bytes(Direction::SocketToChannel, packet.payload_length());
    }
    tracing::info!("Socket to channel exiting");
}

/// Copy packets from `source` to the socket until end of stream or a write
/// error. Dropping the socket afterwards half-closes it.
pub fn channel_to_socket<R: PacketSource>(mut socket: SocketSender, mut source: R, metrics: &ForwardMetrics) {
    let mut packet = Packet::make_data();
    loop {
        source.recv(&mut packet);
        if packet.is_end_of_stream() {
            break;
        }
        if let Err(e) = socket.send_all(packet.payload()) {
            tracing::info!(error = %e, "Couldn't write to client");
            break;
        }
        metrics.record_bytes(Direction::ChannelToSocket, packet.payload_length());
    }
    tracing::info!("Channel to socket exiting");
}

/// Start the two detached pump threads for one connection.
pub fn launch_workers<S, R>(connection: (S, R), stream: TcpStream, port: u16) -> io::Result<()>
where
    S: PacketSink + Send + 'static,
    R: PacketSource + Send + 'static,
{
    let (sink, source) = connection;
    let reader = stream.try_clone()?;
    let metrics = ForwardMetrics::new();
    metrics.record_connection();

    let outbound_metrics = metrics.clone();
    thread::Builder::new()
        .name(format!("sock-to-chan-{}", port))
        .spawn(move || {
            let _span = tracing::info_span!("socket_to_channel", port).entered();
            socket_to_channel(SocketReceiver::new(reader), sink, &outbound_metrics);
        })?;

    thread::Builder::new()
        .name(format!("chan-to-sock-{}", port))
        .spawn(move || {
            let _span = tracing::info_span!("channel_to_socket", port).entered();
            channel_to_socket(SocketSender::new(stream), source, &metrics);
        })?;

    Ok(())
}
