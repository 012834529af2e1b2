use common::Environment;
use socket_forward_proxy::guest::{self, GuestOptions};
use socket_forward_proxy::host;
use socket_forward_proxy::{PortPair, ProxyConfig, Role};
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use vsoc::regions::default_layout;
use vsoc::{SharedSegment, Side, SignalWorker, SocketForwardRegion};

struct Proxy {
    _dir: TempDir,
    host: Arc<SocketForwardRegion>,
    guest: Arc<SocketForwardRegion>,
    _workers: [SignalWorker; 2],
    /// Address clients connect to on the host side
    addr: SocketAddr,
}

impl Proxy {
    fn segment_path(&self) -> PathBuf {
        self._dir.path().join("vsoc_shm")
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.host.shutdown();
        self.guest.shutdown();
    }
}

/// Run both roles in-process over one segment file, forwarding a fresh
/// loopback port to `guest_port`.
fn start_proxy(guest_port: u16) -> Proxy {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vsoc_shm");
    let host_segment = SharedSegment::create(&path, &default_layout().unwrap()).unwrap();
    let guest_segment = SharedSegment::open(&path).unwrap();

    let host = SocketForwardRegion::open(&host_segment, Side::Host).unwrap();
    let guest = SocketForwardRegion::open(&guest_segment, Side::Guest).unwrap();
    host.clean_up_previous_connections();
    guest.clean_up_previous_connections();
    let workers = [host.start_worker().unwrap(), guest.start_worker().unwrap()];

    spawn_guest_loop(Arc::clone(&guest));

    let pair = PortPair {
        guest_port,
        host_port: 0,
    };
    let (pair, listener) = host::bind_listeners(&[pair]).unwrap().remove(0);
    let addr = listener.local_addr().unwrap();
    let host_loop = Arc::clone(&host);
    thread::spawn(move || host::serve_port(host_loop, pair, listener));

    Proxy {
        _dir: dir,
        host,
        guest,
        _workers: workers,
        addr,
    }
}

fn spawn_guest_loop(guest: Arc<SocketForwardRegion>) -> thread::JoinHandle<anyhow::Result<()>> {
    let options = GuestOptions {
        service_host: "127.0.0.1".to_string(),
        dial_retry_interval: Duration::from_millis(20),
    };
    thread::spawn(move || guest::run_guest(guest, &options))
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream
}

fn echo_once(addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut client = connect(addr);
    client.write_all(payload).unwrap();
    client.shutdown(Shutdown::Write).unwrap();
    let mut reply = Vec::new();
    client.read_to_end(&mut reply).unwrap();
    reply
}

/// Echo every connection back until the client half-closes.
fn spawn_echo_service() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            thread::spawn(move || {
                let mut reader = stream.try_clone().unwrap();
                let _ = std::io::copy(&mut reader, &mut stream);
            });
        }
    });
    port
}

#[test]
fn test_ping_pong_with_half_close() {
    let service = TcpListener::bind("127.0.0.1:0").unwrap();
    let proxy = start_proxy(service.local_addr().unwrap().port());

    let server = thread::spawn(move || {
        let (mut stream, _) = service.accept().unwrap();
        let mut request = [0u8; 4];
        stream.read_exact(&mut request).unwrap();
        stream.write_all(b"PONG").unwrap();

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).unwrap();
        (request, rest)
    });

    let mut client = connect(proxy.addr);
    client.write_all(b"PING").unwrap();
    client.shutdown(Shutdown::Write).unwrap();

    let mut reply = Vec::new();
    client.read_to_end(&mut reply).unwrap();
    assert_eq!(reply, b"PONG");

    let (request, rest) = server.join().unwrap();
    assert_eq!(&request, b"PING");
    assert!(rest.is_empty(), "service should see end of stream after the request");
}

#[test]
fn test_concurrent_clients_stay_isolated() {
    let proxy = start_proxy(spawn_echo_service());

    let clients: Vec<_> = (0..3u8)
        .map(|id| {
            let addr = proxy.addr;
            thread::spawn(move || {
                let payload: Vec<u8> = (0..200_000usize).map(|i| (i as u8) ^ id.wrapping_mul(97)).collect();
                let mut client = connect(addr);
                let mut writer = client.try_clone().unwrap();
                let to_send = payload.clone();
                let sender = thread::spawn(move || {
                    writer.write_all(&to_send).unwrap();
                    writer.shutdown(Shutdown::Write).unwrap();
                });

                let mut echoed = Vec::new();
                client.read_to_end(&mut echoed).unwrap();
                sender.join().unwrap();
                echoed == payload
            })
        })
        .collect();

    for (id, client) in clients.into_iter().enumerate() {
        assert!(client.join().unwrap(), "client {} received another stream's bytes", id);
    }
}

#[test]
fn test_guest_waits_for_late_service() {
    let port = free_port();
    let proxy = start_proxy(port);

    let mut client = connect(proxy.addr);
    client.write_all(b"early").unwrap();
    client.shutdown(Shutdown::Write).unwrap();

    thread::sleep(Duration::from_millis(100));
    let service = TcpListener::bind(("127.0.0.1", port)).unwrap();
    let (mut stream, _) = service.accept().unwrap();
    let mut received = Vec::new();
    stream.read_to_end(&mut received).unwrap();
    assert_eq!(received, b"early");
}

#[test]
fn test_host_keeps_serving_across_guest_restart() {
    let proxy = start_proxy(spawn_echo_service());
    assert_eq!(echo_once(proxy.addr, b"before restart"), b"before restart");

    proxy.guest.shutdown();

    let segment = SharedSegment::open(proxy.segment_path()).unwrap();
    let restarted = SocketForwardRegion::open(&segment, Side::Guest).unwrap();
    restarted.clean_up_previous_connections();
    let _worker = restarted.start_worker().unwrap();
    let guest_loop = spawn_guest_loop(Arc::clone(&restarted));

    assert_eq!(echo_once(proxy.addr, b"after restart"), b"after restart");

    restarted.shutdown();
    assert!(guest_loop.join().unwrap().is_ok(), "requested shutdown is a clean exit");
}

#[test]
fn test_host_role_fails_when_connections_cannot_be_opened() {
    let dir = tempfile::tempdir().unwrap();
    let segment = SharedSegment::create(dir.path().join("vsoc_shm"), &default_layout().unwrap()).unwrap();
    // a region opened for the wrong side never opens connections
    let region = SocketForwardRegion::open(&segment, Side::Guest).unwrap();

    let host_port = free_port();
    let config = ProxyConfig {
        environment: Environment::Development,
        role: Role::Host,
        shm_path: dir.path().join("vsoc_shm").display().to_string(),
        ports: vec![PortPair {
            guest_port: 5000,
            host_port,
        }],
        maintain_adb_connections: false,
        adb_daemon_port: 5037,
        service_host: "127.0.0.1".to_string(),
        dial_retry_interval: Duration::from_millis(20),
        otel_endpoint: None,
    };
    let host_loop = Arc::clone(&region);
    let role = thread::spawn(move || host::run_host(host_loop, &config));

    let deadline = Instant::now() + Duration::from_secs(5);
    let _client = loop {
        match TcpStream::connect(("127.0.0.1", host_port)) {
            Ok(stream) => break stream,
            Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(20)),
            Err(e) => panic!("host never listened on {}: {}", host_port, e),
        }
    };

    let result = role.join().unwrap();
    assert!(result.is_err(), "servers stopping without a shutdown request is an error");
    assert!(!region.is_torn_down());
}
