//! Engine integration tests over loopback TCP.

use fleetio_engine::{Callbacks, ConnId, Engine, EngineConfig, EngineError, QueueBackend};

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn config() -> EngineConfig {
    EngineConfig::new()
        .bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .workers(4)
        .liveness_interval(Some(Duration::from_millis(200)))
}

/// Poll `cond` until it holds or `timeout` passes.
fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

fn connect(engine: &Engine) -> TcpStream {
    let stream = TcpStream::connect(engine.local_addr().unwrap()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream
}

fn start(backend: QueueBackend, callbacks: Callbacks) -> Option<Engine> {
    let mut engine = Engine::new(config().backend(backend));
    match engine.start(0, callbacks) {
        Ok(()) => Some(engine),
        Err(EngineError::Queue(e)) if backend == QueueBackend::Uring => {
            eprintln!("skipping: io_uring unavailable: {e}");
            None
        }
        Err(e) => panic!("start failed: {e}"),
    }
}

struct Received {
    conn: ConnId,
    peer: SocketAddr,
    data: Vec<u8>,
}

fn ping_pong(backend: QueueBackend) {
    let (tx, rx) = mpsc::channel();
    let callbacks = Callbacks::new().on_receive(move |_, msg| {
        let _ = tx.send(Received { conn: msg.conn, peer: msg.peer, data: msg.data.to_vec() });
    });
    let Some(engine) = start(backend, callbacks) else { return };

    let mut client = connect(&engine);
    assert!(wait_until(Duration::from_secs(5), || engine.connection_count() == 1));
    client.write_all(b"PING").unwrap();

    let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(got.data, b"PING");
    assert_eq!(got.peer, client.local_addr().unwrap());
    assert_eq!(engine.peer_of(got.conn), Some(got.peer));

    assert!(engine.send_to(got.conn, b"PONG"));
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"PONG");

    // Exactly one receive for one write.
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn ping_pong_poll() {
    ping_pong(QueueBackend::Poll);
}

#[test]
fn ping_pong_uring() {
    ping_pong(QueueBackend::Uring);
}

#[test]
fn concurrent_clients_keep_their_bytes_apart() {
    const CLIENTS: usize = 16;
    const BYTES: usize = 4096;

    let seen: Arc<Mutex<HashMap<ConnId, (SocketAddr, Vec<u8>)>>> = Arc::default();
    let sink = seen.clone();
    let callbacks = Callbacks::new().on_receive(move |_, msg| {
        let mut map = sink.lock().unwrap();
        let entry = map.entry(msg.conn).or_insert_with(|| (msg.peer, Vec::new()));
        assert_eq!(entry.0, msg.peer);
        entry.1.extend_from_slice(msg.data);
    });
    let engine = start(QueueBackend::Poll, callbacks).unwrap();
    let addr = engine.local_addr().unwrap();

    let clients: Vec<_> = (0..CLIENTS)
        .map(|i| {
            thread::spawn(move || {
                let mut s = TcpStream::connect(addr).unwrap();
                let payload = vec![b'a' + i as u8; BYTES];
                s.write_all(&payload).unwrap();
                (s.local_addr().unwrap(), payload, s)
            })
        })
        .collect();
    let clients: Vec<_> = clients.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(wait_until(Duration::from_secs(10), || {
        seen.lock().unwrap().values().map(|(_, d)| d.len()).sum::<usize>() == CLIENTS * BYTES
    }));

    let map = seen.lock().unwrap();
    assert_eq!(map.len(), CLIENTS);
    for (peer, payload, _stream) in &clients {
        let (_, data) = map
            .values()
            .find(|(p, _)| p == peer)
            .expect("no receives for client");
        assert_eq!(data, payload);
    }
}

#[test]
fn reset_disconnect_fires_once_and_leaves_broadcast() {
    let gone = Arc::new(Mutex::new(Vec::new()));
    let sink = gone.clone();
    let callbacks = Callbacks::new().on_disconnect(move |_, conn, peer| {
        sink.lock().unwrap().push((conn, peer));
    });
    let engine = start(QueueBackend::Poll, callbacks).unwrap();

    let doomed = connect(&engine);
    let doomed_addr = doomed.local_addr().unwrap();
    let mut survivor = connect(&engine);
    assert!(wait_until(Duration::from_secs(5), || engine.connection_count() == 2));

    // Abortive close: RST instead of FIN, as when the client process dies.
    socket2::SockRef::from(&doomed)
        .set_linger(Some(Duration::ZERO))
        .unwrap();
    drop(doomed);

    assert!(wait_until(Duration::from_secs(5), || engine.connection_count() == 1));
    // Give any duplicate notification a chance to show up.
    thread::sleep(Duration::from_millis(300));
    {
        let gone = gone.lock().unwrap();
        assert_eq!(gone.len(), 1);
        assert_eq!(gone[0].1, doomed_addr);
    }

    assert_eq!(engine.send_to_all(b"ALL"), 1);
    let mut buf = [0u8; 3];
    survivor.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ALL");
    assert_eq!(engine.stats().disconnects, 1);
}

#[test]
fn graceful_close_notifies() {
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let callbacks = Callbacks::new().on_disconnect(move |_, _, _| {
        c.fetch_add(1, Ordering::SeqCst);
    });
    let engine = start(QueueBackend::Poll, callbacks).unwrap();

    let client = connect(&engine);
    assert!(wait_until(Duration::from_secs(5), || engine.connection_count() == 1));
    drop(client);
    assert!(wait_until(Duration::from_secs(5), || count.load(Ordering::SeqCst) == 1));
    assert_eq!(engine.connection_count(), 0);
}

#[test]
fn send_to_unknown_connection_is_noop() {
    let engine = start(QueueBackend::Poll, Callbacks::new()).unwrap();
    assert!(!engine.send_to(ConnId(424242), b"nobody"));
    assert_eq!(engine.send_to_all(b"nobody"), 0);
    assert_eq!(engine.stats().errors, 0);
}

#[test]
fn accept_pipeline_returns_to_depth() {
    let engine = start(QueueBackend::Poll, Callbacks::new()).unwrap();
    let depth = engine.config().accept_depth;

    let clients: Vec<_> = (0..25).map(|_| connect(&engine)).collect();
    assert!(wait_until(Duration::from_secs(5), || engine.stats().accepts == 25));
    assert!(wait_until(Duration::from_secs(5), || engine.stats().pending_accepts == depth));
    assert_eq!(engine.connection_count(), clients.len());
}

#[test]
fn callbacks_can_reply_through_handle() {
    let callbacks = Callbacks::new().on_receive(|h, msg| {
        let mut reply = b"echo:".to_vec();
        reply.extend_from_slice(msg.data);
        h.send_to(msg.conn, &reply);
    });
    let engine = start(QueueBackend::Poll, callbacks).unwrap();

    let mut client = connect(&engine);
    assert!(wait_until(Duration::from_secs(5), || engine.connection_count() == 1));
    client.write_all(b"hi").unwrap();
    let mut buf = [0u8; 7];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"echo:hi");
}

#[test]
fn large_send_arrives_whole() {
    let engine = start(QueueBackend::Poll, Callbacks::new()).unwrap();
    let mut client = connect(&engine);
    assert!(wait_until(Duration::from_secs(5), || engine.connection_count() == 1));

    // Bigger than a receive slot, so the send slot has to grow.
    let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    assert_eq!(engine.send_to_all(&payload), 1);

    let mut got = vec![0u8; payload.len()];
    client.read_exact(&mut got).unwrap();
    assert_eq!(got, payload);
}

#[test]
fn stop_twice_closes_clients() {
    let disconnects = Arc::new(AtomicUsize::new(0));
    let d = disconnects.clone();
    let callbacks = Callbacks::new().on_disconnect(move |_, _, _| {
        d.fetch_add(1, Ordering::SeqCst);
    });
    let Some(mut engine) = start(QueueBackend::Poll, callbacks) else { return };
    let addr = engine.local_addr().unwrap();
    let mut client = connect(&engine);
    assert!(wait_until(Duration::from_secs(5), || engine.connection_count() == 1));

    engine.stop();
    engine.stop();
    assert!(!engine.is_running());
    assert_eq!(engine.send_to_all(b"late"), 0);

    let mut buf = [0u8; 1];
    assert!(matches!(client.read(&mut buf), Ok(0) | Err(_)));
    assert!(TcpStream::connect_timeout(&addr, Duration::from_millis(500)).is_err());
    // Connections torn down by stop() are not reported as peer disconnects.
    assert_eq!(disconnects.load(Ordering::SeqCst), 0);
}

/// Clients write the instant they connect, so the first receive can
/// complete while the accepting worker is still registering. Every
/// reply sent from inside `on_receive` must still arrive.
fn echo_from_callback_without_waiting(backend: QueueBackend) {
    const THREADS: usize = 16;
    const ROUNDS: usize = 50;

    let misses = Arc::new(AtomicUsize::new(0));
    let m = misses.clone();
    let callbacks = Callbacks::new().on_receive(move |h, msg| {
        if !h.send_to(msg.conn, msg.data) {
            m.fetch_add(1, Ordering::SeqCst);
        }
    });
    let Some(engine) = start(backend, callbacks) else { return };
    let addr = engine.local_addr().unwrap();

    let clients: Vec<_> = (0..THREADS)
        .map(|_| {
            thread::spawn(move || {
                for _ in 0..ROUNDS {
                    let mut s = TcpStream::connect(addr).unwrap();
                    s.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
                    s.write_all(b"PING").unwrap();
                    let mut buf = [0u8; 4];
                    s.read_exact(&mut buf).unwrap();
                    assert_eq!(&buf, b"PING");
                }
            })
        })
        .collect();
    for c in clients {
        c.join().unwrap();
    }
    assert_eq!(misses.load(Ordering::SeqCst), 0);
}

#[test]
fn echo_from_callback_without_waiting_poll() {
    echo_from_callback_without_waiting(QueueBackend::Poll);
}

#[test]
fn echo_from_callback_without_waiting_uring() {
    echo_from_callback_without_waiting(QueueBackend::Uring);
}

#[test]
fn stuck_send_does_not_stall_the_registry() {
    let config = config().send_timeout(Duration::from_secs(3));
    let mut engine = Engine::new(config);
    engine.start(0, Callbacks::new()).unwrap();

    // Never reads, so the big send blocks on a full socket.
    let stalled = connect(&engine);
    assert!(wait_until(Duration::from_secs(5), || engine.connection_count() == 1));

    let handle = engine.handle();
    let sender = thread::spawn(move || handle.send_to_all(&vec![0u8; 64 << 20]));
    thread::sleep(Duration::from_millis(200));

    // Peer hangs up; the worker that sees it retires the connection
    // while the send still holds the socket.
    stalled.shutdown(std::net::Shutdown::Write).unwrap();
    thread::sleep(Duration::from_millis(200));

    let start = Instant::now();
    assert!(wait_until(Duration::from_secs(1), || engine.connection_count() == 0));
    assert!(start.elapsed() < Duration::from_secs(1));

    sender.join().unwrap();
    drop(stalled);
}
