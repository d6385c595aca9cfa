//! End-to-end behavior over real loopback sockets.
//!
//! A small echo server stands in for the command/reply server; the test
//! bridge queues raw byte chunks and reads replies greedily, exactly the
//! discipline the manager expects from a real connection.

#![cfg(unix)]

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;

use manifold::{
    Endpoint, ManagerEvent, ManagerMonitor, ManagerOptions, ManagerState, SocketBridge,
    SocketManager, SocketToken, WriteResult,
};

struct Connection {
    stream: TcpStream,
    token: SocketToken,
}

struct TestBridge {
    name: String,
    slot: AtomicBool,
    write_mutex: Mutex<()>,
    connection: Mutex<Option<Connection>>,
    outbound: Mutex<VecDeque<Bytes>>,
    received: Mutex<Vec<u8>>,
    reads: AtomicUsize,
    heartbeats: AtomicUsize,
    errors: AtomicUsize,
    stale_checks: AtomicUsize,
    /// Pretend the framing layer has buffered data (exercises the fallback
    /// read path).
    force_data_available: AtomicBool,
    /// Artificial delay inside `connected`, for disposal races.
    connected_delay: Duration,
}

impl TestBridge {
    fn new(name: &str) -> Arc<Self> {
        Self::with_connected_delay(name, Duration::ZERO)
    }

    fn with_connected_delay(name: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            slot: AtomicBool::new(false),
            write_mutex: Mutex::new(()),
            connection: Mutex::new(None),
            outbound: Mutex::new(VecDeque::new()),
            received: Mutex::new(Vec::new()),
            reads: AtomicUsize::new(0),
            heartbeats: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
            stale_checks: AtomicUsize::new(0),
            force_data_available: AtomicBool::new(false),
            connected_delay: delay,
        })
    }

    fn enqueue(&self, payload: &[u8]) {
        self.outbound
            .lock()
            .unwrap()
            .push_back(Bytes::copy_from_slice(payload));
    }

    fn received(&self) -> Vec<u8> {
        self.received.lock().unwrap().clone()
    }

    fn token(&self) -> SocketToken {
        self.connection
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.token.clone())
            .unwrap_or(SocketToken::NONE)
    }

    fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn heartbeats(&self) -> usize {
        self.heartbeats.load(Ordering::SeqCst)
    }

    fn errors(&self) -> usize {
        self.errors.load(Ordering::SeqCst)
    }
}

impl SocketBridge for TestBridge {
    fn name(&self) -> &str {
        &self.name
    }

    fn connected(&self, stream: TcpStream, token: SocketToken) -> std::io::Result<bool> {
        if !self.connected_delay.is_zero() {
            thread::sleep(self.connected_delay);
        }
        *self.connection.lock().unwrap() = Some(Connection { stream, token });
        Ok(true)
    }

    fn read(&self) {
        self.reads.fetch_add(1, Ordering::SeqCst);
        loop {
            let mut guard = self.connection.lock().unwrap();
            let Some(conn) = guard.as_mut() else { return };
            let available = conn.token.available().unwrap_or(0);
            if available == 0 {
                // Readable with nothing buffered: either the fallback probe
                // fired, or the peer closed. Peek without blocking to tell
                // the two apart.
                conn.stream.set_nonblocking(true).ok();
                let eof = matches!(conn.stream.peek(&mut [0u8; 1]), Ok(0));
                conn.stream.set_nonblocking(false).ok();
                if eof {
                    conn.token.shutdown();
                }
                return;
            }
            let mut buf = vec![0u8; available];
            match conn.stream.read(&mut buf) {
                Ok(0) => {
                    conn.token.shutdown();
                    return;
                }
                Ok(n) => self.received.lock().unwrap().extend_from_slice(&buf[..n]),
                Err(_) => {
                    conn.token.shutdown();
                    return;
                }
            }
        }
    }

    fn start_reading(&self) -> std::io::Result<()> {
        Ok(())
    }

    fn error(&self) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    fn on_heartbeat(&self) {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
    }

    fn check_for_stale_connection(&self, _state: ManagerState) {
        self.stale_checks.fetch_add(1, Ordering::SeqCst);
    }

    fn is_data_available(&self) -> bool {
        self.force_data_available.load(Ordering::SeqCst)
            || self.token().available().unwrap_or(0) > 0
    }

    fn write_queue(&self, budget: Option<Duration>) -> WriteResult {
        let Ok(_guard) = self.write_mutex.try_lock() else {
            return WriteResult::CompetingWriter;
        };
        let started = Instant::now();
        let mut wrote = false;
        loop {
            let next = self.outbound.lock().unwrap().pop_front();
            let Some(chunk) = next else {
                return if wrote {
                    WriteResult::QueueEmptyAfterWrite
                } else {
                    WriteResult::NothingToDo
                };
            };
            let mut guard = self.connection.lock().unwrap();
            let Some(conn) = guard.as_mut() else {
                return WriteResult::NoConnection;
            };
            if conn.stream.write_all(&chunk).is_err() {
                return WriteResult::NoConnection;
            }
            wrote = true;
            if let Some(budget) = budget {
                if started.elapsed() >= budget {
                    return WriteResult::MoreWork;
                }
            }
        }
    }

    fn confirm_remove_from_write_queue(&self) -> bool {
        self.slot.store(false, Ordering::Release);
        if self.outbound.lock().unwrap().is_empty() {
            true
        } else {
            self.slot.store(true, Ordering::Release);
            false
        }
    }

    fn write_slot(&self) -> &AtomicBool {
        &self.slot
    }
}

/// Echo server that copies every byte back to the client.
fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            thread::spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Server that accepts one connection and immediately drops it.
fn spawn_hangup_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let _ = listener.accept();
        // Accepted stream drops here; the client sees a hangup.
    });
    addr
}

fn wait_until(what: &str, timeout: Duration, pred: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    while !pred() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

fn expect_event(
    monitor: &ManagerMonitor,
    what: &str,
    timeout: Duration,
    pred: impl Fn(&ManagerEvent) -> bool,
) {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match monitor.recv_timeout(remaining) {
            Ok(event) if pred(&event) => return,
            Ok(_) => continue,
            Err(_) => panic!("timed out waiting for {what}"),
        }
    }
}

fn manager(name: &str) -> SocketManager {
    manifold::dev_tracing::init_tracing();
    SocketManager::new(ManagerOptions::new().with_name(name)).unwrap()
}

#[test]
fn request_reply_round_trip() {
    let addr = spawn_echo_server();
    let manager = manager("round-trip");
    let monitor = manager.monitor();
    let bridge = TestBridge::new("echo");

    manager
        .begin_connect(Endpoint::Ip(addr), bridge.clone())
        .unwrap();
    expect_event(&monitor, "connect", Duration::from_secs(5), |e| {
        matches!(e, ManagerEvent::Connected(_))
    });
    assert_eq!(manager.installed_sockets(), 1);

    bridge.enqueue(b"PING");
    manager.request_write(bridge.clone(), false);

    wait_until("echoed reply", Duration::from_secs(5), || {
        bridge.received() == b"PING"
    });
    assert_eq!(bridge.errors(), 0);

    // The pacemaker fires on the reader's first pass, well before 15s.
    wait_until("first heartbeat", Duration::from_secs(3), || {
        bridge.heartbeats() >= 1
    });

    manager.dispose();
}

#[test]
fn pipelined_commands_preserve_order() {
    let addr = spawn_echo_server();
    let manager = manager("ordering");
    let monitor = manager.monitor();
    let bridge = TestBridge::new("pipeline");

    manager
        .begin_connect(Endpoint::Ip(addr), bridge.clone())
        .unwrap();
    expect_event(&monitor, "connect", Duration::from_secs(5), |e| {
        matches!(e, ManagerEvent::Connected(_))
    });

    for i in 0..10u8 {
        bridge.enqueue(&[b'c', b'0' + i]);
        manager.request_write(bridge.clone(), false);
    }

    wait_until("all replies", Duration::from_secs(5), || {
        bridge.received().len() == 20
    });
    assert_eq!(
        bridge.received(),
        b"c0c1c2c3c4c5c6c7c8c9".to_vec(),
        "outbound bytes keep FIFO order within a bridge"
    );

    manager.dispose();
}

#[test]
fn fallback_read_fires_when_select_stays_idle() {
    let addr = spawn_echo_server();
    let manager = manager("fallback");
    let monitor = manager.monitor();
    let bridge = TestBridge::new("idle");

    manager
        .begin_connect(Endpoint::Ip(addr), bridge.clone())
        .unwrap();
    expect_event(&monitor, "connect", Duration::from_secs(5), |e| {
        matches!(e, ManagerEvent::Connected(_))
    });

    // No bytes in flight; readiness keeps timing out. The bridge claiming
    // buffered data must still be read via the fallback path.
    bridge.force_data_available.store(true, Ordering::SeqCst);
    wait_until("fallback read", Duration::from_secs(3), || {
        bridge.reads() >= 1
    });
    assert!(
        manager.last_error_age().is_none(),
        "idle cycles are not errors"
    );

    manager.dispose();
}

#[test]
fn idle_connection_gets_stale_probes() {
    let addr = spawn_echo_server();
    let manager = manager("stale");
    let monitor = manager.monitor();
    let bridge = TestBridge::new("quiet");

    manager
        .begin_connect(Endpoint::Ip(addr), bridge.clone())
        .unwrap();
    expect_event(&monitor, "connect", Duration::from_secs(5), |e| {
        matches!(e, ManagerEvent::Connected(_))
    });

    wait_until("stale probe", Duration::from_secs(4), || {
        bridge.stale_checks.load(Ordering::SeqCst) >= 1
    });

    manager.dispose();
}

#[test]
fn dispose_mid_connect_reports_error_once() {
    let addr = spawn_echo_server();
    let manager = manager("race");
    let monitor = manager.monitor();
    let bridge = TestBridge::with_connected_delay("raced", Duration::from_millis(300));

    manager
        .begin_connect(Endpoint::Ip(addr), bridge.clone())
        .unwrap();
    thread::sleep(Duration::from_millis(50));
    manager.dispose();

    wait_until("bridge error", Duration::from_secs(3), || {
        bridge.errors() == 1
    });
    thread::sleep(Duration::from_millis(100));
    assert_eq!(bridge.errors(), 1, "error is delivered exactly once");
    assert_eq!(manager.installed_sockets(), 0);
    assert!(
        !monitor
            .try_iter()
            .any(|e| matches!(e, ManagerEvent::Connected(_))),
        "a disposed manager never reports the connect"
    );
}

#[test]
fn dead_socket_is_culled_from_the_lookup() {
    let addr = spawn_hangup_server();
    let manager = manager("cull");
    let monitor = manager.monitor();
    let bridge = TestBridge::new("doomed");

    manager
        .begin_connect(Endpoint::Ip(addr), bridge.clone())
        .unwrap();
    expect_event(&monitor, "connect", Duration::from_secs(5), |e| {
        matches!(e, ManagerEvent::Connected(_))
    });

    // The server already dropped the stream; the reader observes the
    // hangup, the bridge shuts its token, and the next locate pass culls
    // the handle without passing it to the readiness call again.
    wait_until("lookup culled", Duration::from_secs(5), || {
        manager.installed_sockets() == 0
    });
    assert!(!manager.is_disposed());

    manager.dispose();
}

#[test]
fn shutdown_is_idempotent() {
    let addr = spawn_echo_server();
    let manager = manager("shutdown");
    let monitor = manager.monitor();
    let bridge = TestBridge::new("shut");

    manager
        .begin_connect(Endpoint::Ip(addr), bridge.clone())
        .unwrap();
    expect_event(&monitor, "connect", Duration::from_secs(5), |e| {
        matches!(e, ManagerEvent::Connected(_))
    });

    let token = bridge.token();
    assert!(token.has_value());
    manager.shutdown(&token);
    manager.shutdown(&token);

    assert_eq!(manager.installed_sockets(), 0);
    thread::sleep(Duration::from_millis(50));
    let shutdowns = monitor
        .try_iter()
        .filter(|e| matches!(e, ManagerEvent::SocketShutdown))
        .count();
    assert_eq!(shutdowns, 1, "second shutdown is a no-op");

    manager.dispose();
}

#[test]
fn one_reader_services_many_bridges() {
    let addr = spawn_echo_server();
    let manager = manager("uniqueness");
    let monitor = manager.monitor();
    let a = TestBridge::new("a");
    let b = TestBridge::new("b");

    manager.begin_connect(Endpoint::Ip(addr), a.clone()).unwrap();
    manager.begin_connect(Endpoint::Ip(addr), b.clone()).unwrap();

    wait_until("both installed", Duration::from_secs(5), || {
        manager.installed_sockets() == 2
    });

    a.enqueue(b"from-a");
    manager.request_write(a.clone(), false);
    b.enqueue(b"from-b");
    manager.request_write(b.clone(), false);

    wait_until("both replies", Duration::from_secs(5), || {
        a.received() == b"from-a" && b.received() == b"from-b"
    });

    thread::sleep(Duration::from_millis(50));
    let reader_starts = monitor
        .try_iter()
        .filter(|e| matches!(e, ManagerEvent::ReaderStarted))
        .count();
    assert_eq!(reader_starts, 1, "one poll reader per manager");

    manager.dispose();
}

#[test]
fn reader_exits_on_dispose() {
    let addr = spawn_echo_server();
    let manager = manager("reader-exit");
    let monitor = manager.monitor();
    let bridge = TestBridge::new("done");

    manager
        .begin_connect(Endpoint::Ip(addr), bridge.clone())
        .unwrap();
    expect_event(&monitor, "connect", Duration::from_secs(5), |e| {
        matches!(e, ManagerEvent::Connected(_))
    });

    manager.dispose();
    expect_event(&monitor, "reader exit", Duration::from_secs(3), |e| {
        matches!(e, ManagerEvent::ReaderExited)
    });
    assert_eq!(manager.state(), ManagerState::Terminated);
}

#[test]
#[ignore = "waits out the 20s empty-lookup exit"]
fn reader_exits_when_lookup_stays_empty() {
    let addr = spawn_echo_server();
    let manager = manager("empty-exit");
    let monitor = manager.monitor();
    let bridge = TestBridge::new("first");

    manager
        .begin_connect(Endpoint::Ip(addr), bridge.clone())
        .unwrap();
    expect_event(&monitor, "connect", Duration::from_secs(5), |e| {
        matches!(e, ManagerEvent::Connected(_))
    });

    manager.shutdown(&bridge.token());
    expect_event(&monitor, "reader exit", Duration::from_secs(25), |e| {
        matches!(e, ManagerEvent::ReaderExited)
    });
    assert_eq!(manager.state(), ManagerState::Inactive);

    // A later install starts a fresh reader.
    let second = TestBridge::new("second");
    manager
        .begin_connect(Endpoint::Ip(addr), second.clone())
        .unwrap();
    expect_event(&monitor, "second reader", Duration::from_secs(5), |e| {
        matches!(e, ManagerEvent::ReaderStarted)
    });

    manager.dispose();
}

#[test]
#[ignore = "waits out a full 15s heartbeat interval"]
fn heartbeats_repeat_within_sixteen_seconds() {
    let addr = spawn_echo_server();
    let manager = manager("pacemaker");
    let monitor = manager.monitor();
    let bridge = TestBridge::new("paced");

    manager
        .begin_connect(Endpoint::Ip(addr), bridge.clone())
        .unwrap();
    expect_event(&monitor, "connect", Duration::from_secs(5), |e| {
        matches!(e, ManagerEvent::Connected(_))
    });

    wait_until("first heartbeat", Duration::from_secs(3), || {
        bridge.heartbeats() >= 1
    });
    wait_until("second heartbeat", Duration::from_secs(16), || {
        bridge.heartbeats() >= 2
    });

    manager.dispose();
}
