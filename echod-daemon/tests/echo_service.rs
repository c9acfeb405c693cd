//! In-process daemon: echo behavior, admission control, drain, reload, status dump.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use echod_core::{ConfigError, ConfigSource, ControlCommand, DaemonConfig, DaemonState, LogLevel};
use echod_daemon::{logging, DaemonHandle, LogLevelHandle, LogSink, PidFile, RunningDaemon, Supervisor};

struct Harness {
    dir: TempDir,
    config: DaemonConfig,
    sink: Arc<LogSink>,
}

impl Harness {
    fn new(tweak: impl FnOnce(&mut DaemonConfig)) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let mut config = DaemonConfig {
            port: 0,
            pid_file: dir.path().join("run").join("echod.pid"),
            log_file: dir.path().join("logs").join("echod.log"),
            shutdown_grace_ms: 2_000,
            ..DaemonConfig::default()
        };
        tweak(&mut config);
        let sink = Arc::new(LogSink::from_config(&config).expect("open sink"));
        Self { dir, config, sink }
    }

    fn supervisor(&self) -> Supervisor {
        let pid_file = PidFile::acquire(&self.config.pid_file).expect("pid file");
        let daemon = DaemonHandle::new(pid_file.pid(), Some(pid_file), None);
        Supervisor::new(
            self.config.clone(),
            daemon,
            self.sink.clone(),
            LogLevelHandle::detached(self.config.log_level),
        )
        .with_signals(false)
    }

    async fn start(&self) -> RunningDaemon {
        self.supervisor().start().await.expect("daemon start")
    }

    fn log_text(&self) -> String {
        std::fs::read_to_string(&self.config.log_file).unwrap_or_default()
    }
}

async fn round_trip(stream: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
    stream.write_all(payload).await.expect("write");
    let mut echoed = vec![0u8; payload.len()];
    stream.read_exact(&mut echoed).await.expect("read echo");
    echoed
}

fn shutdown(running: &RunningDaemon) {
    running
        .control()
        .request(ControlCommand::ShutdownRequested)
        .expect("request shutdown");
}

// ---------------------------------------------------------------------------
// Echo semantics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn large_binary_payload_comes_back_byte_for_byte() {
    let harness = Harness::new(|c| c.buffer_size = 1024);
    let running = harness.start().await;

    let payload: Vec<u8> = (0..256 * 1024u32).map(|i| (i * 31 % 251) as u8).collect();
    let stream = TcpStream::connect(running.local_addr()).await.unwrap();
    let (mut reader, mut writer) = stream.into_split();

    let to_send = payload.clone();
    let sender = tokio::spawn(async move {
        writer.write_all(&to_send).await.unwrap();
        writer.shutdown().await.unwrap();
    });
    let mut echoed = Vec::new();
    reader.read_to_end(&mut echoed).await.unwrap();
    sender.await.unwrap();

    assert_eq!(echoed.len(), payload.len());
    assert!(echoed == payload, "echoed bytes differ from input");

    shutdown(&running);
    running.wait().await.unwrap();
}

#[tokio::test]
async fn concurrent_connections_do_not_see_each_others_bytes() {
    let harness = Harness::new(|_| {});
    let running = harness.start().await;
    let addr = running.local_addr();

    let clients: Vec<_> = (0..8u8)
        .map(|n| {
            tokio::spawn(async move {
                let mut stream = TcpStream::connect(addr).await.unwrap();
                for round in 0..20u8 {
                    let payload = vec![n.wrapping_mul(17).wrapping_add(round); 100 + n as usize];
                    assert_eq!(round_trip(&mut stream, &payload).await, payload);
                }
            })
        })
        .collect();
    for client in clients {
        client.await.unwrap();
    }

    shutdown(&running);
    let report = running.wait().await.unwrap();
    assert_eq!(report.forced_connections, 0);
}

#[tokio::test]
async fn udp_datagrams_are_echoed_when_enabled() {
    let harness = Harness::new(|c| c.udp_port = Some(0));
    let running = harness.start().await;
    let udp_addr = running.udp_addr().expect("udp enabled");

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"datagram", udp_addr).await.unwrap();
    let mut buf = [0u8; 32];
    let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .expect("udp echo in time")
        .unwrap();
    assert_eq!(&buf[..n], b"datagram");

    shutdown(&running);
    running.wait().await.unwrap();
}

// ---------------------------------------------------------------------------
// Admission control
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connections_beyond_the_cap_are_closed_immediately() {
    let harness = Harness::new(|c| c.max_connections = 2);
    let running = harness.start().await;
    let addr = running.local_addr();

    let mut first = TcpStream::connect(addr).await.unwrap();
    let mut second = TcpStream::connect(addr).await.unwrap();
    assert_eq!(round_trip(&mut first, b"one").await, b"one");
    assert_eq!(round_trip(&mut second, b"two").await, b"two");

    let mut rejected = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 8];
    let outcome = tokio::time::timeout(Duration::from_secs(5), rejected.read(&mut buf))
        .await
        .expect("rejected socket must be closed promptly");
    assert!(matches!(outcome, Ok(0) | Err(_)), "got {outcome:?}");

    // Existing connections are unaffected.
    assert_eq!(round_trip(&mut first, b"still here").await, b"still here");

    // A freed slot admits a new connection.
    drop(second);
    let mut admitted = false;
    for _ in 0..100 {
        let mut next = TcpStream::connect(addr).await.unwrap();
        if next.write_all(b"x").await.is_ok() {
            let mut one = [0u8; 1];
            if let Ok(Ok(1)) =
                tokio::time::timeout(Duration::from_millis(200), next.read(&mut one)).await
            {
                admitted = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(admitted, "slot freed by a closed connection must be reusable");

    drop(first);
    shutdown(&running);
    running.wait().await.unwrap();
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn graceful_drain_finishes_in_flight_work_and_removes_pid_file() {
    let harness = Harness::new(|_| {});
    let running = harness.start().await;
    let addr = running.local_addr();
    assert!(harness.config.pid_file.exists());

    let mut client = TcpStream::connect(addr).await.unwrap();
    assert_eq!(round_trip(&mut client, b"before").await, b"before");

    shutdown(&running);
    while running.state() == DaemonState::Running {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(running.state(), DaemonState::Draining);

    // In-flight connection keeps working during the grace period.
    assert_eq!(round_trip(&mut client, b"during drain").await, b"during drain");
    client.shutdown().await.unwrap();
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();

    let report = running.wait().await.unwrap();
    assert_eq!(report.forced_connections, 0);
    assert!(!harness.config.pid_file.exists(), "PID file must be removed");
    assert!(TcpStream::connect(addr).await.is_err(), "listener must be closed");
}

#[tokio::test]
async fn idle_connections_are_force_closed_after_grace() {
    let harness = Harness::new(|c| c.shutdown_grace_ms = 100);
    let running = harness.start().await;

    let mut idle = TcpStream::connect(running.local_addr()).await.unwrap();
    assert_eq!(round_trip(&mut idle, b"hi").await, b"hi");

    shutdown(&running);
    let report = running.wait().await.expect("forced close is still a clean stop");
    assert_eq!(report.forced_connections, 1);
    assert!(!harness.config.pid_file.exists());

    let mut buf = [0u8; 4];
    let outcome = tokio::time::timeout(Duration::from_secs(5), idle.read(&mut buf))
        .await
        .expect("force-closed socket must report EOF or error");
    assert!(matches!(outcome, Ok(0) | Err(_)), "got {outcome:?}");
}

// ---------------------------------------------------------------------------
// Control commands
// ---------------------------------------------------------------------------

struct CountingSource {
    config: DaemonConfig,
    loads: Arc<AtomicUsize>,
}

impl ConfigSource for CountingSource {
    fn load(&self) -> Result<DaemonConfig, ConfigError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.config.clone())
    }

    fn describe(&self) -> String {
        "counting".to_string()
    }
}

#[tokio::test]
async fn back_to_back_reloads_coalesce_into_one() {
    let harness = Harness::new(|_| {});
    let loads = Arc::new(AtomicUsize::new(0));
    let source = CountingSource {
        config: harness.config.clone(),
        loads: loads.clone(),
    };
    let running = harness
        .supervisor()
        .with_config_source(Box::new(source))
        .start()
        .await
        .unwrap();

    // The control loop cannot run between these calls on a current-thread runtime.
    let control = running.control();
    assert!(control.request(ControlCommand::ReloadRequested).unwrap());
    assert!(!control.request(ControlCommand::ReloadRequested).unwrap());
    shutdown(&running);

    let report = running.wait().await.unwrap();
    assert_eq!(report.reloads, 1);
    assert_eq!(loads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn status_dump_logs_connections_without_changing_state() {
    let harness = Harness::new(|_| {});
    let (subscriber, _levels) = logging::subscriber(harness.sink.clone(), LogLevel::Info, false);
    let _guard = tracing::subscriber::set_default(subscriber);

    let running = harness.start().await;
    let mut client = TcpStream::connect(running.local_addr()).await.unwrap();
    assert_eq!(round_trip(&mut client, b"hello").await, b"hello");

    running
        .control()
        .request(ControlCommand::StatusDumpRequested)
        .unwrap();
    while !harness.log_text().contains("| supervisor | status") {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(running.state(), DaemonState::Running);

    drop(client);
    shutdown(&running);
    running.wait().await.unwrap();

    let log = harness.log_text();
    let status = log
        .lines()
        .find(|line| line.contains("| supervisor | status"))
        .expect("status line");
    assert!(status.contains("state=running"), "{status}");
    assert!(status.contains("connections=1"), "{status}");
    let connection = log
        .lines()
        .find(|line| line.contains("| supervisor | connection "))
        .expect("per-connection line");
    assert!(connection.contains("bytes_in=5"), "{connection}");
    assert!(log.contains("daemon stopped"));
    assert!(harness.dir.path().join("logs").join("echod.log").exists());
}
