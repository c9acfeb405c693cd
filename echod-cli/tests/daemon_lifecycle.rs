//! End-to-end lifecycle through the `echod` binary: foreground and detached
//! runs, signals, PID file handling, and exit codes.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use assert_cmd::prelude::*;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use predicates::str::contains;
use tempfile::TempDir;

fn echod_cmd(home: &Path, config: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_echod"));
    cmd.env("HOME", home).arg("--config").arg(config);
    cmd
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(50));
    }
    false
}

struct Fixture {
    home: TempDir,
    config: PathBuf,
    port: u16,
}

impl Fixture {
    fn new() -> Self {
        Self::with_extra("")
    }

    fn with_extra(extra: &str) -> Self {
        let home = TempDir::new().expect("home");
        let port = free_port();
        let config = home.path().join("echod.yaml");
        std::fs::write(
            &config,
            format!(
                "port: {port}\n\
                 pid_file: run/echod.pid\n\
                 log_file: logs/echod.log\n\
                 shutdown_grace_ms: 500\n\
                 {extra}"
            ),
        )
        .expect("write config");
        Self { home, config, port }
    }

    fn cmd(&self) -> Command {
        echod_cmd(self.home.path(), &self.config)
    }

    fn pid_file(&self) -> PathBuf {
        self.home.path().join("run").join("echod.pid")
    }

    fn log_file(&self) -> PathBuf {
        self.home.path().join("logs").join("echod.log")
    }

    fn log_text(&self) -> String {
        std::fs::read_to_string(self.log_file()).unwrap_or_default()
    }

    fn addr(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    fn echo(&self, payload: &[u8]) -> Vec<u8> {
        let mut stream = TcpStream::connect(self.addr()).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout");
        stream.write_all(payload).expect("write");
        let mut echoed = vec![0u8; payload.len()];
        stream.read_exact(&mut echoed).expect("read echo");
        echoed
    }

    fn status_json(&self) -> serde_json::Value {
        let output = self.cmd().arg("status").output().expect("run status");
        assert!(output.status.success(), "status failed: {output:?}");
        serde_json::from_slice(&output.stdout).expect("status JSON")
    }
}

/// Makes sure a detached daemon does not outlive a failed test.
struct DetachedGuard<'a>(&'a Fixture);

impl Drop for DetachedGuard<'_> {
    fn drop(&mut self) {
        if let Ok(text) = std::fs::read_to_string(self.0.pid_file()) {
            if let Ok(pid) = text.trim().parse::<i32>() {
                let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
            }
        }
    }
}

fn wait_for_exit(child: &mut Child, timeout: Duration) -> Option<i32> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Ok(Some(status)) = child.try_wait() {
            return status.code();
        }
        sleep(Duration::from_millis(50));
    }
    let _ = child.kill();
    let _ = child.wait();
    None
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[test]
fn check_config_prints_effective_yaml_with_resolved_paths() {
    let fx = Fixture::new();
    let pid_file = fx.pid_file();
    fx.cmd()
        .arg("check-config")
        .assert()
        .success()
        .stdout(contains(format!("port: {}", fx.port)))
        .stdout(contains(pid_file.display().to_string()))
        .stdout(contains("echod.yaml"));
}

#[test]
fn invalid_config_exits_with_code_2() {
    let fx = Fixture::with_extra("max_connections: 0\n");
    fx.cmd()
        .args(["start", "--foreground"])
        .assert()
        .code(2)
        .stderr(contains("max_connections"));
    assert!(!fx.pid_file().exists());
}

#[test]
fn missing_explicit_config_exits_with_code_2() {
    let home = TempDir::new().expect("home");
    echod_cmd(home.path(), &home.path().join("absent.yaml"))
        .arg("check-config")
        .assert()
        .code(2)
        .stderr(contains("absent.yaml"));
}

// ---------------------------------------------------------------------------
// Foreground
// ---------------------------------------------------------------------------

#[test]
fn foreground_daemon_echoes_and_exits_zero_on_sigterm() {
    let fx = Fixture::new();
    let mut child = fx
        .cmd()
        .args(["start", "--foreground"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn foreground daemon");

    assert!(
        wait_until(Duration::from_secs(10), || TcpStream::connect(fx.addr()).is_ok()),
        "daemon did not start listening"
    );
    assert_eq!(fx.echo(b"foreground ping"), b"foreground ping");

    kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM).expect("send SIGTERM");
    let code = wait_for_exit(&mut child, Duration::from_secs(10));
    assert_eq!(code, Some(0), "clean stop must exit 0");

    let log = fx.log_text();
    assert!(log.contains("daemon running"), "log:\n{log}");
    assert!(log.contains("daemon stopped"), "log:\n{log}");
    assert!(log.contains("| worker | connection closed"), "log:\n{log}");

    fx.cmd()
        .args(["logs", "--lines", "5"])
        .assert()
        .success()
        .stdout(contains("daemon stopped"));
}

// ---------------------------------------------------------------------------
// Detached
// ---------------------------------------------------------------------------

#[test]
fn detached_daemon_full_lifecycle() {
    let fx = Fixture::new();
    let _guard = DetachedGuard(&fx);

    // The launching process exits only once the daemon is running.
    fx.cmd().arg("start").assert().success();
    assert_eq!(fx.echo(b"detached"), b"detached");

    let status = fx.status_json();
    assert_eq!(status["running"], true);
    let pid = status["pid"].as_i64().expect("pid") as i32;
    assert_eq!(
        std::fs::read_to_string(fx.pid_file()).unwrap().trim(),
        pid.to_string()
    );

    // A second instance must refuse to start.
    fx.cmd()
        .arg("start")
        .assert()
        .code(3)
        .stderr(contains("already running"));

    fx.cmd().arg("reload").assert().success();
    assert!(
        wait_until(Duration::from_secs(5), || fx.log_text().contains("configuration reloaded")),
        "reload not logged"
    );

    fx.cmd().arg("dump-status").assert().success();
    assert!(
        wait_until(Duration::from_secs(5), || fx.log_text().contains("| supervisor | status")),
        "status dump not logged"
    );

    fx.cmd()
        .arg("stop")
        .assert()
        .success()
        .stdout(contains("daemon stopped"));
    assert!(!fx.pid_file().exists(), "PID file must be removed on stop");
    assert_eq!(fx.status_json()["running"], false);
    assert!(TcpStream::connect(fx.addr()).is_err());
}

#[test]
fn detached_bind_failure_is_reported_to_the_launcher() {
    let fx = Fixture::new();
    let _guard = DetachedGuard(&fx);
    let _taken = TcpListener::bind(fx.addr()).expect("occupy port");

    fx.cmd().arg("start").assert().code(4);
    assert!(
        wait_until(Duration::from_secs(5), || !fx.pid_file().exists()),
        "failed daemon must not leave a PID file"
    );
}

#[test]
fn stale_pid_file_is_replaced_and_reported_not_running() {
    let fx = Fixture::new();
    std::fs::create_dir_all(fx.pid_file().parent().unwrap()).unwrap();

    let mut child = Command::new("true").spawn().expect("spawn true");
    let dead = child.id();
    child.wait().unwrap();
    std::fs::write(fx.pid_file(), format!("{dead}\n")).unwrap();

    assert_eq!(fx.status_json()["running"], false);
    assert!(!fx.pid_file().exists(), "status removes a stale PID file");

    fx.cmd()
        .arg("stop")
        .assert()
        .success()
        .stdout(contains("not running"));
    fx.cmd().arg("reload").assert().code(1).stderr(contains("not running"));
}
