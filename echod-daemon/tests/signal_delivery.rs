//! Real signals delivered to this test process reach the control channel.
//!
//! Kept in its own test binary: the handlers stay installed for the life of
//! the process.

use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::getpid;

use echod_core::ControlCommand;
use echod_daemon::{control_channel, ControlReceiver, SignalRouter};

async fn next_command(rx: &mut ControlReceiver) -> ControlCommand {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("signal forwarded in time")
        .expect("channel open")
}

#[tokio::test]
async fn signals_map_to_control_commands() {
    let (tx, mut rx) = control_channel();
    let _router = SignalRouter::install(tx).expect("install handlers");

    kill(getpid(), Signal::SIGHUP).unwrap();
    assert_eq!(next_command(&mut rx).await, ControlCommand::ReloadRequested);

    kill(getpid(), Signal::SIGUSR1).unwrap();
    assert_eq!(next_command(&mut rx).await, ControlCommand::StatusDumpRequested);

    kill(getpid(), Signal::SIGTERM).unwrap();
    assert_eq!(next_command(&mut rx).await, ControlCommand::ShutdownRequested);

    kill(getpid(), Signal::SIGINT).unwrap();
    assert_eq!(next_command(&mut rx).await, ControlCommand::ShutdownRequested);

    // Two hangups before the first is taken yield a single reload.
    kill(getpid(), Signal::SIGHUP).unwrap();
    kill(getpid(), Signal::SIGHUP).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(next_command(&mut rx).await, ControlCommand::ReloadRequested);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rx.try_recv(), None);
}
