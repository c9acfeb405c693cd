//! echod daemon runtime: daemonization, log sink, signals, listener, supervisor.

pub mod acceptor;
pub mod daemonizer;
mod error;
pub mod log_sink;
pub mod logging;
pub mod paths;
pub mod pid_file;
pub mod registry;
mod runtime;
pub mod signals;
pub mod supervisor;
pub mod udp;
pub mod worker;

pub use daemonizer::{Background, DaemonHandle, Daemonizer, Foreground};
pub use error::{exit_code, DaemonError};
pub use log_sink::{LogRecord, LogSink, LogSinkError};
pub use logging::LogLevelHandle;
pub use pid_file::{is_process_alive, PidFile};
pub use runtime::start_blocking;
pub use signals::{control_channel, ControlReceiver, ControlSender, SignalRouter};
pub use supervisor::{RunningDaemon, ShutdownReport, Supervisor};
