//! `start`/`stop`/`kill`/`status` built on the rebirth protocol and the
//! liveness oracle.
//!
//! The exiting variants print a single word to stdout and terminate the
//! invoking process, which makes them suitable as the whole body of a CLI
//! subcommand. The non-exiting ones return their outcome instead.

use std::fmt;
use std::fs;
use std::io;
use std::process;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::context::Context;
use crate::error::{DaemonError, DaemonResult};
use crate::liveness::{has_exited, is_process_running};
use crate::lockfile::read_pid_file;
use crate::rebirth::{Rebirth, was_reborn};
use crate::sys::unix;

const TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::lifecycle");
const EXIT_POLL: Duration = Duration::from_millis(50);

/// What the pid file says about the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    /// The recorded pid runs this program.
    Running(u32),
    /// No pid file, or nothing readable in it.
    Stopped,
    /// A pid is recorded but it no longer runs this program.
    Crashed(u32),
}

impl DaemonState {
    /// `0` when running, `1` otherwise.
    pub const fn exit_code(self) -> i32 {
        match self {
            DaemonState::Running(_) => 0,
            DaemonState::Stopped | DaemonState::Crashed(_) => 1,
        }
    }
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonState::Running(_) => write!(f, "running"),
            DaemonState::Stopped => write!(f, "stopped"),
            DaemonState::Crashed(_) => write!(f, "crashed"),
        }
    }
}

/// Signal used to end the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// `SIGTERM`, letting the daemon release its pid file.
    Terminate,
    /// `SIGKILL`.
    Kill,
}

impl Signal {
    fn raw(self) -> libc::c_int {
        match self {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

impl Context {
    /// Returns the pid recorded in the configured pid file.
    ///
    /// `Ok(None)` when no pid file is configured.
    pub fn search(&self) -> DaemonResult<Option<u32>> {
        self.pid_file.as_deref().map(read_pid_file).transpose()
    }

    pub fn state(&self) -> DaemonState {
        match self.search() {
            Ok(Some(pid)) if is_process_running(pid, self.pid_file.as_deref()) => {
                DaemonState::Running(pid)
            }
            Ok(Some(pid)) => DaemonState::Crashed(pid),
            Ok(None) | Err(_) => DaemonState::Stopped,
        }
    }

    /// Returns the recorded pid only if it verifiably runs this program.
    pub fn running_pid(&self) -> DaemonResult<Option<u32>> {
        Ok(self
            .search()?
            .filter(|pid| is_process_running(*pid, self.pid_file.as_deref())))
    }

    /// Signals the running daemon, waits for it to exit and removes its pid
    /// file. Returns the pid that was ended, or `None` if nothing was running.
    pub fn terminate(&self, signal: Signal) -> DaemonResult<Option<u32>> {
        let pid = match self.running_pid() {
            Ok(Some(pid)) => pid,
            Ok(None) | Err(_) => return Ok(None),
        };
        unix::kill(pid, signal.raw())?;
        info!(target: TARGET, pid, ?signal, "signal sent");
        self.wait_for_exit(pid)?;

        if let Some(path) = &self.pid_file {
            match fs::remove_file(path) {
                Err(err) if err.kind() != io::ErrorKind::NotFound => {
                    warn!(target: TARGET, file = %path.display(), error = %err, "failed to remove pid file");
                }
                _ => {}
            }
        }
        Ok(Some(pid))
    }

    fn wait_for_exit(&self, pid: u32) -> DaemonResult<()> {
        let started = Instant::now();
        while !has_exited(pid) {
            if let Some(budget) = self.stop_timeout {
                if started.elapsed() >= budget {
                    return Err(DaemonError::Timeout {
                        stage: "stop",
                        after: budget,
                    });
                }
            }
            thread::sleep(EXIT_POLL);
        }
        Ok(())
    }

    // --- Exiting commands ---

    /// Starts the daemon unless one is already running.
    ///
    /// Exits the original process (`started` / `daemon already running` /
    /// `error: ..`). Returns only inside the freshly initialised daemon, whose
    /// caller then runs the daemon body.
    pub fn start(&mut self) {
        if !was_reborn() {
            if let DaemonState::Running(_) = self.state() {
                println!("daemon already running");
                process::exit(1);
            }
        }
        match self.reborn() {
            Ok(Rebirth::Parent(_)) => {
                println!("started");
                process::exit(0);
            }
            Ok(Rebirth::Daemon) => {}
            Err(err) => {
                println!("error: {err}");
                process::exit(1);
            }
        }
    }

    /// Sends `SIGTERM`, waits for the daemon to exit, prints `stopped`.
    pub fn stop(&self) -> ! {
        self.finish(Signal::Terminate, "stopped")
    }

    /// Sends `SIGKILL`, waits for the daemon to exit, prints `killed`.
    pub fn kill(&self) -> ! {
        self.finish(Signal::Kill, "killed")
    }

    /// Prints `running`, `stopped` or `crashed` and exits 0/1/1.
    pub fn status(&self) -> ! {
        let state = self.state();
        println!("{state}");
        process::exit(state.exit_code())
    }

    fn finish(&self, signal: Signal, done: &str) -> ! {
        match self.terminate(signal) {
            Ok(Some(_)) => {
                println!("{done}");
                process::exit(0)
            }
            Ok(None) => {
                println!("not running");
                process::exit(1)
            }
            Err(err) => {
                println!("error: {err}");
                process::exit(1)
            }
        }
    }
}
