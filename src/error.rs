use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Custom error type for rebirth.
/// Provides specific details about why the daemonization failed.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Standard IO errors (piping, descriptor duplication, etc.)
    #[error(transparent)]
    Io(#[from] io::Error),
    /// A pid, log or null-device file could not be opened.
    #[error("failed to open '{path}': {source}")]
    OpenFile {
        /// File that could not be opened.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The pid file lock is already held by another instance.
    #[error("daemon is already running (pid file '{path}' is locked)")]
    TargetLocked {
        /// Pid file guarding the running instance.
        path: PathBuf,
    },
    /// `/proc/<pid>/exe` could not be resolved.
    #[error("failed to resolve executable of pid {pid}: {source}")]
    ExecPath {
        /// Process that was inspected.
        pid: u32,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The child process image could not be started.
    #[error("failed to spawn '{path}': {source}")]
    Spawn {
        /// Executable that was launched.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The child is running but never received its configuration.
    ///
    /// The daemon state is unknown: the process with `pid` exists and must be
    /// inspected or terminated by the caller.
    #[error("child {pid} spawned but configuration handoff failed: {source}")]
    Handoff {
        /// Pid of the already running child.
        pid: u32,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The configuration could not be serialised for the handoff.
    #[error("failed to encode daemon context: {0}")]
    Encode(#[source] serde_json::Error),
    /// The handoff message could not be decoded in the child.
    #[error("failed to decode daemon context: {0}")]
    Decode(#[source] serde_json::Error),
    /// The child-side initialisation already ran in this process.
    #[error("invalid operation: daemon context already initialised in this process")]
    AlreadyInitialized,
    /// A descriptor or isolation syscall failed in the child.
    #[error("syscall '{call}' failed: {source}")]
    Syscall {
        /// Name of the failing call.
        call: &'static str,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// Failed to drop privileges (User/Group not found or permission denied).
    #[error("privilege drop error: {0}")]
    PrivilegeError(String),
    /// A configured timeout elapsed.
    #[error("{stage} timed out after {after:?}")]
    Timeout {
        /// Protocol stage that was waiting.
        stage: &'static str,
        /// Configured budget.
        after: Duration,
    },
    /// An inherited argument or environment entry is not valid UTF-8 and
    /// cannot travel in the handoff message.
    #[error("{what} {value:?} is not valid UTF-8")]
    NotUnicode {
        /// Which kind of entry was rejected.
        what: &'static str,
        /// The offending raw value.
        value: OsString,
    },
    /// The pid file does not hold a decimal process id.
    #[error("pid file '{path}' does not contain a valid pid")]
    InvalidPid {
        /// Pid file that was read.
        path: PathBuf,
    },
}

/// A specialized Result type for rebirth operations.
pub type DaemonResult<T> = Result<T, DaemonError>;
