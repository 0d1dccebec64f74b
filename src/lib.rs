//! # rebirth
//!
//! **rebirth** turns a running foreground process into a detached daemon on
//! Linux without calling `fork()` on a possibly multi-threaded runtime.
//! Instead it re-executes the current binary with a marker in its
//! environment, attaches the log, null device and locked pid file at fixed
//! descriptor numbers, and hands the [`Context`] over a pipe. The same code
//! then runs twice: [`Context::reborn`] spawns the daemon in the original
//! process and finishes its initialisation in the daemon.
//!
//! Whether a pid file still points at a live instance is decided by
//! [`is_process_running`], which guards against recycled pids.
//!
//! The crate emits `tracing` events but never installs a subscriber.

#![cfg(unix)]

mod context;
mod error;
mod exec_path;
mod lifecycle;
mod liveness;
mod lockfile;
mod rebirth;
mod sys;
mod types;

// Re-export public types to keep the API flat
pub use context::{Context, DEFAULT_FILE_MODE};
pub use error::{DaemonError, DaemonResult};
pub use exec_path::get_exec_path;
pub use lifecycle::{DaemonState, Signal};
pub use liveness::{
    START_WINDOW, is_process_running, process_name, process_start_time, within_start_window,
};
pub use lockfile::{LockFile, read_pid_file};
pub use rebirth::{MARK_NAME, MARK_VALUE, Rebirth, was_reborn};
pub use types::Credential;
