//! The parent-to-child handoff.
//!
//! The parent never forks its own (possibly multi-threaded) address space.
//! It re-executes its own binary with a marked environment and a fixed
//! descriptor table, then writes the [`Context`] as one line of JSON into a
//! pipe that the child reads as stdin:
//!
//! | fd | child sees                                  |
//! |----|---------------------------------------------|
//! | 0  | read end of the handoff pipe                |
//! | 1  | log file, or the null device                |
//! | 2  | same as 1                                   |
//! | 3  | null device, duplicated onto 0 after handoff |
//! | 4  | locked pid file (only if one is configured) |

use std::env;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{self, PipeReader, PipeWriter, Read, Write};
use std::mem::ManuallyDrop;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{self, Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::context::{Context, DEFAULT_FILE_MODE};
use crate::error::{DaemonError, DaemonResult};
use crate::exec_path::get_exec_path;
use crate::lockfile::LockFile;
use crate::sys::unix;

const TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::rebirth");

/// Name of the environment variable marking the reborn child.
pub const MARK_NAME: &str = "_REBIRTH_DAEMON";
/// Value of the detachment marker.
pub const MARK_VALUE: &str = "1";

const DEV_NULL: &str = "/dev/null";

const HANDOFF_FD: RawFd = 0;
const NULL_FD: RawFd = 3;
const PID_FD: RawFd = 4;
/// Staging copies live above every positional slot so that `dup2`ing them
/// into place can never clobber one another.
const STAGING_FLOOR: RawFd = 10;

/// Outcome of [`Context::reborn`].
#[derive(Debug)]
pub enum Rebirth {
    /// Returned in the original process: the daemon has been spawned.
    Parent(Child),
    /// Returned in the daemon: initialisation is complete, keep running.
    Daemon,
}

/// Returns `true` in the reborn child and `false` in the original process.
pub fn was_reborn() -> bool {
    env::var_os(MARK_NAME).is_some_and(|value| value == MARK_VALUE)
}

/// One-shot flag guarding the child-side initialisation.
pub(crate) struct InitGuard(AtomicBool);

impl InitGuard {
    pub(crate) const fn new() -> Self {
        InitGuard(AtomicBool::new(false))
    }

    /// Moves the guard to its terminal state, failing if it is already there.
    pub(crate) fn claim(&self) -> DaemonResult<()> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(drop)
            .map_err(|_| DaemonError::AlreadyInitialized)
    }

    pub(crate) fn is_claimed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

static CHILD_INIT: InitGuard = InitGuard::new();

/// What the parent hands to `Command`, derived from the context.
struct Prepared {
    exec_path: PathBuf,
    env: Vec<String>,
}

/// Parent-side resources. Dropping this closes every handle; the pid file
/// lock survives in the child through its inherited descriptor.
struct Resources {
    null: File,
    pid_lock: Option<LockFile>,
    log: Option<File>,
    reader: Option<PipeReader>,
    writer: PipeWriter,
}

impl Context {
    /// Runs the second copy of the current process in this context.
    ///
    /// In the original process this spawns the daemon and returns
    /// [`Rebirth::Parent`]. In the spawned daemon it decodes the handed-over
    /// configuration, rewires stdin, writes the pid file, applies umask,
    /// chroot and credentials, and returns [`Rebirth::Daemon`].
    ///
    /// A [`DaemonError::Handoff`] means the child exists but its state is
    /// unknown.
    pub fn reborn(&mut self) -> DaemonResult<Rebirth> {
        if was_reborn() {
            self.child().map(|()| Rebirth::Daemon)
        } else {
            self.parent().map(Rebirth::Parent)
        }
    }

    /// Removes the pid file from inside an initialised daemon.
    ///
    /// Does nothing in a process that was not reborn.
    pub fn release(&mut self) -> DaemonResult<()> {
        if !CHILD_INIT.is_claimed() {
            return Ok(());
        }
        if let Some(lock) = self.pid_lock.take() {
            lock.remove()?;
        }
        Ok(())
    }

    fn parent(&mut self) -> DaemonResult<Child> {
        let prepared = self.prepare_env()?;
        let mut resources = self.open_files()?;
        let mut message = serde_json::to_vec(&*self).map_err(DaemonError::Encode)?;
        message.push(b'\n');

        let child = match self.spawn(&prepared, &mut resources) {
            Ok(child) => child,
            Err(err) => {
                if let Some(lock) = resources.pid_lock.take() {
                    if let Err(cleanup) = lock.remove() {
                        warn!(target: TARGET, error = %cleanup, "failed to release pid file after spawn error");
                    }
                }
                return Err(err);
            }
        };
        let pid = child.id();
        info!(target: TARGET, pid, exe = %prepared.exec_path.display(), "daemon spawned");

        write_message(&resources.writer, &message, self.handoff_timeout)
            .map_err(|source| DaemonError::Handoff { pid, source })?;
        info!(target: TARGET, pid, bytes = message.len(), "configuration handed off");
        Ok(child)
    }

    /// Resolves the executable and fills unset args/env from this process.
    /// The marker goes only into the copy handed to `Command`.
    ///
    /// Relative pid and log file paths become absolute against the parent's
    /// current directory; the daemon runs from its own work dir.
    fn prepare_env(&mut self) -> DaemonResult<Prepared> {
        let exec_path = get_exec_path(process::id())?;
        for path in [&mut self.pid_file, &mut self.log_file].into_iter().flatten() {
            if path.is_relative() {
                *path = std::path::absolute(&*path)?;
            }
        }
        if self.args.is_empty() {
            self.args = unicode_args(env::args_os())?;
        }
        if self.env.is_empty() {
            self.env = unicode_env(env::vars_os())?;
        }
        let mut env = self.env.clone();
        env.push(format!("{MARK_NAME}={MARK_VALUE}"));
        Ok(Prepared { exec_path, env })
    }

    /// Opens, in order: null device, locked pid file, log file, pipe.
    /// Anything opened before a failure is closed on return.
    fn open_files(&mut self) -> DaemonResult<Resources> {
        let pid_mode = *self.pid_file_mode.get_or_insert(DEFAULT_FILE_MODE);
        let log_mode = *self.log_file_mode.get_or_insert(DEFAULT_FILE_MODE);

        let null = OpenOptions::new()
            .read(true)
            .write(true)
            .open(DEV_NULL)
            .map_err(|source| DaemonError::OpenFile {
                path: PathBuf::from(DEV_NULL),
                source,
            })?;

        let pid_lock = match &self.pid_file {
            Some(path) => {
                let lock = LockFile::open(path, pid_mode)?;
                lock.lock()?;
                Some(lock)
            }
            None => None,
        };

        let log = match &self.log_file {
            Some(path) => Some(
                OpenOptions::new()
                    .append(true)
                    .create(true)
                    .mode(log_mode)
                    .open(path)
                    .map_err(|source| DaemonError::OpenFile {
                        path: path.clone(),
                        source,
                    })?,
            ),
            None => None,
        };

        let (reader, writer) = io::pipe()?;
        Ok(Resources {
            null,
            pid_lock,
            log,
            reader: Some(reader),
            writer,
        })
    }

    fn spawn(&self, prepared: &Prepared, resources: &mut Resources) -> DaemonResult<Child> {
        let reader = resources
            .reader
            .take()
            .ok_or_else(|| io::Error::other("handoff pipe already consumed"))?;
        let output = resources.log.as_ref().unwrap_or(&resources.null);

        // Staged above the positional slots; closed in the parent on return.
        let null_copy = unix::dup_above(resources.null.as_fd(), STAGING_FLOOR)?;
        let pid_copy = resources
            .pid_lock
            .as_ref()
            .map(|lock| unix::dup_above(lock.as_fd(), STAGING_FLOOR))
            .transpose()?;
        let null_raw = null_copy.as_raw_fd();
        let pid_raw = pid_copy.as_ref().map(AsRawFd::as_raw_fd);

        let mut command = Command::new(&prepared.exec_path);
        if let Some((arg0, rest)) = self.args.split_first() {
            command.arg0(arg0).args(rest);
        }
        command
            .env_clear()
            .envs(
                prepared
                    .env
                    .iter()
                    .filter_map(|entry| entry.split_once('='))
                    .filter(|(key, _)| !key.is_empty()),
            )
            .stdin(Stdio::from(reader))
            .stdout(output.try_clone()?)
            .stderr(output.try_clone()?);
        if let Some(dir) = &self.work_dir {
            command.current_dir(dir);
        }

        // SAFETY: the closure runs between fork and exec and only performs
        // async-signal-safe syscalls on descriptors that are open in the
        // parent for the duration of `spawn`.
        unsafe {
            command.pre_exec(move || {
                unix::setsid()?;
                unix::dup2(null_raw, NULL_FD)?;
                if let Some(fd) = pid_raw {
                    unix::dup2(fd, PID_FD)?;
                }
                Ok(())
            });
        }

        let child = command.spawn().map_err(|source| DaemonError::Spawn {
            path: prepared.exec_path.clone(),
            source,
        })?;
        // The command owns the pipe's read end; dropping it leaves the child
        // as the only reader.
        drop(command);
        drop(null_copy);
        drop(pid_copy);
        Ok(child)
    }

    fn child(&mut self) -> DaemonResult<()> {
        CHILD_INIT.claim()?;

        let message = read_message(self.handoff_timeout)?;
        let wire: Context = serde_json::from_slice(&message).map_err(DaemonError::Decode)?;
        self.adopt(wire);

        unix::close(HANDOFF_FD).map_err(|source| DaemonError::Syscall { call: "close", source })?;
        unix::dup2(NULL_FD, HANDOFF_FD).map_err(|source| DaemonError::Syscall { call: "dup2", source })?;

        if let Some(path) = &self.pid_file {
            // SAFETY: descriptor 4 was attached by the parent for exactly this
            // purpose and nothing else in this process owns it.
            let fd = unsafe { OwnedFd::from_raw_fd(PID_FD) };
            let mut lock = LockFile::from_fd(fd, path.clone());
            lock.write_pid()?;
            self.pid_lock = Some(lock);
        }

        if let Some(mask) = self.umask.filter(|mask| *mask != 0) {
            unix::umask(mask);
        }
        if let Some(root) = &self.chroot {
            unix::chroot(root).map_err(|source| DaemonError::Syscall { call: "chroot", source })?;
        }
        if let Some(credential) = self.credential {
            credential.apply()?;
        }

        info!(target: TARGET, pid = process::id(), "daemon initialised");
        Ok(())
    }
}

/// The handoff is JSON, so inherited arguments must be valid UTF-8.
fn unicode_args(args: impl Iterator<Item = OsString>) -> DaemonResult<Vec<String>> {
    args.map(|arg| {
        arg.into_string()
            .map_err(|value| DaemonError::NotUnicode { what: "argument", value })
    })
    .collect()
}

fn unicode_env(vars: impl Iterator<Item = (OsString, OsString)>) -> DaemonResult<Vec<String>> {
    vars.map(|(key, value)| {
        let key = key
            .into_string()
            .map_err(|value| DaemonError::NotUnicode { what: "environment name", value })?;
        let value = value
            .into_string()
            .map_err(|value| DaemonError::NotUnicode { what: "environment value", value })?;
        Ok(format!("{key}={value}"))
    })
    .collect()
}

/// Writes the whole message, in `PIPE_BUF` chunks when a timeout is set so
/// that no single write can block past the deadline.
fn write_message(writer: &PipeWriter, message: &[u8], timeout: Option<Duration>) -> io::Result<()> {
    let mut writer = writer;
    let Some(budget) = timeout else {
        writer.write_all(message)?;
        return writer.flush();
    };
    let deadline = Instant::now() + budget;
    let mut pending = message;
    while !pending.is_empty() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if !unix::wait_writable(writer.as_fd(), remaining)? {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("handoff write timed out after {budget:?}"),
            ));
        }
        let (chunk, _) = pending.split_at(pending.len().min(unix::PIPE_BUF));
        match writer.write(chunk) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(written) => pending = pending.get(written..).unwrap_or_default(),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    writer.flush()
}

/// Reads stdin up to the first newline or EOF.
fn read_message(timeout: Option<Duration>) -> DaemonResult<Vec<u8>> {
    // SAFETY: descriptor 0 is the handoff pipe. ManuallyDrop keeps it open so
    // it can be closed explicitly during the rewire step.
    let mut input = ManuallyDrop::new(unsafe { File::from_raw_fd(HANDOFF_FD) });
    let deadline = timeout.map(|budget| (budget, Instant::now() + budget));
    let mut message = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Some((budget, deadline)) = deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !unix::wait_readable(input.as_fd(), remaining)? {
                return Err(DaemonError::Timeout {
                    stage: "handoff read",
                    after: budget,
                });
            }
        }
        let read = match input.read(&mut chunk) {
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        let received = chunk.get(..read).unwrap_or_default();
        if received.is_empty() {
            return Ok(message);
        }
        if let Some(end) = received.iter().position(|byte| *byte == b'\n') {
            message.extend_from_slice(received.get(..end).unwrap_or_default());
            return Ok(message);
        }
        message.extend_from_slice(received);
    }
}
