//! Exclusively locked pid files.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{DaemonError, DaemonResult};
use crate::sys::unix;

const TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::lockfile");

/// An open pid file guarded by an advisory exclusive `flock`.
///
/// The lock belongs to the open file description, so it survives being
/// inherited by a spawned child. Dropping a `LockFile` only closes this
/// handle; call [`LockFile::unlock`] or [`LockFile::remove`] to give the lock
/// up for every holder.
#[derive(Debug)]
pub struct LockFile {
    file: File,
    path: PathBuf,
}

impl LockFile {
    /// Opens (creating if needed) the pid file without truncating it.
    pub fn open<P: Into<PathBuf>>(path: P, mode: u32) -> DaemonResult<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(mode)
            .open(&path)
            .map_err(|source| DaemonError::OpenFile {
                path: path.clone(),
                source,
            })?;
        Ok(LockFile { file, path })
    }

    /// Wraps an already open (and usually already locked) descriptor.
    pub fn from_fd<P: Into<PathBuf>>(fd: OwnedFd, path: P) -> Self {
        LockFile {
            file: File::from(fd),
            path: path.into(),
        }
    }

    /// Returns the path backing this lock.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Takes the exclusive lock without blocking.
    ///
    /// Fails with [`DaemonError::TargetLocked`] when another open description
    /// already holds it.
    pub fn lock(&self) -> DaemonResult<()> {
        match unix::flock(self.file.as_fd(), libc::LOCK_EX | libc::LOCK_NB) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Err(DaemonError::TargetLocked {
                path: self.path.clone(),
            }),
            Err(err) => Err(DaemonError::Io(err)),
        }
    }

    pub fn unlock(&self) -> DaemonResult<()> {
        unix::flock(self.file.as_fd(), libc::LOCK_UN)?;
        Ok(())
    }

    /// Replaces the file content with the calling process id.
    pub fn write_pid(&mut self) -> DaemonResult<()> {
        let pid = std::process::id();
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        writeln!(self.file, "{pid}")?;
        self.file.sync_all()?;
        info!(target: TARGET, pid, file = %self.path.display(), "pid file written");
        Ok(())
    }

    pub fn read_pid(&mut self) -> DaemonResult<u32> {
        let mut content = String::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_string(&mut content)?;
        parse_pid(&content, &self.path)
    }

    /// Releases the lock and deletes the backing file.
    pub fn remove(self) -> DaemonResult<()> {
        self.unlock()?;
        let LockFile { file, path } = self;
        drop(file);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(target: TARGET, file = %path.display(), "pid file removed");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!(target: TARGET, file = %path.display(), "pid file already gone");
                Ok(())
            }
            Err(err) => Err(DaemonError::Io(err)),
        }
    }
}

impl AsFd for LockFile {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

/// Reads the pid recorded in `path` without taking the lock.
pub fn read_pid_file(path: &Path) -> DaemonResult<u32> {
    let content = fs::read_to_string(path).map_err(|source| DaemonError::OpenFile {
        path: path.to_path_buf(),
        source,
    })?;
    parse_pid(&content, path)
}

fn parse_pid(content: &str, path: &Path) -> DaemonResult<u32> {
    content
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|pid| *pid != 0)
        .ok_or_else(|| DaemonError::InvalidPid {
            path: path.to_path_buf(),
        })
}
