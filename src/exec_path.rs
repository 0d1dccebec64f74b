use std::ffi::OsStr;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use crate::error::{DaemonError, DaemonResult};

/// Marker the kernel appends to `/proc/<pid>/exe` once the mapped file is
/// unlinked or replaced on disk.
const DELETED_SUFFIX: &[u8] = b" (deleted)";

/// Returns the absolute path of the executable image `pid` is running.
///
/// Symlinks used to launch the binary are already resolved by the kernel,
/// and a trailing ` (deleted)` marker is stripped so that a daemon keeps
/// matching its own path after an in-place upgrade.
pub fn get_exec_path(pid: u32) -> DaemonResult<PathBuf> {
    let target = fs::read_link(proc_entry(pid, "exe"))
        .map_err(|source| DaemonError::ExecPath { pid, source })?;
    Ok(strip_deleted_suffix(target))
}

pub(crate) fn proc_entry(pid: u32, entry: &str) -> PathBuf {
    PathBuf::from(format!("/proc/{pid}/{entry}"))
}

fn strip_deleted_suffix(path: PathBuf) -> PathBuf {
    match path.as_os_str().as_bytes().strip_suffix(DELETED_SUFFIX) {
        Some(stripped) => PathBuf::from(OsStr::from_bytes(stripped)),
        None => path,
    }
}
