use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::Duration;

// =========================================================================
// Descriptors
// =========================================================================

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn path_to_cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "path contains an interior NUL byte",
        )
    })
}

pub(crate) fn close(fd: RawFd) -> io::Result<()> {
    cvt(unsafe { libc::close(fd) }).map(drop)
}

/// Async-signal-safe: callable between fork and exec.
pub(crate) fn dup2(src: RawFd, dst: RawFd) -> io::Result<()> {
    cvt(unsafe { libc::dup2(src, dst) }).map(drop)
}

/// Async-signal-safe: callable between fork and exec.
pub(crate) fn setsid() -> io::Result<()> {
    cvt(unsafe { libc::setsid() }).map(drop)
}

/// Duplicates `fd` onto the lowest free descriptor at or above `floor`.
///
/// The copy is close-on-exec, so it never leaks into a spawned image unless
/// it is explicitly `dup2`ed into place.
pub(crate) fn dup_above(fd: BorrowedFd<'_>, floor: RawFd) -> io::Result<OwnedFd> {
    let raw = cvt(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, floor) })?;
    // SAFETY: fcntl just returned a fresh descriptor that nothing else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

pub(crate) fn flock(fd: BorrowedFd<'_>, operation: libc::c_int) -> io::Result<()> {
    loop {
        match cvt(unsafe { libc::flock(fd.as_raw_fd(), operation) }) {
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            result => return result.map(drop),
        }
    }
}

/// Waits until `fd` is readable (or hung up). Returns `false` on timeout.
pub(crate) fn wait_readable(fd: BorrowedFd<'_>, timeout: Duration) -> io::Result<bool> {
    poll_one(fd, libc::POLLIN, timeout)
}

/// Waits until `fd` accepts at least `PIPE_BUF` bytes. Returns `false` on timeout.
pub(crate) fn wait_writable(fd: BorrowedFd<'_>, timeout: Duration) -> io::Result<bool> {
    poll_one(fd, libc::POLLOUT, timeout)
}

fn poll_one(fd: BorrowedFd<'_>, events: libc::c_short, timeout: Duration) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events,
        revents: 0,
    };
    let millis = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
    loop {
        match cvt(unsafe { libc::poll(&mut pfd, 1, millis) }) {
            Ok(ready) => return Ok(ready > 0),
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(error),
        }
    }
}

/// Largest write the kernel guarantees to be atomic on a pipe.
pub(crate) const PIPE_BUF: usize = libc::PIPE_BUF;

// =========================================================================
// Identity & isolation
// =========================================================================

/// Sets the file mode creation mask, returning the previous one.
pub(crate) fn umask(mask: u32) -> u32 {
    unsafe { libc::umask(mask as libc::mode_t) as u32 }
}

pub(crate) fn chroot(path: &Path) -> io::Result<()> {
    let root = path_to_cstring(path)?;
    cvt(unsafe { libc::chroot(root.as_ptr()) })?;
    // Always change dir to "/" after chroot
    cvt(unsafe { libc::chdir(c"/".as_ptr()) }).map(drop)
}

pub(crate) fn setgid(gid: u32) -> io::Result<()> {
    cvt(unsafe { libc::setgid(gid as libc::gid_t) }).map(drop)
}

pub(crate) fn setuid(uid: u32) -> io::Result<()> {
    cvt(unsafe { libc::setuid(uid as libc::uid_t) }).map(drop)
}

/// Looks `name` up in the password database.
pub(crate) fn user_id(name: &str) -> io::Result<Option<u32>> {
    let cname = CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "user name contains NUL"))?;
    let pwd = unsafe { libc::getpwnam(cname.as_ptr()) };
    if pwd.is_null() {
        return Ok(None);
    }
    Ok(Some(unsafe { (*pwd).pw_uid }))
}

/// Looks `name` up in the group database.
pub(crate) fn group_id(name: &str) -> io::Result<Option<u32>> {
    let cname = CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "group name contains NUL"))?;
    let grp = unsafe { libc::getgrnam(cname.as_ptr()) };
    if grp.is_null() {
        return Ok(None);
    }
    Ok(Some(unsafe { (*grp).gr_gid }))
}

// =========================================================================
// Processes
// =========================================================================

pub(crate) fn kill(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    cvt(unsafe { libc::kill(pid, signal) }).map(drop)
}

pub(crate) fn clock_ticks_per_second() -> io::Result<u64> {
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks <= 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ticks as u64)
}
