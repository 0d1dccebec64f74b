//! Decides whether a recorded pid still belongs to a live instance of this
//! program.
//!
//! Pid numbers are recycled, so a stale pid file can point at an unrelated
//! process. Every question that cannot be answered is answered "not running".

use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::exec_path::{get_exec_path, proc_entry};
use crate::sys::unix;

const TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::liveness");

/// Maximum distance between a pid file's mtime and its process' start time
/// for the two to be considered the same daemon.
pub const START_WINDOW: Duration = Duration::from_secs(60);

/// The kernel truncates `comm` to `TASK_COMM_LEN - 1` bytes.
const COMM_LEN: usize = 15;

/// Returns `true` when `pid` is running the same executable as the caller.
///
/// The executable paths of both processes are compared first. If they differ
/// and `pid_file_hint` is given, the process' short name is compared with the
/// caller's base name, and failing that the pid file's modification time is
/// compared with the process' start time (see [`within_start_window`]).
pub fn is_process_running(pid: u32, pid_file_hint: Option<&Path>) -> bool {
    if pid == 0 {
        return false;
    }
    let own = match get_exec_path(std::process::id()) {
        Ok(path) => path,
        Err(error) => {
            debug!(target: TARGET, %error, "own executable unresolvable");
            return false;
        }
    };
    let theirs = match get_exec_path(pid) {
        Ok(path) => path,
        Err(error) => {
            debug!(target: TARGET, pid, %error, "target executable unresolvable");
            return false;
        }
    };
    if own == theirs {
        return true;
    }
    let Some(hint) = pid_file_hint else {
        debug!(
            target: TARGET,
            pid,
            own = %own.display(),
            theirs = %theirs.display(),
            "executable mismatch"
        );
        return false;
    };

    if let (Ok(name), Some(base)) = (process_name(pid), own.file_name()) {
        if name.as_bytes() == truncate_comm(base.as_encoded_bytes()) {
            debug!(target: TARGET, pid, name = %name, "matched by process name");
            return true;
        }
    }
    match (pid_file_mtime(hint), process_start_time(pid)) {
        (Ok(written), Ok(started)) => {
            let matched = within_start_window(written, started);
            debug!(target: TARGET, pid, matched, "start time heuristic");
            matched
        }
        _ => false,
    }
}

/// Reports whether two instants are strictly less than [`START_WINDOW`]
/// apart, in either direction.
pub fn within_start_window(a: SystemTime, b: SystemTime) -> bool {
    let distance = match a.duration_since(b) {
        Ok(ahead) => ahead,
        Err(behind) => behind.duration(),
    };
    distance < START_WINDOW
}

/// Returns the short executable name (`comm`) of `pid`.
pub fn process_name(pid: u32) -> io::Result<String> {
    let stat = fs::read_to_string(proc_entry(pid, "stat"))?;
    parse_comm(&stat)
        .map(str::to_owned)
        .ok_or_else(|| malformed_stat(pid))
}

/// Returns the wall-clock instant at which `pid` was started.
pub fn process_start_time(pid: u32) -> io::Result<SystemTime> {
    let stat = fs::read_to_string(proc_entry(pid, "stat"))?;
    let ticks = parse_start_ticks(&stat).ok_or_else(|| malformed_stat(pid))?;
    let boot = boot_time()?;
    let hz = unix::clock_ticks_per_second()?;
    let since_boot =
        Duration::from_secs(ticks / hz) + Duration::from_nanos((ticks % hz) * 1_000_000_000 / hz);
    Ok(boot + since_boot)
}

/// Treats zombies as exited: they no longer run anything.
pub(crate) fn has_exited(pid: u32) -> bool {
    match fs::read_to_string(proc_entry(pid, "stat")) {
        Ok(stat) => matches!(parse_state(&stat), Some('Z' | 'X') | None),
        Err(_) => true,
    }
}

fn pid_file_mtime(path: &Path) -> io::Result<SystemTime> {
    fs::metadata(path)?.modified()
}

fn boot_time() -> io::Result<SystemTime> {
    let stat = fs::read_to_string("/proc/stat")?;
    let seconds = stat
        .lines()
        .find_map(|line| line.strip_prefix("btime "))
        .and_then(|value| value.trim().parse::<u64>().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no btime in /proc/stat"))?;
    Ok(UNIX_EPOCH + Duration::from_secs(seconds))
}

fn malformed_stat(pid: u32) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("malformed /proc/{pid}/stat"),
    )
}

/// `comm` sits in parentheses as the second field and may itself contain
/// spaces or parentheses, so it spans from the first `(` to the last `)`.
fn parse_comm(stat: &str) -> Option<&str> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    stat.get(open + 1..close)
}

/// Fields after `comm`, starting with field 3 (`state`).
fn fields_after_comm(stat: &str) -> Option<impl Iterator<Item = &str>> {
    let close = stat.rfind(')')?;
    Some(stat.get(close + 1..)?.split_whitespace())
}

fn parse_state(stat: &str) -> Option<char> {
    fields_after_comm(stat)?.next()?.chars().next()
}

/// `starttime` is field 22, in clock ticks since boot.
fn parse_start_ticks(stat: &str) -> Option<u64> {
    fields_after_comm(stat)?.nth(22 - 3)?.parse().ok()
}

fn truncate_comm(name: &[u8]) -> &[u8] {
    name.get(..COMM_LEN).unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const STAT: &str = "4242 (tick d) S 1 4242 4242 0 -1 4194368 101 0 0 0 3 1 0 0 20 0 1 0 987654 12345678 200 18446744073709551615";

    #[rstest]
    #[case(STAT, Some("tick d"))]
    #[case("1 (systemd) S 0", Some("systemd"))]
    #[case("7 (a) b)) R 1", Some("a) b)"))]
    #[case("garbage", None)]
    fn extracts_comm(#[case] stat: &str, #[case] expected: Option<&str>) {
        assert_eq!(parse_comm(stat), expected);
    }

    #[rstest]
    fn extracts_state_and_start_ticks() {
        assert_eq!(parse_state(STAT), Some('S'));
        assert_eq!(parse_start_ticks(STAT), Some(987_654));
        assert_eq!(parse_start_ticks("1 (x) S 0"), None);
    }

    #[rstest]
    #[case(59, true)]
    #[case(60, false)]
    #[case(61, false)]
    #[case(0, true)]
    fn start_window_is_strict(#[case] seconds: u64, #[case] expected: bool) {
        let started = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let written = started + Duration::from_secs(seconds);
        assert_eq!(within_start_window(written, started), expected);
        assert_eq!(within_start_window(started, written), expected);
    }

    #[rstest]
    #[case(b"tickd".as_slice(), b"tickd".as_slice())]
    #[case(b"a-rather-long-daemon-name".as_slice(), b"a-rather-long-d".as_slice())]
    fn truncates_like_the_kernel(#[case] name: &[u8], #[case] expected: &[u8]) {
        assert_eq!(truncate_comm(name), expected);
    }

    #[rstest]
    fn own_process_is_running() {
        assert!(is_process_running(std::process::id(), None));
    }

    #[rstest]
    #[case(0)]
    #[case(4_194_304)]
    fn absent_process_is_not_running(#[case] pid: u32) {
        assert!(!is_process_running(pid, None));
        assert!(!is_process_running(pid, Some(Path::new("/nonexistent.pid"))));
    }

    #[rstest]
    fn own_process_has_not_exited() {
        assert!(!has_exited(std::process::id()));
        assert!(has_exited(4_194_304));
    }

    #[rstest]
    fn own_start_time_is_in_the_past() {
        let started = process_start_time(std::process::id()).expect("own stat");
        assert!(started <= SystemTime::now() + Duration::from_secs(1));
        assert!(process_name(std::process::id()).is_ok());
    }
}
