//! End-to-end lifecycle of the `tickd` demo daemon.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command as StdCommand;
use std::thread::sleep;
use std::time::{Duration, Instant};

use assert_cmd::Command;
use predicates::prelude::*;
use rebirth::{get_exec_path, read_pid_file};
use rstest::{fixture, rstest};
use tempfile::TempDir;

const TIMEOUT: Duration = Duration::from_secs(10);

struct Daemon {
    _dir: TempDir,
    pid_file: PathBuf,
    log_file: PathBuf,
}

impl Daemon {
    fn tickd(&self, action: &str) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_tickd"));
        cmd.arg("--pid-file")
            .arg(&self.pid_file)
            .arg("--log-file")
            .arg(&self.log_file)
            .arg(action)
            .timeout(TIMEOUT);
        cmd
    }

    fn wait_for_pid(&self) -> u32 {
        wait_until("pid file to be written", || read_pid_file(&self.pid_file).ok())
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        // Only reap a leftover daemon, never whatever recycled its pid.
        let Ok(pid) = read_pid_file(&self.pid_file) else {
            return;
        };
        let tickd = fs::canonicalize(env!("CARGO_BIN_EXE_tickd")).ok();
        if get_exec_path(pid).ok() == tickd {
            let _ = StdCommand::new("kill").arg("-9").arg(pid.to_string()).status();
        }
    }
}

fn wait_until<T>(what: &str, mut probe: impl FnMut() -> Option<T>) -> T {
    let started = Instant::now();
    loop {
        if let Some(value) = probe() {
            return value;
        }
        assert!(started.elapsed() < TIMEOUT, "timed out waiting for {what}");
        sleep(Duration::from_millis(50));
    }
}

fn log_contains(path: &Path, needle: &str) -> bool {
    fs::read_to_string(path).is_ok_and(|log| log.contains(needle))
}

#[fixture]
fn daemon() -> Daemon {
    let dir = tempfile::tempdir().expect("tempdir");
    Daemon {
        pid_file: dir.path().join("tickd.pid"),
        log_file: dir.path().join("tickd.log"),
        _dir: dir,
    }
}

#[rstest]
fn start_status_stop_status(daemon: Daemon) {
    daemon
        .tickd("start")
        .assert()
        .success()
        .stdout(predicate::str::contains("started"));
    let pid = daemon.wait_for_pid();
    assert_ne!(pid, std::process::id());

    daemon
        .tickd("status")
        .assert()
        .code(0)
        .stdout(predicate::str::diff("running\n"));

    wait_until("daemon log output", || {
        log_contains(&daemon.log_file, "ticker started").then_some(())
    });

    daemon
        .tickd("stop")
        .assert()
        .code(0)
        .stdout(predicate::str::diff("stopped\n"));
    assert!(!daemon.pid_file.exists());

    daemon
        .tickd("status")
        .assert()
        .code(1)
        .stdout(predicate::str::diff("stopped\n"));
    assert!(log_contains(&daemon.log_file, "termination requested"));
}

#[rstest]
fn second_start_is_refused(daemon: Daemon) {
    daemon.tickd("start").assert().success();
    let pid = daemon.wait_for_pid();

    daemon
        .tickd("start")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("already running"));
    assert_eq!(read_pid_file(&daemon.pid_file).expect("pid kept"), pid);

    daemon
        .tickd("kill")
        .assert()
        .code(0)
        .stdout(predicate::str::diff("killed\n"));
    assert!(!daemon.pid_file.exists());
}

#[rstest]
fn externally_killed_daemon_is_crashed(daemon: Daemon) {
    daemon.tickd("start").assert().success();
    let pid = daemon.wait_for_pid();

    let killed = StdCommand::new("kill")
        .arg("-9")
        .arg(pid.to_string())
        .status()
        .expect("run kill");
    assert!(killed.success());

    wait_until("daemon to be reported crashed", || {
        let output = daemon.tickd("status").output().expect("status");
        (output.stdout == b"crashed\n").then_some(output)
    });
    daemon
        .tickd("status")
        .assert()
        .code(1)
        .stdout(predicate::str::diff("crashed\n"));
    assert!(daemon.pid_file.exists());

    daemon
        .tickd("stop")
        .assert()
        .code(1)
        .stdout(predicate::str::diff("not running\n"));
}

#[rstest]
fn stop_without_daemon_reports_not_running(daemon: Daemon) {
    daemon
        .tickd("stop")
        .assert()
        .code(1)
        .stdout(predicate::str::diff("not running\n"));
    daemon
        .tickd("status")
        .assert()
        .code(1)
        .stdout(predicate::str::diff("stopped\n"));
}

#[rstest]
fn relative_pid_file_is_released_by_the_daemon_itself(daemon: Daemon) {
    let launch_dir = daemon.pid_file.parent().expect("scratch dir").to_path_buf();
    let work_dir = tempfile::tempdir().expect("work dir");
    Command::new(env!("CARGO_BIN_EXE_tickd"))
        .current_dir(&launch_dir)
        .args(["--pid-file", "tickd.pid", "--log-file", "tickd.log", "--work-dir"])
        .arg(work_dir.path())
        .arg("start")
        .timeout(TIMEOUT)
        .assert()
        .success();
    let pid = daemon.wait_for_pid();
    // The SIGTERM handler is installed before this line is logged.
    wait_until("daemon log output", || {
        log_contains(&daemon.log_file, "ticker started").then_some(())
    });

    let terminated = StdCommand::new("kill")
        .arg("-TERM")
        .arg(pid.to_string())
        .status()
        .expect("run kill");
    assert!(terminated.success());

    wait_until("daemon to remove its pid file", || {
        (!daemon.pid_file.exists()).then_some(())
    });
    wait_until("release to be logged", || {
        log_contains(&daemon.log_file, "pid file removed").then_some(())
    });
    assert!(!work_dir.path().join("tickd.pid").exists());
    assert!(!log_contains(&daemon.log_file, "pid file already gone"));

    daemon
        .tickd("status")
        .assert()
        .code(1)
        .stdout(predicate::str::diff("stopped\n"));
}
