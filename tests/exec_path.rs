//! Executable resolution for processes whose binary changed on disk.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::thread::sleep;
use std::time::Duration;

use rebirth::get_exec_path;
use rstest::rstest;
use tempfile::tempdir;

/// Another thread may briefly hold the freshly copied binary open for
/// writing in a forked child, which makes exec fail with ETXTBSY.
fn spawn_sleeper(binary: &Path) -> Child {
    for _ in 0..20 {
        match Command::new(binary).arg("30").spawn() {
            Ok(child) => return child,
            Err(err) if err.kind() == io::ErrorKind::ExecutableFileBusy => {
                sleep(Duration::from_millis(50))
            }
            Err(err) => panic!("failed to spawn {}: {err}", binary.display()),
        }
    }
    panic!("{} stayed busy", binary.display());
}

fn sleep_binary() -> io::Result<PathBuf> {
    ["/bin/sleep", "/usr/bin/sleep"]
        .into_iter()
        .map(Path::new)
        .find(|path| path.exists())
        .map(Path::to_path_buf)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no sleep binary"))
}

#[rstest]
fn deleted_binary_resolves_without_marker() {
    let dir = tempdir().expect("tempdir");
    let copy = fs::canonicalize(dir.path())
        .expect("canonical tempdir")
        .join("sleeper");
    fs::copy(sleep_binary().expect("sleep"), &copy).expect("copy sleep");

    let mut child = spawn_sleeper(&copy);
    let before = get_exec_path(child.id()).expect("resolve before");
    fs::remove_file(&copy).expect("unlink binary");
    let after = get_exec_path(child.id()).expect("resolve after");

    child.kill().expect("kill");
    child.wait().expect("reap");

    assert_eq!(before, copy);
    assert_eq!(after, copy);
}

#[rstest]
fn replaced_binary_resolves_to_the_same_path() {
    let dir = tempdir().expect("tempdir");
    let copy = fs::canonicalize(dir.path())
        .expect("canonical tempdir")
        .join("sleeper");
    let source = sleep_binary().expect("sleep");
    fs::copy(&source, &copy).expect("copy sleep");

    let mut child = spawn_sleeper(&copy);
    // An upgrade: write the new image next to it and rename over the old one.
    let staged = copy.with_extension("new");
    fs::copy(&source, &staged).expect("stage upgrade");
    fs::rename(&staged, &copy).expect("swap binary");
    let after = get_exec_path(child.id()).expect("resolve after upgrade");

    child.kill().expect("kill");
    child.wait().expect("reap");

    assert_eq!(after, copy);
}
