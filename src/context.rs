use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::lockfile::LockFile;
use crate::types::Credential;

/// Default permissions for newly created pid and log files.
pub const DEFAULT_FILE_MODE: u32 = 0o640;

/// Describes the daemon to be reborn and carries it across the handoff.
///
/// Only the declarative configuration is serialised to the child. Runtime
/// resources (the pid lock, timeouts local to one invocation) are skipped on
/// the wire and re-acquired by descriptor number on the other side.
///
/// # Example
///
/// ```no_run
/// use rebirth::{Context, Rebirth};
///
/// let mut context = Context::new()
///     .pid_file("/run/ticker.pid")
///     .log_file("/var/log/ticker.log")
///     .work_dir("/");
///
/// match context.reborn()? {
///     Rebirth::Parent(child) => println!("daemon started as {}", child.id()),
///     Rebirth::Daemon => { /* daemon body */ }
/// }
/// # Ok::<(), rebirth::DaemonError>(())
/// ```
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Context {
    pub(crate) pid_file: Option<PathBuf>,
    pub(crate) pid_file_mode: Option<u32>,
    pub(crate) log_file: Option<PathBuf>,
    pub(crate) log_file_mode: Option<u32>,
    pub(crate) work_dir: Option<PathBuf>,
    pub(crate) chroot: Option<PathBuf>,
    pub(crate) env: Vec<String>,
    pub(crate) args: Vec<String>,
    pub(crate) credential: Option<Credential>,
    pub(crate) umask: Option<u32>,

    #[serde(skip)]
    pub(crate) handoff_timeout: Option<Duration>,
    #[serde(skip)]
    pub(crate) stop_timeout: Option<Duration>,
    #[serde(skip)]
    pub(crate) pid_lock: Option<LockFile>,
}

impl Context {
    /// Creates an empty configuration: no pid file, output discarded,
    /// environment and arguments inherited from the current process.
    pub fn new() -> Self {
        Self::default()
    }

    // --- Public Getters ---

    /// Returns the configured PID file path, if any.
    pub fn pid_file_path(&self) -> Option<&Path> {
        self.pid_file.as_deref()
    }

    /// Returns the configured log file path, if any.
    pub fn log_file_path(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }

    /// Returns the configured working directory, if any.
    pub fn working_directory_path(&self) -> Option<&Path> {
        self.work_dir.as_deref()
    }

    /// `KEY=VALUE` entries handed to the daemon (without the detachment marker).
    pub fn environment(&self) -> &[String] {
        &self.env
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn credential_ids(&self) -> Option<Credential> {
        self.credential
    }

    // --- Builder Methods ---

    /// Sets the path to the PID file.
    /// The parent creates and locks it; the daemon writes its pid into it.
    /// A relative path is resolved against the parent's current directory.
    pub fn pid_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.pid_file = Some(path.into());
        self
    }

    /// Permissions for a newly created PID file (default `0o640`).
    pub fn pid_file_mode(mut self, mode: u32) -> Self {
        self.pid_file_mode = Some(mode);
        self
    }

    /// Sends the daemon's stdout and stderr to this file, opened for append.
    pub fn log_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// Permissions for a newly created log file (default `0o640`).
    pub fn log_file_mode(mut self, mode: u32) -> Self {
        self.log_file_mode = Some(mode);
        self
    }

    /// Sets the working directory the daemon is started in.
    pub fn work_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.work_dir = Some(path.into());
        self
    }

    /// Sets a chroot directory for the daemon.
    pub fn chroot<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.chroot = Some(path.into());
        self
    }

    /// Replaces the daemon environment with `KEY=VALUE` entries.
    ///
    /// Left empty, the parent's environment is inherited at spawn time; an
    /// entry that is not valid UTF-8 then fails with
    /// [`DaemonError::NotUnicode`](crate::DaemonError::NotUnicode).
    pub fn env<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.env = entries.into_iter().map(Into::into).collect();
        self
    }

    /// Replaces the daemon's argument vector, program name included.
    ///
    /// Left empty, the parent's arguments are inherited under the same UTF-8
    /// rule as [`Context::env`].
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the identities assumed after the rebirth. Zero ids are ignored.
    pub fn credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Sets the umask for the daemon process. A zero mask is ignored.
    pub fn umask(mut self, mask: u32) -> Self {
        self.umask = Some(mask);
        self
    }

    /// Bounds the parent's write and the child's read of the handoff message.
    pub fn handoff_timeout(mut self, timeout: Duration) -> Self {
        self.handoff_timeout = Some(timeout);
        self
    }

    /// Bounds how long `stop`/`kill` wait for the daemon to exit.
    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = Some(timeout);
        self
    }

    /// Keeps local knobs and takes every declarative field from `wire`.
    pub(crate) fn adopt(&mut self, wire: Context) {
        let handoff_timeout = self.handoff_timeout;
        let stop_timeout = self.stop_timeout;
        *self = Context {
            handoff_timeout,
            stop_timeout,
            ..wire
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};
    use serde_json::Value;

    #[fixture]
    fn configured() -> Context {
        Context::new()
            .pid_file("/run/tickd.pid")
            .pid_file_mode(0o600)
            .log_file("/var/log/tickd.log")
            .work_dir("/srv")
            .chroot("/srv/jail")
            .env(["PATH=/usr/bin", "LANG=C.UTF-8"])
            .args(["tickd", "start", "--verbose"])
            .credential(Credential::new(1000, 100))
            .umask(0o027)
            .handoff_timeout(Duration::from_secs(5))
            .stop_timeout(Duration::from_secs(9))
    }

    #[rstest]
    fn wire_form_has_only_declarative_fields(configured: Context) {
        let value = serde_json::to_value(&configured).expect("encode");
        let Value::Object(map) = value else {
            panic!("context should encode as an object");
        };
        let mut keys: Vec<_> = map.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            [
                "args",
                "chroot",
                "credential",
                "env",
                "log_file",
                "log_file_mode",
                "pid_file",
                "pid_file_mode",
                "umask",
                "work_dir",
            ]
        );
    }

    #[rstest]
    fn declarative_fields_survive_the_wire(configured: Context) {
        let encoded = serde_json::to_string(&configured).expect("encode");
        let decoded: Context = serde_json::from_str(&encoded).expect("decode");

        assert_eq!(decoded.pid_file_path(), configured.pid_file_path());
        assert_eq!(decoded.pid_file_mode, Some(0o600));
        assert_eq!(decoded.log_file_path(), configured.log_file_path());
        assert_eq!(decoded.working_directory_path(), Some(Path::new("/srv")));
        assert_eq!(decoded.chroot, configured.chroot);
        assert_eq!(decoded.environment(), configured.environment());
        assert_eq!(decoded.arguments(), configured.arguments());
        assert_eq!(decoded.credential_ids(), Some(Credential::new(1000, 100)));
        assert_eq!(decoded.umask, Some(0o027));
        assert_eq!(
            serde_json::to_string(&decoded).expect("re-encode"),
            encoded
        );
        assert!(decoded.handoff_timeout.is_none());
        assert!(decoded.stop_timeout.is_none());
    }

    #[rstest]
    fn adopt_keeps_local_timeouts(configured: Context) {
        let mut local = Context::new().handoff_timeout(Duration::from_millis(250));
        let wire: Context =
            serde_json::from_str(&serde_json::to_string(&configured).expect("encode"))
                .expect("decode");
        local.adopt(wire);

        assert_eq!(local.handoff_timeout, Some(Duration::from_millis(250)));
        assert_eq!(local.stop_timeout, None);
        assert_eq!(local.pid_file_path(), Some(Path::new("/run/tickd.pid")));
        assert_eq!(local.arguments().len(), 3);
    }

    #[rstest]
    fn empty_context_encodes_nulls_and_empty_lists() {
        let encoded = serde_json::to_value(Context::new()).expect("encode");
        assert_eq!(encoded["pid_file"], Value::Null);
        assert_eq!(encoded["env"], Value::Array(Vec::new()));
    }
}
