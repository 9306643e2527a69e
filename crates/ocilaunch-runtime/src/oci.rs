use crate::cancel::CancelToken;
use crate::RuntimeError;
use ocilaunch_schema::LauncherConfig;
use std::ffi::OsString;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const RUNTIME_CANDIDATES: &[&str] = &["crun", "runc", "youki"];
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long the runtime gets to stop its container after SIGTERM.
pub const RUNTIME_STOP_GRACE: Duration = Duration::from_secs(5);

/// How the container process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Exited(i32),
    Signaled(i32),
}

impl ExitOutcome {
    pub fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Exited(code),
            (None, Some(signo)) => Self::Signaled(signo),
            (None, None) => Self::Exited(1),
        }
    }

    /// Shell-style exit code: a signal maps to 128 + signal number.
    pub fn code(self) -> i32 {
        match self {
            Self::Exited(code) => code,
            Self::Signaled(signo) => 128 + signo,
        }
    }

    pub fn success(self) -> bool {
        self == Self::Exited(0)
    }
}

/// Locate `name` on `PATH`, or check it directly when it contains a `/`.
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        return path.is_file().then_some(path);
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// The runtime binary to use: the configured one, or the first of crun,
/// runc and youki found on `PATH`.
pub fn find_runtime(config: &LauncherConfig) -> Result<PathBuf, RuntimeError> {
    if let Some(runtime) = &config.runtime {
        return find_in_path(runtime).ok_or_else(|| {
            RuntimeError::BackendUnavailable(format!("configured OCI runtime '{runtime}' not found"))
        });
    }
    RUNTIME_CANDIDATES
        .iter()
        .find_map(|c| find_in_path(c))
        .ok_or_else(|| {
            RuntimeError::BackendUnavailable("no OCI runtime found (crun/runc/youki)".to_owned())
        })
}

/// Wait for `child`. If `cancel` fires first, the child gets SIGTERM and
/// `grace` to clean up after itself before it is killed and reaped.
pub fn wait_cancellable(
    child: &mut Child,
    cancel: &CancelToken,
    grace: Duration,
) -> Result<ExitStatus, RuntimeError> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if cancel.is_cancelled() {
            stop_child(child, grace);
            return Err(RuntimeError::Cancelled);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

fn stop_child(child: &mut Child, grace: Duration) {
    let pid = child.id();
    warn!("launch cancelled, stopping pid {pid}");
    if let Err(e) = terminate(pid) {
        debug!("SIGTERM to pid {pid} failed: {e}");
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => std::thread::sleep(POLL_INTERVAL),
            Err(_) => break,
        }
    }

    warn!("pid {pid} still running after {grace:?}, killing it");
    let _ = child.kill();
    let _ = child.wait();
}

#[allow(unsafe_code)]
fn terminate(pid: u32) -> io::Result<()> {
    let pid =
        libc::pid_t::try_from(pid).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    // SAFETY: kill(2) only takes integers; `pid` is our own unreaped child.
    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// A command-line OCI runtime (runc-compatible CLI).
#[derive(Debug, Clone)]
pub struct OciRuntime {
    binary: PathBuf,
    systemd_cgroup: bool,
}

impl OciRuntime {
    pub fn new(binary: impl Into<PathBuf>, systemd_cgroup: bool) -> Self {
        Self {
            binary: binary.into(),
            systemd_cgroup,
        }
    }

    pub fn from_config(config: &LauncherConfig) -> Result<Self, RuntimeError> {
        Ok(Self::new(find_runtime(config)?, config.systemd_cgroups))
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Arguments for `run`: `[--systemd-cgroup] run --bundle <path> <id>`.
    pub fn run_args(&self, bundle: &Path, id: &str) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::with_capacity(5);
        if self.systemd_cgroup {
            args.push("--systemd-cgroup".into());
        }
        args.push("run".into());
        args.push("--bundle".into());
        args.push(bundle.as_os_str().to_owned());
        args.push(id.into());
        args
    }

    /// Run the container in the foreground with inherited stdio, then remove
    /// its runtime state.
    pub fn run(
        &self,
        bundle: &Path,
        id: &str,
        cancel: &CancelToken,
    ) -> Result<ExitOutcome, RuntimeError> {
        debug!(
            "invoking {} run --bundle {} {id}",
            self.binary.display(),
            bundle.display()
        );
        let mut child = Command::new(&self.binary)
            .args(self.run_args(bundle, id))
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                RuntimeError::ExecFailed(format!("{} run failed: {e}", self.binary.display()))
            })?;

        let result = wait_cancellable(&mut child, cancel, RUNTIME_STOP_GRACE);
        self.delete(id);
        let outcome = ExitOutcome::from_status(result?);
        debug!("container {id} finished: {outcome:?}");
        Ok(outcome)
    }

    /// Best-effort `delete --force`.
    pub fn delete(&self, id: &str) {
        let _ = Command::new(&self.binary)
            .args(["delete", "--force", id])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
}
