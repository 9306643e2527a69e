//! Running the finalized bundle.
//!
//! Host root invokes the OCI runtime directly. Anyone else re-executes the
//! launcher inside a fresh user namespace (`oci run --bundle <dir> <id>`)
//! whose outer ID maps are written from the parent with newuidmap and
//! newgidmap; the re-executed child then invokes the runtime as namespace
//! root.

use crate::cancel::CancelToken;
use crate::host::HostIdentity;
use crate::idmap::{namespace_mapping, IdentityMapping};
use crate::oci::{find_in_path, wait_cancellable, ExitOutcome, OciRuntime};
use crate::RuntimeError;
use ocilaunch_schema::{LauncherConfig, LinuxIdMapping};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Marks a re-executed launcher that must wait for its ID maps.
pub const USERNS_CHILD_ENV: &str = "OCILAUNCH_USERNS_CHILD";

const MAPPING_POLL_INTERVAL: Duration = Duration::from_millis(10);
pub const MAPPING_TIMEOUT: Duration = Duration::from_secs(10);
/// Must exceed `RUNTIME_STOP_GRACE`: on SIGTERM the re-executed launcher
/// stops its runtime and deletes the container before exiting.
const REEXEC_STOP_GRACE: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStrategy {
    Direct,
    NamespacedReexec,
}

impl ExecutionStrategy {
    /// Host root runs directly; everyone else needs a user namespace.
    pub fn select(host_uid: u32) -> Self {
        if host_uid == 0 {
            Self::Direct
        } else {
            Self::NamespacedReexec
        }
    }
}

/// Starts an OCI runtime against a finalized bundle.
pub trait RuntimeInvoker: Send + Sync {
    fn run_direct(
        &self,
        bundle: &Path,
        container_id: &str,
        cancel: &CancelToken,
    ) -> Result<ExitOutcome, RuntimeError>;

    /// Run inside a new user namespace mapped with `outer`.
    fn run_namespaced(
        &self,
        bundle: &Path,
        container_id: &str,
        outer: &IdentityMapping,
        cancel: &CancelToken,
    ) -> Result<ExitOutcome, RuntimeError>;
}

/// Dispatch a launch according to `strategy`.
pub fn execute(
    strategy: ExecutionStrategy,
    invoker: &dyn RuntimeInvoker,
    bundle: &Path,
    container_id: &str,
    host: &HostIdentity,
    config: &LauncherConfig,
    cancel: &CancelToken,
) -> Result<ExitOutcome, RuntimeError> {
    debug!("execution strategy: {strategy:?}");
    match strategy {
        ExecutionStrategy::Direct => invoker.run_direct(bundle, container_id, cancel),
        ExecutionStrategy::NamespacedReexec => {
            let outer = namespace_mapping(host, config)?;
            invoker.run_namespaced(bundle, container_id, &outer, cancel)
        }
    }
}

/// Arguments for newuidmap/newgidmap: `<pid> <container> <host> <size> ...`.
pub fn id_map_args(pid: u32, mappings: &[LinuxIdMapping]) -> Vec<String> {
    std::iter::once(pid.to_string())
        .chain(mappings.iter().flat_map(|m| {
            [
                m.container_id.to_string(),
                m.host_id.to_string(),
                m.size.to_string(),
            ]
        }))
        .collect()
}

fn write_id_map(helper: &Path, pid: u32, mappings: &[LinuxIdMapping]) -> Result<(), RuntimeError> {
    let output = Command::new(helper)
        .args(id_map_args(pid, mappings))
        .stdin(Stdio::null())
        .output()
        .map_err(|e| {
            RuntimeError::MappingResolution(format!("failed to run {}: {e}", helper.display()))
        })?;
    if !output.status.success() {
        return Err(RuntimeError::MappingResolution(format!(
            "{} failed: {}",
            helper.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Block until `uid_map` (normally `/proc/self/uid_map`) has been written,
/// giving up after `timeout`.
pub fn wait_for_userns_mapping(uid_map: &Path, timeout: Duration) -> Result<(), RuntimeError> {
    let deadline = Instant::now() + timeout;
    loop {
        let content = std::fs::read_to_string(uid_map)?;
        if !content.trim().is_empty() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(RuntimeError::MappingResolution(
                "timed out waiting for user namespace ID mappings".to_owned(),
            ));
        }
        std::thread::sleep(MAPPING_POLL_INTERVAL);
    }
}

/// Whether this process is a re-executed launcher waiting for ID maps.
pub fn is_userns_child() -> bool {
    std::env::var_os(USERNS_CHILD_ENV).is_some_and(|v| v == "1")
}

/// Invokes the real OCI runtime on the host.
pub struct HostInvoker {
    config: Arc<LauncherConfig>,
    config_file: Option<PathBuf>,
}

impl HostInvoker {
    pub fn new(config: Arc<LauncherConfig>) -> Self {
        Self {
            config,
            config_file: None,
        }
    }

    /// Configuration file handed to the re-executed child.
    #[must_use]
    pub fn with_config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_file = Some(path.into());
        self
    }

    fn helper(name: &str) -> Result<PathBuf, RuntimeError> {
        find_in_path(name)
            .ok_or_else(|| RuntimeError::MappingResolution(format!("{name} not found")))
    }

    #[allow(unsafe_code)]
    fn spawn_in_userns(&self, bundle: &Path, container_id: &str) -> Result<Child, RuntimeError> {
        let exe = std::env::current_exe()?;
        let mut cmd = Command::new(exe);
        if let Some(file) = &self.config_file {
            cmd.arg("--config").arg(file);
        }
        cmd.args(["oci", "run", "--bundle"])
            .arg(bundle)
            .arg(container_id)
            .env(USERNS_CHILD_ENV, "1")
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        // SAFETY: the closure runs between fork and exec and only calls
        // unshare(2), which is async-signal-safe.
        unsafe {
            cmd.pre_exec(|| {
                if libc::unshare(libc::CLONE_NEWUSER) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        cmd.spawn()
            .map_err(|e| RuntimeError::ExecFailed(format!("failed to re-execute launcher: {e}")))
    }
}

impl RuntimeInvoker for HostInvoker {
    fn run_direct(
        &self,
        bundle: &Path,
        container_id: &str,
        cancel: &CancelToken,
    ) -> Result<ExitOutcome, RuntimeError> {
        OciRuntime::from_config(&self.config)?.run(bundle, container_id, cancel)
    }

    fn run_namespaced(
        &self,
        bundle: &Path,
        container_id: &str,
        outer: &IdentityMapping,
        cancel: &CancelToken,
    ) -> Result<ExitOutcome, RuntimeError> {
        let newuidmap = Self::helper(&self.config.newuidmap)?;
        let newgidmap = Self::helper(&self.config.newgidmap)?;

        let mut child = self.spawn_in_userns(bundle, container_id)?;
        let pid = child.id();
        info!("re-executed launcher in user namespace (pid {pid})");

        let mapped = write_id_map(&newuidmap, pid, &outer.uid)
            .and_then(|()| write_id_map(&newgidmap, pid, &outer.gid));
        if let Err(e) = mapped {
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }

        let status = wait_cancellable(&mut child, cancel, REEXEC_STOP_GRACE)?;
        Ok(ExitOutcome::from_status(status))
    }
}
