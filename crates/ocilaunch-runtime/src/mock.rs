use crate::bundle::{write_config, Bundle, BundleProvider};
use crate::cache::ImageCache;
use crate::cancel::CancelToken;
use crate::execution::{ExecutionStrategy, RuntimeInvoker};
use crate::idmap::IdentityMapping;
use crate::oci::ExitOutcome;
use crate::RuntimeError;
use ocilaunch_schema::{ImageSpec, Spec, SysContext};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One recorded runtime invocation.
#[derive(Debug, Clone)]
pub struct MockRun {
    pub strategy: ExecutionStrategy,
    pub bundle: PathBuf,
    pub container_id: String,
    /// `config.json` as it was at invocation time.
    pub spec: Spec,
    pub outer: Option<IdentityMapping>,
    /// `rootfs/etc/passwd` and `rootfs/etc/group` at invocation time.
    pub passwd: Option<String>,
    pub group: Option<String>,
}

/// Runtime invoker that records what it was asked to run instead of
/// starting a container.
pub struct MockRuntime {
    exit: ExitOutcome,
    runs: Mutex<Vec<MockRun>>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self {
            exit: ExitOutcome::Exited(0),
            runs: Mutex::new(Vec::new()),
        }
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `exit` for every run.
    pub fn exiting_with(exit: ExitOutcome) -> Self {
        Self {
            exit,
            ..Self::default()
        }
    }

    pub fn runs(&self) -> Vec<MockRun> {
        self.runs.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn record(
        &self,
        strategy: ExecutionStrategy,
        bundle: &Path,
        container_id: &str,
        outer: Option<&IdentityMapping>,
        cancel: &CancelToken,
    ) -> Result<ExitOutcome, RuntimeError> {
        if cancel.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }
        let content = fs::read_to_string(bundle.join("config.json"))?;
        let spec: Spec = serde_json::from_str(&content)?;
        let etc = bundle.join("rootfs").join("etc");
        let passwd = fs::read_to_string(etc.join("passwd")).ok();
        let group = fs::read_to_string(etc.join("group")).ok();
        let mut runs = self
            .runs
            .lock()
            .map_err(|e| RuntimeError::ExecFailed(format!("mutex poisoned: {e}")))?;
        runs.push(MockRun {
            strategy,
            bundle: bundle.to_path_buf(),
            container_id: container_id.to_owned(),
            spec,
            outer: outer.cloned(),
            passwd,
            group,
        });
        Ok(self.exit)
    }
}

impl RuntimeInvoker for MockRuntime {
    fn run_direct(
        &self,
        bundle: &Path,
        container_id: &str,
        cancel: &CancelToken,
    ) -> Result<ExitOutcome, RuntimeError> {
        self.record(ExecutionStrategy::Direct, bundle, container_id, None, cancel)
    }

    fn run_namespaced(
        &self,
        bundle: &Path,
        container_id: &str,
        outer: &IdentityMapping,
        cancel: &CancelToken,
    ) -> Result<ExitOutcome, RuntimeError> {
        self.record(
            ExecutionStrategy::NamespacedReexec,
            bundle,
            container_id,
            Some(outer),
            cancel,
        )
    }
}

/// Serves a pre-made root filesystem and image config for any reference.
pub struct DirectoryBundleProvider {
    rootfs: PathBuf,
    image: ImageSpec,
}

impl DirectoryBundleProvider {
    pub fn new(rootfs: impl Into<PathBuf>, image: ImageSpec) -> Self {
        Self {
            rootfs: rootfs.into(),
            image,
        }
    }
}

impl BundleProvider for DirectoryBundleProvider {
    fn name(&self) -> &str {
        "directory"
    }

    fn new_bundle(
        &self,
        path: &Path,
        _image_ref: &str,
        _sys_context: &SysContext,
        _cache: Option<ImageCache>,
    ) -> Result<Box<dyn Bundle>, RuntimeError> {
        Ok(Box::new(DirectoryBundle {
            path: path.to_path_buf(),
            source: self.rootfs.clone(),
            image: self.image.clone(),
            created: false,
        }))
    }
}

struct DirectoryBundle {
    path: PathBuf,
    source: PathBuf,
    image: ImageSpec,
    created: bool,
}

fn copy_tree(src: &Path, dst: &Path) -> Result<(), RuntimeError> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            std::os::unix::fs::symlink(fs::read_link(entry.path())?, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

impl Bundle for DirectoryBundle {
    fn create(&mut self, spec: &Spec, _cancel: &CancelToken) -> Result<(), RuntimeError> {
        copy_tree(&self.source, &self.rootfs())?;
        write_config(&self.path, spec)?;
        self.created = true;
        Ok(())
    }

    fn image_spec(&self) -> Option<&ImageSpec> {
        self.created.then_some(&self.image)
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn update(&mut self, spec: &Spec, _cancel: &CancelToken) -> Result<(), RuntimeError> {
        write_config(&self.path, spec)
    }
}
