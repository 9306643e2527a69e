use crate::lifecycle::{validate_transition, LaunchState};
use crate::validate::check_options;
use crate::LaunchError;
use ocilaunch_runtime::execution::execute;
use ocilaunch_runtime::idfiles::sync_identity_files;
use ocilaunch_runtime::identity::{needs_mapping, resolve_identity};
use ocilaunch_runtime::idmap::compute_mappings;
use ocilaunch_runtime::process::{
    build_process, current_nofile_limit, stdin_is_terminal, ProcessRequest,
};
use ocilaunch_runtime::spec::{apply_id_mappings, build_skeleton};
use ocilaunch_runtime::{
    Bundle, BundleProvider, CancelToken, ExecutionStrategy, ExitOutcome, HostIdentity,
    HostInvoker, ImageCache, LayoutBundleProvider, RuntimeError, RuntimeInvoker,
};
use ocilaunch_schema::{LaunchOptions, LauncherConfig, Spec};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, error, info};

const BUNDLE_PREFIX: &str = "oci-bundle";

/// Map a collaborator error into the phase that produced it, keeping
/// cancellation distinct.
fn phase(kind: fn(RuntimeError) -> LaunchError) -> impl Fn(RuntimeError) -> LaunchError {
    move |e| match e {
        RuntimeError::Cancelled => LaunchError::Cancelled,
        other => kind(other),
    }
}

/// Temporary bundle directory, removed when dropped.
struct BundleDir {
    path: PathBuf,
    dir: Option<TempDir>,
}

impl BundleDir {
    fn create(root: Option<&Path>) -> Result<Self, LaunchError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(BUNDLE_PREFIX);
        let dir = match root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };
        debug!("created bundle directory {}", dir.path().display());
        Ok(Self {
            path: dir.path().to_path_buf(),
            dir: Some(dir),
        })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for BundleDir {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = dir.close() {
                error!("couldn't remove OCI bundle {}: {e}", self.path.display());
            }
        }
    }
}

/// Launches containers from OCI images through a low-level OCI runtime.
///
/// A launcher is constructed once per invocation: options are validated up
/// front, and [`Launcher::exec`] drives a single launch through the
/// [`LaunchState`] machine. Collaborators (host identity, bundle provider,
/// runtime invoker, bundle location) default to the real host and can be
/// replaced for testing.
pub struct Launcher {
    options: LaunchOptions,
    config: Arc<LauncherConfig>,
    provider: Box<dyn BundleProvider>,
    invoker: Arc<dyn RuntimeInvoker>,
    host: Option<HostIdentity>,
    bundle_root: Option<PathBuf>,
    state: LaunchState,
}

impl Launcher {
    /// Validate `options` and build a launcher over `config`.
    pub fn new(options: LaunchOptions, config: Arc<LauncherConfig>) -> Result<Self, LaunchError> {
        check_options(&options)?;
        let invoker: Arc<dyn RuntimeInvoker> = Arc::new(HostInvoker::new(Arc::clone(&config)));
        Ok(Self {
            options,
            config,
            provider: Box::new(LayoutBundleProvider),
            invoker,
            host: None,
            bundle_root: None,
            state: LaunchState::Unstarted,
        })
    }

    /// Like [`Launcher::new`], loading the configuration from `path`. The
    /// namespaced re-exec is pointed at the same file.
    pub fn from_config_file(
        options: LaunchOptions,
        path: impl AsRef<Path>,
    ) -> Result<Self, LaunchError> {
        check_options(&options)?;
        let path = path.as_ref();
        let config = Arc::new(LauncherConfig::load(path)?);
        let invoker = HostInvoker::new(Arc::clone(&config)).with_config_file(path);
        Ok(Self::new(options, config)?.with_invoker(Arc::new(invoker)))
    }

    #[must_use]
    pub fn with_bundle_provider(mut self, provider: Box<dyn BundleProvider>) -> Self {
        self.provider = provider;
        self
    }

    #[must_use]
    pub fn with_invoker(mut self, invoker: Arc<dyn RuntimeInvoker>) -> Self {
        self.invoker = invoker;
        self
    }

    /// Launch as `host` instead of the calling process.
    #[must_use]
    pub fn with_host(mut self, host: HostIdentity) -> Self {
        self.host = Some(host);
        self
    }

    /// Create bundle directories under `root` instead of the temp dir.
    #[must_use]
    pub fn with_bundle_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.bundle_root = Some(root.into());
        self
    }

    pub fn state(&self) -> LaunchState {
        self.state
    }

    pub fn options(&self) -> &LaunchOptions {
        &self.options
    }

    fn advance(&mut self, to: LaunchState) -> Result<(), LaunchError> {
        validate_transition(self.state, to)?;
        debug!("launch state: {} -> {to}", self.state);
        self.state = to;
        Ok(())
    }

    fn host_identity(&self) -> Result<HostIdentity, LaunchError> {
        match &self.host {
            Some(host) => Ok(host.clone()),
            None => HostIdentity::current(&self.config).map_err(LaunchError::IdentityResolution),
        }
    }

    /// First phase: the spec skeleton, without a process section.
    pub fn create_spec(&self, host: &HostIdentity) -> Result<Spec, LaunchError> {
        build_skeleton(&self.options, &self.config, host.is_root())
            .map_err(LaunchError::SpecConstruction)
    }

    /// Second phase: resolve the container identity, add ID mappings when
    /// needed, fill in the process section, persist the spec into the
    /// bundle and patch the container's identity files.
    pub fn finalize_spec(
        &self,
        spec: &mut Spec,
        bundle: &mut dyn Bundle,
        process: &str,
        args: &[String],
        host: &HostIdentity,
        cancel: &CancelToken,
    ) -> Result<(), LaunchError> {
        let image = bundle.image_spec().cloned().ok_or_else(|| {
            LaunchError::BundleCreation(RuntimeError::Bundle(
                "bundle has no image config".to_owned(),
            ))
        })?;
        let rootfs = bundle.rootfs();

        let identity = resolve_identity(&image.config.user, &rootfs, self.options.fakeroot, host)
            .map_err(LaunchError::IdentityResolution)?;
        debug!(
            "container identity {}:{} (image declared: {})",
            identity.uid, identity.gid, identity.image_declared
        );

        if needs_mapping(identity.uid, host.uid) {
            let mapping = compute_mappings(identity.uid, identity.gid, host, &self.config)
                .map_err(LaunchError::IdentityResolution)?;
            apply_id_mappings(spec, &mapping);
        }

        let home = self
            .options
            .home_mount()
            .map_or_else(|| host.home.display().to_string(), |(_, dst)| dst.to_owned());
        let request = ProcessRequest {
            process,
            args,
            env: self.options.env.clone(),
            home: &home,
            terminal: stdin_is_terminal(),
            term: std::env::var("TERM").ok(),
            nofile: current_nofile_limit(),
        };
        spec.process = Some(
            build_process(&image.config, identity, &request)
                .map_err(LaunchError::SpecConstruction)?,
        );

        bundle
            .update(spec, cancel)
            .map_err(phase(LaunchError::BundleCreation))?;

        if !identity.image_declared && !identity.is_root() {
            let synced = sync_identity_files(
                &rootfs,
                identity.uid,
                identity.gid,
                host,
                self.options.fakeroot,
            )
            .map_err(LaunchError::IdentityFileWrite)?;
            for path in &synced.written {
                debug!("patched {}", path.display());
            }
        }

        Ok(())
    }

    /// Run `image` and wait for it.
    ///
    /// The container's exit status is returned as an [`ExitOutcome`];
    /// errors are launcher failures. The bundle directory is removed before
    /// this returns, whatever the result.
    pub fn exec(
        &mut self,
        cancel: &CancelToken,
        image: &str,
        process: &str,
        args: &[String],
        instance_name: &str,
    ) -> Result<ExitOutcome, LaunchError> {
        if !instance_name.is_empty() {
            return Err(LaunchError::NotImplemented("instanceName".to_owned()));
        }

        let result = self.launch(cancel, image, process, args);
        if let Err(e) = &result {
            debug!("launch failed in state {}: {e}", self.state);
            self.state = LaunchState::Failed;
        }
        result
    }

    fn launch(
        &mut self,
        cancel: &CancelToken,
        image: &str,
        process: &str,
        args: &[String],
    ) -> Result<ExitOutcome, LaunchError> {
        let sys_context = self
            .options
            .sys_context
            .clone()
            .ok_or(LaunchError::MissingSysContext)?;
        let host = self.host_identity()?;

        let cache = if self.options.cache_disabled {
            None
        } else {
            Some(ImageCache::open_default().map_err(LaunchError::BundleCreation)?)
        };

        let mut spec = self.create_spec(&host)?;

        let bundle_dir = BundleDir::create(self.bundle_root.as_deref())?;
        let mut bundle = self
            .provider
            .new_bundle(bundle_dir.path(), image, &sys_context, cache)
            .map_err(LaunchError::BundleCreation)?;
        info!(
            "creating bundle for {image} with {} provider",
            self.provider.name()
        );
        bundle
            .create(&spec, cancel)
            .map_err(phase(LaunchError::BundleCreation))?;
        self.advance(LaunchState::BundleCreated)?;

        self.finalize_spec(&mut spec, bundle.as_mut(), process, args, &host, cancel)?;
        self.advance(LaunchState::Ready)?;

        let container_id = uuid::Uuid::new_v4().to_string();
        let strategy = ExecutionStrategy::select(host.uid);
        self.advance(LaunchState::Running)?;
        let outcome = execute(
            strategy,
            self.invoker.as_ref(),
            bundle.path(),
            &container_id,
            &host,
            &self.config,
            cancel,
        )
        .map_err(phase(LaunchError::Execution))?;

        self.advance(match outcome {
            ExitOutcome::Exited(_) => LaunchState::Exited,
            ExitOutcome::Signaled(_) => LaunchState::Killed,
        })?;
        info!("container {container_id} finished: {outcome:?}");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocilaunch_runtime::mock::{DirectoryBundleProvider, MockRuntime};
    use ocilaunch_schema::{ImageSpec, SysContext};
    use std::fs;

    fn host(uid: u32) -> HostIdentity {
        HostIdentity {
            uid,
            gid: uid,
            username: "alice".to_owned(),
            group_name: Some("alice".to_owned()),
            home: PathBuf::from("/home/alice"),
            gecos: "Alice".to_owned(),
            shell: "/bin/sh".to_owned(),
        }
    }

    fn image(entrypoint: &[&str]) -> ImageSpec {
        let mut image = ImageSpec::default();
        image.config.entrypoint = entrypoint.iter().map(|s| (*s).to_owned()).collect();
        image
    }

    fn options() -> LaunchOptions {
        LaunchOptions {
            cache_disabled: true,
            sys_context: Some(SysContext::default()),
            ..LaunchOptions::default()
        }
    }

    fn rootfs() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("etc")).unwrap();
        fs::write(dir.path().join("etc/passwd"), "root:x:0:0:root:/root:/bin/sh\n").unwrap();
        fs::write(dir.path().join("etc/group"), "root:x:0:\n").unwrap();
        dir
    }

    #[test]
    fn new_rejects_unsupported_options() {
        let opts = LaunchOptions {
            boot: true,
            ..options()
        };
        let err = Launcher::new(opts, Arc::default()).err().unwrap();
        assert!(matches!(err, LaunchError::UnsupportedOption(ref s) if s == "Boot"));
    }

    #[test]
    fn missing_config_file_is_configuration_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = Launcher::from_config_file(options(), dir.path().join("absent.toml"))
            .err()
            .unwrap();
        assert!(matches!(err, LaunchError::ConfigurationMissing(_)));
        assert!(err.is_config());
    }

    #[test]
    fn instance_launch_is_not_implemented() {
        let mut launcher = Launcher::new(options(), Arc::default()).unwrap();
        let err = launcher
            .exec(&CancelToken::new(), "img", "", &[], "web")
            .unwrap_err();
        assert!(matches!(err, LaunchError::NotImplemented(ref s) if s == "instanceName"));
        assert_eq!(launcher.state(), LaunchState::Unstarted);
    }

    #[test]
    fn missing_sys_context_fails() {
        let opts = LaunchOptions {
            sys_context: None,
            ..options()
        };
        let mut launcher = Launcher::new(opts, Arc::default())
            .unwrap()
            .with_host(host(0));
        let err = launcher
            .exec(&CancelToken::new(), "img", "", &[], "")
            .unwrap_err();
        assert!(matches!(err, LaunchError::MissingSysContext));
        assert_eq!(launcher.state(), LaunchState::Failed);
    }

    #[test]
    fn malformed_cgroup_json_is_a_spec_error() {
        let opts = LaunchOptions {
            cgroups_json: "{not json".to_owned(),
            ..options()
        };
        let launcher = Launcher::new(opts, Arc::default()).unwrap();
        let err = launcher.create_spec(&host(0)).unwrap_err();
        assert!(matches!(err, LaunchError::SpecConstruction(_)));
        assert!(err.to_string().starts_with("while creating OCI spec:"));
    }

    #[test]
    fn root_launch_runs_directly_and_cleans_up() {
        let rootfs = rootfs();
        let bundles = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockRuntime::exiting_with(ExitOutcome::Exited(0)));

        let mut launcher = Launcher::new(options(), Arc::default())
            .unwrap()
            .with_host(host(0))
            .with_bundle_root(bundles.path())
            .with_bundle_provider(Box::new(DirectoryBundleProvider::new(
                rootfs.path(),
                image(&["/bin/true"]),
            )))
            .with_invoker(mock.clone());

        let outcome = launcher
            .exec(&CancelToken::new(), "img", "", &[], "")
            .unwrap();
        assert_eq!(outcome, ExitOutcome::Exited(0));
        assert_eq!(launcher.state(), LaunchState::Exited);

        let runs = mock.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].strategy, ExecutionStrategy::Direct);
        let process = runs[0].spec.process.as_ref().unwrap();
        assert_eq!(process.args, vec!["/bin/true"]);
        assert_eq!(process.user.uid, 0);
        assert!(runs[0].bundle.starts_with(bundles.path()));
        assert!(fs::read_dir(bundles.path()).unwrap().next().is_none());
    }

    #[test]
    fn signaled_container_ends_killed() {
        let rootfs = rootfs();
        let bundles = tempfile::tempdir().unwrap();
        let mut launcher = Launcher::new(options(), Arc::default())
            .unwrap()
            .with_host(host(0))
            .with_bundle_root(bundles.path())
            .with_bundle_provider(Box::new(DirectoryBundleProvider::new(
                rootfs.path(),
                image(&["/bin/sleep"]),
            )))
            .with_invoker(Arc::new(MockRuntime::exiting_with(ExitOutcome::Signaled(9))));

        let outcome = launcher
            .exec(&CancelToken::new(), "img", "", &[], "")
            .unwrap();
        assert_eq!(outcome.code(), 137);
        assert_eq!(launcher.state(), LaunchState::Killed);
    }

    #[test]
    fn empty_command_fails_spec_construction() {
        let rootfs = rootfs();
        let bundles = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockRuntime::new());
        let mut launcher = Launcher::new(options(), Arc::default())
            .unwrap()
            .with_host(host(0))
            .with_bundle_root(bundles.path())
            .with_bundle_provider(Box::new(DirectoryBundleProvider::new(
                rootfs.path(),
                ImageSpec::default(),
            )))
            .with_invoker(mock.clone());

        let err = launcher
            .exec(&CancelToken::new(), "img", "", &[], "")
            .unwrap_err();
        assert!(matches!(err, LaunchError::SpecConstruction(RuntimeError::NoCommand)));
        assert!(mock.runs().is_empty());
        assert!(fs::read_dir(bundles.path()).unwrap().next().is_none());
    }

    #[test]
    fn cancelled_launch_surfaces_cancellation() {
        let rootfs = rootfs();
        let bundles = tempfile::tempdir().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut launcher = Launcher::new(options(), Arc::default())
            .unwrap()
            .with_host(host(0))
            .with_bundle_root(bundles.path())
            .with_bundle_provider(Box::new(DirectoryBundleProvider::new(
                rootfs.path(),
                image(&["/bin/true"]),
            )))
            .with_invoker(Arc::new(MockRuntime::new()));

        let err = launcher.exec(&cancel, "img", "", &[], "").unwrap_err();
        assert!(matches!(err, LaunchError::Cancelled));
        assert_eq!(launcher.state(), LaunchState::Failed);
        assert!(fs::read_dir(bundles.path()).unwrap().next().is_none());
    }

    #[test]
    fn launcher_is_single_use() {
        let rootfs = rootfs();
        let bundles = tempfile::tempdir().unwrap();
        let mut launcher = Launcher::new(options(), Arc::default())
            .unwrap()
            .with_host(host(0))
            .with_bundle_root(bundles.path())
            .with_bundle_provider(Box::new(DirectoryBundleProvider::new(
                rootfs.path(),
                image(&["/bin/true"]),
            )))
            .with_invoker(Arc::new(MockRuntime::new()));

        launcher
            .exec(&CancelToken::new(), "img", "", &[], "")
            .unwrap();
        let err = launcher
            .exec(&CancelToken::new(), "img", "", &[], "")
            .unwrap_err();
        assert!(matches!(err, LaunchError::InvalidTransition { .. }));
    }
}
