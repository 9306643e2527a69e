use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Namespaces requested for the container, in addition to the mount
/// namespace every OCI container gets.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Namespaces {
    #[serde(default)]
    pub pid: bool,
    #[serde(default)]
    pub ipc: bool,
    #[serde(default)]
    pub net: bool,
    #[serde(default)]
    pub uts: bool,
    #[serde(default)]
    pub user: bool,
}

/// Image-handling context handed to the bundle provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SysContext {
    /// Platform OS to select from a multi-platform index. Host OS when unset.
    #[serde(default)]
    pub os_choice: Option<String>,
    /// Platform architecture to select from a multi-platform index. Host
    /// architecture when unset.
    #[serde(default)]
    pub arch_choice: Option<String>,
    /// Registry credentials file, carried for providers that talk to registries.
    #[serde(default)]
    pub auth_file: Option<PathBuf>,
}

/// The full set of container-launch options a caller can request.
///
/// Only a subset is honored by the OCI launch path; everything else is
/// rejected up front by the launcher's option validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LaunchOptions {
    pub namespaces: Namespaces,
    pub fakeroot: bool,
    /// OCI `linux.resources` JSON. Empty means no cgroup is applied.
    pub cgroups_json: String,
    pub cache_disabled: bool,
    /// Network mode. Only `none` is honored, and only with a network namespace.
    pub network: String,
    /// Home directory spec, `src[:dst]`. Always supplied by the CLI.
    pub home_dir: String,
    /// Extra bind mounts, `src[:dst[:ro|rw]]`.
    pub bind_paths: Vec<String>,
    /// Environment overrides applied on top of the image environment.
    pub env: BTreeMap<String, String>,
    pub sys_context: Option<SysContext>,

    pub writable: bool,
    pub writable_tmpfs: bool,
    pub overlay_paths: Vec<String>,
    pub scratch_dirs: Vec<String>,
    pub work_dir: String,
    /// Set when `home_dir` was given explicitly by the user rather than
    /// defaulted by the CLI.
    pub custom_home: bool,
    pub no_home: bool,
    pub fuse_mount: Vec<String>,
    pub no_mount: Vec<String>,
    pub nv_ccli: bool,
    pub contain_libs: Vec<String>,
    pub proot: String,
    pub clean_env: bool,
    pub no_eval: bool,
    pub network_args: Vec<String>,
    pub hostname: String,
    pub dns: String,
    pub add_caps: String,
    pub drop_caps: String,
    pub allow_suid: bool,
    pub keep_privs: bool,
    pub no_privs: bool,
    pub security_opts: Vec<String>,
    pub no_umask: bool,
    pub config_file: String,
    pub shell_path: String,
    pub pwd_path: String,
    pub boot: bool,
    pub no_init: bool,
    pub contain: bool,
    pub contain_all: bool,
    pub app_name: String,
    /// Signing key fingerprint used for image verification.
    pub key_info: Option<String>,
    pub sif_fuse: bool,
}

impl LaunchOptions {
    /// Split `home_dir` into `(source, destination)`. The destination
    /// defaults to the source when no `:` is present.
    pub fn home_mount(&self) -> Option<(&str, &str)> {
        if self.home_dir.is_empty() {
            return None;
        }
        match self.home_dir.split_once(':') {
            Some((src, dst)) => Some((src, dst)),
            None => Some((self.home_dir.as_str(), self.home_dir.as_str())),
        }
    }
}
