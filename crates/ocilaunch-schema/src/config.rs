use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration file honored by the launcher. A `ConfigFile` launch option
/// naming any other path is rejected.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/ocilaunch/ocilaunch.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no launcher configuration at {0}")]
    Missing(PathBuf),
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Effective launcher configuration.
///
/// Constructed once by the caller and shared read-only (typically behind an
/// `Arc`) by every launcher in the process.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LauncherConfig {
    /// Use the systemd cgroup manager instead of cgroupfs.
    pub systemd_cgroups: bool,
    /// OCI runtime binary. When unset, the first of crun, runc, youki found
    /// on PATH is used.
    pub runtime: Option<String>,
    pub subuid_file: PathBuf,
    pub subgid_file: PathBuf,
    /// Host account database used to look up the caller.
    pub passwd_file: PathBuf,
    pub group_file: PathBuf,
    pub newuidmap: String,
    pub newgidmap: String,
    /// Bind /tmp and /var/tmp into the container.
    pub mount_tmp: bool,
    /// Bind the caller's home directory into the container.
    pub mount_home: bool,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            systemd_cgroups: false,
            runtime: None,
            subuid_file: PathBuf::from("/etc/subuid"),
            subgid_file: PathBuf::from("/etc/subgid"),
            passwd_file: PathBuf::from("/etc/passwd"),
            group_file: PathBuf::from("/etc/group"),
            newuidmap: "newuidmap".to_owned(),
            newgidmap: "newgidmap".to_owned(),
            mount_tmp: true,
            mount_home: true,
        }
    }
}

impl LauncherConfig {
    pub fn parse_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file. A missing file is reported as
    /// [`ConfigError::Missing`] so callers can tell it apart from a bad one.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::Missing(path.to_path_buf()));
        }
        let content = fs::read_to_string(path)?;
        Self::parse_str(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(runtime) = &self.runtime {
            if runtime.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "runtime must not be empty when set".to_owned(),
                ));
            }
        }
        if self.newuidmap.is_empty() || self.newgidmap.is_empty() {
            return Err(ConfigError::Invalid(
                "newuidmap/newgidmap must not be empty".to_owned(),
            ));
        }
        Ok(())
    }
}
