//! Launcher orchestration for ocilaunch.
//!
//! The [`Launcher`] validates launch options, builds the OCI runtime spec in
//! two phases (skeleton, then image-aware finalization), owns the temporary
//! bundle directory for the duration of a launch, and hands the bundle to
//! the execution strategy. The container's own exit status is returned, not
//! reported as an error.

pub mod launcher;
pub mod lifecycle;
pub mod validate;

pub use launcher::Launcher;
pub use lifecycle::{validate_transition, LaunchState};
pub use ocilaunch_runtime::{CancelToken, ExitOutcome};
pub use validate::{check_options, unsupported_options};

use ocilaunch_runtime::RuntimeError;
use ocilaunch_schema::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("not supported by OCI launcher: {0}")]
    UnsupportedOption(String),
    #[error("{0} is not implemented by the OCI launcher")]
    NotImplemented(String),
    #[error("no launcher configuration available: {0}")]
    ConfigurationMissing(String),
    #[error("{0}")]
    Config(ConfigError),
    #[error("launch options carry no image system context")]
    MissingSysContext,
    #[error("while creating bundle: {0}")]
    BundleCreation(RuntimeError),
    #[error("while creating OCI spec: {0}")]
    SpecConstruction(RuntimeError),
    #[error("while resolving container identity: {0}")]
    IdentityResolution(RuntimeError),
    #[error("while writing container identity files: {0}")]
    IdentityFileWrite(RuntimeError),
    #[error("while executing container: {0}")]
    Execution(RuntimeError),
    #[error("launch cancelled")]
    Cancelled,
    #[error("invalid launch state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ConfigError> for LaunchError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::Missing(path) => Self::ConfigurationMissing(path.display().to_string()),
            other => Self::Config(other),
        }
    }
}

impl LaunchError {
    /// Whether the failure came from configuration rather than the launch.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::ConfigurationMissing(_) | Self::Config(_))
    }
}
