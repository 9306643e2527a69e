//! Launch mechanisms for ocilaunch.
//!
//! This crate turns launch options and image metadata into a runnable OCI
//! bundle and starts it: cgroup and mount resolution, the runtime-spec
//! skeleton, passwd/group handling, container identity resolution,
//! subordinate-ID mappings, identity-file sync, process resolution, local
//! OCI-layout bundles with a verification cache, and runtime invocation
//! either directly or from a re-executed launcher in a user namespace.

pub mod bundle;
pub mod cache;
pub mod cancel;
pub mod cgroups;
pub mod execution;
pub mod host;
pub mod idfiles;
pub mod identity;
pub mod idmap;
pub mod mock;
pub mod mounts;
pub mod oci;
pub mod passwd;
pub mod prereq;
pub mod process;
pub mod spec;

pub use bundle::{Bundle, BundleProvider, LayoutBundleProvider};
pub use cache::ImageCache;
pub use cancel::CancelToken;
pub use execution::{ExecutionStrategy, HostInvoker, RuntimeInvoker};
pub use host::HostIdentity;
pub use identity::ResolvedIdentity;
pub use idmap::IdentityMapping;
pub use oci::{ExitOutcome, OciRuntime};
pub use prereq::{check_prereqs, format_missing, MissingPrereq};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed cgroup resources: {0}")]
    MalformedResources(String),
    #[error("invalid mount: {0}")]
    InvalidMount(String),
    #[error("user lookup failed: {0}")]
    UserLookup(String),
    #[error("ID mapping failed: {0}")]
    MappingResolution(String),
    #[error("identity file generation failed: {0}")]
    IdentityGeneration(String),
    #[error("identity file write failed: {0}")]
    IdentityFileWrite(String),
    #[error("no command to run: image has no entrypoint or cmd and none was given")]
    NoCommand,
    #[error("unsupported image: {0}")]
    UnsupportedImage(String),
    #[error("bundle error: {0}")]
    Bundle(String),
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
    #[error("layer entry escapes the root filesystem: {0}")]
    PathTraversal(String),
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("runtime execution failed: {0}")]
    ExecFailed(String),
    #[error("launch cancelled")]
    Cancelled,
}
