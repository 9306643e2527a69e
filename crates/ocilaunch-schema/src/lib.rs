//! Data model for the ocilaunch OCI container launcher.
//!
//! This crate defines the schema layer: caller-supplied `LaunchOptions`, the
//! explicit `LauncherConfig` shared by every launcher in a process, and the
//! OCI runtime-spec and image-spec documents the launcher reads and writes.

pub mod config;
pub mod image;
pub mod oci;
pub mod options;

pub use config::{ConfigError, LauncherConfig, DEFAULT_CONFIG_FILE};
pub use image::{ImageConfig, ImageSpec};
pub use oci::{
    LinuxIdMapping, LinuxResources, Mount, Namespace, NamespaceType, Process, Spec, User,
    OCI_RUNTIME_SPEC_VERSION,
};
pub use options::{LaunchOptions, Namespaces, SysContext};
