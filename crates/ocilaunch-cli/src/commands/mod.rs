pub mod check_config;
pub mod completions;
pub mod exec;
pub mod man_pages;
pub mod oci_run;

use ocilaunch_core::{CancelToken, ExitOutcome, LaunchError};
use ocilaunch_runtime::RuntimeError;
use ocilaunch_schema::{ConfigError, LauncherConfig, DEFAULT_CONFIG_FILE};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;

/// A command failure and the exit code it maps to.
#[derive(Debug)]
pub struct CommandError {
    pub code: u8,
    pub message: String,
}

impl CommandError {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            code: EXIT_FAILURE,
            message: message.into(),
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<LaunchError> for CommandError {
    fn from(e: LaunchError) -> Self {
        let code = if e.is_config() {
            EXIT_CONFIG_ERROR
        } else {
            EXIT_FAILURE
        };
        Self {
            code,
            message: e.to_string(),
        }
    }
}

impl From<ConfigError> for CommandError {
    fn from(e: ConfigError) -> Self {
        LaunchError::from(e).into()
    }
}

impl From<RuntimeError> for CommandError {
    fn from(e: RuntimeError) -> Self {
        Self::failure(e.to_string())
    }
}

/// The configuration file in effect: the explicit one, else the default
/// file when it exists. `None` means built-in defaults.
pub fn config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => {
            let default = Path::new(DEFAULT_CONFIG_FILE);
            default.is_file().then(|| default.to_path_buf())
        }
    }
}

pub fn load_config(path: Option<&Path>) -> Result<LauncherConfig, CommandError> {
    match path {
        Some(path) => Ok(LauncherConfig::load(path)?),
        None => Ok(LauncherConfig::default()),
    }
}

/// Shell-style process exit code for a finished container.
pub fn exit_code(outcome: ExitOutcome) -> u8 {
    u8::try_from(outcome.code().rem_euclid(256)).unwrap_or(EXIT_FAILURE)
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Cancel `cancel` on the first Ctrl-C or SIGTERM; exit on the second.
pub fn install_signal_handler(cancel: &CancelToken) {
    set_cancel_handler(cancel, true);
}

/// Cancel `cancel` on every Ctrl-C or SIGTERM without ever exiting early.
/// The re-executed launcher gets both the terminal's SIGINT and its
/// parent's SIGTERM, and must still delete its container.
pub fn install_cancel_handler(cancel: &CancelToken) {
    set_cancel_handler(cancel, false);
}

fn set_cancel_handler(cancel: &CancelToken, exit_on_repeat: bool) {
    let cancel = cancel.clone();
    let _ = ctrlc::set_handler(move || {
        if INTERRUPTED.swap(true, Ordering::SeqCst) {
            if exit_on_repeat {
                std::process::exit(i32::from(EXIT_FAILURE));
            }
            return;
        }
        cancel.cancel();
        eprintln!("\ninterrupt received, stopping container...");
    });
}
