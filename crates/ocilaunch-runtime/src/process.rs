use crate::identity::ResolvedIdentity;
use crate::RuntimeError;
use ocilaunch_schema::oci::{Capabilities, Rlimit};
use ocilaunch_schema::{ImageConfig, Process, User};
use std::collections::BTreeMap;

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

const DEFAULT_CAPS: &[&str] = &["CAP_AUDIT_WRITE", "CAP_KILL", "CAP_NET_BIND_SERVICE"];

/// Inputs describing how the container's process should be started.
#[derive(Debug, Clone, Default)]
pub struct ProcessRequest<'a> {
    /// Explicit command to run instead of the image entrypoint.
    pub process: &'a str,
    pub args: &'a [String],
    pub env: BTreeMap<String, String>,
    /// Destination of the home mount inside the container.
    pub home: &'a str,
    pub terminal: bool,
    /// Host `TERM`, passed through when a terminal is attached.
    pub term: Option<String>,
    /// `(soft, hard)` open-file limit copied into the container.
    pub nofile: Option<(u64, u64)>,
}

/// Command line for the container: an explicit process plus its arguments,
/// or the image entrypoint followed by the given arguments or, without any,
/// the image's default command.
pub fn resolve_args(
    image: &ImageConfig,
    process: &str,
    args: &[String],
) -> Result<Vec<String>, RuntimeError> {
    let resolved: Vec<String> = if process.is_empty() {
        let tail = if args.is_empty() { &image.cmd } else { args };
        image.entrypoint.iter().chain(tail).cloned().collect()
    } else {
        std::iter::once(process.to_owned())
            .chain(args.iter().cloned())
            .collect()
    };
    if resolved.is_empty() {
        return Err(RuntimeError::NoCommand);
    }
    Ok(resolved)
}

/// Container environment in `KEY=VALUE` form, sorted by key.
pub fn resolve_env(image: &ImageConfig, request: &ProcessRequest<'_>) -> Vec<String> {
    let mut env: BTreeMap<String, String> = image
        .env
        .iter()
        .filter_map(|kv| kv.split_once('='))
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();

    for (k, v) in &request.env {
        env.insert(k.clone(), v.clone());
    }

    env.entry("PATH".to_owned())
        .or_insert_with(|| DEFAULT_PATH.to_owned());
    if !request.home.is_empty() {
        env.entry("HOME".to_owned())
            .or_insert_with(|| request.home.to_owned());
    }
    if request.terminal {
        if let Some(term) = &request.term {
            env.entry("TERM".to_owned()).or_insert_with(|| term.clone());
        }
    }

    env.into_iter().map(|(k, v)| format!("{k}={v}")).collect()
}

fn default_capabilities() -> Capabilities {
    let caps: Vec<String> = DEFAULT_CAPS.iter().map(|c| (*c).to_owned()).collect();
    Capabilities {
        bounding: caps.clone(),
        effective: caps.clone(),
        permitted: caps,
    }
}

/// Build the OCI process section from image metadata and the request.
pub fn build_process(
    image: &ImageConfig,
    identity: ResolvedIdentity,
    request: &ProcessRequest<'_>,
) -> Result<Process, RuntimeError> {
    let args = resolve_args(image, request.process, request.args)?;
    let cwd = if image.working_dir.is_empty() {
        "/".to_owned()
    } else {
        image.working_dir.clone()
    };

    let rlimits = request
        .nofile
        .map(|(soft, hard)| {
            vec![Rlimit {
                rlimit_type: "RLIMIT_NOFILE".to_owned(),
                hard,
                soft,
            }]
        })
        .unwrap_or_default();

    Ok(Process {
        terminal: request.terminal,
        user: User {
            uid: identity.uid,
            gid: identity.gid,
        },
        args,
        env: resolve_env(image, request),
        cwd,
        capabilities: Some(default_capabilities()),
        rlimits,
        no_new_privileges: true,
    })
}

/// Whether the launcher's stdin is a terminal.
#[allow(unsafe_code)]
pub fn stdin_is_terminal() -> bool {
    // SAFETY: isatty() only inspects the descriptor and has no other effect.
    unsafe { libc::isatty(libc::STDIN_FILENO) == 1 }
}

/// The launcher's own `(soft, hard)` RLIMIT_NOFILE.
#[allow(unsafe_code)]
pub fn current_nofile_limit() -> Option<(u64, u64)> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit writes into the rlimit struct we own and pass by pointer.
    let ret = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    if ret != 0 {
        return None;
    }
    Some((limit.rlim_cur, limit.rlim_max))
}
