use super::{config_path, exit_code, install_signal_handler, CommandError};
use clap::Args;
use ocilaunch_core::{CancelToken, Launcher};
use ocilaunch_schema::{LaunchOptions, Namespaces, SysContext};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Arguments of `ocilaunch exec`.
///
/// Every launch option has a flag, including the ones the OCI launcher
/// refuses, so a refusal names the flag's option rather than a parse error.
#[derive(Debug, Default, Args)]
#[allow(clippy::struct_excessive_bools)]
pub struct ExecArgs {
    /// Image reference, e.g. `oci:/path/to/layout[:tag]`.
    pub image: String,
    /// Command and arguments to run instead of the image entrypoint.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,

    /// Run in a new PID namespace.
    #[arg(short, long)]
    pub pid: bool,
    /// Run in a new IPC namespace.
    #[arg(short, long)]
    pub ipc: bool,
    /// Run in a new network namespace.
    #[arg(short, long)]
    pub net: bool,
    /// Run in a new UTS namespace.
    #[arg(long)]
    pub uts: bool,
    /// Run in a new user namespace.
    #[arg(short = 'u', long)]
    pub userns: bool,
    /// Run as root inside the container via user namespace mapping.
    #[arg(short, long)]
    pub fakeroot: bool,
    /// File with OCI `linux.resources` JSON to apply as a cgroup.
    #[arg(long, value_name = "FILE")]
    pub apply_cgroups: Option<PathBuf>,
    /// Do not use the image cache.
    #[arg(long)]
    pub disable_cache: bool,
    /// Network mode; only `none` is supported with --net.
    #[arg(long, default_value = "bridge")]
    pub network: String,
    /// Home directory to mount, `src[:dst]`.
    #[arg(short = 'H', long, value_name = "SPEC")]
    pub home: Option<String>,
    /// Bind mount, `src[:dst[:ro|rw]]`.
    #[arg(short = 'B', long = "bind", value_name = "SPEC")]
    pub bind_paths: Vec<String>,
    /// Set an environment variable in the container.
    #[arg(long, value_name = "KEY=VALUE", value_parser = parse_env)]
    pub env: Vec<(String, String)>,
    /// Platform OS to select from a multi-platform image.
    #[arg(long)]
    pub os: Option<String>,
    /// Platform architecture to select from a multi-platform image.
    #[arg(long)]
    pub arch: Option<String>,
    /// Registry credentials file.
    #[arg(long, value_name = "FILE")]
    pub authfile: Option<PathBuf>,

    /// Writable container root filesystem (unsupported).
    #[arg(short, long)]
    pub writable: bool,
    /// Writable tmpfs overlay (unsupported).
    #[arg(long)]
    pub writable_tmpfs: bool,
    /// Overlay images (unsupported).
    #[arg(short, long = "overlay")]
    pub overlay: Vec<String>,
    /// Scratch directories (unsupported).
    #[arg(short = 'S', long = "scratch")]
    pub scratch: Vec<String>,
    /// Working directory for scratch and tmp (unsupported).
    #[arg(short = 'W', long)]
    pub workdir: Option<String>,
    /// Do not mount the home directory (unsupported).
    #[arg(long)]
    pub no_home: bool,
    /// FUSE mounts (unsupported).
    #[arg(long = "fusemount")]
    pub fusemount: Vec<String>,
    /// Suppress default mounts (unsupported).
    #[arg(long = "no-mount")]
    pub no_mount: Vec<String>,
    /// GPU setup through nvidia-container-cli (unsupported).
    #[arg(long)]
    pub nvccli: bool,
    /// Libraries to bind into the container (unsupported).
    #[arg(long = "contain-libs")]
    pub contain_libs: Vec<String>,
    /// Path to a proot binary (unsupported).
    #[arg(long)]
    pub proot: Option<String>,
    /// Start with a clean environment (unsupported).
    #[arg(short = 'e', long)]
    pub cleanenv: bool,
    /// Do not shell-evaluate arguments (unsupported).
    #[arg(long)]
    pub no_eval: bool,
    /// Network arguments (unsupported).
    #[arg(long = "network-args")]
    pub network_args: Vec<String>,
    /// Container hostname (unsupported).
    #[arg(long)]
    pub hostname: Option<String>,
    /// DNS servers (unsupported).
    #[arg(long)]
    pub dns: Option<String>,
    /// Capabilities to add (unsupported).
    #[arg(long)]
    pub add_caps: Option<String>,
    /// Capabilities to drop (unsupported).
    #[arg(long)]
    pub drop_caps: Option<String>,
    /// Allow setuid binaries (unsupported).
    #[arg(long)]
    pub allow_setuid: bool,
    /// Keep all privileges as root (unsupported).
    #[arg(long)]
    pub keep_privs: bool,
    /// Drop all privileges as root (unsupported).
    #[arg(long)]
    pub no_privs: bool,
    /// Security options (unsupported).
    #[arg(long = "security")]
    pub security: Vec<String>,
    /// Do not propagate the umask (unsupported).
    #[arg(long)]
    pub no_umask: bool,
    /// Alternate launcher configuration for the container (unsupported
    /// unless it is the default file).
    #[arg(long, value_name = "FILE")]
    pub config_file: Option<String>,
    /// Shell for `shell` sessions (unsupported).
    #[arg(long)]
    pub shell: Option<String>,
    /// Initial working directory (unsupported).
    #[arg(long)]
    pub pwd: Option<String>,
    /// Boot the container's init (unsupported).
    #[arg(long)]
    pub boot: bool,
    /// Do not start an init process (unsupported).
    #[arg(long)]
    pub no_init: bool,
    /// Minimal host filesystem (unsupported).
    #[arg(short = 'c', long)]
    pub contain: bool,
    /// Contain everything (unsupported).
    #[arg(short = 'C', long)]
    pub containall: bool,
    /// Application to run (unsupported).
    #[arg(long)]
    pub app: Option<String>,
    /// Verify the image with this key fingerprint (unsupported).
    #[arg(long, value_name = "FINGERPRINT")]
    pub verify_key: Option<String>,
    /// Mount SIF images with FUSE (unsupported).
    #[arg(long)]
    pub sif_fuse: bool,
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

impl ExecArgs {
    /// Launch options for these arguments. `default_home` is used when no
    /// home directory was given explicitly.
    pub fn to_options(&self, default_home: &str) -> Result<LaunchOptions, CommandError> {
        let cgroups_json = match &self.apply_cgroups {
            Some(path) => std::fs::read_to_string(path).map_err(|e| {
                CommandError::failure(format!("failed to read {}: {e}", path.display()))
            })?,
            None => String::new(),
        };

        Ok(LaunchOptions {
            namespaces: Namespaces {
                pid: self.pid,
                ipc: self.ipc,
                net: self.net,
                uts: self.uts,
                user: self.userns,
            },
            fakeroot: self.fakeroot,
            cgroups_json,
            cache_disabled: self.disable_cache,
            network: self.network.clone(),
            home_dir: self
                .home
                .clone()
                .unwrap_or_else(|| default_home.to_owned()),
            bind_paths: self.bind_paths.clone(),
            env: self.env.iter().cloned().collect::<BTreeMap<_, _>>(),
            sys_context: Some(SysContext {
                os_choice: self.os.clone(),
                arch_choice: self.arch.clone(),
                auth_file: self.authfile.clone(),
            }),

            writable: self.writable,
            writable_tmpfs: self.writable_tmpfs,
            overlay_paths: self.overlay.clone(),
            scratch_dirs: self.scratch.clone(),
            work_dir: self.workdir.clone().unwrap_or_default(),
            custom_home: self.home.is_some(),
            no_home: self.no_home,
            fuse_mount: self.fusemount.clone(),
            no_mount: self.no_mount.clone(),
            nv_ccli: self.nvccli,
            contain_libs: self.contain_libs.clone(),
            proot: self.proot.clone().unwrap_or_default(),
            clean_env: self.cleanenv,
            no_eval: self.no_eval,
            network_args: self.network_args.clone(),
            hostname: self.hostname.clone().unwrap_or_default(),
            dns: self.dns.clone().unwrap_or_default(),
            add_caps: self.add_caps.clone().unwrap_or_default(),
            drop_caps: self.drop_caps.clone().unwrap_or_default(),
            allow_suid: self.allow_setuid,
            keep_privs: self.keep_privs,
            no_privs: self.no_privs,
            security_opts: self.security.clone(),
            no_umask: self.no_umask,
            config_file: self.config_file.clone().unwrap_or_default(),
            shell_path: self.shell.clone().unwrap_or_default(),
            pwd_path: self.pwd.clone().unwrap_or_default(),
            boot: self.boot,
            no_init: self.no_init,
            contain: self.contain,
            contain_all: self.containall,
            app_name: self.app.clone().unwrap_or_default(),
            key_info: self.verify_key.clone(),
            sif_fuse: self.sif_fuse,
        })
    }
}

pub fn run(config: Option<&Path>, args: &ExecArgs) -> Result<u8, CommandError> {
    let home = std::env::var("HOME").unwrap_or_default();
    let options = args.to_options(&home)?;

    let mut launcher = match config_path(config) {
        Some(path) => {
            debug!("using configuration {}", path.display());
            Launcher::from_config_file(options, &path)?
        }
        None => Launcher::new(options, Arc::default())?,
    };

    let cancel = CancelToken::new();
    install_signal_handler(&cancel);

    let (process, rest) = match args.command.split_first() {
        Some((process, rest)) => (process.as_str(), rest),
        None => ("", &[][..]),
    };
    let outcome = launcher.exec(&cancel, &args.image, process, rest, "")?;
    Ok(exit_code(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use ocilaunch_core::unsupported_options;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        exec: ExecArgs,
    }

    fn parse(argv: &[&str]) -> ExecArgs {
        Wrapper::try_parse_from(std::iter::once("exec").chain(argv.iter().copied()))
            .unwrap()
            .exec
    }

    #[test]
    fn positional_command_and_trailing_args() {
        let args = parse(&["oci:/img", "/bin/sh", "-c", "echo hi"]);
        assert_eq!(args.image, "oci:/img");
        assert_eq!(args.command, vec!["/bin/sh", "-c", "echo hi"]);
    }

    #[test]
    fn default_invocation_is_accepted() {
        let options = parse(&["oci:/img"]).to_options("/home/bob").unwrap();
        assert_eq!(options.home_dir, "/home/bob");
        assert!(!options.custom_home);
        assert!(options.sys_context.is_some());
        assert!(unsupported_options(&options).is_empty());
    }

    #[test]
    fn supported_flags_map_to_options() {
        let options = parse(&[
            "--pid",
            "--net",
            "--network",
            "none",
            "--fakeroot",
            "-B",
            "/data:/mnt:ro",
            "--env",
            "A=1",
            "--arch",
            "arm64",
            "oci:/img",
        ])
        .to_options("/home/bob")
        .unwrap();
        assert!(options.namespaces.pid && options.namespaces.net);
        assert!(options.fakeroot);
        assert_eq!(options.bind_paths, vec!["/data:/mnt:ro"]);
        assert_eq!(options.env.get("A").map(String::as_str), Some("1"));
        assert_eq!(
            options.sys_context.unwrap().arch_choice.as_deref(),
            Some("arm64")
        );
    }

    #[test]
    fn explicit_home_is_custom() {
        let options = parse(&["--home", "/srv/h:/home/x", "oci:/img"])
            .to_options("/home/bob")
            .unwrap();
        assert_eq!(options.home_dir, "/srv/h:/home/x");
        assert_eq!(unsupported_options(&options), vec!["CustomHome"]);
    }

    #[test]
    fn unsupported_flags_reach_validation() {
        let options = parse(&["--writable", "--hostname", "box", "--containall", "oci:/img"])
            .to_options("/home/bob")
            .unwrap();
        assert_eq!(
            unsupported_options(&options),
            vec!["Writable", "Hostname", "ContainAll"]
        );
    }

    #[test]
    fn malformed_env_is_rejected() {
        assert!(parse_env("NOVALUE").is_err());
        assert!(parse_env("=x").is_err());
        assert_eq!(parse_env("K=a=b").unwrap(), ("K".to_owned(), "a=b".to_owned()));
    }

    #[test]
    fn cgroup_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("limits.json");
        std::fs::write(&file, r#"{"pids":{"limit":5}}"#).unwrap();
        let options = parse(&["--apply-cgroups", file.to_str().unwrap(), "oci:/img"])
            .to_options("/home/bob")
            .unwrap();
        assert!(options.cgroups_json.contains("limit"));
    }
}
