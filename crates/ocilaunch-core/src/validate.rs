use crate::LaunchError;
use ocilaunch_schema::{LaunchOptions, DEFAULT_CONFIG_FILE};

/// Names of every requested option the OCI launch path cannot honor, in a
/// fixed order.
pub fn unsupported_options(lo: &LaunchOptions) -> Vec<&'static str> {
    let mut bad = Vec::new();
    let mut flag = |set: bool, name: &'static str| {
        if set {
            bad.push(name);
        }
    };

    flag(lo.writable, "Writable");
    flag(lo.writable_tmpfs, "WritableTmpfs");
    flag(!lo.overlay_paths.is_empty(), "OverlayPaths");
    flag(!lo.scratch_dirs.is_empty(), "ScratchDirs");
    flag(!lo.work_dir.is_empty(), "WorkDir");
    // home_dir itself is always set; only an explicit one is refused.
    flag(lo.custom_home, "CustomHome");
    flag(lo.no_home, "NoHome");
    flag(!lo.fuse_mount.is_empty(), "FuseMount");
    flag(!lo.no_mount.is_empty(), "NoMount");
    flag(lo.nv_ccli, "NvCCLI");
    flag(!lo.contain_libs.is_empty(), "ContainLibs");
    flag(!lo.proot.is_empty(), "Proot");
    flag(lo.clean_env, "CleanEnv");
    flag(lo.no_eval, "NoEval");
    flag(
        lo.namespaces.net && lo.network != "none",
        "Network (except none)",
    );
    flag(!lo.network_args.is_empty(), "NetworkArgs");
    flag(!lo.hostname.is_empty(), "Hostname");
    flag(!lo.dns.is_empty(), "DNS");
    flag(!lo.add_caps.is_empty(), "AddCaps");
    flag(!lo.drop_caps.is_empty(), "DropCaps");
    flag(lo.allow_suid, "AllowSUID");
    flag(lo.keep_privs, "KeepPrivs");
    flag(lo.no_privs, "NoPrivs");
    flag(!lo.security_opts.is_empty(), "SecurityOpts");
    flag(lo.no_umask, "NoUmask");
    flag(
        !lo.config_file.is_empty() && lo.config_file != DEFAULT_CONFIG_FILE,
        "ConfigFile",
    );
    flag(!lo.shell_path.is_empty(), "ShellPath");
    flag(!lo.pwd_path.is_empty(), "PwdPath");
    flag(lo.boot, "Boot");
    flag(lo.no_init, "NoInit");
    flag(lo.contain, "Contain");
    flag(lo.contain_all, "ContainAll");
    flag(!lo.app_name.is_empty(), "AppName");
    flag(lo.key_info.is_some(), "KeyInfo");
    flag(lo.sif_fuse, "SIFFUSE");

    bad
}

/// Reject the options as a whole if any of them is unsupported.
pub fn check_options(lo: &LaunchOptions) -> Result<(), LaunchError> {
    let bad = unsupported_options(lo);
    if bad.is_empty() {
        Ok(())
    } else {
        Err(LaunchError::UnsupportedOption(bad.join(",")))
    }
}
