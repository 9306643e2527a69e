use crate::RuntimeError;
use ocilaunch_schema::{LaunchOptions, LauncherConfig, Mount};

fn mount(destination: &str, mount_type: &str, source: &str, options: &[&str]) -> Mount {
    Mount {
        destination: destination.to_owned(),
        mount_type: Some(mount_type.to_owned()),
        source: Some(source.to_owned()),
        options: options.iter().map(|o| (*o).to_owned()).collect(),
    }
}

fn bind(source: &str, destination: &str, read_only: bool) -> Mount {
    let mode = if read_only { "ro" } else { "rw" };
    mount(destination, "none", source, &["rbind", "nosuid", "nodev", mode])
}

/// A parsed `src[:dst[:ro|rw]]` bind specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindSpec {
    pub source: String,
    pub destination: String,
    pub read_only: bool,
}

pub fn parse_bind_spec(spec: &str) -> Result<BindSpec, RuntimeError> {
    let parts: Vec<&str> = spec.split(':').collect();
    let (source, destination, opt) = match parts.as_slice() {
        [src] => (*src, *src, None),
        [src, dst] => (*src, *dst, None),
        [src, dst, opt] => (*src, *dst, Some(*opt)),
        _ => {
            return Err(RuntimeError::InvalidMount(format!(
                "'{spec}': expected src[:dst[:ro|rw]]"
            )))
        }
    };
    if source.is_empty() {
        return Err(RuntimeError::InvalidMount(format!("'{spec}': empty source")));
    }
    if !destination.starts_with('/') {
        return Err(RuntimeError::InvalidMount(format!(
            "'{spec}': destination must be absolute"
        )));
    }
    let read_only = match opt {
        None | Some("rw") => false,
        Some("ro") => true,
        Some(other) => {
            return Err(RuntimeError::InvalidMount(format!(
                "'{spec}': unknown bind option '{other}'"
            )))
        }
    };
    Ok(BindSpec {
        source: source.to_owned(),
        destination: destination.to_owned(),
        read_only,
    })
}

/// Compute the full mount list for a container.
///
/// `privileged` is whether the launcher runs as host root. Without root and
/// without a network namespace sysfs cannot be mounted, so the host's /sys
/// is bound read-only instead.
pub fn compute_mounts(
    options: &LaunchOptions,
    config: &LauncherConfig,
    privileged: bool,
) -> Result<Vec<Mount>, RuntimeError> {
    let mut mounts = vec![
        mount("/proc", "proc", "proc", &["nosuid", "noexec", "nodev"]),
        mount(
            "/dev",
            "tmpfs",
            "tmpfs",
            &["nosuid", "strictatime", "mode=755", "size=65536k"],
        ),
        mount(
            "/dev/pts",
            "devpts",
            "devpts",
            &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620"],
        ),
        mount(
            "/dev/shm",
            "tmpfs",
            "shm",
            &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"],
        ),
        mount("/dev/mqueue", "mqueue", "mqueue", &["nosuid", "noexec", "nodev"]),
    ];

    if privileged || options.namespaces.net {
        mounts.push(mount("/sys", "sysfs", "sysfs", &["nosuid", "noexec", "nodev", "ro"]));
    } else {
        mounts.push(bind("/sys", "/sys", true));
    }
    mounts.push(mount(
        "/sys/fs/cgroup",
        "cgroup",
        "cgroup",
        &["nosuid", "noexec", "nodev", "relatime", "ro"],
    ));

    if config.mount_tmp {
        mounts.push(bind("/tmp", "/tmp", false));
        mounts.push(bind("/var/tmp", "/var/tmp", false));
    }

    if config.mount_home {
        if let Some((src, dst)) = options.home_mount() {
            let home = parse_bind_spec(&format!("{src}:{dst}"))?;
            mounts.push(bind(&home.source, &home.destination, false));
        }
    }

    for spec in &options.bind_paths {
        let b = parse_bind_spec(spec)?;
        mounts.push(bind(&b.source, &b.destination, b.read_only));
    }

    Ok(mounts)
}
