use crate::RuntimeError;
use ocilaunch_schema::LinuxResources;

/// A cgroup the runtime should create for the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupConfig {
    pub path: String,
    pub resources: LinuxResources,
}

/// Resolve the cgroup path and resource limits for a launch.
///
/// An empty `cgroups_json` is the common case and means no cgroup is
/// applied at all; `Ok(None)` is returned rather than an error.
/// `privileged` selects the system slice over the user slice.
pub fn resolve_cgroup(
    cgroups_json: &str,
    systemd: bool,
    privileged: bool,
) -> Result<Option<CgroupConfig>, RuntimeError> {
    if cgroups_json.trim().is_empty() {
        return Ok(None);
    }
    let resources = parse_resources(cgroups_json)?;
    let path = default_path(systemd, privileged, &uuid::Uuid::new_v4().to_string());
    Ok(Some(CgroupConfig { path, resources }))
}

pub fn parse_resources(json: &str) -> Result<LinuxResources, RuntimeError> {
    serde_json::from_str(json).map_err(|e| RuntimeError::MalformedResources(e.to_string()))
}

/// Default cgroup path for a process that does not exist yet. The systemd
/// form is `slice:prefix:name`, the cgroupfs form an absolute path.
pub fn default_path(systemd: bool, privileged: bool, name: &str) -> String {
    match (systemd, privileged) {
        (true, true) => format!("system.slice:ocilaunch:{name}"),
        (true, false) => format!("user.slice:ocilaunch:{name}"),
        (false, _) => format!("/ocilaunch/{name}"),
    }
}
