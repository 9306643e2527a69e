use crate::cgroups::resolve_cgroup;
use crate::idmap::IdentityMapping;
use crate::mounts::compute_mounts;
use crate::RuntimeError;
use ocilaunch_schema::oci::{Linux, Root};
use ocilaunch_schema::{
    LaunchOptions, LauncherConfig, Namespace, NamespaceType, Namespaces, Spec,
    OCI_RUNTIME_SPEC_VERSION,
};
use tracing::debug;

const MASKED_PATHS: &[&str] = &[
    "/proc/acpi",
    "/proc/asound",
    "/proc/kcore",
    "/proc/keys",
    "/proc/latency_stats",
    "/proc/timer_list",
    "/proc/timer_stats",
    "/proc/sched_debug",
    "/proc/scsi",
    "/sys/firmware",
];

const READONLY_PATHS: &[&str] = &[
    "/proc/bus",
    "/proc/fs",
    "/proc/irq",
    "/proc/sys",
    "/proc/sysrq-trigger",
];

/// Baseline spec: rootfs at `rootfs`, a mount namespace, masked and
/// read-only kernel paths, and no process section.
pub fn minimal_spec() -> Spec {
    Spec {
        oci_version: OCI_RUNTIME_SPEC_VERSION.to_owned(),
        process: None,
        root: Root {
            path: "rootfs".to_owned(),
            readonly: false,
        },
        hostname: None,
        mounts: Vec::new(),
        linux: Some(Linux {
            namespaces: vec![Namespace::new(NamespaceType::Mount)],
            masked_paths: MASKED_PATHS.iter().map(|p| (*p).to_owned()).collect(),
            readonly_paths: READONLY_PATHS.iter().map(|p| (*p).to_owned()).collect(),
            ..Linux::default()
        }),
    }
}

fn push_namespace(spec: &mut Spec, ns_type: NamespaceType) {
    if !spec.has_namespace(ns_type) {
        spec.linux_mut().namespaces.push(Namespace::new(ns_type));
    }
}

/// Add the requested namespaces. A user namespace request is not honored
/// here: the user namespace is added only when ID mappings are applied.
pub fn add_namespaces(spec: &mut Spec, ns: Namespaces) {
    if ns.ipc {
        push_namespace(spec, NamespaceType::Ipc);
    }
    if ns.net {
        push_namespace(spec, NamespaceType::Network);
    }
    if ns.pid {
        push_namespace(spec, NamespaceType::Pid);
    }
    if ns.uts {
        push_namespace(spec, NamespaceType::Uts);
    }
    if ns.user {
        debug!("user namespace is created by the launcher when ID mappings apply");
    }
}

/// Build the spec skeleton: namespaces, mounts and cgroup. The process
/// section is left empty until image metadata is available.
pub fn build_skeleton(
    options: &LaunchOptions,
    config: &LauncherConfig,
    privileged: bool,
) -> Result<Spec, RuntimeError> {
    let mut spec = minimal_spec();
    add_namespaces(&mut spec, options.namespaces);

    spec.mounts = compute_mounts(options, config, privileged)?;

    let cgroup = resolve_cgroup(&options.cgroups_json, config.systemd_cgroups, privileged)?;
    if let Some(cgroup) = cgroup {
        debug!("applying cgroup {}", cgroup.path);
        let linux = spec.linux_mut();
        linux.cgroups_path = Some(cgroup.path);
        linux.resources = Some(cgroup.resources);
    }

    Ok(spec)
}

/// Place reverse ID mappings into the spec. Mappings are only meaningful
/// inside a user namespace, so one is added alongside them.
pub fn apply_id_mappings(spec: &mut Spec, mapping: &IdentityMapping) {
    push_namespace(spec, NamespaceType::User);
    let linux = spec.linux_mut();
    linux.uid_mappings.clone_from(&mapping.uid);
    linux.gid_mappings.clone_from(&mapping.gid);
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocilaunch_schema::LinuxIdMapping;

    fn namespaces(spec: &Spec) -> Vec<NamespaceType> {
        spec.linux
            .as_ref()
            .unwrap()
            .namespaces
            .iter()
            .map(|n| n.ns_type)
            .collect()
    }

    #[test]
    fn minimal_spec_has_no_process() {
        let spec = minimal_spec();
        assert!(spec.process.is_none());
        assert_eq!(namespaces(&spec), vec![NamespaceType::Mount]);
        assert_eq!(spec.root.path, "rootfs");
    }

    #[test]
    fn requested_namespaces_added_once() {
        let mut spec = minimal_spec();
        let ns = Namespaces {
            pid: true,
            net: true,
            ..Namespaces::default()
        };
        add_namespaces(&mut spec, ns);
        add_namespaces(&mut spec, ns);
        assert_eq!(
            namespaces(&spec),
            vec![
                NamespaceType::Mount,
                NamespaceType::Network,
                NamespaceType::Pid
            ]
        );
    }

    #[test]
    fn skeleton_without_cgroup_json_has_no_cgroup() {
        let spec =
            build_skeleton(&LaunchOptions::default(), &LauncherConfig::default(), false).unwrap();
        let linux = spec.linux.unwrap();
        assert!(linux.cgroups_path.is_none());
        assert!(linux.resources.is_none());
        assert!(spec.process.is_none());
        assert!(!spec.mounts.is_empty());
    }

    #[test]
    fn skeleton_with_cgroup_json_sets_path_and_resources() {
        let options = LaunchOptions {
            cgroups_json: r#"{"pids": {"limit": 10}}"#.to_owned(),
            ..LaunchOptions::default()
        };
        let config = LauncherConfig {
            systemd_cgroups: true,
            ..LauncherConfig::default()
        };
        let spec = build_skeleton(&options, &config, false).unwrap();
        let linux = spec.linux.unwrap();
        assert!(linux.cgroups_path.unwrap().starts_with("user.slice:ocilaunch:"));
        assert_eq!(linux.resources.unwrap().pids.unwrap().limit, 10);

        let spec = build_skeleton(&options, &config, true).unwrap();
        let path = spec.linux.unwrap().cgroups_path.unwrap();
        assert!(path.starts_with("system.slice:ocilaunch:"));
    }

    #[test]
    fn skeleton_propagates_mount_errors() {
        let options = LaunchOptions {
            bind_paths: vec!["/src:dst".to_owned()],
            ..LaunchOptions::default()
        };
        assert!(build_skeleton(&options, &LauncherConfig::default(), false).is_err());
    }

    #[test]
    fn mappings_bring_a_user_namespace() {
        let mut spec = minimal_spec();
        let mapping = IdentityMapping {
            uid: vec![LinuxIdMapping::new(0, 1, 1000)],
            gid: vec![LinuxIdMapping::new(0, 1, 1000)],
        };
        apply_id_mappings(&mut spec, &mapping);
        assert!(spec.has_namespace(NamespaceType::User));
        assert_eq!(spec.linux.unwrap().uid_mappings.len(), 1);
    }
}
