use crate::host::HostIdentity;
use crate::idmap::read_subid;
use crate::oci::{find_in_path, find_runtime};
use ocilaunch_schema::LauncherConfig;
use std::fmt;

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: String,
    pub purpose: &'static str,
    pub install_hint: String,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (fix: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

/// Check what a launch needs on this host. Unprivileged callers also need
/// the ID-map helpers and subordinate ID ranges. Empty means ready.
pub fn check_prereqs(config: &LauncherConfig, host: &HostIdentity) -> Vec<MissingPrereq> {
    let mut missing = Vec::new();

    if find_runtime(config).is_err() {
        missing.push(MissingPrereq {
            name: config
                .runtime
                .clone()
                .unwrap_or_else(|| "OCI runtime".to_owned()),
            purpose: "OCI container execution",
            install_hint: "install one of: crun, runc, or youki".to_owned(),
        });
    }

    if host.is_root() {
        return missing;
    }

    for helper in [&config.newuidmap, &config.newgidmap] {
        if find_in_path(helper).is_none() {
            missing.push(MissingPrereq {
                name: helper.clone(),
                purpose: "writing user namespace ID mappings",
                install_hint: "part of shadow-utils / uidmap".to_owned(),
            });
        }
    }

    for (file, purpose) in [
        (&config.subuid_file, "subordinate UID range"),
        (&config.subgid_file, "subordinate GID range"),
    ] {
        if read_subid(file, &host.username, host.uid).is_err() {
            missing.push(MissingPrereq {
                name: file.display().to_string(),
                purpose,
                install_hint: format!(
                    "usermod --add-subuids/--add-subgids 100000-165535 {}",
                    host.username
                ),
            });
        }
    }

    missing
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nocilaunch needs these to run containers as this user.");
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn host(uid: u32) -> HostIdentity {
        HostIdentity {
            uid,
            gid: uid,
            username: "bob".to_owned(),
            group_name: None,
            home: PathBuf::from("/home/bob"),
            gecos: String::new(),
            shell: "/bin/sh".to_owned(),
        }
    }

    #[test]
    fn missing_prereq_display() {
        let m = MissingPrereq {
            name: "newuidmap".to_owned(),
            purpose: "id maps",
            install_hint: "apt install uidmap".to_owned(),
        };
        let s = format!("{m}");
        assert!(s.contains("newuidmap"));
        assert!(s.contains("id maps"));
        assert!(s.contains("apt install uidmap"));
    }

    #[test]
    fn unprivileged_checks_helpers_and_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let config = LauncherConfig {
            runtime: Some("/nonexistent/crun".to_owned()),
            newuidmap: "/nonexistent/newuidmap".to_owned(),
            newgidmap: "/nonexistent/newgidmap".to_owned(),
            subuid_file: dir.path().join("subuid"),
            subgid_file: dir.path().join("subgid"),
            ..LauncherConfig::default()
        };
        let missing = check_prereqs(&config, &host(1001));
        let names: Vec<&str> = missing.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(missing.len(), 5);
        assert!(names.contains(&"/nonexistent/crun"));
        assert!(names.contains(&"/nonexistent/newgidmap"));

        let text = format_missing(&missing);
        assert!(text.starts_with("missing prerequisites:"));
    }

    #[test]
    fn root_only_needs_a_runtime() {
        let config = LauncherConfig {
            runtime: Some("/nonexistent/crun".to_owned()),
            newuidmap: "/nonexistent/newuidmap".to_owned(),
            ..LauncherConfig::default()
        };
        assert_eq!(check_prereqs(&config, &host(0)).len(), 1);
    }
}
