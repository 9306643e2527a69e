use crate::passwd::{find_group_by_gid, find_user_by_uid, read_group, read_passwd};
use crate::RuntimeError;
use ocilaunch_schema::LauncherConfig;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Safe wrapper around libc::getuid().
#[allow(unsafe_code)]
pub fn current_uid() -> u32 {
    // SAFETY: getuid() takes no arguments and cannot fail.
    unsafe { libc::getuid() }
}

/// Safe wrapper around libc::getgid().
#[allow(unsafe_code)]
pub fn current_gid() -> u32 {
    // SAFETY: getgid() takes no arguments and cannot fail.
    unsafe { libc::getgid() }
}

/// The identity of the process running the launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    pub uid: u32,
    pub gid: u32,
    pub username: String,
    /// Host group name for `gid`, when the group database has one.
    pub group_name: Option<String>,
    pub home: PathBuf,
    pub gecos: String,
    pub shell: String,
}

impl HostIdentity {
    /// Look up the calling user in the configured host account files,
    /// falling back to `$USER` / `$HOME` when the caller has no passwd entry.
    pub fn current(config: &LauncherConfig) -> Result<Self, RuntimeError> {
        Self::lookup(
            current_uid(),
            current_gid(),
            &config.passwd_file,
            &config.group_file,
        )
    }

    pub fn lookup(
        uid: u32,
        gid: u32,
        passwd_file: &Path,
        group_file: &Path,
    ) -> Result<Self, RuntimeError> {
        let users = read_passwd(passwd_file).unwrap_or_default();
        let groups = read_group(group_file).unwrap_or_default();
        let group_name = find_group_by_gid(&groups, gid).map(|g| g.name.clone());

        if let Some(entry) = find_user_by_uid(&users, uid) {
            return Ok(Self {
                uid,
                gid,
                username: entry.name.clone(),
                group_name,
                home: PathBuf::from(&entry.home),
                gecos: entry.gecos.clone(),
                shell: entry.shell.clone(),
            });
        }

        debug!("uid {uid} not found in {}, using environment", passwd_file.display());
        let username = std::env::var("USER").map_err(|_| {
            RuntimeError::UserLookup(format!("no passwd entry or $USER for uid {uid}"))
        })?;
        let home = std::env::var("HOME").map_or_else(
            |_| PathBuf::from(format!("/home/{username}")),
            PathBuf::from,
        );
        Ok(Self {
            uid,
            gid,
            username,
            group_name,
            home,
            gecos: String::new(),
            shell: "/bin/sh".to_owned(),
        })
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn lookup_reads_host_files() {
        let dir = tempfile::tempdir().unwrap();
        let passwd = dir.path().join("passwd");
        let group = dir.path().join("group");
        fs::write(&passwd, "bob:x:1001:1001:Bob:/home/bob:/bin/bash\n").unwrap();
        fs::write(&group, "bob:x:1001:\n").unwrap();

        let host = HostIdentity::lookup(1001, 1001, &passwd, &group).unwrap();
        assert_eq!(host.username, "bob");
        assert_eq!(host.home, PathBuf::from("/home/bob"));
        assert_eq!(host.group_name.as_deref(), Some("bob"));
        assert!(!host.is_root());
    }

    #[test]
    fn unknown_group_leaves_name_unset() {
        let dir = tempfile::tempdir().unwrap();
        let passwd = dir.path().join("passwd");
        fs::write(&passwd, "root:x:0:0:root:/root:/bin/bash\n").unwrap();

        let host = HostIdentity::lookup(0, 0, &passwd, &dir.path().join("missing")).unwrap();
        assert!(host.is_root());
        assert!(host.group_name.is_none());
    }
}
