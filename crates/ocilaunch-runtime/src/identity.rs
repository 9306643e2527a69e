use crate::host::HostIdentity;
use crate::passwd::{
    find_group_by_name, find_user_by_name, find_user_by_uid, parse_group, parse_passwd,
    read_image_etc_file, GroupEntry, PasswdEntry,
};
use crate::RuntimeError;
use std::path::Path;
use tracing::debug;

/// The identity the container process will run as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub uid: u32,
    pub gid: u32,
    /// The identity comes from the image's USER rather than the caller.
    pub image_declared: bool,
}

impl ResolvedIdentity {
    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

/// Resolve the container identity.
///
/// Defaults to the caller's identity; an image USER replaces it and marks
/// it image-declared; fakeroot overrides both with 0:0.
pub fn resolve_identity(
    image_user: &str,
    rootfs: &Path,
    fakeroot: bool,
    host: &HostIdentity,
) -> Result<ResolvedIdentity, RuntimeError> {
    let mut identity = ResolvedIdentity {
        uid: host.uid,
        gid: host.gid,
        image_declared: false,
    };

    if !image_user.is_empty() {
        let (uid, gid) = bundle_user(rootfs, image_user)?;
        debug!("running as USER specified in image config {uid}:{gid}");
        identity = ResolvedIdentity {
            uid,
            gid,
            image_declared: true,
        };
    }

    if fakeroot {
        identity.uid = 0;
        identity.gid = 0;
    }

    Ok(identity)
}

/// Reverse ID mappings are needed only when an unprivileged caller runs the
/// container as someone other than root.
pub fn needs_mapping(target_uid: u32, host_uid: u32) -> bool {
    target_uid != 0 && host_uid != 0
}

/// Resolve an image USER (`user[:group]`, names or numbers) against the
/// bundle root filesystem's passwd and group files.
pub fn bundle_user(rootfs: &Path, user: &str) -> Result<(u32, u32), RuntimeError> {
    let users = parse_passwd(&read_etc(rootfs, "passwd")?);
    let groups = parse_group(&read_etc(rootfs, "group")?);

    let (user_part, group_part) = match user.split_once(':') {
        Some((u, g)) => (u, Some(g)),
        None => (user, None),
    };

    let (uid, passwd_gid) = lookup_user(&users, user_part)?;
    let gid = match group_part {
        Some(g) if !g.is_empty() => lookup_group(&groups, g)?,
        _ => passwd_gid.unwrap_or(0),
    };
    Ok((uid, gid))
}

fn read_etc(rootfs: &Path, name: &str) -> Result<String, RuntimeError> {
    read_image_etc_file(rootfs, name)
        .map(Option::unwrap_or_default)
        .map_err(|e| RuntimeError::UserLookup(format!("cannot read container {name}: {e}")))
}

fn lookup_user(users: &[PasswdEntry], user: &str) -> Result<(u32, Option<u32>), RuntimeError> {
    if let Ok(uid) = user.parse::<u32>() {
        return Ok((uid, find_user_by_uid(users, uid).map(|e| e.gid)));
    }
    find_user_by_name(users, user)
        .map(|e| (e.uid, Some(e.gid)))
        .ok_or_else(|| RuntimeError::UserLookup(format!("no user '{user}' in container passwd")))
}

fn lookup_group(groups: &[GroupEntry], group: &str) -> Result<u32, RuntimeError> {
    if let Ok(gid) = group.parse::<u32>() {
        return Ok(gid);
    }
    find_group_by_name(groups, group)
        .map(|g| g.gid)
        .ok_or_else(|| RuntimeError::UserLookup(format!("no group '{group}' in container group")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    fn host(uid: u32) -> HostIdentity {
        HostIdentity {
            uid,
            gid: uid,
            username: "caller".to_owned(),
            group_name: None,
            home: PathBuf::from("/home/caller"),
            gecos: String::new(),
            shell: "/bin/sh".to_owned(),
        }
    }

    fn rootfs() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("etc")).unwrap();
        fs::write(
            dir.path().join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/sh\nweb:x:1000:1000::/srv:/bin/sh\n",
        )
        .unwrap();
        fs::write(dir.path().join("etc/group"), "root:x:0:\nweb:x:1000:\nstaff:x:50:\n").unwrap();
        dir
    }

    #[test]
    fn no_image_user_uses_caller() {
        let root = rootfs();
        let id = resolve_identity("", root.path(), false, &host(1001)).unwrap();
        assert_eq!((id.uid, id.gid), (1001, 1001));
        assert!(!id.image_declared);
    }

    #[test]
    fn image_user_by_name() {
        let root = rootfs();
        let id = resolve_identity("web", root.path(), false, &host(1001)).unwrap();
        assert_eq!((id.uid, id.gid), (1000, 1000));
        assert!(id.image_declared);
    }

    #[test]
    fn image_user_by_uid_gets_matching_gid() {
        let root = rootfs();
        let id = resolve_identity("1000", root.path(), false, &host(1001)).unwrap();
        assert_eq!((id.uid, id.gid), (1000, 1000));
    }

    #[test]
    fn fakeroot_wins_over_image_user() {
        let root = rootfs();
        let id = resolve_identity("web", root.path(), true, &host(1001)).unwrap();
        assert_eq!((id.uid, id.gid), (0, 0));
        assert!(id.is_root());
    }

    #[test]
    fn user_and_group_forms() {
        let root = rootfs();
        assert_eq!(bundle_user(root.path(), "web:staff").unwrap(), (1000, 50));
        assert_eq!(bundle_user(root.path(), "1000:7").unwrap(), (1000, 7));
        assert_eq!(bundle_user(root.path(), "4242").unwrap(), (4242, 0));
    }

    #[test]
    fn unknown_names_fail() {
        let root = rootfs();
        assert!(matches!(
            bundle_user(root.path(), "nobody-here"),
            Err(RuntimeError::UserLookup(_))
        ));
        assert!(bundle_user(root.path(), "web:nogroup").is_err());
    }

    #[test]
    fn rootfs_without_etc_still_resolves_numbers() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(bundle_user(dir.path(), "10:20").unwrap(), (10, 20));
    }

    #[test]
    fn symlinked_etc_is_not_consulted() {
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("passwd"), "web:x:1000:1000::/srv:/bin/sh\n").unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("etc")).unwrap();

        assert!(matches!(
            bundle_user(dir.path(), "web"),
            Err(RuntimeError::UserLookup(_))
        ));
    }

    #[test]
    fn mapping_predicate() {
        assert!(needs_mapping(1001, 1001));
        assert!(!needs_mapping(0, 1001));
        assert!(!needs_mapping(1001, 0));
        assert!(!needs_mapping(0, 0));
    }
}
