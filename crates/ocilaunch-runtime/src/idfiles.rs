//! Synthetic passwd/group records for callers the image knows nothing about.
//!
//! Both files live in the image's `etc`, which must be a real directory.
//! Each file goes through two phases. Generating the new content may fail
//! (unreadable file, odd input); that is reported as a warning and the file
//! is left alone. Writing the generated content may fail too; that is fatal.

use crate::host::HostIdentity;
use crate::passwd::{parse_group_line, parse_passwd_line, read_image_etc_file, PasswdEntry};
use crate::RuntimeError;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// What a sync did: files rewritten and per-file generation warnings.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub written: Vec<PathBuf>,
    pub warnings: Vec<RuntimeError>,
}

fn join_lines(lines: &[String]) -> Vec<u8> {
    let mut out = lines.join("\n");
    out.push('\n');
    out.into_bytes()
}

fn read_source(rootfs: &Path, name: &str) -> Result<String, RuntimeError> {
    let failed = |reason: String| {
        RuntimeError::IdentityGeneration(format!(
            "failed to read {name} file content in container: {reason}"
        ))
    };
    read_image_etc_file(rootfs, name)
        .map_err(|e| failed(e.to_string()))?
        .ok_or_else(|| failed("no such file".to_owned()))
}

/// New passwd content: existing rows minus any for `uid` or the caller's
/// name, plus a row for the caller carrying the resolved ids and the
/// caller's own home directory.
pub fn generate_passwd(
    rootfs: &Path,
    host: &HostIdentity,
    uid: u32,
    gid: u32,
) -> Result<Vec<u8>, RuntimeError> {
    let content = read_source(rootfs, "passwd")?;

    let mut lines: Vec<String> = content
        .lines()
        .filter(|line| {
            parse_passwd_line(line).map_or(true, |e| e.uid != uid && e.name != host.username)
        })
        .map(str::to_owned)
        .collect();

    let shell_in_rootfs = rootfs.join(host.shell.trim_start_matches('/'));
    let shell = if !host.shell.is_empty() && shell_in_rootfs.exists() {
        host.shell.clone()
    } else {
        "/bin/sh".to_owned()
    };

    let entry = PasswdEntry {
        name: host.username.clone(),
        uid,
        gid,
        gecos: host.gecos.clone(),
        home: host.home.display().to_string(),
        shell,
    };
    lines.push(entry.to_line());
    Ok(join_lines(&lines))
}

/// New group content: the caller is added as a member of an existing group
/// with `gid`, or a group named after the caller's host group is appended.
pub fn generate_group(
    rootfs: &Path,
    host: &HostIdentity,
    gid: u32,
) -> Result<Vec<u8>, RuntimeError> {
    let content = read_source(rootfs, "group")?;

    let mut found = false;
    let mut lines: Vec<String> = Vec::new();
    for line in content.lines() {
        match parse_group_line(line) {
            Some(mut group) if group.gid == gid => {
                found = true;
                if !group.members.contains(&host.username) {
                    group.members.push(host.username.clone());
                }
                lines.push(group.to_line());
            }
            _ => lines.push(line.to_owned()),
        }
    }

    if !found {
        let name = host
            .group_name
            .clone()
            .unwrap_or_else(|| host.username.clone());
        lines.push(format!("{name}:x:{gid}:{}", host.username));
    }
    Ok(join_lines(&lines))
}

/// Replace `path` with `content`, mode 0644. A symlink planted in the image
/// is removed rather than followed, and the parent must be a real directory.
pub fn write_identity_file(path: &Path, content: &[u8]) -> Result<(), RuntimeError> {
    if let Some(parent) = path.parent() {
        let meta = fs::symlink_metadata(parent)?;
        if !meta.file_type().is_dir() {
            return Err(RuntimeError::IdentityFileWrite(format!(
                "{} is not a directory",
                parent.display()
            )));
        }
    }
    if let Ok(meta) = fs::symlink_metadata(path) {
        if meta.file_type().is_symlink() {
            fs::remove_file(path)?;
        }
    }
    fs::write(path, content)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o644))?;
    Ok(())
}

/// Run the write phase for one file. Returns `(warning, fatal)`: a failed
/// generation becomes the warning and nothing is written; a failed write
/// becomes the fatal error.
pub fn sync_file(
    path: &Path,
    generated: Result<Vec<u8>, RuntimeError>,
) -> (Option<RuntimeError>, Result<(), RuntimeError>) {
    match generated {
        Err(e) => (Some(e), Ok(())),
        Ok(content) => (
            None,
            write_identity_file(path, &content).map_err(|e| {
                RuntimeError::IdentityFileWrite(format!("while writing {}: {e}", path.display()))
            }),
        ),
    }
}

/// Add the caller to the container's `etc/passwd` and `etc/group`.
///
/// Does nothing when the launcher runs as host root or in fakeroot mode:
/// the container then runs as root or remapped to root, and the image's own
/// records apply.
pub fn sync_identity_files(
    rootfs: &Path,
    uid: u32,
    gid: u32,
    host: &HostIdentity,
    fakeroot: bool,
) -> Result<SyncOutcome, RuntimeError> {
    let mut outcome = SyncOutcome::default();
    if host.is_root() || fakeroot {
        return Ok(outcome);
    }

    let passwd = rootfs.join("etc").join("passwd");
    let group = rootfs.join("etc").join("group");

    debug!("updating passwd file: {}", passwd.display());
    let generated = generate_passwd(rootfs, host, uid, gid);
    let (warning, fatal) = sync_file(&passwd, generated);
    record(&mut outcome, &passwd, warning, fatal)?;

    debug!("updating group file: {}", group.display());
    let generated = generate_group(rootfs, host, gid);
    let (warning, fatal) = sync_file(&group, generated);
    record(&mut outcome, &group, warning, fatal)?;

    Ok(outcome)
}

fn record(
    outcome: &mut SyncOutcome,
    path: &Path,
    warning: Option<RuntimeError>,
    fatal: Result<(), RuntimeError>,
) -> Result<(), RuntimeError> {
    fatal?;
    match warning {
        Some(w) => {
            warn!("{w}");
            outcome.warnings.push(w);
        }
        None => outcome.written.push(path.to_path_buf()),
    }
    Ok(())
}
