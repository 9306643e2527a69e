//! Minimal parsing of `passwd(5)` and `group(5)` databases.
//!
//! Used both against the host's account files and against a container root
//! filesystem, so nothing here consults NSS.

use crate::RuntimeError;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdEntry {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub gecos: String,
    pub home: String,
    pub shell: String,
}

impl PasswdEntry {
    pub fn to_line(&self) -> String {
        format!(
            "{}:x:{}:{}:{}:{}:{}",
            self.name, self.uid, self.gid, self.gecos, self.home, self.shell
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub name: String,
    pub gid: u32,
    pub members: Vec<String>,
}

impl GroupEntry {
    pub fn to_line(&self) -> String {
        format!("{}:x:{}:{}", self.name, self.gid, self.members.join(","))
    }
}

fn is_record(line: &str) -> bool {
    let trimmed = line.trim();
    !trimmed.is_empty() && !trimmed.starts_with('#')
}

/// Parse one passwd line. Malformed lines yield `None` and are skipped by
/// callers, the same way libc tolerates them.
pub fn parse_passwd_line(line: &str) -> Option<PasswdEntry> {
    if !is_record(line) {
        return None;
    }
    let fields: Vec<&str> = line.trim_end().split(':').collect();
    if fields.len() != 7 {
        return None;
    }
    Some(PasswdEntry {
        name: fields[0].to_owned(),
        uid: fields[2].parse().ok()?,
        gid: fields[3].parse().ok()?,
        gecos: fields[4].to_owned(),
        home: fields[5].to_owned(),
        shell: fields[6].to_owned(),
    })
}

pub fn parse_group_line(line: &str) -> Option<GroupEntry> {
    if !is_record(line) {
        return None;
    }
    let fields: Vec<&str> = line.trim_end().split(':').collect();
    if fields.len() != 4 {
        return None;
    }
    let members = fields[3]
        .split(',')
        .filter(|m| !m.is_empty())
        .map(str::to_owned)
        .collect();
    Some(GroupEntry {
        name: fields[0].to_owned(),
        gid: fields[2].parse().ok()?,
        members,
    })
}

pub fn parse_passwd(content: &str) -> Vec<PasswdEntry> {
    content.lines().filter_map(parse_passwd_line).collect()
}

pub fn parse_group(content: &str) -> Vec<GroupEntry> {
    content.lines().filter_map(parse_group_line).collect()
}

pub fn read_passwd(path: &Path) -> Result<Vec<PasswdEntry>, RuntimeError> {
    Ok(parse_passwd(&std::fs::read_to_string(path)?))
}

pub fn read_group(path: &Path) -> Result<Vec<GroupEntry>, RuntimeError> {
    Ok(parse_group(&std::fs::read_to_string(path)?))
}

fn not_real(path: &Path, what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("{} is not a {what}", path.display()),
    )
}

/// `rootfs/etc`, refusing anything but a real directory so that reads and
/// writes stay inside the root filesystem. `Ok(None)` when it is absent.
pub fn image_etc_dir(rootfs: &Path) -> io::Result<Option<PathBuf>> {
    let etc = rootfs.join("etc");
    match fs::symlink_metadata(&etc) {
        Ok(meta) if meta.file_type().is_dir() => Ok(Some(etc)),
        Ok(_) => Err(not_real(&etc, "directory")),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Read `rootfs/etc/<name>` without following a symlink at either level.
/// `Ok(None)` when the file or `etc` is absent.
pub fn read_image_etc_file(rootfs: &Path, name: &str) -> io::Result<Option<String>> {
    let Some(etc) = image_etc_dir(rootfs)? else {
        return Ok(None);
    };
    let path = etc.join(name);
    match fs::symlink_metadata(&path) {
        Ok(meta) if meta.file_type().is_file() => fs::read_to_string(&path).map(Some),
        Ok(_) => Err(not_real(&path, "regular file")),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

pub fn find_user_by_name<'a>(entries: &'a [PasswdEntry], name: &str) -> Option<&'a PasswdEntry> {
    entries.iter().find(|e| e.name == name)
}

pub fn find_user_by_uid(entries: &[PasswdEntry], uid: u32) -> Option<&PasswdEntry> {
    entries.iter().find(|e| e.uid == uid)
}

pub fn find_group_by_name<'a>(entries: &'a [GroupEntry], name: &str) -> Option<&'a GroupEntry> {
    entries.iter().find(|e| e.name == name)
}

pub fn find_group_by_gid(entries: &[GroupEntry], gid: u32) -> Option<&GroupEntry> {
    entries.iter().find(|e| e.gid == gid)
}
