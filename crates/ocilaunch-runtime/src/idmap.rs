//! Subordinate ID ranges and the user-namespace mappings derived from them.
//!
//! An unprivileged launch nests two user namespaces:
//!
//! ```text
//! host uid 1001 ──outer──▶ 0 (launcher, re-executed)
//! subuid range  ──outer──▶ 1..=size
//!                 0 ──reverse──▶ target uid inside the container
//! ```
//!
//! The outer mapping is written with newuidmap/newgidmap for the re-executed
//! launcher; the reverse mapping goes into the container's runtime spec so
//! the caller's identity shows up as the target UID/GID.

use crate::host::HostIdentity;
use crate::RuntimeError;
use ocilaunch_schema::{LauncherConfig, LinuxIdMapping};
use std::path::Path;

/// One `owner:start:count` entry of /etc/subuid or /etc/subgid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubIdRange {
    pub start: u32,
    pub size: u32,
}

/// Paired uid and gid mapping lists, valid for a single launch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityMapping {
    pub uid: Vec<LinuxIdMapping>,
    pub gid: Vec<LinuxIdMapping>,
}

/// Find the first usable range owned by `username` or numeric `id`.
pub fn parse_subid(content: &str, username: &str, id: u32) -> Option<SubIdRange> {
    let id_str = id.to_string();
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.split(':');
            let owner = fields.next()?;
            let start = fields.next()?.parse().ok()?;
            let size = fields.next()?.parse().ok()?;
            if fields.next().is_some() {
                return None;
            }
            Some((owner, SubIdRange { start, size }))
        })
        .find(|(owner, range)| (*owner == username || *owner == id_str) && range.size > 0)
        .map(|(_, range)| range)
}

pub fn read_subid(path: &Path, username: &str, id: u32) -> Result<SubIdRange, RuntimeError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        RuntimeError::MappingResolution(format!("could not read {}: {e}", path.display()))
    })?;
    parse_subid(&content, username, id).ok_or_else(|| {
        RuntimeError::MappingResolution(format!(
            "no subordinate ID range for {username} ({id}) in {}",
            path.display()
        ))
    })
}

/// Mapping for the namespace the launcher re-executes into: the caller
/// becomes 0, the subordinate range follows from 1.
pub fn outer_mapping(host_id: u32, range: SubIdRange) -> Vec<LinuxIdMapping> {
    vec![
        LinuxIdMapping::new(0, host_id, 1),
        LinuxIdMapping::new(1, range.start, range.size),
    ]
}

/// Mapping from the outer namespace into the container so that outer 0
/// (the caller) appears as `target`. The rest of the range fills the
/// remaining container IDs around it.
pub fn reverse_mapping(target: u32, range: SubIdRange) -> Vec<LinuxIdMapping> {
    let size = range.size;
    if target < size {
        let mut maps = Vec::with_capacity(3);
        if target > 0 {
            maps.push(LinuxIdMapping::new(0, 1, target));
        }
        maps.push(LinuxIdMapping::new(target, 0, 1));
        maps.push(LinuxIdMapping::new(target + 1, target + 1, size - target));
        maps
    } else {
        vec![
            LinuxIdMapping::new(0, 1, size),
            LinuxIdMapping::new(target, 0, 1),
        ]
    }
}

fn host_ranges(
    host: &HostIdentity,
    config: &LauncherConfig,
) -> Result<(SubIdRange, SubIdRange), RuntimeError> {
    let uid_range = read_subid(&config.subuid_file, &host.username, host.uid)?;
    let gid_range = read_subid(&config.subgid_file, &host.username, host.uid)?;
    Ok((uid_range, gid_range))
}

/// Reverse mappings placing `target_uid`/`target_gid` over the caller's
/// identity inside the container.
pub fn compute_mappings(
    target_uid: u32,
    target_gid: u32,
    host: &HostIdentity,
    config: &LauncherConfig,
) -> Result<IdentityMapping, RuntimeError> {
    let (uid_range, gid_range) = host_ranges(host, config)?;
    Ok(IdentityMapping {
        uid: reverse_mapping(target_uid, uid_range),
        gid: reverse_mapping(target_gid, gid_range),
    })
}

/// Outer mappings for the namespaced re-exec of the launcher.
pub fn namespace_mapping(
    host: &HostIdentity,
    config: &LauncherConfig,
) -> Result<IdentityMapping, RuntimeError> {
    let (uid_range, gid_range) = host_ranges(host, config)?;
    Ok(IdentityMapping {
        uid: outer_mapping(host.uid, uid_range),
        gid: outer_mapping(host.gid, gid_range),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const RANGE: SubIdRange = SubIdRange {
        start: 100_000,
        size: 65536,
    };

    fn host() -> HostIdentity {
        HostIdentity {
            uid: 1001,
            gid: 1001,
            username: "bob".to_owned(),
            group_name: Some("bob".to_owned()),
            home: PathBuf::from("/home/bob"),
            gecos: String::new(),
            shell: "/bin/bash".to_owned(),
        }
    }

    #[test]
    fn parse_matches_name_or_uid() {
        let content = "alice:200000:65536\n1001:300000:1000\n";
        assert_eq!(
            parse_subid(content, "bob", 1001),
            Some(SubIdRange {
                start: 300_000,
                size: 1000
            })
        );
        assert_eq!(parse_subid(content, "alice", 1000).unwrap().start, 200_000);
        assert!(parse_subid(content, "carol", 1002).is_none());
    }

    #[test]
    fn parse_skips_empty_ranges_and_junk() {
        let content = "# comment\nbob:100000:0\nbob:bad:1\nbob:500000:10\n";
        assert_eq!(parse_subid(content, "bob", 1001).unwrap().start, 500_000);
    }

    #[test]
    fn reverse_mapping_within_range() {
        let maps = reverse_mapping(1000, RANGE);
        assert_eq!(
            maps,
            vec![
                LinuxIdMapping::new(0, 1, 1000),
                LinuxIdMapping::new(1000, 0, 1),
                LinuxIdMapping::new(1001, 1001, 64536),
            ]
        );
    }

    #[test]
    fn reverse_mapping_beyond_range() {
        let maps = reverse_mapping(100_000, RANGE);
        assert_eq!(
            maps,
            vec![
                LinuxIdMapping::new(0, 1, 65536),
                LinuxIdMapping::new(100_000, 0, 1),
            ]
        );
    }

    #[test]
    fn reverse_mapping_never_overlaps_container_ids() {
        for target in [1, 999, 65535, 65536, 70_000] {
            let maps = reverse_mapping(target, RANGE);
            let mut ranges: Vec<(u32, u32)> = maps
                .iter()
                .map(|m| (m.container_id, m.container_id + m.size))
                .collect();
            ranges.sort_unstable();
            for pair in ranges.windows(2) {
                assert!(pair[0].1 <= pair[1].0, "overlap for target {target}");
            }
            assert!(maps.iter().any(|m| m.container_id == target && m.host_id == 0));
        }
    }

    #[test]
    fn outer_mapping_roots_caller() {
        assert_eq!(
            outer_mapping(1001, RANGE),
            vec![
                LinuxIdMapping::new(0, 1001, 1),
                LinuxIdMapping::new(1, 100_000, 65536),
            ]
        );
    }

    #[test]
    fn compute_mappings_reads_configured_files() {
        let dir = tempfile::tempdir().unwrap();
        let subuid = dir.path().join("subuid");
        let subgid = dir.path().join("subgid");
        std::fs::write(&subuid, "bob:100000:65536\n").unwrap();
        std::fs::write(&subgid, "bob:200000:65536\n").unwrap();
        let config = LauncherConfig {
            subuid_file: subuid,
            subgid_file: subgid,
            ..LauncherConfig::default()
        };

        let mapping = compute_mappings(1001, 1001, &host(), &config).unwrap();
        assert!(mapping.uid.contains(&LinuxIdMapping::new(1001, 0, 1)));
        assert!(mapping.gid.contains(&LinuxIdMapping::new(1001, 0, 1)));

        let outer = namespace_mapping(&host(), &config).unwrap();
        assert_eq!(outer.gid[1], LinuxIdMapping::new(1, 200_000, 65536));
    }

    #[test]
    fn missing_ranges_fail_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let subuid = dir.path().join("subuid");
        std::fs::write(&subuid, "alice:100000:65536\n").unwrap();
        let config = LauncherConfig {
            subuid_file: subuid,
            subgid_file: dir.path().join("absent"),
            ..LauncherConfig::default()
        };
        assert!(matches!(
            compute_mappings(1001, 1001, &host(), &config),
            Err(RuntimeError::MappingResolution(_))
        ));
    }
}
