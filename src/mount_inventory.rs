//! Filesystem discovery (`spec.md` §1 "external collaborators", expanded in
//! `SPEC_FULL.md` §4.8): restores the `show-vols` behavior of the original
//! `bedup` tool by parsing `/proc/self/mountinfo` for Btrfs mount points and
//! shelling out to `blkid` to map block devices to filesystem UUIDs/labels.
//! This is genuinely external-collaborator-shaped (it reads `/proc`, it
//! forks a subprocess) but `show-vols`/`forget-vol` need a concrete
//! implementation to do anything, so one ships here rather than staying a
//! bare trait.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::Command;

/// One Btrfs mount point observed in `/proc/self/mountinfo`: the subvolume
/// path relative to the filesystem's top level, and where it's mounted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BtrfsMountPoint {
    pub volume_path: String,
    pub mount_point: PathBuf,
}

/// One line of `blkid -t TYPE=btrfs` output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlkidEntry {
    pub device: PathBuf,
    pub label: Option<String>,
    pub uuid: String,
}

/// Capability for discovering Btrfs mount topology, kept as a trait so
/// `show-vols`/`forget-vol` can be tested without a real `/proc` or `blkid`
/// on the test machine.
pub trait MountInventory {
    /// Maps each real device path to the Btrfs mount points found on it,
    /// parsed from `/proc/self/mountinfo`.
    fn btrfs_mount_points(&self) -> io::Result<HashMap<PathBuf, Vec<BtrfsMountPoint>>>;

    /// Runs `blkid -s LABEL -s UUID -t TYPE=btrfs` and parses its output.
    fn blkid_btrfs_devices(&self) -> io::Result<Vec<BlkidEntry>>;
}

/// The real implementation: reads `/proc/self/mountinfo`, shells out to the
/// `blkid` binary on `$PATH`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LinuxMountInventory;

impl MountInventory for LinuxMountInventory {
    fn btrfs_mount_points(&self) -> io::Result<HashMap<PathBuf, Vec<BtrfsMountPoint>>> {
        let content = fs::read_to_string("/proc/self/mountinfo")?;
        Ok(parse_mountinfo(&content))
    }

    fn blkid_btrfs_devices(&self) -> io::Result<Vec<BlkidEntry>> {
        let output = Command::new("blkid")
            .args(["-s", "LABEL", "-s", "UUID", "-t", "TYPE=btrfs"])
            .output()?;
        // blkid exits non-zero when it simply finds no matching devices;
        // only a missing binary or a killed process is worth surfacing.
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_blkid(&stdout))
    }
}

/// Parses the `mountinfo(5)` format, keeping only `fstype == btrfs` rows and
/// resolving each device to its canonical path (following symlinks) so it
/// can be matched against `blkid`'s device column.
///
/// Mirrors `original_source/bedup/tracking.py::parse_btrfs_mountinfo`: field
/// 4 (0-indexed 3) is the subvolume's root path within the filesystem,
/// field 5 is the mount point, and the filesystem type/device sit right
/// after the `-` separator field.
fn parse_mountinfo(content: &str) -> HashMap<PathBuf, Vec<BtrfsMountPoint>> {
    let mut by_dev: HashMap<PathBuf, Vec<BtrfsMountPoint>> = HashMap::new();
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(sep_idx) = fields.iter().position(|&f| f == "-") else {
            continue;
        };
        if fields.len() < sep_idx + 3 || fields.len() < 5 {
            continue;
        }
        let fs_type = fields[sep_idx + 1];
        if fs_type != "btrfs" {
            continue;
        }
        let volume_path = fields[3].to_string();
        let mount_point = PathBuf::from(fields[4]);
        let raw_dev = PathBuf::from(fields[sep_idx + 2]);
        let dev = fs::canonicalize(&raw_dev).unwrap_or(raw_dev);

        by_dev.entry(dev).or_default().push(BtrfsMountPoint {
            volume_path,
            mount_point,
        });
    }
    by_dev
}

/// Parses `blkid -s LABEL -s UUID -t TYPE=btrfs` output, one line per
/// device: `/dev/sda1: LABEL="root" UUID="..."` (label is optional).
fn parse_blkid(output: &str) -> Vec<BlkidEntry> {
    let mut entries = Vec::new();
    for line in output.lines() {
        let Some((dev, rest)) = line.split_once(':') else {
            continue;
        };
        let label = extract_quoted(rest, "LABEL=\"");
        let Some(uuid) = extract_quoted(rest, "UUID=\"") else {
            continue;
        };
        entries.push(BlkidEntry {
            device: PathBuf::from(dev.trim()),
            label,
            uuid,
        });
    }
    entries
}

fn extract_quoted(s: &str, key: &str) -> Option<String> {
    let start = s.find(key)? + key.len();
    let rest = &s[start..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_btrfs_lines_and_skips_other_filesystems() {
        let sample = "\
25 30 0:23 / / rw,relatime shared:1 - ext4 /dev/sda2 rw\n\
26 25 0:24 /subvol1 /mnt/data rw,relatime shared:2 - btrfs /dev/sda3 rw,space_cache\n\
27 25 0:24 / /mnt/other rw,relatime shared:3 - btrfs /dev/sda3 rw,space_cache\n";
        let by_dev = parse_mountinfo(sample);
        // /dev/sda3 may not exist on the test machine so canonicalize falls
        // back to the raw path; either way both btrfs lines land together.
        let entries = by_dev
            .values()
            .find(|v| v.iter().any(|m| m.mount_point == PathBuf::from("/mnt/data")))
            .expect("btrfs device entry present");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].volume_path, "/subvol1");
        assert_eq!(entries[1].volume_path, "/");
    }

    #[test]
    fn parses_blkid_output_with_and_without_label() {
        let sample = "/dev/sda3: LABEL=\"root\" UUID=\"1234-5678\"\n/dev/sdb1: UUID=\"abcd-ef00\"\n";
        let entries = parse_blkid(sample);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].device, PathBuf::from("/dev/sda3"));
        assert_eq!(entries[0].label.as_deref(), Some("root"));
        assert_eq!(entries[0].uuid, "1234-5678");
        assert_eq!(entries[1].label, None);
        assert_eq!(entries[1].uuid, "abcd-ef00");
    }
}
