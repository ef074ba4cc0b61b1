//! Backup chain model: the filename, timestamp and directory laws shared
//! by the catalog, the merger and the coordinator.

pub mod catalog;
pub mod merge;

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use uuid::Uuid;

/// Incremental disk-image extension used for chain files.
pub const DISK_IMAGE_EXT: &str = "vhd";

/// Whole-VM image extension used by plain backups and legacy siblings.
pub const FULL_IMAGE_EXT: &str = "ova";

/// Extension of the persisted delta backup descriptor.
pub const METADATA_EXT: &str = "json";

/// Per-VM delta roots on the remote are `vm_delta_<tag>_<vm-id>`.
pub const DELTA_DIR_PREFIX: &str = "vm_delta_";

/// Compact UTC format whose lexicographic order is chronological.
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

static BACKUP_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{8}T\d{6}Z)_(full|delta)\.vhd$").expect("backup filename pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupKind {
    Full,
    Delta,
}

impl BackupKind {
    fn as_str(self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Delta => "delta",
        }
    }
}

/// One classified file of a disk's backup chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    pub file_name: String,
    pub timestamp: String,
    pub kind: BackupKind,
}

impl BackupEntry {
    /// Classifies a directory entry; anything outside the filename law is
    /// not part of the chain.
    pub fn parse(file_name: &str) -> Option<Self> {
        let captures = BACKUP_FILE.captures(file_name)?;
        let kind = if &captures[2] == "full" {
            BackupKind::Full
        } else {
            BackupKind::Delta
        };
        Some(Self {
            file_name: file_name.to_string(),
            timestamp: captures[1].to_string(),
            kind,
        })
    }

    pub fn is_full(&self) -> bool {
        self.kind == BackupKind::Full
    }
}

/// Chain filename for a backup taken at `timestamp`.
pub fn backup_file_name(timestamp: &str, kind: BackupKind) -> String {
    format!("{timestamp}_{}.{DISK_IMAGE_EXT}", kind.as_str())
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

pub fn timestamp_now() -> String {
    format_timestamp(Utc::now())
}

/// Delta root for one (tag, VM) pair.
pub fn delta_backup_dir(tag: &str, vm: Uuid) -> String {
    format!("{DELTA_DIR_PREFIX}{tag}_{vm}")
}

/// Chain directory of one disk, relative to its VM's delta root.
pub fn disk_backup_dir(disk: Uuid) -> String {
    format!("disk_{disk}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn classifies_chain_file_names() {
        let full = BackupEntry::parse("20260105T031500Z_full.vhd").unwrap();
        assert_eq!(full.kind, BackupKind::Full);
        assert_eq!(full.timestamp, "20260105T031500Z");

        let delta = BackupEntry::parse("20260106T031500Z_delta.vhd").unwrap();
        assert_eq!(delta.kind, BackupKind::Delta);

        assert!(BackupEntry::parse("20260105T031500Z_full.vhd.checksum").is_none());
        assert!(BackupEntry::parse("notes.txt").is_none());
        assert!(BackupEntry::parse("20260105T031500Z_incr.vhd").is_none());
    }

    #[test]
    fn timestamps_sort_chronologically() {
        let earlier = Utc.with_ymd_and_hms(2026, 1, 5, 3, 15, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2026, 1, 5, 14, 0, 0).unwrap();
        assert!(format_timestamp(earlier) < format_timestamp(later));
        assert_eq!(format_timestamp(earlier), "20260105T031500Z");
    }

    #[test]
    fn file_names_round_trip_through_parse() {
        let name = backup_file_name("20260105T031500Z", BackupKind::Delta);
        assert_eq!(name, "20260105T031500Z_delta.vhd");
        assert_eq!(BackupEntry::parse(&name).unwrap().kind, BackupKind::Delta);
    }
}
