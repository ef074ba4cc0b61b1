//! Persisted delta backup descriptor.
//!
//! The descriptor is written as a JSON sibling of a completed export; its
//! existence implies every referenced chain file exists and verifies. The
//! `version` field selects the import strategy.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BackupError, Result};

/// Version range handled by the current import path.
static CURRENT_FORMAT: LazyLock<VersionReq> =
    LazyLock::new(|| VersionReq::parse("^1").expect("format version range"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmDescriptor {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskDescriptor {
    pub id: Uuid,
    pub name: String,
    pub virtual_size: u64,
    /// Path of this disk's newest chain file, relative to the metadata's
    /// directory. Absent while the export stream is still in flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relative_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentDescriptor {
    /// Key of the attached disk in the export's disk map.
    pub disk_key: String,
    pub device: String,
    #[serde(default)]
    pub bootable: bool,
    #[serde(default)]
    pub read_only: bool,
}

/// Import strategy selected by the metadata's version field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportFormat {
    /// Version 0: per-disk content replay plus a whole-image sibling.
    Legacy,
    /// Any `^1` version: per-disk chain streams handed to the hypervisor.
    Current,
}

/// Everything the import needs except the live streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaBackupMetadata {
    /// Absent on legacy (v0) backups.
    #[serde(rename = "version", default, skip_serializing_if = "Option::is_none")]
    pub format_version: Option<String>,
    pub vm: VmDescriptor,
    pub disks: BTreeMap<String, DiskDescriptor>,
    pub attachments: Vec<AttachmentDescriptor>,
}

impl DeltaBackupMetadata {
    /// Selects the import path; any version outside `^1` is unsupported.
    pub fn import_format(&self) -> Result<ImportFormat> {
        let Some(version) = self.format_version.as_deref() else {
            return Ok(ImportFormat::Legacy);
        };
        let parsed = Version::parse(version)
            .map_err(|_| BackupError::UnsupportedVersion(version.to_string()))?;
        if CURRENT_FORMAT.matches(&parsed) {
            Ok(ImportFormat::Current)
        } else {
            Err(BackupError::UnsupportedVersion(version.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(version: Option<&str>) -> DeltaBackupMetadata {
        DeltaBackupMetadata {
            format_version: version.map(str::to_string),
            vm: VmDescriptor {
                id: Uuid::new_v4(),
                name: "web-1".into(),
            },
            disks: BTreeMap::new(),
            attachments: Vec::new(),
        }
    }

    #[test]
    fn version_field_selects_the_import_path() {
        assert_eq!(
            metadata(None).import_format().unwrap(),
            ImportFormat::Legacy
        );
        assert_eq!(
            metadata(Some("1.0.3")).import_format().unwrap(),
            ImportFormat::Current
        );
        assert!(matches!(
            metadata(Some("2.0.0")).import_format(),
            Err(BackupError::UnsupportedVersion(version)) if version == "2.0.0"
        ));
        assert!(matches!(
            metadata(Some("not-a-version")).import_format(),
            Err(BackupError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn legacy_metadata_serializes_without_a_version_field() {
        let raw = serde_json::to_value(metadata(None)).unwrap();
        assert!(raw.get("version").is_none());

        let raw = serde_json::to_value(metadata(Some("1.0.0"))).unwrap();
        assert_eq!(raw["version"], "1.0.0");
    }
}
