//! Image domain types shared across the catalog, registry and lifecycle
//! crates.

use std::fmt;

use serde::{
    Deserialize,
    Serialize,
};

use crate::runtime::Runtime;

/// Opaque image identifier. Canonically a UUIDv4 string; legacy integer ids
/// round-trip as their decimal form. Immutable after creation.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ImageId(String);

impl ImageId {
    pub fn generate<RT: Runtime>(rt: &RT) -> Self {
        Self(rt.new_uuid_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ImageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ImageId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ImageStatus {
    Queued,
    Saving,
    Active,
    Killed,
    PendingDelete,
    Deleted,
}

impl ImageStatus {
    /// States in which the soft-delete flag is expected to be set.
    pub fn is_deleted_state(&self) -> bool {
        matches!(self, ImageStatus::PendingDelete | ImageStatus::Deleted)
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DiskFormat {
    Ami,
    Ari,
    Aki,
    Vhd,
    Vmdk,
    Raw,
    Qcow2,
    Vdi,
    Iso,
}

impl DiskFormat {
    pub fn is_amazon(&self) -> bool {
        matches!(self, DiskFormat::Ami | DiskFormat::Ari | DiskFormat::Aki)
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ContainerFormat {
    Ami,
    Ari,
    Aki,
    Bare,
    Ovf,
}

impl ContainerFormat {
    pub fn is_amazon(&self) -> bool {
        matches!(
            self,
            ContainerFormat::Ami | ContainerFormat::Ari | ContainerFormat::Aki
        )
    }
}

/// When either format is amazon-style, both must be present and equal.
pub fn formats_compatible(disk: Option<DiskFormat>, container: Option<ContainerFormat>) -> bool {
    let disk_amazon = disk.is_some_and(|f| f.is_amazon());
    let container_amazon = container.is_some_and(|f| f.is_amazon());
    if !disk_amazon && !container_amazon {
        return true;
    }
    match (disk, container) {
        (Some(d), Some(c)) => d.to_string() == c.to_string(),
        _ => false,
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SortDir {
    Asc,
    Desc,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MemberStatus {
    Pending,
    Accepted,
    Rejected,
}
