use std::collections::{
    BTreeMap,
    BTreeSet,
};

use common::{
    runtime::UnixTimestamp,
    types::{
        ContainerFormat,
        DiskFormat,
        ImageId,
        ImageStatus,
        MemberStatus,
    },
};
use errors::ErrorMetadata;

/// Timestamps persist as integer nanoseconds since the epoch so the
/// soft-delete clock can be strictly monotonic.
pub(crate) fn to_nanos(ts: UnixTimestamp) -> i64 {
    ts.as_nanos() as i64
}

pub(crate) fn from_nanos(nanos: i64) -> UnixTimestamp {
    UnixTimestamp::from_nanos(nanos as u64)
}

/// One image row with its children eagerly loaded. Child collections carry
/// live (non-deleted) rows only; soft-deleted children stay in the database
/// for history but never leave the store.
#[derive(Clone, Debug)]
pub struct Image {
    pub id: ImageId,
    pub name: Option<String>,
    pub status: ImageStatus,
    pub disk_format: Option<DiskFormat>,
    pub container_format: Option<ContainerFormat>,
    pub size: u64,
    pub checksum: Option<String>,
    pub min_disk: u64,
    pub min_ram: u64,
    pub owner: Option<String>,
    pub is_public: bool,
    pub protected: bool,
    pub created_at: UnixTimestamp,
    pub updated_at: UnixTimestamp,
    pub deleted_at: Option<UnixTimestamp>,
    pub deleted: bool,
    pub properties: BTreeMap<String, String>,
    pub tags: BTreeSet<String>,
    pub locations: Vec<ImageLocation>,
    pub members: Vec<ImageMember>,
}

impl Image {
    /// The first viable location is the default source for the body.
    pub fn default_location(&self) -> Option<&ImageLocation> {
        self.locations
            .iter()
            .find(|l| l.status == LocationStatus::Active)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageLocation {
    pub url: String,
    pub metadata: BTreeMap<String, String>,
    pub status: LocationStatus,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum LocationStatus {
    Active,
    Failed,
    PendingDelete,
    Deleted,
}

#[derive(Clone, Debug)]
pub struct ImageMember {
    /// Row id, used as the marker for membership listings.
    pub id: i64,
    pub image_id: ImageId,
    pub member: String,
    pub can_share: bool,
    pub status: MemberStatus,
    pub created_at: UnixTimestamp,
    pub updated_at: UnixTimestamp,
    pub deleted: bool,
}

/// Input for creating or updating a membership.
#[derive(Clone, Debug, Default)]
pub struct MemberValues {
    pub member: String,
    /// None keeps the existing value on update and defaults to false on
    /// create.
    pub can_share: Option<bool>,
    pub status: Option<MemberStatus>,
}

/// A patch of image attributes. `None` leaves the attribute untouched; the
/// inner option distinguishes "set to null" from "set to a value" for
/// nullable columns.
#[derive(Clone, Debug, Default)]
pub struct ImageValues {
    pub id: Option<ImageId>,
    pub name: Option<Option<String>>,
    pub status: Option<ImageStatus>,
    pub disk_format: Option<Option<DiskFormat>>,
    pub container_format: Option<Option<ContainerFormat>>,
    pub size: Option<u64>,
    pub checksum: Option<Option<String>>,
    pub min_disk: Option<u64>,
    pub min_ram: Option<u64>,
    pub owner: Option<Option<String>>,
    pub is_public: Option<bool>,
    pub protected: Option<bool>,
    pub properties: Option<BTreeMap<String, String>>,
    pub locations: Option<Vec<ImageLocation>>,
}

impl ImageValues {
    /// Validates the incoming data against the shape an image must have in
    /// the target status. Formats may be absent while an image is merely
    /// registered, but activation requires both to be present and
    /// recognized, and the amazon-style formats must agree.
    pub fn validate(
        status: ImageStatus,
        name: Option<&str>,
        disk_format: Option<DiskFormat>,
        container_format: Option<ContainerFormat>,
    ) -> anyhow::Result<()> {
        let activating = status == ImageStatus::Active;
        if activating && disk_format.is_none() {
            anyhow::bail!(ErrorMetadata::bad_request(
                "InvalidDiskFormat",
                "Disk format is required for an active image",
            ));
        }
        if activating && container_format.is_none() {
            anyhow::bail!(ErrorMetadata::bad_request(
                "InvalidContainerFormat",
                "Container format is required for an active image",
            ));
        }
        if !common::types::formats_compatible(disk_format, container_format) {
            anyhow::bail!(ErrorMetadata::bad_request(
                "InvalidFormatCombination",
                "When setting a disk or container format to one of 'ami', 'ari', or 'aki', the \
                 container and disk formats must match",
            ));
        }
        if let Some(name) = name {
            if name.len() > 255 {
                anyhow::bail!(ErrorMetadata::bad_request(
                    "ImageNameTooLong",
                    format!("Image name too long: {}", name.len()),
                ));
            }
        }
        Ok(())
    }
}
