//! The wire-facing shapes of the registry: what clients submit and what
//! they get back. The transport maps headers and query strings onto these;
//! everything below the transport speaks these types.

use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    str::FromStr,
};

use catalog::{
    ImageFilters,
    Pagination,
};
use common::{
    runtime::UnixTimestamp,
    types::{
        ContainerFormat,
        DiskFormat,
        ImageId,
        ImageStatus,
        MemberStatus,
        SortDir,
    },
};
use errors::ErrorMetadata;
use serde::{
    Deserialize,
    Serialize,
};

/// Property names the server owns. Clients may not smuggle these through
/// the custom-property namespace.
pub const RESERVED_PROPERTIES: &[&str] = &[
    "owner",
    "is_public",
    "location",
    "deleted",
    "deleted_at",
    "direct_url",
    "self",
    "file",
    "schema",
];

/// Attributes the server computes. Creates carrying these are rejected.
pub const READONLY_ATTRIBUTES: &[&str] =
    &["created_at", "updated_at", "status", "checksum", "size"];

/// Client-submitted image metadata for create and update.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ImageDeclaration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_format: Option<DiskFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_format: Option<ContainerFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_public: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protected: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_disk: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_ram: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    /// Preset locations for bodies that already live in some backend.
    /// An image created with one goes straight to `active`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<LocationEntry>,
    /// Anything else the client sent as a base attribute. Readonly and
    /// unrecognized attributes are rejected during validation rather than
    /// silently dropped.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocationEntry {
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// An image as returned to clients. Location-carrying fields are omitted:
/// untrusted callers never learn where bodies live.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: String,
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
    pub deleted: bool,
    /// Milliseconds since the epoch.
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<u64>,
    pub properties: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
}

impl TryFrom<catalog::Image> for ImageRecord {
    type Error = anyhow::Error;

    fn try_from(image: catalog::Image) -> anyhow::Result<Self> {
        Ok(Self {
            id: image.id.to_string(),
            name: image.name,
            status: image.status,
            disk_format: image.disk_format,
            container_format: image.container_format,
            size: image.size,
            checksum: image.checksum,
            min_disk: image.min_disk,
            min_ram: image.min_ram,
            owner: image.owner,
            is_public: image.is_public,
            protected: image.protected,
            deleted: image.deleted,
            created_at: image.created_at.as_ms_since_epoch()?,
            updated_at: image.updated_at.as_ms_since_epoch()?,
            deleted_at: image
                .deleted_at
                .map(|ts| ts.as_ms_since_epoch())
                .transpose()?,
            properties: image.properties,
            tags: image.tags,
        })
    }
}

/// One membership grant as clients see it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemberEntry {
    pub member_id: String,
    pub can_share: bool,
    pub status: MemberStatus,
}

impl From<&catalog::ImageMember> for MemberEntry {
    fn from(member: &catalog::ImageMember) -> Self {
        Self {
            member_id: member.member.clone(),
            can_share: member.can_share,
            status: member.status,
        }
    }
}

/// Client-submitted membership for the replace-all and upsert endpoints.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MembershipDeclaration {
    pub member_id: String,
    /// None keeps the existing value, or defaults to false for a new grant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_share: Option<bool>,
}

/// One row of the shared-images listing for a member.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SharedImageEntry {
    pub image_id: String,
    pub can_share: bool,
    pub status: MemberStatus,
}

const PROPERTY_FILTER_PREFIX: &str = "property-";

/// Map listing query parameters onto typed filters. Unknown parameter names
/// and malformed values are client errors, never silently dropped.
pub fn parse_filters(params: &BTreeMap<String, String>) -> anyhow::Result<ImageFilters> {
    let mut filters = ImageFilters::default();
    for (key, value) in params {
        match key.as_str() {
            // Pagination parameters travel in the same query string.
            "marker" | "limit" | "sort_key" | "sort_dir" => continue,
            "name" => filters.name = Some(value.clone()),
            "status" => {
                filters.status = Some(parse_enum(value, "InvalidStatus", "image status")?)
            },
            "disk_format" => {
                filters.disk_format =
                    Some(parse_enum(value, "InvalidDiskFormat", "disk format")?)
            },
            "container_format" => {
                filters.container_format =
                    Some(parse_enum(value, "InvalidContainerFormat", "container format")?)
            },
            "owner" => filters.owner = Some(value.clone()),
            "checksum" => filters.checksum = Some(value.clone()),
            "is_public" => {
                filters.is_public = match value.to_ascii_lowercase().as_str() {
                    "none" | "any" => None,
                    other => Some(parse_bool(other, "is_public")?),
                }
            },
            "protected" => filters.protected = Some(parse_bool(value, "protected")?),
            "deleted" => filters.deleted = Some(parse_bool(value, "deleted")?),
            "changes-since" => {
                let secs: f64 = value.parse().map_err(|_| {
                    ErrorMetadata::bad_request(
                        "InvalidTimestamp",
                        format!("changes-since value '{value}' is not a timestamp"),
                    )
                })?;
                filters.changes_since = Some(UnixTimestamp::from_secs_f64(secs));
            },
            "size_min" => filters.size_min = Some(parse_range_value(key, value)?),
            "size_max" => filters.size_max = Some(parse_range_value(key, value)?),
            "min_disk" => {
                // Exact match expressed as a degenerate range.
                let v = parse_range_value(key, value)?;
                filters.min_disk_min = Some(v);
                filters.min_disk_max = Some(v);
            },
            "min_ram" => {
                let v = parse_range_value(key, value)?;
                filters.min_ram_min = Some(v);
                filters.min_ram_max = Some(v);
            },
            "min_disk_min" => filters.min_disk_min = Some(parse_range_value(key, value)?),
            "min_disk_max" => filters.min_disk_max = Some(parse_range_value(key, value)?),
            "min_ram_min" => filters.min_ram_min = Some(parse_range_value(key, value)?),
            "min_ram_max" => filters.min_ram_max = Some(parse_range_value(key, value)?),
            name if name.starts_with(PROPERTY_FILTER_PREFIX) => {
                filters.properties.insert(
                    name[PROPERTY_FILTER_PREFIX.len()..].to_owned(),
                    value.clone(),
                );
            },
            other => anyhow::bail!(ErrorMetadata::bad_request(
                "InvalidFilter",
                format!("'{other}' is not a filterable image attribute"),
            )),
        }
    }
    Ok(filters)
}

/// Map `marker`/`limit`/`sort_key`/`sort_dir` query parameters. Invalid
/// integers are client errors per the transport contract.
pub fn parse_pagination(params: &BTreeMap<String, String>) -> anyhow::Result<Pagination> {
    let mut pagination = Pagination::default();
    if let Some(marker) = params.get("marker") {
        pagination.marker = Some(ImageId::from(marker.as_str()));
    }
    if let Some(limit) = params.get("limit") {
        pagination.limit = Some(limit.parse().map_err(|_| {
            ErrorMetadata::bad_request(
                "InvalidLimit",
                format!("limit value '{limit}' is not an integer"),
            )
        })?);
    }
    if let Some(sort_key) = params.get("sort_key") {
        pagination.sort_key = Some(sort_key.clone());
    }
    if let Some(sort_dir) = params.get("sort_dir") {
        pagination.sort_dir = Some(SortDir::from_str(sort_dir).map_err(|_| {
            ErrorMetadata::bad_request(
                "InvalidSortDir",
                format!("sort_dir must be 'asc' or 'desc', got '{sort_dir}'"),
            )
        })?);
    }
    Ok(pagination)
}

fn parse_enum<T: FromStr>(value: &str, short_msg: &'static str, what: &str) -> anyhow::Result<T> {
    value.parse().map_err(|_| {
        ErrorMetadata::bad_request(short_msg, format!("'{value}' is not a recognized {what}"))
            .into()
    })
}

fn parse_bool(value: &str, what: &str) -> anyhow::Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => anyhow::bail!(ErrorMetadata::bad_request(
            "InvalidBool",
            format!("{what} value '{other}' is not a boolean"),
        )),
    }
}

fn parse_range_value(key: &str, value: &str) -> anyhow::Result<u64> {
    value.parse().map_err(|_| {
        ErrorMetadata::bad_request(
            "InvalidFilterRangeValue",
            format!("{key} value '{value}' is not a non-negative integer"),
        )
        .into()
    })
}
