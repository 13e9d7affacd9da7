use std::collections::BTreeSet;

use catalog::{
    visibility,
    CatalogStore,
    Image,
    ImageFilters,
    ImageLocation,
    ImageValues,
    LocationStatus,
    MemberValues,
    Pagination,
};
use common::{
    context::RequestContext,
    knobs::{
        IMAGE_MEMBER_QUOTA,
        IMAGE_PROPERTY_QUOTA,
        IMAGE_TAG_QUOTA,
    },
    runtime::Runtime,
    types::{
        ImageId,
        ImageStatus,
    },
};
use errors::ErrorMetadata;

use crate::api::{
    ImageDeclaration,
    ImageRecord,
    MemberEntry,
    MembershipDeclaration,
    SharedImageEntry,
    READONLY_ATTRIBUTES,
    RESERVED_PROPERTIES,
};

/// The request/response layer over the catalog. Every write authorizes
/// before it touches the store; every read comes back already filtered.
pub struct RegistryService<RT: Runtime> {
    catalog: CatalogStore<RT>,
}

impl<RT: Runtime> Clone for RegistryService<RT> {
    fn clone(&self) -> Self {
        Self {
            catalog: self.catalog.clone(),
        }
    }
}

impl<RT: Runtime> RegistryService<RT> {
    pub fn new(catalog: CatalogStore<RT>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &CatalogStore<RT> {
        &self.catalog
    }

    /// Registers a new image. With preset locations the image is born
    /// `active`; otherwise it waits in `queued` for a body.
    pub async fn create_image(
        &self,
        ctx: &RequestContext,
        mut declaration: ImageDeclaration,
    ) -> anyhow::Result<ImageRecord> {
        guard_writable(ctx)?;

        // A body-backed image gets its size measured during upload, so a
        // declared size is readonly there. A registration against a preset
        // location has no upload, so the caller's word is all there is.
        let preset_size = if declaration.locations.is_empty() {
            None
        } else {
            declaration
                .extra
                .remove("size")
                .map(|v| {
                    v.as_u64().ok_or_else(|| {
                        ErrorMetadata::bad_request(
                            "InvalidSize",
                            format!("size must be a non-negative integer, got {v}"),
                        )
                    })
                })
                .transpose()?
        };
        validate_declaration(&declaration, true)?;

        // Ownership is the caller's tenant unless an admin says otherwise.
        let owner = if ctx.is_admin && declaration.owner.is_some() {
            declaration.owner.clone()
        } else {
            ctx.owner().map(str::to_owned)
        };
        let status = if declaration.locations.is_empty() {
            ImageStatus::Queued
        } else {
            ImageStatus::Active
        };
        let values = ImageValues {
            id: declaration.id.clone().map(ImageId::from),
            name: Some(declaration.name.clone()),
            status: Some(status),
            disk_format: Some(declaration.disk_format),
            container_format: Some(declaration.container_format),
            size: preset_size,
            min_disk: declaration.min_disk,
            min_ram: declaration.min_ram,
            owner: Some(owner),
            is_public: declaration.is_public,
            protected: declaration.protected,
            properties: Some(declaration.properties.clone()),
            locations: locations_from_declaration(&declaration),
            ..Default::default()
        };
        self.catalog.image_create(ctx, values).await?.try_into()
    }

    pub async fn update_image(
        &self,
        ctx: &RequestContext,
        id: &ImageId,
        declaration: ImageDeclaration,
        purge_properties: bool,
    ) -> anyhow::Result<ImageRecord> {
        guard_writable(ctx)?;
        validate_declaration(&declaration, false)?;

        if !declaration.locations.is_empty() && !ctx.is_admin {
            let existing = self.catalog.image_get(ctx, id, false).await?;
            if existing.status == ImageStatus::Active {
                anyhow::bail!(ErrorMetadata::forbidden(
                    "LocationMutationForbidden",
                    "Locations of an active image can only be changed by an administrator",
                ));
            }
        }

        let values = ImageValues {
            name: declaration.name.clone().map(Some),
            disk_format: declaration.disk_format.map(Some),
            container_format: declaration.container_format.map(Some),
            min_disk: declaration.min_disk,
            min_ram: declaration.min_ram,
            // Only admins may reassign ownership.
            owner: ctx
                .is_admin
                .then(|| declaration.owner.clone().map(Some))
                .flatten(),
            is_public: declaration.is_public,
            protected: declaration.protected,
            properties: (!declaration.properties.is_empty() || purge_properties)
                .then(|| declaration.properties.clone()),
            locations: locations_from_declaration(&declaration),
            ..Default::default()
        };
        self.catalog
            .image_update(ctx, id, values, purge_properties)
            .await?
            .try_into()
    }

    pub async fn get_image(
        &self,
        ctx: &RequestContext,
        id: &ImageId,
    ) -> anyhow::Result<ImageRecord> {
        self.catalog.image_get(ctx, id, false).await?.try_into()
    }

    pub async fn list_images(
        &self,
        ctx: &RequestContext,
        filters: &ImageFilters,
        pagination: &Pagination,
    ) -> anyhow::Result<Vec<ImageRecord>> {
        self.catalog
            .image_get_all(ctx, filters, pagination)
            .await?
            .into_iter()
            .map(ImageRecord::try_from)
            .collect()
    }

    /// Immediate delete of the metadata row. Body reclamation is the
    /// lifecycle controller's job; this only runs after it.
    pub async fn delete_image(
        &self,
        ctx: &RequestContext,
        id: &ImageId,
    ) -> anyhow::Result<ImageRecord> {
        guard_writable(ctx)?;
        self.catalog.image_destroy(ctx, id).await?.try_into()
    }

    pub async fn get_members(
        &self,
        ctx: &RequestContext,
        image_id: &ImageId,
    ) -> anyhow::Result<Vec<MemberEntry>> {
        let image = self.catalog.image_get(ctx, image_id, false).await?;
        Ok(image.members.iter().map(MemberEntry::from).collect())
    }

    /// Replaces the members of the image with those specified, in one
    /// transaction.
    pub async fn update_all_members(
        &self,
        ctx: &RequestContext,
        image_id: &ImageId,
        memberships: Vec<MembershipDeclaration>,
    ) -> anyhow::Result<Vec<MemberEntry>> {
        let image = self.authorize_sharing(ctx, image_id).await?;
        if memberships.len() > *IMAGE_MEMBER_QUOTA {
            anyhow::bail!(member_quota_exceeded(&image.id));
        }
        let members: Vec<MemberValues> = memberships
            .into_iter()
            .map(|m| MemberValues {
                member: m.member_id,
                can_share: m.can_share,
                status: None,
            })
            .collect();
        tracing::info!(
            "Replacing members of image {image_id} with {} entries",
            members.len()
        );
        let replaced = self
            .catalog
            .image_member_replace_all(ctx, image_id, members)
            .await?;
        Ok(replaced.iter().map(MemberEntry::from).collect())
    }

    /// Upsert a single membership. `can_share` defaults to the previous
    /// value for an existing grant and false for a new one.
    pub async fn add_member(
        &self,
        ctx: &RequestContext,
        image_id: &ImageId,
        member: &str,
        can_share: Option<bool>,
    ) -> anyhow::Result<MemberEntry> {
        let image = self.authorize_sharing(ctx, image_id).await?;
        let values = MemberValues {
            member: member.to_owned(),
            can_share,
            status: None,
        };
        let updated = match self.catalog.image_member_find(ctx, image_id, member).await {
            Ok(existing) => {
                self.catalog
                    .image_member_update(ctx, existing.id, values)
                    .await?
            },
            Err(_) => {
                if image.members.len() + 1 > *IMAGE_MEMBER_QUOTA {
                    anyhow::bail!(member_quota_exceeded(image_id));
                }
                self.catalog
                    .image_member_create(ctx, image_id, values)
                    .await?
            },
        };
        Ok(MemberEntry::from(&updated))
    }

    pub async fn delete_member(
        &self,
        ctx: &RequestContext,
        image_id: &ImageId,
        member: &str,
    ) -> anyhow::Result<()> {
        self.authorize_sharing(ctx, image_id).await?;
        let existing = self.catalog.image_member_find(ctx, image_id, member).await?;
        tracing::info!("Revoking membership of {member} on image {image_id}");
        self.catalog.image_member_delete(ctx, existing.id).await
    }

    /// Images shared with the given member.
    pub async fn shared_images(
        &self,
        ctx: &RequestContext,
        member: &str,
        marker: Option<i64>,
        limit: Option<i64>,
    ) -> anyhow::Result<Vec<SharedImageEntry>> {
        let memberships = self
            .catalog
            .image_member_get_memberships(ctx, member, marker, limit)
            .await?;
        Ok(memberships
            .iter()
            .map(|m| SharedImageEntry {
                image_id: m.image_id.to_string(),
                can_share: m.can_share,
                status: m.status,
            })
            .collect())
    }

    pub async fn set_tags(
        &self,
        ctx: &RequestContext,
        image_id: &ImageId,
        tags: BTreeSet<String>,
    ) -> anyhow::Result<()> {
        guard_writable(ctx)?;
        if tags.len() > *IMAGE_TAG_QUOTA {
            anyhow::bail!(ErrorMetadata::bad_request(
                "TagQuotaExceeded",
                format!("Images are limited to {} tags", *IMAGE_TAG_QUOTA),
            ));
        }
        self.catalog.image_tag_set_all(ctx, image_id, &tags).await
    }

    pub async fn get_tags(
        &self,
        ctx: &RequestContext,
        image_id: &ImageId,
    ) -> anyhow::Result<BTreeSet<String>> {
        self.catalog.image_tag_get_all(ctx, image_id).await
    }

    pub async fn add_tag(
        &self,
        ctx: &RequestContext,
        image_id: &ImageId,
        tag: &str,
    ) -> anyhow::Result<()> {
        guard_writable(ctx)?;
        let existing = self.catalog.image_tag_get_all(ctx, image_id).await?;
        if existing.len() + 1 > *IMAGE_TAG_QUOTA {
            anyhow::bail!(ErrorMetadata::bad_request(
                "TagQuotaExceeded",
                format!("Images are limited to {} tags", *IMAGE_TAG_QUOTA),
            ));
        }
        self.catalog.image_tag_create(ctx, image_id, tag).await
    }

    pub async fn remove_tag(
        &self,
        ctx: &RequestContext,
        image_id: &ImageId,
        tag: &str,
    ) -> anyhow::Result<()> {
        guard_writable(ctx)?;
        self.catalog.image_tag_delete(ctx, image_id, tag).await
    }

    /// Sharing mutations need a visible image and a context allowed to
    /// share it.
    async fn authorize_sharing(
        &self,
        ctx: &RequestContext,
        image_id: &ImageId,
    ) -> anyhow::Result<Image> {
        guard_writable(ctx)?;
        if ctx.owner().is_none() && !ctx.is_admin {
            anyhow::bail!(ErrorMetadata::unauthenticated(
                "NoAuthenticatedTenant",
                "Sharing requires an authenticated tenant",
            ));
        }
        let image = self.catalog.image_get(ctx, image_id, false).await?;
        if !visibility::is_image_sharable(ctx, &image, None) {
            anyhow::bail!(ErrorMetadata::forbidden(
                "ImageNotSharable",
                "No permission to share that image",
            ));
        }
        Ok(image)
    }
}

fn guard_writable(ctx: &RequestContext) -> anyhow::Result<()> {
    if ctx.read_only {
        anyhow::bail!(ErrorMetadata::forbidden(
            "ReadOnlyContext",
            "This context is read-only",
        ));
    }
    Ok(())
}

fn member_quota_exceeded(image_id: &ImageId) -> ErrorMetadata {
    ErrorMetadata::bad_request(
        "MemberQuotaExceeded",
        format!(
            "Image {image_id} can be shared with at most {} tenants",
            *IMAGE_MEMBER_QUOTA
        ),
    )
}

fn locations_from_declaration(declaration: &ImageDeclaration) -> Option<Vec<ImageLocation>> {
    if declaration.locations.is_empty() {
        return None;
    }
    Some(
        declaration
            .locations
            .iter()
            .map(|entry| ImageLocation {
                url: entry.url.clone(),
                metadata: entry.metadata.clone(),
                status: LocationStatus::Active,
            })
            .collect(),
    )
}

fn validate_declaration(declaration: &ImageDeclaration, create: bool) -> anyhow::Result<()> {
    for name in declaration.properties.keys() {
        if RESERVED_PROPERTIES.contains(&name.as_str()) {
            anyhow::bail!(ErrorMetadata::bad_request(
                "ReservedProperty",
                format!("Property name '{name}' is reserved"),
            ));
        }
    }
    if declaration.properties.len() > *IMAGE_PROPERTY_QUOTA {
        anyhow::bail!(ErrorMetadata::bad_request(
            "PropertyQuotaExceeded",
            format!(
                "Images are limited to {} custom properties",
                *IMAGE_PROPERTY_QUOTA
            ),
        ));
    }
    for name in declaration.extra.keys() {
        if READONLY_ATTRIBUTES.contains(&name.as_str()) {
            // Updates silently drop server-computed attributes; creates
            // carrying them are client bugs worth rejecting loudly.
            if create {
                anyhow::bail!(ErrorMetadata::bad_request(
                    "ReadonlyAttribute",
                    format!("Attribute '{name}' is read-only"),
                ));
            }
        } else {
            anyhow::bail!(ErrorMetadata::bad_request(
                "UnknownAttribute",
                format!("Unrecognized image attribute '{name}'"),
            ));
        }
    }
    Ok(())
}
