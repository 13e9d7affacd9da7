//! Pure predicates deciding what a request context may do with an image.
//! Membership rows ride along on the eagerly loaded image, so nothing here
//! touches the database.

use common::context::RequestContext;
use errors::ErrorMetadata;

use crate::types::{
    Image,
    ImageMember,
};

/// Return true if the image is visible in this context.
pub fn is_image_visible(ctx: &RequestContext, image: &Image) -> bool {
    if ctx.is_admin {
        return true;
    }
    if image.owner.is_none() {
        return true;
    }
    if image.is_public {
        return true;
    }
    if let Some(owner) = ctx.owner() {
        if image.owner.as_deref() == Some(owner) {
            return true;
        }
        // Shared with the caller's tenant?
        if find_membership(image, owner).is_some() {
            return true;
        }
    }
    // Private image
    false
}

/// Return true if the image is mutable in this context.
pub fn is_image_mutable(ctx: &RequestContext, image: &Image) -> bool {
    if ctx.is_admin {
        return true;
    }
    let (Some(image_owner), Some(owner)) = (image.owner.as_deref(), ctx.owner()) else {
        return false;
    };
    image_owner == owner
}

/// Return true if the image can be shared to others in this context. With an
/// explicit membership the answer is its `can_share`; without one the
/// caller's own membership decides.
pub fn is_image_sharable(
    ctx: &RequestContext,
    image: &Image,
    membership: Option<&ImageMember>,
) -> bool {
    if ctx.is_admin {
        return true;
    }
    let Some(owner) = ctx.owner() else {
        return false;
    };
    if image.owner.as_deref() == Some(owner) {
        return true;
    }
    match membership {
        Some(membership) => membership.can_share,
        None => find_membership(image, owner).is_some_and(|m| m.can_share),
    }
}

/// A denied mutation on a public image is distinguishable from the private
/// case, which the caller never learned existed.
pub fn check_mutate_authorization(ctx: &RequestContext, image: &Image) -> anyhow::Result<()> {
    if is_image_mutable(ctx, image) {
        return Ok(());
    }
    tracing::info!("Attempted to modify image user did not own.");
    if image.is_public {
        anyhow::bail!(ErrorMetadata::forbidden_public_image());
    }
    anyhow::bail!(ErrorMetadata::forbidden(
        "ImageNotOwned",
        "You do not own this image",
    ));
}

fn find_membership<'a>(image: &'a Image, member: &str) -> Option<&'a ImageMember> {
    image
        .members
        .iter()
        .find(|m| m.member == member && !m.deleted)
}
