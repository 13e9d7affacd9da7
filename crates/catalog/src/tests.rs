use std::collections::{
    BTreeMap,
    BTreeSet,
};

use common::{
    context::RequestContext,
    runtime::testing::TestRuntime,
    runtime::Runtime,
    types::{
        ContainerFormat,
        DiskFormat,
        ImageId,
        ImageStatus,
        SortDir,
    },
};
use errors::ErrorMetadataAnyhowExt;

use crate::{
    types::ImageLocation,
    CatalogStore,
    ImageFilters,
    ImageValues,
    LocationStatus,
    MemberValues,
    Pagination,
};

fn test_store() -> anyhow::Result<(TestRuntime, CatalogStore<TestRuntime>)> {
    let rt = TestRuntime::new();
    let store = CatalogStore::new_in_memory(rt.clone())?;
    Ok((rt, store))
}

fn basic_values(name: &str) -> ImageValues {
    ImageValues {
        name: Some(Some(name.to_owned())),
        disk_format: Some(Some(DiskFormat::Vhd)),
        container_format: Some(Some(ContainerFormat::Ovf)),
        ..Default::default()
    }
}

fn public_values(id: &str, name: &str, owner: &str) -> ImageValues {
    ImageValues {
        id: Some(ImageId::from(id)),
        is_public: Some(true),
        owner: Some(Some(owner.to_owned())),
        ..basic_values(name)
    }
}

#[tokio::test]
async fn test_create_defaults_to_queued() -> anyhow::Result<()> {
    let (_rt, store) = test_store()?;
    let ctx = RequestContext::for_tenant("pattieblack");
    let image = store.image_create(&ctx, basic_values("x")).await?;
    assert_eq!(image.status, ImageStatus::Queued);
    assert_eq!(image.size, 0);
    assert_eq!(image.name.as_deref(), Some("x"));
    assert!(!image.deleted);
    assert!(image.created_at <= image.updated_at);
    Ok(())
}

#[tokio::test]
async fn test_file_backed_catalog_survives_reopen() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let path = dir.path().join("registry.sqlite");
    let ctx = RequestContext::for_tenant("pattieblack");

    let id = {
        let rt = TestRuntime::new();
        let store = CatalogStore::new(rt, &path)?;
        store.image_create(&ctx, basic_values("durable")).await?.id
    };

    let rt = TestRuntime::new();
    let store = CatalogStore::new(rt, &path)?;
    let image = store.image_get(&ctx, &id, false).await?;
    assert_eq!(image.name.as_deref(), Some("durable"));
    Ok(())
}

#[tokio::test]
async fn test_duplicate_id_is_conflict() -> anyhow::Result<()> {
    let (_rt, store) = test_store()?;
    let ctx = RequestContext::for_tenant("pattieblack");
    let values = ImageValues {
        id: Some(ImageId::from("11111111-2222-3333-4444-555555555555")),
        ..basic_values("x")
    };
    store.image_create(&ctx, values.clone()).await?;
    let err = store.image_create(&ctx, values).await.unwrap_err();
    assert!(err.is_conflict());
    Ok(())
}

#[tokio::test]
async fn test_amazon_formats_must_match() -> anyhow::Result<()> {
    let (_rt, store) = test_store()?;
    let ctx = RequestContext::for_tenant("pattieblack");
    let values = ImageValues {
        name: Some(Some("mismatched".to_owned())),
        disk_format: Some(Some(DiskFormat::Ami)),
        container_format: Some(Some(ContainerFormat::Ovf)),
        ..Default::default()
    };
    let err = store.image_create(&ctx, values).await.unwrap_err();
    assert!(err.is_bad_request());
    assert_eq!(err.short_msg(), "InvalidFormatCombination");
    Ok(())
}

#[tokio::test]
async fn test_activation_requires_formats() -> anyhow::Result<()> {
    let (_rt, store) = test_store()?;
    let ctx = RequestContext::for_tenant("pattieblack");
    let values = ImageValues {
        name: Some(Some("no formats".to_owned())),
        status: Some(ImageStatus::Active),
        ..Default::default()
    };
    let err = store.image_create(&ctx, values).await.unwrap_err();
    assert!(err.is_bad_request());

    // Merely registering an image without formats is fine.
    let values = ImageValues {
        name: Some(Some("no formats".to_owned())),
        ..Default::default()
    };
    let image = store.image_create(&ctx, values).await?;
    assert_eq!(image.status, ImageStatus::Queued);
    Ok(())
}

/// Scenario: three public images sorted by name ascending come back in name
/// order, whatever their ids.
#[tokio::test]
async fn test_sort_key_name_ascending() -> anyhow::Result<()> {
    let (_rt, store) = test_store()?;
    let ctx = RequestContext::for_tenant("pattieblack");
    for (id, name) in [("uuid3", "asdf"), ("uuid2", "fake image #2"), ("uuid4", "xyz")] {
        store
            .image_create(&ctx, public_values(id, name, "pattieblack"))
            .await?;
    }
    let pagination = Pagination {
        sort_key: Some("name".to_owned()),
        sort_dir: Some(SortDir::Asc),
        ..Default::default()
    };
    let images = store
        .image_get_all(&ctx, &ImageFilters::default(), &pagination)
        .await?;
    let ids: Vec<_> = images.iter().map(|i| i.id.to_string()).collect();
    assert_eq!(ids, vec!["uuid3", "uuid2", "uuid4"]);
    Ok(())
}

#[tokio::test]
async fn test_marker_chaining_enumerates_exactly_once() -> anyhow::Result<()> {
    let (_rt, store) = test_store()?;
    let ctx = RequestContext::for_tenant("pattieblack");
    // Duplicate names force the created_at/id tiebreakers to do the work.
    for (id, name) in [
        ("uuid1", "dup"),
        ("uuid2", "dup"),
        ("uuid3", "aaa"),
        ("uuid4", "zzz"),
        ("uuid5", "dup"),
    ] {
        store
            .image_create(&ctx, public_values(id, name, "pattieblack"))
            .await?;
    }

    let mut seen = Vec::new();
    let mut marker = None;
    loop {
        let pagination = Pagination {
            marker: marker.clone(),
            limit: Some(2),
            sort_key: Some("name".to_owned()),
            sort_dir: Some(SortDir::Asc),
        };
        let page = store
            .image_get_all(&ctx, &ImageFilters::default(), &pagination)
            .await?;
        if page.is_empty() {
            break;
        }
        marker = Some(page.last().unwrap().id.clone());
        seen.extend(page.into_iter().map(|i| i.id.to_string()));
    }
    assert_eq!(seen.len(), 5);
    let unique: BTreeSet<_> = seen.iter().collect();
    assert_eq!(unique.len(), 5, "pagination returned duplicates: {seen:?}");
    Ok(())
}

#[tokio::test]
async fn test_unknown_marker_is_not_found() -> anyhow::Result<()> {
    let (_rt, store) = test_store()?;
    let ctx = RequestContext::for_tenant("pattieblack");
    let pagination = Pagination {
        marker: Some(ImageId::from("no-such-image")),
        ..Default::default()
    };
    let err = store
        .image_get_all(&ctx, &ImageFilters::default(), &pagination)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    Ok(())
}

#[tokio::test]
async fn test_invisible_marker_is_not_found() -> anyhow::Result<()> {
    let (_rt, store) = test_store()?;
    let owner = RequestContext::for_tenant("pattieblack");
    let image = store.image_create(&owner, basic_values("private")).await?;

    let other = RequestContext::for_tenant("froggy");
    let pagination = Pagination {
        marker: Some(image.id.clone()),
        ..Default::default()
    };
    let err = store
        .image_get_all(&other, &ImageFilters::default(), &pagination)
        .await
        .unwrap_err();
    // Same error kind as an unknown marker, so existence never leaks.
    assert!(err.is_not_found());
    Ok(())
}

#[tokio::test]
async fn test_limit_validation() -> anyhow::Result<()> {
    let (_rt, store) = test_store()?;
    let ctx = RequestContext::for_tenant("pattieblack");
    let pagination = Pagination {
        limit: Some(0),
        ..Default::default()
    };
    let err = store
        .image_get_all(&ctx, &ImageFilters::default(), &pagination)
        .await
        .unwrap_err();
    assert!(err.is_bad_request());

    let pagination = Pagination {
        sort_key: Some("frobnitz".to_owned()),
        ..Default::default()
    };
    let err = store
        .image_get_all(&ctx, &ImageFilters::default(), &pagination)
        .await
        .unwrap_err();
    assert_eq!(err.short_msg(), "InvalidSortKey");
    Ok(())
}

/// Scenario: a private image is NotFound for a stranger, fetchable by its
/// owner and by an admin.
#[tokio::test]
async fn test_private_image_visibility() -> anyhow::Result<()> {
    let (_rt, store) = test_store()?;
    let owner = RequestContext::for_tenant("pattieblack");
    let image = store.image_create(&owner, basic_values("secret")).await?;

    let stranger = RequestContext::for_tenant("froggy");
    let err = store.image_get(&stranger, &image.id, false).await.unwrap_err();
    assert!(err.is_not_found());
    let listed = store
        .image_get_all(&stranger, &ImageFilters::default(), &Pagination::default())
        .await?;
    assert!(listed.is_empty());

    assert_eq!(
        store.image_get(&owner, &image.id, false).await?.id,
        image.id
    );
    let admin = RequestContext::admin();
    assert_eq!(
        store.image_get(&admin, &image.id, false).await?.id,
        image.id
    );
    Ok(())
}

#[tokio::test]
async fn test_membership_grants_visibility_and_sharing() -> anyhow::Result<()> {
    let (_rt, store) = test_store()?;
    let owner = RequestContext::for_tenant("pattieblack");
    let image = store.image_create(&owner, basic_values("shared")).await?;

    let friend = RequestContext::for_tenant("froggy");
    assert!(store.image_get(&friend, &image.id, false).await.is_err());

    store
        .image_member_create(
            &owner,
            &image.id,
            MemberValues {
                member: "froggy".to_owned(),
                can_share: Some(true),
                status: None,
            },
        )
        .await?;

    let visible = store.image_get(&friend, &image.id, false).await?;
    assert_eq!(visible.id, image.id);
    let membership = store
        .image_member_find(&friend, &image.id, "froggy")
        .await?;
    assert!(membership.can_share);
    assert!(crate::visibility::is_image_sharable(
        &friend,
        &visible,
        Some(&membership)
    ));

    // Revoking the membership hides the image again and frees the slot for
    // a fresh share.
    store
        .image_member_delete(&owner, membership.id)
        .await?;
    assert!(store.image_get(&friend, &image.id, false).await.is_err());
    store
        .image_member_create(
            &owner,
            &image.id,
            MemberValues {
                member: "froggy".to_owned(),
                can_share: None,
                status: None,
            },
        )
        .await?;
    let membership = store
        .image_member_find(&owner, &image.id, "froggy")
        .await?;
    assert!(!membership.can_share);
    Ok(())
}

#[tokio::test]
async fn test_memberships_listing_pages() -> anyhow::Result<()> {
    let (_rt, store) = test_store()?;
    let owner = RequestContext::for_tenant("pattieblack");
    for i in 0..3 {
        let image = store
            .image_create(&owner, basic_values(&format!("img{i}")))
            .await?;
        store
            .image_member_create(
                &owner,
                &image.id,
                MemberValues {
                    member: "froggy".to_owned(),
                    can_share: None,
                    status: None,
                },
            )
            .await?;
    }
    let friend = RequestContext::for_tenant("froggy");
    let first = store
        .image_member_get_memberships(&friend, "froggy", None, Some(2))
        .await?;
    assert_eq!(first.len(), 2);
    let rest = store
        .image_member_get_memberships(&friend, "froggy", Some(first[1].id), Some(2))
        .await?;
    assert_eq!(rest.len(), 1);
    assert!(first.iter().all(|m| m.id != rest[0].id));
    Ok(())
}

/// After a purge update the active properties equal exactly the submitted
/// map; without purge they accumulate.
#[tokio::test]
async fn test_property_reconciliation() -> anyhow::Result<()> {
    let (_rt, store) = test_store()?;
    let ctx = RequestContext::for_tenant("pattieblack");
    let mut values = basic_values("props");
    values.properties = Some(BTreeMap::from([
        ("arch".to_owned(), "x86_64".to_owned()),
        ("kernel".to_owned(), "6.1".to_owned()),
    ]));
    let image = store.image_create(&ctx, values).await?;

    // Additive update keeps what it doesn't mention.
    let update = ImageValues {
        properties: Some(BTreeMap::from([("ramdisk".to_owned(), "initrd".to_owned())])),
        ..Default::default()
    };
    let image = store.image_update(&ctx, &image.id, update, false).await?;
    assert_eq!(image.properties.len(), 3);

    // Purge replaces the set and clears the deleted flag on resurrection.
    let update = ImageValues {
        properties: Some(BTreeMap::from([("arch".to_owned(), "aarch64".to_owned())])),
        ..Default::default()
    };
    let image = store.image_update(&ctx, &image.id, update, true).await?;
    assert_eq!(
        image.properties,
        BTreeMap::from([("arch".to_owned(), "aarch64".to_owned())])
    );
    Ok(())
}

/// Deleting twice: the second call is NotFound for the owner (who can no
/// longer see the row) and Forbidden for an admin (who can).
#[tokio::test]
async fn test_idempotent_soft_delete() -> anyhow::Result<()> {
    let (_rt, store) = test_store()?;
    let ctx = RequestContext::for_tenant("pattieblack");
    let image = store.image_create(&ctx, basic_values("doomed")).await?;

    let deleted = store.image_destroy(&ctx, &image.id).await?;
    assert!(deleted.deleted);
    assert_eq!(deleted.status, ImageStatus::Deleted);
    assert!(deleted.deleted_at.is_some());
    assert!(deleted.properties.is_empty());

    let err = store.image_destroy(&ctx, &image.id).await.unwrap_err();
    assert!(err.is_not_found());

    let admin = RequestContext::admin();
    let err = store.image_destroy(&admin, &image.id).await.unwrap_err();
    assert!(err.is_forbidden());
    Ok(())
}

#[tokio::test]
async fn test_protected_image_cannot_be_deleted() -> anyhow::Result<()> {
    let (_rt, store) = test_store()?;
    let ctx = RequestContext::for_tenant("pattieblack");
    let values = ImageValues {
        protected: Some(true),
        ..basic_values("keeper")
    };
    let image = store.image_create(&ctx, values).await?;

    let err = store.image_destroy(&ctx, &image.id).await.unwrap_err();
    assert!(err.is_protected_image_delete());
    let err = store
        .image_mark_pending_delete(&ctx, &image.id)
        .await
        .unwrap_err();
    assert!(err.is_protected_image_delete());

    // Row untouched.
    let fetched = store.image_get(&ctx, &image.id, false).await?;
    assert!(!fetched.deleted);
    assert_eq!(fetched.status, ImageStatus::Queued);
    Ok(())
}

#[tokio::test]
async fn test_public_image_mutation_by_stranger() -> anyhow::Result<()> {
    let (_rt, store) = test_store()?;
    let owner = RequestContext::for_tenant("pattieblack");
    let image = store
        .image_create(&owner, public_values("uuid-public", "billboard", "pattieblack"))
        .await?;

    let stranger = RequestContext::for_tenant("froggy");
    let err = store
        .image_update(&stranger, &image.id, ImageValues::default(), false)
        .await
        .unwrap_err();
    // Public: the stranger learns the image exists but may not touch it.
    assert!(err.is_forbidden_public_image());
    Ok(())
}

#[tokio::test]
async fn test_pending_delete_and_scrub() -> anyhow::Result<()> {
    let (rt, store) = test_store()?;
    let ctx = RequestContext::for_tenant("pattieblack");
    let mut values = basic_values("delayed");
    values.locations = Some(vec![ImageLocation {
        url: "file:///var/lib/images/delayed".to_owned(),
        metadata: BTreeMap::new(),
        status: LocationStatus::Active,
    }]);
    values.status = Some(ImageStatus::Active);
    let image = store.image_create(&ctx, values).await?;

    let parked = store.image_mark_pending_delete(&ctx, &image.id).await?;
    assert_eq!(parked.status, ImageStatus::PendingDelete);
    assert!(parked.deleted);
    // Locations survive for the scrubber to find.
    assert_eq!(parked.locations.len(), 1);
    assert_eq!(parked.locations[0].status, LocationStatus::PendingDelete);

    let admin = RequestContext::admin();
    let cutoff = rt.unix_timestamp() + std::time::Duration::from_secs(1);
    let due = store.images_pending_scrub(&admin, cutoff).await?;
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, image.id);

    store.image_scrub_complete(&admin, &image.id).await?;
    let done = store.image_get(&admin, &image.id, true).await?;
    assert_eq!(done.status, ImageStatus::Deleted);
    assert!(done.locations.is_empty());

    // Idempotent: a second pass is a no-op and the queue is drained.
    store.image_scrub_complete(&admin, &image.id).await?;
    let due = store.images_pending_scrub(&admin, cutoff).await?;
    assert!(due.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_changes_since_includes_deleted() -> anyhow::Result<()> {
    let (rt, store) = test_store()?;
    let ctx = RequestContext::for_tenant("pattieblack");
    let epoch = rt.unix_timestamp() - std::time::Duration::from_secs(60);
    let image = store.image_create(&ctx, basic_values("gone")).await?;
    store.image_destroy(&ctx, &image.id).await?;

    let filters = ImageFilters {
        changes_since: Some(epoch),
        ..Default::default()
    };
    let listed = store
        .image_get_all(&ctx, &filters, &Pagination::default())
        .await?;
    assert_eq!(listed.len(), 1);
    assert!(listed[0].deleted);
    Ok(())
}

#[tokio::test]
async fn test_deleted_false_filter_excludes_killed() -> anyhow::Result<()> {
    let (_rt, store) = test_store()?;
    let ctx = RequestContext::for_tenant("pattieblack");
    store.image_create(&ctx, basic_values("alive")).await?;
    let killed = store.image_create(&ctx, basic_values("dead")).await?;
    store
        .image_update(
            &ctx,
            &killed.id,
            ImageValues {
                status: Some(ImageStatus::Killed),
                ..Default::default()
            },
            false,
        )
        .await?;

    let filters = ImageFilters {
        deleted: Some(false),
        ..Default::default()
    };
    let listed = store
        .image_get_all(&ctx, &filters, &Pagination::default())
        .await?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name.as_deref(), Some("alive"));
    Ok(())
}

#[tokio::test]
async fn test_property_and_range_filters() -> anyhow::Result<()> {
    let (_rt, store) = test_store()?;
    let ctx = RequestContext::for_tenant("pattieblack");
    let mut values = basic_values("tagged");
    values.properties = Some(BTreeMap::from([("arch".to_owned(), "x86_64".to_owned())]));
    values.size = Some(512);
    store.image_create(&ctx, values).await?;
    let mut values = basic_values("other");
    values.size = Some(2048);
    store.image_create(&ctx, values).await?;

    let filters = ImageFilters {
        properties: BTreeMap::from([("arch".to_owned(), "x86_64".to_owned())]),
        ..Default::default()
    };
    let listed = store
        .image_get_all(&ctx, &filters, &Pagination::default())
        .await?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name.as_deref(), Some("tagged"));

    let filters = ImageFilters {
        size_min: Some(1024),
        size_max: Some(4096),
        ..Default::default()
    };
    let listed = store
        .image_get_all(&ctx, &filters, &Pagination::default())
        .await?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name.as_deref(), Some("other"));
    Ok(())
}

#[tokio::test]
async fn test_tag_set_difference() -> anyhow::Result<()> {
    let (_rt, store) = test_store()?;
    let ctx = RequestContext::for_tenant("pattieblack");
    let image = store.image_create(&ctx, basic_values("tags")).await?;

    store.image_tag_create(&ctx, &image.id, "base").await?;
    store.image_tag_create(&ctx, &image.id, "nightly").await?;
    let err = store
        .image_tag_create(&ctx, &image.id, "base")
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    let replacement = BTreeSet::from(["base".to_owned(), "release".to_owned()]);
    store.image_tag_set_all(&ctx, &image.id, &replacement).await?;
    assert_eq!(store.image_tag_get_all(&ctx, &image.id).await?, replacement);

    store.image_tag_delete(&ctx, &image.id, "release").await?;
    let err = store
        .image_tag_delete(&ctx, &image.id, "release")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    Ok(())
}

mod pagination_completeness {
    use std::collections::BTreeSet;

    use common::{
        context::RequestContext,
        runtime::testing::TestRuntime,
        types::SortDir,
    };
    use proptest::prelude::*;

    use crate::{
        CatalogStore,
        ImageFilters,
        Pagination,
    };

    proptest! {
        #![proptest_config(ProptestConfig { cases: 16, failure_persistence: None, ..ProptestConfig::default() })]

        /// Iterating pages with marker chaining enumerates exactly the
        /// matching rows, in order, with no duplicates - even when the
        /// user-chosen sort key is wildly non-unique.
        #[test]
        fn proptest_pagination_enumerates_exactly(
            names in prop::collection::vec("[ab]{1,2}", 1..12),
            limit in 1..5i64,
            asc in any::<bool>(),
        ) {
            let tokio_rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            tokio_rt.block_on(async move {
                let rt = TestRuntime::new();
                let store = CatalogStore::new_in_memory(rt).unwrap();
                let ctx = RequestContext::for_tenant("pattieblack");
                for (i, name) in names.iter().enumerate() {
                    let values = crate::ImageValues {
                        id: Some(format!("id-{i}").into()),
                        name: Some(Some(name.clone())),
                        ..Default::default()
                    };
                    store.image_create(&ctx, values).await.unwrap();
                }

                let sort_dir = if asc { SortDir::Asc } else { SortDir::Desc };
                let mut collected = Vec::new();
                let mut marker = None;
                loop {
                    let pagination = Pagination {
                        marker: marker.clone(),
                        limit: Some(limit),
                        sort_key: Some("name".to_owned()),
                        sort_dir: Some(sort_dir),
                    };
                    let page = store
                        .image_get_all(&ctx, &ImageFilters::default(), &pagination)
                        .await
                        .unwrap();
                    if page.is_empty() {
                        break;
                    }
                    marker = Some(page.last().unwrap().id.clone());
                    collected.extend(page);
                }

                prop_assert_eq!(collected.len(), names.len());
                let unique: BTreeSet<_> =
                    collected.iter().map(|i| i.id.to_string()).collect();
                prop_assert_eq!(unique.len(), names.len());

                // In order under the requested direction, tiebreakers and all.
                let mut sorted: Vec<_> = collected
                    .iter()
                    .map(|i| (i.name.clone(), i.created_at, i.id.clone()))
                    .collect();
                match sort_dir {
                    SortDir::Asc => sorted.sort(),
                    SortDir::Desc => {
                        sorted.sort();
                        sorted.reverse();
                    },
                }
                let actual: Vec<_> = collected
                    .iter()
                    .map(|i| (i.name.clone(), i.created_at, i.id.clone()))
                    .collect();
                prop_assert_eq!(actual, sorted);
                Ok(())
            })?;
        }
    }
}
