use std::collections::BTreeMap;

use catalog::CatalogStore;
use common::{
    context::RequestContext,
    runtime::testing::TestRuntime,
    types::{
        ContainerFormat,
        DiskFormat,
        ImageId,
        ImageStatus,
    },
};
use errors::ErrorMetadataAnyhowExt;

use crate::{
    api::{
        ImageDeclaration,
        LocationEntry,
        MembershipDeclaration,
    },
    RegistryService,
};

fn test_service() -> anyhow::Result<RegistryService<TestRuntime>> {
    let rt = TestRuntime::new();
    Ok(RegistryService::new(CatalogStore::new_in_memory(rt)?))
}

fn declaration(name: &str) -> ImageDeclaration {
    ImageDeclaration {
        name: Some(name.to_owned()),
        disk_format: Some(DiskFormat::Vhd),
        container_format: Some(ContainerFormat::Ovf),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_create_assigns_owner_and_status() -> anyhow::Result<()> {
    let service = test_service()?;
    let ctx = RequestContext::for_tenant("pattieblack");
    let record = service.create_image(&ctx, declaration("x")).await?;
    assert_eq!(record.status, ImageStatus::Queued);
    assert_eq!(record.size, 0);
    assert_eq!(record.owner.as_deref(), Some("pattieblack"));

    // Non-admins cannot register images for someone else.
    let mut decl = declaration("y");
    decl.owner = Some("froggy".to_owned());
    let record = service.create_image(&ctx, decl).await?;
    assert_eq!(record.owner.as_deref(), Some("pattieblack"));

    let admin = RequestContext::admin();
    let mut decl = declaration("z");
    decl.owner = Some("froggy".to_owned());
    let record = service.create_image(&admin, decl).await?;
    assert_eq!(record.owner.as_deref(), Some("froggy"));
    Ok(())
}

#[tokio::test]
async fn test_create_with_preset_location_is_active() -> anyhow::Result<()> {
    let service = test_service()?;
    let ctx = RequestContext::for_tenant("pattieblack");
    let mut decl = declaration("preset");
    decl.locations = vec![LocationEntry {
        url: "http://mirror.example.com/cirros.img".to_owned(),
        metadata: BTreeMap::new(),
    }];
    // No upload will measure this image, so the declared size is accepted.
    decl.extra
        .insert("size".to_owned(), serde_json::json!(13287936));
    let record = service.create_image(&ctx, decl).await?;
    assert_eq!(record.status, ImageStatus::Active);
    assert_eq!(record.size, 13287936);
    Ok(())
}

#[tokio::test]
async fn test_reserved_property_rejected() -> anyhow::Result<()> {
    let service = test_service()?;
    let ctx = RequestContext::for_tenant("pattieblack");
    let mut decl = declaration("sneaky");
    decl.properties
        .insert("location".to_owned(), "file:///etc/passwd".to_owned());
    let err = service.create_image(&ctx, decl).await.unwrap_err();
    assert_eq!(err.short_msg(), "ReservedProperty");
    Ok(())
}

#[tokio::test]
async fn test_readonly_attribute_rejected_on_create_only() -> anyhow::Result<()> {
    let service = test_service()?;
    let ctx = RequestContext::for_tenant("pattieblack");

    let mut decl = declaration("eager");
    decl.extra
        .insert("checksum".to_owned(), serde_json::json!("deadbeef"));
    let err = service.create_image(&ctx, decl).await.unwrap_err();
    assert_eq!(err.short_msg(), "ReadonlyAttribute");

    let mut decl = declaration("bogus");
    decl.extra
        .insert("frobnitz".to_owned(), serde_json::json!(1));
    let err = service.create_image(&ctx, decl).await.unwrap_err();
    assert_eq!(err.short_msg(), "UnknownAttribute");

    // The same attribute is silently dropped on update.
    let record = service.create_image(&ctx, declaration("ok")).await?;
    let mut update = ImageDeclaration::default();
    update
        .extra
        .insert("checksum".to_owned(), serde_json::json!("deadbeef"));
    let updated = service
        .update_image(&ctx, &ImageId::from(record.id.as_str()), update, false)
        .await?;
    assert_eq!(updated.checksum, None);
    Ok(())
}

#[tokio::test]
async fn test_location_mutation_guard() -> anyhow::Result<()> {
    let service = test_service()?;
    let ctx = RequestContext::for_tenant("pattieblack");
    let mut decl = declaration("anchored");
    decl.locations = vec![LocationEntry {
        url: "http://mirror.example.com/a.img".to_owned(),
        metadata: BTreeMap::new(),
    }];
    let record = service.create_image(&ctx, decl).await?;
    let id = ImageId::from(record.id.as_str());

    let mut update = ImageDeclaration::default();
    update.locations = vec![LocationEntry {
        url: "http://evil.example.com/b.img".to_owned(),
        metadata: BTreeMap::new(),
    }];
    let err = service
        .update_image(&ctx, &id, update.clone(), false)
        .await
        .unwrap_err();
    assert!(err.is_forbidden());

    let admin = RequestContext::admin();
    service.update_image(&admin, &id, update, false).await?;
    Ok(())
}

#[tokio::test]
async fn test_update_all_members_replaces_set() -> anyhow::Result<()> {
    let service = test_service()?;
    let ctx = RequestContext::for_tenant("pattieblack");
    let record = service.create_image(&ctx, declaration("shared")).await?;
    let id = ImageId::from(record.id.as_str());

    let members = service
        .update_all_members(
            &ctx,
            &id,
            vec![
                MembershipDeclaration {
                    member_id: "froggy".to_owned(),
                    can_share: Some(true),
                },
                MembershipDeclaration {
                    member_id: "tenant2".to_owned(),
                    can_share: None,
                },
            ],
        )
        .await?;
    assert_eq!(members.len(), 2);

    // Replace: froggy survives keeping can_share by default, tenant2 is
    // dropped, tenant3 appears.
    let members = service
        .update_all_members(
            &ctx,
            &id,
            vec![
                MembershipDeclaration {
                    member_id: "froggy".to_owned(),
                    can_share: None,
                },
                MembershipDeclaration {
                    member_id: "tenant3".to_owned(),
                    can_share: None,
                },
            ],
        )
        .await?;
    let by_id: BTreeMap<_, _> = members
        .iter()
        .map(|m| (m.member_id.as_str(), m.can_share))
        .collect();
    assert_eq!(by_id, BTreeMap::from([("froggy", true), ("tenant3", false)]));

    let shared = service.shared_images(&ctx, "tenant2", None, None).await?;
    assert!(shared.is_empty());
    let shared = service.shared_images(&ctx, "froggy", None, None).await?;
    assert_eq!(shared.len(), 1);
    assert_eq!(shared[0].image_id, record.id);
    Ok(())
}

#[tokio::test]
async fn test_member_upsert_and_delete() -> anyhow::Result<()> {
    let service = test_service()?;
    let ctx = RequestContext::for_tenant("pattieblack");
    let record = service.create_image(&ctx, declaration("m")).await?;
    let id = ImageId::from(record.id.as_str());

    let entry = service.add_member(&ctx, &id, "froggy", None).await?;
    assert!(!entry.can_share);
    let entry = service.add_member(&ctx, &id, "froggy", Some(true)).await?;
    assert!(entry.can_share);
    // Upsert without can_share keeps the previous grant.
    let entry = service.add_member(&ctx, &id, "froggy", None).await?;
    assert!(entry.can_share);

    // A member without can_share may not re-share.
    service.add_member(&ctx, &id, "tenant2", None).await?;
    let member_ctx = RequestContext::for_tenant("tenant2");
    let err = service
        .add_member(&member_ctx, &id, "tenant4", None)
        .await
        .unwrap_err();
    assert!(err.is_forbidden());

    // froggy holds can_share and may extend the grant.
    let friend_ctx = RequestContext::for_tenant("froggy");
    service.add_member(&friend_ctx, &id, "tenant5", None).await?;

    service.delete_member(&ctx, &id, "tenant5").await?;
    let err = service
        .delete_member(&ctx, &id, "tenant5")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    Ok(())
}

#[tokio::test]
async fn test_read_only_context_cannot_write() -> anyhow::Result<()> {
    let service = test_service()?;
    let ctx = RequestContext::for_tenant("pattieblack").with_read_only(true);
    let err = service.create_image(&ctx, declaration("ro")).await.unwrap_err();
    assert!(err.is_forbidden());
    Ok(())
}

#[test]
fn test_parse_filters_from_query_params() -> anyhow::Result<()> {
    let params = BTreeMap::from([
        ("name".to_owned(), "cirros".to_owned()),
        ("is_public".to_owned(), "true".to_owned()),
        ("size_min".to_owned(), "1024".to_owned()),
        ("min_disk".to_owned(), "10".to_owned()),
        ("property-arch".to_owned(), "x86_64".to_owned()),
        ("marker".to_owned(), "ignored-here".to_owned()),
    ]);
    let filters = crate::api::parse_filters(&params)?;
    assert_eq!(filters.name.as_deref(), Some("cirros"));
    assert_eq!(filters.is_public, Some(true));
    assert_eq!(filters.size_min, Some(1024));
    assert_eq!(filters.min_disk_min, Some(10));
    assert_eq!(filters.min_disk_max, Some(10));
    assert_eq!(filters.properties.get("arch").map(String::as_str), Some("x86_64"));

    // Non-numeric range bound is the canonical range-value error.
    let params = BTreeMap::from([("size_min".to_owned(), "tiny".to_owned())]);
    let err = crate::api::parse_filters(&params).unwrap_err();
    assert_eq!(err.short_msg(), "InvalidFilterRangeValue");

    let params = BTreeMap::from([("shoe_size".to_owned(), "9".to_owned())]);
    let err = crate::api::parse_filters(&params).unwrap_err();
    assert_eq!(err.short_msg(), "InvalidFilter");
    Ok(())
}

#[test]
fn test_parse_pagination_from_query_params() -> anyhow::Result<()> {
    let params = BTreeMap::from([
        ("marker".to_owned(), "uuid3".to_owned()),
        ("limit".to_owned(), "2".to_owned()),
        ("sort_key".to_owned(), "name".to_owned()),
        ("sort_dir".to_owned(), "asc".to_owned()),
    ]);
    let pagination = crate::api::parse_pagination(&params)?;
    assert_eq!(pagination.marker, Some(ImageId::from("uuid3")));
    assert_eq!(pagination.limit, Some(2));
    assert_eq!(pagination.sort_key.as_deref(), Some("name"));

    let params = BTreeMap::from([("limit".to_owned(), "plenty".to_owned())]);
    let err = crate::api::parse_pagination(&params).unwrap_err();
    assert!(err.is_bad_request());
    Ok(())
}

#[tokio::test]
async fn test_records_carry_no_locations() -> anyhow::Result<()> {
    let service = test_service()?;
    let ctx = RequestContext::for_tenant("pattieblack");
    let mut decl = declaration("hidden");
    decl.locations = vec![LocationEntry {
        url: "file:///var/lib/images/secret".to_owned(),
        metadata: BTreeMap::new(),
    }];
    let record = service.create_image(&ctx, decl).await?;
    let json = serde_json::to_string(&record)?;
    assert!(!json.contains("location"), "locations leaked: {json}");
    assert!(!json.contains("secret"), "locations leaked: {json}");
    Ok(())
}
