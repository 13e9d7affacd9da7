use std::{
    collections::BTreeMap,
    sync::Arc,
};

use async_trait::async_trait;
use catalog::{
    CatalogStore,
    ImageLocation,
    ImageValues,
    LocationStatus,
};
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
use futures::StreamExt;
use store::{
    BodyStream,
    FilesystemStore,
    HttpStore,
    ObjectStore,
    PutResult,
    StoreDispatcher,
    StoreGetStream,
    StoreLocation,
    FILESYSTEM_SCHEME,
    HTTP_SCHEME,
};

use crate::ScrubberInner;

/// A backend that always fails deletes, for exercising the retry bound.
#[derive(Debug)]
struct BrokenStore;

#[async_trait]
impl ObjectStore for BrokenStore {
    async fn get(&self, _location: &StoreLocation) -> anyhow::Result<StoreGetStream> {
        anyhow::bail!("broken")
    }

    async fn put(&self, _image_id: &ImageId, _body: BodyStream) -> anyhow::Result<PutResult> {
        anyhow::bail!("broken")
    }

    async fn delete(&self, _location: &StoreLocation) -> anyhow::Result<()> {
        anyhow::bail!("backend offline")
    }
}

struct Fixture {
    catalog: CatalogStore<TestRuntime>,
    fs: Arc<FilesystemStore<TestRuntime>>,
    worker: ScrubberInner<TestRuntime>,
    ctx: RequestContext,
}

fn fixture() -> anyhow::Result<Fixture> {
    let rt = TestRuntime::new();
    let catalog = CatalogStore::new_in_memory(rt.clone())?;
    let fs = Arc::new(FilesystemStore::new(rt.clone())?);
    let stores = StoreDispatcher::new()
        .register(FILESYSTEM_SCHEME, fs.clone())
        .register(HTTP_SCHEME, Arc::new(HttpStore::new()))
        .register("broken", Arc::new(BrokenStore))
        .with_default(FILESYSTEM_SCHEME);
    let worker = ScrubberInner::new(rt, catalog.clone(), stores);
    let ctx = RequestContext::for_tenant("pattieblack");
    Ok(Fixture {
        catalog,
        fs,
        worker,
        ctx,
    })
}

async fn pending_image_at(fixture: &Fixture, url: &str) -> anyhow::Result<ImageId> {
    let values = ImageValues {
        name: Some(Some("doomed".to_owned())),
        status: Some(ImageStatus::Active),
        disk_format: Some(Some(DiskFormat::Raw)),
        container_format: Some(Some(ContainerFormat::Bare)),
        locations: Some(vec![ImageLocation {
            url: url.to_owned(),
            metadata: BTreeMap::new(),
            status: LocationStatus::Active,
        }]),
        ..Default::default()
    };
    let image = fixture.catalog.image_create(&fixture.ctx, values).await?;
    fixture
        .catalog
        .image_mark_pending_delete(&fixture.ctx, &image.id)
        .await?;
    Ok(image.id)
}

/// The end of a delayed delete: a sweep reclaims the body and completes the
/// row, and the backend genuinely forgets the bytes.
#[tokio::test]
async fn test_scrub_drains_pending_delete() -> anyhow::Result<()> {
    let mut fixture = fixture()?;
    let image_id = ImageId::from("6db9ac4c-0a00-4b16-a0ca-cf5e1372f3da");
    let put = fixture
        .fs
        .put(
            &image_id,
            futures::stream::iter(vec![Ok(bytes::Bytes::from_static(b"vm bytes"))]).boxed(),
        )
        .await?;
    let id = pending_image_at(&fixture, put.location.url()).await?;

    let completed = fixture.worker.scrub_cycle().await?;
    assert_eq!(completed, 1);

    let admin = RequestContext::admin();
    let image = fixture.catalog.image_get(&admin, &id, true).await?;
    assert_eq!(image.status, ImageStatus::Deleted);
    assert!(errors::ErrorMetadataAnyhowExt::is_not_found(
        &fixture.fs.get(&put.location).await.unwrap_err()
    ));

    // No new deletes: a second sweep has nothing to do.
    assert_eq!(fixture.worker.scrub_cycle().await?, 0);
    Ok(())
}

/// Backends that cannot delete are treated as done rather than retried
/// forever.
#[tokio::test]
async fn test_scrub_swallows_delete_not_supported() -> anyhow::Result<()> {
    let mut fixture = fixture()?;
    let id = pending_image_at(&fixture, "http://mirror.example.com/cirros.img").await?;

    let completed = fixture.worker.scrub_cycle().await?;
    assert_eq!(completed, 1);

    let admin = RequestContext::admin();
    let image = fixture.catalog.image_get(&admin, &id, true).await?;
    assert_eq!(image.status, ImageStatus::Deleted);
    Ok(())
}

/// A persistently failing backend is retried a bounded number of times and
/// then left alone, still pending_delete.
#[tokio::test]
async fn test_scrub_attempts_are_bounded() -> anyhow::Result<()> {
    let mut fixture = fixture()?;
    let id = pending_image_at(&fixture, "broken://somewhere/body").await?;

    let bound = *common::knobs::SCRUBBER_MAX_ATTEMPTS;
    for _ in 0..bound + 2 {
        assert_eq!(fixture.worker.scrub_cycle().await?, 0);
    }

    let admin = RequestContext::admin();
    let image = fixture.catalog.image_get(&admin, &id, true).await?;
    assert_eq!(image.status, ImageStatus::PendingDelete);
    Ok(())
}
