//! The state machine governing an image from reservation through streaming
//! upload to active retrieval and eventual scrubbed deletion. Orchestrates
//! the registry below and the object-store dispatcher beside it; every
//! transition is guarded by the visibility rules.

use std::{
    collections::BTreeSet,
    pin::Pin,
    sync::Arc,
    task::{
        Context,
        Poll,
    },
};

use bytes::Bytes;
use catalog::{
    CatalogStore,
    Image,
    ImageLocation,
    ImageValues,
    LocationStatus,
};
use common::{
    context::RequestContext,
    knobs::IMAGE_SIZE_CAP,
    md5::Md5Digest,
    runtime::Runtime,
    types::{
        ImageId,
        ImageStatus,
    },
};
use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use events::{
    EventLogger,
    ImageEvent,
    ImageSendFields,
};
use futures::{
    stream::BoxStream,
    Stream,
    StreamExt,
};
use parking_lot::Mutex;
use registry::{
    api::{
        ImageDeclaration,
        ImageRecord,
    },
    RegistryService,
};
use store::{
    location,
    BodyStream,
    StoreDispatcher,
    StoreLocation,
};


pub struct ImageLifecycle<RT: Runtime> {
    rt: RT,
    registry: RegistryService<RT>,
    stores: StoreDispatcher,
    events: Arc<dyn EventLogger>,
    // Logical per-image upload lock. Never held across a suspension point;
    // membership in the set is what serializes concurrent uploads.
    uploads_in_flight: Arc<Mutex<BTreeSet<ImageId>>>,
}

impl<RT: Runtime> Clone for ImageLifecycle<RT> {
    fn clone(&self) -> Self {
        Self {
            rt: self.rt.clone(),
            registry: self.registry.clone(),
            stores: self.stores.clone(),
            events: self.events.clone(),
            uploads_in_flight: self.uploads_in_flight.clone(),
        }
    }
}

/// Where a download is headed, for the `image.send` notification.
#[derive(Clone, Debug, Default)]
pub struct DownloadTarget {
    pub destination_ip: Option<String>,
}

/// An open download: metadata for response headers plus the instrumented
/// byte stream.
pub struct ImageDownload {
    pub record: ImageRecord,
    pub content_length: Option<u64>,
    pub stream: BoxStream<'static, futures::io::Result<Bytes>>,
}

impl<RT: Runtime> ImageLifecycle<RT> {
    pub fn new(
        rt: RT,
        registry: RegistryService<RT>,
        stores: StoreDispatcher,
        events: Arc<dyn EventLogger>,
    ) -> Self {
        Self {
            rt,
            registry,
            stores,
            events,
            uploads_in_flight: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    pub fn registry(&self) -> &RegistryService<RT> {
        &self.registry
    }

    fn catalog(&self) -> &CatalogStore<RT> {
        self.registry.catalog()
    }

    /// Register an image. Without preset locations this is a reservation in
    /// `queued` awaiting a body; with them the image goes straight to
    /// `active`. Preset location URLs are sealed for rest before they touch
    /// the catalog.
    pub async fn create_image(
        &self,
        ctx: &RequestContext,
        mut declaration: ImageDeclaration,
    ) -> anyhow::Result<ImageRecord> {
        let mut rng = self.rt.rng();
        for entry in &mut declaration.locations {
            entry.url = location::url_for_rest(&entry.url, rng.as_mut());
        }
        drop(rng);
        self.registry.create_image(ctx, declaration).await
    }

    /// Upload the body for a reserved image: `queued` -> `saving` ->
    /// `active`, or `killed` on any integrity failure.
    pub async fn upload_image(
        &self,
        ctx: &RequestContext,
        id: &ImageId,
        body: BodyStream,
        declared_size: Option<u64>,
        expected_checksum: Option<String>,
    ) -> anyhow::Result<ImageRecord> {
        let image = self.catalog().image_get(ctx, id, false).await?;
        catalog::visibility::check_mutate_authorization(ctx, &image)?;
        if image.status != ImageStatus::Queued {
            anyhow::bail!(ErrorMetadata::conflict(
                "ImageStatusConflict",
                format!(
                    "Image {id} is in status {} and cannot accept a body",
                    image.status
                ),
            ));
        }
        let _lock = UploadLock::acquire(&self.uploads_in_flight, id)?;

        self.set_status(ctx, id, ImageStatus::Saving).await?;
        tracing::info!("Image {id} entering saving; declared size {declared_size:?}");

        // If the upload future is dropped mid-stream (deadline, client
        // disconnect at the transport), the `saving` row must not be left
        // behind. The driver's own guard reclaims the partial body.
        let mut cleanup = UploadCleanupGuard::arm(self, ctx, id);

        let capped = enforce_size_cap(body, *IMAGE_SIZE_CAP);
        let put = self.stores.put(id, capped).await;
        let put = match put {
            Ok(put) => put,
            Err(e) => {
                cleanup.disarm();
                self.kill_image(ctx, id, None, &e.to_string()).await;
                return Err(e);
            },
        };

        if let Some(declared) = declared_size {
            if declared != put.bytes_written {
                cleanup.disarm();
                self.discard_body(&put.location).await;
                self.kill_image(ctx, id, Some(put.bytes_written), "size mismatch")
                    .await;
                anyhow::bail!(ErrorMetadata::bad_request(
                    "SizeMismatch",
                    format!(
                        "Declared size {declared} does not match {} bytes written",
                        put.bytes_written
                    ),
                ));
            }
        }
        if let Some(ref expected) = expected_checksum {
            if !put.checksum.matches_hex(expected) {
                cleanup.disarm();
                self.discard_body(&put.location).await;
                self.kill_image(ctx, id, Some(put.bytes_written), "checksum mismatch")
                    .await;
                anyhow::bail!(ErrorMetadata::bad_request(
                    "ChecksumMismatch",
                    format!(
                        "Supplied checksum {expected} does not match computed {}",
                        put.checksum.as_hex()
                    ),
                ));
            }
        }

        let result = self
            .activate(ctx, id, &put.location, put.bytes_written, &put.checksum)
            .await;
        cleanup.disarm();
        let image = match result {
            Ok(image) => image,
            Err(e) => {
                self.discard_body(&put.location).await;
                self.kill_image(ctx, id, Some(put.bytes_written), &e.to_string())
                    .await;
                return Err(e);
            },
        };
        tracing::info!(
            "Image {id} active: {} bytes, checksum {}",
            put.bytes_written,
            put.checksum.as_hex()
        );
        image.try_into()
    }

    /// Open a byte stream for the image body from the first viable
    /// location. Completion emits an `image.send` event; early termination
    /// emits the error flavor with the bytes actually sent.
    pub async fn download_image(
        &self,
        ctx: &RequestContext,
        id: &ImageId,
        target: DownloadTarget,
    ) -> anyhow::Result<ImageDownload> {
        let image = self.catalog().image_get(ctx, id, false).await?;
        let locations: Vec<ImageLocation> = viable_locations(&image).cloned().collect();
        let mut last_error: Option<anyhow::Error> = None;
        for loc in locations {
            let resolved = StoreLocation::with_metadata(
                location::url_from_rest(&loc.url),
                loc.metadata.clone(),
            );
            match self.stores.get(&resolved).await {
                Ok(get) => {
                    let fields = ImageSendFields {
                        bytes_sent: 0,
                        image_id: image.id.to_string(),
                        owner_id: image.owner.clone(),
                        receiver_tenant_id: ctx.tenant.clone(),
                        receiver_user_id: ctx.user.clone(),
                        destination_ip: target.destination_ip.clone(),
                    };
                    let stream = InstrumentedBody {
                        inner: get.stream,
                        expected: get.content_length,
                        fields,
                        events: self.events.clone(),
                        finished: false,
                    };
                    let record: ImageRecord = image.clone().try_into()?;
                    return Ok(ImageDownload {
                        record,
                        content_length: get.content_length,
                        stream: stream.boxed(),
                    });
                },
                Err(e) => {
                    tracing::warn!("Skipping location {} for image {id}: {e}", loc.url);
                    last_error = Some(e);
                },
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => anyhow::bail!(ErrorMetadata::not_found(
                "ImageBodyNotFound",
                format!("Image {id} has no stored body"),
            )),
        }
    }

    /// Delete an image. Immediate deletion reclaims bodies inline; delayed
    /// deletion parks the image in `pending_delete` for the scrubber.
    pub async fn delete_image(
        &self,
        ctx: &RequestContext,
        id: &ImageId,
        delayed: Option<bool>,
    ) -> anyhow::Result<ImageRecord> {
        let delayed = delayed.unwrap_or(*common::knobs::DELAYED_DELETE);
        let image = self.catalog().image_get(ctx, id, false).await?;
        // Authorization comes before any body is touched: a caller who may
        // not delete the row may not reclaim its bytes either.
        catalog::visibility::check_mutate_authorization(ctx, &image)?;
        if image.protected {
            anyhow::bail!(ErrorMetadata::protected_image_delete(id.as_str()));
        }

        if delayed {
            let image = self.catalog().image_mark_pending_delete(ctx, id).await?;
            return image.try_into();
        }

        for loc in viable_locations(&image) {
            let resolved = StoreLocation::with_metadata(
                location::url_from_rest(&loc.url),
                loc.metadata.clone(),
            );
            match self.stores.delete(&resolved).await {
                Ok(()) => {},
                Err(e) if e.is_not_found() => {
                    tracing::warn!("Body for image {id} at {resolved} was already gone");
                },
                // Synchronous deletes propagate StoreDeleteNotSupported and
                // everything else; only the scrubber swallows it.
                Err(e) => return Err(e),
            }
        }
        self.catalog().image_destroy(ctx, id).await?.try_into()
    }

    async fn activate(
        &self,
        ctx: &RequestContext,
        id: &ImageId,
        loc: &StoreLocation,
        size: u64,
        checksum: &Md5Digest,
    ) -> anyhow::Result<Image> {
        let mut rng = self.rt.rng();
        let sealed_url = location::url_for_rest(loc.url(), rng.as_mut());
        drop(rng);
        let values = ImageValues {
            status: Some(ImageStatus::Active),
            size: Some(size),
            checksum: Some(Some(checksum.as_hex())),
            locations: Some(vec![ImageLocation {
                url: sealed_url,
                metadata: loc.metadata().clone(),
                status: LocationStatus::Active,
            }]),
            ..Default::default()
        };
        self.catalog().image_update(ctx, id, values, false).await
    }

    async fn set_status(
        &self,
        ctx: &RequestContext,
        id: &ImageId,
        status: ImageStatus,
    ) -> anyhow::Result<Image> {
        let values = ImageValues {
            status: Some(status),
            ..Default::default()
        };
        self.catalog().image_update(ctx, id, values, false).await
    }

    /// Best-effort removal of a body that failed verification.
    async fn discard_body(&self, loc: &StoreLocation) {
        if let Err(e) = self.stores.delete(loc).await {
            if !e.is_store_delete_unsupported() {
                tracing::warn!("Could not remove rejected body at {loc}: {e}");
            }
        }
    }

    /// Record the terminal failure state. Failures here are logged rather
    /// than surfaced: the original upload error is what the caller needs.
    async fn kill_image(
        &self,
        ctx: &RequestContext,
        id: &ImageId,
        size: Option<u64>,
        cause: &str,
    ) {
        tracing::error!("Killing image {id}: {cause}");
        let values = ImageValues {
            status: Some(ImageStatus::Killed),
            size,
            ..Default::default()
        };
        if let Err(e) = self.catalog().image_update(ctx, id, values, false).await {
            tracing::error!("Could not mark image {id} killed: {e}");
        }
    }
}

fn viable_locations(image: &Image) -> impl Iterator<Item = &ImageLocation> {
    image
        .locations
        .iter()
        .filter(|l| l.status == LocationStatus::Active || l.status == LocationStatus::PendingDelete)
}

/// Count bytes as they stream and abort the transfer the moment the cap is
/// crossed, so a chunked upload without a content length cannot fill the
/// backend.
fn enforce_size_cap(body: BodyStream, cap: u64) -> BodyStream {
    let mut total: u64 = 0;
    body.map(move |chunk| {
        let chunk = chunk?;
        total += chunk.len() as u64;
        if total > cap {
            anyhow::bail!(ErrorMetadata::bad_request(
                "ImageTooLarge",
                format!("Image body exceeds the {cap} byte cap"),
            ));
        }
        Ok(chunk)
    })
    .boxed()
}

#[derive(Debug)]
struct UploadLock {
    uploads_in_flight: Arc<Mutex<BTreeSet<ImageId>>>,
    id: ImageId,
}

impl UploadLock {
    fn acquire(
        uploads_in_flight: &Arc<Mutex<BTreeSet<ImageId>>>,
        id: &ImageId,
    ) -> anyhow::Result<Self> {
        if !uploads_in_flight.lock().insert(id.clone()) {
            anyhow::bail!(ErrorMetadata::conflict(
                "UploadInProgress",
                format!("Another upload for image {id} is already in flight"),
            ));
        }
        Ok(Self {
            uploads_in_flight: uploads_in_flight.clone(),
            id: id.clone(),
        })
    }
}

impl Drop for UploadLock {
    fn drop(&mut self) {
        self.uploads_in_flight.lock().remove(&self.id);
    }
}

/// If an upload future is dropped before reaching a terminal state, kill
/// the image from a detached task: cancellation is equivalent to a client
/// disconnect. The partial body itself is reclaimed by the store driver's
/// drop guard, so this only has to settle the catalog row.
struct UploadCleanupGuard<RT: Runtime> {
    rt: RT,
    catalog: CatalogStore<RT>,
    ctx: RequestContext,
    id: ImageId,
    armed: bool,
}

impl<RT: Runtime> UploadCleanupGuard<RT> {
    fn arm(lifecycle: &ImageLifecycle<RT>, ctx: &RequestContext, id: &ImageId) -> Self {
        Self {
            rt: lifecycle.rt.clone(),
            catalog: lifecycle.catalog().clone(),
            ctx: ctx.clone(),
            id: id.clone(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<RT: Runtime> Drop for UploadCleanupGuard<RT> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let catalog = self.catalog.clone();
        let ctx = self.ctx.clone();
        let id = self.id.clone();
        // Detached on purpose: the canceled request's worker is gone.
        self.rt.spawn("upload_cancel_cleanup", async move {
            tracing::error!("Upload for image {id} was canceled; killing image");
            let values = ImageValues {
                status: Some(ImageStatus::Killed),
                ..Default::default()
            };
            if let Err(e) = catalog.image_update(&ctx, &id, values, false).await {
                tracing::error!("Could not mark canceled image {id} killed: {e}");
            }
        });
    }
}

/// Counts bytes through to the client and emits the `image.send`
/// notification when the transfer ends, in whichever way it ends.
struct InstrumentedBody {
    inner: BoxStream<'static, futures::io::Result<Bytes>>,
    expected: Option<u64>,
    fields: ImageSendFields,
    events: Arc<dyn EventLogger>,
    finished: bool,
}

impl InstrumentedBody {
    fn emit(&mut self, completed: bool) {
        if self.finished {
            return;
        }
        self.finished = true;
        let fields = self.fields.clone();
        let event = if completed {
            ImageEvent::Send { fields }
        } else {
            ImageEvent::SendError { fields }
        };
        self.events.record(vec![event]);
    }
}

impl Stream for InstrumentedBody {
    type Item = futures::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.fields.bytes_sent += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            },
            Poll::Ready(Some(Err(e))) => {
                self.emit(false);
                Poll::Ready(Some(Err(e)))
            },
            Poll::Ready(None) => {
                let completed = match self.expected {
                    Some(expected) => self.fields.bytes_sent == expected,
                    None => true,
                };
                self.emit(completed);
                Poll::Ready(None)
            },
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for InstrumentedBody {
    fn drop(&mut self) {
        // A dropped stream is a client that went away mid-download.
        self.emit(false);
    }
}
