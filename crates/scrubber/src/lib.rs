//! Background worker that drains pending_delete images by reclaiming their
//! bodies from the object store and completing the soft delete.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::Duration,
};

use catalog::{
    CatalogStore,
    Image,
    LocationStatus,
};
use common::{
    backoff::Backoff,
    context::RequestContext,
    knobs::{
        SCRUBBER_MAX_ATTEMPTS,
        SCRUB_GRACE_PERIOD,
        SCRUB_TIME,
    },
    runtime::{
        shutdown_and_join,
        Runtime,
        SpawnHandle,
        UnixTimestamp,
    },
    types::ImageId,
};
use errors::{
    report_error,
    ErrorMetadataAnyhowExt,
};
use parking_lot::Mutex;
use store::{
    location,
    StoreDispatcher,
    StoreLocation,
};

#[cfg(test)]
mod tests;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(900); // 15 minutes

#[derive(Clone)]
pub struct Scrubber {
    worker: Arc<Mutex<Option<Box<dyn SpawnHandle>>>>,
}

pub struct ScrubberInner<RT: Runtime> {
    rt: RT,
    catalog: CatalogStore<RT>,
    stores: StoreDispatcher,
    backoff: Backoff,
    // Sweep failures per image. An image past the attempt bound stays in
    // pending_delete and is left for an operator.
    attempts: BTreeMap<ImageId, u32>,
}

impl Scrubber {
    pub fn start<RT: Runtime>(
        rt: RT,
        catalog: CatalogStore<RT>,
        stores: StoreDispatcher,
    ) -> Self {
        let mut worker = ScrubberInner::new(rt.clone(), catalog, stores);
        let worker_handle = Arc::new(Mutex::new(Some(rt.clone().spawn("scrubber", async move {
            tracing::info!("Starting Scrubber");
            loop {
                worker.rt.wait(*SCRUB_TIME).await;
                if let Err(mut e) = worker.scrub_cycle().await {
                    report_error(&mut e);
                    let delay = worker.backoff.fail(&mut worker.rt.rng());
                    worker.rt.wait(delay).await;
                } else {
                    worker.backoff.reset();
                }
            }
        }))));
        Self {
            worker: worker_handle,
        }
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            shutdown_and_join(handle).await?;
        }
        Ok(())
    }
}

impl<RT: Runtime> ScrubberInner<RT> {
    pub fn new(rt: RT, catalog: CatalogStore<RT>, stores: StoreDispatcher) -> Self {
        Self {
            rt,
            catalog,
            stores,
            backoff: Backoff::new(INITIAL_BACKOFF, MAX_BACKOFF),
            attempts: BTreeMap::new(),
        }
    }

    /// One sweep: every pending_delete image older than the grace period
    /// has its bodies deleted and its row completed. Returns how many
    /// images were finished this cycle.
    pub async fn scrub_cycle(&mut self) -> anyhow::Result<usize> {
        // The scrubber acts on rows no caller can see any more, so it runs
        // with service privileges.
        let ctx = RequestContext::anonymous();
        let now = self.rt.unix_timestamp();
        let cutoff =
            UnixTimestamp::from_nanos(now.as_nanos().saturating_sub(SCRUB_GRACE_PERIOD.as_nanos())
                as u64);
        let due = self.catalog.images_pending_scrub(&ctx, cutoff).await?;
        if due.is_empty() {
            return Ok(0);
        }
        tracing::info!("Scrubbing {} images", due.len());

        let mut completed = 0;
        for image in due {
            let attempts = self.attempts.get(&image.id).copied().unwrap_or(0);
            if attempts >= *SCRUBBER_MAX_ATTEMPTS {
                tracing::warn!(
                    "Image {} has failed {attempts} scrub attempts; leaving it in \
                     pending_delete",
                    image.id
                );
                continue;
            }
            match self.scrub_image(&ctx, &image).await {
                Ok(()) => {
                    self.attempts.remove(&image.id);
                    completed += 1;
                },
                Err(e) => {
                    self.attempts.insert(image.id.clone(), attempts + 1);
                    tracing::warn!(
                        "Scrub attempt {} failed for image {}: {e:#}",
                        attempts + 1,
                        image.id
                    );
                },
            }
        }
        Ok(completed)
    }

    async fn scrub_image(&self, ctx: &RequestContext, image: &Image) -> anyhow::Result<()> {
        for loc in &image.locations {
            if loc.status != LocationStatus::PendingDelete && loc.status != LocationStatus::Active
            {
                continue;
            }
            let resolved = StoreLocation::with_metadata(
                location::url_from_rest(&loc.url),
                loc.metadata.clone(),
            );
            match self.stores.delete(&resolved).await {
                Ok(()) => {},
                // A backend that cannot delete counts as done; there is
                // nothing more a retry could do.
                Err(e) if e.is_store_delete_unsupported() => {
                    tracing::info!(
                        "Store for {} does not support delete; marking location done",
                        image.id
                    );
                },
                // A body that's already gone is exactly what we wanted.
                Err(e) if e.is_not_found() => {},
                Err(e) => return Err(e),
            }
        }
        self.catalog.image_scrub_complete(ctx, &image.id).await?;
        tracing::info!("Scrubbed image {}", image.id);
        Ok(())
    }
}
