//! Pluggable object backends for image bodies. A driver is selected by the
//! URL scheme of a location; the mapping is built once at startup.

use std::{
    collections::BTreeMap,
    fmt::Debug,
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use common::{
    md5::Md5Digest,
    types::ImageId,
};
use errors::ErrorMetadata;
use futures::stream::BoxStream;

mod crypt;
mod filesystem;
mod http;
pub mod location;
mod s3;

pub use self::{
    filesystem::{
        FilesystemStore,
        FILESYSTEM_SCHEME,
    },
    http::{
        HttpStore,
        HTTPS_SCHEME,
        HTTP_SCHEME,
    },
    location::StoreLocation,
    s3::{
        S3Store,
        S3_SCHEME,
    },
};


/// An open read stream of an image body. Size may be unknown when the
/// backend itself is streaming.
pub struct StoreGetStream {
    pub content_length: Option<u64>,
    pub stream: BoxStream<'static, futures::io::Result<Bytes>>,
}

impl std::fmt::Debug for StoreGetStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreGetStream")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct PutResult {
    /// The canonical URL future `get`s may use.
    pub location: StoreLocation,
    pub bytes_written: u64,
    /// MD5 over the bytes actually written.
    pub checksum: Md5Digest,
}

pub type BodyStream = BoxStream<'static, anyhow::Result<Bytes>>;

#[async_trait]
pub trait ObjectStore: Send + Sync + Debug {
    /// Opens a read stream of the body.
    async fn get(&self, location: &StoreLocation) -> anyhow::Result<StoreGetStream>;

    /// Streams to storage, computing the MD5 over the bytes actually
    /// written. Implementations must clean up partial bodies on failure.
    async fn put(&self, image_id: &ImageId, body: BodyStream) -> anyhow::Result<PutResult>;

    /// Removes the body. Read-only backends signal
    /// `StoreDeleteNotSupported`, which the delayed-delete scheduler
    /// swallows and the synchronous path propagates.
    async fn delete(&self, location: &StoreLocation) -> anyhow::Result<()>;
}

/// URL scheme -> driver. Resolved once at startup; an unconfigured scheme on
/// a stored location is a deployment error surfaced per lookup.
#[derive(Clone, Debug)]
pub struct StoreDispatcher {
    stores: BTreeMap<&'static str, Arc<dyn ObjectStore>>,
    default_scheme: Option<&'static str>,
}

impl StoreDispatcher {
    pub fn new() -> Self {
        Self {
            stores: BTreeMap::new(),
            default_scheme: None,
        }
    }

    pub fn register(mut self, scheme: &'static str, store: Arc<dyn ObjectStore>) -> Self {
        self.stores.insert(scheme, store);
        self
    }

    /// The store new uploads go to.
    pub fn with_default(mut self, scheme: &'static str) -> Self {
        self.default_scheme = Some(scheme);
        self
    }

    pub fn store_for_scheme(&self, scheme: &str) -> anyhow::Result<Arc<dyn ObjectStore>> {
        self.stores.get(scheme).cloned().ok_or_else(|| {
            ErrorMetadata::bad_request(
                "UnknownScheme",
                format!("No object store is configured for scheme '{scheme}'"),
            )
            .into()
        })
    }

    pub fn store_for_location(
        &self,
        location: &StoreLocation,
    ) -> anyhow::Result<Arc<dyn ObjectStore>> {
        self.store_for_scheme(location.scheme())
    }

    pub fn default_store(&self) -> anyhow::Result<Arc<dyn ObjectStore>> {
        let scheme = self.default_scheme.ok_or_else(|| {
            ErrorMetadata::bad_request(
                "NoDefaultStore",
                "No default object store is configured for uploads",
            )
        })?;
        self.store_for_scheme(scheme)
    }

    pub async fn get(&self, location: &StoreLocation) -> anyhow::Result<StoreGetStream> {
        self.store_for_location(location)?.get(location).await
    }

    pub async fn put(&self, image_id: &ImageId, body: BodyStream) -> anyhow::Result<PutResult> {
        self.default_store()?.put(image_id, body).await
    }

    pub async fn delete(&self, location: &StoreLocation) -> anyhow::Result<()> {
        self.store_for_location(location)?.delete(location).await
    }
}
