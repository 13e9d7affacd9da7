use std::{
    env,
    path::PathBuf,
    sync::Arc,
};

use anyhow::Context;
use async_trait::async_trait;
use common::{
    md5::Md5,
    runtime::Runtime,
    types::ImageId,
};
use errors::ErrorMetadata;
use futures::{
    StreamExt,
    TryStreamExt,
};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use crate::{
    BodyStream,
    ObjectStore,
    PutResult,
    StoreGetStream,
    StoreLocation,
};

pub const FILESYSTEM_SCHEME: &str = "file";

/// Image bodies as flat files under a data directory, named by image id.
pub struct FilesystemStore<RT: Runtime> {
    rt: RT,
    datadir: PathBuf,
    _temp_dir: Option<Arc<TempDir>>,
}

impl<RT: Runtime> std::fmt::Debug for FilesystemStore<RT> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilesystemStore")
            .field("datadir", &self.datadir)
            .finish()
    }
}

impl<RT: Runtime> FilesystemStore<RT> {
    // Creates storage using a temporary directory. The directory is deleted
    // when the object is dropped.
    pub fn new(rt: RT) -> anyhow::Result<Self> {
        let temp_dir = TempDir::new()?;
        Ok(Self {
            rt,
            datadir: temp_dir.path().to_owned(),
            _temp_dir: Some(Arc::new(temp_dir)),
        })
    }

    /// Create storage at the provided directory
    pub fn new_at_path(rt: RT, datadir: PathBuf) -> anyhow::Result<Self> {
        let datadir = if datadir.is_absolute() {
            datadir
        } else {
            env::current_dir()?.join(datadir)
        };
        std::fs::create_dir_all(&datadir)?;
        Ok(Self {
            rt,
            datadir,
            _temp_dir: None,
        })
    }

    /// Returns the path to the storage directory.
    pub fn path(&self) -> &PathBuf {
        &self.datadir
    }

    fn path_for_image(&self, image_id: &ImageId) -> PathBuf {
        self.datadir.join(image_id.as_str())
    }

    fn path_for_location(&self, location: &StoreLocation) -> anyhow::Result<PathBuf> {
        let path = location
            .url()
            .strip_prefix("file://")
            .with_context(|| format!("Not a filesystem location: {location}"))?;
        Ok(PathBuf::from(path))
    }
}

/// Removes a temp file that never graduated to a real body. Removal is
/// synchronous so it also runs when the owning upload future is dropped
/// rather than polled to completion.
struct PartialBodyGuard {
    path: Option<PathBuf>,
}

impl PartialBodyGuard {
    fn disarm(&mut self) {
        self.path = None;
    }
}

impl Drop for PartialBodyGuard {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Could not remove partial body at {path:?}: {e}");
            }
        }
    }
}

#[async_trait]
impl<RT: Runtime> ObjectStore for FilesystemStore<RT> {
    async fn get(&self, location: &StoreLocation) -> anyhow::Result<StoreGetStream> {
        let path = self.path_for_location(location)?;
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                anyhow::bail!(ErrorMetadata::not_found(
                    "ImageBodyNotFound",
                    format!("No image body at {location}"),
                ));
            },
            Err(e) => return Err(e.into()),
        };
        let content_length = file.metadata().await?.len();
        let stream = ReaderStream::with_capacity(file, *common::knobs::TRANSFER_CHUNK_SIZE);
        Ok(StoreGetStream {
            content_length: Some(content_length),
            stream: stream.boxed(),
        })
    }

    async fn put(&self, image_id: &ImageId, mut body: BodyStream) -> anyhow::Result<PutResult> {
        let path = self.path_for_image(image_id);
        // Write through a temporary name so a crashed upload never leaves a
        // half-written body where a reader could find it. The guard erases
        // the temp file on every exit short of the rename below, including
        // this future being dropped mid-stream by a canceled request.
        let tmp_path = self
            .datadir
            .join(format!("{image_id}.{}.part", self.rt.new_uuid_v4()));
        let mut partial_guard = PartialBodyGuard {
            path: Some(tmp_path.clone()),
        };
        let mut file = tokio::fs::File::create(&tmp_path).await?;

        let mut hasher = Md5::new();
        let mut bytes_written = 0u64;
        while let Some(chunk) = body.try_next().await? {
            hasher.update(&chunk);
            bytes_written += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, &path).await?;
        partial_guard.disarm();

        Ok(PutResult {
            location: StoreLocation::new(format!("file://{}", path.display())),
            bytes_written,
            checksum: hasher.finalize(),
        })
    }

    async fn delete(&self, location: &StoreLocation) -> anyhow::Result<()> {
        let path = self.path_for_location(location)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                anyhow::bail!(ErrorMetadata::not_found(
                    "ImageBodyNotFound",
                    format!("No image body at {location}"),
                ));
            },
            Err(e) => Err(e.into()),
        }
    }
}
