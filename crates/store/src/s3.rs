use anyhow::Context;
use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_sdk_s3::{
    primitives::ByteStream,
    types::{
        CompletedMultipartUpload,
        CompletedPart,
    },
    Client,
};
use bytes::Bytes;
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
use tokio_util::io::ReaderStream;

use crate::{
    BodyStream,
    ObjectStore,
    PutResult,
    StoreGetStream,
    StoreLocation,
};

pub const S3_SCHEME: &str = "s3";

/// S3 minimum part size for multipart upload is 5MiB
const MIN_S3_PART_SIZE: usize = 5 * (1 << 20);

#[derive(Clone)]
pub struct S3Store<RT: Runtime> {
    client: Client,
    bucket: String,
    // Prefix gets added as prefix to all keys.
    key_prefix: String,
    rt: RT,
}

impl<RT: Runtime> std::fmt::Debug for S3Store<RT> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Store")
            .field("bucket", &self.bucket)
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl<RT: Runtime> S3Store<RT> {
    pub async fn new(rt: RT, bucket: String, key_prefix: String) -> anyhow::Result<Self> {
        let config = aws_config::load_from_env().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&config)
            .retry_config(RetryConfig::standard())
            .build();
        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket,
            key_prefix,
            rt,
        })
    }

    fn key_for_image(&self, image_id: &ImageId) -> String {
        format!("{}{image_id}", self.key_prefix)
    }

    fn key_for_location<'a>(&self, location: &'a StoreLocation) -> anyhow::Result<&'a str> {
        let rest = location
            .url()
            .strip_prefix("s3://")
            .with_context(|| format!("Not an s3 location: {location}"))?;
        let (bucket, key) = rest
            .split_once('/')
            .with_context(|| format!("Malformed s3 location: {location}"))?;
        anyhow::ensure!(
            bucket == self.bucket,
            "Location {location} does not belong to bucket {}",
            self.bucket
        );
        Ok(key)
    }

    fn url_for_key(&self, key: &str) -> String {
        format!("s3://{}/{key}", self.bucket)
    }

    async fn upload_multipart(
        &self,
        key: &str,
        body: &mut BodyStream,
        first_parts: Vec<Bytes>,
    ) -> anyhow::Result<(u64, common::md5::Md5Digest)> {
        let upload = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await?;
        let upload_id = upload.upload_id().context("missing upload id")?.to_owned();
        // Abort on any exit short of a completed upload, including this
        // future being dropped mid-stream; S3 keeps charging for orphaned
        // parts until someone aborts them.
        let mut abort_guard = MultipartAbortGuard {
            rt: self.rt.clone(),
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: key.to_owned(),
            upload_id: Some(upload_id.clone()),
        };

        let mut hasher = Md5::new();
        let mut bytes_written = 0u64;
        let mut completed_parts = Vec::new();
        let mut part_number = 1i32;
        let mut buffer: Vec<u8> = Vec::with_capacity(MIN_S3_PART_SIZE);

        let mut flush_part = |buffer: &mut Vec<u8>| -> Vec<u8> {
            std::mem::replace(buffer, Vec::with_capacity(MIN_S3_PART_SIZE))
        };

        for part in first_parts {
            hasher.update(&part);
            bytes_written += part.len() as u64;
            buffer.extend_from_slice(&part);
        }

        loop {
            let chunk = body.try_next().await?;
            let finished = chunk.is_none();
            if let Some(chunk) = chunk {
                hasher.update(&chunk);
                bytes_written += chunk.len() as u64;
                buffer.extend_from_slice(&chunk);
            }
            if buffer.len() >= MIN_S3_PART_SIZE || (finished && !buffer.is_empty()) {
                let part = flush_part(&mut buffer);
                let uploaded = self
                    .client
                    .upload_part()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .part_number(part_number)
                    .body(ByteStream::from(part))
                    .send()
                    .await?;
                completed_parts.push(
                    CompletedPart::builder()
                        .part_number(part_number)
                        .set_e_tag(uploaded.e_tag().map(str::to_owned))
                        .build(),
                );
                part_number += 1;
            }
            if finished {
                break;
            }
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await?;
        abort_guard.disarm();
        Ok((bytes_written, hasher.finalize()))
    }
}

/// Aborts an in-flight multipart upload unless it completed. The abort runs
/// on a detached task because the canceled request's worker is already gone
/// and the call is best-effort either way.
struct MultipartAbortGuard<RT: Runtime> {
    rt: RT,
    client: Client,
    bucket: String,
    key: String,
    upload_id: Option<String>,
}

impl<RT: Runtime> MultipartAbortGuard<RT> {
    fn disarm(&mut self) {
        self.upload_id = None;
    }
}

impl<RT: Runtime> Drop for MultipartAbortGuard<RT> {
    fn drop(&mut self) {
        let Some(upload_id) = self.upload_id.take() else {
            return;
        };
        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let key = self.key.clone();
        self.rt.spawn("s3_multipart_abort", async move {
            let abort = client
                .abort_multipart_upload()
                .bucket(&bucket)
                .key(&key)
                .upload_id(&upload_id)
                .send()
                .await;
            if let Err(e) = abort {
                tracing::warn!("Could not abort multipart upload for {key}: {e}");
            }
        });
    }
}

#[async_trait]
impl<RT: Runtime> ObjectStore for S3Store<RT> {
    async fn get(&self, location: &StoreLocation) -> anyhow::Result<StoreGetStream> {
        let key = self.key_for_location(location)?;
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| match e.as_service_error() {
                Some(service) if service.is_no_such_key() => {
                    anyhow::Error::from(ErrorMetadata::not_found(
                        "ImageBodyNotFound",
                        format!("No image body at {location}"),
                    ))
                },
                _ => ErrorMetadata::client_connection_error(format!(
                    "Error talking to the downstream store at {location}"
                ))
                .into(),
            })?;
        let content_length = output.content_length().map(|len| len as u64);
        let stream = ReaderStream::with_capacity(
            output.body.into_async_read(),
            *common::knobs::TRANSFER_CHUNK_SIZE,
        );
        Ok(StoreGetStream {
            content_length,
            stream: stream.boxed(),
        })
    }

    async fn put(&self, image_id: &ImageId, mut body: BodyStream) -> anyhow::Result<PutResult> {
        let key = self.key_for_image(image_id);

        // Small bodies skip the multipart dance entirely.
        let mut first_parts = Vec::new();
        let mut buffered = 0usize;
        while buffered < MIN_S3_PART_SIZE {
            match body.try_next().await? {
                Some(chunk) => {
                    buffered += chunk.len();
                    first_parts.push(chunk);
                },
                None => {
                    let mut hasher = Md5::new();
                    let mut whole = Vec::with_capacity(buffered);
                    for part in &first_parts {
                        hasher.update(part);
                        whole.extend_from_slice(part);
                    }
                    let bytes_written = whole.len() as u64;
                    self.client
                        .put_object()
                        .bucket(&self.bucket)
                        .key(&key)
                        .body(ByteStream::from(whole))
                        .send()
                        .await?;
                    return Ok(PutResult {
                        location: StoreLocation::new(self.url_for_key(&key)),
                        bytes_written,
                        checksum: hasher.finalize(),
                    });
                },
            }
        }

        let (bytes_written, checksum) = self.upload_multipart(&key, &mut body, first_parts).await?;
        Ok(PutResult {
            location: StoreLocation::new(self.url_for_key(&key)),
            bytes_written,
            checksum,
        })
    }

    async fn delete(&self, location: &StoreLocation) -> anyhow::Result<()> {
        let key = self.key_for_location(location)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await?;
        Ok(())
    }
}
