use async_trait::async_trait;
use common::types::ImageId;
use errors::ErrorMetadata;
use futures::{
    StreamExt,
    TryStreamExt,
};

use crate::{
    BodyStream,
    ObjectStore,
    PutResult,
    StoreGetStream,
    StoreLocation,
};

pub const HTTP_SCHEME: &str = "http";
pub const HTTPS_SCHEME: &str = "https";

/// Read-only driver for bodies hosted on plain HTTP servers. Registering an
/// image against one of these locations is supported; writing through it is
/// not.
#[derive(Debug, Clone)]
pub struct HttpStore {
    client: reqwest::Client,
}

impl HttpStore {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ObjectStore for HttpStore {
    async fn get(&self, location: &StoreLocation) -> anyhow::Result<StoreGetStream> {
        let response = self
            .client
            .get(location.url())
            .send()
            .await
            .map_err(|e| client_connection_error(location, e))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            anyhow::bail!(ErrorMetadata::not_found(
                "ImageBodyNotFound",
                format!("No image body at {location}"),
            ));
        }
        let response = response
            .error_for_status()
            .map_err(|e| client_connection_error(location, e))?;
        let content_length = response.content_length();
        let stream = response
            .bytes_stream()
            .map_err(std::io::Error::other)
            .boxed();
        Ok(StoreGetStream {
            content_length,
            stream,
        })
    }

    async fn put(&self, _image_id: &ImageId, _body: BodyStream) -> anyhow::Result<PutResult> {
        anyhow::bail!(ErrorMetadata::bad_request(
            errors::STORE_WRITE_NOT_SUPPORTED,
            "The http store is read-only and cannot accept image bodies",
        ))
    }

    async fn delete(&self, _location: &StoreLocation) -> anyhow::Result<()> {
        anyhow::bail!(ErrorMetadata::store_delete_not_supported(HTTP_SCHEME))
    }
}

fn client_connection_error(location: &StoreLocation, e: reqwest::Error) -> anyhow::Error {
    anyhow::anyhow!(e).context(ErrorMetadata::client_connection_error(format!(
        "Error talking to the downstream store at {location}"
    )))
}
