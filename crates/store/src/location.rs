//! A location is a URL through which an image body can be fetched, plus a
//! small opaque mapping of driver-specific hints. URLs may be encrypted at
//! rest; reads accept both encrypted and plaintext forms so keys can be
//! rotated in place.

use std::collections::BTreeMap;

use rand::RngCore;

use crate::crypt::{
    self,
    KEY_SIZE_BYTES,
};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoreLocation {
    url: String,
    metadata: BTreeMap<String, String>,
}

impl StoreLocation {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(url: impl Into<String>, metadata: BTreeMap<String, String>) -> Self {
        Self {
            url: url.into(),
            metadata,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn scheme(&self) -> &str {
        self.url.split(':').next().unwrap_or("")
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }
}

impl std::fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.url.fmt(f)
    }
}

fn configured_key() -> Option<[u8; KEY_SIZE_BYTES]> {
    let raw = common::knobs::METADATA_ENCRYPTION_KEY.as_ref()?;
    match raw.as_bytes().try_into() {
        Ok(key) => Some(key),
        Err(_) => {
            tracing::warn!(
                "METADATA_ENCRYPTION_KEY must be exactly {KEY_SIZE_BYTES} bytes; storing \
                 location URLs in plaintext"
            );
            None
        },
    }
}

/// The URL as it should be persisted in the catalog.
pub fn url_for_rest(url: &str, rng: &mut dyn RngCore) -> String {
    match configured_key() {
        Some(key) => crypt::urlsafe_encrypt(&key, url, rng),
        None => url.to_owned(),
    }
}

/// The URL as loaded from the catalog. Decrypt failure returns the stored
/// string unchanged to tolerate pre-encryption rows.
pub fn url_from_rest(stored: &str) -> String {
    match configured_key() {
        Some(key) => match crypt::urlsafe_decrypt(&key, stored) {
            Ok(url) => url,
            Err(_) => stored.to_owned(),
        },
        None => stored.to_owned(),
    }
}
