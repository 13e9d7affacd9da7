//! Ergonomic wrappers on top of the `md-5` crate, which is a bit too generic
//! to be nice to use. Image checksums are hex MD5 over the stored body; the
//! transport surfaces them as the `ETag` header.

use std::{
    fmt,
    io::{
        self,
        Write,
    },
    ops::Deref,
};

use anyhow::Context;
use md5::Digest;

#[must_use]
#[derive(Clone, Eq, PartialEq)]
pub struct Md5Digest([u8; 16]);

impl Md5Digest {
    pub fn as_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(v: &str) -> anyhow::Result<Self> {
        let bytes = hex::decode(v.trim())?;
        let arr: [u8; 16] = bytes.try_into().ok().context("md5 not 16 bytes")?;
        Ok(Md5Digest(arr))
    }

    /// Checksum comparison against a caller-supplied value is
    /// case-insensitive hex.
    pub fn matches_hex(&self, other: &str) -> bool {
        match Self::from_hex(&other.to_ascii_lowercase()) {
            Ok(digest) => digest == *self,
            Err(_) => false,
        }
    }
}

impl fmt::Debug for Md5Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Md5Digest({})", hex::encode(self.0))
    }
}

impl Deref for Md5Digest {
    type Target = [u8; 16];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<[u8]> for Md5Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 16]> for Md5Digest {
    fn from(d: [u8; 16]) -> Self {
        Self(d)
    }
}

#[derive(Clone, Debug)]
pub struct Md5 {
    inner: md5::Md5,
}

impl Write for Md5 {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Md5 {
    pub fn new() -> Self {
        Self {
            inner: md5::Md5::new(),
        }
    }

    pub fn update(&mut self, data: impl AsRef<[u8]>) {
        self.inner.update(data)
    }

    pub fn finalize(self) -> Md5Digest {
        Md5Digest(self.inner.finalize().into())
    }

    pub fn hash(buf: &[u8]) -> Md5Digest {
        let mut hasher = Self::new();
        hasher.update(buf);
        hasher.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Md5,
        Md5Digest,
    };

    #[test]
    fn test_known_digest() {
        // RFC 1321 test vector.
        assert_eq!(
            Md5::hash(b"abc").as_hex(),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }

    #[test]
    fn test_hex_round_trip() -> anyhow::Result<()> {
        let digest = Md5::hash(b"chunk00000remainder");
        let parsed = Md5Digest::from_hex(&digest.as_hex())?;
        assert_eq!(digest, parsed);
        assert!(digest.matches_hex(&digest.as_hex().to_ascii_uppercase()));
        assert!(!digest.matches_hex("0badc0de0badc0de0badc0de0badc0de"));
        Ok(())
    }
}
