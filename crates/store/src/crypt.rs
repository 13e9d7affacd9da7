//! Routines for URL-safe encrypting/decrypting of location URLs.
//!
//! Envelope: random 16-byte IV prepended to AES-128-CBC ciphertext, the
//! whole thing URL-safe base64. Padding is a NUL separator followed by
//! random non-NUL bytes, so the boundary between payload and padding is
//! unambiguous after decrypt.

use aes::cipher::{
    block_padding::NoPadding,
    BlockDecryptMut,
    BlockEncryptMut,
    KeyIvInit,
};
use anyhow::Context;
use rand::{
    Rng,
    RngCore,
};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

pub const KEY_SIZE_BYTES: usize = 16;
const BLOCK_SIZE_BYTES: usize = 16;

pub fn urlsafe_encrypt(
    key: &[u8; KEY_SIZE_BYTES],
    plaintext: &str,
    rng: &mut dyn RngCore,
) -> String {
    let mut padded = plaintext.as_bytes().to_vec();
    // At least the NUL delimiter, at most a full block.
    let pad_length = BLOCK_SIZE_BYTES - padded.len() % BLOCK_SIZE_BYTES;
    padded.push(0);
    for _ in 0..pad_length - 1 {
        padded.push(rng.random_range(1u8..=0xff));
    }

    let mut iv = [0u8; BLOCK_SIZE_BYTES];
    rng.fill_bytes(&mut iv);

    let msg_len = padded.len();
    let cipher = Aes128CbcEnc::new(key.into(), &iv.into());
    cipher
        .encrypt_padded_mut::<NoPadding>(&mut padded, msg_len)
        .expect("buffer is block aligned");

    let mut envelope = iv.to_vec();
    envelope.extend_from_slice(&padded);
    base64::encode_config(envelope, base64::URL_SAFE)
}

pub fn urlsafe_decrypt(key: &[u8; KEY_SIZE_BYTES], ciphertext: &str) -> anyhow::Result<String> {
    let envelope = base64::decode_config(ciphertext, base64::URL_SAFE)?;
    anyhow::ensure!(
        envelope.len() > BLOCK_SIZE_BYTES && envelope.len() % BLOCK_SIZE_BYTES == 0,
        "ciphertext is not block aligned"
    );
    let (iv, body) = envelope.split_at(BLOCK_SIZE_BYTES);
    let iv: [u8; BLOCK_SIZE_BYTES] = iv.try_into().expect("split is exact");

    let mut buffer = body.to_vec();
    let cipher = Aes128CbcDec::new(key.into(), &iv.into());
    let decrypted = cipher
        .decrypt_padded_mut::<NoPadding>(&mut buffer)
        .map_err(|e| anyhow::anyhow!("Unpad error: {e}"))?;

    let boundary = decrypted
        .iter()
        .rposition(|b| *b == 0)
        .context("missing padding delimiter")?;
    Ok(String::from_utf8(decrypted[..boundary].to_vec())?)
}

#[cfg(test)]
mod tests {
    use common::runtime::{
        testing::TestRuntime,
        Runtime,
    };

    use super::{
        urlsafe_decrypt,
        urlsafe_encrypt,
    };

    const KEY: &[u8; 16] = b"0123456789abcdef";

    #[tokio::test]
    async fn test_round_trip() -> anyhow::Result<()> {
        let rt = TestRuntime::new();
        let mut rng = rt.rng();
        for plaintext in [
            "",
            "file:///var/lib/images/71c675ab",
            "s3://bucket/a-key-that-spans-multiple-aes-blocks-easily",
            // 15 bytes, so the padding is exactly the NUL delimiter.
            "123456789012345",
            // 16 bytes, so a whole extra block of padding is added.
            "1234567890123456",
        ] {
            let ciphertext = urlsafe_encrypt(KEY, plaintext, rng.as_mut());
            assert_ne!(ciphertext, plaintext);
            assert_eq!(urlsafe_decrypt(KEY, &ciphertext)?, plaintext);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_ciphertext_is_urlsafe() -> anyhow::Result<()> {
        let rt = TestRuntime::new();
        let mut rng = rt.rng();
        let ciphertext = urlsafe_encrypt(KEY, "http://example.com/image?x=1&y=2", rng.as_mut());
        assert!(ciphertext
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '=')));
        Ok(())
    }

    #[test]
    fn test_garbage_does_not_decrypt() {
        assert!(urlsafe_decrypt(KEY, "file:///not/encrypted/at/all").is_err());
        assert!(urlsafe_decrypt(KEY, "").is_err());
    }
}
