//! Part encryption and the whole-file MAC.
//!
//! Parts are sealed with AES-256-GCM under the transfer key. The nonce is
//! the first 12 bytes of the part's fingerprint and the full fingerprint is
//! bound as associated data, so a fingerprint is never reused under the same
//! key as long as fingerprints are single-use. The tag is carried detached,
//! which keeps the ciphertext exactly as long as the payload.

use aes_gcm::Aes256Gcm;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use sluice_protocol::{Fingerprint, TransferKey};

/// Length of the per-part authentication tag.
pub const MAC_LEN: usize = 16;

const NONCE_LEN: usize = 12;

type HmacSha256 = Hmac<Sha256>;

/// Errors from part encryption and MAC checks.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("fingerprint does not belong to this cypher")]
    FingerprintMismatch,

    #[error("invalid MAC length: expected 16 bytes, got {0}")]
    InvalidMacLength(usize),

    #[error("MAC verification failed")]
    MacMismatch,

    #[error("cipher failure")]
    Cipher,
}

pub(crate) fn encrypt_part(
    key: &TransferKey,
    fingerprint: &Fingerprint,
    plaintext: &[u8],
) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    let cipher = Aes256Gcm::new(GenericArray::from_slice(key.as_bytes()));
    let nonce = GenericArray::from_slice(&fingerprint.as_bytes()[..NONCE_LEN]);

    let mut buf = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(nonce, fingerprint.as_bytes(), &mut buf)
        .map_err(|_| CryptoError::Cipher)?;
    Ok((buf, tag.to_vec()))
}

pub(crate) fn decrypt_part(
    key: &TransferKey,
    fingerprint: &Fingerprint,
    ciphertext: &[u8],
    mac: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if mac.len() != MAC_LEN {
        return Err(CryptoError::InvalidMacLength(mac.len()));
    }
    let cipher = Aes256Gcm::new(GenericArray::from_slice(key.as_bytes()));
    let nonce = GenericArray::from_slice(&fingerprint.as_bytes()[..NONCE_LEN]);

    let mut buf = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(
            nonce,
            fingerprint.as_bytes(),
            &mut buf,
            GenericArray::from_slice(mac),
        )
        .map_err(|_| CryptoError::MacMismatch)?;
    Ok(buf)
}

/// HMAC-SHA256 of the whole file under the transfer key.
pub fn transfer_mac(key: &TransferKey, file: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key.as_bytes())
        .map_err(|_| CryptoError::Cipher)?;
    mac.update(file);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Checks `expected` against the MAC of `file` in constant time.
pub fn verify_transfer_mac(
    key: &TransferKey,
    file: &[u8],
    expected: &[u8],
) -> Result<(), CryptoError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key.as_bytes())
        .map_err(|_| CryptoError::Cipher)?;
    mac.update(file);
    mac.verify_slice(expected)
        .map_err(|_| CryptoError::MacMismatch)
}
