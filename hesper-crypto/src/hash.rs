#![forbid(unsafe_code)]

//! Hash and HMAC dispatch over the two TLS 1.3 suite hashes.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha384};

use crate::{Error, Result};

/// Hash function selected by the negotiated cipher suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
}

impl HashAlgorithm {
    /// Digest output length in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
        }
    }

    /// One-shot digest.
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            HashAlgorithm::Sha384 => Sha384::digest(data).to_vec(),
        }
    }

    /// HMAC tag over `data` under `key`.
    pub fn hmac(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        match self {
            HashAlgorithm::Sha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(key)
                    .map_err(|e| Error::InvalidKey(e.to_string()))?;
                mac.update(data);
                Ok(mac.finalize().into_bytes().to_vec())
            }
            HashAlgorithm::Sha384 => {
                let mut mac = Hmac::<Sha384>::new_from_slice(key)
                    .map_err(|e| Error::InvalidKey(e.to_string()))?;
                mac.update(data);
                Ok(mac.finalize().into_bytes().to_vec())
            }
        }
    }

    /// Constant-time HMAC verification.
    pub fn hmac_verify(&self, key: &[u8], data: &[u8], tag: &[u8]) -> bool {
        let verified = match self {
            HashAlgorithm::Sha256 => Hmac::<Sha256>::new_from_slice(key).map(|mut mac| {
                mac.update(data);
                mac.verify_slice(tag).is_ok()
            }),
            HashAlgorithm::Sha384 => Hmac::<Sha384>::new_from_slice(key).map(|mut mac| {
                mac.update(data);
                mac.verify_slice(tag).is_ok()
            }),
        };
        verified.unwrap_or(false)
    }
}
