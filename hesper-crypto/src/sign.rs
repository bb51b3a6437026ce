#![forbid(unsafe_code)]

//! Signature schemes used by CertificateVerify.
//!
//! One key pair of sum types covers both supported schemes so the handshake
//! can carry "a credential" without caring which algorithm backs it.

use ed25519_dalek::Signer as _;
use ed25519_dalek::Verifier as _;
use p256::ecdsa::signature::{Signer as _, Verifier as _};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use zeroize::Zeroizing;

use crate::{Error, Result};

/// Supported signature schemes with their RFC 8446 code points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    EcdsaSecp256r1Sha256,
    Ed25519,
}

impl SignatureScheme {
    pub fn code(&self) -> u16 {
        match self {
            SignatureScheme::EcdsaSecp256r1Sha256 => 0x0403,
            SignatureScheme::Ed25519 => 0x0807,
        }
    }
}

/// Private signing half of a credential.
pub enum SigningKey {
    Ed25519(ed25519_dalek::SigningKey),
    EcdsaP256(p256::ecdsa::SigningKey),
}

impl SigningKey {
    /// Generate a fresh key for `scheme`.
    pub fn generate(scheme: SignatureScheme) -> Result<Self> {
        let mut seed = Zeroizing::new([0u8; 32]);
        OsRng
            .try_fill_bytes(seed.as_mut())
            .map_err(|e| Error::Entropy(e.to_string()))?;
        match scheme {
            SignatureScheme::Ed25519 => {
                Ok(SigningKey::Ed25519(ed25519_dalek::SigningKey::from_bytes(&seed)))
            }
            SignatureScheme::EcdsaSecp256r1Sha256 => {
                for _ in 0..4 {
                    if let Ok(key) = p256::ecdsa::SigningKey::from_bytes(
                        p256::FieldBytes::from_slice(seed.as_ref()),
                    ) {
                        return Ok(SigningKey::EcdsaP256(key));
                    }
                    OsRng
                        .try_fill_bytes(seed.as_mut())
                        .map_err(|e| Error::Entropy(e.to_string()))?;
                }
                Err(Error::KeyExchange("ecdsa scalar sampling failed".into()))
            }
        }
    }

    pub fn scheme(&self) -> SignatureScheme {
        match self {
            SigningKey::Ed25519(_) => SignatureScheme::Ed25519,
            SigningKey::EcdsaP256(_) => SignatureScheme::EcdsaSecp256r1Sha256,
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        match self {
            SigningKey::Ed25519(key) => VerifyingKey::Ed25519(key.verifying_key()),
            SigningKey::EcdsaP256(key) => VerifyingKey::EcdsaP256(*key.verifying_key()),
        }
    }

    /// Sign `message`, returning the scheme's fixed-size signature encoding.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        match self {
            SigningKey::Ed25519(key) => key.sign(message).to_bytes().to_vec(),
            SigningKey::EcdsaP256(key) => {
                let signature: p256::ecdsa::Signature = key.sign(message);
                signature.to_bytes().to_vec()
            }
        }
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("scheme", &self.scheme())
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Public verification half of a credential.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VerifyingKey {
    Ed25519(ed25519_dalek::VerifyingKey),
    EcdsaP256(p256::ecdsa::VerifyingKey),
}

impl VerifyingKey {
    pub fn scheme(&self) -> SignatureScheme {
        match self {
            VerifyingKey::Ed25519(_) => SignatureScheme::Ed25519,
            VerifyingKey::EcdsaP256(_) => SignatureScheme::EcdsaSecp256r1Sha256,
        }
    }

    /// Encoded public key bytes (32-byte Ed25519 point or uncompressed SEC1).
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            VerifyingKey::Ed25519(key) => key.to_bytes().to_vec(),
            VerifyingKey::EcdsaP256(key) => key.to_encoded_point(false).as_bytes().to_vec(),
        }
    }

    /// Decode a public key previously produced by [`VerifyingKey::to_bytes`].
    pub fn from_bytes(scheme: SignatureScheme, bytes: &[u8]) -> Result<Self> {
        match scheme {
            SignatureScheme::Ed25519 => {
                let raw: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| Error::InvalidKey("ed25519 key must be 32 bytes".into()))?;
                Ok(VerifyingKey::Ed25519(
                    ed25519_dalek::VerifyingKey::from_bytes(&raw)
                        .map_err(|e| Error::InvalidKey(e.to_string()))?,
                ))
            }
            SignatureScheme::EcdsaSecp256r1Sha256 => Ok(VerifyingKey::EcdsaP256(
                p256::ecdsa::VerifyingKey::from_sec1_bytes(bytes)
                    .map_err(|e| Error::InvalidKey(e.to_string()))?,
            )),
        }
    }

    /// Verify `signature` over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        match self {
            VerifyingKey::Ed25519(key) => {
                let raw: [u8; 64] = signature
                    .try_into()
                    .map_err(|_| Error::BadSignature)?;
                key.verify(message, &ed25519_dalek::Signature::from_bytes(&raw))
                    .map_err(|_| Error::BadSignature)
            }
            VerifyingKey::EcdsaP256(key) => {
                let signature = p256::ecdsa::Signature::from_slice(signature)
                    .map_err(|_| Error::BadSignature)?;
                key.verify(message, &signature).map_err(|_| Error::BadSignature)
            }
        }
    }
}
