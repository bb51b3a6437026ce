#![forbid(unsafe_code)]

//! Ephemeral (EC)DHE key shares for the supported named groups.
//!
//! Scalars are handed back as zeroizing byte buffers so a connection can
//! hold several offered shares and drop them all when the handshake ends.

use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use zeroize::Zeroizing;

use crate::{Error, Result};

/// Supported DH groups with their RFC 8446 code points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamedGroup {
    X25519,
    Secp256r1,
}

impl NamedGroup {
    pub fn code(&self) -> u16 {
        match self {
            NamedGroup::X25519 => 0x001d,
            NamedGroup::Secp256r1 => 0x0017,
        }
    }
}

/// Freshly generated ephemeral share: private scalar plus encoded public value.
pub struct EphemeralKeyPair {
    pub group: NamedGroup,
    pub secret: Zeroizing<Vec<u8>>,
    pub public: Vec<u8>,
}

impl fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("group", &self.group)
            .field("secret", &"[REDACTED]")
            .field("public_len", &self.public.len())
            .finish()
    }
}

/// Generate an ephemeral key pair for `group`.
pub fn generate(group: NamedGroup) -> Result<EphemeralKeyPair> {
    tracing::debug!(group = ?group, "generating ephemeral key share");
    match group {
        NamedGroup::X25519 => {
            let mut scalar = Zeroizing::new([0u8; 32]);
            OsRng
                .try_fill_bytes(scalar.as_mut())
                .map_err(|e| Error::Entropy(e.to_string()))?;
            let secret = x25519_dalek::StaticSecret::from(*scalar);
            let public = x25519_dalek::PublicKey::from(&secret);
            Ok(EphemeralKeyPair {
                group,
                secret: Zeroizing::new(secret.to_bytes().to_vec()),
                public: public.as_bytes().to_vec(),
            })
        }
        NamedGroup::Secp256r1 => {
            // Rejection-sample the scalar; out-of-range draws are vanishingly rare.
            let mut bytes = Zeroizing::new([0u8; 32]);
            for _ in 0..4 {
                OsRng
                    .try_fill_bytes(bytes.as_mut())
                    .map_err(|e| Error::Entropy(e.to_string()))?;
                if let Ok(secret) = p256::SecretKey::from_bytes(p256::FieldBytes::from_slice(
                    bytes.as_ref(),
                )) {
                    let public = secret.public_key().to_encoded_point(false);
                    return Ok(EphemeralKeyPair {
                        group,
                        secret: Zeroizing::new(secret.to_bytes().to_vec()),
                        public: public.as_bytes().to_vec(),
                    });
                }
            }
            Err(Error::KeyExchange("secp256r1 scalar sampling failed".into()))
        }
    }
}

/// Compute the raw (EC)DH shared secret between our stored scalar and the
/// peer's encoded public value.
pub fn shared_secret(
    group: NamedGroup,
    secret: &[u8],
    peer_public: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    match group {
        NamedGroup::X25519 => {
            let scalar: [u8; 32] = secret
                .try_into()
                .map_err(|_| Error::InvalidKey("x25519 scalar must be 32 bytes".into()))?;
            let peer: [u8; 32] = peer_public
                .try_into()
                .map_err(|_| Error::InvalidKey("x25519 public value must be 32 bytes".into()))?;
            let shared = x25519_dalek::StaticSecret::from(scalar)
                .diffie_hellman(&x25519_dalek::PublicKey::from(peer));
            if !shared.was_contributory() {
                return Err(Error::KeyExchange("non-contributory x25519 peer key".into()));
            }
            Ok(Zeroizing::new(shared.as_bytes().to_vec()))
        }
        NamedGroup::Secp256r1 => {
            if secret.len() != 32 {
                return Err(Error::InvalidKey("secp256r1 scalar must be 32 bytes".into()));
            }
            let sk = p256::SecretKey::from_bytes(p256::FieldBytes::from_slice(secret))
                .map_err(|e| Error::InvalidKey(e.to_string()))?;
            let pk = p256::PublicKey::from_sec1_bytes(peer_public)
                .map_err(|e| Error::InvalidKey(e.to_string()))?;
            let shared = p256::ecdh::diffie_hellman(sk.to_nonzero_scalar(), pk.as_affine());
            Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
        }
    }
}
