//! Hesper cryptographic primitives (unsafe-forbid, pure Rust).
//! - Hash: SHA-256 / SHA-384 dispatch with HMAC and constant-time verification
//! - KDF: HKDF extract/expand over either hash
//! - Kex: ephemeral X25519 and secp256r1 key shares with zeroizing scalars
//! - Sign: Ed25519 and ECDSA-P256 signature schemes behind one key type
#![forbid(unsafe_code)]

pub mod hash;
pub mod kdf;
pub mod kex;
pub mod sign;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("entropy source failed: {0}")]
    Entropy(String),
    #[error("key exchange failed: {0}")]
    KeyExchange(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("signature verification failed")]
    BadSignature,
    #[error("cryptographic operation failed: {0}")]
    Crypto(String),
}

pub type Result<T> = core::result::Result<T, Error>;
