#![forbid(unsafe_code)]

//! Static policy (capabilities), per-connection inputs (options), and
//! negotiated outputs (parameters), plus the PSK and certificate stores.

use hesper_crypto::kex::NamedGroup;
use hesper_crypto::sign::{SignatureScheme, SigningKey};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use zeroize::Zeroizing;

use crate::messages::{CertificateEntry, PskMode};
use crate::suites::CipherSuite;

/// An external pre-shared key with the parameters pinned to it.
#[derive(Clone)]
pub struct Psk {
    /// Wire identity offered in `pre_shared_key`.
    pub identity: Vec<u8>,
    pub key: Zeroizing<Vec<u8>>,
    /// Suite the key was provisioned for; constrains the negotiated hash.
    pub suite: CipherSuite,
    /// ALPN protocol pinned at provisioning time, if any.
    pub alpn: Option<Vec<u8>>,
}

impl fmt::Debug for Psk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Psk")
            .field("identity", &self.identity)
            .field("suite", &self.suite)
            .field("alpn", &self.alpn)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Keyed PSK lookup: by server name on the client, by wire identity on the
/// server. Read-only once the handshake starts.
#[derive(Debug, Clone, Default)]
pub struct PskStore {
    entries: HashMap<Vec<u8>, Psk>,
}

impl PskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, lookup_key: impl Into<Vec<u8>>, psk: Psk) {
        self.entries.insert(lookup_key.into(), psk);
    }

    pub fn get(&self, lookup_key: &[u8]) -> Option<&Psk> {
        self.entries.get(lookup_key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A local credential: certificate chain plus the private key that signs
/// CertificateVerify.
pub struct CertificateKeyPair {
    pub chain: Vec<CertificateEntry>,
    pub key: SigningKey,
}

impl CertificateKeyPair {
    /// Generate a single-entry credential for `scheme`. The entry's opaque
    /// bytes are the encoded public key, which keeps in-memory test pairs
    /// consistent with how an embedder would parse a real chain.
    pub fn generate(scheme: SignatureScheme) -> hesper_crypto::Result<Self> {
        let key = SigningKey::generate(scheme)?;
        let verifying = key.verifying_key();
        Ok(Self {
            chain: vec![CertificateEntry {
                data: verifying.to_bytes(),
                public_key: Some(verifying),
            }],
            key,
        })
    }

    pub fn scheme(&self) -> SignatureScheme {
        self.key.scheme()
    }
}

impl Clone for CertificateKeyPair {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            key: match &self.key {
                SigningKey::Ed25519(key) => SigningKey::Ed25519(key.clone()),
                SigningKey::EcdsaP256(key) => SigningKey::EcdsaP256(key.clone()),
            },
        }
    }
}

impl fmt::Debug for CertificateKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateKeyPair")
            .field("chain_len", &self.chain.len())
            .field("scheme", &self.scheme())
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Injected certificate-chain verifier: `true` accepts the chain.
pub type CertificateVerifier = Arc<dyn Fn(&[CertificateEntry]) -> bool + Send + Sync>;

/// Static endpoint policy shared by every connection.
#[derive(Clone)]
pub struct Capabilities {
    /// Supported DH groups, preference order.
    pub groups: Vec<NamedGroup>,
    /// Supported cipher suites, preference order.
    pub cipher_suites: Vec<CipherSuite>,
    /// Accepted signature schemes, preference order.
    pub signature_schemes: Vec<SignatureScheme>,
    /// Accepted PSK key-exchange modes.
    pub psk_modes: Vec<PskMode>,
    pub psks: PskStore,
    pub certificates: Vec<CertificateKeyPair>,
    /// Server accepts 0-RTT when otherwise eligible.
    pub allow_early_data: bool,
    /// Server demands a cookie round trip before negotiating.
    pub require_cookie: bool,
    /// Server demands a client certificate.
    pub require_client_auth: bool,
    /// Optional chain verifier; absence is a logged warning, not an error.
    pub auth_certificate: Option<CertificateVerifier>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            groups: vec![NamedGroup::X25519, NamedGroup::Secp256r1],
            cipher_suites: vec![
                CipherSuite::Aes128GcmSha256,
                CipherSuite::Aes256GcmSha384,
                CipherSuite::ChaCha20Poly1305Sha256,
            ],
            signature_schemes: vec![
                SignatureScheme::Ed25519,
                SignatureScheme::EcdsaSecp256r1Sha256,
            ],
            psk_modes: vec![PskMode::PskDheKe, PskMode::PskKe],
            psks: PskStore::new(),
            certificates: Vec::new(),
            allow_early_data: false,
            require_cookie: false,
            require_client_auth: false,
            auth_certificate: None,
        }
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capabilities")
            .field("groups", &self.groups)
            .field("cipher_suites", &self.cipher_suites)
            .field("signature_schemes", &self.signature_schemes)
            .field("psk_modes", &self.psk_modes)
            .field("certificates", &self.certificates.len())
            .field("allow_early_data", &self.allow_early_data)
            .field("require_cookie", &self.require_cookie)
            .field("require_client_auth", &self.require_client_auth)
            .field("auth_certificate", &self.auth_certificate.is_some())
            .finish()
    }
}

/// Per-connection inputs supplied by the embedder.
#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    pub server_name: Option<String>,
    /// ALPN protocols: the client's offer, the server's accept list.
    pub next_protos: Vec<Vec<u8>>,
    /// Presence of a 0-RTT payload; the bytes themselves ride the record
    /// layer.
    pub early_data: Option<Vec<u8>>,
}

/// Negotiated outputs, written during the handshake.
#[derive(Debug, Clone, Default)]
pub struct ConnectionParameters {
    pub using_psk: bool,
    pub using_dh: bool,
    pub using_early_data: bool,
    pub using_client_auth: bool,
    pub cipher_suite: Option<CipherSuite>,
    pub next_proto: Option<Vec<u8>>,
    pub server_name: Option<String>,
}
