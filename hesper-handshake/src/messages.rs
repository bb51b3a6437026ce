#![forbid(unsafe_code)]

//! Parsed handshake-message bodies.
//!
//! The automata consume and produce these values; real wire codecs live
//! outside the crate. Each [`Message`] carries the canonical encoding of its
//! body (see [`crate::codec`]) because the key schedule, PSK binders, and
//! CertificateVerify are all contracts over exact bytes. The encoding is
//! captured once at construction and never recomputed for a received
//! message.

use hesper_crypto::kex::NamedGroup;
use hesper_crypto::sign::{SignatureScheme, VerifyingKey};
use std::fmt;

use crate::codec;
use crate::suites::CipherSuite;

/// The TLS 1.3 protocol version code point.
pub const TLS13: u16 = 0x0304;

/// 32-byte hello random.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Random(pub [u8; 32]);

/// One key-share entry: a group plus its encoded public value.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyShareEntry {
    pub group: NamedGroup,
    pub key_exchange: Vec<u8>,
}

/// PSK key-exchange modes a client accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PskMode {
    PskKe,
    PskDheKe,
}

impl PskMode {
    pub fn code(&self) -> u8 {
        match self {
            PskMode::PskKe => 0,
            PskMode::PskDheKe => 1,
        }
    }
}

/// One offered PSK identity.
#[derive(Debug, Clone, PartialEq)]
pub struct PskIdentity {
    pub identity: Vec<u8>,
    pub obfuscated_ticket_age: u32,
}

/// The `pre_shared_key` offer: identities plus one binder per identity.
#[derive(Debug, Clone, PartialEq)]
pub struct PskOffer {
    pub identities: Vec<PskIdentity>,
    pub binders: Vec<Vec<u8>>,
}

/// Parsed ClientHello. Extension presence is modeled with `Option`; the
/// server's MissingExtension checks key off it.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientHello {
    pub random: Random,
    pub cipher_suites: Vec<CipherSuite>,
    pub supported_versions: Vec<u16>,
    pub server_name: Option<String>,
    pub supported_groups: Option<Vec<NamedGroup>>,
    pub signature_schemes: Option<Vec<SignatureScheme>>,
    pub key_shares: Option<Vec<KeyShareEntry>>,
    pub psk_modes: Option<Vec<PskMode>>,
    pub alpn: Option<Vec<Vec<u8>>>,
    pub cookie: Option<Vec<u8>>,
    pub early_data: bool,
    pub pre_shared_key: Option<PskOffer>,
}

/// Parsed ServerHello.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerHello {
    pub random: Random,
    pub cipher_suite: CipherSuite,
    pub supported_version: u16,
    pub key_share: Option<KeyShareEntry>,
    /// `selected_identity` of the accepted PSK offer.
    pub pre_shared_key: Option<u16>,
}

/// Parsed HelloRetryRequest. On the wire this is a ServerHello with the
/// magic random; the canonical encoding preserves that so the transcript
/// treats it the way TLS does.
#[derive(Debug, Clone, PartialEq)]
pub struct HelloRetryRequest {
    pub cipher_suite: CipherSuite,
    pub supported_version: u16,
    pub selected_group: Option<NamedGroup>,
    pub cookie: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct EncryptedExtensions {
    /// Selected ALPN protocol, if any.
    pub alpn: Option<Vec<u8>>,
    /// Whether the server accepted the client's 0-RTT offer.
    pub early_data: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CertificateRequest {
    pub context: Vec<u8>,
    pub signature_schemes: Vec<SignatureScheme>,
}

/// One element of a certificate chain, already parsed by the embedder:
/// opaque certificate bytes plus the public key extracted from them. Only
/// `data` participates in the canonical encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct CertificateEntry {
    pub data: Vec<u8>,
    pub public_key: Option<VerifyingKey>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Certificate {
    pub context: Vec<u8>,
    pub chain: Vec<CertificateEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CertificateVerify {
    pub scheme: SignatureScheme,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Finished {
    pub verify_data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyUpdate {
    pub request_update: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSessionTicket {
    pub lifetime: u32,
    pub age_add: u32,
    pub nonce: Vec<u8>,
    pub ticket: Vec<u8>,
    pub max_early_data: u32,
}

/// A parsed handshake-message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    ClientHello(ClientHello),
    ServerHello(ServerHello),
    HelloRetryRequest(HelloRetryRequest),
    EncryptedExtensions(EncryptedExtensions),
    CertificateRequest(CertificateRequest),
    Certificate(Certificate),
    CertificateVerify(CertificateVerify),
    Finished(Finished),
    EndOfEarlyData,
    KeyUpdate(KeyUpdate),
    NewSessionTicket(NewSessionTicket),
}

impl Body {
    /// RFC 8446 handshake message type. HelloRetryRequest shares the
    /// ServerHello code point.
    pub fn type_code(&self) -> u8 {
        match self {
            Body::ClientHello(_) => 1,
            Body::ServerHello(_) | Body::HelloRetryRequest(_) => 2,
            Body::NewSessionTicket(_) => 4,
            Body::EndOfEarlyData => 5,
            Body::EncryptedExtensions(_) => 8,
            Body::Certificate(_) => 11,
            Body::CertificateRequest(_) => 13,
            Body::CertificateVerify(_) => 15,
            Body::Finished(_) => 20,
            Body::KeyUpdate(_) => 24,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Body::ClientHello(_) => "ClientHello",
            Body::ServerHello(_) => "ServerHello",
            Body::HelloRetryRequest(_) => "HelloRetryRequest",
            Body::NewSessionTicket(_) => "NewSessionTicket",
            Body::EndOfEarlyData => "EndOfEarlyData",
            Body::EncryptedExtensions(_) => "EncryptedExtensions",
            Body::Certificate(_) => "Certificate",
            Body::CertificateRequest(_) => "CertificateRequest",
            Body::CertificateVerify(_) => "CertificateVerify",
            Body::Finished(_) => "Finished",
            Body::KeyUpdate(_) => "KeyUpdate",
        }
    }
}

/// A handshake message: parsed body plus its canonical encoded bytes.
#[derive(Clone, PartialEq)]
pub struct Message {
    body: Body,
    raw: Vec<u8>,
}

impl Message {
    /// Wrap a body, capturing its canonical encoding.
    pub fn new(body: Body) -> Self {
        let raw = codec::encode(&body);
        Self { body, raw }
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn into_body(self) -> Body {
        self.body
    }

    /// The exact bytes the transcript hashes for this message.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("type", &self.body.name())
            .field("len", &self.raw.len())
            .finish()
    }
}
