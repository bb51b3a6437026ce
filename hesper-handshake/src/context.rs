#![forbid(unsafe_code)]

//! The per-handshake connection context.
//!
//! The context is the single bag of mutable state both automata thread
//! through their transitions: policy and options, negotiated parameters, the
//! key schedule, offered/accepted secrets, and the retained transcript
//! messages (the key schedule hashes at flight boundaries, not per message,
//! and CertificateVerify needs exact bytes).

use hesper_crypto::kex::NamedGroup;
use hesper_crypto::sign::SignatureScheme;
use std::collections::HashMap;
use zeroize::Zeroizing;

use crate::alert::Alert;
use crate::config::{Capabilities, ConnectionOptions, ConnectionParameters, Psk};
use crate::messages::{Certificate, CertificateRequest, Message};
use crate::negotiate::DhSelection;
use crate::schedule::{HandshakeSecrets, KeySchedule, MainSecrets};

/// Which side of the handshake this context drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// RFC 8446 §4.4.3 context string for a CertificateVerify produced by
    /// this role.
    fn verify_context(&self) -> &'static [u8] {
        match self {
            Role::Server => b"TLS 1.3, server CertificateVerify",
            Role::Client => b"TLS 1.3, client CertificateVerify",
        }
    }
}

/// Content a CertificateVerify signature covers: padding, the signer's
/// context string, a separator, and the transcript hash.
pub(crate) fn certificate_verify_payload(signer: Role, transcript_hash: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(64 + 34 + 1 + transcript_hash.len());
    payload.extend_from_slice(&[0x20; 64]);
    payload.extend_from_slice(signer.verify_context());
    payload.push(0x00);
    payload.extend_from_slice(transcript_hash);
    payload
}

/// Whether a transition awaits peer input or chains straight into the next
/// state within the same public step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Await,
    Continue,
}

/// Write-once transcript slot. The HelloRetryRequest restart path is the
/// only defined second hello, and it goes to its own slot.
pub(crate) fn set_once(slot: &mut Option<Message>, message: Message) -> Result<(), Alert> {
    if slot.is_some() {
        tracing::error!("transcript slot rewritten");
        return Err(Alert::InternalError);
    }
    *slot = Some(message);
    Ok(())
}

/// Long-lived per-handshake record. Created when a connection is initiated
/// (client) or the first ClientHello arrives (server); mutated only by the
/// active state's transition; secrets zeroize on drop.
#[derive(Clone)]
pub struct ConnectionContext {
    pub role: Role,
    pub caps: Capabilities,
    pub opts: ConnectionOptions,
    pub params: ConnectionParameters,
    pub schedule: KeySchedule,

    /// Private key-share scalars by group, populated at ClientHello and
    /// consumed at ServerHello (client only).
    pub offered_dh: HashMap<NamedGroup, Zeroizing<Vec<u8>>>,
    /// The PSK the client advertised, if any.
    pub offered_psk: Option<Psk>,
    /// The PSK the server accepted, if any.
    pub accepted_psk: Option<Psk>,
    /// Raw PSK once a PSK is in effect on this connection.
    pub psk_secret: Option<Zeroizing<Vec<u8>>>,

    // Transcript slots.
    pub client_hello: Option<Message>,
    pub hello_retry_request: Option<Message>,
    pub retry_client_hello: Option<Message>,
    pub server_hello: Option<Message>,
    pub server_first_flight: Vec<Message>,
    pub server_finished: Option<Message>,
    pub server_certificate: Option<Certificate>,
    pub server_certificate_request: Option<CertificateRequest>,
    pub client_second_flight: Vec<Message>,
    pub client_certificate: Option<Certificate>,

    // Server-side scratch.
    pub cookie: Option<Vec<u8>>,
    pub local_certificate: Option<usize>,
    pub local_cert_scheme: Option<SignatureScheme>,
    pub dh: Option<DhSelection>,
    pub selected_psk_index: Option<usize>,

    // Derived outputs for the record layer.
    pub handshake_secrets: Option<HandshakeSecrets>,
    pub early_traffic_secret: Option<Zeroizing<Vec<u8>>>,
    pub main_secrets: Option<MainSecrets>,
}

impl ConnectionContext {
    pub fn new(role: Role, caps: Capabilities, opts: ConnectionOptions) -> Self {
        Self {
            role,
            caps,
            opts,
            params: ConnectionParameters::default(),
            schedule: KeySchedule::new(),
            offered_dh: HashMap::new(),
            offered_psk: None,
            accepted_psk: None,
            psk_secret: None,
            client_hello: None,
            hello_retry_request: None,
            retry_client_hello: None,
            server_hello: None,
            server_first_flight: Vec::new(),
            server_finished: None,
            server_certificate: None,
            server_certificate_request: None,
            client_second_flight: Vec::new(),
            client_certificate: None,
            cookie: None,
            local_certificate: None,
            local_cert_scheme: None,
            dh: None,
            selected_psk_index: None,
            handshake_secrets: None,
            early_traffic_secret: None,
            main_secrets: None,
        }
    }

    /// The ClientHello the negotiation ran against: the retry hello when a
    /// HelloRetryRequest round trip happened, the original otherwise.
    pub fn effective_client_hello(&self) -> Option<&Message> {
        self.retry_client_hello.as_ref().or(self.client_hello.as_ref())
    }

    /// Concatenated transcript bytes of every retained message so far, in
    /// handshake order with the full first ClientHello. This is the
    /// CertificateVerify transcript; the key schedule keeps its own copy
    /// with the HelloRetryRequest `message_hash` substitution applied.
    pub fn handshake_transcript_bytes(&self) -> Vec<u8> {
        let mut transcript = Vec::new();
        let singles = [
            &self.client_hello,
            &self.hello_retry_request,
            &self.retry_client_hello,
            &self.server_hello,
        ];
        for slot in singles {
            if let Some(message) = slot {
                transcript.extend_from_slice(message.raw());
            }
        }
        for message in &self.server_first_flight {
            transcript.extend_from_slice(message.raw());
        }
        if let Some(message) = &self.server_finished {
            transcript.extend_from_slice(message.raw());
        }
        for message in &self.client_second_flight {
            transcript.extend_from_slice(message.raw());
        }
        transcript
    }

    /// Drop every secret eagerly. Called on terminal alerts; dropping the
    /// context does the same through `Zeroizing`.
    pub fn clear_secrets(&mut self) {
        self.offered_dh.clear();
        self.psk_secret = None;
        self.offered_psk = None;
        self.accepted_psk = None;
        self.dh = None;
        self.schedule = KeySchedule::new();
        self.handshake_secrets = None;
        self.early_traffic_secret = None;
        self.main_secrets = None;
    }
}
