#![forbid(unsafe_code)]

//! The TLS 1.3 key schedule (RFC 8446 §7.1).
//!
//! One `KeySchedule` per connection walks the HKDF ladder
//! `early secret → handshake secret → master secret`, feeding the transcript
//! in at flight boundaries. Phases advance monotonically
//! `Uninit → EarlyPsk → Handshake → MainApp`; requesting an earlier phase's
//! derivation after advancement is an internal error, which is what makes a
//! double initialization structurally impossible.

use hesper_crypto::hash::HashAlgorithm;
use hesper_crypto::kdf::{hkdf_expand, hkdf_extract};
use std::fmt;
use zeroize::Zeroizing;

use crate::alert::Alert;
use crate::config::Psk;
use crate::messages::Message;
use crate::suites::CipherSuite;

/// Constant-time byte equality for Finished MACs and binders.
pub(crate) fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Ladder position. Earlier-phase derivations are rejected once the
/// schedule has advanced past them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SchedulePhase {
    Uninit,
    EarlyPsk,
    Handshake,
    MainApp,
}

/// Handshake-traffic secrets, one per direction.
#[derive(Clone)]
pub struct HandshakeSecrets {
    pub client: Zeroizing<Vec<u8>>,
    pub server: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for HandshakeSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeSecrets")
            .field("client", &"[REDACTED]")
            .field("server", &"[REDACTED]")
            .finish()
    }
}

/// Secrets surrendered once both Finished messages have been absorbed.
#[derive(Clone)]
pub struct MainSecrets {
    pub client_application_traffic: Zeroizing<Vec<u8>>,
    pub server_application_traffic: Zeroizing<Vec<u8>>,
    pub exporter_master: Zeroizing<Vec<u8>>,
    pub resumption_master: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for MainSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MainSecrets").field("secrets", &"[REDACTED]").finish()
    }
}

/// `HKDF-Expand-Label` with the RFC 8446 `HkdfLabel` framing.
fn expand_label(
    hash: HashAlgorithm,
    secret: &[u8],
    label: &[u8],
    context: &[u8],
    out_len: usize,
) -> Result<Zeroizing<Vec<u8>>, Alert> {
    let mut info = Vec::with_capacity(2 + 1 + 6 + label.len() + 1 + context.len());
    info.extend_from_slice(&(out_len as u16).to_be_bytes());
    info.push((6 + label.len()) as u8);
    info.extend_from_slice(b"tls13 ");
    info.extend_from_slice(label);
    info.push(context.len() as u8);
    info.extend_from_slice(context);

    hkdf_expand(hash, secret, &info, out_len)
        .map(Zeroizing::new)
        .map_err(|e| {
            tracing::error!(error = %e, "HKDF expansion failed");
            Alert::InternalError
        })
}

/// `Derive-Secret`: expand-label with the transcript hash of `messages`.
fn derive_secret(
    hash: HashAlgorithm,
    secret: &[u8],
    label: &[u8],
    messages: &[u8],
) -> Result<Zeroizing<Vec<u8>>, Alert> {
    let transcript_hash = hash.digest(messages);
    expand_label(hash, secret, label, &transcript_hash, hash.output_len())
}

/// Per-connection HKDF ladder plus retained transcript bytes.
#[derive(Clone)]
pub struct KeySchedule {
    phase: SchedulePhase,
    hash: Option<HashAlgorithm>,
    initialized: bool,
    transcript: Vec<u8>,
    early_secret: Option<Zeroizing<Vec<u8>>>,
    binder_key: Option<Zeroizing<Vec<u8>>>,
    /// Current ladder salt: early, then handshake, then master secret.
    current: Option<Zeroizing<Vec<u8>>>,
    master_derived: bool,
    handshake_secrets: Option<HandshakeSecrets>,
    client_application: Option<Zeroizing<Vec<u8>>>,
    server_application: Option<Zeroizing<Vec<u8>>>,
    exporter_master: Option<Zeroizing<Vec<u8>>>,
}

impl Default for KeySchedule {
    fn default() -> Self {
        Self::new()
    }
}

impl KeySchedule {
    pub fn new() -> Self {
        Self {
            phase: SchedulePhase::Uninit,
            hash: None,
            initialized: false,
            transcript: Vec::new(),
            early_secret: None,
            binder_key: None,
            current: None,
            master_derived: false,
            handshake_secrets: None,
            client_application: None,
            server_application: None,
            exporter_master: None,
        }
    }

    pub fn phase(&self) -> SchedulePhase {
        self.phase
    }

    pub fn hash(&self) -> Option<HashAlgorithm> {
        self.hash
    }

    /// Hash of the transcript absorbed so far.
    pub fn transcript_hash(&self) -> Option<Vec<u8>> {
        self.hash.map(|h| h.digest(&self.transcript))
    }

    fn require_hash(&self) -> Result<HashAlgorithm, Alert> {
        self.hash.ok_or(Alert::InternalError)
    }

    fn zeros(hash: HashAlgorithm) -> Vec<u8> {
        vec![0u8; hash.output_len()]
    }

    /// Derive the early secret and binder key from an external PSK.
    /// Permitted only before [`KeySchedule::init`].
    pub fn pre_init(&mut self, psk: &Psk) -> Result<(), Alert> {
        if self.phase != SchedulePhase::Uninit {
            return Err(Alert::InternalError);
        }
        let hash = psk.suite.hash();
        let early = Zeroizing::new(hkdf_extract(hash, &Self::zeros(hash), &psk.key));
        let binder_key = derive_secret(hash, &early, b"ext binder", b"")?;
        self.hash = Some(hash);
        self.early_secret = Some(early);
        self.binder_key = Some(binder_key);
        self.phase = SchedulePhase::EarlyPsk;
        tracing::debug!("key schedule pre-initialized from PSK");
        Ok(())
    }

    /// Binder MAC over `prefix ∥ truncated_ch` under the binder Finished
    /// key. `prefix` is empty for an initial ClientHello and
    /// `CH1 ∥ HRR` after a retry.
    pub fn psk_binder(&self, prefix: &[u8], truncated_ch: &[u8]) -> Result<Vec<u8>, Alert> {
        if self.phase != SchedulePhase::EarlyPsk {
            return Err(Alert::InternalError);
        }
        let hash = self.require_hash()?;
        let binder_key = self.binder_key.as_ref().ok_or(Alert::InternalError)?;
        let finished_key = expand_label(hash, binder_key, b"finished", b"", hash.output_len())?;

        let mut messages = Vec::with_capacity(prefix.len() + truncated_ch.len());
        messages.extend_from_slice(prefix);
        messages.extend_from_slice(truncated_ch);
        let transcript_hash = hash.digest(&messages);

        hash.hmac(&finished_key, &transcript_hash).map_err(|e| {
            tracing::error!(error = %e, "binder MAC failed");
            Alert::InternalError
        })
    }

    /// Client early-traffic secret over the ClientHello that offered 0-RTT.
    pub fn early_traffic_secret(&mut self, ch_raw: &[u8]) -> Result<Zeroizing<Vec<u8>>, Alert> {
        if self.phase != SchedulePhase::EarlyPsk || self.binder_key.is_none() {
            return Err(Alert::InternalError);
        }
        let hash = self.require_hash()?;
        let early = self.early_secret.as_ref().ok_or(Alert::InternalError)?;
        derive_secret(hash, early, b"c e traffic", ch_raw)
    }

    /// Fix the hash from the negotiated suite and seed the transcript. When
    /// a HelloRetryRequest occurred, the first ClientHello enters the
    /// transcript as the RFC 8446 §4.4.1 `message_hash` message. Runs
    /// exactly once per connection.
    pub fn init(
        &mut self,
        suite: CipherSuite,
        client_hello: &Message,
        hello_retry: Option<&Message>,
        retry_client_hello: Option<&Message>,
    ) -> Result<(), Alert> {
        if self.initialized {
            return Err(Alert::InternalError);
        }
        match self.phase {
            SchedulePhase::Uninit => {
                let hash = suite.hash();
                // No PSK was offered or accepted: early secret from zeros.
                let zeros = Self::zeros(hash);
                self.early_secret = Some(Zeroizing::new(hkdf_extract(hash, &zeros, &zeros)));
                self.hash = Some(hash);
            }
            SchedulePhase::EarlyPsk => {
                // Pre-initialized from a PSK; the negotiated suite must stay
                // on the PSK's hash.
                if self.hash != Some(suite.hash()) {
                    return Err(Alert::InternalError);
                }
            }
            _ => return Err(Alert::InternalError),
        }
        let hash = self.require_hash()?;

        self.transcript.clear();
        if let Some(hrr) = hello_retry {
            let retry = retry_client_hello.ok_or(Alert::InternalError)?;
            self.transcript.push(254);
            self.transcript.extend_from_slice(&[0, 0, hash.output_len() as u8]);
            self.transcript.extend_from_slice(&hash.digest(client_hello.raw()));
            self.transcript.extend_from_slice(hrr.raw());
            self.transcript.extend_from_slice(retry.raw());
        } else {
            self.transcript.extend_from_slice(client_hello.raw());
        }

        self.current = self.early_secret.clone();
        self.initialized = true;
        self.phase = SchedulePhase::EarlyPsk;
        Ok(())
    }

    /// Absorb the ServerHello and derive the handshake-traffic secrets.
    /// `dh_secret` is `None` on the PSK-only path.
    pub fn update_with_server_hello(
        &mut self,
        server_hello: &Message,
        dh_secret: Option<&[u8]>,
    ) -> Result<HandshakeSecrets, Alert> {
        if self.phase != SchedulePhase::EarlyPsk || !self.initialized {
            return Err(Alert::InternalError);
        }
        let hash = self.require_hash()?;
        self.transcript.extend_from_slice(server_hello.raw());

        let early = self.current.as_ref().ok_or(Alert::InternalError)?;
        let derived = derive_secret(hash, early, b"derived", b"")?;
        let zeros = Self::zeros(hash);
        let ikm = dh_secret.unwrap_or(&zeros);
        let handshake_secret = Zeroizing::new(hkdf_extract(hash, &derived, ikm));

        let secrets = HandshakeSecrets {
            client: derive_secret(hash, &handshake_secret, b"c hs traffic", &self.transcript)?,
            server: derive_secret(hash, &handshake_secret, b"s hs traffic", &self.transcript)?,
        };
        self.handshake_secrets = Some(secrets.clone());
        self.current = Some(handshake_secret);
        self.phase = SchedulePhase::Handshake;
        tracing::debug!(psk_only = dh_secret.is_none(), "handshake secrets derived");
        Ok(secrets)
    }

    /// Absorb EncryptedExtensions through CertificateVerify, derive the
    /// master secret, and return the server Finished MAC over the resulting
    /// transcript hash.
    pub fn update_with_server_first_flight(
        &mut self,
        messages: &[Message],
    ) -> Result<Vec<u8>, Alert> {
        if self.phase != SchedulePhase::Handshake || self.master_derived {
            return Err(Alert::InternalError);
        }
        let hash = self.require_hash()?;
        for message in messages {
            self.transcript.extend_from_slice(message.raw());
        }

        let handshake_secret = self.current.as_ref().ok_or(Alert::InternalError)?;
        let derived = derive_secret(hash, handshake_secret, b"derived", b"")?;
        let master = Zeroizing::new(hkdf_extract(hash, &derived, &Self::zeros(hash)));
        self.current = Some(master);
        self.master_derived = true;

        let secrets = self.handshake_secrets.as_ref().ok_or(Alert::InternalError)?;
        self.finished_mac(hash, &secrets.server)
    }

    /// Absorb the server Finished and derive the application-traffic and
    /// exporter secrets.
    pub fn update_with_server_finished(&mut self, finished: &Message) -> Result<(), Alert> {
        if self.phase != SchedulePhase::Handshake
            || !self.master_derived
            || self.client_application.is_some()
        {
            return Err(Alert::InternalError);
        }
        let hash = self.require_hash()?;
        self.transcript.extend_from_slice(finished.raw());

        let master = self.current.as_ref().ok_or(Alert::InternalError)?;
        self.client_application =
            Some(derive_secret(hash, master, b"c ap traffic", &self.transcript)?);
        self.server_application =
            Some(derive_secret(hash, master, b"s ap traffic", &self.transcript)?);
        self.exporter_master = Some(derive_secret(hash, master, b"exp master", &self.transcript)?);
        Ok(())
    }

    /// Absorb EndOfEarlyData / client Certificate / client CertificateVerify
    /// and return the client Finished MAC.
    pub fn update_with_client_second_flight(
        &mut self,
        messages: &[Message],
    ) -> Result<Vec<u8>, Alert> {
        if self.phase != SchedulePhase::Handshake || self.client_application.is_none() {
            return Err(Alert::InternalError);
        }
        let hash = self.require_hash()?;
        for message in messages {
            self.transcript.extend_from_slice(message.raw());
        }
        let secrets = self.handshake_secrets.as_ref().ok_or(Alert::InternalError)?;
        self.finished_mac(hash, &secrets.client)
    }

    /// Absorb the client Finished, derive the resumption master secret, and
    /// surrender the main secrets. The schedule is spent afterwards.
    pub fn update_with_client_finished(&mut self, finished: &Message) -> Result<MainSecrets, Alert> {
        if self.phase != SchedulePhase::Handshake || self.client_application.is_none() {
            return Err(Alert::InternalError);
        }
        let hash = self.require_hash()?;
        self.transcript.extend_from_slice(finished.raw());

        let master = self.current.as_ref().ok_or(Alert::InternalError)?;
        let resumption = derive_secret(hash, master, b"res master", &self.transcript)?;
        self.phase = SchedulePhase::MainApp;
        tracing::info!("key schedule complete");

        Ok(MainSecrets {
            client_application_traffic: self
                .client_application
                .clone()
                .ok_or(Alert::InternalError)?,
            server_application_traffic: self
                .server_application
                .clone()
                .ok_or(Alert::InternalError)?,
            exporter_master: self.exporter_master.clone().ok_or(Alert::InternalError)?,
            resumption_master: resumption,
        })
    }

    fn finished_mac(&self, hash: HashAlgorithm, base_key: &[u8]) -> Result<Vec<u8>, Alert> {
        let finished_key = expand_label(hash, base_key, b"finished", b"", hash.output_len())?;
        let transcript_hash = hash.digest(&self.transcript);
        hash.hmac(&finished_key, &transcript_hash).map_err(|e| {
            tracing::error!(error = %e, "finished MAC failed");
            Alert::InternalError
        })
    }
}
