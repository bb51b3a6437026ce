#![forbid(unsafe_code)]

//! Client-side handshake state machine.
//!
//! ```text
//! Start ──ClientHello──▶ WaitServerHello ──HRR──▶ WaitServerHello (retry)
//!                              │ServerHello
//!                              ▼
//!                        WaitEncryptedExtensions
//!                         │PSK path        │certificate path
//!                         ▼                ▼
//!                    WaitFinished ◀── WaitCertOrCertRequest → … → WaitFinished
//!                         │Finished (+ second flight out)
//!                         ▼
//!                      Connected
//! ```
//!
//! Each transition consumes the current state and an optional inbound body;
//! an unexpected body is a terminal `UnexpectedMessage`.

use hesper_crypto::kex;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info, warn};

use crate::alert::Alert;
use crate::codec;
use crate::config::{Capabilities, ConnectionOptions, ConnectionParameters};
use crate::context::{certificate_verify_payload, set_once, ConnectionContext, Flow, Role};
use crate::messages::{
    Body, Certificate, CertificateVerify, ClientHello, Finished, KeyShareEntry, Message,
    PskIdentity, PskOffer, Random, TLS13,
};
use crate::negotiate;
use crate::schedule::{ct_eq, HandshakeSecrets, MainSecrets};

/// Client automaton states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Start,
    WaitServerHello,
    WaitEncryptedExtensions,
    WaitCertOrCertRequest,
    WaitCertificate,
    WaitCertificateVerify,
    WaitFinished,
    Connected,
    Failed,
}

/// Drives one TLS 1.3 client handshake over parsed messages.
#[derive(Clone)]
pub struct ClientHandshake {
    state: ClientState,
    ctx: ConnectionContext,
}

impl ClientHandshake {
    pub fn new(caps: Capabilities, opts: ConnectionOptions) -> Self {
        Self {
            state: ClientState::Start,
            ctx: ConnectionContext::new(Role::Client, caps, opts),
        }
    }

    /// Advance the machine. `None` is valid only in `Start` (it emits the
    /// ClientHello); afterwards each call consumes one inbound body. On an
    /// alert the machine is terminal and secrets are erased.
    pub fn advance(&mut self, input: Option<Message>) -> Result<Vec<Message>, Alert> {
        if matches!(self.state, ClientState::Failed) {
            return Err(Alert::UnexpectedMessage);
        }
        let mut outbound = Vec::new();
        let mut input = input;
        loop {
            match step(&mut self.ctx, self.state, input.take()) {
                Ok((next, mut messages, flow)) => {
                    outbound.append(&mut messages);
                    self.state = next;
                    if flow == Flow::Await {
                        return Ok(outbound);
                    }
                }
                Err(alert) => {
                    warn!(?alert, state = ?self.state, "client handshake failed");
                    self.state = ClientState::Failed;
                    self.ctx.clear_secrets();
                    return Err(alert);
                }
            }
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, ClientState::Connected)
    }

    pub fn params(&self) -> &ConnectionParameters {
        &self.ctx.params
    }

    pub fn handshake_secrets(&self) -> Option<&HandshakeSecrets> {
        self.ctx.handshake_secrets.as_ref()
    }

    pub fn main_secrets(&self) -> Option<&MainSecrets> {
        self.ctx.main_secrets.as_ref()
    }

    pub fn early_traffic_secret(&self) -> Option<&[u8]> {
        self.ctx.early_traffic_secret.as_deref().map(Vec::as_slice)
    }

    /// Transcript hash at the schedule's current point; both peers agree on
    /// it once Finished messages have flowed.
    pub fn transcript_hash(&self) -> Option<Vec<u8>> {
        self.ctx.schedule.transcript_hash()
    }
}

type Transition = Result<(ClientState, Vec<Message>, Flow), Alert>;

fn step(ctx: &mut ConnectionContext, state: ClientState, input: Option<Message>) -> Transition {
    match (state, input) {
        (ClientState::Start, None) => start(ctx),
        (ClientState::WaitServerHello, Some(message)) => match message.body() {
            Body::HelloRetryRequest(_) => on_hello_retry(ctx, message),
            Body::ServerHello(_) => on_server_hello(ctx, message),
            _ => Err(Alert::UnexpectedMessage),
        },
        (ClientState::WaitEncryptedExtensions, Some(message)) => match message.body() {
            Body::EncryptedExtensions(_) => on_encrypted_extensions(ctx, message),
            _ => Err(Alert::UnexpectedMessage),
        },
        (ClientState::WaitCertOrCertRequest, Some(message)) => match message.body() {
            Body::Certificate(_) => on_certificate(ctx, message),
            Body::CertificateRequest(_) => on_certificate_request(ctx, message),
            _ => Err(Alert::UnexpectedMessage),
        },
        (ClientState::WaitCertificate, Some(message)) => match message.body() {
            Body::Certificate(_) => on_certificate(ctx, message),
            _ => Err(Alert::UnexpectedMessage),
        },
        (ClientState::WaitCertificateVerify, Some(message)) => match message.body() {
            Body::CertificateVerify(_) => on_certificate_verify(ctx, message),
            _ => Err(Alert::UnexpectedMessage),
        },
        (ClientState::WaitFinished, Some(message)) => match message.body() {
            Body::Finished(_) => on_finished(ctx, message),
            _ => Err(Alert::UnexpectedMessage),
        },
        (ClientState::Connected, Some(message)) => match message.body() {
            Body::KeyUpdate(_) | Body::NewSessionTicket(_) => {
                debug!(message = message.body().name(), "post-handshake message");
                Ok((ClientState::Connected, vec![], Flow::Await))
            }
            _ => Err(Alert::UnexpectedMessage),
        },
        _ => Err(Alert::UnexpectedMessage),
    }
}

/// Build and emit the ClientHello: one key share per supported group, the
/// standard extension set, and a PSK offer with a real binder when the
/// store has a key for the target server.
fn start(ctx: &mut ConnectionContext) -> Transition {
    let mut random = Random([0u8; 32]);
    OsRng.try_fill_bytes(&mut random.0).map_err(|e| {
        tracing::error!(error = %e, "entropy read failed");
        Alert::InternalError
    })?;

    let mut shares = Vec::with_capacity(ctx.caps.groups.len());
    for group in ctx.caps.groups.clone() {
        let pair = kex::generate(group).map_err(|e| {
            tracing::error!(error = %e, "key share generation failed");
            Alert::InternalError
        })?;
        ctx.offered_dh.insert(group, pair.secret);
        shares.push(KeyShareEntry {
            group,
            key_exchange: pair.public,
        });
    }

    let psk = ctx
        .opts
        .server_name
        .as_ref()
        .and_then(|name| ctx.caps.psks.get(name.as_bytes()))
        .cloned();

    // Offering early data without a PSK is a programming error, not a
    // negotiable condition.
    if psk.is_none() && ctx.opts.early_data.is_some() {
        tracing::error!("early data offered without a PSK");
        return Err(Alert::InternalError);
    }

    let mut cipher_suites = ctx.caps.cipher_suites.clone();
    if let Some(psk) = &psk {
        // Only suites on the PSK's hash keep the binder verifiable.
        cipher_suites.retain(|suite| suite.hash() == psk.suite.hash());
        if cipher_suites.is_empty() {
            return Err(Alert::InternalError);
        }
    }

    let offer_early = psk.is_some() && ctx.opts.early_data.is_some();
    let mut hello = ClientHello {
        random,
        cipher_suites,
        supported_versions: vec![TLS13],
        server_name: ctx.opts.server_name.clone(),
        supported_groups: Some(ctx.caps.groups.clone()),
        signature_schemes: Some(ctx.caps.signature_schemes.clone()),
        key_shares: Some(shares),
        psk_modes: Some(ctx.caps.psk_modes.clone()),
        alpn: (!ctx.opts.next_protos.is_empty()).then(|| ctx.opts.next_protos.clone()),
        cookie: None,
        early_data: offer_early,
        pre_shared_key: None,
    };

    if let Some(psk) = psk {
        ctx.schedule.pre_init(&psk)?;
        let binder_len = psk.suite.hash().output_len();
        hello.pre_shared_key = Some(PskOffer {
            identities: vec![PskIdentity {
                identity: psk.identity.clone(),
                obfuscated_ticket_age: 0,
            }],
            binders: vec![vec![0u8; binder_len]],
        });
        // The placeholder binder fixes the encoded length; the MAC covers
        // the hello up to (not including) the binder list.
        let truncated = codec::truncated_client_hello(&hello).ok_or(Alert::InternalError)?;
        let binder = ctx.schedule.psk_binder(&[], &truncated)?;
        if let Some(offer) = hello.pre_shared_key.as_mut() {
            offer.binders[0] = binder;
        }
        ctx.offered_psk = Some(psk);
    }

    let message = Message::new(Body::ClientHello(hello));
    if offer_early {
        ctx.early_traffic_secret = Some(ctx.schedule.early_traffic_secret(message.raw())?);
    }
    set_once(&mut ctx.client_hello, message.clone())?;
    info!(
        psk = ctx.offered_psk.is_some(),
        early_data = offer_early,
        "sending ClientHello"
    );
    Ok((ClientState::WaitServerHello, vec![message], Flow::Await))
}

/// The full HelloRetryRequest dance: validate, regenerate the key share for
/// the selected group only, echo the cookie, recompute the binder over
/// `CH1 ∥ HRR ∥ Truncate(CH2)`, and re-send.
fn on_hello_retry(ctx: &mut ConnectionContext, message: Message) -> Transition {
    let Body::HelloRetryRequest(hrr) = message.body().clone() else {
        return Err(Alert::InternalError);
    };
    if ctx.retry_client_hello.is_some() {
        // Retrying more than once gains the server nothing.
        return Err(Alert::UnexpectedMessage);
    }
    if hrr.supported_version != TLS13 {
        return Err(Alert::ProtocolVersion);
    }

    let original = ctx.client_hello.as_ref().ok_or(Alert::InternalError)?;
    let Body::ClientHello(mut hello) = original.body().clone() else {
        return Err(Alert::InternalError);
    };
    if !hello.cipher_suites.contains(&hrr.cipher_suite) {
        return Err(Alert::IllegalParameter);
    }

    if let Some(group) = hrr.selected_group {
        if !ctx.caps.groups.contains(&group) {
            return Err(Alert::IllegalParameter);
        }
        if ctx.offered_dh.contains_key(&group) {
            // The server may not re-select a group we already shared.
            return Err(Alert::IllegalParameter);
        }
        // The rejected scalars must not be reusable.
        ctx.offered_dh.clear();
        let pair = kex::generate(group).map_err(|e| {
            tracing::error!(error = %e, "key share regeneration failed");
            Alert::InternalError
        })?;
        ctx.offered_dh.insert(group, pair.secret);
        hello.key_shares = Some(vec![KeyShareEntry {
            group,
            key_exchange: pair.public,
        }]);
    }

    hello.cookie = hrr.cookie.clone();
    // 0-RTT does not survive a retry.
    hello.early_data = false;
    ctx.early_traffic_secret = None;

    if ctx.offered_psk.is_some() {
        if let Some(offer) = hello.pre_shared_key.as_mut() {
            for binder in offer.binders.iter_mut() {
                binder.fill(0);
            }
        }
        let truncated = codec::truncated_client_hello(&hello).ok_or(Alert::InternalError)?;
        let mut prefix = ctx
            .client_hello
            .as_ref()
            .ok_or(Alert::InternalError)?
            .raw()
            .to_vec();
        prefix.extend_from_slice(message.raw());
        let binder = ctx.schedule.psk_binder(&prefix, &truncated)?;
        if let Some(offer) = hello.pre_shared_key.as_mut() {
            offer.binders[0] = binder;
        }
    }

    let echoed_cookie = hello.cookie.is_some();
    set_once(&mut ctx.hello_retry_request, message)?;
    let retry = Message::new(Body::ClientHello(hello));
    set_once(&mut ctx.retry_client_hello, retry.clone())?;
    info!(cookie = echoed_cookie, "re-sending ClientHello after retry request");
    Ok((ClientState::WaitServerHello, vec![retry], Flow::Await))
}

fn on_server_hello(ctx: &mut ConnectionContext, message: Message) -> Transition {
    let Body::ServerHello(sh) = message.body().clone() else {
        return Err(Alert::InternalError);
    };
    if sh.supported_version != TLS13 {
        return Err(Alert::ProtocolVersion);
    }

    {
        let effective = ctx.effective_client_hello().ok_or(Alert::InternalError)?;
        let Body::ClientHello(hello) = effective.body() else {
            return Err(Alert::InternalError);
        };
        if !hello.cipher_suites.contains(&sh.cipher_suite) {
            return Err(Alert::IllegalParameter);
        }
    }

    // PSK echo: only identity 0 can be adopted, since exactly one identity
    // is ever offered. Anything else drops the pre-initialized PSK state.
    match sh.pre_shared_key {
        Some(0) => {
            if let Some(psk) = ctx.offered_psk.clone() {
                if psk.suite.hash() != sh.cipher_suite.hash() {
                    return Err(Alert::IllegalParameter);
                }
                ctx.params.using_psk = true;
                ctx.selected_psk_index = Some(0);
                ctx.psk_secret = Some(psk.key.clone());
            } else {
                return Err(Alert::IllegalParameter);
            }
        }
        Some(index) => {
            if ctx.offered_psk.is_none() {
                return Err(Alert::IllegalParameter);
            }
            warn!(index, "server selected an identity we did not offer; dropping PSK");
        }
        None => {}
    }
    if !ctx.params.using_psk && ctx.offered_psk.take().is_some() {
        // Forget the pre-initialized early secret; the handshake continues
        // on the DH path if one exists.
        ctx.schedule = crate::schedule::KeySchedule::new();
        ctx.early_traffic_secret = None;
        debug!("PSK offer not taken by the server");
    }

    let mut dh_secret = None;
    if let Some(share) = &sh.key_share {
        let secret = ctx
            .offered_dh
            .get(&share.group)
            .ok_or(Alert::IllegalParameter)?;
        let shared = kex::shared_secret(share.group, secret, &share.key_exchange)
            .map_err(|_| Alert::IllegalParameter)?;
        dh_secret = Some(shared);
        ctx.params.using_dh = true;
    }

    if !ctx.params.using_psk && !ctx.params.using_dh {
        return Err(Alert::HandshakeFailure);
    }
    ctx.params.cipher_suite = Some(sh.cipher_suite);

    let ch1 = ctx.client_hello.clone().ok_or(Alert::InternalError)?;
    let hrr = ctx.hello_retry_request.clone();
    let retry = ctx.retry_client_hello.clone();
    ctx.schedule
        .init(sh.cipher_suite, &ch1, hrr.as_ref(), retry.as_ref())?;
    let secrets = ctx
        .schedule
        .update_with_server_hello(&message, dh_secret.as_ref().map(|s| s.as_slice()))?;
    ctx.handshake_secrets = Some(secrets);
    set_once(&mut ctx.server_hello, message)?;
    // Offered scalars are consumed at the ServerHello.
    ctx.offered_dh.clear();

    debug!(
        using_psk = ctx.params.using_psk,
        using_dh = ctx.params.using_dh,
        suite = ?sh.cipher_suite,
        "ServerHello processed"
    );
    Ok((ClientState::WaitEncryptedExtensions, vec![], Flow::Await))
}

fn on_encrypted_extensions(ctx: &mut ConnectionContext, message: Message) -> Transition {
    let Body::EncryptedExtensions(ee) = message.body().clone() else {
        return Err(Alert::InternalError);
    };

    if let Some(proto) = &ee.alpn {
        if !ctx.opts.next_protos.contains(proto) {
            return Err(Alert::IllegalParameter);
        }
        ctx.params.next_proto = Some(proto.clone());
    }
    if ee.early_data {
        let offered = ctx
            .effective_client_hello()
            .and_then(|m| match m.body() {
                Body::ClientHello(hello) => Some(hello.early_data),
                _ => None,
            })
            .unwrap_or(false);
        if !(offered && ctx.params.using_psk) {
            return Err(Alert::IllegalParameter);
        }
        ctx.params.using_early_data = true;
    }
    ctx.server_first_flight.push(message);

    if ctx.params.using_psk {
        Ok((ClientState::WaitFinished, vec![], Flow::Await))
    } else {
        Ok((ClientState::WaitCertOrCertRequest, vec![], Flow::Await))
    }
}

fn on_certificate_request(ctx: &mut ConnectionContext, message: Message) -> Transition {
    let Body::CertificateRequest(request) = message.body().clone() else {
        return Err(Alert::InternalError);
    };
    ctx.params.using_client_auth = true;
    ctx.server_certificate_request = Some(request);
    ctx.server_first_flight.push(message);
    Ok((ClientState::WaitCertificate, vec![], Flow::Await))
}

fn on_certificate(ctx: &mut ConnectionContext, message: Message) -> Transition {
    let Body::Certificate(certificate) = message.body().clone() else {
        return Err(Alert::InternalError);
    };
    if certificate.chain.is_empty() {
        // A certificate-path server must authenticate.
        return Err(Alert::DecodeError);
    }
    ctx.server_certificate = Some(certificate);
    ctx.server_first_flight.push(message);
    Ok((ClientState::WaitCertificateVerify, vec![], Flow::Await))
}

fn on_certificate_verify(ctx: &mut ConnectionContext, message: Message) -> Transition {
    let Body::CertificateVerify(cv) = message.body().clone() else {
        return Err(Alert::InternalError);
    };
    if !ctx.caps.signature_schemes.contains(&cv.scheme) {
        return Err(Alert::IllegalParameter);
    }
    let certificate = ctx.server_certificate.as_ref().ok_or(Alert::InternalError)?;
    let key = certificate
        .chain
        .first()
        .and_then(|entry| entry.public_key)
        .ok_or(Alert::BadCertificate)?;
    if key.scheme() != cv.scheme {
        return Err(Alert::IllegalParameter);
    }

    let hash = ctx.schedule.hash().ok_or(Alert::InternalError)?;
    let transcript_hash = hash.digest(&ctx.handshake_transcript_bytes());
    let payload = certificate_verify_payload(Role::Server, &transcript_hash);
    key.verify(&payload, &cv.signature)
        .map_err(|_| Alert::HandshakeFailure)?;

    match &ctx.caps.auth_certificate {
        Some(verifier) => {
            if !verifier(&certificate.chain) {
                return Err(Alert::BadCertificate);
            }
        }
        None => warn!("no certificate verifier configured; accepting chain unverified"),
    }

    ctx.server_first_flight.push(message);
    Ok((ClientState::WaitFinished, vec![], Flow::Await))
}

/// Verify the server Finished, then assemble and emit the second flight:
/// EndOfEarlyData when 0-RTT was accepted, Certificate/CertificateVerify
/// when the server asked for client auth, and the client Finished.
fn on_finished(ctx: &mut ConnectionContext, message: Message) -> Transition {
    let Body::Finished(fin) = message.body().clone() else {
        return Err(Alert::InternalError);
    };

    let expected = ctx
        .schedule
        .update_with_server_first_flight(&ctx.server_first_flight)?;
    if !ct_eq(&expected, &fin.verify_data) {
        return Err(Alert::HandshakeFailure);
    }
    ctx.schedule.update_with_server_finished(&message)?;
    set_once(&mut ctx.server_finished, message)?;

    let mut outbound = Vec::new();
    if ctx.params.using_early_data {
        let eoed = Message::new(Body::EndOfEarlyData);
        ctx.client_second_flight.push(eoed.clone());
        outbound.push(eoed);
    }

    if ctx.params.using_client_auth {
        let request = ctx
            .server_certificate_request
            .clone()
            .ok_or(Alert::InternalError)?;
        match negotiate::select_certificate(&ctx.caps.certificates, &request.signature_schemes) {
            Some((index, scheme)) => {
                let certificate = Certificate {
                    context: request.context.clone(),
                    chain: ctx.caps.certificates[index].chain.clone(),
                };
                let cert_message = Message::new(Body::Certificate(certificate.clone()));
                ctx.client_certificate = Some(certificate);
                ctx.client_second_flight.push(cert_message.clone());
                outbound.push(cert_message);

                let hash = ctx.schedule.hash().ok_or(Alert::InternalError)?;
                let transcript_hash = hash.digest(&ctx.handshake_transcript_bytes());
                let payload = certificate_verify_payload(Role::Client, &transcript_hash);
                let signature = ctx.caps.certificates[index].key.sign(&payload);
                let cv_message =
                    Message::new(Body::CertificateVerify(CertificateVerify { scheme, signature }));
                ctx.client_second_flight.push(cv_message.clone());
                outbound.push(cv_message);
            }
            None => {
                // Decline with an empty chain; the server treats it as
                // "no client auth" and skips CertificateVerify.
                warn!("no credential matches the server's schemes; declining client auth");
                let cert_message = Message::new(Body::Certificate(Certificate {
                    context: request.context.clone(),
                    chain: Vec::new(),
                }));
                ctx.client_second_flight.push(cert_message.clone());
                outbound.push(cert_message);
            }
        }
    }

    let verify_data = ctx
        .schedule
        .update_with_client_second_flight(&ctx.client_second_flight)?;
    let finished = Message::new(Body::Finished(Finished { verify_data }));
    ctx.main_secrets = Some(ctx.schedule.update_with_client_finished(&finished)?);
    outbound.push(finished);

    info!(
        alpn = ?ctx.params.next_proto,
        early_data = ctx.params.using_early_data,
        "client handshake complete"
    );
    Ok((ClientState::Connected, outbound, Flow::Await))
}
