#![forbid(unsafe_code)]

//! Server-side handshake state machine.
//!
//! `Start` runs the negotiation pipeline over the ClientHello (issuing a
//! cookie HelloRetryRequest first when policy demands one) and chains
//! straight into `Negotiated`, which assembles the entire server flight in
//! one step. `WaitFlight2` then routes to client authentication or directly
//! to the client Finished. Self-chained transitions loop inside a single
//! `advance` call, accumulating outbound messages.

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info, warn};

use crate::alert::Alert;
use crate::codec;
use crate::config::{Capabilities, ConnectionOptions, ConnectionParameters};
use crate::context::{certificate_verify_payload, set_once, ConnectionContext, Flow, Role};
use crate::messages::{
    Body, Certificate, CertificateRequest, CertificateVerify, EncryptedExtensions, Finished,
    HelloRetryRequest, KeyShareEntry, Message, Random, ServerHello, TLS13,
};
use crate::negotiate;
use crate::schedule::{ct_eq, HandshakeSecrets, MainSecrets};

/// Server automaton states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Start,
    Negotiated,
    WaitEndOfEarlyData,
    WaitFlight2,
    WaitCertificate,
    WaitCertificateVerify,
    WaitFinished,
    Connected,
    Failed,
}

/// Drives one TLS 1.3 server handshake over parsed messages.
#[derive(Clone)]
pub struct ServerHandshake {
    state: ServerState,
    ctx: ConnectionContext,
}

impl ServerHandshake {
    pub fn new(caps: Capabilities, opts: ConnectionOptions) -> Self {
        Self {
            state: ServerState::Start,
            ctx: ConnectionContext::new(Role::Server, caps, opts),
        }
    }

    /// Advance the machine with one inbound body. Self-driven successor
    /// states run inside the same call; the returned batch holds every
    /// message they emitted. On an alert the machine is terminal and
    /// secrets are erased.
    pub fn advance(&mut self, input: Option<Message>) -> Result<Vec<Message>, Alert> {
        if matches!(self.state, ServerState::Failed) {
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
                    warn!(?alert, state = ?self.state, "server handshake failed");
                    self.state = ServerState::Failed;
                    self.ctx.clear_secrets();
                    return Err(alert);
                }
            }
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, ServerState::Connected)
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

    /// Transcript hash at the schedule's current point.
    pub fn transcript_hash(&self) -> Option<Vec<u8>> {
        self.ctx.schedule.transcript_hash()
    }
}

type Transition = Result<(ServerState, Vec<Message>, Flow), Alert>;

fn step(ctx: &mut ConnectionContext, state: ServerState, input: Option<Message>) -> Transition {
    match (state, input) {
        (ServerState::Start, Some(message)) => match message.body() {
            Body::ClientHello(_) => on_client_hello(ctx, message),
            _ => Err(Alert::UnexpectedMessage),
        },
        (ServerState::Negotiated, None) => negotiated(ctx),
        (ServerState::WaitEndOfEarlyData, Some(message)) => match message.body() {
            Body::EndOfEarlyData => {
                ctx.client_second_flight.push(message);
                Ok((ServerState::WaitFlight2, vec![], Flow::Continue))
            }
            _ => Err(Alert::UnexpectedMessage),
        },
        (ServerState::WaitFlight2, None) => {
            let next = if ctx.params.using_client_auth {
                ServerState::WaitCertificate
            } else {
                ServerState::WaitFinished
            };
            Ok((next, vec![], Flow::Await))
        }
        (ServerState::WaitCertificate, Some(message)) => match message.body() {
            Body::Certificate(_) => on_client_certificate(ctx, message),
            _ => Err(Alert::UnexpectedMessage),
        },
        (ServerState::WaitCertificateVerify, Some(message)) => match message.body() {
            Body::CertificateVerify(_) => on_client_certificate_verify(ctx, message),
            _ => Err(Alert::UnexpectedMessage),
        },
        (ServerState::WaitFinished, Some(message)) => match message.body() {
            Body::Finished(_) => on_client_finished(ctx, message),
            _ => Err(Alert::UnexpectedMessage),
        },
        (ServerState::Connected, Some(message)) => match message.body() {
            Body::KeyUpdate(_) | Body::NewSessionTicket(_) => {
                debug!(message = message.body().name(), "post-handshake message");
                Ok((ServerState::Connected, vec![], Flow::Await))
            }
            _ => Err(Alert::UnexpectedMessage),
        },
        _ => Err(Alert::UnexpectedMessage),
    }
}

/// ClientHello processing: version, cookie round trip, then the negotiation
/// pipeline, each sub-decision delegated to a pure negotiator.
fn on_client_hello(ctx: &mut ConnectionContext, message: Message) -> Transition {
    let Body::ClientHello(hello) = message.body().clone() else {
        return Err(Alert::InternalError);
    };

    if !negotiate::supports_tls13(&hello.supported_versions) {
        return Err(Alert::ProtocolVersion);
    }

    if ctx.caps.require_cookie {
        match ctx.cookie.clone() {
            None => {
                let mut cookie = vec![0u8; 32];
                OsRng.try_fill_bytes(&mut cookie).map_err(|e| {
                    tracing::error!(error = %e, "cookie generation failed");
                    Alert::InternalError
                })?;
                ctx.cookie = Some(cookie.clone());
                let suite = negotiate::negotiate_cipher_suite(
                    &ctx.caps.cipher_suites,
                    &hello.cipher_suites,
                    None,
                )
                .ok_or(Alert::HandshakeFailure)?;
                let retry_request = Message::new(Body::HelloRetryRequest(HelloRetryRequest {
                    cipher_suite: suite,
                    supported_version: TLS13,
                    selected_group: None,
                    cookie: Some(cookie),
                }));
                set_once(&mut ctx.client_hello, message)?;
                set_once(&mut ctx.hello_retry_request, retry_request.clone())?;
                info!("demanding cookie round trip");
                return Ok((ServerState::Start, vec![retry_request], Flow::Await));
            }
            Some(expected) => {
                if hello.cookie.as_deref() != Some(expected.as_slice()) {
                    warn!("cookie mismatch");
                    return Err(Alert::AccessDenied);
                }
                set_once(&mut ctx.retry_client_hello, message)?;
            }
        }
    } else {
        set_once(&mut ctx.client_hello, message)?;
    }

    // Key exchange across the offered shares, in our preference order.
    let dh = negotiate::negotiate_dh(&ctx.caps.groups, hello.key_shares.as_deref())?;

    // PSK: rebuild the binder transcript and accept the first identity whose
    // binder verifies.
    let mut prefix = Vec::new();
    if ctx.retry_client_hello.is_some() {
        if let (Some(first), Some(retry_request)) =
            (&ctx.client_hello, &ctx.hello_retry_request)
        {
            prefix.extend_from_slice(first.raw());
            prefix.extend_from_slice(retry_request.raw());
        }
    }
    let psk_selection = match codec::truncated_client_hello(&hello) {
        Some(truncated) => negotiate::negotiate_psk(
            &ctx.caps.psks,
            hello.pre_shared_key.as_ref(),
            &prefix,
            &truncated,
        )?,
        None => None,
    };

    let (using_dh, using_psk) = negotiate::negotiate_psk_modes(
        dh.is_some(),
        psk_selection.is_some(),
        hello.psk_modes.as_deref(),
    );
    if !using_dh && !using_psk {
        return Err(Alert::HandshakeFailure);
    }

    if using_psk {
        if let Some(selection) = psk_selection {
            ctx.schedule = selection.schedule;
            ctx.psk_secret = Some(selection.psk.key.clone());
            ctx.selected_psk_index = Some(selection.index);
            ctx.accepted_psk = Some(selection.psk);
        }
    }
    if using_dh {
        ctx.dh = dh;
    }

    if !using_psk {
        // Certificate path: the client must identify the server and tell us
        // how it can be authenticated.
        let server_name = hello.server_name.clone().ok_or(Alert::MissingExtension)?;
        if hello.supported_groups.is_none() {
            return Err(Alert::MissingExtension);
        }
        let schemes = hello
            .signature_schemes
            .as_deref()
            .ok_or(Alert::MissingExtension)?;
        let (index, scheme) = negotiate::select_certificate(&ctx.caps.certificates, schemes)
            .ok_or(Alert::AccessDenied)?;
        ctx.local_certificate = Some(index);
        ctx.local_cert_scheme = Some(scheme);
        ctx.params.server_name = Some(server_name);
        ctx.params.using_client_auth = ctx.caps.require_client_auth;
    }

    ctx.params.using_early_data = negotiate::negotiate_early_data(
        using_psk,
        ctx.selected_psk_index,
        hello.early_data,
        ctx.caps.allow_early_data,
        ctx.hello_retry_request.is_some(),
    );

    let required_hash = ctx.accepted_psk.as_ref().map(|psk| psk.suite.hash());
    let suite = negotiate::negotiate_cipher_suite(
        &ctx.caps.cipher_suites,
        &hello.cipher_suites,
        required_hash,
    )
    .ok_or(Alert::HandshakeFailure)?;
    ctx.params.cipher_suite = Some(suite);

    let pinned = ctx.accepted_psk.as_ref().and_then(|psk| psk.alpn.as_deref());
    ctx.params.next_proto =
        negotiate::negotiate_alpn(&ctx.opts.next_protos, hello.alpn.as_deref(), pinned)?;

    ctx.params.using_psk = using_psk;
    ctx.params.using_dh = using_dh;
    debug!(
        using_psk,
        using_dh,
        early_data = ctx.params.using_early_data,
        suite = ?suite,
        "negotiation complete"
    );
    Ok((ServerState::Negotiated, vec![], Flow::Continue))
}

/// Assemble the server flight: ServerHello, EncryptedExtensions, the
/// certificate leg when not resuming, and Finished.
fn negotiated(ctx: &mut ConnectionContext) -> Transition {
    let mut random = Random([0u8; 32]);
    OsRng.try_fill_bytes(&mut random.0).map_err(|e| {
        tracing::error!(error = %e, "entropy read failed");
        Alert::InternalError
    })?;

    let suite = ctx.params.cipher_suite.ok_or(Alert::InternalError)?;
    let server_hello = ServerHello {
        random,
        cipher_suite: suite,
        supported_version: TLS13,
        key_share: ctx.dh.as_ref().map(|dh| KeyShareEntry {
            group: dh.group,
            key_exchange: dh.server_public.clone(),
        }),
        pre_shared_key: ctx.selected_psk_index.map(|index| index as u16),
    };
    let sh_message = Message::new(Body::ServerHello(server_hello));

    let ch1 = ctx.client_hello.clone().ok_or(Alert::InternalError)?;
    let retry_request = ctx.hello_retry_request.clone();
    let retry_hello = ctx.retry_client_hello.clone();
    ctx.schedule
        .init(suite, &ch1, retry_request.as_ref(), retry_hello.as_ref())?;

    if ctx.params.using_early_data {
        // The early-traffic secret is bound to the hello that offered 0-RTT.
        ctx.early_traffic_secret = Some(ctx.schedule.early_traffic_secret(ch1.raw())?);
    }

    let dh_shared = ctx.dh.as_ref().map(|dh| dh.shared.as_slice());
    let secrets = ctx.schedule.update_with_server_hello(&sh_message, dh_shared)?;
    ctx.handshake_secrets = Some(secrets);
    set_once(&mut ctx.server_hello, sh_message.clone())?;

    let ee_message = Message::new(Body::EncryptedExtensions(EncryptedExtensions {
        alpn: ctx.params.next_proto.clone(),
        early_data: ctx.params.using_early_data,
    }));
    ctx.server_first_flight.push(ee_message);

    if !ctx.params.using_psk {
        if ctx.caps.require_client_auth {
            let request = CertificateRequest {
                context: Vec::new(),
                signature_schemes: ctx.caps.signature_schemes.clone(),
            };
            let message = Message::new(Body::CertificateRequest(request.clone()));
            ctx.server_certificate_request = Some(request);
            ctx.server_first_flight.push(message);
        }

        let index = ctx.local_certificate.ok_or(Alert::InternalError)?;
        let certificate = Certificate {
            context: Vec::new(),
            chain: ctx.caps.certificates[index].chain.clone(),
        };
        let message = Message::new(Body::Certificate(certificate.clone()));
        ctx.server_certificate = Some(certificate);
        ctx.server_first_flight.push(message);

        let scheme = ctx.local_cert_scheme.ok_or(Alert::InternalError)?;
        let hash = ctx.schedule.hash().ok_or(Alert::InternalError)?;
        let transcript_hash = hash.digest(&ctx.handshake_transcript_bytes());
        let payload = certificate_verify_payload(Role::Server, &transcript_hash);
        let signature = ctx.caps.certificates[index].key.sign(&payload);
        let message = Message::new(Body::CertificateVerify(CertificateVerify {
            scheme,
            signature,
        }));
        ctx.server_first_flight.push(message);
    }

    let verify_data = ctx
        .schedule
        .update_with_server_first_flight(&ctx.server_first_flight)?;
    let finished = Message::new(Body::Finished(Finished { verify_data }));
    ctx.schedule.update_with_server_finished(&finished)?;
    set_once(&mut ctx.server_finished, finished.clone())?;

    let mut outbound = vec![sh_message];
    outbound.extend(ctx.server_first_flight.iter().cloned());
    outbound.push(finished);

    info!(
        messages = outbound.len(),
        early_data = ctx.params.using_early_data,
        "server flight ready"
    );
    if ctx.params.using_early_data {
        Ok((ServerState::WaitEndOfEarlyData, outbound, Flow::Await))
    } else {
        Ok((ServerState::WaitFlight2, outbound, Flow::Continue))
    }
}

/// An empty chain means the client declines authentication; a non-empty one
/// must be followed by CertificateVerify.
fn on_client_certificate(ctx: &mut ConnectionContext, message: Message) -> Transition {
    let Body::Certificate(certificate) = message.body().clone() else {
        return Err(Alert::InternalError);
    };
    ctx.client_second_flight.push(message);
    if certificate.chain.is_empty() {
        info!("client declined authentication");
        return Ok((ServerState::WaitFinished, vec![], Flow::Await));
    }
    ctx.client_certificate = Some(certificate);
    Ok((ServerState::WaitCertificateVerify, vec![], Flow::Await))
}

fn on_client_certificate_verify(ctx: &mut ConnectionContext, message: Message) -> Transition {
    let Body::CertificateVerify(cv) = message.body().clone() else {
        return Err(Alert::InternalError);
    };
    if !ctx.caps.signature_schemes.contains(&cv.scheme) {
        return Err(Alert::IllegalParameter);
    }
    let certificate = ctx.client_certificate.as_ref().ok_or(Alert::InternalError)?;
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
    let payload = certificate_verify_payload(Role::Client, &transcript_hash);
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

    ctx.client_second_flight.push(message);
    Ok((ServerState::WaitFinished, vec![], Flow::Await))
}

/// Compare the received Finished against the locally derived
/// client-Finished MAC and enter the application-data phase.
fn on_client_finished(ctx: &mut ConnectionContext, message: Message) -> Transition {
    let Body::Finished(fin) = message.body().clone() else {
        return Err(Alert::InternalError);
    };
    let expected = ctx
        .schedule
        .update_with_client_second_flight(&ctx.client_second_flight)?;
    if !ct_eq(&expected, &fin.verify_data) {
        return Err(Alert::HandshakeFailure);
    }
    ctx.main_secrets = Some(ctx.schedule.update_with_client_finished(&message)?);
    info!(
        alpn = ?ctx.params.next_proto,
        client_auth = ctx.params.using_client_auth,
        "server handshake complete"
    );
    Ok((ServerState::Connected, vec![], Flow::Await))
}
