#![forbid(unsafe_code)]

//! Pure negotiation decisions, one function per sub-decision of ClientHello
//! processing. Each is independently testable; the server automaton only
//! sequences them.

use hesper_crypto::kex::{self, NamedGroup};
use hesper_crypto::sign::SignatureScheme;
use hesper_crypto::Error as CryptoError;
use zeroize::Zeroizing;

use crate::alert::Alert;
use crate::config::{CertificateKeyPair, Psk, PskStore};
use crate::messages::{KeyShareEntry, PskMode, PskOffer, TLS13};
use crate::schedule::{ct_eq, KeySchedule};
use crate::suites::CipherSuite;

/// `supported_versions` must be present and include TLS 1.3.
pub fn supports_tls13(supported_versions: &[u16]) -> bool {
    supported_versions.contains(&TLS13)
}

/// Outcome of DH negotiation: the chosen group, our ephemeral share, and the
/// already-computed shared secret with the client's share.
#[derive(Clone)]
pub struct DhSelection {
    pub group: NamedGroup,
    pub server_public: Vec<u8>,
    pub server_secret: Zeroizing<Vec<u8>>,
    pub shared: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for DhSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhSelection")
            .field("group", &self.group)
            .field("secrets", &"[REDACTED]")
            .finish()
    }
}

/// Pick the first group in our preference order the client sent a share
/// for. A client share we cannot complete (malformed public value) is
/// skipped; entropy failure is terminal.
pub fn negotiate_dh(
    server_groups: &[NamedGroup],
    client_shares: Option<&[KeyShareEntry]>,
) -> Result<Option<DhSelection>, Alert> {
    let shares = match client_shares {
        Some(shares) => shares,
        None => return Ok(None),
    };
    for group in server_groups {
        let Some(entry) = shares.iter().find(|share| share.group == *group) else {
            continue;
        };
        let pair = match kex::generate(*group) {
            Ok(pair) => pair,
            Err(CryptoError::Entropy(e)) => {
                tracing::error!(error = %e, "key share generation failed");
                return Err(Alert::InternalError);
            }
            Err(e) => {
                tracing::warn!(group = ?group, error = %e, "skipping group");
                continue;
            }
        };
        match kex::shared_secret(*group, &pair.secret, &entry.key_exchange) {
            Ok(shared) => {
                return Ok(Some(DhSelection {
                    group: *group,
                    server_public: pair.public,
                    server_secret: pair.secret,
                    shared,
                }))
            }
            Err(e) => {
                tracing::warn!(group = ?group, error = %e, "client key share unusable");
                continue;
            }
        }
    }
    Ok(None)
}

/// Outcome of PSK negotiation: the accepted identity index, the PSK, and a
/// key schedule already pre-initialized from it (the binder verification
/// derived the early secret anyway).
pub struct PskSelection {
    pub index: usize,
    pub psk: Psk,
    pub schedule: KeySchedule,
}

impl std::fmt::Debug for PskSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PskSelection")
            .field("index", &self.index)
            .field("psk", &self.psk)
            .finish()
    }
}

/// Walk the offered identities in order and accept the first one present in
/// the store whose binder verifies. A known identity with a bad binder is a
/// forged proof of possession and aborts the handshake.
///
/// `prefix` is the binder transcript prefix: empty for an initial
/// ClientHello, `CH1(full) ∥ HRR(full)` after a retry. `truncated_ch` is the
/// current ClientHello up to (not including) the binder list.
pub fn negotiate_psk(
    store: &PskStore,
    offer: Option<&PskOffer>,
    prefix: &[u8],
    truncated_ch: &[u8],
) -> Result<Option<PskSelection>, Alert> {
    let offer = match offer {
        Some(offer) => offer,
        None => return Ok(None),
    };
    if offer.binders.len() != offer.identities.len() {
        return Err(Alert::DecodeError);
    }
    for (index, identity) in offer.identities.iter().enumerate() {
        let Some(psk) = store.get(&identity.identity) else {
            continue;
        };
        let mut schedule = KeySchedule::new();
        schedule.pre_init(psk)?;
        let binder = schedule.psk_binder(prefix, truncated_ch)?;
        if !ct_eq(&binder, &offer.binders[index]) {
            tracing::warn!(index, "PSK binder mismatch");
            return Err(Alert::HandshakeFailure);
        }
        tracing::debug!(index, "PSK accepted");
        return Ok(Some(PskSelection {
            index,
            psk: psk.clone(),
            schedule,
        }));
    }
    Ok(None)
}

/// Map what is cryptographically possible onto what the client's
/// `psk_key_exchange_modes` permit.
pub fn negotiate_psk_modes(
    can_do_dh: bool,
    can_do_psk: bool,
    client_modes: Option<&[PskMode]>,
) -> (bool, bool) {
    let modes = client_modes.unwrap_or(&[]);
    if can_do_psk {
        if can_do_dh && modes.contains(&PskMode::PskDheKe) {
            return (true, true);
        }
        if modes.contains(&PskMode::PskKe) {
            return (false, true);
        }
    }
    (can_do_dh, false)
}

/// 0-RTT is accepted only for a first-flight PSK at identity 0, offered by
/// the client, allowed by policy, and not preceded by a retry.
pub fn negotiate_early_data(
    using_psk: bool,
    selected_identity: Option<usize>,
    client_offered: bool,
    allow_early_data: bool,
    after_retry: bool,
) -> bool {
    using_psk
        && selected_identity == Some(0)
        && client_offered
        && allow_early_data
        && !after_retry
}

/// First suite in our preference order the client offered, optionally
/// constrained to the PSK's hash.
pub fn negotiate_cipher_suite(
    server_suites: &[CipherSuite],
    client_suites: &[CipherSuite],
    required_hash: Option<hesper_crypto::hash::HashAlgorithm>,
) -> Option<CipherSuite> {
    server_suites
        .iter()
        .find(|suite| {
            client_suites.contains(suite)
                && required_hash.map_or(true, |hash| suite.hash() == hash)
        })
        .copied()
}

/// ALPN selection. A PSK pins its provisioned protocol; otherwise the first
/// client protocol we also speak wins. A non-empty client offer with no
/// overlap is `NoApplicationProtocol`.
pub fn negotiate_alpn(
    local_protos: &[Vec<u8>],
    client_protos: Option<&[Vec<u8>]>,
    pinned: Option<&[u8]>,
) -> Result<Option<Vec<u8>>, Alert> {
    let offered = match client_protos {
        Some(protos) if !protos.is_empty() => protos,
        _ => return Ok(None),
    };
    if let Some(pinned) = pinned {
        return if offered.iter().any(|proto| proto == pinned) {
            Ok(Some(pinned.to_vec()))
        } else {
            Err(Alert::NoApplicationProtocol)
        };
    }
    if local_protos.is_empty() {
        return Ok(None);
    }
    offered
        .iter()
        .find(|proto| local_protos.contains(proto))
        .cloned()
        .map(Some)
        .ok_or(Alert::NoApplicationProtocol)
}

/// Pick a credential matching the peer's scheme preferences, in the peer's
/// order. Returns the credential index and the scheme to sign with.
pub fn select_certificate(
    certificates: &[CertificateKeyPair],
    peer_schemes: &[SignatureScheme],
) -> Option<(usize, SignatureScheme)> {
    for scheme in peer_schemes {
        if let Some(index) = certificates.iter().position(|cert| cert.scheme() == *scheme) {
            return Some((index, *scheme));
        }
    }
    None
}
