#![forbid(unsafe_code)]

//! Canonical transcript encoding of handshake bodies.
//!
//! This is not a wire codec. The record layer owns real encode/decode; this
//! module exists because the key schedule, PSK binders, and
//! CertificateVerify are defined over exact message bytes, so both roles
//! must agree on one deterministic serialization. The shape follows RFC 8446
//! (4-byte handshake header, extension code points, `pre_shared_key` last in
//! a ClientHello) so that binder truncation lands on a real boundary.

use crate::messages::{
    Body, Certificate, CertificateRequest, CertificateVerify, ClientHello, EncryptedExtensions,
    Finished, HelloRetryRequest, KeyUpdate, NewSessionTicket, PskOffer, ServerHello,
};

/// RFC 8446 §4.1.3: the ServerHello random that marks a HelloRetryRequest.
pub const HRR_RANDOM: [u8; 32] = [
    0xcf, 0x21, 0xad, 0x74, 0xe5, 0x9a, 0x61, 0x11, 0xbe, 0x1d, 0x8c, 0x02, 0x1e, 0x65, 0xb8,
    0x91, 0xc2, 0xa2, 0x11, 0x16, 0x7a, 0xbb, 0x8c, 0x5e, 0x07, 0x9e, 0x09, 0xe2, 0xc8, 0xa8,
    0x33, 0x9c,
];

const EXT_SERVER_NAME: u16 = 0;
const EXT_SUPPORTED_GROUPS: u16 = 10;
const EXT_SIGNATURE_ALGORITHMS: u16 = 13;
const EXT_ALPN: u16 = 16;
const EXT_PRE_SHARED_KEY: u16 = 41;
const EXT_EARLY_DATA: u16 = 42;
const EXT_SUPPORTED_VERSIONS: u16 = 43;
const EXT_COOKIE: u16 = 44;
const EXT_PSK_MODES: u16 = 45;
const EXT_KEY_SHARE: u16 = 51;

fn put_u8(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_u24(out: &mut Vec<u8>, v: usize) {
    debug_assert!(v < 1 << 24);
    out.extend_from_slice(&(v as u32).to_be_bytes()[1..]);
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

/// Write a u8-length-prefixed vector.
fn with_len_u8(out: &mut Vec<u8>, f: impl FnOnce(&mut Vec<u8>)) {
    let at = out.len();
    out.push(0);
    f(out);
    let len = out.len() - at - 1;
    debug_assert!(len < 1 << 8);
    out[at] = len as u8;
}

/// Write a u16-length-prefixed vector.
fn with_len_u16(out: &mut Vec<u8>, f: impl FnOnce(&mut Vec<u8>)) {
    let at = out.len();
    out.extend_from_slice(&[0, 0]);
    f(out);
    let len = out.len() - at - 2;
    debug_assert!(len < 1 << 16);
    out[at..at + 2].copy_from_slice(&(len as u16).to_be_bytes());
}

/// Write a u24-length-prefixed vector.
fn with_len_u24(out: &mut Vec<u8>, f: impl FnOnce(&mut Vec<u8>)) {
    let at = out.len();
    out.extend_from_slice(&[0, 0, 0]);
    f(out);
    let len = out.len() - at - 3;
    debug_assert!(len < 1 << 24);
    out[at..at + 3].copy_from_slice(&(len as u32).to_be_bytes()[1..]);
}

fn put_extension(out: &mut Vec<u8>, code: u16, f: impl FnOnce(&mut Vec<u8>)) {
    put_u16(out, code);
    with_len_u16(out, f);
}

/// Encode a body with its 4-byte handshake header.
pub fn encode(body: &Body) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    put_u8(&mut out, body.type_code());
    with_len_u24(&mut out, |out| match body {
        Body::ClientHello(ch) => encode_client_hello(out, ch),
        Body::ServerHello(sh) => encode_server_hello(out, sh),
        Body::HelloRetryRequest(hrr) => encode_hello_retry_request(out, hrr),
        Body::EncryptedExtensions(ee) => encode_encrypted_extensions(out, ee),
        Body::CertificateRequest(cr) => encode_certificate_request(out, cr),
        Body::Certificate(cert) => encode_certificate(out, cert),
        Body::CertificateVerify(cv) => encode_certificate_verify(out, cv),
        Body::Finished(fin) => encode_finished(out, fin),
        Body::EndOfEarlyData => {}
        Body::KeyUpdate(ku) => encode_key_update(out, ku),
        Body::NewSessionTicket(nst) => encode_new_session_ticket(out, nst),
    });
    out
}

/// The byte prefix of a ClientHello up to (not including) the PSK binder
/// list: the bytes the binder MAC covers. `None` when no PSK is offered.
///
/// This is an encoding mode, not post-hoc slicing: the binder section length
/// is recomputed from the parsed offer, so it cannot drift from the
/// canonical encoding.
pub fn truncated_client_hello(ch: &ClientHello) -> Option<Vec<u8>> {
    let offer = ch.pre_shared_key.as_ref()?;
    let full = encode(&Body::ClientHello(ch.clone()));
    let binders_len = binders_encoded_len(offer);
    debug_assert!(binders_len < full.len());
    Some(full[..full.len() - binders_len].to_vec())
}

fn binders_encoded_len(offer: &PskOffer) -> usize {
    2 + offer.binders.iter().map(|b| 1 + b.len()).sum::<usize>()
}

fn encode_client_hello(out: &mut Vec<u8>, ch: &ClientHello) {
    put_u16(out, 0x0303); // legacy_version
    out.extend_from_slice(&ch.random.0);
    put_u8(out, 0); // empty legacy_session_id
    with_len_u16(out, |out| {
        for suite in &ch.cipher_suites {
            put_u16(out, suite.code());
        }
    });
    put_u8(out, 1); // legacy_compression_methods
    put_u8(out, 0);

    with_len_u16(out, |out| {
        if let Some(name) = &ch.server_name {
            put_extension(out, EXT_SERVER_NAME, |out| {
                with_len_u16(out, |out| {
                    put_u8(out, 0); // name_type host_name
                    with_len_u16(out, |out| out.extend_from_slice(name.as_bytes()));
                });
            });
        }
        if let Some(groups) = &ch.supported_groups {
            put_extension(out, EXT_SUPPORTED_GROUPS, |out| {
                with_len_u16(out, |out| {
                    for group in groups {
                        put_u16(out, group.code());
                    }
                });
            });
        }
        if let Some(schemes) = &ch.signature_schemes {
            put_extension(out, EXT_SIGNATURE_ALGORITHMS, |out| {
                with_len_u16(out, |out| {
                    for scheme in schemes {
                        put_u16(out, scheme.code());
                    }
                });
            });
        }
        if let Some(protos) = &ch.alpn {
            put_extension(out, EXT_ALPN, |out| {
                with_len_u16(out, |out| {
                    for proto in protos {
                        with_len_u8(out, |out| out.extend_from_slice(proto));
                    }
                });
            });
        }
        if ch.early_data {
            put_extension(out, EXT_EARLY_DATA, |_| {});
        }
        if !ch.supported_versions.is_empty() {
            put_extension(out, EXT_SUPPORTED_VERSIONS, |out| {
                with_len_u8(out, |out| {
                    for version in &ch.supported_versions {
                        put_u16(out, *version);
                    }
                });
            });
        }
        if let Some(cookie) = &ch.cookie {
            put_extension(out, EXT_COOKIE, |out| {
                with_len_u16(out, |out| out.extend_from_slice(cookie));
            });
        }
        if let Some(modes) = &ch.psk_modes {
            put_extension(out, EXT_PSK_MODES, |out| {
                with_len_u8(out, |out| {
                    for mode in modes {
                        put_u8(out, mode.code());
                    }
                });
            });
        }
        if let Some(shares) = &ch.key_shares {
            put_extension(out, EXT_KEY_SHARE, |out| {
                with_len_u16(out, |out| {
                    for share in shares {
                        put_u16(out, share.group.code());
                        with_len_u16(out, |out| out.extend_from_slice(&share.key_exchange));
                    }
                });
            });
        }
        // pre_shared_key must be last so binder truncation lands on a suffix.
        if let Some(offer) = &ch.pre_shared_key {
            put_extension(out, EXT_PRE_SHARED_KEY, |out| {
                with_len_u16(out, |out| {
                    for identity in &offer.identities {
                        with_len_u16(out, |out| out.extend_from_slice(&identity.identity));
                        put_u32(out, identity.obfuscated_ticket_age);
                    }
                });
                with_len_u16(out, |out| {
                    for binder in &offer.binders {
                        with_len_u8(out, |out| out.extend_from_slice(binder));
                    }
                });
            });
        }
    });
}

fn encode_server_hello(out: &mut Vec<u8>, sh: &ServerHello) {
    put_u16(out, 0x0303);
    out.extend_from_slice(&sh.random.0);
    put_u8(out, 0);
    put_u16(out, sh.cipher_suite.code());
    put_u8(out, 0);
    with_len_u16(out, |out| {
        put_extension(out, EXT_SUPPORTED_VERSIONS, |out| {
            put_u16(out, sh.supported_version);
        });
        if let Some(share) = &sh.key_share {
            put_extension(out, EXT_KEY_SHARE, |out| {
                put_u16(out, share.group.code());
                with_len_u16(out, |out| out.extend_from_slice(&share.key_exchange));
            });
        }
        if let Some(selected) = sh.pre_shared_key {
            put_extension(out, EXT_PRE_SHARED_KEY, |out| {
                put_u16(out, selected);
            });
        }
    });
}

fn encode_hello_retry_request(out: &mut Vec<u8>, hrr: &HelloRetryRequest) {
    put_u16(out, 0x0303);
    out.extend_from_slice(&HRR_RANDOM);
    put_u8(out, 0);
    put_u16(out, hrr.cipher_suite.code());
    put_u8(out, 0);
    with_len_u16(out, |out| {
        put_extension(out, EXT_SUPPORTED_VERSIONS, |out| {
            put_u16(out, hrr.supported_version);
        });
        if let Some(group) = hrr.selected_group {
            put_extension(out, EXT_KEY_SHARE, |out| {
                put_u16(out, group.code());
            });
        }
        if let Some(cookie) = &hrr.cookie {
            put_extension(out, EXT_COOKIE, |out| {
                with_len_u16(out, |out| out.extend_from_slice(cookie));
            });
        }
    });
}

fn encode_encrypted_extensions(out: &mut Vec<u8>, ee: &EncryptedExtensions) {
    with_len_u16(out, |out| {
        if let Some(proto) = &ee.alpn {
            put_extension(out, EXT_ALPN, |out| {
                with_len_u16(out, |out| {
                    with_len_u8(out, |out| out.extend_from_slice(proto));
                });
            });
        }
        if ee.early_data {
            put_extension(out, EXT_EARLY_DATA, |_| {});
        }
    });
}

fn encode_certificate_request(out: &mut Vec<u8>, cr: &CertificateRequest) {
    with_len_u8(out, |out| out.extend_from_slice(&cr.context));
    with_len_u16(out, |out| {
        put_extension(out, EXT_SIGNATURE_ALGORITHMS, |out| {
            with_len_u16(out, |out| {
                for scheme in &cr.signature_schemes {
                    put_u16(out, scheme.code());
                }
            });
        });
    });
}

fn encode_certificate(out: &mut Vec<u8>, cert: &Certificate) {
    with_len_u8(out, |out| out.extend_from_slice(&cert.context));
    with_len_u24(out, |out| {
        for entry in &cert.chain {
            with_len_u24(out, |out| out.extend_from_slice(&entry.data));
            put_u16(out, 0); // no per-entry extensions
        }
    });
}

fn encode_certificate_verify(out: &mut Vec<u8>, cv: &CertificateVerify) {
    put_u16(out, cv.scheme.code());
    with_len_u16(out, |out| out.extend_from_slice(&cv.signature));
}

fn encode_finished(out: &mut Vec<u8>, fin: &Finished) {
    out.extend_from_slice(&fin.verify_data);
}

fn encode_key_update(out: &mut Vec<u8>, ku: &KeyUpdate) {
    put_u8(out, u8::from(ku.request_update));
}

fn encode_new_session_ticket(out: &mut Vec<u8>, nst: &NewSessionTicket) {
    put_u32(out, nst.lifetime);
    put_u32(out, nst.age_add);
    with_len_u8(out, |out| out.extend_from_slice(&nst.nonce));
    with_len_u16(out, |out| out.extend_from_slice(&nst.ticket));
    with_len_u16(out, |out| {
        if nst.max_early_data > 0 {
            put_extension(out, EXT_EARLY_DATA, |out| {
                put_u32(out, nst.max_early_data);
            });
        }
    });
}
