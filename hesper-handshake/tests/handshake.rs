//! End-to-end handshakes over an in-memory client/server pair.
//!
//! The pair shuttles parsed `Message` values directly between the two
//! automata, which is exactly the contract the record layer would drive.

use hesper_crypto::kex::{self, NamedGroup};
use hesper_crypto::sign::SignatureScheme;
use hesper_handshake::messages::{
    Body, ClientHello, Finished, KeyShareEntry, KeyUpdate, NewSessionTicket, PskMode, Random,
    ServerHello, TLS13,
};
use hesper_handshake::{
    Alert, Capabilities, CertificateKeyPair, CipherSuite, ClientHandshake, ClientState,
    ConnectionOptions, Message, Psk, PskStore, ServerHandshake, ServerState,
};
use std::sync::Arc;
use zeroize::Zeroizing;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn client_caps() -> Capabilities {
    Capabilities::default()
}

fn server_caps() -> Capabilities {
    Capabilities {
        certificates: vec![CertificateKeyPair::generate(SignatureScheme::Ed25519).expect("keygen")],
        ..Capabilities::default()
    }
}

fn client_opts() -> ConnectionOptions {
    ConnectionOptions {
        server_name: Some("hesper.example".into()),
        ..ConnectionOptions::default()
    }
}

fn sample_psk(suite: CipherSuite) -> Psk {
    Psk {
        identity: b"ticket-1".to_vec(),
        key: Zeroizing::new(vec![0x6b; 32]),
        suite,
        alpn: None,
    }
}

/// Wire both PSK stores for resumption of `psk` against `hesper.example`.
fn provision_psk(client: &mut Capabilities, server: &mut Capabilities, psk: Psk) {
    let mut client_store = PskStore::new();
    client_store.insert(b"hesper.example".to_vec(), psk.clone());
    client.psks = client_store;

    let mut server_store = PskStore::new();
    server_store.insert(psk.identity.clone(), psk);
    server.psks = server_store;
}

/// Drive both machines to completion, returning the error of whichever side
/// fails first.
fn pump(client: &mut ClientHandshake, server: &mut ServerHandshake) -> Result<(), Alert> {
    let mut to_server = client.advance(None)?;
    for _ in 0..8 {
        let mut to_client = Vec::new();
        for message in to_server {
            to_client.extend(server.advance(Some(message))?);
        }
        to_server = Vec::new();
        for message in to_client {
            to_server.extend(client.advance(Some(message))?);
        }
        if client.is_connected() && server.is_connected() && to_server.is_empty() {
            return Ok(());
        }
    }
    panic!("handshake did not converge");
}

fn assert_secrets_agree(client: &ClientHandshake, server: &ServerHandshake) {
    let client_main = client.main_secrets().expect("client main secrets");
    let server_main = server.main_secrets().expect("server main secrets");
    assert_eq!(
        *client_main.client_application_traffic,
        *server_main.client_application_traffic
    );
    assert_eq!(
        *client_main.server_application_traffic,
        *server_main.server_application_traffic
    );
    assert_eq!(*client_main.exporter_master, *server_main.exporter_master);
    assert_eq!(*client_main.resumption_master, *server_main.resumption_master);

    let client_hs = client.handshake_secrets().expect("client handshake secrets");
    let server_hs = server.handshake_secrets().expect("server handshake secrets");
    assert_eq!(*client_hs.client, *server_hs.client);
    assert_eq!(*client_hs.server, *server_hs.server);

    assert_eq!(
        client.transcript_hash().expect("client transcript"),
        server.transcript_hash().expect("server transcript")
    );
}

#[test]
fn pure_ecdhe_x25519() {
    init_tracing();
    let mut client = ClientHandshake::new(client_caps(), client_opts());
    let mut server = ServerHandshake::new(server_caps(), ConnectionOptions::default());

    pump(&mut client, &mut server).expect("handshake");

    for params in [client.params(), server.params()] {
        assert!(params.using_dh);
        assert!(!params.using_psk);
        assert!(!params.using_early_data);
        assert!(!params.using_client_auth);
        assert_eq!(params.cipher_suite, Some(CipherSuite::Aes128GcmSha256));
        assert_eq!(params.next_proto, None);
    }
    assert_eq!(
        server.params().server_name.as_deref(),
        Some("hesper.example")
    );
    assert_secrets_agree(&client, &server);
}

#[test]
fn alpn_negotiation_picks_shared_protocol() {
    let mut client = ClientHandshake::new(
        client_caps(),
        ConnectionOptions {
            next_protos: vec![b"h2".to_vec(), b"http/1.1".to_vec()],
            ..client_opts()
        },
    );
    let mut server = ServerHandshake::new(
        server_caps(),
        ConnectionOptions {
            next_protos: vec![b"http/1.1".to_vec()],
            ..ConnectionOptions::default()
        },
    );

    pump(&mut client, &mut server).expect("handshake");
    assert_eq!(client.params().next_proto.as_deref(), Some(&b"http/1.1"[..]));
    assert_eq!(server.params().next_proto.as_deref(), Some(&b"http/1.1"[..]));
}

#[test]
fn alpn_without_overlap_is_rejected() {
    let mut client = ClientHandshake::new(
        client_caps(),
        ConnectionOptions {
            next_protos: vec![b"spdy/3".to_vec()],
            ..client_opts()
        },
    );
    let mut server = ServerHandshake::new(
        server_caps(),
        ConnectionOptions {
            next_protos: vec![b"h2".to_vec()],
            ..ConnectionOptions::default()
        },
    );

    let hello = client.advance(None).expect("client hello");
    let err = server.advance(hello.into_iter().next()).unwrap_err();
    assert_eq!(err, Alert::NoApplicationProtocol);
}

#[test]
fn psk_only_resumption() {
    let mut caps_c = client_caps();
    caps_c.groups = Vec::new(); // no key shares offered
    caps_c.psk_modes = vec![PskMode::PskKe];
    let mut caps_s = server_caps();
    provision_psk(&mut caps_c, &mut caps_s, sample_psk(CipherSuite::Aes256GcmSha384));

    let mut client = ClientHandshake::new(caps_c, client_opts());
    let mut server = ServerHandshake::new(caps_s, ConnectionOptions::default());

    // The server flight must not carry a certificate leg.
    let hello = client.advance(None).expect("client hello");
    let flight = server
        .advance(hello.into_iter().next())
        .expect("server flight");
    assert!(flight
        .iter()
        .all(|m| !matches!(m.body(), Body::Certificate(_) | Body::CertificateVerify(_))));

    let mut to_server = Vec::new();
    for message in flight {
        to_server.extend(client.advance(Some(message)).expect("client"));
    }
    for message in to_server {
        server.advance(Some(message)).expect("server");
    }

    assert!(client.is_connected() && server.is_connected());
    for params in [client.params(), server.params()] {
        assert!(params.using_psk);
        assert!(!params.using_dh);
        // the suite is pinned by the PSK
        assert_eq!(params.cipher_suite, Some(CipherSuite::Aes256GcmSha384));
    }
    assert_secrets_agree(&client, &server);
}

#[test]
fn psk_dhe_with_early_data() {
    let mut caps_c = client_caps();
    let mut caps_s = server_caps();
    caps_s.allow_early_data = true;
    provision_psk(&mut caps_c, &mut caps_s, sample_psk(CipherSuite::Aes128GcmSha256));

    let mut client = ClientHandshake::new(
        caps_c,
        ConnectionOptions {
            early_data: Some(b"0-rtt request".to_vec()),
            ..client_opts()
        },
    );
    let mut server = ServerHandshake::new(caps_s, ConnectionOptions::default());

    let hello = client.advance(None).expect("client hello");
    let flight = server
        .advance(hello.into_iter().next())
        .expect("server flight");
    assert_eq!(server.state(), ServerState::WaitEndOfEarlyData);

    // while awaiting EndOfEarlyData, anything else is rejected
    let mut probe = server.clone();
    let stray = Message::new(Body::KeyUpdate(KeyUpdate {
        request_update: false,
    }));
    assert_eq!(
        probe.advance(Some(stray)).unwrap_err(),
        Alert::UnexpectedMessage
    );
    assert_eq!(
        server.clone().advance(None).unwrap_err(),
        Alert::UnexpectedMessage
    );

    let mut second_flight = Vec::new();
    for message in flight {
        second_flight.extend(client.advance(Some(message)).expect("client"));
    }
    // the second flight leads with EndOfEarlyData
    assert!(matches!(second_flight[0].body(), Body::EndOfEarlyData));

    for message in second_flight {
        server.advance(Some(message)).expect("server");
    }

    assert!(client.is_connected() && server.is_connected());
    for params in [client.params(), server.params()] {
        assert!(params.using_psk);
        assert!(params.using_dh);
        assert!(params.using_early_data);
    }
    let client_early = client.early_traffic_secret().expect("client early secret");
    let server_early = server.early_traffic_secret().expect("server early secret");
    assert_eq!(client_early, server_early);
    assert_secrets_agree(&client, &server);
}

#[test]
fn cookie_round_trip() {
    let mut caps_s = server_caps();
    caps_s.require_cookie = true;

    let mut client = ClientHandshake::new(client_caps(), client_opts());
    let mut server = ServerHandshake::new(caps_s, ConnectionOptions::default());

    let hello = client.advance(None).expect("client hello");
    let retry = server
        .advance(hello.into_iter().next())
        .expect("retry request");
    assert!(matches!(retry[0].body(), Body::HelloRetryRequest(_)));
    assert_eq!(server.state(), ServerState::Start);

    let retry_hello = client
        .advance(retry.into_iter().next())
        .expect("retry hello");
    let mut to_client = server
        .advance(retry_hello.into_iter().next())
        .expect("server flight");

    loop {
        let mut to_server = Vec::new();
        for message in to_client {
            to_server.extend(client.advance(Some(message)).expect("client"));
        }
        if to_server.is_empty() {
            break;
        }
        to_client = Vec::new();
        for message in to_server {
            to_client.extend(server.advance(Some(message)).expect("server"));
        }
    }

    assert!(client.is_connected() && server.is_connected());
    assert_secrets_agree(&client, &server);
}

#[test]
fn tampered_cookie_is_denied() {
    let mut caps_s = server_caps();
    caps_s.require_cookie = true;

    let mut client = ClientHandshake::new(client_caps(), client_opts());
    let mut server = ServerHandshake::new(caps_s, ConnectionOptions::default());

    let hello = client.advance(None).expect("client hello");
    let retry = server
        .advance(hello.into_iter().next())
        .expect("retry request");
    let retry_hello = client
        .advance(retry.into_iter().next())
        .expect("retry hello");

    let Body::ClientHello(mut hello) = retry_hello[0].body().clone() else {
        panic!("expected a ClientHello");
    };
    hello.cookie.as_mut().expect("cookie echoed")[0] ^= 0xff;
    let forged = Message::new(Body::ClientHello(hello));

    assert_eq!(server.advance(Some(forged)).unwrap_err(), Alert::AccessDenied);
}

#[test]
fn client_authentication() {
    let mut caps_s = server_caps();
    caps_s.require_client_auth = true;
    let mut caps_c = client_caps();
    caps_c.certificates =
        vec![CertificateKeyPair::generate(SignatureScheme::EcdsaSecp256r1Sha256).expect("keygen")];

    let mut client = ClientHandshake::new(caps_c, client_opts());
    let mut server = ServerHandshake::new(caps_s, ConnectionOptions::default());

    pump(&mut client, &mut server).expect("handshake");
    assert!(client.params().using_client_auth);
    assert!(server.params().using_client_auth);
    assert_secrets_agree(&client, &server);
}

#[test]
fn client_declines_authentication_with_empty_chain() {
    let mut caps_s = server_caps();
    caps_s.require_client_auth = true;
    // no client credential configured

    let mut client = ClientHandshake::new(client_caps(), client_opts());
    let mut server = ServerHandshake::new(caps_s, ConnectionOptions::default());

    pump(&mut client, &mut server).expect("handshake");
    assert!(client.is_connected() && server.is_connected());
    assert_secrets_agree(&client, &server);
}

#[test]
fn forged_binder_fails_the_handshake() {
    let mut caps_c = client_caps();
    let mut caps_s = server_caps();
    provision_psk(&mut caps_c, &mut caps_s, sample_psk(CipherSuite::Aes128GcmSha256));

    let mut client = ClientHandshake::new(caps_c, client_opts());
    let mut server = ServerHandshake::new(caps_s, ConnectionOptions::default());

    let hello = client.advance(None).expect("client hello");
    let Body::ClientHello(mut body) = hello[0].body().clone() else {
        panic!("expected a ClientHello");
    };
    body.pre_shared_key.as_mut().expect("psk offered").binders[0][0] ^= 0x01;
    let forged = Message::new(Body::ClientHello(body));

    assert_eq!(
        server.advance(Some(forged)).unwrap_err(),
        Alert::HandshakeFailure
    );
}

#[test]
fn rejected_certificate_chain_aborts() {
    let mut caps_c = client_caps();
    caps_c.auth_certificate = Some(Arc::new(
        |_chain: &[hesper_handshake::messages::CertificateEntry]| false,
    ));

    let mut client = ClientHandshake::new(caps_c, client_opts());
    let mut server = ServerHandshake::new(server_caps(), ConnectionOptions::default());

    let hello = client.advance(None).expect("client hello");
    let flight = server
        .advance(hello.into_iter().next())
        .expect("server flight");

    let mut result = Ok(Vec::new());
    for message in flight {
        result = client.advance(Some(message));
        if result.is_err() {
            break;
        }
    }
    assert_eq!(result.unwrap_err(), Alert::BadCertificate);
}

// ---- boundary behaviors ----------------------------------------------------

fn crafted_server_hello(version: u16, key_share: Option<KeyShareEntry>) -> Message {
    Message::new(Body::ServerHello(ServerHello {
        random: Random([3u8; 32]),
        cipher_suite: CipherSuite::Aes128GcmSha256,
        supported_version: version,
        key_share,
        pre_shared_key: None,
    }))
}

#[test]
fn server_hello_with_wrong_version() {
    let mut client = ClientHandshake::new(client_caps(), client_opts());
    client.advance(None).expect("client hello");

    let legacy = crafted_server_hello(0x0303, None);
    assert_eq!(
        client.advance(Some(legacy)).unwrap_err(),
        Alert::ProtocolVersion
    );
}

#[test]
fn server_hello_with_unoffered_group() {
    let mut caps = client_caps();
    caps.groups = vec![NamedGroup::X25519];
    let mut client = ClientHandshake::new(caps, client_opts());
    client.advance(None).expect("client hello");

    let rogue = kex::generate(NamedGroup::Secp256r1).expect("keygen");
    let sh = crafted_server_hello(
        TLS13,
        Some(KeyShareEntry {
            group: NamedGroup::Secp256r1,
            key_exchange: rogue.public,
        }),
    );
    assert_eq!(client.advance(Some(sh)).unwrap_err(), Alert::IllegalParameter);
}

#[test]
fn non_psk_hello_missing_required_extensions() {
    let share = kex::generate(NamedGroup::X25519).expect("keygen");
    let base = ClientHello {
        random: Random([5u8; 32]),
        cipher_suites: vec![CipherSuite::Aes128GcmSha256],
        supported_versions: vec![TLS13],
        server_name: Some("hesper.example".into()),
        supported_groups: Some(vec![NamedGroup::X25519]),
        signature_schemes: Some(vec![SignatureScheme::Ed25519]),
        key_shares: Some(vec![KeyShareEntry {
            group: NamedGroup::X25519,
            key_exchange: share.public,
        }]),
        psk_modes: Some(vec![PskMode::PskDheKe]),
        alpn: None,
        cookie: None,
        early_data: false,
        pre_shared_key: None,
    };

    let mut without_name = base.clone();
    without_name.server_name = None;
    let mut without_groups = base.clone();
    without_groups.supported_groups = None;
    let mut without_schemes = base;
    without_schemes.signature_schemes = None;

    for hello in [without_name, without_groups, without_schemes] {
        let mut server = ServerHandshake::new(server_caps(), ConnectionOptions::default());
        assert_eq!(
            server
                .advance(Some(Message::new(Body::ClientHello(hello))))
                .unwrap_err(),
            Alert::MissingExtension
        );
    }
}

#[test]
fn flipped_finished_bit_fails() {
    let mut client = ClientHandshake::new(client_caps(), client_opts());
    let mut server = ServerHandshake::new(server_caps(), ConnectionOptions::default());

    let hello = client.advance(None).expect("client hello");
    let flight = server
        .advance(hello.into_iter().next())
        .expect("server flight");

    let mut result = Ok(Vec::new());
    for message in flight {
        let message = if let Body::Finished(fin) = message.body() {
            let mut fin = fin.clone();
            fin.verify_data[0] ^= 0x01;
            Message::new(Body::Finished(fin))
        } else {
            message
        };
        result = client.advance(Some(message));
        if result.is_err() {
            break;
        }
    }
    assert_eq!(result.unwrap_err(), Alert::HandshakeFailure);
}

// ---- unexpected-message sweep ----------------------------------------------

/// One sample message per body variant.
fn sample_bodies() -> Vec<Message> {
    let share = kex::generate(NamedGroup::X25519).expect("keygen");
    vec![
        Message::new(Body::ClientHello(ClientHello {
            random: Random([1; 32]),
            cipher_suites: vec![CipherSuite::Aes128GcmSha256],
            supported_versions: vec![TLS13],
            server_name: None,
            supported_groups: None,
            signature_schemes: None,
            key_shares: None,
            psk_modes: None,
            alpn: None,
            cookie: None,
            early_data: false,
            pre_shared_key: None,
        })),
        crafted_server_hello(TLS13, None),
        Message::new(Body::HelloRetryRequest(
            hesper_handshake::messages::HelloRetryRequest {
                cipher_suite: CipherSuite::Aes128GcmSha256,
                supported_version: TLS13,
                selected_group: None,
                cookie: None,
            },
        )),
        Message::new(Body::EncryptedExtensions(Default::default())),
        Message::new(Body::CertificateRequest(
            hesper_handshake::messages::CertificateRequest {
                context: Vec::new(),
                signature_schemes: vec![SignatureScheme::Ed25519],
            },
        )),
        Message::new(Body::Certificate(hesper_handshake::messages::Certificate {
            context: Vec::new(),
            chain: Vec::new(),
        })),
        Message::new(Body::CertificateVerify(
            hesper_handshake::messages::CertificateVerify {
                scheme: SignatureScheme::Ed25519,
                signature: vec![0; 64],
            },
        )),
        Message::new(Body::Finished(Finished {
            verify_data: vec![0; 32],
        })),
        Message::new(Body::EndOfEarlyData),
        Message::new(Body::KeyUpdate(KeyUpdate {
            request_update: false,
        })),
        Message::new(Body::NewSessionTicket(NewSessionTicket {
            lifetime: 300,
            age_add: 0,
            nonce: vec![0],
            ticket: vec![1, 2, 3],
            max_early_data: 0,
        })),
        // a key-share-bearing hello, to exercise server Start separately
        Message::new(Body::ClientHello(ClientHello {
            random: Random([2; 32]),
            cipher_suites: vec![CipherSuite::Aes128GcmSha256],
            supported_versions: vec![TLS13],
            server_name: Some("hesper.example".into()),
            supported_groups: Some(vec![NamedGroup::X25519]),
            signature_schemes: Some(vec![SignatureScheme::Ed25519]),
            key_shares: Some(vec![KeyShareEntry {
                group: NamedGroup::X25519,
                key_exchange: share.public,
            }]),
            psk_modes: Some(vec![PskMode::PskDheKe]),
            alpn: None,
            cookie: None,
            early_data: false,
            pre_shared_key: None,
        })),
    ]
}

fn accepted_by_client(state: ClientState, body: &Body) -> bool {
    match state {
        ClientState::WaitServerHello => {
            matches!(body, Body::ServerHello(_) | Body::HelloRetryRequest(_))
        }
        ClientState::WaitEncryptedExtensions => matches!(body, Body::EncryptedExtensions(_)),
        ClientState::WaitCertOrCertRequest => {
            matches!(body, Body::Certificate(_) | Body::CertificateRequest(_))
        }
        ClientState::WaitCertificate => matches!(body, Body::Certificate(_)),
        ClientState::WaitCertificateVerify => matches!(body, Body::CertificateVerify(_)),
        ClientState::WaitFinished => matches!(body, Body::Finished(_)),
        ClientState::Connected => {
            matches!(body, Body::KeyUpdate(_) | Body::NewSessionTicket(_))
        }
        _ => false,
    }
}

fn accepted_by_server(state: ServerState, body: &Body) -> bool {
    match state {
        ServerState::Start => matches!(body, Body::ClientHello(_)),
        ServerState::WaitEndOfEarlyData => matches!(body, Body::EndOfEarlyData),
        ServerState::WaitCertificate => matches!(body, Body::Certificate(_)),
        ServerState::WaitCertificateVerify => matches!(body, Body::CertificateVerify(_)),
        ServerState::WaitFinished => matches!(body, Body::Finished(_)),
        ServerState::Connected => {
            matches!(body, Body::KeyUpdate(_) | Body::NewSessionTicket(_))
        }
        _ => false,
    }
}

/// Every state rejects every body variant it does not accept, and rejects a
/// missing body unless it is a self-driven state.
#[test]
fn unexpected_inputs_yield_unexpected_message() {
    let mut caps_s = server_caps();
    caps_s.require_client_auth = true;
    let mut caps_c = client_caps();
    caps_c.certificates =
        vec![CertificateKeyPair::generate(SignatureScheme::Ed25519).expect("keygen")];

    let mut client = ClientHandshake::new(caps_c, client_opts());
    let mut server = ServerHandshake::new(caps_s, ConnectionOptions::default());

    let mut client_snapshots = vec![client.clone()];
    let mut server_snapshots = vec![server.clone()];

    let mut to_server = client.advance(None).expect("client hello");
    client_snapshots.push(client.clone());
    for _ in 0..8 {
        let mut to_client = Vec::new();
        for message in to_server {
            to_client.extend(server.advance(Some(message)).expect("server"));
            server_snapshots.push(server.clone());
        }
        to_server = Vec::new();
        for message in to_client {
            to_server.extend(client.advance(Some(message)).expect("client"));
            client_snapshots.push(client.clone());
        }
        if client.is_connected() && server.is_connected() && to_server.is_empty() {
            break;
        }
    }
    assert!(client.is_connected() && server.is_connected());

    for snapshot in &client_snapshots {
        // None is only valid at Start
        if snapshot.state() != ClientState::Start {
            assert_eq!(
                snapshot.clone().advance(None).unwrap_err(),
                Alert::UnexpectedMessage,
                "client state {:?} accepted None",
                snapshot.state()
            );
        }
        for message in sample_bodies() {
            if accepted_by_client(snapshot.state(), message.body()) {
                continue;
            }
            let mut probe = snapshot.clone();
            assert_eq!(
                probe.advance(Some(message)).unwrap_err(),
                Alert::UnexpectedMessage,
                "client state {:?}",
                snapshot.state()
            );
        }
    }

    for snapshot in &server_snapshots {
        assert_eq!(
            snapshot.clone().advance(None).unwrap_err(),
            Alert::UnexpectedMessage,
            "server state {:?} accepted None",
            snapshot.state()
        );
        for message in sample_bodies() {
            if accepted_by_server(snapshot.state(), message.body()) {
                continue;
            }
            let mut probe = snapshot.clone();
            assert_eq!(
                probe.advance(Some(message)).unwrap_err(),
                Alert::UnexpectedMessage,
                "server state {:?}",
                snapshot.state()
            );
        }
    }
}

#[test]
fn connected_accepts_post_handshake_messages() {
    let mut client = ClientHandshake::new(client_caps(), client_opts());
    let mut server = ServerHandshake::new(server_caps(), ConnectionOptions::default());
    pump(&mut client, &mut server).expect("handshake");

    let ticket = Message::new(Body::NewSessionTicket(NewSessionTicket {
        lifetime: 7200,
        age_add: 17,
        nonce: vec![0],
        ticket: vec![9; 16],
        max_early_data: 0,
    }));
    assert!(client.advance(Some(ticket)).expect("ticket").is_empty());

    let update = Message::new(Body::KeyUpdate(KeyUpdate {
        request_update: false,
    }));
    assert!(server.advance(Some(update)).expect("key update").is_empty());
    assert!(client.is_connected() && server.is_connected());
}
