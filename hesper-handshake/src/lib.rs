//! Hesper TLS 1.3 handshake engine (unsafe-forbid, sans-I/O).
//!
//! Two state automata — [`ClientHandshake`] and [`ServerHandshake`] — advance
//! over already-parsed handshake bodies and emit the bodies to send back.
//! Record-layer framing, AEAD, and wire codecs live outside this crate: the
//! embedder decodes inbound records into [`Message`] values, feeds them to
//! `advance`, encodes whatever comes back, and installs the traffic secrets
//! the drivers expose once the handshake reaches `Connected`.
//!
//! Every failure is terminal and surfaces as a single [`Alert`]; secrets are
//! zeroized when the handshake ends, whichever way it ends.
#![forbid(unsafe_code)]

pub mod alert;
pub mod client;
pub mod codec;
pub mod config;
pub mod context;
pub mod messages;
pub mod negotiate;
pub mod schedule;
pub mod server;
pub mod suites;

pub use alert::Alert;
pub use client::{ClientHandshake, ClientState};
pub use config::{
    Capabilities, CertificateKeyPair, CertificateVerifier, ConnectionOptions,
    ConnectionParameters, Psk, PskStore,
};
pub use context::Role;
pub use messages::{Body, Message};
pub use schedule::{HandshakeSecrets, KeySchedule, MainSecrets, SchedulePhase};
pub use server::{ServerHandshake, ServerState};
pub use suites::CipherSuite;

// Re-exported so embedders configure groups, schemes, and credentials
// without naming the primitives crate separately.
pub use hesper_crypto as crypto;
