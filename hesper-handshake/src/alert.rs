#![forbid(unsafe_code)]

//! Protocol alerts surfaced by the handshake automata.
//!
//! Every failed transition terminates the handshake with exactly one of
//! these; success is the `Ok` path, so there is no "no alert" variant. The
//! caller encodes the alert for the record layer before closing.

/// Terminal handshake failure, with RFC 8446 alert semantics.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alert {
    #[error("unexpected message")]
    UnexpectedMessage,
    #[error("handshake failure")]
    HandshakeFailure,
    #[error("bad certificate")]
    BadCertificate,
    #[error("illegal parameter")]
    IllegalParameter,
    #[error("access denied")]
    AccessDenied,
    #[error("decode error")]
    DecodeError,
    #[error("protocol version")]
    ProtocolVersion,
    #[error("internal error")]
    InternalError,
    #[error("missing extension")]
    MissingExtension,
    #[error("no application protocol")]
    NoApplicationProtocol,
}

impl Alert {
    /// RFC 8446 alert description code point.
    pub fn code(&self) -> u8 {
        match self {
            Alert::UnexpectedMessage => 10,
            Alert::HandshakeFailure => 40,
            Alert::BadCertificate => 42,
            Alert::IllegalParameter => 47,
            Alert::AccessDenied => 49,
            Alert::DecodeError => 50,
            Alert::ProtocolVersion => 70,
            Alert::InternalError => 80,
            Alert::MissingExtension => 109,
            Alert::NoApplicationProtocol => 120,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_points_match_rfc8446() {
        assert_eq!(Alert::UnexpectedMessage.code(), 10);
        assert_eq!(Alert::HandshakeFailure.code(), 40);
        assert_eq!(Alert::MissingExtension.code(), 109);
        assert_eq!(Alert::NoApplicationProtocol.code(), 120);
    }
}
