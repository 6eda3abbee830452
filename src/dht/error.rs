use std::fmt;
use std::net::SocketAddr;

use thiserror::Error;

/// KRPC error codes (BEP-5 and BEP-44).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Generic,
    Server,
    /// Malformed packet, invalid arguments or bad token.
    Protocol,
    MethodUnknown,
    /// BEP-44 `v` larger than 1000 bytes.
    MessageTooBig,
    InvalidSignature,
    SaltTooBig,
    CasMismatch,
    SequenceTooOld,
    Other(i64),
}

impl ErrorCode {
    pub fn code(self) -> i64 {
        match self {
            ErrorCode::Generic => 201,
            ErrorCode::Server => 202,
            ErrorCode::Protocol => 203,
            ErrorCode::MethodUnknown => 204,
            ErrorCode::MessageTooBig => 205,
            ErrorCode::InvalidSignature => 206,
            ErrorCode::SaltTooBig => 207,
            ErrorCode::CasMismatch => 301,
            ErrorCode::SequenceTooOld => 302,
            ErrorCode::Other(code) => code,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            201 => ErrorCode::Generic,
            202 => ErrorCode::Server,
            203 => ErrorCode::Protocol,
            204 => ErrorCode::MethodUnknown,
            205 => ErrorCode::MessageTooBig,
            206 => ErrorCode::InvalidSignature,
            207 => ErrorCode::SaltTooBig,
            301 => ErrorCode::CasMismatch,
            302 => ErrorCode::SequenceTooOld,
            other => ErrorCode::Other(other),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// The payload of a KRPC `e` message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("krpc error {code}: {message}")]
pub struct KrpcError {
    pub code: ErrorCode,
    pub message: String,
}

impl KrpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Protocol, message)
    }
}

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    /// An incoming datagram could not be understood.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Bad input to a public operation.
    #[error("invalid argument: {0}")]
    Validation(String),

    #[error("invalid node id length")]
    InvalidNodeId,

    #[error("timeout")]
    Timeout,

    /// The queried node answered with a KRPC error.
    #[error("remote error: {0}")]
    Remote(KrpcError),

    /// A BEP-44 item failed local validation.
    #[error("rejected: {0}")]
    Rejected(KrpcError),

    /// Hash or signature mismatch on network-supplied data. Returned by a
    /// `get` whose only values failed verification.
    #[error("verification failed: {0}")]
    Verification(String),

    #[error("value not found")]
    NotFound,

    #[error("dht node destroyed")]
    Destroyed,

    #[error("rate limited")]
    RateLimited,

    #[error("invalid destination address {0}")]
    InvalidAddress(SocketAddr),
}

impl DhtError {
    /// KRPC error code carried by this error, if any.
    pub fn krpc_code(&self) -> Option<ErrorCode> {
        match self {
            DhtError::Remote(e) | DhtError::Rejected(e) => Some(e.code),
            _ => None,
        }
    }
}
