//! # Protocol Error Types
//!
//! Every failure the engine can surface. Nothing here is retried
//! internally; apart from [`ProtocolError::InvalidArgument`], any error
//! leaves the session unusable and the caller must build a new one.

use thiserror::Error;

/// Main error type for protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Socket I/O failure or EOF in the middle of a frame.
    #[error("connection lost: {0}")]
    ConnectionLost(#[from] std::io::Error),

    /// The server refused the handshake with a status packet.
    #[error("handshake rejected: {cause}")]
    HandshakeRejected { cause: RejectionCause },

    /// Authentication failure: bad status after the auth packet, or a
    /// cipher MAC mismatch on a received packet.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// A fixed constant or length field violated its constraint.
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// Caller violated a payload precondition. The session is untouched.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Fewer bytes available than a field requires.
    #[error("short read: needed {needed} bytes, had {available}")]
    ShortRead { needed: usize, available: usize },

    /// The crypto provider failed (key generation, cipher setup).
    #[error("crypto provider failure: {0}")]
    Crypto(String),
}

/// Result type alias for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// User-visible cause behind a rejected handshake, decoded from the
/// status packet's sub-code byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionCause {
    /// Sub-code `0x01`; carries the upgrade URL sent by the server.
    UpgradeRequired(String),
    /// Sub-code `0x03`.
    UnknownUser,
    /// Sub-code `0x04`.
    AccountDisabled,
    /// Sub-code `0x06`.
    ProfileIncomplete,
    /// Sub-code `0x09`.
    RegionMismatch,
    /// Any other sub-code.
    Unknown(u8),
}

impl RejectionCause {
    /// Decode a status sub-code. Upgrade URLs are attached by the
    /// handshake after reading the URL region.
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => Self::UpgradeRequired(String::new()),
            0x03 => Self::UnknownUser,
            0x04 => Self::AccountDisabled,
            0x06 => Self::ProfileIncomplete,
            0x09 => Self::RegionMismatch,
            other => Self::Unknown(other),
        }
    }
}

impl std::fmt::Display for RejectionCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UpgradeRequired(url) if url.is_empty() => {
                write!(f, "client upgrade required")
            }
            Self::UpgradeRequired(url) => write!(f, "client upgrade required: {}", url),
            Self::UnknownUser => write!(f, "non-existent user"),
            Self::AccountDisabled => write!(f, "account has been disabled"),
            Self::ProfileIncomplete => write!(f, "account details need to be completed"),
            Self::RegionMismatch => {
                write!(f, "current country does not match the profile country")
            }
            Self::Unknown(code) => write!(f, "unknown error (code 0x{:02x})", code),
        }
    }
}
