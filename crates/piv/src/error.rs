use iso7816_tlv::TlvError;
use nexum_apdu_core::StatusWord;

use crate::types::{CredentialKind, ManagementKeyAlgorithm};

/// Result type for PIV operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for PIV operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Wrong PIN or PUK. The caller may retry while attempts remain.
    #[error("Wrong {kind}, {retries_remaining} attempts remaining")]
    WrongValue {
        /// Credential that was wrong
        kind: CredentialKind,
        /// Attempts left before it blocks
        retries_remaining: u8,
    },

    /// Retry counter exhausted. Terminal until a reset path is used.
    #[error("{0} is blocked")]
    Blocked(CredentialKind),

    /// The operation needs a PIN verification or management key
    /// authentication that has not happened in this session
    #[error("Authentication required: {0}")]
    AuthenticationRequired(&'static str),

    /// The token rejected the management key
    #[error("Management key authentication failed")]
    AuthenticationFailed,

    /// The token could not prove possession of the management key
    #[error("Mutual authentication failed")]
    MutualAuthenticationFailed,

    /// Supplied management key uses a different algorithm than the token expects
    #[error("Management key algorithm mismatch: token expects {expected}, got {supplied}")]
    AlgorithmMismatch {
        /// Algorithm reported by the token
        expected: ManagementKeyAlgorithm,
        /// Algorithm of the supplied key
        supplied: ManagementKeyAlgorithm,
    },

    /// Firmware does not support the operation
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Compliance tier or slot policy forbids the request
    #[error("Rejected: {0}")]
    Rejected(&'static str),

    /// Caller misuse, such as mismatched key families
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not meaningful in the current token state
    #[error("Invalid operation: {0}")]
    InvalidOperation(&'static str),

    /// A credential source declined to supply a value
    #[error("Credential request declined")]
    CredentialDeclined,

    /// Transport-related errors
    #[error(transparent)]
    Transport(#[from] nexum_apdu_core::TransportError),

    /// APDU encoding or decoding failed
    #[error(transparent)]
    Apdu(nexum_apdu_core::Error),

    /// Status word with no meaning for the operation
    #[error("Unexpected status {0}: {desc}", desc = .0.description())]
    UnexpectedStatus(StatusWord),

    /// Malformed response from the token
    #[error("Protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// BER-TLV decoding failed
    #[error("TlvError: {0}")]
    Tlv(TlvError),
}

impl Error {
    /// Whether the error is a protocol violation (unexpected status or malformed reply)
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::UnexpectedStatus(_) | Self::ProtocolViolation(_) | Self::Tlv(_))
    }
}

impl From<TlvError> for Error {
    fn from(error: TlvError) -> Self {
        Self::Tlv(error)
    }
}

impl From<nexum_apdu_core::Error> for Error {
    fn from(error: nexum_apdu_core::Error) -> Self {
        match error {
            nexum_apdu_core::Error::Transport(inner) => Self::Transport(inner),
            other => Self::Apdu(other),
        }
    }
}
