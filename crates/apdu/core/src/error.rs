//! Core error type for APDU encoding and decoding

use crate::transport::TransportError;

/// Result type for APDU operations
pub type Result<T> = core::result::Result<T, Error>;

/// Core error type for APDU encoding, decoding and transport
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport failure while exchanging an APDU
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Response shorter than a status word
    #[error("Response too short: {0} bytes")]
    IncompleteResponse(usize),

    /// Raw command whose length fields do not match its size
    #[error("Invalid command length: {0}")]
    InvalidCommandLength(usize),
}
