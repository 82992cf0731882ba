//! Failures below the APDU layer

/// Failure of the physical or simulated link to the card
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// No card or reader to talk to
    #[error("Card not connected")]
    Connection,

    /// The command left but no complete reply came back
    #[error("Transmission failed")]
    Transmission,

    /// No reply within the configured bound
    #[error("Exchange timed out")]
    Timeout,

    /// The caller or the reader aborted the exchange
    #[error("Exchange cancelled")]
    Cancelled,

    /// Reader-specific failure
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Reader-specific failure with a message
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}
