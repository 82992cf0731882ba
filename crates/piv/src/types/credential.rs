use std::fmt;

use derive_more::Display;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{PIN_MIN_LEN, PIN_PADDED_LEN, PIN_PADDING};
use crate::{Error, Result};

/// Which credential an operation or failure refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum CredentialKind {
    /// Card holder PIN
    #[display("PIN")]
    Pin,
    /// PIN unblocking key
    #[display("PUK")]
    Puk,
    /// Card management key
    #[display("management key")]
    ManagementKey,
}

/// A PIN or PUK value
///
/// The bytes are wiped on drop and never shown by `Debug`.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Credential(Vec<u8>);

impl Credential {
    /// Wrap a raw value
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Self(value.into())
    }

    /// Raw value
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// No bytes at all
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check the 6..=8 byte length rule shared by PIN and PUK
    pub(crate) fn validate(&self, kind: CredentialKind) -> Result<()> {
        if (PIN_MIN_LEN..=PIN_PADDED_LEN).contains(&self.0.len()) {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "{kind} must be {PIN_MIN_LEN} to {PIN_PADDED_LEN} bytes, got {}",
                self.0.len()
            )))
        }
    }

    /// Value padded with `0xFF` to the eight byte wire format
    pub(crate) fn padded(&self) -> [u8; PIN_PADDED_LEN] {
        let mut padded = [PIN_PADDING; PIN_PADDED_LEN];
        padded[..self.0.len()].copy_from_slice(&self.0);
        padded
    }
}

impl From<&str> for Credential {
    fn from(value: &str) -> Self {
        Self::new(value.as_bytes())
    }
}

impl From<&[u8]> for Credential {
    fn from(value: &[u8]) -> Self {
        Self::new(value)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential([REDACTED; {}])", self.0.len())
    }
}

/// Remaining attempts before a credential blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RetryCounter {
    /// Attempts left
    pub remaining: u8,
    /// Configured maximum, when the token reported it
    pub max: Option<u8>,
}

impl RetryCounter {
    /// Counter from its two readings
    pub const fn new(remaining: u8, max: Option<u8>) -> Self {
        Self { remaining, max }
    }

    /// No attempts left
    pub const fn is_blocked(&self) -> bool {
        self.remaining == 0
    }
}

impl fmt::Display for RetryCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max {
            Some(max) => write!(f, "{}/{}", self.remaining, max),
            None => write!(f, "{}", self.remaining),
        }
    }
}
