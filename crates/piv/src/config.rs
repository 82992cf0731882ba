//! Configuration options for a PIV session

use std::time::Duration;

use crate::constants::PIN_DERIVATION_ITERATIONS;

/// Largest data field of a short APDU
pub const DEFAULT_MAX_PAYLOAD: usize = 255;

/// Configuration options for a PIV session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Largest data field sent in a single exchange. Larger commands are chained.
    pub max_payload: usize,

    /// Bound on the wait for a single reply, `None` waits indefinitely
    pub exchange_timeout: Option<Duration>,

    /// Times a whole object write is attempted when the transport fails mid-write
    pub object_write_attempts: u8,

    /// Whether the token runs in compliance (FIPS-style) mode
    pub compliance_mode: bool,

    /// PBKDF2 iterations for PIN-derived management keys
    pub pin_derivation_iterations: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            exchange_timeout: None,
            object_write_attempts: 2,
            compliance_mode: false,
            pin_derivation_iterations: PIN_DERIVATION_ITERATIONS,
        }
    }
}

impl SessionConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum single-exchange payload
    pub const fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    /// Set the per-exchange timeout
    pub const fn with_exchange_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    /// Set how many times an object write is attempted
    pub const fn with_object_write_attempts(mut self, attempts: u8) -> Self {
        self.object_write_attempts = attempts;
        self
    }

    /// Mark the token as running in compliance mode
    pub const fn with_compliance_mode(mut self, compliance_mode: bool) -> Self {
        self.compliance_mode = compliance_mode;
        self
    }

    /// Set the PBKDF2 iteration count for PIN-derived keys
    pub const fn with_pin_derivation_iterations(mut self, iterations: u32) -> Self {
        self.pin_derivation_iterations = iterations;
        self
    }
}
