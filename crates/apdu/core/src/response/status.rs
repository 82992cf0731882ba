//! Status word (SW1 SW2) handling

use std::fmt;

use tracing::Level;

/// Status word trailing every response APDU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusWord {
    /// SW1
    pub sw1: u8,
    /// SW2
    pub sw2: u8,
}

impl StatusWord {
    /// Status word from its two bytes
    pub const fn new(sw1: u8, sw2: u8) -> Self {
        Self { sw1, sw2 }
    }

    /// Status word from its big-endian `u16` form
    pub const fn from_u16(status: u16) -> Self {
        Self::new((status >> 8) as u8, status as u8)
    }

    /// Big-endian `u16` form
    pub const fn to_u16(&self) -> u16 {
        u16::from_be_bytes([self.sw1, self.sw2])
    }

    /// `90 00`
    pub const fn is_success(&self) -> bool {
        matches!((self.sw1, self.sw2), (0x90, 0x00))
    }

    /// Bytes still waiting for GET RESPONSE after a `61 XX` reply.
    /// `00` stands for 256 or more.
    pub const fn remaining_bytes(&self) -> Option<u8> {
        match self.sw1 {
            0x61 => Some(self.sw2),
            _ => None,
        }
    }

    /// Verification attempts left according to a `63 CX` reply
    pub const fn retries_remaining(&self) -> Option<u8> {
        match (self.sw1, self.sw2 & 0xF0) {
            (0x63, 0xC0) => Some(self.sw2 & 0x0F),
            _ => None,
        }
    }

    /// Level at which an exchange ending in this status is logged
    pub const fn tracing_level(&self) -> Level {
        match self.sw1 {
            0x90 | 0x61 => Level::DEBUG,
            // Warning processing
            0x62 | 0x63 => Level::INFO,
            _ => Level::WARN,
        }
    }

    /// Short ISO 7816-4 meaning, for logs and error messages
    pub const fn description(&self) -> &'static str {
        match (self.sw1, self.sw2) {
            (0x90, 0x00) => "Success",
            (0x61, _) => "More data available",
            (0x63, sw2) if sw2 & 0xF0 == 0xC0 => "Verification failed",
            (0x65, 0x81) => "Memory failure",
            (0x67, 0x00) => "Wrong length",
            (0x68, 0x84) => "Command chaining not supported",
            (0x69, 0x82) => "Security status not satisfied",
            (0x69, 0x83) => "Authentication method blocked",
            (0x69, 0x85) => "Conditions of use not satisfied",
            (0x6A, 0x80) => "Incorrect data field",
            (0x6A, 0x81) => "Function not supported",
            (0x6A, 0x82) => "File or application not found",
            (0x6A, 0x84) => "Not enough memory",
            (0x6A, 0x86) => "Incorrect P1-P2",
            (0x6A, 0x88) => "Referenced data not found",
            (0x6B, 0x00) => "Wrong P1-P2",
            (0x6D, 0x00) => "Instruction not supported",
            (0x6E, 0x00) => "Class not supported",
            _ => "Unknown status word",
        }
    }
}

impl From<u16> for StatusWord {
    fn from(status: u16) -> Self {
        Self::from_u16(status)
    }
}

impl From<StatusWord> for u16 {
    fn from(status: StatusWord) -> Self {
        status.to_u16()
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}{:02X}", self.sw1, self.sw2)
    }
}

/// Status words the session layer produces or matches on
pub mod common {
    use super::StatusWord;

    /// `90 00`
    pub const SUCCESS: StatusWord = StatusWord::new(0x90, 0x00);
    /// `67 00`
    pub const WRONG_LENGTH: StatusWord = StatusWord::new(0x67, 0x00);
    /// `69 82`
    pub const SECURITY_STATUS_NOT_SATISFIED: StatusWord = StatusWord::new(0x69, 0x82);
    /// `69 83`
    pub const AUTHENTICATION_BLOCKED: StatusWord = StatusWord::new(0x69, 0x83);
    /// `6A 82`
    pub const NOT_FOUND: StatusWord = StatusWord::new(0x6A, 0x82);

    /// `63 CX`
    pub const fn wrong_value(retries: u8) -> StatusWord {
        StatusWord::new(0x63, 0xC0 | (retries & 0x0F))
    }
}
