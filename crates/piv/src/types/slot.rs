use derive_more::Display;

use crate::{Error, Result};

/// PIN requirement for using a slot's private key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display)]
pub enum PinPolicy {
    /// Whatever the slot's default is
    #[default]
    Default,
    /// Never needs the PIN
    Never,
    /// Once per session
    Once,
    /// Before every private key operation
    Always,
}

impl PinPolicy {
    /// Wire encoding
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Default => 0x00,
            Self::Never => 0x01,
            Self::Once => 0x02,
            Self::Always => 0x03,
        }
    }

    /// Parse the wire encoding
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x00 => Ok(Self::Default),
            0x01 => Ok(Self::Never),
            0x02 => Ok(Self::Once),
            0x03 => Ok(Self::Always),
            _ => Err(Error::ProtocolViolation("unknown PIN policy")),
        }
    }
}

/// Touch requirement for using a slot's private key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display)]
pub enum TouchPolicy {
    /// Whatever the slot's default is
    #[default]
    Default,
    /// Never needs a touch
    Never,
    /// Every operation needs a touch
    Always,
    /// Touch is cached for 15 seconds
    Cached,
}

impl TouchPolicy {
    /// Wire encoding
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Default => 0x00,
            Self::Never => 0x01,
            Self::Always => 0x02,
            Self::Cached => 0x03,
        }
    }

    /// Parse the wire encoding
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x00 => Ok(Self::Default),
            0x01 => Ok(Self::Never),
            0x02 => Ok(Self::Always),
            0x03 => Ok(Self::Cached),
            _ => Err(Error::ProtocolViolation("unknown touch policy")),
        }
    }
}

/// How the key in a slot came to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum KeyStatus {
    /// Generated on the token
    Generated,
    /// Imported from the host
    Imported,
}

impl KeyStatus {
    /// Parse the metadata encoding
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x01 => Ok(Self::Generated),
            0x02 => Ok(Self::Imported),
            _ => Err(Error::ProtocolViolation("unknown key origin")),
        }
    }

    /// Metadata encoding
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Generated => 0x01,
            Self::Imported => 0x02,
        }
    }
}

/// Key slot reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
pub enum SlotId {
    /// 9A, PIV authentication
    #[display("9A")]
    Authentication,
    /// 9C, digital signature
    #[display("9C")]
    Signature,
    /// 9D, key management
    #[display("9D")]
    KeyManagement,
    /// 9E, card authentication
    #[display("9E")]
    CardAuthentication,
    /// 82..=95, retired key management
    #[display("{_0:02X}")]
    Retired(u8),
    /// F9, vendor attestation key
    #[display("F9")]
    Attestation,
}

impl SlotId {
    /// Every slot that holds a private key, in reference order
    pub fn all() -> impl Iterator<Item = Self> {
        [
            Self::Authentication,
            Self::Signature,
            Self::KeyManagement,
            Self::CardAuthentication,
            Self::Attestation,
        ]
        .into_iter()
        .chain((0x82..=0x95).map(Self::Retired))
    }

    /// Retired key management slot `index` (1 to 20)
    pub fn retired(index: u8) -> Result<Self> {
        if (1..=20).contains(&index) {
            Ok(Self::Retired(0x81 + index))
        } else {
            Err(Error::InvalidArgument(format!(
                "retired slot index {index} out of range 1..=20"
            )))
        }
    }

    /// Key reference byte
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Authentication => 0x9A,
            Self::Signature => 0x9C,
            Self::KeyManagement => 0x9D,
            Self::CardAuthentication => 0x9E,
            Self::Retired(reference) => reference,
            Self::Attestation => 0xF9,
        }
    }

    /// Data object holding the slot's certificate
    pub const fn certificate_object(self) -> u32 {
        match self {
            Self::Authentication => 0x5F_C105,
            Self::Signature => 0x5F_C10A,
            Self::KeyManagement => 0x5F_C10B,
            Self::CardAuthentication => 0x5F_C101,
            Self::Retired(reference) => 0x5F_C10D + reference.saturating_sub(0x82) as u32,
            Self::Attestation => 0x5F_FF01,
        }
    }

    /// PIN policy the token applies when a key is stored with [`PinPolicy::Default`]
    pub const fn default_pin_policy(self) -> PinPolicy {
        match self {
            Self::Signature => PinPolicy::Always,
            Self::CardAuthentication | Self::Attestation => PinPolicy::Never,
            _ => PinPolicy::Once,
        }
    }

    /// Touch policy the token applies when a key is stored with [`TouchPolicy::Default`]
    pub const fn default_touch_policy(self) -> TouchPolicy {
        TouchPolicy::Never
    }

    /// Replace `Default` with the slot's concrete PIN policy
    pub const fn resolve_pin_policy(self, policy: PinPolicy) -> PinPolicy {
        match policy {
            PinPolicy::Default => self.default_pin_policy(),
            other => other,
        }
    }

    /// Replace `Default` with the slot's concrete touch policy
    pub const fn resolve_touch_policy(self, policy: TouchPolicy) -> TouchPolicy {
        match policy {
            TouchPolicy::Default => self.default_touch_policy(),
            other => other,
        }
    }
}

impl TryFrom<u8> for SlotId {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self> {
        match byte {
            0x9A => Ok(Self::Authentication),
            0x9C => Ok(Self::Signature),
            0x9D => Ok(Self::KeyManagement),
            0x9E => Ok(Self::CardAuthentication),
            0x82..=0x95 => Ok(Self::Retired(byte)),
            0xF9 => Ok(Self::Attestation),
            _ => Err(Error::InvalidArgument(format!("{byte:#04x} is not a key slot"))),
        }
    }
}
