use derive_more::Display;

use crate::{Error, Result};

/// Symmetric algorithm of the management key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ManagementKeyAlgorithm {
    /// Three-key TripleDES
    #[display("3DES")]
    TripleDes,
    /// AES with a 16 byte key
    #[display("AES-128")]
    Aes128,
    /// AES with a 24 byte key
    #[display("AES-192")]
    Aes192,
    /// AES with a 32 byte key
    #[display("AES-256")]
    Aes256,
}

impl ManagementKeyAlgorithm {
    /// Algorithm identifier used in GENERAL AUTHENTICATE and SET MANAGEMENT KEY
    pub const fn id(self) -> u8 {
        match self {
            Self::TripleDes => 0x03,
            Self::Aes128 => 0x08,
            Self::Aes192 => 0x0A,
            Self::Aes256 => 0x0C,
        }
    }

    /// Parse an algorithm identifier
    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            0x03 => Ok(Self::TripleDes),
            0x08 => Ok(Self::Aes128),
            0x0A => Ok(Self::Aes192),
            0x0C => Ok(Self::Aes256),
            _ => Err(Error::ProtocolViolation("unknown management key algorithm")),
        }
    }

    /// Key length in bytes
    pub const fn key_len(self) -> usize {
        match self {
            Self::TripleDes | Self::Aes192 => 24,
            Self::Aes128 => 16,
            Self::Aes256 => 32,
        }
    }

    /// Cipher block length, which is also the challenge length
    pub const fn block_len(self) -> usize {
        match self {
            Self::TripleDes => 8,
            _ => 16,
        }
    }

    /// Any of the AES variants
    pub const fn is_aes(self) -> bool {
        !matches!(self, Self::TripleDes)
    }
}

/// Asymmetric key type held in a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum KeyType {
    /// RSA with a 1024 bit modulus
    #[display("RSA-1024")]
    Rsa1024,
    /// RSA with a 2048 bit modulus
    #[display("RSA-2048")]
    Rsa2048,
    /// RSA with a 3072 bit modulus
    #[display("RSA-3072")]
    Rsa3072,
    /// RSA with a 4096 bit modulus
    #[display("RSA-4096")]
    Rsa4096,
    /// ECDSA and ECDH on P-256
    #[display("ECC-P256")]
    EccP256,
    /// ECDSA and ECDH on P-384
    #[display("ECC-P384")]
    EccP384,
    /// EdDSA signing key
    #[display("Ed25519")]
    Ed25519,
    /// Curve25519 agreement key
    #[display("X25519")]
    X25519,
}

/// Key families that can take part in the same operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFamily {
    /// Any RSA size
    Rsa,
    /// P-256
    EccP256,
    /// P-384
    EccP384,
    /// Ed25519
    Ed25519,
    /// X25519
    X25519,
}

impl KeyType {
    /// Algorithm identifier used in generate, import, sign and metadata
    pub const fn id(self) -> u8 {
        match self {
            Self::Rsa1024 => 0x06,
            Self::Rsa2048 => 0x07,
            Self::Rsa3072 => 0x05,
            Self::Rsa4096 => 0x16,
            Self::EccP256 => 0x11,
            Self::EccP384 => 0x14,
            Self::Ed25519 => 0xE0,
            Self::X25519 => 0xE1,
        }
    }

    /// Parse an algorithm identifier
    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            0x06 => Ok(Self::Rsa1024),
            0x07 => Ok(Self::Rsa2048),
            0x05 => Ok(Self::Rsa3072),
            0x16 => Ok(Self::Rsa4096),
            0x11 => Ok(Self::EccP256),
            0x14 => Ok(Self::EccP384),
            0xE0 => Ok(Self::Ed25519),
            0xE1 => Ok(Self::X25519),
            _ => Err(Error::ProtocolViolation("unknown key algorithm")),
        }
    }

    /// Family of the key type
    pub const fn family(self) -> KeyFamily {
        match self {
            Self::Rsa1024 | Self::Rsa2048 | Self::Rsa3072 | Self::Rsa4096 => KeyFamily::Rsa,
            Self::EccP256 => KeyFamily::EccP256,
            Self::EccP384 => KeyFamily::EccP384,
            Self::Ed25519 => KeyFamily::Ed25519,
            Self::X25519 => KeyFamily::X25519,
        }
    }

    /// Any of the RSA sizes
    pub const fn is_rsa(self) -> bool {
        matches!(self.family(), KeyFamily::Rsa)
    }

    /// Length in bytes of the modulus (RSA) or of a field element / private scalar
    pub const fn size(self) -> usize {
        match self {
            Self::Rsa1024 => 128,
            Self::Rsa2048 => 256,
            Self::Rsa3072 => 384,
            Self::Rsa4096 => 512,
            Self::EccP256 | Self::Ed25519 | Self::X25519 => 32,
            Self::EccP384 => 48,
        }
    }

    /// Whether the private key can sign
    pub const fn can_sign(self) -> bool {
        !matches!(self, Self::X25519)
    }

    /// Whether the private key can take part in key agreement
    pub const fn can_agree(self) -> bool {
        matches!(self, Self::EccP256 | Self::EccP384 | Self::X25519)
    }
}
