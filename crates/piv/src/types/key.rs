use std::fmt;

use iso7816_tlv::ber::Tlv;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::constants::tags;
use crate::tlv::{find_primitive, parse_all};
use crate::types::{KeyFamily, KeyType};
use crate::{Error, Result};

/// Public half of a slot key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKey {
    /// RSA modulus and public exponent
    Rsa {
        /// One of the RSA key types
        key_type: KeyType,
        /// Big-endian modulus
        modulus: Vec<u8>,
        /// Big-endian public exponent
        exponent: Vec<u8>,
    },
    /// Uncompressed SEC1 point for the NIST curves, raw 32 bytes for Curve25519 keys
    Ecc {
        /// Curve of the point
        key_type: KeyType,
        /// Encoded point
        point: Vec<u8>,
    },
}

impl PublicKey {
    /// Key type of the slot key
    pub const fn key_type(&self) -> KeyType {
        match self {
            Self::Rsa { key_type, .. } | Self::Ecc { key_type, .. } => *key_type,
        }
    }

    /// Family used to match peers in key agreement
    pub const fn family(&self) -> KeyFamily {
        self.key_type().family()
    }

    /// Decode the children of a public key template (`7F49` or metadata `04`)
    pub(crate) fn from_template(key_type: KeyType, children: &[Tlv]) -> Result<Self> {
        if key_type.is_rsa() {
            let modulus = find_primitive(children, tags::RSA_MODULUS)?
                .ok_or(Error::ProtocolViolation("public key without modulus"))?;
            let exponent = find_primitive(children, tags::RSA_EXPONENT)?
                .ok_or(Error::ProtocolViolation("public key without exponent"))?;
            return Ok(Self::Rsa {
                key_type,
                modulus: modulus.to_vec(),
                exponent: exponent.to_vec(),
            });
        }

        let point = find_primitive(children, tags::EC_POINT)?
            .ok_or(Error::ProtocolViolation("public key without point"))?;
        let expected = match key_type.family() {
            KeyFamily::EccP256 | KeyFamily::EccP384 => 1 + 2 * key_type.size(),
            _ => key_type.size(),
        };
        if point.len() != expected {
            return Err(Error::ProtocolViolation("public key point has the wrong length"));
        }

        Ok(Self::Ecc {
            key_type,
            point: point.to_vec(),
        })
    }

    /// Decode a public key template given as raw TLV bytes
    pub(crate) fn from_template_bytes(key_type: KeyType, bytes: &[u8]) -> Result<Self> {
        Self::from_template(key_type, &parse_all(bytes)?)
    }
}

/// Private key material for import
///
/// All components are wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub enum PrivateKey {
    /// RSA CRT components, each half the modulus length
    Rsa {
        /// One of the RSA key types
        #[zeroize(skip)]
        key_type: KeyType,
        /// First prime
        p: Vec<u8>,
        /// Second prime
        q: Vec<u8>,
        /// d mod (p - 1)
        dp: Vec<u8>,
        /// d mod (q - 1)
        dq: Vec<u8>,
        /// q^-1 mod p
        qinv: Vec<u8>,
    },
    /// Private scalar for the NIST curves
    Ecc {
        /// Curve of the scalar
        #[zeroize(skip)]
        key_type: KeyType,
        /// Big-endian private scalar
        scalar: Vec<u8>,
    },
    /// Ed25519 signing key
    Ed25519 {
        /// 32 byte seed
        seed: Vec<u8>,
    },
    /// X25519 agreement key
    X25519 {
        /// 32 byte scalar
        scalar: Vec<u8>,
    },
}

impl PrivateKey {
    /// Key type the slot will report
    pub const fn key_type(&self) -> KeyType {
        match self {
            Self::Rsa { key_type, .. } | Self::Ecc { key_type, .. } => *key_type,
            Self::Ed25519 { .. } => KeyType::Ed25519,
            Self::X25519 { .. } => KeyType::X25519,
        }
    }

    /// Check component lengths against the key type
    pub(crate) fn validate(&self) -> Result<()> {
        let key_type = self.key_type();
        let ok = match self {
            Self::Rsa { p, q, dp, dq, qinv, .. } => {
                key_type.is_rsa()
                    && [p, q, dp, dq, qinv]
                        .iter()
                        .all(|part| !part.is_empty() && part.len() <= key_type.size() / 2)
            }
            Self::Ecc { scalar, .. } => {
                matches!(key_type, KeyType::EccP256 | KeyType::EccP384)
                    && scalar.len() == key_type.size()
            }
            Self::Ed25519 { seed: bytes } | Self::X25519 { scalar: bytes } => bytes.len() == 32,
        };

        if ok {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "private key components do not match {key_type}"
            )))
        }
    }

    /// Encode the import data field, policies excluded
    pub(crate) fn encode(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::new());
        match self {
            Self::Rsa { key_type, p, q, dp, dq, qinv } => {
                let width = key_type.size() / 2;
                for (tag, part) in [
                    (tags::IMPORT_RSA_P, p),
                    (tags::IMPORT_RSA_Q, q),
                    (tags::IMPORT_RSA_DP, dp),
                    (tags::IMPORT_RSA_DQ, dq),
                    (tags::IMPORT_RSA_QINV, qinv),
                ] {
                    // Components are left padded to half the modulus length
                    let mut padded = Zeroizing::new(vec![0u8; width - part.len()]);
                    padded.extend_from_slice(part);
                    crate::tlv::write(&mut out, &[tag], &padded);
                }
            }
            Self::Ecc { scalar, .. } => crate::tlv::write(&mut out, &[tags::IMPORT_EC_PRIVATE], scalar),
            Self::Ed25519 { seed } => crate::tlv::write(&mut out, &[tags::IMPORT_ED25519], seed),
            Self::X25519 { scalar } => crate::tlv::write(&mut out, &[tags::IMPORT_X25519], scalar),
        }
        out
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("key_type", &self.key_type())
            .field("material", &"[REDACTED]")
            .finish()
    }
}

/// Output of a key agreement, wiped on drop
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret(Vec<u8>);

impl SharedSecret {
    pub(crate) const fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Raw shared secret
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSecret([REDACTED; {}])", self.0.len())
    }
}

/// Raw signature bytes as returned by the token
///
/// DER encoded for ECDSA, raw for RSA and Ed25519.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature(pub Vec<u8>);

impl AsRef<[u8]> for Signature {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
