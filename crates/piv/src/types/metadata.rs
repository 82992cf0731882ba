use iso7816_tlv::ber::Tlv;

use crate::constants::tags;
use crate::tlv::{find_primitive, parse_all};
use crate::types::{
    KeyStatus, KeyType, ManagementKeyAlgorithm, PinPolicy, PublicKey, RetryCounter, TouchPolicy,
};
use crate::{Error, Result};

/// Metadata reported by the token for a key slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotMetadata {
    /// Algorithm of the stored key
    pub key_type: KeyType,
    /// Effective PIN policy
    pub pin_policy: PinPolicy,
    /// Effective touch policy
    pub touch_policy: TouchPolicy,
    /// Generated on the token or imported
    pub key_status: KeyStatus,
    /// Public half, when the token reports it
    pub public_key: Option<PublicKey>,
    /// Only reported for credential references
    pub retry_count: Option<RetryCounter>,
}

/// Metadata reported by the token for the PIN or PUK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CredentialMetadata {
    /// Whether the credential still has its factory value
    pub is_default: bool,
    /// Remaining and configured attempts
    pub retries: RetryCounter,
}

/// Metadata reported by the token for the management key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagementKeyMetadata {
    /// Algorithm of the current key
    pub algorithm: ManagementKeyAlgorithm,
    /// Whether the key still has its factory value
    pub is_default: bool,
    /// Touch requirement for authentication
    pub touch_policy: TouchPolicy,
}

fn single_byte(tlvs: &[Tlv], tag: u8) -> Result<Option<u8>> {
    match find_primitive(tlvs, tag)? {
        Some([byte]) => Ok(Some(*byte)),
        Some(_) => Err(Error::ProtocolViolation("metadata field has the wrong length")),
        None => Ok(None),
    }
}

fn policy_pair(tlvs: &[Tlv]) -> Result<(PinPolicy, TouchPolicy)> {
    match find_primitive(tlvs, tags::METADATA_POLICY)? {
        Some([pin, touch]) => Ok((PinPolicy::from_byte(*pin)?, TouchPolicy::from_byte(*touch)?)),
        Some(_) => Err(Error::ProtocolViolation("metadata policy has the wrong length")),
        None => Ok((PinPolicy::Default, TouchPolicy::Default)),
    }
}

fn retries(tlvs: &[Tlv]) -> Result<Option<RetryCounter>> {
    match find_primitive(tlvs, tags::METADATA_RETRIES)? {
        Some([total, remaining]) => Ok(Some(RetryCounter::new(*remaining, Some(*total)))),
        Some(_) => Err(Error::ProtocolViolation("metadata retries has the wrong length")),
        None => Ok(None),
    }
}

impl SlotMetadata {
    pub(crate) fn parse(data: &[u8]) -> Result<Self> {
        let tlvs = parse_all(data)?;
        let key_type = single_byte(&tlvs, tags::METADATA_ALGORITHM)?
            .ok_or(Error::ProtocolViolation("slot metadata without algorithm"))
            .and_then(KeyType::from_id)?;
        let (pin_policy, touch_policy) = policy_pair(&tlvs)?;
        let key_status = single_byte(&tlvs, tags::METADATA_ORIGIN)?
            .ok_or(Error::ProtocolViolation("slot metadata without origin"))
            .and_then(KeyStatus::from_byte)?;
        let public_key = find_primitive(&tlvs, tags::METADATA_PUBLIC_KEY)?
            .map(|bytes| PublicKey::from_template_bytes(key_type, bytes))
            .transpose()?;

        Ok(Self {
            key_type,
            pin_policy,
            touch_policy,
            key_status,
            public_key,
            retry_count: retries(&tlvs)?,
        })
    }
}

impl CredentialMetadata {
    pub(crate) fn parse(data: &[u8]) -> Result<Self> {
        let tlvs = parse_all(data)?;
        Ok(Self {
            is_default: single_byte(&tlvs, tags::METADATA_IS_DEFAULT)?.is_some_and(|b| b != 0),
            retries: retries(&tlvs)?
                .ok_or(Error::ProtocolViolation("credential metadata without retries"))?,
        })
    }
}

impl ManagementKeyMetadata {
    pub(crate) fn parse(data: &[u8]) -> Result<Self> {
        let tlvs = parse_all(data)?;
        let algorithm = match single_byte(&tlvs, tags::METADATA_ALGORITHM)? {
            Some(id) => ManagementKeyAlgorithm::from_id(id)?,
            // Tokens before AES support report no algorithm
            None => ManagementKeyAlgorithm::TripleDes,
        };
        Ok(Self {
            algorithm,
            is_default: single_byte(&tlvs, tags::METADATA_IS_DEFAULT)?.is_some_and(|b| b != 0),
            // Only the touch byte is meaningful for the management key
            touch_policy: match find_primitive(&tlvs, tags::METADATA_POLICY)? {
                Some([_, touch]) => TouchPolicy::from_byte(*touch)?,
                Some(_) => return Err(Error::ProtocolViolation("metadata policy has the wrong length")),
                None => TouchPolicy::Default,
            },
        })
    }
}
