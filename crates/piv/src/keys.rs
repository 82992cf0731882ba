//! Key slot lifecycle: generate, import, sign, key agreement and metadata

use nexum_apdu_core::prelude::*;
use sha2::{Digest, Sha256, Sha384};
use tracing::{debug, info, instrument};

use crate::auth::AuthState;
use crate::channel::{CommandChannel, FailureCode, Reply, StatusCategory};
use crate::constants::{CLA, ins, tags};
use crate::policy::{Feature, TokenPolicy};
use crate::types::{
    KeyFamily, KeyType, PinPolicy, PrivateKey, PublicKey, SharedSecret, Signature, SlotId,
    SlotMetadata, TouchPolicy,
};
use crate::{Error, Result, tlv};

const SHA256_DIGEST_INFO: &[u8] = &[
    0x30, 0x31, 0x30, 0x0D, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01, 0x05,
    0x00, 0x04, 0x20,
];
const SHA384_DIGEST_INFO: &[u8] = &[
    0x30, 0x41, 0x30, 0x0D, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x02, 0x05,
    0x00, 0x04, 0x30,
];
const SHA512_DIGEST_INFO: &[u8] = &[
    0x30, 0x51, 0x30, 0x0D, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x03, 0x05,
    0x00, 0x04, 0x40,
];

/// Operations on the private keys held in slots
#[derive(Debug)]
pub struct KeySlotManager<'a, T: CardTransport> {
    channel: &'a mut CommandChannel<T>,
    state: &'a mut AuthState,
    policy: TokenPolicy,
}

impl<'a, T: CardTransport> KeySlotManager<'a, T> {
    pub(crate) fn new(
        channel: &'a mut CommandChannel<T>,
        state: &'a mut AuthState,
        policy: TokenPolicy,
    ) -> Self {
        Self { channel, state, policy }
    }

    fn require_management_key(&self, operation: &'static str) -> Result<()> {
        if self.state.is_management_key_authenticated() {
            Ok(())
        } else {
            debug!(operation, "Management key not authenticated");
            Err(Error::AuthenticationRequired(operation))
        }
    }

    /// Generate a key pair in `slot` and return its public key
    #[instrument(level = "debug", skip(self))]
    pub fn generate(
        &mut self,
        slot: SlotId,
        key_type: KeyType,
        pin_policy: PinPolicy,
        touch_policy: TouchPolicy,
    ) -> Result<PublicKey> {
        self.policy.check_key_type(key_type)?;
        self.policy.check_key_policies(pin_policy, touch_policy)?;
        self.require_management_key("key generation requires management key authentication")?;

        let mut template = vec![];
        tlv::write(&mut template, &[tags::ALGORITHM], &[key_type.id()]);
        write_policies(&mut template, pin_policy, touch_policy);
        let mut data = vec![];
        tlv::write(&mut data, &[tags::GENERATE_TEMPLATE], &template);

        let command =
            Command::new_with_data(CLA, ins::GENERATE_ASYMMETRIC, 0x00, slot.to_byte(), data)
                .with_le(256);
        let payload = self.channel.exchange(&command)?.into_result()?;
        let template = tlv::unwrap_exact(&payload, &tags::PUBLIC_KEY_TEMPLATE)?;
        let public_key = PublicKey::from_template_bytes(key_type, template)?;

        self.state
            .remember_slot(slot, key_type, slot.resolve_pin_policy(pin_policy));
        info!(%slot, %key_type, "Key generated");
        Ok(public_key)
    }

    /// Import a private key into `slot`
    #[instrument(level = "debug", skip(self, key), fields(key_type = %key.key_type()))]
    pub fn import_private_key(
        &mut self,
        slot: SlotId,
        key: &PrivateKey,
        pin_policy: PinPolicy,
        touch_policy: TouchPolicy,
    ) -> Result<()> {
        key.validate()?;
        let key_type = key.key_type();
        self.policy.check_key_type(key_type)?;
        self.policy.check_key_policies(pin_policy, touch_policy)?;
        self.require_management_key("key import requires management key authentication")?;

        let mut data = key.encode();
        write_policies(&mut data, pin_policy, touch_policy);
        let command = Command::new_with_data(
            CLA,
            ins::IMPORT_KEY,
            key_type.id(),
            slot.to_byte(),
            data.to_vec(),
        );
        self.channel.exchange_chained(&command)?.into_result()?;

        self.state
            .remember_slot(slot, key_type, slot.resolve_pin_policy(pin_policy));
        info!(%slot, "Private key imported");
        Ok(())
    }

    /// Store a DER certificate in the slot's certificate object
    #[instrument(level = "debug", skip(self, certificate), fields(len = certificate.len()))]
    pub fn import_certificate(&mut self, slot: SlotId, certificate: &[u8]) -> Result<()> {
        if certificate.is_empty() {
            return Err(Error::InvalidArgument("certificate is empty".into()));
        }
        self.require_management_key("certificate import requires management key authentication")?;

        let mut value = Vec::with_capacity(certificate.len() + 10);
        tlv::write(&mut value, &[tags::CERTIFICATE], certificate);
        tlv::write(&mut value, &[tags::CERT_INFO], &[0x00]);
        tlv::write(&mut value, &[tags::LRC], &[]);
        self.channel.write_object(slot.certificate_object(), &value)?;
        info!(%slot, "Certificate imported");
        Ok(())
    }

    /// DER certificate stored for `slot`, `None` if there is none
    pub fn read_certificate(&mut self, slot: SlotId) -> Result<Option<Vec<u8>>> {
        let object = self.channel.read_object(slot.certificate_object())?;
        let mut rest: &[u8] = &object;
        while !rest.is_empty() {
            let (tag, value, remaining) = tlv::split(rest)?;
            if tag == [tags::CERTIFICATE] {
                return Ok(Some(value.to_vec()));
            }
            rest = remaining;
        }
        Ok(None)
    }

    /// Clear the slot's certificate object
    pub fn delete_certificate(&mut self, slot: SlotId) -> Result<()> {
        self.require_management_key("certificate deletion requires management key authentication")?;
        self.channel.write_object(slot.certificate_object(), &[])
    }

    /// Slot metadata, `None` for an empty slot
    pub fn metadata(&mut self, slot: SlotId) -> Result<Option<SlotMetadata>> {
        self.policy.require(Feature::Metadata)?;
        let Some(data) = self.channel.metadata(slot.to_byte())? else {
            return Ok(None);
        };
        let metadata = SlotMetadata::parse(&data)?;
        self.state.remember_slot(
            slot,
            metadata.key_type,
            slot.resolve_pin_policy(metadata.pin_policy),
        );
        Ok(Some(metadata))
    }

    /// Key type and effective PIN policy of a slot
    ///
    /// Metadata is authoritative when the firmware has it. Otherwise only
    /// slots populated in this session are known.
    fn slot_profile(&mut self, slot: SlotId) -> Result<Option<(KeyType, PinPolicy)>> {
        if self.policy.supports(Feature::Metadata) {
            return match self.metadata(slot)? {
                Some(metadata) => Ok(Some((
                    metadata.key_type,
                    slot.resolve_pin_policy(metadata.pin_policy),
                ))),
                None => Err(Error::InvalidOperation("no key in slot")),
            };
        }
        Ok(self
            .state
            .cached_slot(slot)
            .map(|cached| (cached.key_type, cached.pin_policy)))
    }

    /// Fail fast unless the PIN policy is satisfied in this session
    fn check_pin_policy(&self, pin_policy: PinPolicy) -> Result<()> {
        match pin_policy {
            PinPolicy::Never => Ok(()),
            PinPolicy::Always if !self.state.is_pin_fresh() => Err(Error::AuthenticationRequired(
                "slot policy requires a fresh PIN verification",
            )),
            _ if !self.state.is_pin_verified() => Err(Error::AuthenticationRequired(
                "slot policy requires PIN verification",
            )),
            _ => Ok(()),
        }
    }

    /// Sign a digest or raw input with the key in `slot`
    ///
    /// RSA inputs of SHA-256/384/512 digest length are PKCS#1 v1.5 padded,
    /// full-length inputs are used as-is. ECDSA digests are fitted to the
    /// curve size. Ed25519 signs the input as the message.
    pub fn sign(&mut self, slot: SlotId, input: &[u8]) -> Result<Signature> {
        let (key_type, pin_policy) = self
            .slot_profile(slot)?
            .ok_or(Error::InvalidOperation("key type of slot unknown, use sign_as"))?;
        self.sign_with(slot, key_type, pin_policy, input)
    }

    /// Sign when the slot's key type is known to the caller
    ///
    /// For firmware without metadata and slots not populated in this session.
    pub fn sign_as(&mut self, slot: SlotId, key_type: KeyType, input: &[u8]) -> Result<Signature> {
        let pin_policy = match self.slot_profile(slot)? {
            Some((actual, _)) if actual != key_type => {
                return Err(Error::InvalidArgument(format!(
                    "slot {slot} holds a {actual} key, not {key_type}"
                )));
            }
            Some((_, pin_policy)) => pin_policy,
            None => slot.default_pin_policy(),
        };
        self.sign_with(slot, key_type, pin_policy, input)
    }

    /// Hash `message` for the slot's key type and sign the digest
    ///
    /// SHA-256 for RSA and P-256, SHA-384 for P-384. Ed25519 signs the message
    /// directly.
    pub fn sign_message(&mut self, slot: SlotId, message: &[u8]) -> Result<Signature> {
        let (key_type, pin_policy) = self
            .slot_profile(slot)?
            .ok_or(Error::InvalidOperation("key type of slot unknown, use sign_as"))?;
        let digest = match key_type.family() {
            KeyFamily::Ed25519 => message.to_vec(),
            KeyFamily::EccP384 => Sha384::digest(message).to_vec(),
            _ => Sha256::digest(message).to_vec(),
        };
        self.sign_with(slot, key_type, pin_policy, &digest)
    }

    #[instrument(level = "debug", skip(self, input), fields(len = input.len()))]
    fn sign_with(
        &mut self,
        slot: SlotId,
        key_type: KeyType,
        pin_policy: PinPolicy,
        input: &[u8],
    ) -> Result<Signature> {
        if !key_type.can_sign() {
            return Err(Error::InvalidArgument(format!("{key_type} keys cannot sign")));
        }
        let prepared = prepare_sign_input(key_type, input)?;
        self.check_pin_policy(pin_policy)?;

        let data = tlv::dynamic_auth(vec![
            tlv::primitive(tags::AUTH_RESPONSE, vec![])?,
            tlv::primitive(tags::AUTH_CHALLENGE, prepared)?,
        ])?;
        let reply = self.private_key_operation(slot, key_type, pin_policy, data)?;
        let signature = tlv::dynamic_auth_item(&reply, tags::AUTH_RESPONSE)?;
        debug!(%slot, len = signature.len(), "Signed");
        Ok(Signature(signature))
    }

    /// ECDH or X25519 agreement between the slot key and `peer`
    #[instrument(level = "debug", skip(self, peer), fields(peer = %peer.key_type()))]
    pub fn key_agree(&mut self, slot: SlotId, peer: &PublicKey) -> Result<SharedSecret> {
        let PublicKey::Ecc { key_type: peer_type, point } = peer else {
            return Err(Error::InvalidArgument("key agreement needs an elliptic curve peer key".into()));
        };
        if !peer_type.can_agree() {
            return Err(Error::InvalidArgument(format!("{peer_type} keys cannot agree")));
        }

        let (key_type, pin_policy) = match self.slot_profile(slot)? {
            Some(profile) => profile,
            // Unknown slot on old firmware, the token reports an empty slot
            None => (*peer_type, slot.default_pin_policy()),
        };
        if key_type.family() != peer_type.family() {
            return Err(Error::InvalidArgument(format!(
                "slot {slot} holds a {key_type} key, peer key is {peer_type}"
            )));
        }
        self.check_pin_policy(pin_policy)?;

        let data = tlv::dynamic_auth(vec![
            tlv::primitive(tags::AUTH_RESPONSE, vec![])?,
            tlv::primitive(tags::AUTH_EXPONENTIATION, point.clone())?,
        ])?;
        let reply = self.private_key_operation(slot, key_type, pin_policy, data)?;
        Ok(SharedSecret::new(tlv::dynamic_auth_item(&reply, tags::AUTH_RESPONSE)?))
    }

    /// GENERAL AUTHENTICATE with a slot key, consuming a PIN-Always verification
    fn private_key_operation(
        &mut self,
        slot: SlotId,
        key_type: KeyType,
        pin_policy: PinPolicy,
        data: Vec<u8>,
    ) -> Result<Vec<u8>> {
        let command = Command::new_with_data(
            CLA,
            ins::GENERAL_AUTHENTICATE,
            key_type.id(),
            slot.to_byte(),
            data,
        )
        .with_le(256);
        let reply = self.channel.exchange_chained(&command);
        if pin_policy == PinPolicy::Always {
            self.state.consume_fresh_pin();
        }
        self.private_key_reply(reply?)
    }

    fn private_key_reply(&mut self, reply: Reply) -> Result<Vec<u8>> {
        match reply.category {
            StatusCategory::Success => Ok(reply.payload.to_vec()),
            StatusCategory::NoData | StatusCategory::Failed(FailureCode::IncorrectData) => {
                Err(Error::InvalidOperation("no key in slot"))
            }
            StatusCategory::AuthenticationRequired => {
                // The token disagrees with the mirror
                self.state.invalidate_pin();
                Err(reply.into_error())
            }
            _ => Err(reply.into_error()),
        }
    }

    /// Attestation certificate (DER) for a key generated on the token
    #[instrument(level = "debug", skip(self))]
    pub fn attest(&mut self, slot: SlotId) -> Result<Vec<u8>> {
        self.policy.require(Feature::Attestation)?;
        let command = Command::new_with_le(CLA, ins::ATTEST, slot.to_byte(), 0x00, 256);
        let reply = self.channel.exchange(&command)?;
        match reply.category {
            StatusCategory::Success => Ok(reply.payload.to_vec()),
            StatusCategory::NoData | StatusCategory::Failed(FailureCode::IncorrectData) => {
                Err(Error::InvalidOperation("no generated key in slot"))
            }
            _ => Err(reply.into_error()),
        }
    }
}

/// PIN and touch policy elements, omitted when `Default`
fn write_policies(out: &mut Vec<u8>, pin_policy: PinPolicy, touch_policy: TouchPolicy) {
    if pin_policy != PinPolicy::Default {
        tlv::write(out, &[tags::PIN_POLICY], &[pin_policy.to_byte()]);
    }
    if touch_policy != TouchPolicy::Default {
        tlv::write(out, &[tags::TOUCH_POLICY], &[touch_policy.to_byte()]);
    }
}

fn prepare_sign_input(key_type: KeyType, input: &[u8]) -> Result<Vec<u8>> {
    match key_type.family() {
        KeyFamily::Rsa => pkcs1_pad(key_type.size(), input),
        KeyFamily::EccP256 | KeyFamily::EccP384 => {
            let size = key_type.size();
            if input.len() >= size {
                Ok(input[..size].to_vec())
            } else {
                let mut padded = vec![0u8; size - input.len()];
                padded.extend_from_slice(input);
                Ok(padded)
            }
        }
        _ => Ok(input.to_vec()),
    }
}

/// EMSA-PKCS1-v1_5 encoding of a SHA-2 digest, or a full-length input as-is
fn pkcs1_pad(modulus_len: usize, input: &[u8]) -> Result<Vec<u8>> {
    if input.len() == modulus_len {
        return Ok(input.to_vec());
    }
    let prefix = match input.len() {
        32 => SHA256_DIGEST_INFO,
        48 => SHA384_DIGEST_INFO,
        64 => SHA512_DIGEST_INFO,
        len => {
            return Err(Error::InvalidArgument(format!(
                "RSA input must be a SHA-2 digest or {modulus_len} bytes, got {len}"
            )));
        }
    };

    let digest_info_len = prefix.len() + input.len();
    let mut block = Vec::with_capacity(modulus_len);
    block.extend_from_slice(&[0x00, 0x01]);
    block.resize(modulus_len - digest_info_len - 1, 0xFF);
    block.push(0x00);
    block.extend_from_slice(prefix);
    block.extend_from_slice(input);
    Ok(block)
}
