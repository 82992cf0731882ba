//! PIN, PUK and management key state machine
//!
//! The token owns every retry counter. [`AuthState`] only mirrors what the
//! last replies said and is cleared whenever a reply shows the mirror can no
//! longer be trusted. Nothing in this module retries a rejected credential.

use std::collections::HashMap;

use nexum_apdu_core::prelude::*;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tracing::{debug, info, instrument, warn};

use crate::channel::{CommandChannel, Reply, StatusCategory};
use crate::constants::{CLA, DEFAULT_RETRY_COUNT, ins, key_reference, tags};
use crate::mgmt_key::ManagementKey;
use crate::policy::{Feature, TokenPolicy};
use crate::types::{
    Credential, CredentialKind, CredentialMetadata, KeyType, ManagementKeyAlgorithm,
    ManagementKeyMetadata, PinPolicy, RetryCounter, SlotId, TouchPolicy,
};
use crate::{Error, Result, tlv};

/// Client-side view of a PIN or PUK
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VerificationState {
    /// Not verified in this session
    #[default]
    Unverified,
    /// Verified in this session
    Verified,
    /// Retry counter exhausted
    Blocked,
}

/// Session mirror of token authentication state
#[derive(Debug, Clone, Default)]
pub struct AuthState {
    pin: VerificationState,
    puk: VerificationState,
    /// PIN verified and not yet used by a PIN-Always operation
    pin_fresh: bool,
    /// Algorithm of a successful management key authentication
    authenticated_with: Option<ManagementKeyAlgorithm>,
    /// Management key algorithm the token is known to expect
    management_key_algorithm: Option<ManagementKeyAlgorithm>,
    pin_retries: Option<RetryCounter>,
    puk_retries: Option<RetryCounter>,
    /// Slots populated in this session
    slots: HashMap<SlotId, CachedSlot>,
}

/// Key type and resolved PIN policy of a slot populated in this session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CachedSlot {
    pub(crate) key_type: KeyType,
    pub(crate) pin_policy: PinPolicy,
}

impl AuthState {
    /// PIN verification state
    pub const fn pin(&self) -> VerificationState {
        self.pin
    }

    /// PUK verification state
    pub const fn puk(&self) -> VerificationState {
        self.puk
    }

    /// PIN verified in this session
    pub const fn is_pin_verified(&self) -> bool {
        matches!(self.pin, VerificationState::Verified)
    }

    /// PIN verified and not yet spent on a PIN-Always slot
    pub const fn is_pin_fresh(&self) -> bool {
        self.pin_fresh && self.is_pin_verified()
    }

    /// Management key authenticated in this session
    pub const fn is_management_key_authenticated(&self) -> bool {
        self.authenticated_with.is_some()
    }

    /// Management key algorithm the token is known to expect
    pub const fn management_key_algorithm(&self) -> Option<ManagementKeyAlgorithm> {
        self.management_key_algorithm
    }

    /// Last known retry counter for `kind`
    pub fn retries(&self, kind: CredentialKind) -> Option<RetryCounter> {
        match kind {
            CredentialKind::Pin => self.pin_retries,
            CredentialKind::Puk => self.puk_retries,
            CredentialKind::ManagementKey => None,
        }
    }

    pub(crate) fn cached_slot(&self, slot: SlotId) -> Option<CachedSlot> {
        self.slots.get(&slot).copied()
    }

    pub(crate) fn remember_slot(&mut self, slot: SlotId, key_type: KeyType, pin_policy: PinPolicy) {
        self.slots.insert(slot, CachedSlot { key_type, pin_policy });
    }

    /// Spend the fresh verification on a PIN-Always operation
    pub(crate) fn consume_fresh_pin(&mut self) {
        self.pin_fresh = false;
    }

    pub(crate) fn invalidate_pin(&mut self) {
        if self.pin == VerificationState::Verified {
            self.pin = VerificationState::Unverified;
        }
        self.pin_fresh = false;
    }

    pub(crate) fn invalidate_management_key(&mut self) {
        self.authenticated_with = None;
    }

    /// Forget everything, as after an application reset
    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }

    fn credential_mut(&mut self, kind: CredentialKind) -> Option<&mut VerificationState> {
        match kind {
            CredentialKind::Pin => Some(&mut self.pin),
            CredentialKind::Puk => Some(&mut self.puk),
            CredentialKind::ManagementKey => None,
        }
    }

    fn record_wrong_value(&mut self, kind: CredentialKind, retries_remaining: u8) {
        let max = self.retries(kind).and_then(|counter| counter.max);
        let counter = Some(RetryCounter::new(retries_remaining, max));
        match kind {
            CredentialKind::Pin => self.pin_retries = counter,
            CredentialKind::Puk => self.puk_retries = counter,
            CredentialKind::ManagementKey => {}
        }
        if let Some(state) = self.credential_mut(kind) {
            *state = if retries_remaining == 0 {
                VerificationState::Blocked
            } else {
                VerificationState::Unverified
            };
        }
        if kind == CredentialKind::Pin || retries_remaining == 0 {
            self.pin_fresh = false;
        }
        if retries_remaining == 0 {
            // A blocked credential invalidates every cached verification
            self.invalidate_pin();
        }
    }

    fn record_success(&mut self, kind: CredentialKind) {
        let counter = self.retries(kind).map(|counter| {
            let max = counter.max.unwrap_or(DEFAULT_RETRY_COUNT);
            RetryCounter::new(max, Some(max))
        });
        match kind {
            CredentialKind::Pin => {
                self.pin = VerificationState::Verified;
                self.pin_fresh = true;
                self.pin_retries = counter;
            }
            CredentialKind::Puk => {
                self.puk = VerificationState::Verified;
                self.puk_retries = counter;
            }
            CredentialKind::ManagementKey => {}
        }
    }
}

/// Verify, change and reset operations for PIN, PUK and management key
#[derive(Debug)]
pub struct AuthenticationStateMachine<'a, T: CardTransport> {
    channel: &'a mut CommandChannel<T>,
    state: &'a mut AuthState,
    policy: TokenPolicy,
}

impl<'a, T: CardTransport> AuthenticationStateMachine<'a, T> {
    pub(crate) fn new(
        channel: &'a mut CommandChannel<T>,
        state: &'a mut AuthState,
        policy: TokenPolicy,
    ) -> Self {
        Self { channel, state, policy }
    }

    /// Current mirror
    pub fn state(&self) -> &AuthState {
        self.state
    }

    /// Verify the PIN
    #[instrument(level = "debug", skip_all)]
    pub fn verify_pin(&mut self, pin: &Credential) -> Result<()> {
        pin.validate(CredentialKind::Pin)?;
        let command = Command::new_with_data(
            CLA,
            ins::VERIFY,
            0x00,
            key_reference::PIN,
            pin.padded().to_vec(),
        );
        let reply = self.channel.exchange(&command)?;
        self.credential_outcome(CredentialKind::Pin, reply)?;
        info!("PIN verified");
        Ok(())
    }

    /// Verify the PUK by changing it to itself
    #[instrument(level = "debug", skip_all)]
    pub fn verify_puk(&mut self, puk: &Credential) -> Result<()> {
        puk.validate(CredentialKind::Puk)?;
        self.change_reference(CredentialKind::Puk, puk, puk)?;
        info!("PUK verified");
        Ok(())
    }

    /// Replace the PIN in a single exchange
    #[instrument(level = "debug", skip_all)]
    pub fn change_pin(&mut self, old: &Credential, new: &Credential) -> Result<()> {
        old.validate(CredentialKind::Pin)?;
        new.validate(CredentialKind::Pin)?;
        self.change_reference(CredentialKind::Pin, old, new)?;
        // The new value has not been presented for verification yet
        self.state.invalidate_pin();
        info!("PIN changed");
        Ok(())
    }

    /// Replace the PUK in a single exchange
    #[instrument(level = "debug", skip_all)]
    pub fn change_puk(&mut self, old: &Credential, new: &Credential) -> Result<()> {
        old.validate(CredentialKind::Puk)?;
        new.validate(CredentialKind::Puk)?;
        self.change_reference(CredentialKind::Puk, old, new)?;
        info!("PUK changed");
        Ok(())
    }

    fn change_reference(
        &mut self,
        kind: CredentialKind,
        old: &Credential,
        new: &Credential,
    ) -> Result<()> {
        let reference = match kind {
            CredentialKind::Pin => key_reference::PIN,
            _ => key_reference::PUK,
        };
        let mut data = Vec::with_capacity(16);
        data.extend_from_slice(&old.padded());
        data.extend_from_slice(&new.padded());
        let command = Command::new_with_data(CLA, ins::CHANGE_REFERENCE, 0x00, reference, data);
        let reply = self.channel.exchange(&command)?;
        self.credential_outcome(kind, reply)
    }

    /// Unblock the PIN with the PUK and set a new PIN
    #[instrument(level = "debug", skip_all)]
    pub fn reset_pin_with_puk(&mut self, puk: &Credential, new_pin: &Credential) -> Result<()> {
        puk.validate(CredentialKind::Puk)?;
        new_pin.validate(CredentialKind::Pin)?;

        let puk_blocked = if self.policy.supports(Feature::Metadata) {
            self.puk_metadata()?.retries.is_blocked()
        } else {
            self.state.puk == VerificationState::Blocked
        };
        if puk_blocked {
            debug!("PUK known to be blocked, not sending reset");
            return Err(Error::Blocked(CredentialKind::Puk));
        }

        let mut data = Vec::with_capacity(16);
        data.extend_from_slice(&puk.padded());
        data.extend_from_slice(&new_pin.padded());
        let command = Command::new_with_data(
            CLA,
            ins::RESET_RETRY_COUNTER,
            0x00,
            key_reference::PIN,
            data,
        );
        let reply = self.channel.exchange(&command)?;
        self.credential_outcome(CredentialKind::Puk, reply)?;

        let max = self
            .state
            .pin_retries
            .and_then(|counter| counter.max)
            .unwrap_or(DEFAULT_RETRY_COUNT);
        self.state.pin = VerificationState::Unverified;
        self.state.pin_fresh = false;
        self.state.pin_retries = Some(RetryCounter::new(max, Some(max)));
        info!("PIN reset with PUK");
        Ok(())
    }

    /// Remaining PIN attempts
    ///
    /// Uses metadata when the firmware has it, otherwise an empty VERIFY which
    /// does not consume an attempt.
    pub fn pin_retries(&mut self) -> Result<RetryCounter> {
        if self.policy.supports(Feature::Metadata) {
            return Ok(self.pin_metadata()?.retries);
        }

        let command = Command::new(CLA, ins::VERIFY, 0x00, key_reference::PIN);
        let reply = self.channel.exchange(&command)?;
        match reply.category {
            StatusCategory::WrongValue { retries_remaining } => {
                let max = self.state.pin_retries.and_then(|counter| counter.max);
                let counter = RetryCounter::new(retries_remaining, max);
                self.state.pin_retries = Some(counter);
                if retries_remaining == 0 {
                    self.state.record_wrong_value(CredentialKind::Pin, 0);
                }
                Ok(counter)
            }
            // Already verified in this session, and a successful verify restores the counter
            StatusCategory::Success => {
                let max = self.state.pin_retries.and_then(|counter| counter.max);
                Ok(RetryCounter::new(max.unwrap_or(DEFAULT_RETRY_COUNT), max))
            }
            _ => Err(reply.into_error()),
        }
    }

    /// Remaining PUK attempts, needs metadata support
    pub fn puk_retries(&mut self) -> Result<RetryCounter> {
        Ok(self.puk_metadata()?.retries)
    }

    /// PIN metadata, needs metadata support
    pub fn pin_metadata(&mut self) -> Result<CredentialMetadata> {
        let metadata = self.credential_metadata(key_reference::PIN)?;
        self.state.pin_retries = Some(metadata.retries);
        if metadata.retries.is_blocked() {
            self.state.record_wrong_value(CredentialKind::Pin, 0);
        }
        Ok(metadata)
    }

    /// PUK metadata, needs metadata support
    pub fn puk_metadata(&mut self) -> Result<CredentialMetadata> {
        let metadata = self.credential_metadata(key_reference::PUK)?;
        self.state.puk_retries = Some(metadata.retries);
        if metadata.retries.is_blocked() {
            self.state.puk = VerificationState::Blocked;
        }
        Ok(metadata)
    }

    fn credential_metadata(&mut self, reference: u8) -> Result<CredentialMetadata> {
        self.policy.require(Feature::Metadata)?;
        let data = self
            .channel
            .metadata(reference)?
            .ok_or(Error::ProtocolViolation("token returned no credential metadata"))?;
        CredentialMetadata::parse(&data)
    }

    /// Management key metadata, needs metadata support
    pub fn management_key_metadata(&mut self) -> Result<ManagementKeyMetadata> {
        self.policy.require(Feature::Metadata)?;
        let data = self
            .channel
            .metadata(key_reference::MANAGEMENT_KEY)?
            .ok_or(Error::ProtocolViolation("token returned no management key metadata"))?;
        let metadata = ManagementKeyMetadata::parse(&data)?;
        self.state.management_key_algorithm = Some(metadata.algorithm);
        Ok(metadata)
    }

    /// Algorithm the token expects for its current management key
    pub fn expected_management_key_algorithm(&mut self) -> Result<ManagementKeyAlgorithm> {
        if self.policy.supports(Feature::Metadata) {
            return Ok(self.management_key_metadata()?.algorithm);
        }
        Ok(self
            .state
            .management_key_algorithm
            .unwrap_or_else(|| self.policy.default_management_key_algorithm()))
    }

    /// Authenticate with the management key
    ///
    /// With `mutual` the token also has to prove it holds the same key.
    #[instrument(level = "debug", skip(self, key), fields(algorithm = %key.algorithm()))]
    pub fn authenticate_management_key(&mut self, key: &ManagementKey, mutual: bool) -> Result<()> {
        let expected = self.expected_management_key_algorithm()?;
        if key.algorithm() != expected {
            debug!(%expected, "Management key algorithm mismatch");
            return Err(Error::AlgorithmMismatch {
                expected,
                supplied: key.algorithm(),
            });
        }

        self.state.invalidate_management_key();
        if mutual {
            self.mutual_authenticate(key)?;
        } else {
            self.single_authenticate(key)?;
        }

        self.state.authenticated_with = Some(key.algorithm());
        self.state.management_key_algorithm = Some(key.algorithm());
        info!("Management key authenticated");
        Ok(())
    }

    fn general_authenticate(
        &mut self,
        algorithm: ManagementKeyAlgorithm,
        data: Vec<u8>,
    ) -> Result<Reply> {
        let command = Command::new_with_data(
            CLA,
            ins::GENERAL_AUTHENTICATE,
            algorithm.id(),
            key_reference::MANAGEMENT_KEY,
            data,
        )
        .with_le(256);
        self.channel.exchange(&command)
    }

    fn single_authenticate(&mut self, key: &ManagementKey) -> Result<()> {
        let algorithm = key.algorithm();
        let request = tlv::dynamic_auth(vec![tlv::primitive(tags::AUTH_CHALLENGE, vec![])?])?;
        let payload = self.general_authenticate(algorithm, request)?.into_result()?;
        let challenge = tlv::dynamic_auth_item(&payload, tags::AUTH_CHALLENGE)?;
        if challenge.len() != algorithm.block_len() {
            return Err(Error::ProtocolViolation("challenge has the wrong length"));
        }

        let response = key.encrypt(&challenge)?;
        let answer = tlv::dynamic_auth(vec![tlv::primitive(tags::AUTH_RESPONSE, response)?])?;
        let reply = self.general_authenticate(algorithm, answer)?;
        if !reply.is_success() {
            warn!(status = %reply.status, "Management key rejected");
            return Err(Error::AuthenticationFailed);
        }
        Ok(())
    }

    fn mutual_authenticate(&mut self, key: &ManagementKey) -> Result<()> {
        let algorithm = key.algorithm();
        let request = tlv::dynamic_auth(vec![tlv::primitive(tags::AUTH_WITNESS, vec![])?])?;
        let payload = self.general_authenticate(algorithm, request)?.into_result()?;
        let encrypted_witness = tlv::dynamic_auth_item(&payload, tags::AUTH_WITNESS)?;
        if encrypted_witness.len() != algorithm.block_len() {
            return Err(Error::ProtocolViolation("witness has the wrong length"));
        }
        let witness = key.decrypt(&encrypted_witness)?;

        let mut challenge = vec![0u8; algorithm.block_len()];
        rand::rng().fill_bytes(&mut challenge);
        let answer = tlv::dynamic_auth(vec![
            tlv::primitive(tags::AUTH_WITNESS, witness)?,
            tlv::primitive(tags::AUTH_CHALLENGE, challenge.clone())?,
        ])?;
        let reply = self.general_authenticate(algorithm, answer)?;
        if !reply.is_success() {
            warn!(status = %reply.status, "Management key rejected");
            return Err(Error::AuthenticationFailed);
        }

        let proof = tlv::dynamic_auth_item(&reply.payload, tags::AUTH_RESPONSE)?;
        if !bool::from(proof.ct_eq(&key.encrypt(&challenge)?)) {
            warn!("Token failed to prove possession of the management key");
            return Err(Error::MutualAuthenticationFailed);
        }
        Ok(())
    }

    /// Install a new management key
    ///
    /// Returns the touch policy actually applied, which compliance tiers may
    /// raise to `Always`.
    #[instrument(level = "debug", skip(self, new_key), fields(algorithm = %new_key.algorithm()))]
    pub fn change_management_key(
        &mut self,
        new_key: &ManagementKey,
        touch_policy: TouchPolicy,
    ) -> Result<TouchPolicy> {
        let touch_policy = self
            .policy
            .check_management_key_change(new_key.algorithm(), touch_policy)?;
        if !self.state.is_management_key_authenticated() {
            return Err(Error::AuthenticationRequired(
                "changing the management key requires management key authentication",
            ));
        }

        let mut data = Vec::with_capacity(3 + new_key.as_bytes().len());
        data.push(new_key.algorithm().id());
        data.push(key_reference::MANAGEMENT_KEY);
        data.push(new_key.as_bytes().len() as u8);
        data.extend_from_slice(new_key.as_bytes());
        let p2 = if touch_policy == TouchPolicy::Never { 0xFF } else { 0xFE };
        let command = Command::new_with_data(CLA, ins::SET_MANAGEMENT_KEY, 0xFF, p2, data);
        self.channel.exchange(&command)?.into_result()?;

        self.state.invalidate_management_key();
        self.state.management_key_algorithm = Some(new_key.algorithm());
        info!(%touch_policy, "Management key changed");
        Ok(touch_policy)
    }

    /// Set new PIN and PUK retry maxima
    ///
    /// Clears blocked state and returns both values to the factory defaults.
    #[instrument(level = "debug", skip(self, management_key))]
    pub fn change_retry_counts(
        &mut self,
        management_key: &ManagementKey,
        pin_count: u8,
        puk_count: u8,
    ) -> Result<()> {
        for count in [pin_count, puk_count] {
            if !(1..=15).contains(&count) {
                return Err(Error::InvalidArgument(format!(
                    "retry count must be between 1 and 15, got {count}"
                )));
            }
        }

        self.authenticate_management_key(management_key, false)?;
        let command = Command::new(CLA, ins::SET_PIN_RETRIES, pin_count, puk_count);
        self.channel.exchange(&command)?.into_result()?;

        self.state.pin = VerificationState::Unverified;
        self.state.puk = VerificationState::Unverified;
        self.state.pin_fresh = false;
        self.state.pin_retries = Some(RetryCounter::new(pin_count, Some(pin_count)));
        self.state.puk_retries = Some(RetryCounter::new(puk_count, Some(puk_count)));
        info!(pin_count, puk_count, "Retry counts changed, PIN and PUK reset to defaults");
        Ok(())
    }

    /// Reset the PIV application to factory state
    ///
    /// Only possible once both PIN and PUK are blocked.
    #[instrument(level = "debug", skip(self))]
    pub fn reset_application(&mut self) -> Result<()> {
        let pin_blocked = self.pin_retries()?.is_blocked();
        let puk_blocked = if self.policy.supports(Feature::Metadata) {
            self.puk_retries()?.is_blocked()
        } else {
            self.state.puk == VerificationState::Blocked
        };
        if !pin_blocked || !puk_blocked {
            return Err(Error::InvalidOperation(
                "reset requires both PIN and PUK to be blocked",
            ));
        }

        let command = Command::new(CLA, ins::RESET, 0x00, 0x00);
        self.channel.exchange(&command)?.into_result()?;
        self.state.clear();
        warn!("PIV application reset");
        Ok(())
    }

    /// Map a PIN or PUK reply and update the mirror
    fn credential_outcome(&mut self, kind: CredentialKind, reply: Reply) -> Result<()> {
        match reply.category {
            StatusCategory::Success => {
                self.state.record_success(kind);
                Ok(())
            }
            StatusCategory::WrongValue { retries_remaining: 0 } => {
                warn!(%kind, "Credential blocked");
                self.state.record_wrong_value(kind, 0);
                Err(Error::Blocked(kind))
            }
            StatusCategory::WrongValue { retries_remaining } => {
                debug!(%kind, retries_remaining, "Wrong credential");
                self.state.record_wrong_value(kind, retries_remaining);
                Err(Error::WrongValue { kind, retries_remaining })
            }
            _ => Err(reply.into_error()),
        }
    }
}
