//! PIN-only mode
//!
//! The management key is either stored in the PIN-protected printed object
//! (protected), derived from the PIN with a salt kept in the admin data object
//! (derived), or both. The mode is never cached: every query reads the two
//! objects again and reconciles them.

use std::time::{SystemTime, UNIX_EPOCH};

use nexum_apdu_core::CardTransport;
use rand::RngCore;
use tracing::{debug, info, instrument, warn};

use crate::auth::{AuthState, AuthenticationStateMachine};
use crate::channel::CommandChannel;
use crate::constants::{
    ADMIN_FLAG_MGMT_KEY_PROTECTED, ADMIN_FLAG_PUK_BLOCKED, PIN_DERIVATION_SALT_LEN, objects, tags,
};
use crate::mgmt_key::ManagementKey;
use crate::policy::TokenPolicy;
use crate::types::{Credential, CredentialKind, ManagementKeyAlgorithm, TouchPolicy};
use crate::{Error, Result, tlv};

/// State of one PIN-only axis
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AxisState {
    /// Nothing stored for this axis
    #[default]
    NotConfigured,
    /// The backing object holds a usable value
    Configured,
    /// The backing object is present but does not decode
    Unavailable,
}

/// Which PIN-only axis an operation refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinOnlyAxis {
    /// Management key stored in printed data
    Protected,
    /// Management key derived from the PIN and the admin data salt
    Derived,
}

/// PIN-only mode of a token
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PinOnlyMode {
    /// Printed data axis
    pub protected: AxisState,
    /// Admin data axis
    pub derived: AxisState,
}

impl PinOnlyMode {
    /// Neither axis configured
    pub const NONE: Self = Self::new(AxisState::NotConfigured, AxisState::NotConfigured);
    /// Key stored in printed data only
    pub const PROTECTED: Self = Self::new(AxisState::Configured, AxisState::NotConfigured);
    /// Key derived from the PIN only
    pub const DERIVED: Self = Self::new(AxisState::NotConfigured, AxisState::Configured);
    /// Derived key, also stored in printed data
    pub const PROTECTED_AND_DERIVED: Self = Self::new(AxisState::Configured, AxisState::Configured);
    /// Reading after admin data failed to decode
    pub const UNAVAILABLE: Self = Self::new(AxisState::Unavailable, AxisState::Unavailable);

    /// Protected axis configured
    pub const FLAG_PROTECTED: u8 = 0x01;
    /// Derived axis configured
    pub const FLAG_DERIVED: u8 = 0x02;
    /// Printed data present but unreadable
    pub const FLAG_PROTECTED_UNAVAILABLE: u8 = 0x04;
    /// Admin data present but unreadable
    pub const FLAG_DERIVED_UNAVAILABLE: u8 = 0x08;

    /// Mode from its two axes
    pub const fn new(protected: AxisState, derived: AxisState) -> Self {
        Self { protected, derived }
    }

    /// Combine the two axis readings. An unavailable derived axis makes the
    /// whole reading untrustworthy.
    pub const fn reconcile(protected: AxisState, derived: AxisState) -> Self {
        match derived {
            AxisState::Unavailable => Self::UNAVAILABLE,
            _ => Self::new(protected, derived),
        }
    }

    /// Protected axis configured
    pub const fn is_protected(&self) -> bool {
        matches!(self.protected, AxisState::Configured)
    }

    /// Derived axis configured
    pub const fn is_derived(&self) -> bool {
        matches!(self.derived, AxisState::Configured)
    }

    /// Either axis unavailable
    pub const fn has_unavailable(&self) -> bool {
        matches!(self.protected, AxisState::Unavailable)
            || matches!(self.derived, AxisState::Unavailable)
    }

    /// Bit flag view
    pub const fn to_flags(self) -> u8 {
        const fn axis(state: AxisState, configured: u8, unavailable: u8) -> u8 {
            match state {
                AxisState::NotConfigured => 0,
                AxisState::Configured => configured,
                AxisState::Unavailable => unavailable,
            }
        }
        axis(self.protected, Self::FLAG_PROTECTED, Self::FLAG_PROTECTED_UNAVAILABLE)
            | axis(self.derived, Self::FLAG_DERIVED, Self::FLAG_DERIVED_UNAVAILABLE)
    }

    /// Read the bit flag view. An unavailable bit wins over a configured bit.
    pub const fn from_flags(flags: u8) -> Self {
        const fn axis(flags: u8, configured: u8, unavailable: u8) -> AxisState {
            if flags & unavailable != 0 {
                AxisState::Unavailable
            } else if flags & configured != 0 {
                AxisState::Configured
            } else {
                AxisState::NotConfigured
            }
        }
        Self::new(
            axis(flags, Self::FLAG_PROTECTED, Self::FLAG_PROTECTED_UNAVAILABLE),
            axis(flags, Self::FLAG_DERIVED, Self::FLAG_DERIVED_UNAVAILABLE),
        )
    }
}

/// Decoded admin data object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct AdminData {
    pub(crate) flags: u8,
    pub(crate) salt: Option<[u8; PIN_DERIVATION_SALT_LEN]>,
    pub(crate) pin_changed: Option<u32>,
}

impl AdminData {
    pub(crate) fn decode(data: &[u8]) -> Result<Self> {
        let inner = tlv::unwrap_exact(data, &[tags::ADMIN_DATA])?;
        let tlvs = tlv::parse_all(inner)?;
        let flags = match tlv::find_primitive(&tlvs, tags::ADMIN_FLAGS)? {
            Some([flags]) => *flags,
            Some(_) => return Err(Error::ProtocolViolation("admin flags have the wrong length")),
            None => 0,
        };
        let salt = tlv::find_primitive(&tlvs, tags::ADMIN_SALT)?
            .map(|salt| {
                <[u8; PIN_DERIVATION_SALT_LEN]>::try_from(salt)
                    .map_err(|_| Error::ProtocolViolation("admin salt has the wrong length"))
            })
            .transpose()?;
        let pin_changed = match tlv::find_primitive(&tlvs, tags::ADMIN_TIMESTAMP)? {
            Some(bytes) if bytes.len() == 4 => {
                Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            }
            Some(_) => return Err(Error::ProtocolViolation("admin timestamp has the wrong length")),
            None => None,
        };
        Ok(Self { flags, salt, pin_changed })
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut inner = Vec::with_capacity(32);
        tlv::write(&mut inner, &[tags::ADMIN_FLAGS], &[self.flags]);
        if let Some(salt) = &self.salt {
            tlv::write(&mut inner, &[tags::ADMIN_SALT], salt);
        }
        if let Some(timestamp) = self.pin_changed {
            tlv::write(&mut inner, &[tags::ADMIN_TIMESTAMP], &timestamp.to_le_bytes());
        }
        let mut out = Vec::with_capacity(inner.len() + 2);
        tlv::write(&mut out, &[tags::ADMIN_DATA], &inner);
        out
    }

    /// Object value to store, empty when nothing is left to record
    fn object_value(&self) -> Vec<u8> {
        if *self == Self::default() {
            Vec::new()
        } else {
            self.encode()
        }
    }
}

/// Decode printed data, returning the stored management key bytes if any
pub(crate) fn decode_printed(data: &[u8]) -> Result<Option<Vec<u8>>> {
    let inner = tlv::unwrap_exact(data, &[tags::PRINTED_DATA])?;
    let tlvs = tlv::parse_all(inner)?;
    match tlv::find_primitive(&tlvs, tags::PRINTED_MANAGEMENT_KEY)? {
        Some(key) if matches!(key.len(), 16 | 24 | 32) => Ok(Some(key.to_vec())),
        Some(_) => Err(Error::ProtocolViolation("stored management key has the wrong length")),
        None => Ok(None),
    }
}

pub(crate) fn encode_printed(key: &ManagementKey) -> Vec<u8> {
    let mut inner = Vec::with_capacity(key.as_bytes().len() + 2);
    tlv::write(&mut inner, &[tags::PRINTED_MANAGEMENT_KEY], key.as_bytes());
    let mut out = Vec::with_capacity(inner.len() + 2);
    tlv::write(&mut out, &[tags::PRINTED_DATA], &inner);
    out
}

/// Admin data as read from the token
#[derive(Debug, Clone, PartialEq, Eq)]
enum AdminReading {
    Empty,
    Data(AdminData),
    Malformed,
}

/// Printed data as read from the token
#[derive(Debug, Clone, PartialEq, Eq)]
enum PrintedReading {
    Empty,
    Key(Vec<u8>),
    Malformed,
    /// Not readable until the PIN is verified
    Locked,
}

#[derive(Debug)]
struct Readings {
    admin: AdminReading,
    printed: PrintedReading,
}

impl Readings {
    fn admin_data(&self) -> Option<&AdminData> {
        match &self.admin {
            AdminReading::Data(admin) => Some(admin),
            _ => None,
        }
    }
}

/// PIN-only mode operations
#[derive(Debug)]
pub struct PinOnlyModeManager<'a, T: CardTransport> {
    channel: &'a mut CommandChannel<T>,
    state: &'a mut AuthState,
    policy: TokenPolicy,
    iterations: u32,
}

impl<'a, T: CardTransport> PinOnlyModeManager<'a, T> {
    pub(crate) fn new(
        channel: &'a mut CommandChannel<T>,
        state: &'a mut AuthState,
        policy: TokenPolicy,
        iterations: u32,
    ) -> Self {
        Self { channel, state, policy, iterations }
    }

    fn auth(&mut self) -> AuthenticationStateMachine<'_, T> {
        AuthenticationStateMachine::new(self.channel, self.state, self.policy)
    }

    fn read(&mut self) -> Result<Readings> {
        let admin = self.channel.read_object(objects::ADMIN_DATA)?;
        let admin = if admin.is_empty() {
            AdminReading::Empty
        } else {
            match AdminData::decode(&admin) {
                Ok(data) => AdminReading::Data(data),
                Err(error) => {
                    debug!(%error, "Admin data does not decode");
                    AdminReading::Malformed
                }
            }
        };

        let printed = match self.channel.read_object(objects::PRINTED) {
            Ok(data) if data.is_empty() => PrintedReading::Empty,
            Ok(data) => match decode_printed(&data) {
                Ok(Some(key)) => PrintedReading::Key(key),
                Ok(None) => PrintedReading::Empty,
                Err(error) => {
                    debug!(%error, "Printed data does not decode");
                    PrintedReading::Malformed
                }
            },
            Err(Error::AuthenticationRequired(_)) => {
                debug!("Printed data needs the PIN, falling back to admin flags");
                PrintedReading::Locked
            }
            Err(error) => return Err(error),
        };
        Ok(Readings { admin, printed })
    }

    fn classify(readings: &Readings) -> PinOnlyMode {
        let derived = match &readings.admin {
            AdminReading::Empty => AxisState::NotConfigured,
            AdminReading::Malformed => AxisState::Unavailable,
            AdminReading::Data(admin) if admin.salt.is_some() => AxisState::Configured,
            AdminReading::Data(_) => AxisState::NotConfigured,
        };
        let protected = match &readings.printed {
            PrintedReading::Key(_) => AxisState::Configured,
            PrintedReading::Empty => AxisState::NotConfigured,
            PrintedReading::Malformed => AxisState::Unavailable,
            PrintedReading::Locked => match readings.admin_data() {
                Some(admin) if admin.flags & ADMIN_FLAG_MGMT_KEY_PROTECTED != 0 => {
                    AxisState::Configured
                }
                _ => AxisState::NotConfigured,
            },
        };
        PinOnlyMode::reconcile(protected, derived)
    }

    /// Current mode, reconciled from the admin and printed data objects
    ///
    /// A malformed object marks its axis unavailable instead of failing.
    #[instrument(level = "debug", skip(self))]
    pub fn get_mode(&mut self) -> Result<PinOnlyMode> {
        let readings = self.read()?;
        let mode = Self::classify(&readings);
        debug!(flags = mode.to_flags(), "PIN-only mode read");
        Ok(mode)
    }

    /// Configure PIN-only mode
    ///
    /// Needs management key authentication. The PIN is verified first. The
    /// object that lets the PIN recover the new key is written before the
    /// token switches keys, and the other object afterwards, so an
    /// interrupted call leaves a key the PIN or the caller can still reach.
    #[instrument(level = "debug", skip(self, pin))]
    pub fn set_mode(
        &mut self,
        mode: PinOnlyMode,
        algorithm: ManagementKeyAlgorithm,
        pin: &Credential,
    ) -> Result<()> {
        if mode.has_unavailable() {
            return Err(Error::InvalidArgument(
                "unavailable is a failure marker, not a mode to set".into(),
            ));
        }
        if mode.is_derived() && algorithm != ManagementKeyAlgorithm::TripleDes {
            return Err(Error::InvalidArgument(
                "PIN-derived mode needs a TripleDES management key".into(),
            ));
        }
        self.policy
            .check_management_key_change(algorithm, TouchPolicy::Default)?;
        if !self.state.is_management_key_authenticated() {
            return Err(Error::AuthenticationRequired(
                "setting PIN-only mode requires management key authentication",
            ));
        }

        self.auth().verify_pin(pin)?;
        let previous = self.read()?.admin_data().cloned().unwrap_or_default();

        let mut salt = None;
        let new_key = if mode.is_derived() {
            let mut bytes = [0u8; PIN_DERIVATION_SALT_LEN];
            rand::rng().fill_bytes(&mut bytes);
            salt = Some(bytes);
            ManagementKey::derive_from_pin(pin, &bytes, self.iterations)
        } else if mode.is_protected() {
            ManagementKey::generate(algorithm)
        } else {
            ManagementKey::default_for(algorithm)
        };

        let admin = AdminData {
            flags: (previous.flags & ADMIN_FLAG_PUK_BLOCKED)
                | if mode.is_protected() { ADMIN_FLAG_MGMT_KEY_PROTECTED } else { 0 },
            salt,
            pin_changed: salt.map(|_| unix_time()),
        };
        let printed = if mode.is_protected() { encode_printed(&new_key) } else { Vec::new() };

        // The salt alone recovers a derived key, so printed data keeps the
        // previous key until the switch
        let admin_first = mode.is_derived();
        let printed_first = mode.is_protected() && !mode.is_derived();
        if admin_first {
            self.channel
                .write_object(objects::ADMIN_DATA, &admin.object_value())?;
        }
        if printed_first {
            self.channel.write_object(objects::PRINTED, &printed)?;
        }

        self.install_key(&new_key)?;

        if !admin_first {
            self.channel
                .write_object(objects::ADMIN_DATA, &admin.object_value())?;
        }
        if !printed_first {
            self.channel.write_object(objects::PRINTED, &printed)?;
        }

        info!(flags = mode.to_flags(), "PIN-only mode set");
        Ok(())
    }

    /// Change the management key and authenticate with the new one
    fn install_key(&mut self, key: &ManagementKey) -> Result<()> {
        let mut auth = self.auth();
        auth.change_management_key(key, TouchPolicy::Default)?;
        auth.authenticate_management_key(key, false)
    }

    /// Deliberately disable an axis by storing a value that does not decode
    #[instrument(level = "debug", skip(self))]
    pub fn mark_unavailable(&mut self, axis: PinOnlyAxis) -> Result<()> {
        if !self.state.is_management_key_authenticated() {
            return Err(Error::AuthenticationRequired(
                "writing PIN-only objects requires management key authentication",
            ));
        }
        let (object, tag) = match axis {
            PinOnlyAxis::Protected => (objects::PRINTED, tags::PRINTED_DATA),
            PinOnlyAxis::Derived => (objects::ADMIN_DATA, tags::ADMIN_DATA),
        };
        // Declared length exceeds the content
        self.channel.write_object(object, &[tag, 0x05, 0xFF])?;
        warn!(?axis, "PIN-only axis marked unavailable");
        Ok(())
    }

    /// Authenticate with the management key recovered from the PIN
    ///
    /// Returns the axes that actually authenticated. The two objects are then
    /// brought back in line with the key that worked.
    #[instrument(level = "debug", skip(self, pin))]
    pub fn try_recover(&mut self, pin: &Credential) -> Result<PinOnlyMode> {
        self.auth().verify_pin(pin)?;
        let readings = self.read()?;
        let mode = Self::classify(&readings);
        if mode.derived == AxisState::Unavailable {
            warn!("Admin data unavailable, nothing to recover");
            return Ok(mode);
        }
        let admin = readings.admin_data().cloned();
        // A key left in printed data by an interrupted PIN change
        let escrow_only = admin.as_ref().is_some_and(|admin| {
            admin.salt.is_some() && admin.flags & ADMIN_FLAG_MGMT_KEY_PROTECTED == 0
        });

        let mut recovered = PinOnlyMode::new(
            if mode.protected == AxisState::Unavailable {
                AxisState::Unavailable
            } else {
                AxisState::NotConfigured
            },
            AxisState::NotConfigured,
        );
        let mut key = None;

        if let Some(salt) = admin.as_ref().and_then(|admin| admin.salt) {
            let derived = ManagementKey::derive_from_pin(pin, &salt, self.iterations);
            if self.try_authenticate(&derived)? {
                recovered.derived = AxisState::Configured;
                key = Some(derived);
            }
        }

        if let PrintedReading::Key(stored) = &readings.printed {
            let algorithm = self.auth().expected_management_key_algorithm()?;
            match ManagementKey::new(algorithm, stored.clone()) {
                Ok(stored) if key.as_ref() == Some(&stored) => {
                    if !escrow_only {
                        recovered.protected = AxisState::Configured;
                    }
                }
                Ok(stored) => {
                    if self.try_authenticate(&stored)? {
                        recovered.protected = AxisState::Configured;
                        key = Some(stored);
                    } else if let Some(derived) = &key {
                        debug!("Stored management key is stale, keeping the derived one");
                        self.auth().authenticate_management_key(derived, false)?;
                    }
                }
                Err(error) => debug!(%error, "Stored management key does not fit the token"),
            }
        }

        if let Some(key) = &key {
            self.repair(admin.as_ref(), &readings.printed, recovered, key)?;
        }
        info!(flags = recovered.to_flags(), "PIN-only recovery finished");
        Ok(recovered)
    }

    /// `Ok(false)` when the token rejects the key
    fn try_authenticate(&mut self, key: &ManagementKey) -> Result<bool> {
        match self.auth().authenticate_management_key(key, false) {
            Ok(()) => Ok(true),
            Err(Error::AuthenticationFailed | Error::AlgorithmMismatch { .. }) => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Rewrite whichever object disagrees with the recovered key
    fn repair(
        &mut self,
        admin: Option<&AdminData>,
        printed: &PrintedReading,
        recovered: PinOnlyMode,
        key: &ManagementKey,
    ) -> Result<()> {
        let current = admin.cloned().unwrap_or_default();
        let flagged_protected = current.flags & ADMIN_FLAG_MGMT_KEY_PROTECTED != 0;

        if recovered.is_derived() && !recovered.is_protected() {
            match printed {
                PrintedReading::Empty | PrintedReading::Key(_) if flagged_protected => {
                    info!("Restoring the management key in printed data");
                    self.channel
                        .write_object(objects::PRINTED, &encode_printed(key))?;
                }
                PrintedReading::Key(_) => {
                    info!("Removing a leftover management key from printed data");
                    self.channel.write_object(objects::PRINTED, &[])?;
                }
                _ => {}
            }
        }

        if recovered.is_protected() {
            let mut updated = current.clone();
            updated.flags |= ADMIN_FLAG_MGMT_KEY_PROTECTED;
            if !recovered.is_derived() {
                updated.salt = None;
                updated.pin_changed = None;
            }
            if updated != current {
                info!("Restoring admin data to match the stored key");
                self.channel
                    .write_object(objects::ADMIN_DATA, &updated.encode())?;
            }
        }
        Ok(())
    }

    /// Change the PIN, keeping a PIN-derived management key in step
    ///
    /// The token checks `old` before anything else. When the derived key no
    /// longer opens the token only the PIN is changed. Otherwise the current
    /// key is parked in printed data while the salt, the PIN and the key are
    /// replaced, so `try_recover` finds a working key after any interruption.
    #[instrument(level = "debug", skip_all)]
    pub fn change_pin(&mut self, old: &Credential, new: &Credential) -> Result<()> {
        new.validate(CredentialKind::Pin)?;
        self.auth().verify_pin(old)?;
        let readings = self.read()?;
        let Some(admin) = readings.admin_data().cloned() else {
            return self.auth().change_pin(old, new);
        };
        let Some(salt) = admin.salt else {
            return self.auth().change_pin(old, new);
        };

        let current = ManagementKey::derive_from_pin(old, &salt, self.iterations);
        if !self.try_authenticate(&current)? {
            warn!("Management key no longer follows the PIN, changing the PIN only");
            return self.auth().change_pin(old, new);
        }

        let mut new_salt = [0u8; PIN_DERIVATION_SALT_LEN];
        rand::rng().fill_bytes(&mut new_salt);
        let new_key = ManagementKey::derive_from_pin(new, &new_salt, self.iterations);

        if readings.printed != PrintedReading::Key(current.as_bytes().to_vec()) {
            self.channel
                .write_object(objects::PRINTED, &encode_printed(&current))?;
        }
        let updated = AdminData {
            salt: Some(new_salt),
            pin_changed: Some(unix_time()),
            ..admin
        };
        self.channel
            .write_object(objects::ADMIN_DATA, &updated.encode())?;
        self.auth().change_pin(old, new)?;
        self.install_key(&new_key)?;

        let printed = if updated.flags & ADMIN_FLAG_MGMT_KEY_PROTECTED != 0 {
            encode_printed(&new_key)
        } else {
            Vec::new()
        };
        self.channel.write_object(objects::PRINTED, &printed)?;
        info!("PIN changed and derived management key replaced");
        Ok(())
    }
}

fn unix_time() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u32::try_from(elapsed.as_secs()).unwrap_or(u32::MAX))
}
