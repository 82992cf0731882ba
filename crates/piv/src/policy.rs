//! Firmware feature gates and compliance tiers
//!
//! Every version-dependent decision is a lookup in one of the static tables
//! below. Adding a firmware tier means adding a row.

use derive_more::Display;
use tracing::debug;

use crate::types::{FirmwareVersion, KeyType, ManagementKeyAlgorithm, PinPolicy, TouchPolicy};
use crate::{Error, Result};

/// Optional token capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Feature {
    /// ECC P-384 slot keys
    #[display("P-384 keys")]
    P384,
    /// ATTEST instruction
    #[display("attestation")]
    Attestation,
    /// GET SERIAL instruction
    #[display("serial number")]
    Serial,
    /// GET METADATA instruction
    #[display("metadata")]
    Metadata,
    /// AES algorithms for the management key
    #[display("AES management keys")]
    AesManagementKey,
    /// RSA keys above 2048 bits
    #[display("RSA-3072/4096 keys")]
    Rsa3072And4096,
    /// Ed25519 and X25519 slot keys
    #[display("Ed25519/X25519 keys")]
    Curve25519,
}

/// A feature and the first firmware that has it
#[derive(Debug, Clone, Copy)]
pub struct FeatureGate {
    /// Gated feature
    pub feature: Feature,
    /// First firmware with the feature
    pub since: FirmwareVersion,
}

/// Firmware gate of every optional feature
pub const FEATURE_GATES: &[FeatureGate] = &[
    FeatureGate { feature: Feature::P384, since: FirmwareVersion::new(4, 0, 0) },
    FeatureGate { feature: Feature::Attestation, since: FirmwareVersion::new(4, 3, 0) },
    FeatureGate { feature: Feature::Serial, since: FirmwareVersion::new(5, 0, 0) },
    FeatureGate { feature: Feature::Metadata, since: FirmwareVersion::new(5, 3, 0) },
    FeatureGate { feature: Feature::AesManagementKey, since: FirmwareVersion::new(5, 4, 0) },
    FeatureGate { feature: Feature::Rsa3072And4096, since: FirmwareVersion::new(5, 7, 0) },
    FeatureGate { feature: Feature::Curve25519, since: FirmwareVersion::new(5, 7, 0) },
];

/// Default management key algorithm from a firmware version onwards
#[derive(Debug, Clone, Copy)]
pub struct ManagementKeyDefault {
    /// First firmware of the row
    pub since: FirmwareVersion,
    /// Factory management key algorithm
    pub algorithm: ManagementKeyAlgorithm,
}

/// Sorted by `since`, the last matching row wins
pub const MANAGEMENT_KEY_DEFAULTS: &[ManagementKeyDefault] = &[
    ManagementKeyDefault {
        since: FirmwareVersion::new(0, 0, 0),
        algorithm: ManagementKeyAlgorithm::TripleDes,
    },
    ManagementKeyDefault {
        since: FirmwareVersion::new(5, 7, 0),
        algorithm: ManagementKeyAlgorithm::Aes192,
    },
];

/// Restrictions a compliance-mode token enforces from a firmware version onwards
#[derive(Debug, Clone, Copy)]
pub struct ComplianceTier {
    /// First firmware of the tier
    pub since: FirmwareVersion,
    /// Key types the tier refuses to generate or import
    pub rejected_key_types: &'static [KeyType],
    /// Generated and imported keys must use PIN-Always and Touch-Always
    pub strict_key_policies: bool,
    /// Management key changes must use an AES algorithm
    pub aes_management_key_required: bool,
}

/// Sorted by `since`, the last matching row wins
pub const COMPLIANCE_TIERS: &[ComplianceTier] = &[
    ComplianceTier {
        since: FirmwareVersion::new(4, 4, 0),
        rejected_key_types: &[KeyType::Rsa1024],
        strict_key_policies: true,
        aes_management_key_required: false,
    },
    ComplianceTier {
        since: FirmwareVersion::new(5, 7, 0),
        rejected_key_types: &[KeyType::Rsa1024, KeyType::Ed25519, KeyType::X25519],
        strict_key_policies: true,
        aes_management_key_required: true,
    },
];

/// Capability predicates for one token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenPolicy {
    version: FirmwareVersion,
    compliance_mode: bool,
}

impl TokenPolicy {
    /// Policy for a token running `version`
    pub const fn new(version: FirmwareVersion, compliance_mode: bool) -> Self {
        Self { version, compliance_mode }
    }

    /// Firmware the policy was resolved for
    pub const fn version(&self) -> FirmwareVersion {
        self.version
    }

    /// Whether compliance tier rules apply
    pub const fn is_compliance_mode(&self) -> bool {
        self.compliance_mode
    }

    /// Whether the firmware has `feature`
    pub fn supports(&self, feature: Feature) -> bool {
        FEATURE_GATES
            .iter()
            .find(|gate| gate.feature == feature)
            .is_some_and(|gate| self.version >= gate.since)
    }

    /// Fail with `Unsupported` unless the firmware has `feature`
    pub fn require(&self, feature: Feature) -> Result<()> {
        if self.supports(feature) {
            Ok(())
        } else {
            debug!(%feature, version = %self.version, "Feature not supported by firmware");
            Err(Error::Unsupported(match feature {
                Feature::P384 => "P-384 keys require firmware 4.0",
                Feature::Attestation => "attestation requires firmware 4.3",
                Feature::Serial => "serial number requires firmware 5.0",
                Feature::Metadata => "metadata requires firmware 5.3",
                Feature::AesManagementKey => "AES management keys require firmware 5.4",
                Feature::Rsa3072And4096 => "RSA-3072/4096 keys require firmware 5.7",
                Feature::Curve25519 => "Ed25519/X25519 keys require firmware 5.7",
            }))
        }
    }

    /// Management key algorithm of a factory-fresh token with this firmware
    pub fn default_management_key_algorithm(&self) -> ManagementKeyAlgorithm {
        MANAGEMENT_KEY_DEFAULTS
            .iter()
            .rev()
            .find(|row| self.version >= row.since)
            .map_or(ManagementKeyAlgorithm::TripleDes, |row| row.algorithm)
    }

    /// Active compliance tier, if the token is in compliance mode and a tier applies
    pub fn compliance_tier(&self) -> Option<&'static ComplianceTier> {
        if !self.compliance_mode {
            return None;
        }
        COMPLIANCE_TIERS.iter().rev().find(|tier| self.version >= tier.since)
    }

    /// Firmware and compliance gate for a key type
    pub fn check_key_type(&self, key_type: KeyType) -> Result<()> {
        match key_type {
            KeyType::EccP384 => self.require(Feature::P384)?,
            KeyType::Rsa3072 | KeyType::Rsa4096 => self.require(Feature::Rsa3072And4096)?,
            KeyType::Ed25519 | KeyType::X25519 => self.require(Feature::Curve25519)?,
            _ => {}
        }

        if let Some(tier) = self.compliance_tier() {
            if tier.rejected_key_types.contains(&key_type) {
                debug!(%key_type, "Key type rejected by compliance tier");
                return Err(Error::Rejected("key type not allowed in compliance mode"));
            }
        }
        Ok(())
    }

    /// Compliance gate for the policies of a new key
    pub fn check_key_policies(&self, pin_policy: PinPolicy, touch_policy: TouchPolicy) -> Result<()> {
        match self.compliance_tier() {
            Some(tier)
                if tier.strict_key_policies
                    && (pin_policy != PinPolicy::Always || touch_policy != TouchPolicy::Always) =>
            {
                Err(Error::Rejected(
                    "compliance mode requires PIN-Always and Touch-Always policies",
                ))
            }
            _ => Ok(()),
        }
    }

    /// Gate a management key change and return the touch policy to apply
    pub fn check_management_key_change(
        &self,
        algorithm: ManagementKeyAlgorithm,
        touch_policy: TouchPolicy,
    ) -> Result<TouchPolicy> {
        if touch_policy == TouchPolicy::Cached {
            return Err(Error::InvalidArgument(
                "cached touch policy does not apply to the management key".into(),
            ));
        }

        match self.compliance_tier() {
            Some(tier) if tier.aes_management_key_required => {
                if !algorithm.is_aes() {
                    return Err(Error::Rejected("compliance mode requires an AES management key"));
                }
                match touch_policy {
                    TouchPolicy::Default | TouchPolicy::Always => {}
                    _ => {
                        return Err(Error::Rejected(
                            "compliance mode requires touch for the management key",
                        ));
                    }
                }
                self.require(Feature::AesManagementKey)?;
                Ok(TouchPolicy::Always)
            }
            _ => {
                if algorithm.is_aes() {
                    self.require(Feature::AesManagementKey)?;
                }
                Ok(match touch_policy {
                    TouchPolicy::Default => TouchPolicy::Never,
                    other => other,
                })
            }
        }
    }
}
