//! Session layer for PIV smart cards
//!
//! This crate talks to the PIV application of a hardware token through any
//! [`nexum_apdu_core::CardTransport`]:
//!
//! - [`CommandChannel`] maps status words to typed outcomes and moves data
//!   objects larger than a single exchange
//! - [`AuthenticationStateMachine`] verifies, changes and resets PIN, PUK and
//!   management key
//! - [`KeySlotManager`] generates, imports and uses keys in slots under their
//!   PIN and touch policies
//! - [`PinOnlyModeManager`] keeps the management key recoverable from the PIN
//! - [`PivSession`] owns the channel and hands out the components above
//!
//! Credentials are collected through a [`CredentialSource`].
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

pub mod auth;
pub mod channel;
pub mod config;
pub mod constants;
pub mod credentials;
pub mod error;
pub mod keys;
pub mod mgmt_key;
pub mod pin_only;
pub mod policy;
pub mod session;
pub mod types;

mod tlv;

#[cfg(test)]
mod mock;

pub use auth::{AuthState, AuthenticationStateMachine, VerificationState};
pub use channel::{CommandChannel, FailureCode, Reply, StatusCategory};
pub use config::SessionConfig;
pub use credentials::{
    CredentialChange, CredentialRequest, CredentialSource, InputRequestFn,
    InteractiveCredentials, ManagementKeyChange, RandomCredentials, RequestKind,
    StaticCredentials,
};
pub use error::{Error, Result};
pub use keys::KeySlotManager;
pub use mgmt_key::ManagementKey;
pub use pin_only::{AxisState, PinOnlyAxis, PinOnlyMode, PinOnlyModeManager};
pub use policy::{Feature, TokenPolicy};
pub use session::{PivSession, TokenInfo};
pub use types::*;
