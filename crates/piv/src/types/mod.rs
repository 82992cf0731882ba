mod algorithm;
mod credential;
mod key;
mod metadata;
mod slot;
mod version;

pub use algorithm::{KeyFamily, KeyType, ManagementKeyAlgorithm};
pub use credential::{Credential, CredentialKind, RetryCounter};
pub use key::{PrivateKey, PublicKey, SharedSecret, Signature};
pub use metadata::{CredentialMetadata, ManagementKeyMetadata, SlotMetadata};
pub use slot::{KeyStatus, PinPolicy, SlotId, TouchPolicy};
pub use version::FirmwareVersion;
