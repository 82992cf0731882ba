//! Credential collection
//!
//! Operations that need a PIN, PUK or management key ask a [`CredentialSource`]
//! for it at the moment of the exchange. The state machines never know whether
//! the value came from a constant, a random generator or a prompt.

use rand::Rng;
use tracing::debug;

use crate::mgmt_key::ManagementKey;
use crate::types::{Credential, CredentialKind, ManagementKeyAlgorithm};

/// Type for function that provides an input string (ie. PIN)
pub type InputRequestFn = Box<dyn Fn(&str) -> String + Send + Sync>;

/// What the caller is being asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Verify the PIN
    VerifyPin,
    /// Verify the PUK
    VerifyPuk,
    /// Current and new PIN
    ChangePin,
    /// Current and new PUK
    ChangePuk,
    /// PUK and a new PIN
    ResetPinWithPuk,
    /// Current management key
    AuthenticateManagementKey,
    /// Current and new management key
    ChangeManagementKey,
}

impl RequestKind {
    /// Credential the current value belongs to
    pub const fn credential(self) -> CredentialKind {
        match self {
            Self::VerifyPin | Self::ChangePin => CredentialKind::Pin,
            Self::VerifyPuk | Self::ChangePuk | Self::ResetPinWithPuk => CredentialKind::Puk,
            Self::AuthenticateManagementKey | Self::ChangeManagementKey => {
                CredentialKind::ManagementKey
            }
        }
    }
}

/// A single request handed to a [`CredentialSource`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CredentialRequest {
    /// What is being asked for
    pub kind: RequestKind,
    /// The previous value for this request was rejected by the token
    pub is_retry: bool,
    /// Attempts left, when known
    pub retries_remaining: Option<u8>,
    /// Algorithm the token expects for the current management key
    pub algorithm: Option<ManagementKeyAlgorithm>,
}

impl CredentialRequest {
    /// First request of `kind`
    pub const fn new(kind: RequestKind) -> Self {
        Self {
            kind,
            is_retry: false,
            retries_remaining: None,
            algorithm: None,
        }
    }

    /// Attach the expected management key algorithm
    pub const fn with_algorithm(mut self, algorithm: ManagementKeyAlgorithm) -> Self {
        self.algorithm = Some(algorithm);
        self
    }

    /// Same request after the token rejected the previous value
    pub const fn retry(mut self, retries_remaining: u8) -> Self {
        self.is_retry = true;
        self.retries_remaining = Some(retries_remaining);
        self
    }
}

/// Current and new value for a change or reset request
///
/// For [`RequestKind::ResetPinWithPuk`] `current` is the PUK and `new` the PIN.
#[derive(Debug, Clone)]
pub struct CredentialChange {
    /// Value on the token now (the PUK for a reset)
    pub current: Credential,
    /// Value to install
    pub new: Credential,
}

/// Current and new management key
#[derive(Debug, Clone)]
pub struct ManagementKeyChange {
    /// Key on the token now
    pub current: ManagementKey,
    /// Key to install
    pub new: ManagementKey,
}

/// Supplies credentials on demand. Returning `None` declines the request and
/// the operation fails without a further exchange.
pub trait CredentialSource {
    /// PIN for a verification
    fn verify_pin(&mut self, request: &CredentialRequest) -> Option<Credential>;

    /// PUK for a verification
    fn verify_puk(&mut self, request: &CredentialRequest) -> Option<Credential>;

    /// Current and new PIN
    fn change_pin(&mut self, request: &CredentialRequest) -> Option<CredentialChange>;

    /// Current and new PUK
    fn change_puk(&mut self, request: &CredentialRequest) -> Option<CredentialChange>;

    /// PUK and the PIN to set
    fn reset_pin_with_puk(&mut self, request: &CredentialRequest) -> Option<CredentialChange>;

    /// Current management key
    fn authenticate_management_key(&mut self, request: &CredentialRequest)
    -> Option<ManagementKey>;

    /// Current and new management key
    fn change_management_key(&mut self, request: &CredentialRequest)
    -> Option<ManagementKeyChange>;

    /// The operation that made the requests has finished. Drop anything held
    /// for it.
    fn release(&mut self) {}
}

/// Fixed values. Retries are always declined, the same value would fail again.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    pin: Option<Credential>,
    new_pin: Option<Credential>,
    puk: Option<Credential>,
    new_puk: Option<Credential>,
    management_key: Option<ManagementKey>,
    new_management_key: Option<ManagementKey>,
}

impl StaticCredentials {
    /// Source with no values
    pub fn new() -> Self {
        Self::default()
    }

    /// PIN to answer with
    pub fn with_pin(mut self, pin: impl Into<Credential>) -> Self {
        self.pin = Some(pin.into());
        self
    }

    /// New PIN for change and reset requests
    pub fn with_new_pin(mut self, pin: impl Into<Credential>) -> Self {
        self.new_pin = Some(pin.into());
        self
    }

    /// PUK to answer with
    pub fn with_puk(mut self, puk: impl Into<Credential>) -> Self {
        self.puk = Some(puk.into());
        self
    }

    /// New PUK for change requests
    pub fn with_new_puk(mut self, puk: impl Into<Credential>) -> Self {
        self.new_puk = Some(puk.into());
        self
    }

    /// Management key to answer with
    pub fn with_management_key(mut self, key: ManagementKey) -> Self {
        self.management_key = Some(key);
        self
    }

    /// New management key for change requests
    pub fn with_new_management_key(mut self, key: ManagementKey) -> Self {
        self.new_management_key = Some(key);
        self
    }

    fn first_attempt<V: Clone>(request: &CredentialRequest, value: &Option<V>) -> Option<V> {
        if request.is_retry {
            debug!(kind = ?request.kind, "Static credential rejected, declining retry");
            return None;
        }
        value.clone()
    }

    fn pair(
        request: &CredentialRequest,
        current: &Option<Credential>,
        new: &Option<Credential>,
    ) -> Option<CredentialChange> {
        Some(CredentialChange {
            current: Self::first_attempt(request, current)?,
            new: new.clone()?,
        })
    }
}

impl CredentialSource for StaticCredentials {
    fn verify_pin(&mut self, request: &CredentialRequest) -> Option<Credential> {
        Self::first_attempt(request, &self.pin)
    }

    fn verify_puk(&mut self, request: &CredentialRequest) -> Option<Credential> {
        Self::first_attempt(request, &self.puk)
    }

    fn change_pin(&mut self, request: &CredentialRequest) -> Option<CredentialChange> {
        Self::pair(request, &self.pin, &self.new_pin)
    }

    fn change_puk(&mut self, request: &CredentialRequest) -> Option<CredentialChange> {
        Self::pair(request, &self.puk, &self.new_puk)
    }

    fn reset_pin_with_puk(&mut self, request: &CredentialRequest) -> Option<CredentialChange> {
        Self::pair(request, &self.puk, &self.new_pin)
    }

    fn authenticate_management_key(
        &mut self,
        request: &CredentialRequest,
    ) -> Option<ManagementKey> {
        Self::first_attempt(request, &self.management_key)
    }

    fn change_management_key(
        &mut self,
        request: &CredentialRequest,
    ) -> Option<ManagementKeyChange> {
        Some(ManagementKeyChange {
            current: Self::first_attempt(request, &self.management_key)?,
            new: self.new_management_key.clone()?,
        })
    }
}

/// Random new values for change requests. Current values come from `inner`.
///
/// The last generated values stay readable after the operation finished, until
/// the next request replaces them or [`RandomCredentials::forget`] drops them.
#[derive(Debug)]
pub struct RandomCredentials<S> {
    inner: S,
    pin_len: usize,
    new_management_key_algorithm: Option<ManagementKeyAlgorithm>,
    last_credential: Option<Credential>,
    last_management_key: Option<ManagementKey>,
}

impl<S: CredentialSource> RandomCredentials<S> {
    /// Wrap `inner`, generating 8 digit PINs
    pub const fn new(inner: S) -> Self {
        Self {
            inner,
            pin_len: 8,
            new_management_key_algorithm: None,
            last_credential: None,
            last_management_key: None,
        }
    }

    /// Length of generated PINs and PUKs, clamped to 6..=8
    pub fn with_pin_len(mut self, len: usize) -> Self {
        self.pin_len = len.clamp(6, 8);
        self
    }

    /// Algorithm for generated management keys, defaults to the current one
    pub const fn with_management_key_algorithm(mut self, algorithm: ManagementKeyAlgorithm) -> Self {
        self.new_management_key_algorithm = Some(algorithm);
        self
    }

    /// Last generated PIN or PUK
    pub const fn generated_credential(&self) -> Option<&Credential> {
        self.last_credential.as_ref()
    }

    /// Last generated management key
    pub const fn generated_management_key(&self) -> Option<&ManagementKey> {
        self.last_management_key.as_ref()
    }

    /// Drop the last generated values
    pub fn forget(&mut self) {
        self.last_credential = None;
        self.last_management_key = None;
    }

    /// Wrapped source
    pub fn into_inner(self) -> S {
        self.inner
    }

    fn random_digits(&mut self) -> Credential {
        let mut rng = rand::rng();
        let digits: Vec<u8> = (0..self.pin_len).map(|_| b'0' + rng.random_range(0..10u8)).collect();
        let credential = Credential::new(digits);
        self.last_credential = Some(credential.clone());
        credential
    }

    fn random_change(&mut self, current: Option<Credential>) -> Option<CredentialChange> {
        let current = current?;
        Some(CredentialChange { current, new: self.random_digits() })
    }
}

impl<S: CredentialSource> CredentialSource for RandomCredentials<S> {
    fn verify_pin(&mut self, request: &CredentialRequest) -> Option<Credential> {
        self.inner.verify_pin(request)
    }

    fn verify_puk(&mut self, request: &CredentialRequest) -> Option<Credential> {
        self.inner.verify_puk(request)
    }

    fn change_pin(&mut self, request: &CredentialRequest) -> Option<CredentialChange> {
        let current = self.inner.verify_pin(request);
        self.random_change(current)
    }

    fn change_puk(&mut self, request: &CredentialRequest) -> Option<CredentialChange> {
        let current = self.inner.verify_puk(request);
        self.random_change(current)
    }

    fn reset_pin_with_puk(&mut self, request: &CredentialRequest) -> Option<CredentialChange> {
        let current = self.inner.verify_puk(request);
        self.random_change(current)
    }

    fn authenticate_management_key(
        &mut self,
        request: &CredentialRequest,
    ) -> Option<ManagementKey> {
        self.inner.authenticate_management_key(request)
    }

    fn change_management_key(
        &mut self,
        request: &CredentialRequest,
    ) -> Option<ManagementKeyChange> {
        let current = self.inner.authenticate_management_key(request)?;
        let algorithm = self.new_management_key_algorithm.unwrap_or(current.algorithm());
        let new = ManagementKey::generate(algorithm);
        self.last_management_key = Some(new.clone());
        Some(ManagementKeyChange { current, new })
    }

    fn release(&mut self) {
        self.inner.release();
    }
}

/// Prompts through a callback. An empty answer declines the request.
///
/// Management keys are entered as hex.
pub struct InteractiveCredentials {
    input_request_callback: InputRequestFn,
}

impl InteractiveCredentials {
    /// Prompt through `input_request_callback`
    pub fn new(input_request_callback: InputRequestFn) -> Self {
        Self { input_request_callback }
    }

    fn prompt(&self, request: &CredentialRequest, what: &str) -> Option<Credential> {
        let prompt = match request.retries_remaining {
            Some(retries) if request.is_retry => {
                format!("Wrong value, {retries} attempts remaining. Enter {what}")
            }
            _ => format!("Enter {what}"),
        };
        let answer = (self.input_request_callback)(&prompt);
        let answer = answer.trim();
        if answer.is_empty() {
            debug!(kind = ?request.kind, "Interactive credential request declined");
            return None;
        }
        Some(Credential::from(answer))
    }

    fn prompt_pair(
        &self,
        request: &CredentialRequest,
        current: &str,
        new: &str,
    ) -> Option<CredentialChange> {
        Some(CredentialChange {
            current: self.prompt(request, current)?,
            new: self.prompt(request, new)?,
        })
    }

    fn prompt_key(
        &self,
        request: &CredentialRequest,
        what: &str,
        algorithm: ManagementKeyAlgorithm,
    ) -> Option<ManagementKey> {
        let answer = self.prompt(request, &format!("{what} ({algorithm}, hex)"))?;
        let text = std::str::from_utf8(answer.as_bytes()).ok()?;
        let bytes = hex::decode(text).ok()?;
        ManagementKey::new(algorithm, bytes).ok()
    }
}

impl std::fmt::Debug for InteractiveCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractiveCredentials").finish_non_exhaustive()
    }
}

impl CredentialSource for InteractiveCredentials {
    fn verify_pin(&mut self, request: &CredentialRequest) -> Option<Credential> {
        self.prompt(request, "PIN")
    }

    fn verify_puk(&mut self, request: &CredentialRequest) -> Option<Credential> {
        self.prompt(request, "PUK")
    }

    fn change_pin(&mut self, request: &CredentialRequest) -> Option<CredentialChange> {
        self.prompt_pair(request, "current PIN", "new PIN")
    }

    fn change_puk(&mut self, request: &CredentialRequest) -> Option<CredentialChange> {
        self.prompt_pair(request, "current PUK", "new PUK")
    }

    fn reset_pin_with_puk(&mut self, request: &CredentialRequest) -> Option<CredentialChange> {
        self.prompt_pair(request, "PUK", "new PIN")
    }

    fn authenticate_management_key(
        &mut self,
        request: &CredentialRequest,
    ) -> Option<ManagementKey> {
        let algorithm = request.algorithm.unwrap_or(ManagementKeyAlgorithm::TripleDes);
        self.prompt_key(request, "management key", algorithm)
    }

    fn change_management_key(
        &mut self,
        request: &CredentialRequest,
    ) -> Option<ManagementKeyChange> {
        let algorithm = request.algorithm.unwrap_or(ManagementKeyAlgorithm::TripleDes);
        Some(ManagementKeyChange {
            current: self.prompt_key(request, "current management key", algorithm)?,
            new: self.prompt_key(request, "new management key", algorithm)?,
        })
    }
}
