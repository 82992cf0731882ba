//! PIV session
//!
//! [`PivSession`] owns the command channel and the authentication mirror for
//! its lifetime and hands out the operation components borrowing both.

use nexum_apdu_core::prelude::*;
use tracing::{debug, info, instrument};

use crate::auth::{AuthState, AuthenticationStateMachine};
use crate::channel::{CommandChannel, StatusCategory};
use crate::config::SessionConfig;
use crate::constants::{CLA, PIV_AID, ins};
use crate::credentials::{CredentialRequest, CredentialSource, RequestKind};
use crate::keys::KeySlotManager;
use crate::pin_only::{PinOnlyMode, PinOnlyModeManager};
use crate::policy::{Feature, TokenPolicy};
use crate::types::{CredentialKind, FirmwareVersion, ManagementKeyAlgorithm, TouchPolicy};
use crate::{Error, Result};

/// What the token reported when the session was opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenInfo {
    /// Firmware version from GET VERSION
    pub version: FirmwareVersion,
    /// Absent on firmware without the serial number command
    pub serial: Option<u32>,
    /// Whether the session enforces the compliance tier rules
    pub compliance_mode: bool,
}

/// PIV application session
#[derive(Debug)]
pub struct PivSession<T: CardTransport> {
    channel: CommandChannel<T>,
    state: AuthState,
    policy: TokenPolicy,
    info: TokenInfo,
    pin_derivation_iterations: u32,
}

impl<T: CardTransport> PivSession<T> {
    /// Select the PIV application and read the token's version and serial
    #[instrument(level = "debug", skip_all)]
    pub fn open(transport: T, config: SessionConfig) -> Result<Self> {
        let mut channel = CommandChannel::new(transport, &config);

        let select = Command::new_with_data(CLA, ins::SELECT, 0x04, 0x00, PIV_AID.to_vec());
        channel.exchange(&select)?.into_result()?;

        let reply = channel
            .exchange(&Command::new_with_le(CLA, ins::GET_VERSION, 0x00, 0x00, 256))?
            .into_result()?;
        let version = FirmwareVersion::try_from(reply.as_ref())?;
        let policy = TokenPolicy::new(version, config.compliance_mode);

        let serial = if policy.supports(Feature::Serial) {
            read_serial(&mut channel)?
        } else {
            None
        };

        let info = TokenInfo {
            version,
            serial,
            compliance_mode: config.compliance_mode,
        };
        info!(%version, ?serial, compliance_mode = info.compliance_mode, "PIV session opened");

        Ok(Self {
            channel,
            state: AuthState::default(),
            policy,
            info,
            pin_derivation_iterations: config.pin_derivation_iterations,
        })
    }

    /// Version and serial read at open
    pub const fn info(&self) -> &TokenInfo {
        &self.info
    }

    /// Feature gates and defaults for this token
    pub const fn policy(&self) -> TokenPolicy {
        self.policy
    }

    /// Client-side mirror of the token's authentication state
    pub const fn state(&self) -> &AuthState {
        &self.state
    }

    /// PIN, PUK and management key operations
    pub fn auth(&mut self) -> AuthenticationStateMachine<'_, T> {
        AuthenticationStateMachine::new(&mut self.channel, &mut self.state, self.policy)
    }

    /// Key slot operations
    pub fn keys(&mut self) -> KeySlotManager<'_, T> {
        KeySlotManager::new(&mut self.channel, &mut self.state, self.policy)
    }

    /// PIN-only mode operations
    pub fn pin_only(&mut self) -> PinOnlyModeManager<'_, T> {
        PinOnlyModeManager::new(
            &mut self.channel,
            &mut self.state,
            self.policy,
            self.pin_derivation_iterations,
        )
    }

    /// Direct access to the command channel for data objects
    pub fn channel(&mut self) -> &mut CommandChannel<T> {
        &mut self.channel
    }

    /// End the session and hand the transport back
    pub fn close(self) -> T {
        debug!("PIV session closed");
        self.channel.into_transport()
    }

    fn request(&self, kind: RequestKind) -> CredentialRequest {
        let mut request = CredentialRequest::new(kind);
        request.retries_remaining = self
            .state
            .retries(kind.credential())
            .map(|counter| counter.remaining);
        request
    }

    /// Ask `source` for a value and submit it, asking again after each
    /// rejection until the source declines or the token gives a final answer
    fn with_source<V, R>(
        &mut self,
        source: &mut dyn CredentialSource,
        mut request: CredentialRequest,
        mut ask: impl FnMut(&mut dyn CredentialSource, &CredentialRequest) -> Option<V>,
        mut submit: impl FnMut(&mut Self, &V) -> Result<R>,
    ) -> Result<R> {
        let result = loop {
            let Some(value) = ask(&mut *source, &request) else {
                debug!(kind = ?request.kind, "Credential source declined");
                break Err(Error::CredentialDeclined);
            };
            match submit(self, &value) {
                Err(Error::WrongValue { retries_remaining, .. }) => {
                    request = request.retry(retries_remaining);
                }
                Err(Error::AuthenticationFailed)
                    if request.kind.credential() == CredentialKind::ManagementKey =>
                {
                    request.is_retry = true;
                }
                outcome => break outcome,
            }
        };
        source.release();
        result
    }

    /// Verify the PIN with a value from `source`
    pub fn verify_pin_with_source(&mut self, source: &mut dyn CredentialSource) -> Result<()> {
        let request = self.request(RequestKind::VerifyPin);
        self.with_source(
            source,
            request,
            |source, request| source.verify_pin(request),
            |session, pin| session.auth().verify_pin(pin),
        )
    }

    /// Verify the PUK with a value from `source`
    pub fn verify_puk_with_source(&mut self, source: &mut dyn CredentialSource) -> Result<()> {
        let request = self.request(RequestKind::VerifyPuk);
        self.with_source(
            source,
            request,
            |source, request| source.verify_puk(request),
            |session, puk| session.auth().verify_puk(puk),
        )
    }

    /// Change the PIN with values from `source`
    ///
    /// A PIN-derived management key is replaced along with the PIN.
    pub fn change_pin_with_source(&mut self, source: &mut dyn CredentialSource) -> Result<()> {
        let request = self.request(RequestKind::ChangePin);
        self.with_source(
            source,
            request,
            |source, request| source.change_pin(request),
            |session, change| session.pin_only().change_pin(&change.current, &change.new),
        )
    }

    /// Change the PUK with values from `source`
    pub fn change_puk_with_source(&mut self, source: &mut dyn CredentialSource) -> Result<()> {
        let request = self.request(RequestKind::ChangePuk);
        self.with_source(
            source,
            request,
            |source, request| source.change_puk(request),
            |session, change| session.auth().change_puk(&change.current, &change.new),
        )
    }

    /// Unblock the PIN with the PUK, both from `source`
    pub fn reset_pin_with_source(&mut self, source: &mut dyn CredentialSource) -> Result<()> {
        let request = self.request(RequestKind::ResetPinWithPuk);
        self.with_source(
            source,
            request,
            |source, request| source.reset_pin_with_puk(request),
            |session, change| session.auth().reset_pin_with_puk(&change.current, &change.new),
        )
    }

    /// Authenticate with a management key from `source`
    pub fn authenticate_with_source(
        &mut self,
        source: &mut dyn CredentialSource,
        mutual: bool,
    ) -> Result<()> {
        let algorithm = self.auth().expected_management_key_algorithm()?;
        let request = CredentialRequest::new(RequestKind::AuthenticateManagementKey)
            .with_algorithm(algorithm);
        self.with_source(
            source,
            request,
            |source, request| source.authenticate_management_key(request),
            |session, key| session.auth().authenticate_management_key(key, mutual),
        )
    }

    /// Replace the management key with values from `source`
    ///
    /// Authenticates with the current key first, then installs the new one.
    pub fn change_management_key_with_source(
        &mut self,
        source: &mut dyn CredentialSource,
        touch_policy: TouchPolicy,
    ) -> Result<TouchPolicy> {
        let algorithm = self.auth().expected_management_key_algorithm()?;
        let request =
            CredentialRequest::new(RequestKind::ChangeManagementKey).with_algorithm(algorithm);
        self.with_source(
            source,
            request,
            |source, request| source.change_management_key(request),
            |session, change| {
                let mut auth = session.auth();
                auth.authenticate_management_key(&change.current, false)?;
                auth.change_management_key(&change.new, touch_policy)
            },
        )
    }

    /// Configure PIN-only mode, taking the PIN from `source`
    ///
    /// The session must already be authenticated with the management key.
    pub fn set_pin_only_mode_with_source(
        &mut self,
        source: &mut dyn CredentialSource,
        mode: PinOnlyMode,
        algorithm: ManagementKeyAlgorithm,
    ) -> Result<()> {
        let request = self.request(RequestKind::VerifyPin);
        self.with_source(
            source,
            request,
            |source, request| source.verify_pin(request),
            |session, pin| session.pin_only().set_mode(mode, algorithm, pin),
        )
    }

    /// Recover management key authentication from the PIN supplied by `source`
    pub fn recover_pin_only_with_source(
        &mut self,
        source: &mut dyn CredentialSource,
    ) -> Result<PinOnlyMode> {
        let request = self.request(RequestKind::VerifyPin);
        self.with_source(
            source,
            request,
            |source, request| source.verify_pin(request),
            |session, pin| session.pin_only().try_recover(pin),
        )
    }
}

fn read_serial<T: CardTransport>(channel: &mut CommandChannel<T>) -> Result<Option<u32>> {
    let reply = channel.exchange(&Command::new_with_le(CLA, ins::GET_SERIAL, 0x00, 0x00, 256))?;
    match reply.category {
        StatusCategory::Success => match reply.payload.as_ref() {
            [a, b, c, d] => Ok(Some(u32::from_be_bytes([*a, *b, *c, *d]))),
            _ => Err(Error::ProtocolViolation("serial number must be four bytes")),
        },
        // Some tokens hide the serial number by configuration
        StatusCategory::Failed(_) | StatusCategory::NoData => {
            debug!(status = %reply.status, "Serial number not available");
            Ok(None)
        }
        _ => Err(reply.into_error()),
    }
}
