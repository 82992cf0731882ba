//! PIN-only mode configuration, recovery and repair

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::*;
use nexum_piv::constants::objects;
use nexum_piv::{
    AxisState, Credential, Error, InteractiveCredentials, ManagementKey, ManagementKeyAlgorithm,
    PinOnlyAxis, PinOnlyMode, PivSession, SessionConfig, StaticCredentials, TouchPolicy,
};

fn config() -> SessionConfig {
    SessionConfig::new().with_pin_derivation_iterations(1_000)
}

/// Writes are not retried, so every dropped transmission surfaces
fn fragile_config() -> SessionConfig {
    config().with_object_write_attempts(1)
}

/// Recover with whichever of the two PINs the token currently holds
fn recover_with_either(
    session: &mut PivSession<SimulatedToken>,
    old: &Credential,
    new: &Credential,
) -> PinOnlyMode {
    match session.pin_only().try_recover(old) {
        Err(Error::WrongValue { .. }) => session.pin_only().try_recover(new).unwrap(),
        outcome => outcome.unwrap(),
    }
}

fn configured(version: nexum_piv::FirmwareVersion, mode: PinOnlyMode) -> PivSession<SimulatedToken> {
    let mut session = open_with(SimulatedToken::new(version), config());
    authenticate(&mut session);
    session
        .pin_only()
        .set_mode(mode, ManagementKeyAlgorithm::TripleDes, &default_pin())
        .unwrap();
    session
}

#[test]
fn test_set_then_get() {
    for version in [V5_2, V5_7] {
        for mode in [
            PinOnlyMode::PROTECTED,
            PinOnlyMode::DERIVED,
            PinOnlyMode::PROTECTED_AND_DERIVED,
        ] {
            let mut session = configured(version, mode);
            assert_eq!(session.pin_only().get_mode().unwrap(), mode, "{version} {mode:?}");
            assert!(session.state().is_management_key_authenticated());
            assert!(!token(&mut session).management_key().is_default());

            // Printed data is locked again, the admin flag stands in for it
            let mut session = reopen(session, config());
            assert_eq!(session.pin_only().get_mode().unwrap(), mode, "{version} {mode:?}");
        }
    }
}

#[test]
fn test_fresh_token_has_no_mode() {
    let mut session = open_with(SimulatedToken::new(V5_7), config());
    assert_eq!(session.pin_only().get_mode().unwrap(), PinOnlyMode::NONE);
}

#[test]
fn test_protected_stores_token_key() {
    let mut session = configured(V5_4, PinOnlyMode::PROTECTED);
    let stored = token(&mut session).object(objects::PRINTED).unwrap().to_vec();
    let key = token(&mut session).management_key().clone();

    // 53 L 88 L 89 L key
    assert_eq!(&stored[2..4], &[0x88, 0x1A]);
    assert_eq!(&stored[4..6], &[0x89, 0x18]);
    assert_eq!(&stored[6..], key.as_bytes());
}

#[test]
fn test_recover_protected() {
    let session = configured(V5_7, PinOnlyMode::PROTECTED);
    let mut session = reopen(session, config());
    assert!(!session.state().is_management_key_authenticated());

    let recovered = session.pin_only().try_recover(&default_pin()).unwrap();
    assert_eq!(recovered, PinOnlyMode::PROTECTED);
    assert!(session.state().is_management_key_authenticated());
    assert!(session.state().is_pin_verified());
}

#[test]
fn test_recover_derived() {
    let session = configured(V5_2, PinOnlyMode::DERIVED);
    let mut session = reopen(session, config());

    let recovered = session.pin_only().try_recover(&default_pin()).unwrap();
    assert_eq!(recovered, PinOnlyMode::DERIVED);
    assert!(session.state().is_management_key_authenticated());
}

#[test]
fn test_recover_with_source() {
    let session = configured(V5_7, PinOnlyMode::PROTECTED_AND_DERIVED);
    let mut session = reopen(session, config());

    let mut source = StaticCredentials::new().with_pin("123456");
    let recovered = session.recover_pin_only_with_source(&mut source).unwrap();
    assert_eq!(recovered, PinOnlyMode::PROTECTED_AND_DERIVED);
}

#[test]
fn test_recover_with_wrong_pin() {
    let session = configured(V5_7, PinOnlyMode::DERIVED);
    let mut session = reopen(session, config());
    assert!(matches!(
        session.pin_only().try_recover(&Credential::new("654321")),
        Err(Error::WrongValue { retries_remaining: 2, .. })
    ));
    assert!(!session.state().is_management_key_authenticated());
}

#[test]
fn test_derived_unavailable_dominates() {
    for mode in [
        PinOnlyMode::NONE,
        PinOnlyMode::PROTECTED,
        PinOnlyMode::DERIVED,
        PinOnlyMode::PROTECTED_AND_DERIVED,
    ] {
        let mut session = configured(V5_7, mode);
        session.pin_only().mark_unavailable(PinOnlyAxis::Derived).unwrap();
        assert_eq!(session.pin_only().get_mode().unwrap(), PinOnlyMode::UNAVAILABLE);
        assert_eq!(session.pin_only().get_mode().unwrap().to_flags(), 0x0C);

        let mut session = reopen(session, config());
        assert_eq!(
            session.pin_only().try_recover(&default_pin()).unwrap(),
            PinOnlyMode::UNAVAILABLE
        );
        assert!(!session.state().is_management_key_authenticated());
    }
}

#[test]
fn test_protected_unavailable_keeps_derived() {
    let mut session = configured(V5_2, PinOnlyMode::PROTECTED_AND_DERIVED);
    session.pin_only().mark_unavailable(PinOnlyAxis::Protected).unwrap();
    assert_eq!(
        session.pin_only().get_mode().unwrap(),
        PinOnlyMode::new(AxisState::Unavailable, AxisState::Configured)
    );

    let mut session = reopen(session, config());
    let recovered = session.pin_only().try_recover(&default_pin()).unwrap();
    assert_eq!(recovered.derived, AxisState::Configured);
    assert_eq!(recovered.protected, AxisState::Unavailable);
}

#[test]
fn test_recovery_repairs_printed_data() {
    let session = configured(V5_7, PinOnlyMode::PROTECTED_AND_DERIVED);
    let mut session = reopen(session, config());
    token_mut(&mut session).remove_object(objects::PRINTED);

    let recovered = session.pin_only().try_recover(&default_pin()).unwrap();
    assert_eq!(recovered, PinOnlyMode::DERIVED);
    assert!(token(&mut session).object(objects::PRINTED).is_some());
    assert_eq!(
        session.pin_only().get_mode().unwrap(),
        PinOnlyMode::PROTECTED_AND_DERIVED
    );
}

#[test]
fn test_recovery_repairs_admin_flag() {
    let session = configured(V5_7, PinOnlyMode::PROTECTED);
    let mut session = reopen(session, config());
    token_mut(&mut session).remove_object(objects::ADMIN_DATA);

    let recovered = session.pin_only().try_recover(&default_pin()).unwrap();
    assert_eq!(recovered, PinOnlyMode::PROTECTED);
    assert!(token(&mut session).object(objects::ADMIN_DATA).is_some());

    // Locked printed data now falls back to the restored flag
    let mut session = reopen(session, config());
    assert_eq!(session.pin_only().get_mode().unwrap(), PinOnlyMode::PROTECTED);
}

#[test]
fn test_set_mode_preconditions() {
    let mut session = open_with(SimulatedToken::new(V5_7), config());
    assert!(matches!(
        session.pin_only().set_mode(
            PinOnlyMode::PROTECTED,
            ManagementKeyAlgorithm::Aes192,
            &default_pin()
        ),
        Err(Error::AuthenticationRequired(_))
    ));
    assert!(matches!(
        session.pin_only().set_mode(
            PinOnlyMode::UNAVAILABLE,
            ManagementKeyAlgorithm::TripleDes,
            &default_pin()
        ),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        session.pin_only().set_mode(
            PinOnlyMode::DERIVED,
            ManagementKeyAlgorithm::Aes128,
            &default_pin()
        ),
        Err(Error::InvalidArgument(_))
    ));
    assert!(token(&mut session).management_key().is_default());
}

#[test]
fn test_compliance_rejects_derived_mode() {
    let token = SimulatedToken::new(V5_7).with_compliance_mode(true);
    let mut session = open_with(token, config().with_compliance_mode(true));
    authenticate(&mut session);
    assert!(matches!(
        session.pin_only().set_mode(
            PinOnlyMode::DERIVED,
            ManagementKeyAlgorithm::TripleDes,
            &default_pin()
        ),
        Err(Error::Rejected(_))
    ));

    // Protected mode with an AES key is still possible
    session
        .pin_only()
        .set_mode(PinOnlyMode::PROTECTED, ManagementKeyAlgorithm::Aes256, &default_pin())
        .unwrap();
    assert_eq!(session.pin_only().get_mode().unwrap(), PinOnlyMode::PROTECTED);
    assert_eq!(
        common::token(&mut session).management_key().algorithm(),
        ManagementKeyAlgorithm::Aes256
    );
}

#[test]
fn test_set_mode_back_to_none() {
    let mut session = configured(V5_4, PinOnlyMode::PROTECTED_AND_DERIVED);
    session
        .pin_only()
        .set_mode(PinOnlyMode::NONE, ManagementKeyAlgorithm::TripleDes, &default_pin())
        .unwrap();

    assert_eq!(session.pin_only().get_mode().unwrap(), PinOnlyMode::NONE);
    assert!(token(&mut session).object(objects::PRINTED).is_none());
    assert!(token(&mut session).object(objects::ADMIN_DATA).is_none());
    assert!(token(&mut session).management_key().is_default());
}

#[test]
fn test_change_pin_replaces_derived_key() {
    let mut session = configured(V5_7, PinOnlyMode::PROTECTED_AND_DERIVED);
    let old_key = token(&mut session).management_key().clone();
    let new_pin = Credential::new("97531");
    assert!(session.pin_only().change_pin(&default_pin(), &new_pin).is_err());

    let new_pin = Credential::new("975310");
    session.pin_only().change_pin(&default_pin(), &new_pin).unwrap();
    let new_key = token(&mut session).management_key().clone();
    assert_ne!(old_key, new_key);
    assert_eq!(new_key.algorithm(), ManagementKeyAlgorithm::TripleDes);

    let mut session = reopen(session, config());
    assert!(matches!(
        session.pin_only().try_recover(&default_pin()),
        Err(Error::WrongValue { .. })
    ));
    let recovered = session.pin_only().try_recover(&new_pin).unwrap();
    assert_eq!(recovered, PinOnlyMode::PROTECTED_AND_DERIVED);

    // Printed data follows the new key
    let printed = token(&mut session).object(objects::PRINTED).unwrap().to_vec();
    assert!(printed.ends_with(new_key.as_bytes()));
}

#[test]
fn test_change_pin_without_pin_only_mode() {
    let mut session = open_with(SimulatedToken::new(V5_7), config());
    let new_pin = Credential::new("975310");
    session.pin_only().change_pin(&default_pin(), &new_pin).unwrap();
    assert!(token(&mut session).management_key().is_default());
    session.auth().verify_pin(&new_pin).unwrap();
}

#[test]
fn test_set_mode_with_source() {
    let mut session = open_with(SimulatedToken::new(V5_7), config());
    authenticate(&mut session);
    let mut source = StaticCredentials::new().with_pin("123456");
    session
        .set_pin_only_mode_with_source(
            &mut source,
            PinOnlyMode::PROTECTED,
            ManagementKeyAlgorithm::Aes128,
        )
        .unwrap();

    let stored = token(&mut session).object(objects::PRINTED).unwrap().to_vec();
    let key = ManagementKey::new(ManagementKeyAlgorithm::Aes128, stored[6..].to_vec()).unwrap();
    assert_eq!(token(&mut session).management_key(), &key);
}

#[test]
fn test_change_pin_wrong_old_pin_reports_retries() {
    let mut session = configured(V5_4, PinOnlyMode::DERIVED);
    let key = token(&mut session).management_key().clone();

    let result = session
        .pin_only()
        .change_pin(&Credential::new("654321"), &Credential::new("111111"));
    assert!(matches!(
        result,
        Err(Error::WrongValue { retries_remaining: 2, .. })
    ));
    assert_eq!(token(&mut session).pin_retries(), (2, 3));
    assert_eq!(token(&mut session).management_key(), &key);
    assert_eq!(session.pin_only().get_mode().unwrap(), PinOnlyMode::DERIVED);
}

#[test]
fn test_change_pin_with_source_asks_again() {
    let mut session = configured(V5_4, PinOnlyMode::DERIVED);
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let mut source = InteractiveCredentials::new(Box::new(move |_prompt: &str| {
        match seen.fetch_add(1, Ordering::SeqCst) {
            0 => "654321".to_string(),
            1 | 3 => "111111".to_string(),
            _ => "123456".to_string(),
        }
    }));

    session.change_pin_with_source(&mut source).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(token(&mut session).pin_retries(), (3, 3));

    let mut session = reopen(session, config());
    let recovered = session.pin_only().try_recover(&Credential::new("111111")).unwrap();
    assert_eq!(recovered, PinOnlyMode::DERIVED);
}

#[test]
fn test_change_pin_with_stale_salt() {
    let mut session = configured(V5_4, PinOnlyMode::DERIVED);
    let replacement = ManagementKey::generate(ManagementKeyAlgorithm::TripleDes);
    session
        .auth()
        .change_management_key(&replacement, TouchPolicy::Default)
        .unwrap();

    let new_pin = Credential::new("111111");
    session.pin_only().change_pin(&default_pin(), &new_pin).unwrap();
    session.auth().verify_pin(&new_pin).unwrap();
    assert_eq!(token(&mut session).management_key(), &replacement);

    // The salt no longer opens the token
    let mut session = reopen(session, config());
    let recovered = session.pin_only().try_recover(&new_pin).unwrap();
    assert_eq!(recovered, PinOnlyMode::NONE);
    assert!(!session.state().is_management_key_authenticated());
}

#[test]
fn test_recovery_replaces_stale_printed_key() {
    let session = configured(V5_4, PinOnlyMode::PROTECTED_AND_DERIVED);
    let mut session = reopen(session, config());
    let stale = ManagementKey::generate(ManagementKeyAlgorithm::TripleDes);
    let mut printed = vec![0x88, 0x1A, 0x89, 0x18];
    printed.extend_from_slice(stale.as_bytes());
    token_mut(&mut session).store_object(objects::PRINTED, &printed);

    let recovered = session.pin_only().try_recover(&default_pin()).unwrap();
    assert_eq!(recovered, PinOnlyMode::DERIVED);
    assert!(session.state().is_management_key_authenticated());

    let key = token(&mut session).management_key().clone();
    let stored = token(&mut session).object(objects::PRINTED).unwrap().to_vec();
    assert!(stored.ends_with(key.as_bytes()));
}

#[test]
fn test_set_mode_survives_interrupted_link() {
    for mode in [
        PinOnlyMode::PROTECTED,
        PinOnlyMode::DERIVED,
        PinOnlyMode::PROTECTED_AND_DERIVED,
    ] {
        let mut completed = false;
        for after in 0..32 {
            let mut session = open_with(SimulatedToken::new(V5_4), fragile_config());
            authenticate(&mut session);
            let old_key = token(&mut session).management_key().clone();
            token_mut(&mut session).fail_transmission_after(after);

            match session
                .pin_only()
                .set_mode(mode, ManagementKeyAlgorithm::TripleDes, &default_pin())
            {
                Ok(()) => {
                    completed = true;
                    break;
                }
                Err(error) => {
                    assert!(matches!(error, Error::Transport(_)), "{mode:?} after {after}: {error}")
                }
            }

            let mut session = reopen(session, config());
            if token(&mut session).management_key() == &old_key {
                continue;
            }
            let recovered = session.pin_only().try_recover(&default_pin()).unwrap();
            assert_ne!(recovered, PinOnlyMode::NONE, "{mode:?} after {after}");
            assert!(
                session.state().is_management_key_authenticated(),
                "{mode:?} after {after}"
            );
        }
        assert!(completed, "{mode:?} never completed");
    }
}

#[test]
fn test_change_pin_survives_interrupted_link() {
    let new_pin = Credential::new("975310");
    for mode in [PinOnlyMode::DERIVED, PinOnlyMode::PROTECTED_AND_DERIVED] {
        let mut completed = false;
        for after in 0..32 {
            let session = configured(V5_4, mode);
            let mut session = reopen(session, fragile_config());
            token_mut(&mut session).fail_transmission_after(after);

            match session.pin_only().change_pin(&default_pin(), &new_pin) {
                Ok(()) => completed = true,
                Err(error) => {
                    assert!(matches!(error, Error::Transport(_)), "{mode:?} after {after}: {error}")
                }
            }
            token_mut(&mut session).stop_failing();

            let mut session = reopen(session, config());
            let recovered = recover_with_either(&mut session, &default_pin(), &new_pin);
            assert_ne!(recovered, PinOnlyMode::NONE, "{mode:?} after {after}");
            assert!(
                session.state().is_management_key_authenticated(),
                "{mode:?} after {after}"
            );
            if completed {
                assert_eq!(recovered, mode);
                break;
            }
        }
        assert!(completed, "{mode:?} never completed");
    }
}

#[test]
fn test_interrupted_repair_is_finished_later() {
    let mut completed = false;
    for after in 0..32 {
        let session = configured(V5_4, PinOnlyMode::PROTECTED_AND_DERIVED);
        let mut session = reopen(session, fragile_config());
        token_mut(&mut session).remove_object(objects::PRINTED);
        token_mut(&mut session).fail_transmission_after(after);

        if session.pin_only().try_recover(&default_pin()).is_ok() {
            completed = true;
        }
        token_mut(&mut session).stop_failing();

        let mut session = reopen(session, config());
        let recovered = session.pin_only().try_recover(&default_pin()).unwrap();
        assert_eq!(recovered.derived, AxisState::Configured, "after {after}");
        assert_eq!(
            session.pin_only().get_mode().unwrap(),
            PinOnlyMode::PROTECTED_AND_DERIVED,
            "after {after}"
        );
        if completed {
            break;
        }
    }
    assert!(completed);
}
