//! Session, lookup and signing behaviour against the software token

#![cfg(feature = "soft-token")]

mod common;

use common::{logged_in_session, soft_module, KEY_LABEL, PIN};
use hsm_tls::backend::soft::{SoftCall, SoftKeyPair, SoftModule, SoftToken};
use hsm_tls::backend::SlotId;
use hsm_tls::{
    find_private_key, ErrorKind, HsmModule, HsmSigner, KeySigner, SessionState, SignatureScheme,
};
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use pretty_assertions::assert_eq;
use secrecy::SecretString;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn signer(soft: &SoftModule) -> Arc<HsmSigner> {
    let session = logged_in_session(soft);
    let key = find_private_key(&session, KEY_LABEL).unwrap();
    Arc::new(HsmSigner::new(session, key).unwrap())
}

#[test]
fn test_ecdsa_signatures_verify_with_p256() {
    let key_pair = SoftKeyPair::generate_p256();
    let SoftKeyPair::P256(secret) = &key_pair else {
        unreachable!()
    };
    let verifying_key = *secret.verifying_key();
    let signer = signer(&soft_module(&key_pair));

    for message in [&b""[..], b"a", b"client certificate verify"] {
        let digest = SignatureScheme::EcdsaP256Sha256.hash().digest(message);
        let der = signer
            .sign(&digest, SignatureScheme::EcdsaP256Sha256)
            .unwrap();
        let signature = p256::ecdsa::Signature::from_der(&der).unwrap();
        verifying_key.verify_prehash(&digest, &signature).unwrap();
    }
}

#[test]
fn test_rsa_signatures_verify_with_rsa() {
    use rsa::{Pkcs1v15Sign, Pss};
    use sha2::{Sha256, Sha384, Sha512};

    let key_pair = SoftKeyPair::generate_rsa(2048).unwrap();
    let SoftKeyPair::Rsa(private) = &key_pair else {
        unreachable!()
    };
    let public = private.to_public_key();
    let signer = signer(&soft_module(&key_pair));

    for scheme in SignatureScheme::RSA {
        let digest = scheme.hash().digest(b"tls handshake transcript");
        let signature = signer.sign(&digest, scheme).unwrap();
        let verified = match scheme {
            SignatureScheme::RsaPkcs1Sha256 => public.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &signature),
            SignatureScheme::RsaPkcs1Sha384 => public.verify(Pkcs1v15Sign::new::<Sha384>(), &digest, &signature),
            SignatureScheme::RsaPkcs1Sha512 => public.verify(Pkcs1v15Sign::new::<Sha512>(), &digest, &signature),
            SignatureScheme::RsaPssSha256 => public.verify(Pss::new::<Sha256>(), &digest, &signature),
            SignatureScheme::RsaPssSha384 => public.verify(Pss::new::<Sha384>(), &digest, &signature),
            SignatureScheme::RsaPssSha512 => public.verify(Pss::new::<Sha512>(), &digest, &signature),
            _ => unreachable!(),
        };
        assert!(verified.is_ok(), "{:?} did not verify", scheme);
    }
}

#[test]
fn test_concurrent_signing_is_serialized() {
    let key_pair = SoftKeyPair::generate_p256();
    let soft = soft_module(&key_pair).with_sign_delay(Duration::from_millis(5));
    let signer = signer(&soft);

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let signer = Arc::clone(&signer);
            thread::spawn(move || {
                (0..5)
                    .map(|round| {
                        let message = format!("worker {} round {}", worker, round);
                        let signature = signer
                            .sign(
                                &SignatureScheme::EcdsaP256Sha256.hash().digest(message.as_bytes()),
                                SignatureScheme::EcdsaP256Sha256,
                            )
                            .unwrap();
                        (message, signature)
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    for handle in handles {
        for (message, signature) in handle.join().unwrap() {
            assert!(signer.public_key().verify(
                SignatureScheme::EcdsaP256Sha256,
                message.as_bytes(),
                &signature
            ));
        }
    }

    assert_eq!(soft.max_concurrent_signs(), 1);
    assert_eq!(signer.stats().signatures, 20);

    // Every SignInit is immediately followed by its Sign
    let signing: Vec<_> = soft
        .journal()
        .into_iter()
        .filter(|call| matches!(call, SoftCall::SignInit | SoftCall::Sign))
        .collect();
    assert_eq!(signing.len(), 40);
    for pair in signing.chunks(2) {
        assert_eq!(pair, &[SoftCall::SignInit, SoftCall::Sign][..]);
    }
}

#[test]
fn test_unknown_label_issues_no_sign() {
    let soft = soft_module(&SoftKeyPair::generate_p256());
    let session = logged_in_session(&soft);

    let err = find_private_key(&session, "no-such-key").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyNotFound);
    assert_eq!(soft.count(SoftCall::SignInit), 0);
    assert_eq!(soft.count(SoftCall::Sign), 0);
    assert_eq!(
        soft.count(SoftCall::FindObjectsInit),
        soft.count(SoftCall::FindObjectsFinal)
    );
}

#[test]
fn test_public_only_label_is_not_found() {
    let soft = SoftModule::new().with_token(
        SoftToken::new("t", PIN).with_public_key("verify-only", SoftKeyPair::generate_p256()),
    );
    let session = logged_in_session(&soft);

    let err = find_private_key(&session, "verify-only").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyNotFound);
}

#[test]
fn test_wrong_pin_then_close() {
    let soft = soft_module(&SoftKeyPair::generate_p256());
    let module = HsmModule::with_backend("soft", soft.clone());
    let session = module.open_rw_session(SlotId(0)).unwrap();
    drop(module);

    let err = session
        .login(SecretString::new("not-the-pin".to_string()))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
    assert!(!err.to_string().contains("not-the-pin"));

    let err = find_private_key(&session, KEY_LABEL).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotAuthenticated);

    session.close();
    session.close();
    drop(session);

    assert_eq!(
        soft.journal(),
        vec![
            SoftCall::OpenSession,
            SoftCall::Login,
            SoftCall::CloseSession,
            SoftCall::Finalize,
        ]
    );
}

#[test]
fn test_teardown_after_signing() {
    let soft = soft_module(&SoftKeyPair::generate_p256());
    let signer = signer(&soft);
    signer
        .sign(&[7u8; 32], SignatureScheme::EcdsaP256Sha256)
        .unwrap();
    assert_eq!(signer.session().state(), SessionState::Authenticated);

    drop(signer);
    let journal = soft.journal();
    assert_eq!(
        &journal[journal.len() - 3..],
        &[SoftCall::Logout, SoftCall::CloseSession, SoftCall::Finalize]
    );
    assert_eq!(soft.open_sessions(), 0);
}

#[test]
fn test_stale_handle_after_close() {
    let soft = soft_module(&SoftKeyPair::generate_p256());
    let signer = signer(&soft);
    signer.session().close();

    let err = signer
        .sign(&[7u8; 32], SignatureScheme::EcdsaP256Sha256)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SessionClosed);

    // A fresh session does not accept the old handle
    let other = logged_in_session(&soft);
    let err = hsm_tls::find_public_key(&other, signer.key()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StaleKeyHandle);
}

#[test]
fn test_token_label_selection() {
    let soft = SoftModule::new()
        .with_token(SoftToken::new("staging", "1111"))
        .with_token(
            SoftToken::new("production", PIN).with_key_pair(KEY_LABEL, SoftKeyPair::generate_p256()),
        );
    let module = HsmModule::with_backend("soft", soft);

    let slot = module
        .select_slot(&hsm_tls::SlotSelection::TokenLabel("production".to_string()))
        .unwrap();
    assert_eq!(slot, SlotId(1));

    let err = module
        .select_slot(&hsm_tls::SlotSelection::TokenLabel("qa".to_string()))
        .unwrap_err();
    match err {
        hsm_tls::HsmTlsError::TokenNotFound { label, available } => {
            assert_eq!(label, "qa");
            assert_eq!(available, vec!["staging".to_string(), "production".to_string()]);
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[cfg(feature = "pkcs11")]
#[tokio::test]
async fn test_open_async_reports_missing_module() {
    let config = hsm_tls::HsmTlsConfig::builder()
        .module_path("/nonexistent/libpkcs11-missing.so")
        .user_pin(SecretString::new(PIN.to_string()))
        .key_label(KEY_LABEL)
        .build()
        .unwrap();

    let err = hsm_tls::HsmIdentity::open_async(config).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ModuleLoadFailed);
    assert!(err.to_string().contains("libpkcs11-missing.so"));
}
