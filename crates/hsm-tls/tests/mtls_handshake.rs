//! Mutual TLS handshakes where the client key lives on the software token
//!
//! The server side is plain rustls requiring a client certificate, so every
//! handshake here proves the server accepted a CertificateVerify signature
//! produced through `C_SignInit`/`C_Sign`.

#![cfg(feature = "soft-token")]

mod common;

use common::{connect, handshake, logged_in_session, soft_module, Pki, KEY_LABEL};
use hsm_tls::backend::soft::{SoftCall, SoftKeyPair, SoftModule};
use hsm_tls::{
    find_private_key, Credential, ErrorKind, HsmSigner, KeySigner, PeerVerification, TlsPolicy,
    TlsVersion,
};
use pretty_assertions::assert_eq;
use std::io::{Read, Write};
use std::sync::Arc;

fn credential_for(pki: &Pki, key_pair: &SoftKeyPair) -> (SoftModule, Credential) {
    let soft = soft_module(key_pair);
    let session = logged_in_session(&soft);
    let key = find_private_key(&session, KEY_LABEL).unwrap();
    let signer: Arc<dyn KeySigner> = Arc::new(HsmSigner::new(session, key).unwrap());
    let credential = Credential::assemble(vec![pki.issue_client(key_pair)], signer).unwrap();
    (soft, credential)
}

fn strict_policy(pki: &Pki) -> TlsPolicy {
    TlsPolicy::default()
        .without_webpki_roots()
        .with_root(pki.ca_der())
}

#[test]
fn test_ecdsa_client_tls13() {
    let pki = Pki::new("hsm-tls test CA");
    let key_pair = SoftKeyPair::generate_p256();
    let (soft, credential) = credential_for(&pki, &key_pair);

    let policy = strict_policy(&pki).with_min_version(TlsVersion::Tls13);
    let (mut client, mut server) = connect(
        credential.attach(&policy).unwrap(),
        pki.server_config(&[&rustls::version::TLS13]),
    );
    handshake(&mut client, &mut server).unwrap();

    let presented = server.peer_certificates().unwrap();
    assert_eq!(presented[0].as_ref(), credential.chain()[0].as_ref());
    assert_eq!(client.protocol_version(), Some(rustls::ProtocolVersion::TLSv1_3));

    client.writer().write_all(b"ping").unwrap();
    handshake(&mut client, &mut server).unwrap();
    let mut received = [0u8; 4];
    server.reader().read_exact(&mut received).unwrap();
    assert_eq!(&received, b"ping");

    // Assembly proof of possession plus the CertificateVerify signature
    assert_eq!(soft.count(SoftCall::Sign), 2);
}

#[test]
fn test_rsa_client_tls12() {
    let pki = Pki::new("hsm-tls test CA");
    let key_pair = SoftKeyPair::generate_rsa(2048).unwrap();
    let (soft, credential) = credential_for(&pki, &key_pair);

    let (mut client, mut server) = connect(
        credential.attach(&strict_policy(&pki)).unwrap(),
        pki.server_config(&[&rustls::version::TLS12]),
    );
    handshake(&mut client, &mut server).unwrap();

    assert!(server.peer_certificates().is_some());
    assert_eq!(client.protocol_version(), Some(rustls::ProtocolVersion::TLSv1_2));
    assert_eq!(soft.count(SoftCall::Sign), 2);
}

#[test]
fn test_rsa_client_tls13_uses_pss() {
    let pki = Pki::new("hsm-tls test CA");
    let key_pair = SoftKeyPair::generate_rsa(2048).unwrap();
    let (_soft, credential) = credential_for(&pki, &key_pair);

    let (mut client, mut server) = connect(
        credential.attach(&strict_policy(&pki)).unwrap(),
        pki.server_config(&[&rustls::version::TLS13]),
    );
    handshake(&mut client, &mut server).unwrap();
    assert!(server.peer_certificates().is_some());
}

#[test]
fn test_strict_verification_rejects_unknown_server() {
    let pki = Pki::new("hsm-tls test CA");
    let other = Pki::new("unrelated CA");
    let key_pair = SoftKeyPair::generate_p256();
    let (soft, credential) = credential_for(&pki, &key_pair);

    let (mut client, mut server) = connect(
        credential.attach(&strict_policy(&other)).unwrap(),
        pki.server_config(&[&rustls::version::TLS13]),
    );
    let err = handshake(&mut client, &mut server).unwrap_err();
    assert!(matches!(err, rustls::Error::InvalidCertificate(_)), "{:?}", err);
    // The handshake never reached CertificateVerify
    assert_eq!(soft.count(SoftCall::Sign), 1);
}

#[test]
fn test_insecure_override_accepts_unknown_server() {
    let pki = Pki::new("hsm-tls test CA");
    let key_pair = SoftKeyPair::generate_p256();
    let (_soft, credential) = credential_for(&pki, &key_pair);

    let policy = TlsPolicy::default()
        .with_peer_verification(PeerVerification::DangerousAcceptAnyCertificate);
    let (mut client, mut server) = connect(
        credential.attach(&policy).unwrap(),
        pki.server_config(&[&rustls::version::TLS13]),
    );
    handshake(&mut client, &mut server).unwrap();
    assert!(server.peer_certificates().is_some());
}

#[test]
fn test_server_rejects_client_from_other_ca() {
    let pki = Pki::new("hsm-tls test CA");
    let rogue = Pki::new("rogue CA");
    let key_pair = SoftKeyPair::generate_p256();
    // Certificate is valid for the key, but issued by a CA the server does not trust
    let (_soft, credential) = credential_for(&rogue, &key_pair);

    let (mut client, mut server) = connect(
        credential.attach(&strict_policy(&pki)).unwrap(),
        pki.server_config(&[&rustls::version::TLS13]),
    );
    assert!(handshake(&mut client, &mut server).is_err());
}

#[test]
fn test_mismatched_certificate_produces_no_credential() {
    let pki = Pki::new("hsm-tls test CA");
    let key_pair = SoftKeyPair::generate_p256();
    let soft = soft_module(&key_pair);
    let session = logged_in_session(&soft);
    let key = find_private_key(&session, KEY_LABEL).unwrap();
    let signer: Arc<dyn KeySigner> = Arc::new(HsmSigner::new(session, key).unwrap());

    let foreign = pki.issue_client(&SoftKeyPair::generate_p256());
    let err = Credential::assemble(vec![foreign], signer).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyMismatch);
    assert_eq!(soft.count(SoftCall::Sign), 0);
}
