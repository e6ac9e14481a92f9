//! Shared fixtures: a throwaway PKI, a software token and an in-memory
//! rustls connection pair

#![allow(dead_code)]

use hsm_tls::backend::soft::{SoftKeyPair, SoftModule, SoftToken};
use hsm_tls::backend::SlotId;
use hsm_tls::{HsmModule, Session};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection};
use secrecy::SecretString;
use std::sync::Arc;

pub const PIN: &str = "4321";
pub const KEY_LABEL: &str = "tls-client";

/// Test CA plus a server certificate for `localhost`
pub struct Pki {
    pub ca_cert: rcgen::Certificate,
    pub ca_key: KeyPair,
    pub server_chain: Vec<CertificateDer<'static>>,
    pub server_key_der: Vec<u8>,
}

impl Pki {
    pub fn new(common_name: &str) -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca_cert = params.self_signed(&ca_key).unwrap();

        let server_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let server_cert = params.signed_by(&server_key, &ca_cert, &ca_key).unwrap();

        Self {
            server_chain: vec![server_cert.der().clone()],
            server_key_der: server_key.serialize_der(),
            ca_cert,
            ca_key,
        }
    }

    pub fn ca_der(&self) -> CertificateDer<'static> {
        self.ca_cert.der().clone()
    }

    /// Client certificate for `key_pair`, issued by this CA
    pub fn issue_client(&self, key_pair: &SoftKeyPair) -> CertificateDer<'static> {
        let key = KeyPair::from_pem(&key_pair.to_pkcs8_pem().unwrap()).unwrap();
        let mut params = CertificateParams::new(vec!["client.test".to_string()]).unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, "hsm-tls client");
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        params
            .signed_by(&key, &self.ca_cert, &self.ca_key)
            .unwrap()
            .der()
            .clone()
    }

    /// Server that requires a client certificate issued by this CA
    pub fn server_config(
        &self,
        versions: &[&'static rustls::SupportedProtocolVersion],
    ) -> Arc<ServerConfig> {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let mut roots = RootCertStore::empty();
        roots.add(self.ca_der()).unwrap();
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()
            .unwrap();

        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.server_key_der.clone()));
        let config = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(versions)
            .unwrap()
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.server_chain.clone(), key)
            .unwrap();
        Arc::new(config)
    }
}

/// Software token holding `key_pair` under [`KEY_LABEL`]
pub fn soft_module(key_pair: &SoftKeyPair) -> SoftModule {
    SoftModule::new()
        .with_token(SoftToken::new("hsm-tls-test", PIN).with_key_pair(KEY_LABEL, key_pair.clone()))
}

/// Authenticated session on the first slot of `soft`
pub fn logged_in_session(soft: &SoftModule) -> Arc<Session> {
    let module = HsmModule::with_backend("soft", soft.clone());
    let session = module.open_rw_session(SlotId(0)).unwrap();
    session.login(SecretString::new(PIN.to_string())).unwrap();
    Arc::new(session)
}

/// Drive both ends until neither has anything left to send
pub fn handshake(
    client: &mut ClientConnection,
    server: &mut ServerConnection,
) -> Result<(), rustls::Error> {
    let mut buf = Vec::new();
    loop {
        let mut progressed = false;

        buf.clear();
        while client.wants_write() {
            client.write_tls(&mut buf).unwrap();
        }
        if !buf.is_empty() {
            progressed = true;
            let mut rd: &[u8] = &buf;
            while !rd.is_empty() {
                server.read_tls(&mut rd).unwrap();
            }
            server.process_new_packets()?;
        }

        buf.clear();
        while server.wants_write() {
            server.write_tls(&mut buf).unwrap();
        }
        if !buf.is_empty() {
            progressed = true;
            let mut rd: &[u8] = &buf;
            while !rd.is_empty() {
                client.read_tls(&mut rd).unwrap();
            }
            client.process_new_packets()?;
        }

        if !progressed {
            return Ok(());
        }
    }
}

pub fn connect(
    client_config: ClientConfig,
    server_config: Arc<ServerConfig>,
) -> (ClientConnection, ServerConnection) {
    let name = ServerName::try_from("localhost").unwrap();
    let client = ClientConnection::new(Arc::new(client_config), name).unwrap();
    let server = ServerConnection::new(server_config).unwrap();
    (client, server)
}
