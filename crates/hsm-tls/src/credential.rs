//! Credential assembly
//!
//! A [`Credential`] binds a certificate chain to the signer holding the
//! leaf's private key. Assembly refuses any chain whose leaf key differs
//! from the signer's public key, so a credential that exists is one the
//! server can verify.
//!
//! [`Credential::attach`] turns it into a `rustls::ClientConfig` under a
//! [`TlsPolicy`]: protocol floor, trust anchors and peer verification.

use crate::certificate;
use crate::public_key::PublicKeyMaterial;
use crate::signer::{prove_possession, KeySigner, RustlsSigningKey};
use crate::{HsmTlsError, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::ResolvesClientCert;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SupportedProtocolVersion};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Lowest TLS version a connection may negotiate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TlsVersion {
    /// TLS 1.2 and 1.3
    #[default]
    #[serde(rename = "1.2", alias = "TLS1.2", alias = "tls1.2")]
    Tls12,
    /// TLS 1.3 only
    #[serde(rename = "1.3", alias = "TLS1.3", alias = "tls1.3")]
    Tls13,
}

impl TlsVersion {
    fn protocol_versions(self) -> &'static [&'static SupportedProtocolVersion] {
        static TLS12_AND_UP: &[&SupportedProtocolVersion] =
            &[&rustls::version::TLS13, &rustls::version::TLS12];
        static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];
        match self {
            Self::Tls12 => TLS12_AND_UP,
            Self::Tls13 => TLS13_ONLY,
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tls12 => write!(f, "TLS 1.2"),
            Self::Tls13 => write!(f, "TLS 1.3"),
        }
    }
}

/// How the server's certificate is checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerVerification {
    /// WebPKI validation against the configured trust anchors
    #[default]
    Strict,
    /// Accept any server certificate. Handshake signatures are still
    /// checked, but the server's identity is not. Never use in production.
    DangerousAcceptAnyCertificate,
}

/// Negotiation policy applied by [`Credential::attach`]
#[derive(Debug, Clone)]
pub struct TlsPolicy {
    /// Protocol floor
    pub min_version: TlsVersion,
    /// Server certificate verification
    pub peer_verification: PeerVerification,
    /// Trust the Mozilla root set shipped in `webpki-roots`
    pub use_webpki_roots: bool,
    /// Additional trust anchors
    pub extra_roots: Vec<CertificateDer<'static>>,
}

impl Default for TlsPolicy {
    fn default() -> Self {
        Self {
            min_version: TlsVersion::default(),
            peer_verification: PeerVerification::default(),
            use_webpki_roots: true,
            extra_roots: Vec::new(),
        }
    }
}

impl TlsPolicy {
    /// Set the protocol floor
    pub fn with_min_version(mut self, version: TlsVersion) -> Self {
        self.min_version = version;
        self
    }

    /// Set the peer verification policy
    pub fn with_peer_verification(mut self, verification: PeerVerification) -> Self {
        self.peer_verification = verification;
        self
    }

    /// Trust `root` in addition to the configured anchors
    pub fn with_root(mut self, root: CertificateDer<'static>) -> Self {
        self.extra_roots.push(root);
        self
    }

    /// Trust only the extra roots, not the `webpki-roots` set
    pub fn without_webpki_roots(mut self) -> Self {
        self.use_webpki_roots = false;
        self
    }

    fn root_store(&self) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        if self.use_webpki_roots {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
        for root in &self.extra_roots {
            roots.add(root.clone())?;
        }
        if roots.is_empty() {
            return Err(HsmTlsError::configuration(
                "Strict peer verification needs at least one trust anchor",
            ));
        }
        Ok(roots)
    }
}

/// Options for [`Credential::assemble_with`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssemblyOptions {
    /// Also sign a random challenge and verify it under the certificate key
    pub prove_possession: bool,
}

impl Default for AssemblyOptions {
    fn default() -> Self {
        Self {
            prove_possession: true,
        }
    }
}

/// A certificate chain plus the signer for its leaf key
#[derive(Clone)]
pub struct Credential {
    chain: Vec<CertificateDer<'static>>,
    signer: Arc<dyn KeySigner>,
    certified_key: Arc<CertifiedKey>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("chain_len", &self.chain.len())
            .field("signer", &self.signer)
            .finish()
    }
}

impl Credential {
    /// Bind `chain` (leaf first) to `signer` with default options
    ///
    /// # Errors
    ///
    /// Returns `CertificateParseFailed` for an empty chain or unreadable leaf
    /// and `KeyMismatch` if the leaf key is not the signer's key.
    pub fn assemble(chain: Vec<CertificateDer<'static>>, signer: Arc<dyn KeySigner>) -> Result<Self> {
        Self::assemble_with(chain, signer, AssemblyOptions::default())
    }

    /// Bind `chain` (leaf first) to `signer`
    ///
    /// The key comparison always runs; `options` only adds checks.
    ///
    /// # Errors
    ///
    /// As [`Credential::assemble`], plus `SignFailed` if the
    /// proof-of-possession signature cannot be produced.
    pub fn assemble_with(
        chain: Vec<CertificateDer<'static>>,
        signer: Arc<dyn KeySigner>,
        options: AssemblyOptions,
    ) -> Result<Self> {
        let leaf = chain
            .first()
            .ok_or_else(|| HsmTlsError::certificate("Certificate chain is empty"))?;
        let certificate_key = certificate::leaf_public_key(leaf)?;

        if certificate_key != *signer.public_key() {
            return Err(HsmTlsError::KeyMismatch {
                reason: format!(
                    "certificate holds {} {}, signer holds {} {}",
                    certificate_key,
                    certificate_key.fingerprint(),
                    signer.public_key(),
                    signer.public_key().fingerprint()
                ),
            });
        }
        if options.prove_possession {
            prove_possession(signer.as_ref())?;
        }

        let signing_key = Arc::new(RustlsSigningKey::new(Arc::clone(&signer)));
        let certified_key = Arc::new(CertifiedKey::new(chain.clone(), signing_key));

        info!(
            "Assembled client credential: {} certificate(s), {} {}",
            chain.len(),
            certificate_key,
            certificate_key.fingerprint()
        );
        Ok(Self {
            chain,
            signer,
            certified_key,
        })
    }

    /// The certificate chain, leaf first
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// The signer presenting the leaf key
    pub fn signer(&self) -> &Arc<dyn KeySigner> {
        &self.signer
    }

    /// The leaf public key
    pub fn public_key(&self) -> &PublicKeyMaterial {
        self.signer.public_key()
    }

    /// The rustls view of this credential
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified_key)
    }

    /// Client configuration presenting this credential under `policy`
    ///
    /// # Errors
    ///
    /// Returns `Tls` if rustls rejects the protocol versions or a trust
    /// anchor, and `Configuration` if strict verification has no anchors.
    pub fn attach(&self, policy: &TlsPolicy) -> Result<ClientConfig> {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(policy.min_version.protocol_versions())?;

        let builder = match policy.peer_verification {
            PeerVerification::Strict => {
                let roots = policy.root_store()?;
                debug!("Verifying server certificates against {} trust anchor(s)", roots.len());
                builder.with_root_certificates(roots)
            }
            PeerVerification::DangerousAcceptAnyCertificate => {
                warn!("Server certificate verification is DISABLED; the server's identity is not checked");
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
            }
        };

        let config = builder.with_client_cert_resolver(Arc::new(ClientCertResolver {
            certified_key: Arc::clone(&self.certified_key),
        }));
        info!(
            "Client TLS configuration ready (minimum {}, {:?} peer verification)",
            policy.min_version, policy.peer_verification
        );
        Ok(config)
    }
}

#[derive(Debug)]
struct ClientCertResolver {
    certified_key: Arc<CertifiedKey>,
}

impl ResolvesClientCert for ClientCertResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        sigschemes: &[rustls::SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        // Only present the certificate when the key can answer the server
        if self.certified_key.key.choose_scheme(sigschemes).is_none() {
            warn!("Server offered no signature scheme the client key supports");
            return None;
        }
        Some(Arc::clone(&self.certified_key))
    }

    fn has_certs(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        warn!("Accepting unverified certificate for {:?}", server_name);
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
