//! Signer adapter
//!
//! [`KeySigner`] is the capability the TLS layer needs from a private-key
//! holder: the public key, and signatures over finalized digests. The
//! private key never leaves the HSM; [`HsmSigner`] forwards each digest to
//! `C_SignInit`/`C_Sign` on the session that located the key.
//!
//! [`RustlsSigningKey`] adapts any `KeySigner` to `rustls::sign::SigningKey`.

use crate::backend::{KeyType, SignMechanism};
use crate::locator::{self, KeyHandle};
use crate::public_key::{big_uint, with_sign_byte, EcCurve, PublicKeyMaterial};
use crate::scheme::SignatureScheme;
use crate::session::Session;
use crate::{certificate, HsmTlsError, Result};
use parking_lot::RwLock;
use ring::rand::SecureRandom;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace};
use zeroize::Zeroizing;

const CHALLENGE_LEN: usize = 32;

/// Something that can sign TLS handshake digests with a private key it holds
pub trait KeySigner: Send + Sync + fmt::Debug {
    /// The public key paired with the private key
    fn public_key(&self) -> &PublicKeyMaterial;

    /// Sign `digest`, which is already hashed with `scheme`'s hash
    ///
    /// ECDSA signatures are returned DER-encoded.
    ///
    /// # Errors
    ///
    /// Returns `SignFailed` if the digest length or scheme does not fit the
    /// key, or if the signing operation fails.
    fn sign(&self, digest: &[u8], scheme: SignatureScheme) -> Result<Vec<u8>>;

    /// Schemes this signer can produce, in preference order
    fn supported_schemes(&self) -> Vec<SignatureScheme> {
        self.public_key().supported_schemes()
    }
}

/// Counters for signatures produced by an [`HsmSigner`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignerStats {
    /// Signatures produced
    pub signatures: u64,
    /// Sign calls that failed
    pub failures: u64,
    /// Latency of the most recent successful signature
    pub last_latency: Option<Duration>,
    /// Sum of all successful signature latencies
    pub total_latency: Duration,
}

impl SignerStats {
    /// Mean latency of successful signatures
    pub fn average_latency(&self) -> Option<Duration> {
        u32::try_from(self.signatures)
            .ok()
            .filter(|n| *n > 0)
            .map(|n| self.total_latency / n)
    }
}

/// Signer backed by a private key in an HSM session
pub struct HsmSigner {
    session: Arc<Session>,
    key: KeyHandle,
    public_key: PublicKeyMaterial,
    stats: RwLock<SignerStats>,
}

impl fmt::Debug for HsmSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HsmSigner")
            .field("session", &self.session.serial())
            .field("key", &self.key.label())
            .field("public_key", &self.public_key)
            .finish()
    }
}

impl HsmSigner {
    /// Signer whose public key is read from the token
    ///
    /// # Errors
    ///
    /// Returns `KeyNotFound` if the token exposes no public key for `key`
    /// and `InvalidPublicKey` for RSA keys below 2048 bits.
    pub fn new(session: Arc<Session>, key: KeyHandle) -> Result<Self> {
        let public_key =
            locator::find_public_key(&session, &key)?.ok_or_else(|| HsmTlsError::KeyNotFound {
                label: format!("{} (public key)", key.label()),
            })?;
        Self::with_public_key(session, key, public_key)
    }

    /// Signer whose public key comes from the leaf certificate
    ///
    /// The certificate key is only accepted after the HSM key signs a fresh
    /// challenge that verifies under it.
    ///
    /// # Errors
    ///
    /// Returns `CertificateParseFailed` for an unreadable certificate and
    /// `KeyMismatch` if the HSM key does not hold the certificate's key.
    pub fn from_certificate(session: Arc<Session>, key: KeyHandle, leaf_der: &[u8]) -> Result<Self> {
        let public_key = certificate::leaf_public_key(leaf_der)?;
        let signer = Self::with_public_key(session, key, public_key)?;
        prove_possession(&signer)?;
        Ok(signer)
    }

    fn with_public_key(
        session: Arc<Session>,
        key: KeyHandle,
        public_key: PublicKeyMaterial,
    ) -> Result<Self> {
        let consistent = matches!(
            (key.key_type(), &public_key),
            (KeyType::Ec, PublicKeyMaterial::Ec { .. })
                | (KeyType::Rsa, PublicKeyMaterial::Rsa { .. })
        );
        public_key.ensure_verifiable()?;
        if !consistent {
            return Err(HsmTlsError::KeyMismatch {
                reason: format!(
                    "private key '{}' is {:?}, public key is {}",
                    key.label(),
                    key.key_type(),
                    public_key
                ),
            });
        }

        info!(
            "HSM signer ready for '{}' ({} {})",
            key.label(),
            public_key,
            public_key.fingerprint()
        );
        Ok(Self {
            session,
            key,
            public_key,
            stats: RwLock::new(SignerStats::default()),
        })
    }

    /// The key this signer uses
    pub fn key(&self) -> &KeyHandle {
        &self.key
    }

    /// The session this signer signs in
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Snapshot of the signature counters
    pub fn stats(&self) -> SignerStats {
        self.stats.read().clone()
    }

    fn sign_digest(&self, digest: &[u8], scheme: SignatureScheme) -> Result<Vec<u8>> {
        if !self.public_key.supports(scheme) {
            return Err(HsmTlsError::sign_failed(format!(
                "{:?} cannot be produced with a {} key",
                scheme, self.public_key
            )));
        }
        let expected = scheme.hash().output_len();
        if digest.len() != expected {
            return Err(HsmTlsError::sign_failed(format!(
                "{:?} expects a {}-byte digest, got {} bytes",
                scheme,
                expected,
                digest.len()
            )));
        }

        let object = self.key.object_in(&self.session)?;
        let mechanism = scheme.mechanism();
        let data = Zeroizing::new(match mechanism {
            SignMechanism::RsaPkcs => scheme.hash().digest_info(digest),
            _ => digest.to_vec(),
        });

        let raw = self.session.with_authenticated(|handle| {
            handle
                .sign_init(&mechanism, object)
                .map_err(|e| HsmTlsError::sign_failed(e.to_string()))?;
            handle
                .sign(&data)
                .map_err(|e| HsmTlsError::sign_failed(e.to_string()))
        })?;

        match &self.public_key {
            PublicKeyMaterial::Ec { curve, .. } => ecdsa_signature_to_der(&raw, *curve),
            PublicKeyMaterial::Rsa { .. } => Ok(raw),
        }
    }
}

impl KeySigner for HsmSigner {
    fn public_key(&self) -> &PublicKeyMaterial {
        &self.public_key
    }

    fn sign(&self, digest: &[u8], scheme: SignatureScheme) -> Result<Vec<u8>> {
        let started = Instant::now();
        let result = self.sign_digest(digest, scheme);
        let elapsed = started.elapsed();

        let mut stats = self.stats.write();
        match &result {
            Ok(_) => {
                stats.signatures += 1;
                stats.last_latency = Some(elapsed);
                stats.total_latency += elapsed;
                trace!("Signed with '{}' using {:?} in {:?}", self.key.label(), scheme, elapsed);
            }
            Err(e) => {
                stats.failures += 1;
                error!("Signing with '{}' failed: {}", self.key.label(), e);
            }
        }
        result
    }
}

// Ecdsa-Sig-Value ::= SEQUENCE { r INTEGER, s INTEGER }
#[derive(asn1::Asn1Write)]
struct EcdsaSigValue<'a> {
    r: asn1::BigUint<'a>,
    s: asn1::BigUint<'a>,
}

/// Convert the raw `r || s` output of `CKM_ECDSA` to a DER `Ecdsa-Sig-Value`
pub(crate) fn ecdsa_signature_to_der(raw: &[u8], curve: EcCurve) -> Result<Vec<u8>> {
    let len = curve.coordinate_len();
    if raw.len() != len * 2 {
        return Err(HsmTlsError::sign_failed(format!(
            "ECDSA signature for {:?} must be {} bytes, got {}",
            curve,
            len * 2,
            raw.len()
        )));
    }
    let (r, s) = raw.split_at(len);
    let r = with_sign_byte(r);
    let s = with_sign_byte(s);
    let value = EcdsaSigValue {
        r: big_uint(&r)?,
        s: big_uint(&s)?,
    };
    asn1::write_single(&value)
        .map_err(|e| HsmTlsError::sign_failed(format!("Failed to encode ECDSA signature: {:?}", e)))
}

/// Check that `signer` holds the private half of its public key
///
/// Signs a random challenge and verifies it under the public key.
///
/// # Errors
///
/// Returns `InvalidPublicKey` for RSA keys outside 2048-8192 bits,
/// `KeyMismatch` if the signature does not verify and `SignFailed` if the
/// signer could not sign.
pub fn prove_possession(signer: &dyn KeySigner) -> Result<()> {
    signer.public_key().ensure_verifiable()?;
    let scheme = signer
        .supported_schemes()
        .first()
        .copied()
        .ok_or_else(|| HsmTlsError::KeyMismatch {
            reason: "public key supports no signature scheme".to_string(),
        })?;

    let mut challenge = [0u8; CHALLENGE_LEN];
    ring::rand::SystemRandom::new()
        .fill(&mut challenge)
        .map_err(|_| HsmTlsError::sign_failed("Failed to generate challenge"))?;

    let signature = signer.sign(&scheme.hash().digest(&challenge), scheme)?;
    if !signer.public_key().verify(scheme, &challenge, &signature) {
        return Err(HsmTlsError::KeyMismatch {
            reason: format!(
                "signature from the HSM key does not verify under {} {}",
                signer.public_key(),
                signer.public_key().fingerprint()
            ),
        });
    }
    debug!("Proof of possession succeeded with {:?}", scheme);
    Ok(())
}

/// `rustls::sign::SigningKey` over any [`KeySigner`]
#[derive(Debug, Clone)]
pub struct RustlsSigningKey {
    signer: Arc<dyn KeySigner>,
}

impl RustlsSigningKey {
    /// Wrap `signer`
    pub fn new(signer: Arc<dyn KeySigner>) -> Self {
        Self { signer }
    }
}

impl rustls::sign::SigningKey for RustlsSigningKey {
    fn choose_scheme(
        &self,
        offered: &[rustls::SignatureScheme],
    ) -> Option<Box<dyn rustls::sign::Signer>> {
        let scheme = self
            .signer
            .supported_schemes()
            .into_iter()
            .find(|scheme| offered.contains(&scheme.to_rustls()))?;
        debug!("Selected signature scheme {:?}", scheme);
        Some(Box::new(RustlsSigner {
            signer: Arc::clone(&self.signer),
            scheme,
        }))
    }

    fn public_key(&self) -> Option<rustls::pki_types::SubjectPublicKeyInfoDer<'_>> {
        self.signer
            .public_key()
            .to_spki_der()
            .ok()
            .map(rustls::pki_types::SubjectPublicKeyInfoDer::from)
    }

    fn algorithm(&self) -> rustls::SignatureAlgorithm {
        self.signer.public_key().algorithm()
    }
}

#[derive(Debug)]
struct RustlsSigner {
    signer: Arc<dyn KeySigner>,
    scheme: SignatureScheme,
}

impl rustls::sign::Signer for RustlsSigner {
    fn sign(&self, message: &[u8]) -> std::result::Result<Vec<u8>, rustls::Error> {
        let digest = self.scheme.hash().digest(message);
        self.signer
            .sign(&digest, self.scheme)
            .map_err(|e| rustls::Error::General(e.to_string()))
    }

    fn scheme(&self) -> rustls::SignatureScheme {
        self.scheme.to_rustls()
    }
}
