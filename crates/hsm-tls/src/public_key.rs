//! Public key material and SubjectPublicKeyInfo handling
//!
//! Public keys arrive from two places: attribute reads on the HSM
//! (`CKA_EC_PARAMS`/`CKA_EC_POINT`, `CKA_MODULUS`/`CKA_PUBLIC_EXPONENT`) and
//! the leaf certificate's SubjectPublicKeyInfo. Both are normalized into
//! [`PublicKeyMaterial`] so that equality is semantic, not byte-for-byte on
//! whatever DER variant the producer chose.

use crate::scheme::SignatureScheme;
use crate::{HsmTlsError, Result};
use std::fmt;
use tracing::trace;

const EC_PUBLIC_KEY_OID: asn1::ObjectIdentifier = asn1::oid!(1, 2, 840, 10045, 2, 1);
const SECP256R1_OID: asn1::ObjectIdentifier = asn1::oid!(1, 2, 840, 10045, 3, 1, 7);
const SECP384R1_OID: asn1::ObjectIdentifier = asn1::oid!(1, 3, 132, 0, 34);
const RSA_ENCRYPTION_OID: asn1::ObjectIdentifier = asn1::oid!(1, 2, 840, 113549, 1, 1, 1);

// SubjectPublicKeyInfo ::= SEQUENCE {
//   algorithm         AlgorithmIdentifier,
//   subjectPublicKey  BIT STRING
// }
#[derive(asn1::Asn1Read)]
struct SubjectPublicKeyInfo<'a> {
    algorithm: AlgorithmIdentifier<'a>,
    subject_public_key: asn1::BitString<'a>,
}

#[derive(asn1::Asn1Read)]
struct AlgorithmIdentifier<'a> {
    algorithm: asn1::ObjectIdentifier,
    parameters: Option<asn1::Tlv<'a>>,
}

#[derive(asn1::Asn1Write)]
struct EcSubjectPublicKeyInfo<'a> {
    algorithm: EcAlgorithmIdentifier,
    subject_public_key: asn1::BitString<'a>,
}

#[derive(asn1::Asn1Write)]
struct EcAlgorithmIdentifier {
    algorithm: asn1::ObjectIdentifier,
    named_curve: asn1::ObjectIdentifier,
}

#[derive(asn1::Asn1Write)]
struct RsaSubjectPublicKeyInfo<'a> {
    algorithm: RsaAlgorithmIdentifier,
    subject_public_key: asn1::BitString<'a>,
}

#[derive(asn1::Asn1Write)]
struct RsaAlgorithmIdentifier {
    algorithm: asn1::ObjectIdentifier,
    parameters: (),
}

// RSAPublicKey ::= SEQUENCE { modulus INTEGER, publicExponent INTEGER }
#[derive(asn1::Asn1Read, asn1::Asn1Write)]
struct RsaPublicKey<'a> {
    modulus: asn1::BigUint<'a>,
    public_exponent: asn1::BigUint<'a>,
}

/// Named curves supported for ECDSA client keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EcCurve {
    /// NIST P-256 (secp256r1)
    P256,
    /// NIST P-384 (secp384r1)
    P384,
}

impl EcCurve {
    fn oid(self) -> asn1::ObjectIdentifier {
        match self {
            Self::P256 => SECP256R1_OID,
            Self::P384 => SECP384R1_OID,
        }
    }

    fn from_oid(oid: &asn1::ObjectIdentifier) -> Option<Self> {
        if *oid == SECP256R1_OID {
            Some(Self::P256)
        } else if *oid == SECP384R1_OID {
            Some(Self::P384)
        } else {
            None
        }
    }

    /// Field element size in bytes
    pub fn coordinate_len(self) -> usize {
        match self {
            Self::P256 => 32,
            Self::P384 => 48,
        }
    }

    /// Length of an uncompressed SEC1 point, `0x04 || X || Y`
    pub fn point_len(self) -> usize {
        1 + 2 * self.coordinate_len()
    }

    /// The one TLS scheme usable with this curve
    pub fn scheme(self) -> SignatureScheme {
        match self {
            Self::P256 => SignatureScheme::EcdsaP256Sha256,
            Self::P384 => SignatureScheme::EcdsaP384Sha384,
        }
    }

    /// DER encoding of the curve OID, as found in `CKA_EC_PARAMS`
    pub fn ec_params_der(self) -> Result<Vec<u8>> {
        asn1::write_single(&self.oid())
            .map_err(|e| HsmTlsError::invalid_key(format!("Failed to encode curve OID: {:?}", e)))
    }
}

/// The public half of a signing key
///
/// Constructors normalize their input (uncompressed EC points, RSA integers
/// without leading zeros), so `==` compares keys, not encodings.
#[derive(Clone, PartialEq, Eq)]
pub enum PublicKeyMaterial {
    /// Elliptic-curve key
    Ec {
        /// Named curve
        curve: EcCurve,
        /// Uncompressed SEC1 point
        point: Vec<u8>,
    },
    /// RSA key
    Rsa {
        /// Big-endian modulus without leading zeros
        modulus: Vec<u8>,
        /// Big-endian public exponent without leading zeros
        exponent: Vec<u8>,
    },
}

impl PublicKeyMaterial {
    /// EC key from an uncompressed SEC1 point
    ///
    /// # Errors
    ///
    /// Returns `InvalidPublicKey` if the point is not an uncompressed point of
    /// the curve's size.
    pub fn ec(curve: EcCurve, point: &[u8]) -> Result<Self> {
        if point.len() != curve.point_len() || point[0] != 0x04 {
            return Err(HsmTlsError::invalid_key(format!(
                "Invalid uncompressed EC point format for {:?}: expected {} bytes starting with 0x04, got {} bytes",
                curve,
                curve.point_len(),
                point.len()
            )));
        }
        Ok(Self::Ec {
            curve,
            point: point.to_vec(),
        })
    }

    /// RSA key from big-endian modulus and exponent
    ///
    /// # Errors
    ///
    /// Returns `InvalidPublicKey` if either integer is zero or empty.
    pub fn rsa(modulus: &[u8], exponent: &[u8]) -> Result<Self> {
        let modulus = strip_leading_zeros(modulus);
        let exponent = strip_leading_zeros(exponent);
        if modulus.is_empty() || exponent.is_empty() {
            return Err(HsmTlsError::invalid_key("RSA modulus and exponent must be non-zero"));
        }
        Ok(Self::Rsa {
            modulus: modulus.to_vec(),
            exponent: exponent.to_vec(),
        })
    }

    /// EC key from the raw `CKA_EC_PARAMS` and `CKA_EC_POINT` attribute values
    ///
    /// `CKA_EC_POINT` is specified as a DER OCTET STRING wrapping the point,
    /// but several modules return the bare point; both are accepted.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPublicKey` for unknown curves or malformed points.
    pub fn from_pkcs11_ec(ec_params: &[u8], ec_point: &[u8]) -> Result<Self> {
        let oid = asn1::parse_single::<asn1::ObjectIdentifier>(ec_params).map_err(|e| {
            HsmTlsError::invalid_key(format!("ASN.1 parsing error for CKA_EC_PARAMS: {}", e))
        })?;
        let curve = EcCurve::from_oid(&oid)
            .ok_or_else(|| HsmTlsError::invalid_key(format!("Unsupported EC curve {}", oid)))?;

        if let Ok(inner) = asn1::parse_single::<&[u8]>(ec_point) {
            if inner.len() == curve.point_len() && inner.first() == Some(&0x04) {
                trace!("CKA_EC_POINT is DER-wrapped");
                return Self::ec(curve, inner);
            }
        }
        Self::ec(curve, ec_point)
    }

    /// Parse a DER SubjectPublicKeyInfo
    ///
    /// # Errors
    ///
    /// Returns `InvalidPublicKey` for malformed DER or unsupported algorithms.
    pub fn from_spki_der(der: &[u8]) -> Result<Self> {
        let spki = asn1::parse_single::<SubjectPublicKeyInfo<'_>>(der).map_err(|e| {
            HsmTlsError::invalid_key(format!("ASN.1 parsing error for SubjectPublicKeyInfo: {}", e))
        })?;
        let key_bytes = spki.subject_public_key.as_bytes();

        if spki.algorithm.algorithm == EC_PUBLIC_KEY_OID {
            let params = spki.algorithm.parameters.ok_or_else(|| {
                HsmTlsError::invalid_key("EC SubjectPublicKeyInfo without curve parameters")
            })?;
            let curve_oid =
                asn1::parse_single::<asn1::ObjectIdentifier>(params.full_data()).map_err(|e| {
                    HsmTlsError::invalid_key(format!("EC parameters are not a named curve: {}", e))
                })?;
            let curve = EcCurve::from_oid(&curve_oid).ok_or_else(|| {
                HsmTlsError::invalid_key(format!("Unsupported EC curve {}", curve_oid))
            })?;
            Self::ec(curve, key_bytes)
        } else if spki.algorithm.algorithm == RSA_ENCRYPTION_OID {
            let rsa = asn1::parse_single::<RsaPublicKey<'_>>(key_bytes).map_err(|e| {
                HsmTlsError::invalid_key(format!("ASN.1 parsing error for RSA public key: {}", e))
            })?;
            Self::rsa(rsa.modulus.as_bytes(), rsa.public_exponent.as_bytes())
        } else {
            Err(HsmTlsError::invalid_key(format!(
                "Unsupported public key algorithm {}",
                spki.algorithm.algorithm
            )))
        }
    }

    /// DER SubjectPublicKeyInfo for this key
    ///
    /// # Errors
    ///
    /// Returns `InvalidPublicKey` if encoding fails.
    pub fn to_spki_der(&self) -> Result<Vec<u8>> {
        let encode_err =
            |e: asn1::WriteError| HsmTlsError::invalid_key(format!("Failed to encode SPKI: {:?}", e));
        match self {
            Self::Ec { curve, point } => {
                let spki = EcSubjectPublicKeyInfo {
                    algorithm: EcAlgorithmIdentifier {
                        algorithm: EC_PUBLIC_KEY_OID,
                        named_curve: curve.oid(),
                    },
                    subject_public_key: bit_string(point)?,
                };
                asn1::write_single(&spki).map_err(encode_err)
            }
            Self::Rsa { modulus, exponent } => {
                let n = with_sign_byte(modulus);
                let e = with_sign_byte(exponent);
                let rsa_key = RsaPublicKey {
                    modulus: big_uint(&n)?,
                    public_exponent: big_uint(&e)?,
                };
                let rsa_der = asn1::write_single(&rsa_key).map_err(encode_err)?;
                let spki = RsaSubjectPublicKeyInfo {
                    algorithm: RsaAlgorithmIdentifier {
                        algorithm: RSA_ENCRYPTION_OID,
                        parameters: (),
                    },
                    subject_public_key: bit_string(&rsa_der)?,
                };
                asn1::write_single(&spki).map_err(encode_err)
            }
        }
    }

    /// Signature schemes this key can produce, in preference order
    pub fn supported_schemes(&self) -> Vec<SignatureScheme> {
        match self {
            Self::Ec { curve, .. } => vec![curve.scheme()],
            Self::Rsa { .. } => SignatureScheme::RSA.to_vec(),
        }
    }

    /// Whether `scheme` can be produced with this key
    pub fn supports(&self, scheme: SignatureScheme) -> bool {
        match self {
            Self::Ec { curve, .. } => curve.scheme() == scheme,
            Self::Rsa { .. } => !scheme.is_ecdsa(),
        }
    }

    /// The rustls algorithm family
    pub fn algorithm(&self) -> rustls::SignatureAlgorithm {
        match self {
            Self::Ec { .. } => rustls::SignatureAlgorithm::ECDSA,
            Self::Rsa { .. } => rustls::SignatureAlgorithm::RSA,
        }
    }

    /// Check the key is one the verifier accepts
    ///
    /// RSA moduli must be 2048 to 8192 bits; smaller keys cannot pass the
    /// proof of possession or a modern peer's certificate checks.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPublicKey` naming the modulus size when out of range.
    pub fn ensure_verifiable(&self) -> Result<()> {
        if let Self::Rsa { modulus, .. } = self {
            let bits = modulus_bits(modulus);
            if !(MIN_RSA_BITS..=MAX_RSA_BITS).contains(&bits) {
                return Err(HsmTlsError::invalid_key(format!(
                    "RSA-{} key is outside the supported {}-{} bit range",
                    bits, MIN_RSA_BITS, MAX_RSA_BITS
                )));
            }
        }
        Ok(())
    }

    /// Verify a TLS-encoded signature over `message` (not a digest)
    ///
    /// ECDSA signatures are expected DER-encoded, as they appear on the wire.
    pub fn verify(&self, scheme: SignatureScheme, message: &[u8], signature: &[u8]) -> bool {
        use ring::signature as sig;

        if !self.supports(scheme) {
            return false;
        }
        match self {
            Self::Ec { curve, point } => {
                let algorithm = match curve {
                    EcCurve::P256 => &sig::ECDSA_P256_SHA256_ASN1,
                    EcCurve::P384 => &sig::ECDSA_P384_SHA384_ASN1,
                };
                sig::UnparsedPublicKey::new(algorithm, point)
                    .verify(message, signature)
                    .is_ok()
            }
            Self::Rsa { modulus, exponent } => {
                let params: &sig::RsaParameters = match scheme {
                    SignatureScheme::RsaPkcs1Sha256 => &sig::RSA_PKCS1_2048_8192_SHA256,
                    SignatureScheme::RsaPkcs1Sha384 => &sig::RSA_PKCS1_2048_8192_SHA384,
                    SignatureScheme::RsaPkcs1Sha512 => &sig::RSA_PKCS1_2048_8192_SHA512,
                    SignatureScheme::RsaPssSha256 => &sig::RSA_PSS_2048_8192_SHA256,
                    SignatureScheme::RsaPssSha384 => &sig::RSA_PSS_2048_8192_SHA384,
                    SignatureScheme::RsaPssSha512 => &sig::RSA_PSS_2048_8192_SHA512,
                    SignatureScheme::EcdsaP256Sha256 | SignatureScheme::EcdsaP384Sha384 => {
                        return false;
                    }
                };
                sig::RsaPublicKeyComponents {
                    n: modulus.as_slice(),
                    e: exponent.as_slice(),
                }
                .verify(params, message, signature)
                .is_ok()
            }
        }
    }

    /// Short SHA-256 fingerprint of the SPKI, for logs
    pub fn fingerprint(&self) -> String {
        match self.to_spki_der() {
            Ok(der) => crate::scheme::HashAlgorithm::Sha256.digest(&der)[..8]
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect(),
            Err(_) => "unencodable".to_string(),
        }
    }
}

impl fmt::Debug for PublicKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKeyMaterial({} {})", self, self.fingerprint())
    }
}

impl fmt::Display for PublicKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ec {
                curve: EcCurve::P256,
                ..
            } => write!(f, "EC P-256"),
            Self::Ec {
                curve: EcCurve::P384,
                ..
            } => write!(f, "EC P-384"),
            Self::Rsa { modulus, .. } => write!(f, "RSA-{}", modulus_bits(modulus)),
        }
    }
}

/// Smallest RSA modulus accepted for signing
pub const MIN_RSA_BITS: usize = 2048;

/// Largest RSA modulus accepted for signing
pub const MAX_RSA_BITS: usize = 8192;

fn modulus_bits(modulus: &[u8]) -> usize {
    match modulus.first() {
        Some(first) => modulus.len() * 8 - first.leading_zeros() as usize,
        None => 0,
    }
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

// DER INTEGERs are signed: a set high bit needs a leading zero byte.
pub(crate) fn with_sign_byte(magnitude: &[u8]) -> Vec<u8> {
    let magnitude = strip_leading_zeros(magnitude);
    match magnitude.first() {
        None => vec![0],
        Some(first) if first & 0x80 != 0 => {
            let mut out = Vec::with_capacity(magnitude.len() + 1);
            out.push(0);
            out.extend_from_slice(magnitude);
            out
        }
        Some(_) => magnitude.to_vec(),
    }
}

pub(crate) fn big_uint(minimal: &[u8]) -> Result<asn1::BigUint<'_>> {
    asn1::BigUint::new(minimal)
        .ok_or_else(|| HsmTlsError::invalid_key("Integer is not minimally encoded"))
}

fn bit_string(bytes: &[u8]) -> Result<asn1::BitString<'_>> {
    asn1::BitString::new(bytes, 0)
        .ok_or_else(|| HsmTlsError::invalid_key("Failed to build BIT STRING"))
}
