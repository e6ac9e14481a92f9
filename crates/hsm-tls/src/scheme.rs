//! Signature schemes and hash algorithms
//!
//! Maps the TLS signature schemes an HSM key can serve onto the PKCS#11
//! mechanism that produces them.

use crate::backend::SignMechanism;
use sha2::Digest;

/// Hash that produced a digest handed to the signer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    /// SHA-256
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
}

// DER DigestInfo headers (RFC 8017 section 9.2, note 1)
const SHA256_DIGEST_INFO: &[u8] = &[
    0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01, 0x05,
    0x00, 0x04, 0x20,
];
const SHA384_DIGEST_INFO: &[u8] = &[
    0x30, 0x41, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x02, 0x05,
    0x00, 0x04, 0x30,
];
const SHA512_DIGEST_INFO: &[u8] = &[
    0x30, 0x51, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x03, 0x05,
    0x00, 0x04, 0x40,
];

impl HashAlgorithm {
    /// Digest length in bytes
    pub fn output_len(self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }

    /// Hash `data`
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256 => sha2::Sha256::digest(data).to_vec(),
            Self::Sha384 => sha2::Sha384::digest(data).to_vec(),
            Self::Sha512 => sha2::Sha512::digest(data).to_vec(),
        }
    }

    /// Wrap `digest` in the DER `DigestInfo` that `CKM_RSA_PKCS` expects
    pub fn digest_info(self, digest: &[u8]) -> Vec<u8> {
        let prefix = match self {
            Self::Sha256 => SHA256_DIGEST_INFO,
            Self::Sha384 => SHA384_DIGEST_INFO,
            Self::Sha512 => SHA512_DIGEST_INFO,
        };
        let mut info = Vec::with_capacity(prefix.len() + digest.len());
        info.extend_from_slice(prefix);
        info.extend_from_slice(digest);
        info
    }
}

/// TLS signature schemes an HSM-resident key can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureScheme {
    /// `ecdsa_secp256r1_sha256`
    EcdsaP256Sha256,
    /// `ecdsa_secp384r1_sha384`
    EcdsaP384Sha384,
    /// `rsa_pss_rsae_sha256`
    RsaPssSha256,
    /// `rsa_pss_rsae_sha384`
    RsaPssSha384,
    /// `rsa_pss_rsae_sha512`
    RsaPssSha512,
    /// `rsa_pkcs1_sha256`
    RsaPkcs1Sha256,
    /// `rsa_pkcs1_sha384`
    RsaPkcs1Sha384,
    /// `rsa_pkcs1_sha512`
    RsaPkcs1Sha512,
}

impl SignatureScheme {
    /// RSA schemes in preference order; PSS first since TLS 1.3 requires it
    pub const RSA: [Self; 6] = [
        Self::RsaPssSha256,
        Self::RsaPssSha384,
        Self::RsaPssSha512,
        Self::RsaPkcs1Sha256,
        Self::RsaPkcs1Sha384,
        Self::RsaPkcs1Sha512,
    ];

    /// Hash the scheme signs over
    pub fn hash(self) -> HashAlgorithm {
        match self {
            Self::EcdsaP256Sha256 | Self::RsaPssSha256 | Self::RsaPkcs1Sha256 => {
                HashAlgorithm::Sha256
            }
            Self::EcdsaP384Sha384 | Self::RsaPssSha384 | Self::RsaPkcs1Sha384 => {
                HashAlgorithm::Sha384
            }
            Self::RsaPssSha512 | Self::RsaPkcs1Sha512 => HashAlgorithm::Sha512,
        }
    }

    /// PKCS#11 mechanism that produces this scheme from a digest
    pub fn mechanism(self) -> SignMechanism {
        match self {
            Self::EcdsaP256Sha256 | Self::EcdsaP384Sha384 => SignMechanism::Ecdsa,
            Self::RsaPkcs1Sha256 | Self::RsaPkcs1Sha384 | Self::RsaPkcs1Sha512 => {
                SignMechanism::RsaPkcs
            }
            Self::RsaPssSha256 | Self::RsaPssSha384 | Self::RsaPssSha512 => {
                SignMechanism::RsaPkcsPss { hash: self.hash() }
            }
        }
    }

    /// Whether this is an ECDSA scheme
    pub fn is_ecdsa(self) -> bool {
        matches!(self, Self::EcdsaP256Sha256 | Self::EcdsaP384Sha384)
    }

    /// The rustls identifier
    pub fn to_rustls(self) -> rustls::SignatureScheme {
        match self {
            Self::EcdsaP256Sha256 => rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            Self::EcdsaP384Sha384 => rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            Self::RsaPssSha256 => rustls::SignatureScheme::RSA_PSS_SHA256,
            Self::RsaPssSha384 => rustls::SignatureScheme::RSA_PSS_SHA384,
            Self::RsaPssSha512 => rustls::SignatureScheme::RSA_PSS_SHA512,
            Self::RsaPkcs1Sha256 => rustls::SignatureScheme::RSA_PKCS1_SHA256,
            Self::RsaPkcs1Sha384 => rustls::SignatureScheme::RSA_PKCS1_SHA384,
            Self::RsaPkcs1Sha512 => rustls::SignatureScheme::RSA_PKCS1_SHA512,
        }
    }

    /// Map a rustls identifier, `None` for schemes an HSM key cannot serve here
    pub fn from_rustls(scheme: rustls::SignatureScheme) -> Option<Self> {
        match scheme {
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256 => Some(Self::EcdsaP256Sha256),
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384 => Some(Self::EcdsaP384Sha384),
            rustls::SignatureScheme::RSA_PSS_SHA256 => Some(Self::RsaPssSha256),
            rustls::SignatureScheme::RSA_PSS_SHA384 => Some(Self::RsaPssSha384),
            rustls::SignatureScheme::RSA_PSS_SHA512 => Some(Self::RsaPssSha512),
            rustls::SignatureScheme::RSA_PKCS1_SHA256 => Some(Self::RsaPkcs1Sha256),
            rustls::SignatureScheme::RSA_PKCS1_SHA384 => Some(Self::RsaPkcs1Sha384),
            rustls::SignatureScheme::RSA_PKCS1_SHA512 => Some(Self::RsaPkcs1Sha512),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_lengths() {
        for hash in [
            HashAlgorithm::Sha256,
            HashAlgorithm::Sha384,
            HashAlgorithm::Sha512,
        ] {
            assert_eq!(hash.digest(b"abc").len(), hash.output_len());
        }
    }

    #[test]
    fn test_digest_info_layout() {
        let digest = HashAlgorithm::Sha256.digest(b"hello");
        let info = HashAlgorithm::Sha256.digest_info(&digest);
        assert_eq!(info.len(), 19 + 32);
        // Outer SEQUENCE length covers everything after the two header bytes
        assert_eq!(info[1] as usize, info.len() - 2);
        assert_eq!(&info[19..], digest.as_slice());

        let digest = HashAlgorithm::Sha512.digest(b"hello");
        let info = HashAlgorithm::Sha512.digest_info(&digest);
        assert_eq!(info[1] as usize, info.len() - 2);
    }

    #[test]
    fn test_pss_mechanism_carries_hash() {
        assert_eq!(
            SignatureScheme::RsaPssSha384.mechanism(),
            SignMechanism::RsaPkcsPss {
                hash: HashAlgorithm::Sha384
            }
        );
        assert_eq!(SignatureScheme::EcdsaP256Sha256.mechanism(), SignMechanism::Ecdsa);
        assert_eq!(SignatureScheme::RsaPkcs1Sha512.mechanism(), SignMechanism::RsaPkcs);
    }

    #[test]
    fn test_rustls_mapping() {
        for scheme in SignatureScheme::RSA
            .into_iter()
            .chain([SignatureScheme::EcdsaP256Sha256, SignatureScheme::EcdsaP384Sha384])
        {
            assert_eq!(SignatureScheme::from_rustls(scheme.to_rustls()), Some(scheme));
        }
        assert_eq!(
            SignatureScheme::from_rustls(rustls::SignatureScheme::ED25519),
            None
        );
    }
}
