//! Certificate loading
//!
//! PEM files are decoded with `rustls-pemfile`; the only thing read out of a
//! certificate is the leaf's SubjectPublicKeyInfo. Chain validation is left
//! to the TLS peer.

use crate::public_key::PublicKeyMaterial;
use crate::{HsmTlsError, Result};
use rustls::pki_types::CertificateDer;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::debug;

// Certificate ::= SEQUENCE {
//   tbsCertificate       TBSCertificate,
//   signatureAlgorithm   AlgorithmIdentifier,
//   signatureValue       BIT STRING
// }
#[derive(asn1::Asn1Read)]
struct Certificate<'a> {
    tbs_certificate: TbsCertificate<'a>,
    _signature_algorithm: asn1::Tlv<'a>,
    _signature_value: asn1::BitString<'a>,
}

#[derive(asn1::Asn1Read)]
struct TbsCertificate<'a> {
    #[explicit(0)]
    _version: Option<u8>,
    _serial_number: asn1::Tlv<'a>,
    _signature: asn1::Tlv<'a>,
    _issuer: asn1::Tlv<'a>,
    _validity: asn1::Tlv<'a>,
    _subject: asn1::Tlv<'a>,
    subject_public_key_info: asn1::Tlv<'a>,
    #[implicit(1)]
    _issuer_unique_id: Option<asn1::BitString<'a>>,
    #[implicit(2)]
    _subject_unique_id: Option<asn1::BitString<'a>>,
    #[explicit(3)]
    _extensions: Option<asn1::Sequence<'a>>,
}

/// Load a PEM certificate chain, leaf first
///
/// # Errors
///
/// Returns `Io` if the file cannot be opened and `CertificateParseFailed` if
/// it holds no certificate or malformed PEM.
pub fn load_pem_chain(path: impl AsRef<Path>) -> Result<Vec<CertificateDer<'static>>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| HsmTlsError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;

    let chain = read_pem_chain(&mut BufReader::new(file)).map_err(|e| match e {
        HsmTlsError::CertificateParseFailed { reason } => HsmTlsError::CertificateParseFailed {
            reason: format!("{}: {}", path.display(), reason),
        },
        other => other,
    })?;
    debug!("Loaded {} certificate(s) from {}", chain.len(), path.display());
    Ok(chain)
}

/// Decode every `CERTIFICATE` block from PEM input, leaf first
///
/// # Errors
///
/// Returns `CertificateParseFailed` for malformed PEM or input without
/// certificates.
pub fn read_pem_chain(reader: &mut dyn BufRead) -> Result<Vec<CertificateDer<'static>>> {
    let chain = rustls_pemfile::certs(reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| HsmTlsError::certificate(e.to_string()))?;

    if chain.is_empty() {
        return Err(HsmTlsError::certificate("No certificates found in PEM input"));
    }
    Ok(chain)
}

/// Public key of a DER certificate
///
/// # Errors
///
/// Returns `CertificateParseFailed` if the certificate cannot be parsed or
/// carries a key type this crate cannot sign with.
pub fn leaf_public_key(der: &[u8]) -> Result<PublicKeyMaterial> {
    let certificate = asn1::parse_single::<Certificate<'_>>(der)
        .map_err(|e| HsmTlsError::certificate(format!("ASN.1 parsing error: {}", e)))?;
    let spki = certificate.tbs_certificate.subject_public_key_info.full_data();

    PublicKeyMaterial::from_spki_der(spki)
        .map_err(|e| HsmTlsError::certificate(format!("Unusable subject public key: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::soft::SoftKeyPair;
    use crate::ErrorKind;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn self_signed(key_pair: &SoftKeyPair) -> rcgen::Certificate {
        let pem = key_pair.to_pkcs8_pem().unwrap();
        let key = rcgen::KeyPair::from_pem(&pem).unwrap();
        rcgen::CertificateParams::new(vec!["client.test".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap()
    }

    #[test]
    fn test_leaf_public_key_ec() {
        let key_pair = SoftKeyPair::generate_p256();
        let cert = self_signed(&key_pair);
        assert_eq!(
            leaf_public_key(cert.der()).unwrap(),
            key_pair.public_key().unwrap()
        );
    }

    #[test]
    fn test_leaf_public_key_rsa() {
        let key_pair = SoftKeyPair::generate_rsa(2048).unwrap();
        let cert = self_signed(&key_pair);
        assert_eq!(
            leaf_public_key(cert.der()).unwrap(),
            key_pair.public_key().unwrap()
        );
    }

    #[test]
    fn test_garbage_is_parse_failure() {
        let err = leaf_public_key(b"\x30\x03\x02\x01\x01").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CertificateParseFailed);
    }

    #[test]
    fn test_load_pem_chain() {
        let leaf = self_signed(&SoftKeyPair::generate_p256());
        let ca = self_signed(&SoftKeyPair::generate_p256());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}{}", leaf.pem(), ca.pem()).unwrap();

        let chain = load_pem_chain(file.path()).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].as_ref(), leaf.der().as_ref());
    }

    #[test]
    fn test_load_errors() {
        let err = load_pem_chain("/nonexistent/client.pem").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "no certificates here").unwrap();
        let err = load_pem_chain(file.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CertificateParseFailed);
    }
}
