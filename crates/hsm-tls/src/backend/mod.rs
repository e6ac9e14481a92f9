//! PKCS#11 module boundary
//!
//! The session manager, key locator and signer never talk to a native module
//! directly. They go through [`Pkcs11Module`] and [`Pkcs11Session`], which
//! mirror the client side of the PKCS#11 protocol: initialize/finalize, slot
//! enumeration, session open/close, login/logout, object search
//! (init/find/final), attribute reads and sign-init/sign.
//!
//! Two implementations exist:
//!
//! - `cryptoki` - real modules loaded from a shared library (feature `pkcs11`)
//! - `soft` - an in-memory token holding software keys (feature `soft-token`)
//!
//! Every call is fallible and must be treated like a remote service.

#[cfg(feature = "pkcs11")]
pub mod cryptoki;

#[cfg(any(test, feature = "soft-token"))]
pub mod soft;

use crate::scheme::HashAlgorithm;
use secrecy::SecretString;
use std::fmt;

/// Slot identifier as reported by the module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub u64);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Object handle, only meaningful inside the session that returned it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle(pub u64);

/// `CKA_CLASS` values this crate searches for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectClass {
    /// `CKO_PRIVATE_KEY`
    PrivateKey,
    /// `CKO_PUBLIC_KEY`
    PublicKey,
}

/// `CKA_KEY_TYPE` values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    /// `CKK_EC`
    Ec,
    /// `CKK_RSA`
    Rsa,
    /// Anything else; the raw `CK_KEY_TYPE`
    Other(u64),
}

/// Attribute with its value, used both as search template and read result
#[derive(Clone, PartialEq, Eq)]
pub enum ObjectAttribute {
    /// `CKA_CLASS`
    Class(ObjectClass),
    /// `CKA_LABEL`
    Label(Vec<u8>),
    /// `CKA_ID`
    Id(Vec<u8>),
    /// `CKA_KEY_TYPE`
    KeyType(KeyType),
    /// `CKA_EC_PARAMS`, DER-encoded curve OID
    EcParams(Vec<u8>),
    /// `CKA_EC_POINT`, usually a DER OCTET STRING around the SEC1 point
    EcPoint(Vec<u8>),
    /// `CKA_MODULUS`
    Modulus(Vec<u8>),
    /// `CKA_PUBLIC_EXPONENT`
    PublicExponent(Vec<u8>),
}

impl ObjectAttribute {
    /// Attribute type of this value
    pub fn kind(&self) -> AttributeKind {
        match self {
            Self::Class(_) => AttributeKind::Class,
            Self::Label(_) => AttributeKind::Label,
            Self::Id(_) => AttributeKind::Id,
            Self::KeyType(_) => AttributeKind::KeyType,
            Self::EcParams(_) => AttributeKind::EcParams,
            Self::EcPoint(_) => AttributeKind::EcPoint,
            Self::Modulus(_) => AttributeKind::Modulus,
            Self::PublicExponent(_) => AttributeKind::PublicExponent,
        }
    }
}

impl fmt::Debug for ObjectAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Class(c) => write!(f, "Class({:?})", c),
            Self::Label(l) => write!(f, "Label({:?})", String::from_utf8_lossy(l)),
            Self::Id(id) => write!(f, "Id({} bytes)", id.len()),
            Self::KeyType(t) => write!(f, "KeyType({:?})", t),
            Self::EcParams(p) => write!(f, "EcParams({} bytes)", p.len()),
            Self::EcPoint(p) => write!(f, "EcPoint({} bytes)", p.len()),
            Self::Modulus(m) => write!(f, "Modulus({} bytes)", m.len()),
            Self::PublicExponent(e) => write!(f, "PublicExponent({} bytes)", e.len()),
        }
    }
}

/// Attribute type, used to request attribute values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeKind {
    /// `CKA_CLASS`
    Class,
    /// `CKA_LABEL`
    Label,
    /// `CKA_ID`
    Id,
    /// `CKA_KEY_TYPE`
    KeyType,
    /// `CKA_EC_PARAMS`
    EcParams,
    /// `CKA_EC_POINT`
    EcPoint,
    /// `CKA_MODULUS`
    Modulus,
    /// `CKA_PUBLIC_EXPONENT`
    PublicExponent,
}

/// Signing mechanisms the signer issues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignMechanism {
    /// `CKM_ECDSA` over a precomputed digest, raw `r || s` output
    Ecdsa,
    /// `CKM_RSA_PKCS` over a DER `DigestInfo`
    RsaPkcs,
    /// `CKM_RSA_PKCS_PSS` over a precomputed digest, MGF1 with the same hash,
    /// salt length equal to the hash length
    RsaPkcsPss {
        /// Hash that produced the digest
        hash: HashAlgorithm,
    },
}

/// Failure of a single module call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{function} failed: {reason}")]
pub struct BackendError {
    /// PKCS#11 function that failed, e.g. `C_Login`
    pub function: &'static str,
    /// Module-reported reason
    pub reason: String,
}

impl BackendError {
    /// Create a new backend error
    pub fn new(function: &'static str, reason: impl Into<String>) -> Self {
        Self {
            function,
            reason: reason.into(),
        }
    }
}

/// A loaded and initialized PKCS#11 module
///
/// Finalization happens once, from the owning
/// [`HsmModule`](crate::session::HsmModule), after every session opened from
/// it has been closed.
pub trait Pkcs11Module: Send + Sync + fmt::Debug {
    /// Slots that currently have a token present, in enumeration order
    fn slots_with_token(&self) -> Result<Vec<SlotId>, BackendError>;

    /// Label of the token in `slot`, trailing blank padding removed
    fn token_label(&self, slot: SlotId) -> Result<String, BackendError>;

    /// Open a serial read-write session on `slot`
    fn open_rw_session(&self, slot: SlotId) -> Result<Box<dyn Pkcs11Session>, BackendError>;

    /// `C_Finalize`
    fn finalize(&self) -> Result<(), BackendError>;
}

/// One open session on a token
///
/// Sessions are not safe for concurrent use; callers serialize access.
pub trait Pkcs11Session: Send + fmt::Debug {
    /// `C_Login` as `CKU_USER`
    fn login_user(&mut self, pin: &SecretString) -> Result<(), BackendError>;

    /// `C_Logout`
    fn logout(&mut self) -> Result<(), BackendError>;

    /// `C_CloseSession`
    fn close(self: Box<Self>) -> Result<(), BackendError>;

    /// `C_FindObjectsInit`
    fn find_objects_init(&mut self, template: &[ObjectAttribute]) -> Result<(), BackendError>;

    /// `C_FindObjects`, returning at most `max` handles
    fn find_objects(&mut self, max: usize) -> Result<Vec<ObjectHandle>, BackendError>;

    /// `C_FindObjectsFinal`
    fn find_objects_final(&mut self) -> Result<(), BackendError>;

    /// `C_GetAttributeValue`; attributes the object does not expose are
    /// omitted from the result
    fn get_attributes(
        &mut self,
        object: ObjectHandle,
        kinds: &[AttributeKind],
    ) -> Result<Vec<ObjectAttribute>, BackendError>;

    /// `C_SignInit`
    fn sign_init(&mut self, mechanism: &SignMechanism, key: ObjectHandle)
    -> Result<(), BackendError>;

    /// `C_Sign`, completing the operation started by `sign_init`
    fn sign(&mut self, data: &[u8]) -> Result<Vec<u8>, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_debug_does_not_dump_values() {
        let attr = ObjectAttribute::Modulus(vec![0xAB; 256]);
        assert_eq!(format!("{:?}", attr), "Modulus(256 bytes)");

        let attr = ObjectAttribute::Label(b"client".to_vec());
        assert_eq!(format!("{:?}", attr), "Label(\"client\")");
    }

    #[test]
    fn test_backend_error_display() {
        let err = BackendError::new("C_Login", "CKR_PIN_INCORRECT");
        assert_eq!(err.to_string(), "C_Login failed: CKR_PIN_INCORRECT");
    }
}
