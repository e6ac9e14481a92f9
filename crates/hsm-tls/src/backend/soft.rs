//! In-memory software token
//!
//! Implements the PKCS#11 module boundary with real P-256 and RSA keys held
//! in process memory. It enforces the protocol rules a hardware module
//! enforces (login before private objects are visible, one active search and
//! one active signature per session, find-final after find-init) and records
//! every call in a journal, so tests can assert on the exact exchange.
//!
//! Never use this for production keys: the private keys live in ordinary
//! heap memory.

use super::{
    AttributeKind, BackendError, KeyType, ObjectAttribute, ObjectClass, ObjectHandle, Pkcs11Module,
    Pkcs11Session, SignMechanism, SlotId,
};
use crate::public_key::{EcCurve, PublicKeyMaterial};
use crate::scheme::HashAlgorithm;
use crate::{HsmTlsError, Result};
use parking_lot::Mutex;
use rsa::traits::PublicKeyParts;
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// One entry of the call journal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftCall {
    /// `C_Finalize`
    Finalize,
    /// `C_OpenSession`
    OpenSession,
    /// `C_Login`
    Login,
    /// `C_Logout`
    Logout,
    /// `C_CloseSession`
    CloseSession,
    /// `C_FindObjectsInit`
    FindObjectsInit,
    /// `C_FindObjects`
    FindObjects,
    /// `C_FindObjectsFinal`
    FindObjectsFinal,
    /// `C_GetAttributeValue`
    GetAttributeValue,
    /// `C_SignInit`
    SignInit,
    /// `C_Sign`
    Sign,
}

/// A software key pair
#[derive(Clone)]
pub enum SoftKeyPair {
    /// ECDSA P-256
    P256(p256::ecdsa::SigningKey),
    /// RSA
    Rsa(rsa::RsaPrivateKey),
}

impl std::fmt::Debug for SoftKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.public_key() {
            Ok(public) => write!(f, "SoftKeyPair({})", public),
            Err(_) => write!(f, "SoftKeyPair(<invalid>)"),
        }
    }
}

impl SoftKeyPair {
    /// Fresh random P-256 key
    pub fn generate_p256() -> Self {
        Self::P256(p256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng))
    }

    /// Fresh random RSA key of `bits` bits
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if key generation fails.
    pub fn generate_rsa(bits: usize) -> Result<Self> {
        rsa::RsaPrivateKey::new(&mut rand::rngs::OsRng, bits)
            .map(Self::Rsa)
            .map_err(|e| HsmTlsError::configuration(format!("RSA key generation failed: {}", e)))
    }

    /// Load a PKCS#8 PEM private key (P-256 or RSA)
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the PEM holds neither key type.
    pub fn from_pkcs8_pem(pem: &str) -> Result<Self> {
        use p256::pkcs8::DecodePrivateKey as _;
        use rsa::pkcs8::DecodePrivateKey as _;

        if let Ok(key) = p256::ecdsa::SigningKey::from_pkcs8_pem(pem) {
            return Ok(Self::P256(key));
        }
        rsa::RsaPrivateKey::from_pkcs8_pem(pem)
            .map(Self::Rsa)
            .map_err(|e| {
                HsmTlsError::configuration(format!(
                    "PEM is neither a P-256 nor an RSA PKCS#8 private key: {}",
                    e
                ))
            })
    }

    /// PKCS#8 PEM encoding of the private key
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if encoding fails.
    pub fn to_pkcs8_pem(&self) -> Result<String> {
        use p256::pkcs8::{EncodePrivateKey as _, LineEnding};
        use rsa::pkcs8::EncodePrivateKey as _;

        let pem = match self {
            Self::P256(key) => key.to_pkcs8_pem(LineEnding::LF),
            Self::Rsa(key) => key.to_pkcs8_pem(LineEnding::LF),
        };
        pem.map(|p| p.as_str().to_owned())
            .map_err(|e| HsmTlsError::configuration(format!("PKCS#8 encoding failed: {}", e)))
    }

    /// Public half of the key pair
    ///
    /// # Errors
    ///
    /// Returns `InvalidPublicKey` if the key cannot be represented.
    pub fn public_key(&self) -> Result<PublicKeyMaterial> {
        match self {
            Self::P256(key) => {
                let point = key.verifying_key().to_encoded_point(false);
                PublicKeyMaterial::ec(EcCurve::P256, point.as_bytes())
            }
            Self::Rsa(key) => {
                PublicKeyMaterial::rsa(&key.n().to_bytes_be(), &key.e().to_bytes_be())
            }
        }
    }

    fn key_type(&self) -> KeyType {
        match self {
            Self::P256(_) => KeyType::Ec,
            Self::Rsa(_) => KeyType::Rsa,
        }
    }

    fn sign(&self, mechanism: &SignMechanism, data: &[u8]) -> std::result::Result<Vec<u8>, String> {
        use p256::ecdsa::signature::hazmat::PrehashSigner;

        match (self, mechanism) {
            (Self::P256(key), SignMechanism::Ecdsa) => {
                let signature: p256::ecdsa::Signature =
                    key.sign_prehash(data).map_err(|e| e.to_string())?;
                Ok(signature.to_bytes().to_vec())
            }
            (Self::Rsa(key), SignMechanism::RsaPkcs) => key
                .sign(rsa::Pkcs1v15Sign::new_unprefixed(), data)
                .map_err(|e| e.to_string()),
            (Self::Rsa(key), SignMechanism::RsaPkcsPss { hash }) => {
                if data.len() != hash.output_len() {
                    return Err("CKR_DATA_LEN_RANGE".to_string());
                }
                let mut rng = rand::rngs::OsRng;
                let salt = hash.output_len();
                let padding = match hash {
                    HashAlgorithm::Sha256 => rsa::Pss::new_with_salt::<sha2::Sha256>(salt),
                    HashAlgorithm::Sha384 => rsa::Pss::new_with_salt::<sha2::Sha384>(salt),
                    HashAlgorithm::Sha512 => rsa::Pss::new_with_salt::<sha2::Sha512>(salt),
                };
                key.sign_with_rng(&mut rng, padding, data)
                    .map_err(|e| e.to_string())
            }
            _ => Err("CKR_KEY_TYPE_INCONSISTENT".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
struct SoftObject {
    class: ObjectClass,
    label: String,
    id: Vec<u8>,
    key: SoftKeyPair,
}

impl SoftObject {
    fn matches(&self, template: &[ObjectAttribute]) -> bool {
        template.iter().all(|attr| match attr {
            ObjectAttribute::Class(class) => self.class == *class,
            ObjectAttribute::Label(label) => self.label.as_bytes() == label.as_slice(),
            ObjectAttribute::Id(id) => self.id == *id,
            ObjectAttribute::KeyType(key_type) => self.key.key_type() == *key_type,
            _ => false,
        })
    }

    fn attribute(&self, kind: AttributeKind) -> Option<ObjectAttribute> {
        let public = self.key.public_key().ok()?;
        match (kind, &public) {
            (AttributeKind::Class, _) => Some(ObjectAttribute::Class(self.class)),
            (AttributeKind::Label, _) => Some(ObjectAttribute::Label(self.label.as_bytes().to_vec())),
            (AttributeKind::Id, _) => Some(ObjectAttribute::Id(self.id.clone())),
            (AttributeKind::KeyType, _) => Some(ObjectAttribute::KeyType(self.key.key_type())),
            (AttributeKind::EcParams, PublicKeyMaterial::Ec { curve, .. }) => {
                curve.ec_params_der().ok().map(ObjectAttribute::EcParams)
            }
            // Private EC keys do not carry CKA_EC_POINT
            (AttributeKind::EcPoint, PublicKeyMaterial::Ec { point, .. })
                if self.class == ObjectClass::PublicKey =>
            {
                asn1::write_single(&point.as_slice())
                    .ok()
                    .map(ObjectAttribute::EcPoint)
            }
            (AttributeKind::Modulus, PublicKeyMaterial::Rsa { modulus, .. }) => {
                Some(ObjectAttribute::Modulus(modulus.clone()))
            }
            (AttributeKind::PublicExponent, PublicKeyMaterial::Rsa { exponent, .. }) => {
                Some(ObjectAttribute::PublicExponent(exponent.clone()))
            }
            _ => None,
        }
    }
}

/// A token in a software slot
#[derive(Clone)]
pub struct SoftToken {
    label: String,
    pin: String,
    objects: Vec<SoftObject>,
}

impl std::fmt::Debug for SoftToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftToken")
            .field("label", &self.label)
            .field("pin", &"[REDACTED]")
            .field("objects", &self.objects.len())
            .finish()
    }
}

impl SoftToken {
    /// Empty token with the given label and user PIN
    pub fn new(label: impl Into<String>, user_pin: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            pin: user_pin.into(),
            objects: Vec::new(),
        }
    }

    /// Add a private key object and its public key object under one label
    pub fn with_key_pair(self, label: &str, key: SoftKeyPair) -> Self {
        self.with_private_key(label, key.clone())
            .with_public_key(label, key)
    }

    /// Add only the private key object
    pub fn with_private_key(mut self, label: &str, key: SoftKeyPair) -> Self {
        let id = self.next_id();
        self.objects.push(SoftObject {
            class: ObjectClass::PrivateKey,
            label: label.to_string(),
            id,
            key,
        });
        self
    }

    /// Add only the public key object
    pub fn with_public_key(mut self, label: &str, key: SoftKeyPair) -> Self {
        // Pair with the private object of the same label, as key generation would
        let id = self
            .objects
            .iter()
            .find(|o| o.label == label && o.class == ObjectClass::PrivateKey)
            .map(|o| o.id.clone())
            .unwrap_or_else(|| self.next_id());
        self.objects.push(SoftObject {
            class: ObjectClass::PublicKey,
            label: label.to_string(),
            id,
            key,
        });
        self
    }

    fn next_id(&self) -> Vec<u8> {
        (self.objects.len() as u32 + 1).to_be_bytes().to_vec()
    }
}

#[derive(Debug, Default)]
struct SoftState {
    slots: Vec<SoftToken>,
    journal: Vec<SoftCall>,
    open_sessions: usize,
    finalized: bool,
    sign_delay: Option<Duration>,
    signs_in_flight: usize,
    max_signs_in_flight: usize,
}

impl SoftState {
    fn record(&mut self, call: SoftCall) {
        trace!("soft token call: {:?}", call);
        self.journal.push(call);
    }
}

/// In-memory module; cloning shares the same tokens and journal
#[derive(Debug, Clone, Default)]
pub struct SoftModule {
    state: Arc<Mutex<SoftState>>,
}

impl SoftModule {
    /// Module with no tokens
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `token` into the next slot
    pub fn with_token(self, token: SoftToken) -> Self {
        self.state.lock().slots.push(token);
        self
    }

    /// Make every `C_Sign` take at least `delay`, to widen race windows
    pub fn with_sign_delay(self, delay: Duration) -> Self {
        self.state.lock().sign_delay = Some(delay);
        self
    }

    /// Every call issued so far, in order
    pub fn journal(&self) -> Vec<SoftCall> {
        self.state.lock().journal.clone()
    }

    /// Number of journal entries equal to `call`
    pub fn count(&self, call: SoftCall) -> usize {
        self.state.lock().journal.iter().filter(|c| **c == call).count()
    }

    /// Sessions opened and not yet closed
    pub fn open_sessions(&self) -> usize {
        self.state.lock().open_sessions
    }

    /// Whether `C_Finalize` has been called
    pub fn is_finalized(&self) -> bool {
        self.state.lock().finalized
    }

    /// Highest number of `C_Sign` calls that were ever running at once
    pub fn max_concurrent_signs(&self) -> usize {
        self.state.lock().max_signs_in_flight
    }
}

impl Pkcs11Module for SoftModule {
    fn slots_with_token(&self) -> std::result::Result<Vec<SlotId>, BackendError> {
        let state = self.state.lock();
        if state.finalized {
            return Err(BackendError::new("C_GetSlotList", "CKR_CRYPTOKI_NOT_INITIALIZED"));
        }
        Ok((0..state.slots.len() as u64).map(SlotId).collect())
    }

    fn token_label(&self, slot: SlotId) -> std::result::Result<String, BackendError> {
        let state = self.state.lock();
        state
            .slots
            .get(slot.0 as usize)
            .map(|t| t.label.clone())
            .ok_or_else(|| BackendError::new("C_GetTokenInfo", "CKR_SLOT_ID_INVALID"))
    }

    fn open_rw_session(
        &self,
        slot: SlotId,
    ) -> std::result::Result<Box<dyn Pkcs11Session>, BackendError> {
        let mut state = self.state.lock();
        state.record(SoftCall::OpenSession);
        if state.finalized {
            return Err(BackendError::new("C_OpenSession", "CKR_CRYPTOKI_NOT_INITIALIZED"));
        }
        if slot.0 as usize >= state.slots.len() {
            return Err(BackendError::new("C_OpenSession", "CKR_SLOT_ID_INVALID"));
        }
        state.open_sessions += 1;
        Ok(Box::new(SoftSession {
            state: Arc::clone(&self.state),
            slot: slot.0 as usize,
            logged_in: false,
            search: None,
            signing: None,
        }))
    }

    fn finalize(&self) -> std::result::Result<(), BackendError> {
        let mut state = self.state.lock();
        state.record(SoftCall::Finalize);
        if state.finalized {
            return Err(BackendError::new("C_Finalize", "CKR_CRYPTOKI_NOT_INITIALIZED"));
        }
        state.finalized = true;
        Ok(())
    }
}

#[derive(Debug)]
struct SoftSession {
    state: Arc<Mutex<SoftState>>,
    slot: usize,
    logged_in: bool,
    search: Option<Vec<ObjectHandle>>,
    signing: Option<(SignMechanism, ObjectHandle)>,
}

impl SoftSession {
    fn object(&self, state: &SoftState, handle: ObjectHandle) -> Option<SoftObject> {
        let object = state.slots[self.slot]
            .objects
            .get((handle.0 as usize).checked_sub(1)?)?;
        if object.class == ObjectClass::PrivateKey && !self.logged_in {
            return None;
        }
        Some(object.clone())
    }
}

impl Pkcs11Session for SoftSession {
    fn login_user(&mut self, pin: &SecretString) -> std::result::Result<(), BackendError> {
        let mut state = self.state.lock();
        state.record(SoftCall::Login);
        if self.logged_in {
            return Err(BackendError::new("C_Login", "CKR_USER_ALREADY_LOGGED_IN"));
        }
        if state.slots[self.slot].pin != *pin.expose_secret() {
            return Err(BackendError::new("C_Login", "CKR_PIN_INCORRECT"));
        }
        self.logged_in = true;
        Ok(())
    }

    fn logout(&mut self) -> std::result::Result<(), BackendError> {
        self.state.lock().record(SoftCall::Logout);
        if !self.logged_in {
            return Err(BackendError::new("C_Logout", "CKR_USER_NOT_LOGGED_IN"));
        }
        self.logged_in = false;
        Ok(())
    }

    fn close(self: Box<Self>) -> std::result::Result<(), BackendError> {
        let mut state = self.state.lock();
        state.record(SoftCall::CloseSession);
        state.open_sessions = state.open_sessions.saturating_sub(1);
        Ok(())
    }

    fn find_objects_init(
        &mut self,
        template: &[ObjectAttribute],
    ) -> std::result::Result<(), BackendError> {
        let mut state = self.state.lock();
        state.record(SoftCall::FindObjectsInit);
        if self.search.is_some() {
            return Err(BackendError::new("C_FindObjectsInit", "CKR_OPERATION_ACTIVE"));
        }
        let logged_in = self.logged_in;
        let matches = state.slots[self.slot]
            .objects
            .iter()
            .enumerate()
            .filter(|(_, o)| logged_in || o.class != ObjectClass::PrivateKey)
            .filter(|(_, o)| o.matches(template))
            .map(|(i, _)| ObjectHandle(i as u64 + 1))
            .collect();
        self.search = Some(matches);
        Ok(())
    }

    fn find_objects(&mut self, max: usize) -> std::result::Result<Vec<ObjectHandle>, BackendError> {
        self.state.lock().record(SoftCall::FindObjects);
        let remaining = self
            .search
            .as_mut()
            .ok_or_else(|| BackendError::new("C_FindObjects", "CKR_OPERATION_NOT_INITIALIZED"))?;
        let take = max.min(remaining.len());
        Ok(remaining.drain(..take).collect())
    }

    fn find_objects_final(&mut self) -> std::result::Result<(), BackendError> {
        self.state.lock().record(SoftCall::FindObjectsFinal);
        self.search
            .take()
            .map(|_| ())
            .ok_or_else(|| BackendError::new("C_FindObjectsFinal", "CKR_OPERATION_NOT_INITIALIZED"))
    }

    fn get_attributes(
        &mut self,
        object: ObjectHandle,
        kinds: &[AttributeKind],
    ) -> std::result::Result<Vec<ObjectAttribute>, BackendError> {
        let mut state = self.state.lock();
        state.record(SoftCall::GetAttributeValue);
        let object = self
            .object(&state, object)
            .ok_or_else(|| BackendError::new("C_GetAttributeValue", "CKR_OBJECT_HANDLE_INVALID"))?;
        Ok(kinds.iter().filter_map(|k| object.attribute(*k)).collect())
    }

    fn sign_init(
        &mut self,
        mechanism: &SignMechanism,
        key: ObjectHandle,
    ) -> std::result::Result<(), BackendError> {
        let mut state = self.state.lock();
        state.record(SoftCall::SignInit);
        if self.signing.is_some() {
            return Err(BackendError::new("C_SignInit", "CKR_OPERATION_ACTIVE"));
        }
        if !self.logged_in {
            return Err(BackendError::new("C_SignInit", "CKR_USER_NOT_LOGGED_IN"));
        }
        let object = self
            .object(&state, key)
            .ok_or_else(|| BackendError::new("C_SignInit", "CKR_KEY_HANDLE_INVALID"))?;
        if object.class != ObjectClass::PrivateKey {
            return Err(BackendError::new("C_SignInit", "CKR_KEY_FUNCTION_NOT_PERMITTED"));
        }
        let compatible = matches!(
            (object.key.key_type(), mechanism),
            (KeyType::Ec, SignMechanism::Ecdsa)
                | (KeyType::Rsa, SignMechanism::RsaPkcs | SignMechanism::RsaPkcsPss { .. })
        );
        if !compatible {
            return Err(BackendError::new("C_SignInit", "CKR_KEY_TYPE_INCONSISTENT"));
        }
        self.signing = Some((*mechanism, key));
        Ok(())
    }

    fn sign(&mut self, data: &[u8]) -> std::result::Result<Vec<u8>, BackendError> {
        // C_Sign always terminates the active operation
        let (mechanism, key) = self
            .signing
            .take()
            .ok_or_else(|| BackendError::new("C_Sign", "CKR_OPERATION_NOT_INITIALIZED"))?;
        let (object, delay) = {
            let mut state = self.state.lock();
            state.record(SoftCall::Sign);
            state.signs_in_flight += 1;
            state.max_signs_in_flight = state.max_signs_in_flight.max(state.signs_in_flight);
            (self.object(&state, key), state.sign_delay)
        };

        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let result = object
            .ok_or_else(|| BackendError::new("C_Sign", "CKR_KEY_HANDLE_INVALID"))
            .and_then(|object| {
                object
                    .key
                    .sign(&mechanism, data)
                    .map_err(|reason| BackendError::new("C_Sign", reason))
            });

        self.state.lock().signs_in_flight -= 1;
        result
    }
}
