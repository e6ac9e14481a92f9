//! PKCS#11 modules loaded through cryptoki
//!
//! Works with any PKCS#11-compliant module, including:
//!
//! - AWS CloudHSM (Client SDK 5)
//! - SafeNet Luna Network HSMs
//! - Thales nShield HSMs
//! - SoftHSM (for development and testing)
//!
//! cryptoki ties a search to an iterator that borrows the session and runs
//! `C_FindObjectsFinal` when dropped. The session here keeps the template
//! from `find_objects_init`, and each `find_objects(max)` issues one search
//! whose `C_FindObjects` calls ask for at most `max` handles.

use super::{
    AttributeKind, BackendError, KeyType, ObjectAttribute, ObjectClass, ObjectHandle, Pkcs11Module,
    Pkcs11Session, SignMechanism, SlotId,
};
use crate::scheme::HashAlgorithm;
use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::mechanism::rsa::{PkcsMgfType, PkcsPssParams};
use cryptoki::mechanism::{Mechanism, MechanismType};
use cryptoki::object::{
    Attribute, AttributeType, KeyType as CkKeyType, ObjectClass as CkObjectClass,
    ObjectHandle as CkObjectHandle,
};
use cryptoki::session::{Session, UserType};
use cryptoki::slot::Slot;
use cryptoki::types::AuthPin;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

/// A native PKCS#11 module
pub struct CryptokiModule {
    path: PathBuf,
    context: Mutex<Option<Arc<Pkcs11>>>,
}

impl fmt::Debug for CryptokiModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptokiModule")
            .field("path", &self.path)
            .field("initialized", &self.context.lock().is_some())
            .finish()
    }
}

impl CryptokiModule {
    /// Load the shared library at `path` and call `C_Initialize`
    ///
    /// # Errors
    ///
    /// Returns a `BackendError` if the library cannot be loaded or refuses
    /// initialization.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let path = path.as_ref();
        trace!("Loading PKCS#11 library: {}", path.display());

        let context = Pkcs11::new(path)
            .map_err(|e| BackendError::new("C_GetFunctionList", e.to_string()))?;

        context
            .initialize(CInitializeArgs::OsThreads)
            .map_err(|e| BackendError::new("C_Initialize", e.to_string()))?;

        trace!("PKCS#11 context initialized");
        Ok(Self {
            path: path.to_path_buf(),
            context: Mutex::new(Some(Arc::new(context))),
        })
    }

    fn context(&self, function: &'static str) -> Result<Arc<Pkcs11>, BackendError> {
        self.context
            .lock()
            .clone()
            .ok_or_else(|| BackendError::new(function, "CKR_CRYPTOKI_NOT_INITIALIZED"))
    }

    fn find_slot(&self, id: SlotId, function: &'static str) -> Result<(Arc<Pkcs11>, Slot), BackendError> {
        let context = self.context(function)?;
        let slot = context
            .get_slots_with_token()
            .map_err(|e| BackendError::new("C_GetSlotList", e.to_string()))?
            .into_iter()
            .find(|slot| slot.id() == id.0)
            .ok_or_else(|| BackendError::new(function, "CKR_SLOT_ID_INVALID"))?;
        Ok((context, slot))
    }
}

impl Pkcs11Module for CryptokiModule {
    fn slots_with_token(&self) -> Result<Vec<SlotId>, BackendError> {
        let slots = self
            .context("C_GetSlotList")?
            .get_slots_with_token()
            .map_err(|e| BackendError::new("C_GetSlotList", e.to_string()))?;
        Ok(slots.into_iter().map(|slot| SlotId(slot.id())).collect())
    }

    fn token_label(&self, slot: SlotId) -> Result<String, BackendError> {
        let (context, slot) = self.find_slot(slot, "C_GetTokenInfo")?;
        let token_info = context
            .get_token_info(slot)
            .map_err(|e| BackendError::new("C_GetTokenInfo", e.to_string()))?;
        Ok(token_info.label().trim_end().to_string())
    }

    fn open_rw_session(&self, slot: SlotId) -> Result<Box<dyn Pkcs11Session>, BackendError> {
        let (context, slot) = self.find_slot(slot, "C_OpenSession")?;
        let session = context
            .open_rw_session(slot)
            .map_err(|e| BackendError::new("C_OpenSession", e.to_string()))?;
        Ok(Box::new(CryptokiSession {
            session,
            handles: Vec::new(),
            search: None,
            signing: None,
        }))
    }

    fn finalize(&self) -> Result<(), BackendError> {
        // Dropping the last context clone runs C_Finalize
        match self.context.lock().take() {
            Some(context) => {
                drop(context);
                debug!("PKCS#11 module '{}' finalized", self.path.display());
                Ok(())
            }
            None => Err(BackendError::new("C_Finalize", "CKR_CRYPTOKI_NOT_INITIALIZED")),
        }
    }
}

struct CryptokiSession {
    session: Session,
    // Index + 1 is the handle handed out
    handles: Vec<CkObjectHandle>,
    search: Option<PendingSearch>,
    signing: Option<(SignMechanism, CkObjectHandle)>,
}

struct PendingSearch {
    template: Vec<Attribute>,
    // Handles already returned by earlier `find_objects` calls
    returned: usize,
}

impl fmt::Debug for CryptokiSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptokiSession")
            .field("known_objects", &self.handles.len())
            .field("search_active", &self.search.is_some())
            .field("sign_active", &self.signing.is_some())
            .finish()
    }
}

impl CryptokiSession {
    fn register(&mut self, handle: CkObjectHandle) -> ObjectHandle {
        let index = match self.handles.iter().position(|h| *h == handle) {
            Some(index) => index,
            None => {
                self.handles.push(handle);
                self.handles.len() - 1
            }
        };
        ObjectHandle(index as u64 + 1)
    }

    fn resolve(&self, handle: ObjectHandle, function: &'static str) -> Result<CkObjectHandle, BackendError> {
        (handle.0 as usize)
            .checked_sub(1)
            .and_then(|i| self.handles.get(i))
            .copied()
            .ok_or_else(|| BackendError::new(function, "CKR_OBJECT_HANDLE_INVALID"))
    }
}

fn to_cryptoki_attribute(attr: &ObjectAttribute) -> Result<Attribute, BackendError> {
    Ok(match attr {
        ObjectAttribute::Class(ObjectClass::PrivateKey) => Attribute::Class(CkObjectClass::PRIVATE_KEY),
        ObjectAttribute::Class(ObjectClass::PublicKey) => Attribute::Class(CkObjectClass::PUBLIC_KEY),
        ObjectAttribute::Label(label) => Attribute::Label(label.clone()),
        ObjectAttribute::Id(id) => Attribute::Id(id.clone()),
        ObjectAttribute::KeyType(KeyType::Ec) => Attribute::KeyType(CkKeyType::EC),
        ObjectAttribute::KeyType(KeyType::Rsa) => Attribute::KeyType(CkKeyType::RSA),
        ObjectAttribute::KeyType(KeyType::Other(raw)) => {
            return Err(BackendError::new(
                "C_FindObjectsInit",
                format!("unsupported key type 0x{:x} in template", raw),
            ));
        }
        ObjectAttribute::EcParams(v) => Attribute::EcParams(v.clone()),
        ObjectAttribute::EcPoint(v) => Attribute::EcPoint(v.clone()),
        ObjectAttribute::Modulus(v) => Attribute::Modulus(v.clone()),
        ObjectAttribute::PublicExponent(v) => Attribute::PublicExponent(v.clone()),
    })
}

fn from_cryptoki_attribute(attr: Attribute) -> Option<ObjectAttribute> {
    match attr {
        Attribute::Class(class) if class == CkObjectClass::PRIVATE_KEY => {
            Some(ObjectAttribute::Class(ObjectClass::PrivateKey))
        }
        Attribute::Class(class) if class == CkObjectClass::PUBLIC_KEY => {
            Some(ObjectAttribute::Class(ObjectClass::PublicKey))
        }
        Attribute::Label(label) => Some(ObjectAttribute::Label(label)),
        Attribute::Id(id) => Some(ObjectAttribute::Id(id)),
        Attribute::KeyType(key_type) if key_type == CkKeyType::EC => {
            Some(ObjectAttribute::KeyType(KeyType::Ec))
        }
        Attribute::KeyType(key_type) if key_type == CkKeyType::RSA => {
            Some(ObjectAttribute::KeyType(KeyType::Rsa))
        }
        Attribute::KeyType(key_type) => Some(ObjectAttribute::KeyType(KeyType::Other(*key_type as u64))),
        Attribute::EcParams(v) => Some(ObjectAttribute::EcParams(v)),
        Attribute::EcPoint(v) => Some(ObjectAttribute::EcPoint(v)),
        Attribute::Modulus(v) => Some(ObjectAttribute::Modulus(v)),
        Attribute::PublicExponent(v) => Some(ObjectAttribute::PublicExponent(v)),
        _ => None,
    }
}

fn to_attribute_type(kind: AttributeKind) -> AttributeType {
    match kind {
        AttributeKind::Class => AttributeType::Class,
        AttributeKind::Label => AttributeType::Label,
        AttributeKind::Id => AttributeType::Id,
        AttributeKind::KeyType => AttributeType::KeyType,
        AttributeKind::EcParams => AttributeType::EcParams,
        AttributeKind::EcPoint => AttributeType::EcPoint,
        AttributeKind::Modulus => AttributeType::Modulus,
        AttributeKind::PublicExponent => AttributeType::PublicExponent,
    }
}

fn to_mechanism(mechanism: &SignMechanism) -> Mechanism<'static> {
    match mechanism {
        SignMechanism::Ecdsa => Mechanism::Ecdsa,
        SignMechanism::RsaPkcs => Mechanism::RsaPkcs,
        SignMechanism::RsaPkcsPss { hash } => {
            let (hash_alg, mgf) = match hash {
                HashAlgorithm::Sha256 => (MechanismType::SHA256, PkcsMgfType::MGF1_SHA256),
                HashAlgorithm::Sha384 => (MechanismType::SHA384, PkcsMgfType::MGF1_SHA384),
                HashAlgorithm::Sha512 => (MechanismType::SHA512, PkcsMgfType::MGF1_SHA512),
            };
            Mechanism::RsaPkcsPss(PkcsPssParams {
                hash_alg,
                mgf,
                s_len: (hash.output_len() as u64).into(),
            })
        }
    }
}

/// Pull at most `max` handles after the first `skip`, never more from `found`
fn bounded_batch<H, E>(
    found: impl Iterator<Item = Result<H, E>>,
    skip: usize,
    max: usize,
) -> Result<Vec<H>, E> {
    found.skip(skip).take(max).collect()
}

impl Pkcs11Session for CryptokiSession {
    fn login_user(&mut self, pin: &SecretString) -> Result<(), BackendError> {
        let auth_pin = AuthPin::new(pin.expose_secret().as_str().into());
        self.session
            .login(UserType::User, Some(&auth_pin))
            .map_err(|e| BackendError::new("C_Login", e.to_string()))
    }

    fn logout(&mut self) -> Result<(), BackendError> {
        self.session
            .logout()
            .map_err(|e| BackendError::new("C_Logout", e.to_string()))
    }

    fn close(self: Box<Self>) -> Result<(), BackendError> {
        // cryptoki's Session runs C_CloseSession on drop and logs its own failures
        drop(self);
        Ok(())
    }

    fn find_objects_init(&mut self, template: &[ObjectAttribute]) -> Result<(), BackendError> {
        if self.search.is_some() {
            return Err(BackendError::new("C_FindObjectsInit", "CKR_OPERATION_ACTIVE"));
        }
        let template = template
            .iter()
            .map(to_cryptoki_attribute)
            .collect::<Result<Vec<_>, _>>()?;
        self.search = Some(PendingSearch {
            template,
            returned: 0,
        });
        Ok(())
    }

    fn find_objects(&mut self, max: usize) -> Result<Vec<ObjectHandle>, BackendError> {
        let pending = self
            .search
            .as_mut()
            .ok_or_else(|| BackendError::new("C_FindObjects", "CKR_OPERATION_NOT_INITIALIZED"))?;
        let Some(cache_size) = NonZeroUsize::new(max) else {
            return Ok(Vec::new());
        };

        // The iterator runs C_FindObjectsFinal when it goes out of scope
        let batch = {
            let found = self
                .session
                .iter_objects_with_cache_size(&pending.template, cache_size)
                .map_err(|e| BackendError::new("C_FindObjectsInit", e.to_string()))?;
            bounded_batch(found, pending.returned, max)
                .map_err(|e| BackendError::new("C_FindObjects", e.to_string()))?
        };
        pending.returned += batch.len();
        trace!("PKCS#11 search returned {} objects", batch.len());
        Ok(batch.into_iter().map(|h| self.register(h)).collect())
    }

    fn find_objects_final(&mut self) -> Result<(), BackendError> {
        self.search
            .take()
            .map(|_| ())
            .ok_or_else(|| BackendError::new("C_FindObjectsFinal", "CKR_OPERATION_NOT_INITIALIZED"))
    }

    fn get_attributes(
        &mut self,
        object: ObjectHandle,
        kinds: &[AttributeKind],
    ) -> Result<Vec<ObjectAttribute>, BackendError> {
        let handle = self.resolve(object, "C_GetAttributeValue")?;
        let types: Vec<AttributeType> = kinds.iter().copied().map(to_attribute_type).collect();
        let attributes = self
            .session
            .get_attributes(handle, &types)
            .map_err(|e| BackendError::new("C_GetAttributeValue", e.to_string()))?;
        Ok(attributes.into_iter().filter_map(from_cryptoki_attribute).collect())
    }

    fn sign_init(&mut self, mechanism: &SignMechanism, key: ObjectHandle) -> Result<(), BackendError> {
        if self.signing.is_some() {
            return Err(BackendError::new("C_SignInit", "CKR_OPERATION_ACTIVE"));
        }
        let handle = self.resolve(key, "C_SignInit")?;
        self.signing = Some((*mechanism, handle));
        Ok(())
    }

    fn sign(&mut self, data: &[u8]) -> Result<Vec<u8>, BackendError> {
        // cryptoki issues C_SignInit and C_Sign together
        let (mechanism, key) = self
            .signing
            .take()
            .ok_or_else(|| BackendError::new("C_Sign", "CKR_OPERATION_NOT_INITIALIZED"))?;
        self.session
            .sign(&to_mechanism(&mechanism), key, data)
            .map_err(|e| BackendError::new("C_Sign", e.to_string()))
    }
}
