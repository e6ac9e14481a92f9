//! Key locator
//!
//! Resolves a key label to a private-key object inside an authenticated
//! session, and finds the public half that goes with it.

use crate::backend::{
    AttributeKind, BackendError, KeyType, ObjectAttribute, ObjectClass, ObjectHandle,
    Pkcs11Session,
};
use crate::public_key::PublicKeyMaterial;
use crate::session::Session;
use crate::{HsmTlsError, Result};
use tracing::{debug, trace, warn};

/// Reference to a private-key object inside one [`Session`]
///
/// The handle records the serial of the session that produced it; using it
/// with any other session fails with `StaleKeyHandle`, and using it after its
/// session closed fails with `SessionClosed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyHandle {
    session: u64,
    object: ObjectHandle,
    label: String,
    key_type: KeyType,
}

impl KeyHandle {
    /// Label the key was found under
    pub fn label(&self) -> &str {
        &self.label
    }

    /// `CKA_KEY_TYPE` of the private key
    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    /// Serial of the session the handle belongs to
    pub fn session_serial(&self) -> u64 {
        self.session
    }

    pub(crate) fn object_in(&self, session: &Session) -> Result<ObjectHandle> {
        if self.session != session.serial() {
            return Err(HsmTlsError::StaleKeyHandle {
                label: self.label.clone(),
            });
        }
        Ok(self.object)
    }
}

/// Find the private key labelled `label`
///
/// Searches with a bound of one, so when several private keys share the
/// label the first one the token returns is used.
///
/// # Errors
///
/// Returns `KeyNotFound` if no private key carries the label, or if the
/// search itself fails.
pub fn find_private_key(session: &Session, label: &str) -> Result<KeyHandle> {
    locate(session, label, 1)
}

/// Like [`find_private_key`], but refuses ambiguous labels
///
/// # Errors
///
/// Returns `AmbiguousKey` if more than one private key carries the label.
pub fn find_private_key_strict(session: &Session, label: &str) -> Result<KeyHandle> {
    locate(session, label, 2)
}

fn locate(session: &Session, label: &str, bound: usize) -> Result<KeyHandle> {
    let not_found = || HsmTlsError::KeyNotFound {
        label: label.to_string(),
    };
    let template = [
        ObjectAttribute::Class(ObjectClass::PrivateKey),
        ObjectAttribute::Label(label.as_bytes().to_vec()),
    ];

    session.with_authenticated(|handle| {
        let found = search(handle, &template, bound).map_err(|e| {
            warn!("Private key search for '{}' failed: {}", label, e);
            not_found()
        })?;

        let object = match found.as_slice() {
            [] => return Err(not_found()),
            [object] => *object,
            _ => {
                return Err(HsmTlsError::AmbiguousKey {
                    label: label.to_string(),
                });
            }
        };
        debug!("Found private key '{}' with handle {:?}", label, object);

        let key_type = handle
            .get_attributes(object, &[AttributeKind::KeyType])
            .map_err(|e| {
                warn!("Failed to read key type of '{}': {}", label, e);
                not_found()
            })?
            .into_iter()
            .find_map(|attr| match attr {
                ObjectAttribute::KeyType(key_type) => Some(key_type),
                _ => None,
            })
            .ok_or_else(|| {
                warn!("Private key '{}' exposes no CKA_KEY_TYPE", label);
                not_found()
            })?;

        Ok(KeyHandle {
            session: session.serial(),
            object,
            label: label.to_string(),
            key_type,
        })
    })
}

/// Read the public key paired with `key`
///
/// Looks for a public-key object sharing the private key's `CKA_ID`, then one
/// sharing its label. RSA private keys usually carry the modulus and public
/// exponent themselves, which is used as the last resort. Returns `None` when
/// the token exposes no public half.
///
/// # Errors
///
/// Returns `StaleKeyHandle` for a handle from another session, and
/// `InvalidPublicKey` if attribute reads fail or the key is malformed.
pub fn find_public_key(session: &Session, key: &KeyHandle) -> Result<Option<PublicKeyMaterial>> {
    let object = key.object_in(session)?;
    let read_failed = |e: BackendError| HsmTlsError::invalid_key(e.to_string());

    session.with_authenticated(|handle| {
        let private = handle
            .get_attributes(
                object,
                &[
                    AttributeKind::Id,
                    AttributeKind::Modulus,
                    AttributeKind::PublicExponent,
                ],
            )
            .map_err(read_failed)?;

        let mut templates = Vec::with_capacity(2);
        if let Some(id) = private.iter().find_map(|attr| match attr {
            ObjectAttribute::Id(id) if !id.is_empty() => Some(id.clone()),
            _ => None,
        }) {
            templates.push(vec![
                ObjectAttribute::Class(ObjectClass::PublicKey),
                ObjectAttribute::Id(id),
            ]);
        }
        templates.push(vec![
            ObjectAttribute::Class(ObjectClass::PublicKey),
            ObjectAttribute::Label(key.label.as_bytes().to_vec()),
        ]);

        for template in &templates {
            let Some(public) = search(handle, template, 1).map_err(read_failed)?.first().copied()
            else {
                continue;
            };
            let attributes = handle
                .get_attributes(
                    public,
                    &[
                        AttributeKind::EcParams,
                        AttributeKind::EcPoint,
                        AttributeKind::Modulus,
                        AttributeKind::PublicExponent,
                    ],
                )
                .map_err(read_failed)?;
            if let Some(material) = material_from(key.key_type, &attributes)? {
                debug!("Read public key for '{}' from object {:?}", key.label, public);
                return Ok(Some(material));
            }
        }

        if key.key_type == KeyType::Rsa {
            if let Some(material) = material_from(KeyType::Rsa, &private)? {
                debug!("Using modulus of private key '{}'", key.label);
                return Ok(Some(material));
            }
        }
        Ok(None)
    })
}

// find-init → find(bound) → find-final, with find-final on every path
fn search(
    handle: &mut dyn Pkcs11Session,
    template: &[ObjectAttribute],
    bound: usize,
) -> std::result::Result<Vec<ObjectHandle>, BackendError> {
    trace!("Searching objects matching {:?}", template);
    handle.find_objects_init(template)?;
    let found = handle.find_objects(bound);
    if let Err(e) = handle.find_objects_final() {
        warn!("Failed to finalize object search: {}", e);
    }
    found
}

fn material_from(
    key_type: KeyType,
    attributes: &[ObjectAttribute],
) -> Result<Option<PublicKeyMaterial>> {
    let value = |kind: AttributeKind| {
        attributes.iter().find_map(|attr| match attr {
            ObjectAttribute::EcParams(v)
            | ObjectAttribute::EcPoint(v)
            | ObjectAttribute::Modulus(v)
            | ObjectAttribute::PublicExponent(v)
                if attr.kind() == kind =>
            {
                Some(v.as_slice())
            }
            _ => None,
        })
    };

    match key_type {
        KeyType::Ec => match (value(AttributeKind::EcParams), value(AttributeKind::EcPoint)) {
            (Some(params), Some(point)) => PublicKeyMaterial::from_pkcs11_ec(params, point).map(Some),
            _ => Ok(None),
        },
        KeyType::Rsa => match (
            value(AttributeKind::Modulus),
            value(AttributeKind::PublicExponent),
        ) {
            (Some(modulus), Some(exponent)) => PublicKeyMaterial::rsa(modulus, exponent).map(Some),
            _ => Ok(None),
        },
        KeyType::Other(raw) => Err(HsmTlsError::invalid_key(format!(
            "Unsupported key type 0x{:x}",
            raw
        ))),
    }
}
