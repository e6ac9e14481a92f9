//! Session manager
//!
//! Acquisition order is module → slot → session → login; release runs in
//! exact reverse: logout → close session → finalize module.
//!
//! - [`HsmModule`] is the process-scoped module handle. It is shared through
//!   `Arc` by every session opened from it and finalized once, when the last
//!   holder drops it.
//! - [`Session`] owns one read-write session handle and its authentication
//!   state. All calls against the handle go through a single
//!   `parking_lot::Mutex`, which is the unit of mutual exclusion for
//!   searches and signatures.
//!
//! Teardown is best-effort: logout, close and finalize failures are logged
//! and never replace the caller's result.

use crate::backend::{Pkcs11Module, Pkcs11Session, SlotId};
use crate::{HsmTlsError, Result};
use parking_lot::Mutex;
use secrecy::SecretString;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

#[cfg(feature = "pkcs11")]
use std::path::Path;

static NEXT_SESSION_SERIAL: AtomicU64 = AtomicU64::new(1);

/// How to pick the slot to open a session on
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SlotSelection {
    /// First slot with a token, in enumeration order
    #[default]
    FirstAvailable,
    /// The slot whose token label matches exactly
    TokenLabel(String),
}

impl SlotSelection {
    /// `TokenLabel` when a label is configured, `FirstAvailable` otherwise
    pub fn from_token_label(label: Option<&str>) -> Self {
        match label {
            Some(label) => Self::TokenLabel(label.to_string()),
            None => Self::FirstAvailable,
        }
    }
}

/// A loaded and initialized PKCS#11 module
pub struct HsmModule {
    name: String,
    backend: Box<dyn Pkcs11Module>,
}

impl fmt::Debug for HsmModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HsmModule")
            .field("name", &self.name)
            .field("backend", &self.backend)
            .finish()
    }
}

impl HsmModule {
    /// Load the native module at `module_path` and initialize it
    ///
    /// There is no retry: a missing or incompatible module is a
    /// configuration error.
    ///
    /// # Errors
    ///
    /// Returns `ModuleLoadFailed` if loading or `C_Initialize` fails.
    #[cfg(feature = "pkcs11")]
    pub fn open(module_path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let path = module_path.as_ref();
        info!("Initializing PKCS#11 module: {}", path.display());

        let backend = crate::backend::cryptoki::CryptokiModule::load(path).map_err(|e| {
            HsmTlsError::ModuleLoadFailed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        })?;
        Ok(Self::with_backend(path.display().to_string(), backend))
    }

    /// Wrap an already-initialized module implementation
    pub fn with_backend(name: impl Into<String>, backend: impl Pkcs11Module + 'static) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            backend: Box::new(backend),
        })
    }

    /// Module path or backend name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Slots with a token present, with their token labels
    ///
    /// # Errors
    ///
    /// Returns `NoUsableSlot` if slot enumeration fails.
    pub fn token_labels(&self) -> Result<Vec<(SlotId, String)>> {
        let slots = self
            .backend
            .slots_with_token()
            .map_err(|e| HsmTlsError::NoUsableSlot {
                reason: e.to_string(),
            })?;

        let mut labels = Vec::with_capacity(slots.len());
        for slot in slots {
            match self.backend.token_label(slot) {
                Ok(label) => labels.push((slot, label)),
                Err(e) => warn!("Skipping slot {}: {}", slot, e),
            }
        }
        Ok(labels)
    }

    /// Select the slot to work with
    ///
    /// # Errors
    ///
    /// Returns `NoUsableSlot` if no slot has a token, `TokenNotFound` if a
    /// token label was requested and no token carries it.
    pub fn select_slot(&self, selection: &SlotSelection) -> Result<SlotId> {
        let slots = self
            .backend
            .slots_with_token()
            .map_err(|e| HsmTlsError::NoUsableSlot {
                reason: format!("Failed to get PKCS#11 slots: {}", e),
            })?;

        if slots.is_empty() {
            return Err(HsmTlsError::NoUsableSlot {
                reason: "No PKCS#11 slots with tokens found".to_string(),
            });
        }

        let slot = match selection {
            SlotSelection::FirstAvailable => slots[0],
            SlotSelection::TokenLabel(expected) => {
                let labels = self.token_labels()?;
                labels
                    .iter()
                    .find(|(_, label)| label == expected)
                    .map(|(slot, _)| *slot)
                    .ok_or_else(|| HsmTlsError::TokenNotFound {
                        label: expected.clone(),
                        available: labels.iter().map(|(_, l)| l.clone()).collect(),
                    })?
            }
        };

        debug!("Selected PKCS#11 slot: {}", slot);
        Ok(slot)
    }

    /// Open a serial read-write session on `slot`
    ///
    /// # Errors
    ///
    /// Returns `SessionOpenFailed` if the module refuses the session.
    pub fn open_rw_session(self: &Arc<Self>, slot: SlotId) -> Result<Session> {
        let handle = self
            .backend
            .open_rw_session(slot)
            .map_err(|e| HsmTlsError::SessionOpenFailed {
                reason: e.to_string(),
            })?;

        let serial = NEXT_SESSION_SERIAL.fetch_add(1, Ordering::Relaxed);
        trace!("Opened PKCS#11 session #{} on slot {}", serial, slot);
        Ok(Session {
            serial,
            slot,
            inner: Mutex::new(SessionInner {
                handle: Some(handle),
                state: SessionState::Unauthenticated,
            }),
            module: Arc::clone(self),
        })
    }
}

impl Drop for HsmModule {
    fn drop(&mut self) {
        match self.backend.finalize() {
            Ok(()) => info!("PKCS#11 module '{}' finalized", self.name),
            Err(e) => warn!("Failed to finalize PKCS#11 module '{}': {}", self.name, e),
        }
    }
}

/// Authentication state of a [`Session`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Open, not logged in
    Unauthenticated,
    /// Logged in as the normal user
    Authenticated,
    /// Logged out and closed; terminal
    Closed,
}

struct SessionInner {
    handle: Option<Box<dyn Pkcs11Session>>,
    state: SessionState,
}

/// One read-write session on a token
///
/// Closing is idempotent and also runs on drop, so teardown happens exactly
/// once on every exit path.
pub struct Session {
    serial: u64,
    slot: SlotId,
    inner: Mutex<SessionInner>,
    // Dropped after `inner`, so the module outlives the session handle
    module: Arc<HsmModule>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("serial", &self.serial)
            .field("slot", &self.slot)
            .field("state", &self.state())
            .field("module", &self.module.name())
            .finish()
    }
}

impl Session {
    /// Process-unique serial number of this session
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Slot the session was opened on
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Module the session belongs to
    pub fn module(&self) -> &Arc<HsmModule> {
        &self.module
    }

    /// Current authentication state
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Log in as the normal user
    ///
    /// The PIN is consumed and zeroized when this call returns, whatever the
    /// outcome. A failed login leaves the session unauthenticated.
    ///
    /// # Errors
    ///
    /// Returns `AuthenticationFailed` if the token rejects the PIN and
    /// `SessionClosed` if the session was already closed.
    pub fn login(&self, pin: SecretString) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            SessionState::Closed => return Err(HsmTlsError::SessionClosed),
            SessionState::Authenticated => {
                debug!("PKCS#11 session #{} already authenticated", self.serial);
                return Ok(());
            }
            SessionState::Unauthenticated => {}
        }

        let handle = inner.handle.as_mut().ok_or(HsmTlsError::SessionClosed)?;
        let outcome = handle.login_user(&pin);
        drop(pin);

        match outcome {
            Ok(()) => {
                inner.state = SessionState::Authenticated;
                info!("PKCS#11 session #{} authenticated", self.serial);
                Ok(())
            }
            Err(e) => Err(HsmTlsError::AuthenticationFailed {
                reason: e.to_string(),
            }),
        }
    }

    /// Run `f` against the session handle while holding the session lock
    ///
    /// # Errors
    ///
    /// Returns `SessionClosed` or `NotAuthenticated` when the session is not
    /// usable, otherwise whatever `f` returns.
    pub(crate) fn with_authenticated<T>(
        &self,
        f: impl FnOnce(&mut dyn Pkcs11Session) -> Result<T>,
    ) -> Result<T> {
        let mut inner = self.inner.lock();
        match inner.state {
            SessionState::Closed => Err(HsmTlsError::SessionClosed),
            SessionState::Unauthenticated => Err(HsmTlsError::NotAuthenticated),
            SessionState::Authenticated => {
                let handle = inner.handle.as_mut().ok_or(HsmTlsError::SessionClosed)?;
                f(handle.as_mut())
            }
        }
    }

    /// Log out (if logged in) and close the session
    ///
    /// Failures are logged, not returned. Calling this more than once is a
    /// no-op.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Closed {
            return;
        }

        let was_authenticated = inner.state == SessionState::Authenticated;
        inner.state = SessionState::Closed;

        if let Some(mut handle) = inner.handle.take() {
            if was_authenticated {
                if let Err(e) = handle.logout() {
                    warn!("Failed to logout PKCS#11 session #{}: {}", self.serial, e);
                }
            }
            if let Err(e) = handle.close() {
                warn!("Failed to close PKCS#11 session #{}: {}", self.serial, e);
            }
        }
        info!("PKCS#11 session #{} closed", self.serial);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::soft::{SoftCall, SoftKeyPair, SoftModule, SoftToken};
    use crate::ErrorKind;
    use pretty_assertions::assert_eq;

    fn pin(value: &str) -> SecretString {
        SecretString::new(value.to_string())
    }

    fn soft_module() -> SoftModule {
        SoftModule::new()
            .with_token(SoftToken::new("alpha", "1111"))
            .with_token(
                SoftToken::new("beta", "2222").with_key_pair("client", SoftKeyPair::generate_p256()),
            )
    }

    #[test]
    fn test_select_first_available() {
        let module = HsmModule::with_backend("soft", soft_module());
        let slot = module.select_slot(&SlotSelection::FirstAvailable).unwrap();
        assert_eq!(slot, SlotId(0));
    }

    #[test]
    fn test_select_by_token_label() {
        let module = HsmModule::with_backend("soft", soft_module());
        let slot = module
            .select_slot(&SlotSelection::TokenLabel("beta".to_string()))
            .unwrap();
        assert_eq!(slot, SlotId(1));

        let err = module
            .select_slot(&SlotSelection::TokenLabel("gamma".to_string()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TokenNotFound);
        assert!(err.to_string().contains("beta"));
    }

    #[test]
    fn test_no_usable_slot() {
        let module = HsmModule::with_backend("empty", SoftModule::new());
        let err = module.select_slot(&SlotSelection::FirstAvailable).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoUsableSlot);
    }

    #[test]
    fn test_open_session_on_missing_slot() {
        let module = HsmModule::with_backend("soft", soft_module());
        let err = module.open_rw_session(SlotId(9)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionOpenFailed);
    }

    #[test]
    fn test_teardown_order() {
        let soft = soft_module();
        let module = HsmModule::with_backend("soft", soft.clone());
        let session = module.open_rw_session(SlotId(1)).unwrap();
        drop(module);

        session.login(pin("2222")).unwrap();
        assert_eq!(session.state(), SessionState::Authenticated);
        drop(session);

        assert_eq!(
            soft.journal(),
            vec![
                SoftCall::OpenSession,
                SoftCall::Login,
                SoftCall::Logout,
                SoftCall::CloseSession,
                SoftCall::Finalize,
            ]
        );
    }

    #[test]
    fn test_failed_login_then_close() {
        let soft = soft_module();
        let module = HsmModule::with_backend("soft", soft.clone());
        let session = module.open_rw_session(SlotId(1)).unwrap();

        let err = session.login(pin("9999")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
        assert_eq!(session.state(), SessionState::Unauthenticated);

        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(soft.count(SoftCall::Logout), 0);
        assert_eq!(soft.count(SoftCall::CloseSession), 1);
        assert_eq!(soft.open_sessions(), 0);
    }

    #[test]
    fn test_operations_require_authentication() {
        let module = HsmModule::with_backend("soft", soft_module());
        let session = module.open_rw_session(SlotId(1)).unwrap();

        let err = session.with_authenticated(|_| Ok(())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotAuthenticated);

        session.close();
        let err = session.with_authenticated(|_| Ok(())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionClosed);
        let err = session.login(pin("2222")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionClosed);
    }

    #[test]
    fn test_module_finalized_once_after_last_session() {
        let soft = soft_module();
        let module = HsmModule::with_backend("soft", soft.clone());
        let first = module.open_rw_session(SlotId(0)).unwrap();
        let second = module.open_rw_session(SlotId(1)).unwrap();
        drop(module);

        drop(first);
        assert!(!soft.is_finalized());
        drop(second);
        assert!(soft.is_finalized());
        assert_eq!(soft.count(SoftCall::Finalize), 1);
    }

    #[test]
    fn test_session_debug_has_no_secrets() {
        let module = HsmModule::with_backend("soft", soft_module());
        let session = module.open_rw_session(SlotId(1)).unwrap();
        session.login(pin("2222")).unwrap();
        let debug = format!("{:?}", session);
        assert!(debug.contains("Authenticated"));
        assert!(!debug.contains("2222"));
    }
}
