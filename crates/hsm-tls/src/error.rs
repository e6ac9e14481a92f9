//! Error taxonomy for HSM-backed TLS client authentication
//!
//! Every failure that aborts credential assembly carries its specific kind,
//! so operators can tell "bad PIN" from "module missing" from "key not found".
//! Nothing here is retried internally.

use std::path::PathBuf;

/// Errors produced while opening the HSM, locating the key, signing or
/// assembling the TLS credential
#[derive(Debug, thiserror::Error)]
pub enum HsmTlsError {
    /// The PKCS#11 module could not be loaded or initialized
    #[error("Failed to load PKCS#11 module '{path}': {reason}")]
    ModuleLoadFailed {
        /// Path of the module that failed
        path: PathBuf,
        /// Underlying failure
        reason: String,
    },

    /// No slot with a token present
    #[error("No usable PKCS#11 slot: {reason}")]
    NoUsableSlot {
        /// Underlying failure
        reason: String,
    },

    /// A token label was configured but no slot carries it
    #[error("No token labelled '{label}' (available: {available:?})")]
    TokenNotFound {
        /// Configured token label
        label: String,
        /// Labels of the tokens that were present
        available: Vec<String>,
    },

    /// Opening the read-write session failed
    #[error("Failed to open PKCS#11 session: {reason}")]
    SessionOpenFailed {
        /// Underlying failure
        reason: String,
    },

    /// User login was rejected
    #[error("Failed to login to PKCS#11 session: {reason}")]
    AuthenticationFailed {
        /// Underlying failure
        reason: String,
    },

    /// No private key object carries the label
    #[error("Private key not found for label '{label}'")]
    KeyNotFound {
        /// Label that was searched
        label: String,
    },

    /// The HSM refused or failed the signature
    #[error("Signing failed: {reason}")]
    SignFailed {
        /// Underlying failure
        reason: String,
    },

    /// The certificate does not belong to the HSM key
    #[error("Certificate public key does not match the HSM key: {reason}")]
    KeyMismatch {
        /// What differed
        reason: String,
    },

    /// The certificate could not be read or parsed
    #[error("Failed to parse certificate: {reason}")]
    CertificateParseFailed {
        /// Underlying failure
        reason: String,
    },

    /// Public key bytes from the HSM or a certificate are malformed or unsupported
    #[error("Invalid public key: {reason}")]
    InvalidPublicKey {
        /// What was wrong
        reason: String,
    },

    /// More than one private key carries the label and strict lookup is on
    #[error("Label '{label}' matches more than one private key")]
    AmbiguousKey {
        /// Label that was searched
        label: String,
    },

    /// A key handle was used with a session that did not produce it
    #[error("Key handle for '{label}' is not valid in this session")]
    StaleKeyHandle {
        /// Label of the key the handle refers to
        label: String,
    },

    /// The session has already been closed
    #[error("PKCS#11 session is closed")]
    SessionClosed,

    /// The operation requires a logged-in session
    #[error("PKCS#11 session is not authenticated")]
    NotAuthenticated,

    /// Invalid or incomplete configuration
    #[error("Configuration error: {reason}")]
    Configuration {
        /// What was wrong
        reason: String,
    },

    /// rustls rejected the client configuration
    #[error("TLS configuration error: {reason}")]
    Tls {
        /// Underlying failure
        reason: String,
    },

    /// IO error
    #[error("IO error on '{path}': {source}")]
    Io {
        /// File being accessed
        path: PathBuf,
        /// IO error that occurred
        #[source]
        source: std::io::Error,
    },
}

/// Fieldless discriminant of [`HsmTlsError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`HsmTlsError::ModuleLoadFailed`]
    ModuleLoadFailed,
    /// See [`HsmTlsError::NoUsableSlot`]
    NoUsableSlot,
    /// See [`HsmTlsError::TokenNotFound`]
    TokenNotFound,
    /// See [`HsmTlsError::SessionOpenFailed`]
    SessionOpenFailed,
    /// See [`HsmTlsError::AuthenticationFailed`]
    AuthenticationFailed,
    /// See [`HsmTlsError::KeyNotFound`]
    KeyNotFound,
    /// See [`HsmTlsError::SignFailed`]
    SignFailed,
    /// See [`HsmTlsError::KeyMismatch`]
    KeyMismatch,
    /// See [`HsmTlsError::CertificateParseFailed`]
    CertificateParseFailed,
    /// See [`HsmTlsError::InvalidPublicKey`]
    InvalidPublicKey,
    /// See [`HsmTlsError::AmbiguousKey`]
    AmbiguousKey,
    /// See [`HsmTlsError::StaleKeyHandle`]
    StaleKeyHandle,
    /// See [`HsmTlsError::SessionClosed`]
    SessionClosed,
    /// See [`HsmTlsError::NotAuthenticated`]
    NotAuthenticated,
    /// See [`HsmTlsError::Configuration`]
    Configuration,
    /// See [`HsmTlsError::Tls`]
    Tls,
    /// See [`HsmTlsError::Io`]
    Io,
}

impl HsmTlsError {
    /// The kind of this error, for matching without destructuring
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ModuleLoadFailed { .. } => ErrorKind::ModuleLoadFailed,
            Self::NoUsableSlot { .. } => ErrorKind::NoUsableSlot,
            Self::TokenNotFound { .. } => ErrorKind::TokenNotFound,
            Self::SessionOpenFailed { .. } => ErrorKind::SessionOpenFailed,
            Self::AuthenticationFailed { .. } => ErrorKind::AuthenticationFailed,
            Self::KeyNotFound { .. } => ErrorKind::KeyNotFound,
            Self::SignFailed { .. } => ErrorKind::SignFailed,
            Self::KeyMismatch { .. } => ErrorKind::KeyMismatch,
            Self::CertificateParseFailed { .. } => ErrorKind::CertificateParseFailed,
            Self::InvalidPublicKey { .. } => ErrorKind::InvalidPublicKey,
            Self::AmbiguousKey { .. } => ErrorKind::AmbiguousKey,
            Self::StaleKeyHandle { .. } => ErrorKind::StaleKeyHandle,
            Self::SessionClosed => ErrorKind::SessionClosed,
            Self::NotAuthenticated => ErrorKind::NotAuthenticated,
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Tls { .. } => ErrorKind::Tls,
            Self::Io { .. } => ErrorKind::Io,
        }
    }

    pub(crate) fn sign_failed(reason: impl Into<String>) -> Self {
        Self::SignFailed {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_key(reason: impl Into<String>) -> Self {
        Self::InvalidPublicKey {
            reason: reason.into(),
        }
    }

    pub(crate) fn certificate(reason: impl Into<String>) -> Self {
        Self::CertificateParseFailed {
            reason: reason.into(),
        }
    }

    pub(crate) fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }
}

impl From<rustls::Error> for HsmTlsError {
    fn from(e: rustls::Error) -> Self {
        Self::Tls {
            reason: e.to_string(),
        }
    }
}

impl From<config::ConfigError> for HsmTlsError {
    fn from(e: config::ConfigError) -> Self {
        Self::Configuration {
            reason: format!("Failed to parse configuration: {}", e),
        }
    }
}
