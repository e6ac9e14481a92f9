//! # hsm-tls - TLS client authentication with HSM-resident keys
//!
//! Presents a private key that never leaves a PKCS#11 hardware security
//! module as a rustls client credential, so an outbound HTTPS connection can
//! authenticate with mutual TLS.
//!
//! ## Architecture
//!
//! - `session` - module load, slot selection, read-write session, login and
//!   ordered teardown
//! - `locator` - label → private-key handle, plus the paired public key
//! - `signer` - the [`KeySigner`] capability, its HSM implementation and the
//!   rustls `SigningKey` glue
//! - `credential` - certificate/key binding with a mandatory key check, and
//!   the rustls `ClientConfig` it is attached to
//! - `identity` - the whole sequence from [`HsmTlsConfig`] in one call
//! - `backend` - the PKCS#11 boundary: `cryptoki` for native modules and an
//!   in-memory software token
//!
//! ## Feature Flags
//!
//! - `pkcs11` (default) - load native modules through `cryptoki`
//! - `soft-token` (default) - software token for tests and demos
//!
//! ## Example
//!
//! ```rust,no_run
//! use hsm_tls::{HsmIdentity, HsmTlsConfig};
//!
//! # fn main() -> hsm_tls::Result<()> {
//! let config = HsmTlsConfig::from_env()?;
//! let identity = HsmIdentity::open(&config)?;
//! let tls = identity.client_config()?;
//! # let _ = tls;
//! # Ok(())
//! # }
//! ```
//!
//! ## Teardown order
//!
//! Logout → close session → finalize module. Sessions keep the module alive
//! through an `Arc`, so finalization happens only after the last session has
//! closed, on every exit path.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod backend;
pub mod certificate;
pub mod config;
pub mod credential;
pub mod error;
pub mod identity;
pub mod locator;
pub mod public_key;
pub mod scheme;
pub mod session;
pub mod signer;

pub use config::{HsmTlsConfig, HsmTlsConfigBuilder};
pub use credential::{AssemblyOptions, Credential, PeerVerification, TlsPolicy, TlsVersion};
pub use error::{ErrorKind, HsmTlsError};
pub use identity::HsmIdentity;
pub use locator::{find_private_key, find_private_key_strict, find_public_key, KeyHandle};
pub use public_key::{EcCurve, PublicKeyMaterial};
pub use scheme::{HashAlgorithm, SignatureScheme};
pub use session::{HsmModule, Session, SessionState, SlotSelection};
pub use signer::{prove_possession, HsmSigner, KeySigner, RustlsSigningKey, SignerStats};

/// Result type for HSM TLS operations
pub type Result<T> = std::result::Result<T, HsmTlsError>;
