//! One-call bootstrap from configuration to a ready client credential
//!
//! Runs the whole acquisition sequence: select slot, open session, log in,
//! locate the key, build the signer, load the certificate and assemble the
//! credential. Any failure drops what was acquired so far in reverse order.

use crate::config::HsmTlsConfig;
use crate::credential::{AssemblyOptions, Credential, TlsPolicy};
use crate::locator;
use crate::session::{HsmModule, Session};
use crate::signer::{HsmSigner, KeySigner, SignerStats};
use crate::{ErrorKind, HsmTlsError, Result};
use rustls::pki_types::CertificateDer;
use std::sync::Arc;
use tracing::{debug, info};

/// An authenticated HSM session holding a TLS client credential
#[derive(Debug)]
pub struct HsmIdentity {
    session: Arc<Session>,
    signer: Arc<HsmSigner>,
    credential: Credential,
    policy: TlsPolicy,
}

impl HsmIdentity {
    /// Load the configured module and build the credential
    ///
    /// Blocks on every HSM round trip; use [`HsmIdentity::open_async`] from
    /// async code.
    ///
    /// # Errors
    ///
    /// Any error of the taxonomy, from the step that failed.
    #[cfg(feature = "pkcs11")]
    pub fn open(config: &HsmTlsConfig) -> Result<Self> {
        config.validate()?;
        let module = HsmModule::open(&config.module_path)?;
        let chain = crate::certificate::load_pem_chain(&config.certificate_path)?;
        Self::open_with_module(&module, config, chain)
    }

    /// [`HsmIdentity::open`] on the blocking thread pool
    ///
    /// # Errors
    ///
    /// As [`HsmIdentity::open`].
    #[cfg(feature = "pkcs11")]
    pub async fn open_async(config: HsmTlsConfig) -> Result<Self> {
        tokio::task::spawn_blocking(move || Self::open(&config))
            .await
            .map_err(|e| HsmTlsError::SessionOpenFailed {
                reason: format!("HSM bootstrap task failed: {}", e),
            })?
    }

    /// Build the credential on an already-loaded module
    ///
    /// # Errors
    ///
    /// Any error of the taxonomy, from the step that failed.
    pub fn open_with_module(
        module: &Arc<HsmModule>,
        config: &HsmTlsConfig,
        chain: Vec<CertificateDer<'static>>,
    ) -> Result<Self> {
        let label = config.key_label()?;
        let pin = config
            .user_pin
            .clone()
            .ok_or_else(|| HsmTlsError::configuration("HSM_USER_PIN must be set"))?;
        let policy = config.tls_policy()?;

        let slot = module.select_slot(&config.slot_selection())?;
        let session = Arc::new(module.open_rw_session(slot)?);
        session.login(pin)?;

        let key = if config.strict_key_lookup {
            locator::find_private_key_strict(&session, label)?
        } else {
            locator::find_private_key(&session, label)?
        };

        let leaf = chain
            .first()
            .ok_or_else(|| HsmTlsError::certificate("Certificate chain is empty"))?;
        let (signer, proven) = match HsmSigner::new(Arc::clone(&session), key.clone()) {
            Ok(signer) => (signer, false),
            Err(e) if e.kind() == ErrorKind::KeyNotFound => {
                debug!("No public key object for '{}', using the certificate key", label);
                (HsmSigner::from_certificate(Arc::clone(&session), key, leaf)?, true)
            }
            Err(e) => return Err(e),
        };
        let signer = Arc::new(signer);

        let options = AssemblyOptions {
            prove_possession: !proven,
        };
        let credential =
            Credential::assemble_with(chain, Arc::clone(&signer) as Arc<dyn KeySigner>, options)?;

        info!(
            "HSM identity ready: module '{}', slot {}, key '{}'",
            module.name(),
            slot,
            label
        );
        Ok(Self {
            session,
            signer,
            credential,
            policy,
        })
    }

    /// The assembled credential
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// The HSM session
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// The TLS policy from the configuration
    pub fn policy(&self) -> &TlsPolicy {
        &self.policy
    }

    /// Signature counters of the HSM key
    pub fn signer_stats(&self) -> SignerStats {
        self.signer.stats()
    }

    /// Client configuration presenting the credential under the configured policy
    ///
    /// # Errors
    ///
    /// As [`Credential::attach`].
    pub fn client_config(&self) -> Result<rustls::ClientConfig> {
        self.credential.attach(&self.policy)
    }

    /// Log out and close the session now instead of on drop
    pub fn close(&self) {
        self.session.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::soft::{SoftCall, SoftKeyPair, SoftModule, SoftToken};
    use crate::session::SessionState;
    use pretty_assertions::assert_eq;
    use secrecy::SecretString;

    fn config(label: &str, pin: &str) -> HsmTlsConfig {
        HsmTlsConfig::builder()
            .user_pin(SecretString::new(pin.to_string()))
            .key_label(label)
            .build()
            .unwrap()
    }

    fn chain_for(key_pair: &SoftKeyPair) -> Vec<CertificateDer<'static>> {
        let key = rcgen::KeyPair::from_pem(&key_pair.to_pkcs8_pem().unwrap()).unwrap();
        let cert = rcgen::CertificateParams::new(vec!["client.test".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        vec![cert.der().clone()]
    }

    #[test]
    fn test_open_with_public_key_object() {
        let key_pair = SoftKeyPair::generate_p256();
        let chain = chain_for(&key_pair);
        let soft = SoftModule::new()
            .with_token(SoftToken::new("t", "1234").with_key_pair("client", key_pair.clone()));
        let module = HsmModule::with_backend("soft", soft.clone());

        let identity =
            HsmIdentity::open_with_module(&module, &config("client", "1234"), chain).unwrap();
        assert_eq!(
            identity.credential().public_key(),
            &key_pair.public_key().unwrap()
        );
        assert_eq!(identity.signer_stats().signatures, 1);
        assert!(identity.client_config().is_ok());

        identity.close();
        assert_eq!(identity.session().state(), SessionState::Closed);
        assert_eq!(soft.count(SoftCall::Logout), 1);
    }

    #[test]
    fn test_open_falls_back_to_certificate_key() {
        let key_pair = SoftKeyPair::generate_p256();
        let chain = chain_for(&key_pair);
        let module = HsmModule::with_backend(
            "soft",
            SoftModule::new()
                .with_token(SoftToken::new("t", "1234").with_private_key("client", key_pair)),
        );

        let identity =
            HsmIdentity::open_with_module(&module, &config("client", "1234"), chain).unwrap();
        // One signature for the proof of possession, none repeated by assembly
        assert_eq!(identity.signer_stats().signatures, 1);
    }

    #[test]
    fn test_open_rejects_foreign_certificate() {
        let chain = chain_for(&SoftKeyPair::generate_p256());
        let soft = SoftModule::new().with_token(
            SoftToken::new("t", "1234").with_private_key("client", SoftKeyPair::generate_p256()),
        );
        let module = HsmModule::with_backend("soft", soft.clone());

        let err =
            HsmIdentity::open_with_module(&module, &config("client", "1234"), chain).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KeyMismatch);
        assert_eq!(soft.open_sessions(), 0);
    }

    #[test]
    fn test_wrong_pin_stops_before_search() {
        let key_pair = SoftKeyPair::generate_p256();
        let chain = chain_for(&key_pair);
        let soft = SoftModule::new()
            .with_token(SoftToken::new("t", "1234").with_key_pair("client", key_pair));
        let module = HsmModule::with_backend("soft", soft.clone());

        let err =
            HsmIdentity::open_with_module(&module, &config("client", "0000"), chain).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
        assert_eq!(soft.count(SoftCall::FindObjectsInit), 0);
        assert_eq!(soft.count(SoftCall::SignInit), 0);
        assert_eq!(soft.count(SoftCall::Logout), 0);
        assert_eq!(soft.open_sessions(), 0);
    }
}
