//! Configuration
//!
//! [`HsmTlsConfig`] is loaded from `HSM_*` environment variables, from a
//! TOML/YAML/JSON file (with the same variables overriding it), or built in
//! code with [`HsmTlsConfigBuilder`].
//!
//! | Variable                | Field               | Default                                   |
//! |-------------------------|---------------------|-------------------------------------------|
//! | `HSM_MODULE_PATH`       | `module_path`       | `/opt/cloudhsm/lib/libcloudhsm_pkcs11.so` |
//! | `HSM_USER_PIN`          | `user_pin`          | required                                  |
//! | `HSM_KEY_LABEL`         | `key_label`         | required                                  |
//! | `HSM_TOKEN_LABEL`       | `token_label`       | first slot with a token                   |
//! | `HSM_MIN_TLS_VERSION`   | `min_tls_version`   | `1.2`                                     |
//! | `HSM_VERIFY_PEER`       | `verify_peer`       | `true`                                    |
//! | `HSM_CERTIFICATE_PATH`  | `certificate_path`  | `client_cert.pem`                         |
//! | `HSM_CA_FILE`           | `ca_file`           | none                                      |
//! | `HSM_STRICT_KEY_LOOKUP` | `strict_key_lookup` | `false`                                   |

use crate::certificate;
use crate::credential::{PeerVerification, TlsPolicy, TlsVersion};
use crate::session::SlotSelection;
use crate::{HsmTlsError, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "HSM";

/// Module loaded when none is configured
pub const DEFAULT_MODULE_PATH: &str = "/opt/cloudhsm/lib/libcloudhsm_pkcs11.so";

/// Certificate read when none is configured
pub const DEFAULT_CERTIFICATE_PATH: &str = "client_cert.pem";

/// Everything needed to open the HSM and present its key over TLS
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HsmTlsConfig {
    /// PKCS#11 module to load
    pub module_path: PathBuf,
    /// User PIN; never logged
    #[serde(deserialize_with = "deserialize_pin")]
    pub user_pin: Option<SecretString>,
    /// Label of the private key
    pub key_label: Option<String>,
    /// Token to use; the first slot with a token when unset
    pub token_label: Option<String>,
    /// Lowest TLS version to negotiate
    pub min_tls_version: TlsVersion,
    /// Verify the server certificate
    pub verify_peer: bool,
    /// PEM file with the client certificate chain, leaf first
    pub certificate_path: PathBuf,
    /// PEM file with extra trust anchors
    pub ca_file: Option<PathBuf>,
    /// Fail when the key label matches more than one private key
    pub strict_key_lookup: bool,
}

impl Default for HsmTlsConfig {
    fn default() -> Self {
        Self {
            module_path: PathBuf::from(DEFAULT_MODULE_PATH),
            user_pin: None,
            key_label: None,
            token_label: None,
            min_tls_version: TlsVersion::default(),
            verify_peer: true,
            certificate_path: PathBuf::from(DEFAULT_CERTIFICATE_PATH),
            ca_file: None,
            strict_key_lookup: false,
        }
    }
}

impl HsmTlsConfig {
    /// Create a configuration builder
    pub fn builder() -> HsmTlsConfigBuilder {
        HsmTlsConfigBuilder::default()
    }

    /// Load from `HSM_*` environment variables
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if a value cannot be parsed or if the PIN or
    /// key label is missing.
    pub fn from_env() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(environment())
            .build()?
            .try_deserialize::<Self>()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML, YAML or JSON file, with `HSM_*` variables overriding it
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file does not exist, `Configuration` for unknown
    /// extensions, unparseable content, or a missing PIN or key label.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        use config::{File, FileFormat};

        let path = path.as_ref();
        if !path.exists() {
            return Err(HsmTlsError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
            });
        }

        let format = match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => FileFormat::Toml,
            Some("yaml") | Some("yml") => FileFormat::Yaml,
            Some("json") => FileFormat::Json,
            _ => {
                return Err(HsmTlsError::configuration(format!(
                    "Unsupported configuration format: {}",
                    path.display()
                )));
            }
        };
        let name = path.to_str().ok_or_else(|| {
            HsmTlsError::configuration(format!("Non UTF-8 path: {}", path.display()))
        })?;

        let config = config::Config::builder()
            .add_source(File::new(name, format))
            .add_source(environment())
            .build()?
            .try_deserialize::<Self>()?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the PIN and key label are present and non-empty
    ///
    /// # Errors
    ///
    /// Returns `Configuration` naming the missing setting.
    pub fn validate(&self) -> Result<()> {
        let pin_missing = self
            .user_pin
            .as_ref()
            .is_none_or(|pin| pin.expose_secret().is_empty());
        let label_missing = self.key_label.as_ref().is_none_or(String::is_empty);

        match (pin_missing, label_missing) {
            (false, false) => Ok(()),
            (true, true) => Err(HsmTlsError::configuration(
                "HSM_USER_PIN and HSM_KEY_LABEL must be set",
            )),
            (true, false) => Err(HsmTlsError::configuration("HSM_USER_PIN must be set")),
            (false, true) => Err(HsmTlsError::configuration("HSM_KEY_LABEL must be set")),
        }
    }

    /// The configured key label
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if it is not set.
    pub fn key_label(&self) -> Result<&str> {
        self.key_label
            .as_deref()
            .filter(|label| !label.is_empty())
            .ok_or_else(|| HsmTlsError::configuration("HSM_KEY_LABEL must be set"))
    }

    /// Slot selection derived from `token_label`
    pub fn slot_selection(&self) -> SlotSelection {
        SlotSelection::from_token_label(self.token_label.as_deref())
    }

    /// TLS policy derived from the version floor, peer verification and CA file
    ///
    /// # Errors
    ///
    /// Returns `Io` or `CertificateParseFailed` if the CA file cannot be read.
    pub fn tls_policy(&self) -> Result<TlsPolicy> {
        let verification = if self.verify_peer {
            PeerVerification::Strict
        } else {
            PeerVerification::DangerousAcceptAnyCertificate
        };
        let mut policy = TlsPolicy::default()
            .with_min_version(self.min_tls_version)
            .with_peer_verification(verification);
        if let Some(ca_file) = &self.ca_file {
            for root in certificate::load_pem_chain(ca_file)? {
                policy = policy.with_root(root);
            }
        }
        Ok(policy)
    }
}

// Deserialize straight into a secret so the PIN never sits in a plain field
fn deserialize_pin<'de, D>(deserializer: D) -> std::result::Result<Option<SecretString>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let pin: Option<String> = Deserialize::deserialize(deserializer)?;
    Ok(pin.map(SecretString::new))
}

fn environment() -> config::Environment {
    // No type guessing: PINs such as "0012" must stay strings
    // `HSM_USER_PIN` -> `user_pin`; without its own prefix separator the
    // prefix would only match `HSM__`
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(false)
}

/// Builder for [`HsmTlsConfig`]
#[derive(Debug, Default)]
pub struct HsmTlsConfigBuilder {
    config: HsmTlsConfig,
}

impl HsmTlsConfigBuilder {
    /// Set the module path
    pub fn module_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.module_path = path.into();
        self
    }

    /// Set the user PIN
    pub fn user_pin(mut self, pin: SecretString) -> Self {
        self.config.user_pin = Some(pin);
        self
    }

    /// Set the key label
    pub fn key_label(mut self, label: impl Into<String>) -> Self {
        self.config.key_label = Some(label.into());
        self
    }

    /// Pin slot selection to a token label
    pub fn token_label(mut self, label: impl Into<String>) -> Self {
        self.config.token_label = Some(label.into());
        self
    }

    /// Set the TLS version floor
    pub fn min_tls_version(mut self, version: TlsVersion) -> Self {
        self.config.min_tls_version = version;
        self
    }

    /// Enable or disable server certificate verification
    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.config.verify_peer = verify;
        self
    }

    /// Set the client certificate chain file
    pub fn certificate_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.certificate_path = path.into();
        self
    }

    /// Set the extra trust anchor file
    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ca_file = Some(path.into());
        self
    }

    /// Refuse key labels matching more than one private key
    pub fn strict_key_lookup(mut self, strict: bool) -> Self {
        self.config.strict_key_lookup = strict;
        self
    }

    /// Validate and build
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the PIN or key label is missing.
    pub fn build(self) -> Result<HsmTlsConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
