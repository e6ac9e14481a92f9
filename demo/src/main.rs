//! hsm-tls demo - one HTTPS GET authenticated by an HSM-resident client key
//!
//! Reads `HSM_*` variables (or a config file), opens the HSM, assembles the
//! client credential and prints the response body. With `--soft-token` the
//! HSM is replaced by the in-memory token holding a PKCS#8 key from disk.

use anyhow::{Context, Result};
use clap::Parser;
use hsm_tls::backend::soft::{SoftKeyPair, SoftModule, SoftToken};
use hsm_tls::{HsmIdentity, HsmModule, HsmTlsConfig};
use secrecy::ExposeSecret;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_URL: &str = "https://honorato.org/hsm";

/// Fetch a URL over mutual TLS with a key that never leaves the HSM
#[derive(Parser, Debug)]
#[command(name = "hsm-tls-demo", version, about)]
struct Cli {
    /// URL to fetch
    #[arg(env = "HSM_DEMO_URL", default_value = DEFAULT_URL)]
    url: String,

    /// TOML, YAML or JSON configuration; `HSM_*` variables still override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use a software token holding this PKCS#8 PEM key instead of a PKCS#11 module
    #[arg(long, value_name = "KEY_PEM")]
    soft_token: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

/// Open the identity on a software token built from `key_path`
fn open_soft(config: &HsmTlsConfig, key_path: &Path) -> Result<HsmIdentity> {
    let pem = std::fs::read_to_string(key_path)
        .with_context(|| format!("reading soft-token key {}", key_path.display()))?;
    let key_pair = SoftKeyPair::from_pkcs8_pem(&pem)?;

    let pin = config
        .user_pin
        .as_ref()
        .context("HSM_USER_PIN must be set")?;
    let token_label = config.token_label.clone().unwrap_or_else(|| "soft".into());
    let token = SoftToken::new(token_label, pin.expose_secret().as_str())
        .with_key_pair(config.key_label()?, key_pair);
    let module = HsmModule::with_backend("soft-token", SoftModule::new().with_token(token));

    let chain = hsm_tls::certificate::load_pem_chain(&config.certificate_path)?;
    Ok(HsmIdentity::open_with_module(&module, config, chain)?)
}

async fn open_identity(cli: &Cli) -> Result<HsmIdentity> {
    let config = match &cli.config {
        Some(path) => HsmTlsConfig::from_file(path)?,
        None => HsmTlsConfig::from_env()?,
    };

    match cli.soft_token.clone() {
        Some(key_path) => tokio::task::spawn_blocking(move || open_soft(&config, &key_path))
            .await
            .context("soft-token bootstrap task failed")?,
        None => Ok(HsmIdentity::open_async(config).await?),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let identity = open_identity(&cli).await?;
    let tls = identity.client_config()?;

    let client = reqwest::Client::builder()
        .use_preconfigured_tls(tls)
        .build()
        .context("building HTTPS client")?;

    info!("GET {}", cli.url);
    let response = client
        .get(&cli.url)
        .send()
        .await
        .with_context(|| format!("requesting {}", cli.url))?;
    info!("HTTP {}", response.status());
    let body = response.text().await.context("reading response body")?;

    println!("Response:\n{}", body);

    let stats = identity.signer_stats();
    info!(
        "{} HSM signatures, {:?} average latency",
        stats.signatures,
        stats.average_latency()
    );
    identity.close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_url() {
        let cli = Cli::try_parse_from(["hsm-tls-demo"]).unwrap();
        if std::env::var("HSM_DEMO_URL").is_err() {
            assert_eq!(cli.url, DEFAULT_URL);
        }
        assert!(cli.soft_token.is_none());
    }

    #[test]
    fn test_soft_token_flag() {
        let cli = Cli::try_parse_from([
            "hsm-tls-demo",
            "--soft-token",
            "key.pem",
            "--json-logs",
            "https://localhost:8443/",
        ])
        .unwrap();
        assert_eq!(cli.soft_token, Some(PathBuf::from("key.pem")));
        assert_eq!(cli.url, "https://localhost:8443/");
        assert!(cli.json_logs);
    }
}
