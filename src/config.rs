//! Configuration module for Wardex.
//!
//! Loads runtime settings from YAML files and environment variables. The
//! `SecurityPolicy` itself is constructed programmatically (see
//! [`crate::domain::SecurityPolicy`]); this covers process-level concerns:
//! where the signer listens, how the value assessor prices assets, and
//! timeout knobs.

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub signer: SignerSettings,
    #[serde(default)]
    pub valuation: ValuationSettings,
}

/// Isolated signer process settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SignerSettings {
    /// Path of the Unix stream socket the signer listens on.
    pub socket_path: String,
    /// Path of the encrypted key file on disk.
    pub key_file: String,
    /// Client connect/request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for SignerSettings {
    fn default() -> Self {
        Self {
            socket_path: "/tmp/wardex-signer.sock".to_string(),
            key_file: "wardex-key.json".to_string(),
            timeout_secs: 10,
        }
    }
}

/// Value assessment settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ValuationSettings {
    /// USD price assumed for the native asset.
    pub native_price_usd: f64,
    /// Floor applied to the estimated USD at risk of an unlimited approval.
    pub infinite_value_floor_usd: f64,
}

impl Default for ValuationSettings {
    fn default() -> Self {
        Self {
            native_price_usd: 3000.0,
            infinite_value_floor_usd: 100_000.0,
        }
    }
}

impl Config {
    /// Load configuration from files and environment.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (WARDEX__*)
    /// 2. config/local.yaml (if exists)
    /// 3. config/default.yaml
    pub fn load() -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("WARDEX")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signer: SignerSettings::default(),
            valuation: ValuationSettings::default(),
        }
    }
}
