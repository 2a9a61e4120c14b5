//! Configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides.
//!
//! ## Loading Priority
//!
//! Configuration sources are merged in the following order (later sources override earlier ones):
//!
//! 1. **Defaults** - every field has one, so a missing file is a valid (Stripe-only) configuration
//! 2. **YAML config file** - path supplied by the embedding application
//! 3. **Environment variables** - variables prefixed with `PAYDESK_` override YAML values
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `PAYDESK_BACKEND__REQUEST_TIMEOUT=10s` sets `backend.request_timeout`.
//!
//! ## Example
//!
//! ```yaml
//! default_provider: stripe
//! backend:
//!   base_url: https://dashboard.example.com/api/
//!   request_timeout: 30s
//! square:
//!   application_id: sq0idp-xxxxxxxx
//!   location_id: L8XXXXXXXX
//!   script_load_timeout: 10s
//! fees:
//!   square:
//!     card: { type: flat, rate: "0.029", fixed: "0.30" }
//! ```

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::fees::FeeSchedule;
use crate::payment_providers::square::DEFAULT_SCRIPT_LOAD_TIMEOUT;
use crate::types::ProviderId;

/// Upper bound for the script load timeout; past this the operator is better off seeing an error
const MAX_SCRIPT_LOAD_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config validation: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Listed first when the operator has to choose between processors
    pub default_provider: ProviderId,
    pub backend: BackendConfig,
    /// Invoicing service; defaults to the backend base URL
    pub invoice_api_url: Option<Url>,
    /// Square is only offered when this section is present
    pub square: Option<SquareConfig>,
    pub fees: FeeSchedule,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_provider: ProviderId::Stripe,
            backend: BackendConfig::default(),
            invoice_api_url: None,
            square: None,
            fees: FeeSchedule::default(),
        }
    }
}

/// Dashboard backend that brokers processor calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    pub base_url: Url,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse("http://localhost:3001/api/").expect("default backend URL is valid"),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SquareConfig {
    #[serde(default = "SquareConfig::default_script_url")]
    pub script_url: Url,
    pub application_id: String,
    pub location_id: String,
    #[serde(default = "SquareConfig::default_script_load_timeout", with = "humantime_serde")]
    pub script_load_timeout: Duration,
}

impl SquareConfig {
    fn default_script_url() -> Url {
        Url::parse("https://web.squarecdn.com/v1/square.js").expect("default Square script URL is valid")
    }

    fn default_script_load_timeout() -> Duration {
        DEFAULT_SCRIPT_LOAD_TIMEOUT
    }

    /// Sandbox application ids need the sandbox script.
    pub fn is_sandbox(&self) -> bool {
        self.application_id.starts_with("sandbox-")
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(path: impl AsRef<Path>) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(path).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn figment(path: impl AsRef<Path>) -> Figment {
        Figment::new()
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("PAYDESK_").split("__"))
    }

    pub fn invoice_api_url(&self) -> &Url {
        self.invoice_api_url.as_ref().unwrap_or(&self.backend.base_url)
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend.request_timeout.is_zero() {
            return Err(ConfigError::Invalid("backend.request_timeout must be greater than zero".to_string()));
        }

        for (name, url) in [("backend.base_url", &self.backend.base_url), ("invoice_api_url", self.invoice_api_url())] {
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ConfigError::Invalid(format!("{name} must be an http(s) URL, got {url}")));
            }
        }

        match &self.square {
            Some(square) => {
                if square.application_id.trim().is_empty() || square.location_id.trim().is_empty() {
                    return Err(ConfigError::Invalid(
                        "square.application_id and square.location_id must not be empty".to_string(),
                    ));
                }
                if square.script_load_timeout.is_zero() || square.script_load_timeout > MAX_SCRIPT_LOAD_TIMEOUT {
                    return Err(ConfigError::Invalid(format!(
                        "square.script_load_timeout must be between 0s and {}s, got {:?}",
                        MAX_SCRIPT_LOAD_TIMEOUT.as_secs(),
                        square.script_load_timeout
                    )));
                }
                if square.is_sandbox() != square.script_url.host_str().is_some_and(|host| host.starts_with("sandbox.")) {
                    tracing::warn!(
                        "Square application {} and script {} look like different environments",
                        square.application_id,
                        square.script_url
                    );
                }
            }
            None if self.default_provider == ProviderId::Square => {
                return Err(ConfigError::Invalid(
                    "default_provider is square but no square section is configured".to_string(),
                ));
            }
            None => {}
        }

        self.fees.validate().map_err(ConfigError::Invalid)
    }
}
