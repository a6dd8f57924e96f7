//! Configuration
//!
//! Loaded from TOML; every field has a default, so an empty file (or no
//! file at all) yields a working configuration.
//!
//! ```toml
//! key_alias = "presencegate.payment_auth_key"
//! purpose_tag = "IRIS_AUTH"
//! allowed_authenticators = "biometric_strong_or_device_credential"
//!
//! [prompt]
//! title = "Iris Authentication"
//! negative_button = "Cancel"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::challenge::FIELD_DELIMITER;

/// Alias of the presence-bound signing key
pub const DEFAULT_KEY_ALIAS: &str = "presencegate.payment_auth_key";

/// Purpose tag for payment authentication
pub const DEFAULT_PURPOSE_TAG: &str = "IRIS_AUTH";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Presence credential classes the prompt may accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Authenticators {
    /// Class 3 biometrics only.
    BiometricStrong,
    /// Class 3 biometrics, falling back to PIN, pattern or password.
    #[default]
    BiometricStrongOrDeviceCredential,
}

/// Text shown by the presence prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptText {
    pub title: String,
    pub subtitle: String,
    pub description: String,
    pub negative_button: String,
}

impl Default for PromptText {
    fn default() -> Self {
        Self {
            title: "Iris Authentication".into(),
            subtitle: "Authenticate with your iris to proceed with payment".into(),
            description: "Look at the camera to verify your identity".into(),
            negative_button: "Cancel".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub key_alias: String,
    /// Purpose tag used when the caller does not supply one.
    pub purpose_tag: String,
    pub allowed_authenticators: Authenticators,
    pub prompt: PromptText,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            key_alias: DEFAULT_KEY_ALIAS.into(),
            purpose_tag: DEFAULT_PURPOSE_TAG.into(),
            allowed_authenticators: Authenticators::default(),
            prompt: PromptText::default(),
        }
    }
}

impl AuthConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key_alias.trim().is_empty() {
            return Err(ConfigError::Invalid("key_alias is empty".into()));
        }
        if self.purpose_tag.is_empty() {
            return Err(ConfigError::Invalid("purpose_tag is empty".into()));
        }
        if self.purpose_tag.contains(FIELD_DELIMITER) {
            return Err(ConfigError::Invalid(format!(
                "purpose_tag may not contain '{FIELD_DELIMITER}'"
            )));
        }
        Ok(())
    }
}
