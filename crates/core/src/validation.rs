//! Configuration validation support

use config::ConfigError;
use serde::{Deserialize, Serialize};

/// Trait for validating configuration values after deserialization
pub trait ValidateConfig: Serialize + for<'de> Deserialize<'de> {
    /// Returns Ok(()) if valid, or an error describing the first problem found
    fn validate(&self) -> Result<(), ConfigError>;
}

/// Common validation helpers
pub mod validators {
    use config::ConfigError;

    /// Validate that a port number is valid (1-65535)
    pub fn validate_port(port: u16, field: &str) -> Result<(), ConfigError> {
        if port == 0 {
            return Err(ConfigError::Message(format!(
                "{field}: port must be between 1 and 65535"
            )));
        }
        Ok(())
    }

    /// Validate that a string is not empty
    pub fn validate_not_empty(value: &str, field: &str) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::Message(format!("{field}: cannot be empty")));
        }
        Ok(())
    }

    /// Validate URL format, optionally restricting the scheme
    pub fn validate_url(url: &str, schemes: &[&str], field: &str) -> Result<(), ConfigError> {
        let parsed = url::Url::parse(url)
            .map_err(|e| ConfigError::Message(format!("{field}: invalid URL - {e}")))?;
        if !schemes.is_empty() && !schemes.contains(&parsed.scheme()) {
            return Err(ConfigError::Message(format!(
                "{field}: scheme must be one of {schemes:?}"
            )));
        }
        Ok(())
    }

    /// Validate a DNS name: non-empty labels of letters, digits and hyphens
    ///
    /// A single leading `*` label is accepted when `allow_wildcard` is set.
    pub fn validate_dns_name(
        name: &str,
        allow_wildcard: bool,
        field: &str,
    ) -> Result<(), ConfigError> {
        let name = name.strip_suffix('.').unwrap_or(name);
        let invalid = || ConfigError::Message(format!("{field}: invalid DNS name '{name}'"));
        if name.is_empty() || name.len() > 253 {
            return Err(invalid());
        }
        for (i, label) in name.split('.').enumerate() {
            if label == "*" && i == 0 && allow_wildcard {
                continue;
            }
            let valid = !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
            if !valid {
                return Err(invalid());
            }
        }
        Ok(())
    }

    /// Validate that a value is within range
    pub fn validate_range<T: PartialOrd + std::fmt::Display>(
        value: T,
        min: T,
        max: T,
        field: &str,
    ) -> Result<(), ConfigError> {
        if value < min || value > max {
            return Err(ConfigError::Message(format!(
                "{field}: must be between {min} and {max}"
            )));
        }
        Ok(())
    }
}
