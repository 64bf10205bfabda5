//! Client and in-memory transport configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field holds a value outside its allowed range.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// Field name.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// The configuration text could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// RPC client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Timeout applied to calls whose options carry no deadline (default: none).
    pub default_timeout_ms: Option<u64>,
    /// Capacity of the queue between the caller and the send task (default: 16).
    pub send_buffer: usize,
    /// Capacity of the queue between the receive task and the caller (default: 64).
    pub recv_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: None,
            send_buffer: 16,
            recv_buffer: 64,
        }
    }
}

impl ClientConfig {
    /// Parses and validates a JSON configuration.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.send_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                field: "send_buffer",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.recv_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                field: "recv_buffer",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.default_timeout_ms == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "default_timeout_ms",
                reason: "must be positive when set".to_string(),
            });
        }
        Ok(())
    }

    /// The default call timeout as a duration.
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }
}

/// In-memory transport configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemTransportConfig {
    /// Messages buffered per direction before writers suspend (default: 32).
    pub channel_capacity: usize,
}

impl Default for MemTransportConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 32,
        }
    }
}

impl MemTransportConfig {
    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "channel_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.default_timeout_ms, None);
        assert_eq!(config.send_buffer, 16);
        assert_eq!(config.recv_buffer, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_client_config_from_json_partial() {
        let config = ClientConfig::from_json_str(r#"{"default_timeout_ms": 250}"#).unwrap();
        assert_eq!(config.default_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.recv_buffer, 64);
    }

    #[test]
    fn test_client_config_rejects_zero_buffer() {
        let err = ClientConfig::from_json_str(r#"{"send_buffer": 0}"#).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                field: "send_buffer",
                ..
            }
        ));
    }

    #[test]
    fn test_client_config_rejects_garbage() {
        let err = ClientConfig::from_json_str("not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_mem_config_validate() {
        assert!(MemTransportConfig::default().validate().is_ok());
        let config = MemTransportConfig {
            channel_capacity: 0,
        };
        assert!(config.validate().is_err());
    }
}
