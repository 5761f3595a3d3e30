//! Node configuration, fixed once at `node_init`

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Upper bound on `session_ttl_secs` (30 days)
pub const MAX_SESSION_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// Process-wide configuration of the trusted node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Protocol version mixed into session key derivation
    pub protocol_version: u16,
    /// Maximum number of live sessions
    pub max_sessions: usize,
    /// Session lifetime in seconds
    pub session_ttl_secs: u64,
    /// Maximum request ciphertext size in bytes
    pub max_message_size: usize,
    /// Maximum size of the optional negotiation evidence
    pub max_evidence_size: usize,
    /// Quote layout versions accepted by `commit_quote`
    pub accepted_quote_versions: Vec<u16>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            protocol_version: 1,
            max_sessions: 1 << 16,
            session_ttl_secs: 600,
            max_message_size: 64 * 1024,
            max_evidence_size: 4096,
            accepted_quote_versions: vec![2, 3],
        }
    }
}

impl NodeConfig {
    /// Load a JSON config file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig =
            serde_json::from_str(data).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol_version == 0 {
            return Err(ConfigError::Invalid {
                field: "protocol_version",
                reason: "must be non-zero".into(),
            });
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::Invalid {
                field: "max_sessions",
                reason: "must be non-zero".into(),
            });
        }
        if self.session_ttl_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "session_ttl_secs",
                reason: "must be non-zero".into(),
            });
        }
        if self.session_ttl_secs > MAX_SESSION_TTL_SECS {
            return Err(ConfigError::Invalid {
                field: "session_ttl_secs",
                reason: format!("must be at most {}", MAX_SESSION_TTL_SECS),
            });
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::Invalid {
                field: "max_message_size",
                reason: "must be non-zero".into(),
            });
        }
        if self.accepted_quote_versions.is_empty() {
            return Err(ConfigError::Invalid {
                field: "accepted_quote_versions",
                reason: "at least one quote version is required".into(),
            });
        }
        Ok(())
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}
