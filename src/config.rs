//! Connector Configuration
//!
//! Tunables shared by the Fibre Channel and iSCSI connectors. Defaults match
//! a stock open-iscsi installation; a YAML file can override any field.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the connectors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Initiator-control executable
    pub iscsiadm_path: String,
    /// iface used when a target does not name one
    pub default_iface: String,
    /// Attempts to find the device node after a login
    pub login_wait_retries: u32,
    /// Attempts to find the device node when a session already exists
    pub session_wait_retries: u32,
    /// Pause between attempts (milliseconds)
    pub poll_interval_ms: u64,
    /// File holding this node's `InitiatorName=`
    pub initiator_name_file: PathBuf,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            iscsiadm_path: "iscsiadm".to_string(),
            default_iface: "default".to_string(),
            login_wait_retries: 10,
            session_wait_retries: 1,
            poll_interval_ms: 1000,
            initiator_name_file: PathBuf::from("/etc/iscsi/initiatorname.iscsi"),
        }
    }
}

impl ConnectorConfig {
    /// Parse a YAML document; missing fields keep their defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML config file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.iscsiadm_path.trim().is_empty() {
            return Err(Error::Configuration("iscsiadm_path must not be empty".into()));
        }
        if self.login_wait_retries == 0 {
            return Err(Error::Configuration(
                "login_wait_retries must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
