//! Actuator configuration
//!
//! Every field has a default, so an empty document is a valid config. Files
//! are YAML with camelCase keys:
//!
//! ```yaml
//! apiServer:
//!   commonName: kube-apiserver
//! tokenTtlSecs: 600
//! operationPoll:
//!   maxAttempts: 120
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryConfig;
use crate::{Error, Result};

/// Identity the control-plane API server certificate is issued for
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiServerCertConfig {
    /// Certificate subject common name
    pub common_name: String,
    /// In-cluster service name of the API server
    pub service_name: String,
    /// Namespace of that service
    pub service_namespace: String,
}

impl Default for ApiServerCertConfig {
    fn default() -> Self {
        Self {
            common_name: "kube-apiserver".to_string(),
            service_name: "kubernetes".to_string(),
            service_namespace: "default".to_string(),
        }
    }
}

/// Backoff used while waiting for zone operations
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct OperationPollConfig {
    /// Polls before giving up (0 = unbounded)
    pub max_attempts: u32,
    /// First delay in milliseconds
    pub initial_delay_ms: u64,
    /// Delay ceiling in milliseconds
    pub max_delay_ms: u64,
    /// Growth factor per poll
    pub backoff_multiplier: f64,
}

impl Default for OperationPollConfig {
    fn default() -> Self {
        let retry = RetryConfig::default();
        Self {
            max_attempts: retry.max_attempts,
            initial_delay_ms: retry.initial_delay.as_millis() as u64,
            max_delay_ms: retry.max_delay.as_millis() as u64,
            backoff_multiplier: retry.backoff_multiplier,
        }
    }
}

/// Settings shared by every reconcile pass
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ActuatorConfig {
    /// API server certificate identity
    pub api_server: ApiServerCertConfig,
    /// DNS domain used when a cluster does not set one
    pub default_dns_domain: String,
    /// Namespace bootstrap token Secrets are written to
    pub token_namespace: String,
    /// Lifetime of worker join tokens in seconds
    pub token_ttl_secs: u64,
    /// Network name written to cloud-config and instance interfaces
    pub network: String,
    /// Subnetwork name written to cloud-config
    pub subnetwork: String,
    /// Boot disks smaller than this are grown to it
    pub min_boot_disk_size_gb: i64,
    /// Zone operation polling
    pub operation_poll: OperationPollConfig,
    /// Directory holding `ca.crt` and `ca.key`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_dir: Option<PathBuf>,
    /// Machine setup configs YAML file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_setup_configs: Option<PathBuf>,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            api_server: ApiServerCertConfig::default(),
            default_dns_domain: "cluster.local".to_string(),
            token_namespace: "kube-system".to_string(),
            token_ttl_secs: 600,
            network: "default".to_string(),
            subnetwork: "kubernetes".to_string(),
            min_boot_disk_size_gb: 30,
            operation_poll: OperationPollConfig::default(),
            ca_dir: None,
            machine_setup_configs: None,
        }
    }
}

impl ActuatorConfig {
    /// Parse a config from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::serialization(format!("invalid actuator config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            Error::serialization(format!("unable to read {}: {e}", path.display()))
        })?;
        Self::from_yaml(&yaml)
    }

    /// Reject values the actuator cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.token_ttl_secs == 0 {
            return Err(Error::validation("tokenTtlSecs must be greater than 0"));
        }
        if self.min_boot_disk_size_gb <= 0 {
            return Err(Error::validation("minBootDiskSizeGb must be positive"));
        }
        if self.operation_poll.backoff_multiplier < 1.0 {
            return Err(Error::validation(
                "operationPoll.backoffMultiplier must be at least 1.0",
            ));
        }
        Ok(())
    }

    /// Join token lifetime
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    /// Backoff schedule for zone operation polling
    pub fn operation_retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.operation_poll.max_attempts,
            initial_delay: Duration::from_millis(self.operation_poll.initial_delay_ms),
            max_delay: Duration::from_millis(self.operation_poll.max_delay_ms),
            backoff_multiplier: self.operation_poll.backoff_multiplier,
        }
    }
}
