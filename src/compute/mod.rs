//! Compute provider boundary
//!
//! The actuator talks to the compute API only through [`ComputeService`].
//! The resource types mirror the subset of the compute v1 REST shapes the
//! actuator reads or writes, with the same JSON field names.

use std::collections::BTreeMap;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{Error, Result};

/// Operation status reported once an operation has finished
pub const OPERATION_DONE: &str = "DONE";

/// Errors returned by a compute provider client
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ComputeError {
    /// The API answered with an error status
    #[error("googleapi: Error {code}: {message}")]
    Api {
        /// HTTP status code
        code: u16,
        /// Provider message
        message: String,
    },

    /// The request did not reach the API or the response was unreadable
    #[error("transport error: {0}")]
    Transport(String),
}

/// A compute instance
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    /// Instance name, equal to the Machine name
    pub name: String,
    /// Partial URL of the machine type
    pub machine_type: String,
    /// Allow forwarding of packets not addressed to the instance
    #[serde(default)]
    pub can_ip_forward: bool,
    /// Network attachments
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
    /// Disks in attach order
    #[serde(default)]
    pub disks: Vec<AttachedDisk>,
    /// Key/value metadata visible to the guest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    /// Network tags
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Tags>,
    /// Resource labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Service accounts available to the guest
    #[serde(default)]
    pub service_accounts: Vec<ServiceAccount>,
    /// Lifecycle status, set by the provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Full resource URL, set by the provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_link: Option<String>,
}

impl Instance {
    /// Metadata value for `key`, if present
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .as_ref()?
            .items
            .iter()
            .find(|item| item.key == key)
            .and_then(|item| item.value.as_deref())
    }
}

/// A network attachment
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    /// Partial URL of the network
    pub network: String,
    /// External access configs
    #[serde(default)]
    pub access_configs: Vec<AccessConfig>,
    /// Internal IP, set by the provider
    #[serde(default, rename = "networkIP", skip_serializing_if = "Option::is_none")]
    pub network_ip: Option<String>,
}

/// External NAT configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccessConfig {
    /// Access config name
    pub name: String,
    /// Access config type, `ONE_TO_ONE_NAT`
    #[serde(rename = "type")]
    pub type_: String,
    /// Static external IP; ephemeral when unset
    #[serde(default, rename = "natIP", skip_serializing_if = "Option::is_none")]
    pub nat_ip: Option<String>,
}

/// A disk attached at creation time
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttachedDisk {
    /// Delete the disk with the instance
    pub auto_delete: bool,
    /// Boot from this disk
    pub boot: bool,
    /// Parameters for creating the disk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initialize_params: Option<AttachedDiskInitializeParams>,
}

/// Creation parameters of an attached disk
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttachedDiskInitializeParams {
    /// Size in GB
    pub disk_size_gb: i64,
    /// Partial URL of the disk type
    pub disk_type: String,
    /// Image to initialise the disk from; empty for data disks
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_image: String,
}

/// Instance metadata
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Metadata {
    /// Entries, one per key
    #[serde(default)]
    pub items: Vec<MetadataItems>,
}

/// A single instance metadata entry
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct MetadataItems {
    /// Metadata key
    pub key: String,
    /// Metadata value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Network tags
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Tags {
    /// Tag values
    #[serde(default)]
    pub items: Vec<String>,
}

/// Service account attached to an instance
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ServiceAccount {
    /// Account email, `default` for the project's compute account
    pub email: String,
    /// OAuth scopes
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// A long-running zone operation
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Operation name
    pub name: String,
    /// `PENDING`, `RUNNING` or `DONE`
    pub status: String,
    /// insert, delete, ...
    #[serde(default)]
    pub operation_type: String,
    /// URL of the resource the operation acts on
    #[serde(default)]
    pub target_link: String,
    /// Errors, present once a failed operation is DONE
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
}

/// Errors attached to a finished operation
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct OperationError {
    /// Individual errors
    #[serde(default)]
    pub errors: Vec<OperationErrorItem>,
}

/// A single operation error
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct OperationErrorItem {
    /// Error code, e.g. `QUOTA_EXCEEDED`
    pub code: String,
    /// Provider message
    pub message: String,
}

impl Operation {
    /// Returns true once the operation has finished
    pub fn is_done(&self) -> bool {
        self.status == OPERATION_DONE
    }

    /// Provider messages of a failed operation joined into one string
    pub fn error_message(&self) -> Option<String> {
        let errors = &self.error.as_ref()?.errors;
        if errors.is_empty() {
            return None;
        }
        Some(
            errors
                .iter()
                .map(|e| format!("{}: {}", e.code, e.message))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// Narrow view of the compute instances API
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ComputeService: Send + Sync {
    /// Start creating an instance
    async fn instances_insert(
        &self,
        project: &str,
        zone: &str,
        instance: &Instance,
    ) -> std::result::Result<Operation, ComputeError>;

    /// Fetch an instance, returning `None` when it does not exist
    async fn instances_get(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> std::result::Result<Option<Instance>, ComputeError>;

    /// Start deleting an instance
    async fn instances_delete(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> std::result::Result<Operation, ComputeError>;

    /// Fetch the current state of a zone operation
    async fn zone_operations_get(
        &self,
        project: &str,
        zone: &str,
        operation: &str,
    ) -> std::result::Result<Operation, ComputeError>;
}

/// Poll `operation` until it is DONE, then surface any operation errors
///
/// A still-running operation after the last attempt is
/// [`Error::OperationPending`]; a finished operation carrying errors is
/// [`Error::Provisioning`] with the provider messages.
#[instrument(skip(compute, operation, retry), fields(operation = %operation.name))]
pub async fn wait_for_operation(
    compute: &dyn ComputeService,
    project: &str,
    zone: &str,
    operation: Operation,
    machine: &str,
    retry: &RetryConfig,
) -> Result<Operation> {
    let finished = if operation.is_done() {
        operation
    } else {
        let name = operation.name.as_str();
        retry_with_backoff(
            retry,
            "zone_operations_get",
            || async move {
                let op = compute
                    .zone_operations_get(project, zone, name)
                    .await
                    .map_err(|e| Error::provisioning(machine, "zoneOperations.get", e))?;
                if op.is_done() {
                    Ok(op)
                } else {
                    Err(Error::OperationPending {
                        name: op.name,
                        status: op.status,
                    })
                }
            },
            |e| e.is_retryable(),
        )
        .await?
    };

    if let Some(message) = finished.error_message() {
        return Err(Error::provisioning(
            machine,
            finished.operation_type.clone(),
            message,
        ));
    }
    debug!(target_link = %finished.target_link, "operation finished");
    Ok(finished)
}
