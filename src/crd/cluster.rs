//! Cluster record
//!
//! The actuator only reads Clusters: network ranges and the DNS domain feed
//! the boot scripts, and the first API endpoint is where workers join.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ProviderSpec;

/// Desired state of a cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.k8s.io",
    version = "v1alpha1",
    kind = "Cluster",
    plural = "clusters",
    status = "ClusterStatus",
    namespaced,
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Pod and service networking
    #[serde(default)]
    pub cluster_network: ClusterNetworkingConfig,

    /// GCE cluster provider spec, decoded with [`super::GceClusterProviderSpec::from_cluster`]
    #[serde(default)]
    pub provider_spec: ProviderSpec,
}

/// Cluster-wide network configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNetworkingConfig {
    /// Service virtual IP ranges
    #[serde(default)]
    pub services: NetworkRanges,

    /// Pod IP ranges
    #[serde(default)]
    pub pods: NetworkRanges,

    /// DNS domain for services, e.g. `cluster.local`
    #[serde(default)]
    pub service_domain: String,
}

/// A list of CIDR blocks
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRanges {
    /// CIDR blocks in priority order
    #[serde(default)]
    pub cidr_blocks: Vec<String>,
}

impl NetworkRanges {
    /// First CIDR block, or an empty string when none is configured
    pub fn first_or_empty(&self) -> &str {
        self.cidr_blocks.first().map(String::as_str).unwrap_or("")
    }
}

/// Observed state of a cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// API server endpoints, first entry is used for joining
    #[serde(default, rename = "apiEndpoints")]
    pub api_endpoints: Vec<ApiEndpoint>,

    /// Human-readable message for a terminal failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// An API server endpoint
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ApiEndpoint {
    /// Hostname or IP
    pub host: String,
    /// TCP port
    pub port: i32,
}

impl std::fmt::Display for ApiEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl Cluster {
    /// `namespace/name` identity used in logs and errors
    pub fn identity(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or_default(),
            self.metadata.name.as_deref().unwrap_or_default()
        )
    }

    /// API endpoints from status, empty when status is unset
    pub fn api_endpoints(&self) -> &[ApiEndpoint] {
        self.status
            .as_ref()
            .map(|s| s.api_endpoints.as_slice())
            .unwrap_or_default()
    }
}
