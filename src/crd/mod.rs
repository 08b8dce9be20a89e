//! Resource definitions consumed by the actuator
//!
//! `Machine` and `Cluster` are the `cluster.k8s.io/v1alpha1` records the
//! actuator reconciles. The GCE provider specs travel opaquely inside their
//! `providerSpec.value` fields and are decoded on demand.

mod cluster;
mod machine;
mod provider_spec;

pub use cluster::{
    ApiEndpoint, Cluster, ClusterNetworkingConfig, ClusterSpec, ClusterStatus, NetworkRanges,
};
pub use machine::{Machine, MachineAddress, MachineSpec, MachineStatus, MachineVersionInfo};
pub use provider_spec::{
    is_master, Disk, DiskInitializeParams, GceClusterProviderSpec, GceMachineProviderSpec,
    MachineRole,
};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Opaque, provider-specific configuration embedded in a record
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSpec {
    /// Inline provider configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}
