//! Machine record
//!
//! A Machine describes one cluster node. The actuator reads its spec and
//! writes only its annotation map.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ProviderSpec;

/// Desired state of a single cluster node
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.k8s.io",
    version = "v1alpha1",
    kind = "Machine",
    plural = "machines",
    status = "MachineStatus",
    namespaced,
    derive = "PartialEq",
    derive = "Default",
    printcolumn = r#"{"name":"ProviderID","type":"string","jsonPath":".spec.providerID"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// GCE machine provider spec, decoded with [`super::GceMachineProviderSpec::from_machine`]
    #[serde(default)]
    pub provider_spec: ProviderSpec,

    /// Software versions the node runs
    #[serde(default)]
    pub versions: MachineVersionInfo,

    /// Provider identifier of the backing instance
    #[serde(
        default,
        rename = "providerID",
        skip_serializing_if = "Option::is_none"
    )]
    pub provider_id: Option<String>,
}

/// Kubelet and control plane versions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineVersionInfo {
    /// Kubelet version, required for every machine
    #[serde(default)]
    pub kubelet: String,

    /// Control plane version, required for masters
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub control_plane: String,
}

/// Observed state of a Machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Addresses assigned to the node
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<MachineAddress>,

    /// Lifecycle phase reported by the actuator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Machine-readable reason for a terminal failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,

    /// Human-readable message for a terminal failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// A single node address
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct MachineAddress {
    /// Address kind: InternalIP, ExternalIP, Hostname
    #[serde(rename = "type")]
    pub type_: String,
    /// The address itself
    pub address: String,
}

impl Machine {
    /// `namespace/name` identity used in logs, errors and boot scripts
    pub fn identity(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or_default(),
            self.metadata.name.as_deref().unwrap_or_default()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::Resource;

    #[test]
    fn machine_uses_cluster_api_group() {
        assert_eq!(Machine::group(&()), "cluster.k8s.io");
        assert_eq!(Machine::version(&()), "v1alpha1");
        assert_eq!(Machine::kind(&()), "Machine");
        assert_eq!(Machine::api_version(&()), "cluster.k8s.io/v1alpha1");
    }

    #[test]
    fn spec_fields_use_wire_names() {
        let spec = MachineSpec {
            versions: MachineVersionInfo {
                kubelet: "1.9.4".to_string(),
                control_plane: "1.9.4".to_string(),
            },
            provider_id: Some("gce://p/z/n".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["versions"]["controlPlane"], "1.9.4");
        assert_eq!(json["providerID"], "gce://p/z/n");
    }

    #[test]
    fn identity_joins_namespace_and_name() {
        let mut machine = Machine::new("worker-0", MachineSpec::default());
        machine.metadata.namespace = Some("default".to_string());
        assert_eq!(machine.identity(), "default/worker-0");
    }
}
