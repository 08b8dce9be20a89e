//! GCE provider specs carried inside Machine and Cluster records

use schemars::JsonSchema;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::{Cluster, Machine};
use crate::Error;

/// Purpose of a machine within the cluster
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub enum MachineRole {
    /// Runs the control plane
    Master,
    /// Joins the cluster as a worker
    Node,
}

/// Returns true when the role list includes the control plane
pub fn is_master(roles: &[MachineRole]) -> bool {
    roles.contains(&MachineRole::Master)
}

/// Per-machine GCE configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GceMachineProviderSpec {
    /// Machine roles; at least one is required
    #[serde(default)]
    pub roles: Vec<MachineRole>,

    /// Compute zone, e.g. `us-west1-a`
    pub zone: String,

    /// Compute machine type, e.g. `n1-standard-2`
    pub machine_type: String,

    /// Operating system name, matched against machine setup configs
    #[serde(default)]
    pub os: String,

    /// Disks in attach order; the first becomes the boot disk
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<Disk>,

    /// Static external IP for the instance's NAT access config
    #[serde(default, rename = "externalIP", skip_serializing_if = "String::is_empty")]
    pub external_ip: String,
}

/// A persistent disk to create with the instance
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    /// Creation parameters
    pub initialize_params: DiskInitializeParams,
}

/// Size and type of a new disk
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiskInitializeParams {
    /// Size in GB
    pub disk_size_gb: i64,
    /// Disk type name, e.g. `pd-ssd`
    pub disk_type: String,
}

/// Per-cluster GCE configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GceClusterProviderSpec {
    /// GCP project hosting the cluster's instances
    pub project: String,

    /// Region, informational only
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,
}

fn decode_value<T: DeserializeOwned>(
    value: Option<&serde_json::Value>,
    owner: &str,
) -> Result<T, Error> {
    let value = value.ok_or_else(|| {
        Error::validation(format!("{owner} has no providerSpec.value"))
    })?;
    serde_json::from_value(value.clone())
        .map_err(|e| Error::validation(format!("invalid providerSpec for {owner}: {e}")))
}

impl GceMachineProviderSpec {
    /// Decode and validate the provider spec embedded in a machine
    pub fn from_machine(machine: &Machine) -> Result<Self, Error> {
        let identity = machine.identity();
        let spec: Self = decode_value(
            machine.spec.provider_spec.value.as_ref(),
            &format!("machine {identity}"),
        )?;
        spec.validate(&identity)?;
        Ok(spec)
    }

    /// Check the invariants the actuator relies on
    pub fn validate(&self, identity: &str) -> Result<(), Error> {
        if self.roles.is_empty() {
            return Err(Error::validation(format!(
                "machine {identity} must have at least one role"
            )));
        }
        if self.zone.is_empty() {
            return Err(Error::validation(format!("machine {identity} has no zone")));
        }
        if self.machine_type.is_empty() {
            return Err(Error::validation(format!(
                "machine {identity} has no machineType"
            )));
        }
        Ok(())
    }

    /// Returns true when this machine runs the control plane
    pub fn is_master(&self) -> bool {
        is_master(&self.roles)
    }
}

impl GceClusterProviderSpec {
    /// Decode the provider spec embedded in a cluster
    pub fn from_cluster(cluster: &Cluster) -> Result<Self, Error> {
        let identity = cluster.identity();
        let spec: Self = decode_value(
            cluster.spec.provider_spec.value.as_ref(),
            &format!("cluster {identity}"),
        )?;
        if spec.project.is_empty() {
            return Err(Error::validation(format!(
                "cluster {identity} has no project"
            )));
        }
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ClusterSpec, MachineSpec, ProviderSpec};
    use serde_json::json;

    fn machine_with(value: serde_json::Value) -> Machine {
        let mut machine = Machine::new(
            "master-0",
            MachineSpec {
                provider_spec: ProviderSpec { value: Some(value) },
                ..Default::default()
            },
        );
        machine.metadata.namespace = Some("default".to_string());
        machine
    }

    #[test]
    fn machine_provider_spec_decodes_wire_names() {
        let machine = machine_with(json!({
            "roles": ["Master"],
            "zone": "us-west5-f",
            "machineType": "n1-standard-1",
            "os": "os-name",
            "disks": [{"initializeParams": {"diskSizeGb": 30, "diskType": "pd-ssd"}}],
            "externalIP": "35.1.2.3"
        }));
        let spec = GceMachineProviderSpec::from_machine(&machine).unwrap();
        assert!(spec.is_master());
        assert_eq!(spec.disks[0].initialize_params.disk_type, "pd-ssd");
        assert_eq!(spec.external_ip, "35.1.2.3");
    }

    #[test]
    fn machine_without_roles_is_rejected() {
        let machine = machine_with(json!({
            "zone": "us-west5-f",
            "machineType": "n1-standard-1"
        }));
        let err = GceMachineProviderSpec::from_machine(&machine).unwrap_err();
        assert!(err.to_string().contains("at least one role"));
    }

    #[test]
    fn missing_provider_spec_names_the_machine() {
        let machine = Machine::new("orphan", MachineSpec::default());
        let err = GceMachineProviderSpec::from_machine(&machine).unwrap_err();
        assert!(err.to_string().contains("/orphan has no providerSpec.value"));
    }

    #[test]
    fn cluster_provider_spec_requires_project() {
        let cluster = Cluster::new(
            "demo",
            ClusterSpec {
                provider_spec: ProviderSpec {
                    value: Some(json!({"project": ""})),
                },
                ..Default::default()
            },
        );
        assert!(GceClusterProviderSpec::from_cluster(&cluster).is_err());
    }

    #[test]
    fn node_only_roles_are_not_master() {
        assert!(!is_master(&[MachineRole::Node]));
        assert!(is_master(&[MachineRole::Node, MachineRole::Master]));
    }
}
