//! Compute instance shape for a machine

use std::collections::BTreeMap;

use crate::bootstrap::to_compute_metadata;
use crate::compute::{
    AccessConfig, AttachedDisk, AttachedDiskInitializeParams, Instance, NetworkInterface,
    ServiceAccount, Tags,
};
use crate::config::ActuatorConfig;
use crate::crd::{Cluster, GceMachineProviderSpec, Machine};

/// OAuth scope granted to instance service accounts
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Everything needed to shape one instance
pub struct InstanceRequest<'a> {
    /// Cluster the machine belongs to
    pub cluster: &'a Cluster,
    /// Machine being created
    pub machine: &'a Machine,
    /// Decoded machine provider spec
    pub spec: &'a GceMachineProviderSpec,
    /// Boot image from the setup config
    pub image: &'a str,
    /// Rendered instance metadata
    pub metadata: &'a BTreeMap<String, String>,
}

/// Build the instance to insert for a machine
///
/// The first disk boots from `image` and is grown to the configured minimum
/// size; further disks are blank data disks. A spec without disks yields an
/// instance without disks.
pub fn instance_spec(request: &InstanceRequest<'_>, config: &ActuatorConfig) -> Instance {
    let spec = request.spec;
    let zone = &spec.zone;
    let cluster_name = request.cluster.metadata.name.clone().unwrap_or_default();

    let disks: Vec<AttachedDisk> = spec
        .disks
        .iter()
        .enumerate()
        .map(|(i, disk)| {
            let params = &disk.initialize_params;
            let boot = i == 0;
            AttachedDisk {
                auto_delete: true,
                boot,
                initialize_params: Some(AttachedDiskInitializeParams {
                    disk_size_gb: if boot {
                        params.disk_size_gb.max(config.min_boot_disk_size_gb)
                    } else {
                        params.disk_size_gb
                    },
                    disk_type: format!("zones/{zone}/diskTypes/{}", params.disk_type),
                    source_image: if boot {
                        request.image.to_string()
                    } else {
                        String::new()
                    },
                }),
            }
        })
        .collect();

    let mut tags = vec![format!("{cluster_name}-worker")];
    if spec.is_master() {
        tags.insert(0, "https-server".to_string());
    }

    Instance {
        name: request.machine.metadata.name.clone().unwrap_or_default(),
        machine_type: format!("zones/{zone}/machineTypes/{}", spec.machine_type),
        can_ip_forward: true,
        network_interfaces: vec![NetworkInterface {
            network: format!("global/networks/{}", config.network),
            access_configs: vec![AccessConfig {
                name: "External NAT".to_string(),
                type_: "ONE_TO_ONE_NAT".to_string(),
                nat_ip: Some(spec.external_ip.clone()).filter(|ip| !ip.is_empty()),
            }],
            network_ip: None,
        }],
        disks,
        metadata: Some(to_compute_metadata(request.metadata)),
        tags: Some(Tags { items: tags }),
        labels: BTreeMap::new(),
        service_accounts: vec![ServiceAccount {
            email: "default".to_string(),
            scopes: vec![CLOUD_PLATFORM_SCOPE.to_string()],
        }],
        status: None,
        self_link: None,
    }
}
