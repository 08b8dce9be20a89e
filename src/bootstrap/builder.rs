//! Full instance metadata for a machine
//!
//! Combines the role's boot script with the matching setup config, a join
//! token for workers, CA material for control planes and the cloud
//! provider's `cloud-config`.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use tracing::{debug, info};

use super::{
    master_metadata, node_metadata, BootstrapError, ConfigParams, MachineSetupConfig, TokenIssuer,
};
use crate::compute::{Metadata, MetadataItems};
use crate::config::{ActuatorConfig, ApiServerCertConfig};
use crate::crd::{Cluster, GceClusterProviderSpec, GceMachineProviderSpec, Machine};
use crate::pki::{self, KeyPair};

/// Metadata key of the cloud provider config
pub const CLOUD_CONFIG_KEY: &str = "cloud-config";
/// Metadata key of the base64 CA certificate
pub const CA_CERT_KEY: &str = "ca-cert";
/// Metadata key of the base64 CA private key
pub const CA_KEY_KEY: &str = "ca-key";
/// Metadata key of the base64 API server certificate
pub const APISERVER_CERT_KEY: &str = "apiserver-cert";
/// Metadata key of the base64 API server private key
pub const APISERVER_KEY_KEY: &str = "apiserver-key";

/// Builds instance metadata for control-plane and worker machines
pub struct MetadataBuilder {
    setup: Arc<dyn MachineSetupConfig>,
    tokens: Arc<dyn TokenIssuer>,
    ca: Option<KeyPair>,
    api_server: ApiServerCertConfig,
    default_dns_domain: String,
    network: String,
    subnetwork: String,
}

impl MetadataBuilder {
    /// Create a builder without a CA
    pub fn new(
        setup: Arc<dyn MachineSetupConfig>,
        tokens: Arc<dyn TokenIssuer>,
        config: &ActuatorConfig,
    ) -> Self {
        Self {
            setup,
            tokens,
            ca: None,
            api_server: config.api_server.clone(),
            default_dns_domain: config.default_dns_domain.clone(),
            network: config.network.clone(),
            subnetwork: config.subnetwork.clone(),
        }
    }

    /// Attach the cluster CA handed to control-plane instances
    pub fn with_ca(mut self, ca: Option<KeyPair>) -> Self {
        self.ca = ca;
        self
    }

    /// Boot image for the machine from its setup config
    pub fn image(
        &self,
        machine: &Machine,
        spec: &GceMachineProviderSpec,
    ) -> Result<String, BootstrapError> {
        self.setup
            .get_image(&ConfigParams::for_machine(spec, &machine.spec.versions))
    }

    /// Resolve the setup config serving `machine` without issuing anything
    ///
    /// Returns the boot image. Fails when no single setup config matches, so
    /// callers can check a replacement is buildable before tearing anything
    /// down.
    pub fn resolve_setup(
        &self,
        machine: &Machine,
        spec: &GceMachineProviderSpec,
    ) -> Result<String, BootstrapError> {
        let params = ConfigParams::for_machine(spec, &machine.spec.versions);
        self.setup.get_metadata(&params)?;
        self.setup.get_image(&params)
    }

    /// Metadata map for `machine`, keyed by metadata name
    pub async fn build_metadata(
        &self,
        cluster: &Cluster,
        machine: &Machine,
        cluster_spec: &GceClusterProviderSpec,
        machine_spec: &GceMachineProviderSpec,
    ) -> Result<BTreeMap<String, String>, BootstrapError> {
        let versions = &machine.spec.versions;
        if versions.kubelet.is_empty() {
            return Err(BootstrapError::InvalidMachineConfiguration(
                "missing Machine.Spec.Versions.Kubelet".to_string(),
            ));
        }

        let params = ConfigParams::for_machine(machine_spec, versions);
        let extra = self.setup.get_metadata(&params)?;

        let mut metadata = if machine_spec.is_master() {
            if versions.control_plane.is_empty() {
                return Err(BootstrapError::InvalidMachineConfiguration(
                    "missing Machine.Spec.Versions.ControlPlane".to_string(),
                ));
            }
            let mut metadata = master_metadata(cluster, machine, &cluster_spec.project, &extra)?;
            if let Some(ca) = &self.ca {
                self.add_control_plane_certs(&mut metadata, ca, cluster, machine, machine_spec)?;
            }
            metadata
        } else {
            let token = self.tokens.create_token().await?;
            node_metadata(
                token.trim(),
                cluster,
                machine,
                &cluster_spec.project,
                &extra,
            )?
        };

        metadata.insert(
            CLOUD_CONFIG_KEY.to_string(),
            cloud_config(
                &cluster_spec.project,
                &self.network,
                &self.subnetwork,
                &cluster.metadata.name.clone().unwrap_or_default(),
            ),
        );

        debug!(
            machine = %machine.identity(),
            keys = metadata.len(),
            "built instance metadata"
        );
        Ok(metadata)
    }

    fn add_control_plane_certs(
        &self,
        metadata: &mut BTreeMap<String, String>,
        ca: &KeyPair,
        cluster: &Cluster,
        machine: &Machine,
        machine_spec: &GceMachineProviderSpec,
    ) -> Result<(), BootstrapError> {
        let network = &cluster.spec.cluster_network;
        let dns_domain = if network.service_domain.is_empty() {
            self.default_dns_domain.as_str()
        } else {
            network.service_domain.as_str()
        };

        let mut ips: Vec<String> = cluster
            .api_endpoints()
            .iter()
            .map(|endpoint| endpoint.host.clone())
            .collect();
        ips.extend(first_host_ip(network.services.first_or_empty()));
        if !machine_spec.external_ip.is_empty() {
            ips.push(machine_spec.external_ip.clone());
        }
        let hostnames: Vec<String> = machine.metadata.name.clone().into_iter().collect();

        let server = pki::new_server_key_pair(
            ca,
            &self.api_server.common_name,
            &self.api_server.service_name,
            &self.api_server.service_namespace,
            dns_domain,
            &ips,
            &hostnames,
        )?;

        for (key, pem) in [
            (CA_CERT_KEY, ca.cert_pem()),
            (CA_KEY_KEY, ca.key_pem()),
            (APISERVER_CERT_KEY, server.cert_pem()),
            (APISERVER_KEY_KEY, server.key_pem()),
        ] {
            metadata.insert(key.to_string(), STANDARD.encode(pem));
        }
        info!(machine = %machine.identity(), "issued api server certificate");
        Ok(())
    }
}

/// The `[global]` cloud provider config for instances of a cluster
pub fn cloud_config(project: &str, network: &str, subnetwork: &str, cluster_name: &str) -> String {
    format!(
        "[global]\n\
         project-id = {project}\n\
         network-name = {network}\n\
         subnetwork-name = {subnetwork}\n\
         node-tags = {cluster_name}-worker\n"
    )
}

/// Instance metadata items sorted by key
pub fn to_compute_metadata(metadata: &BTreeMap<String, String>) -> Metadata {
    Metadata {
        items: metadata
            .iter()
            .map(|(key, value)| MetadataItems {
                key: key.clone(),
                value: Some(value.clone()),
            })
            .collect(),
    }
}

/// First usable address of an IPv4 CIDR, e.g. `10.96.0.1` for `10.96.0.0/12`
fn first_host_ip(cidr: &str) -> Option<String> {
    let (addr, prefix) = cidr.split_once('/')?;
    let addr: Ipv4Addr = addr.parse().ok()?;
    let prefix: u32 = prefix.parse().ok()?;
    if prefix >= 31 {
        return None;
    }
    let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
    Some(Ipv4Addr::from((u32::from(addr) & mask) + 1).to_string())
}
