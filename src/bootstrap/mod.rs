//! Instance bootstrap metadata
//!
//! Every instance boots from a `startup-script` metadata entry. The script
//! begins with a role-specific preamble of shell variables rendered from the
//! cluster and machine records, followed by whatever the matching machine
//! setup config contributes under the same key.
//!
//! # Roles
//!
//! - Control plane: versions, network ranges and DNS domain
//! - Worker: the same plus a join token and the API endpoint to join
//!
//! Rendering is a pure function of [`BootstrapParams`]; assembling the final
//! metadata (tokens, CA material, cloud-config) is done by [`MetadataBuilder`].

mod builder;
mod machinesetup;
mod token;

use std::collections::BTreeMap;

use minijinja::{Environment, UndefinedBehavior};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crd::{Cluster, Machine};
use crate::pki::PkiError;

pub use builder::{
    cloud_config, to_compute_metadata, MetadataBuilder, APISERVER_CERT_KEY, APISERVER_KEY_KEY,
    CA_CERT_KEY, CA_KEY_KEY, CLOUD_CONFIG_KEY,
};
pub use machinesetup::{ConfigParams, MachineSetupConfig, SetupConfig, ValidConfigs};
pub use token::{BootstrapToken, KubeTokenIssuer, TokenIssuer};

#[cfg(test)]
pub use machinesetup::MockMachineSetupConfig;
#[cfg(test)]
pub use token::MockTokenIssuer;

/// Metadata key holding the boot script
pub const STARTUP_SCRIPT_KEY: &str = "startup-script";

const MASTER_TEMPLATE: &str = include_str!("../../templates/master-startup.sh");
const NODE_TEMPLATE: &str = include_str!("../../templates/node-startup.sh");

/// Bootstrap metadata errors
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Workers cannot join a cluster that has no API endpoint yet
    #[error("master endpoint not found in apiEndpoints for cluster {cluster}")]
    MissingEndpoint {
        /// `namespace/name` of the cluster
        cluster: String,
    },

    /// A boot script template failed to render
    #[error("template render failed: {0}")]
    TemplateRender(String),

    /// The machine is missing fields its role requires
    #[error("invalid machine configuration: {0}")]
    InvalidMachineConfiguration(String),

    /// A join token could not be issued
    #[error("unable to create token: {0}")]
    TokenCreation(String),

    /// No usable machine setup config
    #[error("machine setup config: {0}")]
    MachineSetup(String),

    /// The API server certificate could not be issued
    #[error("api server certificate: {0}")]
    Certificate(#[from] PkiError),
}

/// A named metadata entry contributed by a machine setup config
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct MetadataItem {
    /// Metadata key; repeated keys are concatenated
    pub name: String,
    /// Value appended under `name`
    pub value: String,
}

/// Values available to the boot script templates
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct BootstrapParams {
    /// Join token, workers only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// GCP project
    pub project: String,
    /// Kubelet version without a leading `v`
    pub kubelet_version: String,
    /// Control plane version, control plane only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_plane_version: Option<String>,
    /// Machine namespace
    pub namespace: String,
    /// `namespace/name` of the machine
    pub machine: String,
    /// Cluster service DNS domain
    pub cluster_dns_domain: String,
    /// First pod CIDR, or empty
    pub pod_cidr: String,
    /// First service CIDR, or empty
    pub service_cidr: String,
    /// `host:port` of the API server, workers only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_endpoint: Option<String>,
}

impl BootstrapParams {
    fn common(cluster: &Cluster, machine: &Machine, project: &str) -> Self {
        let network = &cluster.spec.cluster_network;
        Self {
            project: project.to_string(),
            kubelet_version: machine.spec.versions.kubelet.clone(),
            namespace: machine.metadata.namespace.clone().unwrap_or_default(),
            machine: machine.identity(),
            cluster_dns_domain: network.service_domain.clone(),
            pod_cidr: network.pods.first_or_empty().to_string(),
            service_cidr: network.services.first_or_empty().to_string(),
            ..Default::default()
        }
    }

    /// Parameters for a control-plane boot script
    pub fn for_master(cluster: &Cluster, machine: &Machine, project: &str) -> Self {
        Self {
            control_plane_version: Some(machine.spec.versions.control_plane.clone())
                .filter(|v| !v.is_empty()),
            ..Self::common(cluster, machine, project)
        }
    }

    /// Parameters for a worker boot script
    ///
    /// Fails when the cluster has no API endpoint to join.
    pub fn for_node(
        token: &str,
        cluster: &Cluster,
        machine: &Machine,
        project: &str,
    ) -> Result<Self, BootstrapError> {
        let endpoint = cluster
            .api_endpoints()
            .first()
            .ok_or_else(|| BootstrapError::MissingEndpoint {
                cluster: cluster.identity(),
            })?;

        Ok(Self {
            token: Some(token.to_string()),
            master_endpoint: Some(endpoint.to_string()),
            ..Self::common(cluster, machine, project)
        })
    }
}

fn render(name: &str, source: &str, params: &BootstrapParams) -> Result<String, BootstrapError> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_keep_trailing_newline(true);
    let render_error = |e: minijinja::Error| {
        BootstrapError::TemplateRender(format!("{name} for machine {}: {e}", params.machine))
    };
    env.add_template(name, source).map_err(render_error)?;
    env.get_template(name)
        .and_then(|tmpl| tmpl.render(params))
        .map_err(render_error)
}

/// Render the control-plane boot script preamble
pub fn render_master_script(params: &BootstrapParams) -> Result<String, BootstrapError> {
    render("master-startup.sh", MASTER_TEMPLATE, params)
}

/// Render the worker boot script preamble
pub fn render_node_script(params: &BootstrapParams) -> Result<String, BootstrapError> {
    render("node-startup.sh", NODE_TEMPLATE, params)
}

fn with_extra_items(script: String, extra: &[MetadataItem]) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    metadata.insert(STARTUP_SCRIPT_KEY.to_string(), script);
    for item in extra {
        metadata
            .entry(item.name.clone())
            .or_insert_with(String::new)
            .push_str(&item.value);
    }
    metadata
}

/// Metadata for a worker instance
///
/// Fails with [`BootstrapError::MissingEndpoint`] before rendering when the
/// cluster has no API endpoint.
pub fn node_metadata(
    token: &str,
    cluster: &Cluster,
    machine: &Machine,
    project: &str,
    extra: &[MetadataItem],
) -> Result<BTreeMap<String, String>, BootstrapError> {
    let params = BootstrapParams::for_node(token, cluster, machine, project)?;
    let script = render_node_script(&params)?;
    Ok(with_extra_items(script, extra))
}

/// Metadata for a control-plane instance
pub fn master_metadata(
    cluster: &Cluster,
    machine: &Machine,
    project: &str,
    extra: &[MetadataItem],
) -> Result<BTreeMap<String, String>, BootstrapError> {
    let params = BootstrapParams::for_master(cluster, machine, project);
    let script = render_master_script(&params)?;
    Ok(with_extra_items(script, extra))
}


#[cfg(test)]
mod tests {
    use super::test_fixtures::{cluster, machine};
    use super::*;

    /// Golden: worker preamble for the standard fixture
    #[test]
    fn node_script_golden() {
        let params = BootstrapParams::for_node(
            "c582f9.65a6f54fa78da5ae",
            &cluster(),
            &machine("worker-0", "Node"),
            "project-name-2000",
        )
        .unwrap();

        assert_eq!(
            render_node_script(&params).unwrap(),
            "#!/bin/bash\n\
             KUBELET_VERSION=1.9.4\n\
             TOKEN=c582f9.65a6f54fa78da5ae\n\
             MASTER=172.12.0.1:1234\n\
             NAMESPACE=default\n\
             MACHINE=default/worker-0\n\
             CLUSTER_DNS_DOMAIN=cluster.local\n\
             POD_CIDR=192.168.0.0/16\n\
             SERVICE_CIDR=10.96.0.0/12\n"
        );
    }

    /// Golden: control-plane preamble for the standard fixture
    #[test]
    fn master_script_golden() {
        let params =
            BootstrapParams::for_master(&cluster(), &machine("master-0", "Master"), "p");

        assert_eq!(
            render_master_script(&params).unwrap(),
            "#!/bin/bash\n\
             KUBELET_VERSION=1.9.4\n\
             VERSION=v${KUBELET_VERSION}\n\
             PORT=443\n\
             NAMESPACE=default\n\
             MACHINE=default/master-0\n\
             CONTROL_PLANE_VERSION=1.9.4\n\
             CLUSTER_DNS_DOMAIN=cluster.local\n\
             POD_CIDR=192.168.0.0/16\n\
             SERVICE_CIDR=10.96.0.0/12\n"
        );
    }

    #[test]
    fn worker_without_endpoint_fails_before_rendering() {
        let mut cluster = cluster();
        cluster.status = None;

        let err = node_metadata("t", &cluster, &machine("worker-0", "Node"), "p", &[])
            .unwrap_err();
        match err {
            BootstrapError::MissingEndpoint { cluster } => {
                assert_eq!(cluster, "default/cluster-test")
            }
            other => panic!("expected MissingEndpoint, got {other:?}"),
        }
    }

    #[test]
    fn missing_cidrs_render_empty() {
        let mut cluster = cluster();
        cluster.spec.cluster_network.pods.cidr_blocks.clear();
        cluster.spec.cluster_network.services.cidr_blocks.clear();

        let metadata =
            master_metadata(&cluster, &machine("master-0", "Master"), "p", &[]).unwrap();
        let script = &metadata[STARTUP_SCRIPT_KEY];
        assert!(script.contains("POD_CIDR=\n"));
        assert!(script.contains("SERVICE_CIDR=\n"));
    }

    #[test]
    fn master_template_requires_control_plane_version() {
        let mut machine = machine("master-0", "Master");
        machine.spec.versions.control_plane.clear();

        let params = BootstrapParams::for_master(&cluster(), &machine, "p");
        match render_master_script(&params) {
            Err(BootstrapError::TemplateRender(message)) => {
                assert!(message.starts_with("master-startup.sh for machine default/master-0:"));
            }
            other => panic!("expected TemplateRender, got {other:?}"),
        }
    }

    /// Story: setup config scripts are appended after the variable preamble
    #[test]
    fn story_extra_items_concatenate_by_name() {
        let extra = vec![
            MetadataItem {
                name: STARTUP_SCRIPT_KEY.to_string(),
                value: "kubeadm join --token $TOKEN $MASTER\n".to_string(),
            },
            MetadataItem {
                name: "motd".to_string(),
                value: "hello ".to_string(),
            },
            MetadataItem {
                name: "motd".to_string(),
                value: "world".to_string(),
            },
        ];

        let metadata =
            node_metadata("tok", &cluster(), &machine("worker-0", "Node"), "p", &extra).unwrap();

        let script = &metadata[STARTUP_SCRIPT_KEY];
        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.ends_with(
            "SERVICE_CIDR=10.96.0.0/12\nkubeadm join --token $TOKEN $MASTER\n"
        ));
        assert_eq!(metadata["motd"], "hello world");
        assert_eq!(metadata.len(), 2);
    }
}
