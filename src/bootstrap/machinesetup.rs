//! Machine setup configs
//!
//! A setup config maps (os, roles, versions) to the boot image and the
//! metadata items an instance needs. Configs are loaded from YAML:
//!
//! ```yaml
//! items:
//!   - machineParams:
//!       - os: ubuntu-1604-lts
//!         roles: [Master]
//!         versions:
//!           kubelet: 1.9.4
//!           controlPlane: 1.9.4
//!     image: projects/ubuntu-os-cloud/global/images/family/ubuntu-1604-lts
//!     metadata:
//!       - name: startup-script
//!         value: |
//!           kubeadm init ...
//! ```

use std::collections::BTreeSet;
use std::path::Path;

#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use super::{BootstrapError, MetadataItem};
use crate::crd::{GceMachineProviderSpec, MachineRole, MachineVersionInfo};

/// The lookup key for a setup config
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigParams {
    /// Operating system name
    pub os: String,
    /// Machine roles, compared as a set
    pub roles: Vec<MachineRole>,
    /// Kubelet and control plane versions
    pub versions: MachineVersionInfo,
}

impl ConfigParams {
    /// Lookup key for a machine with the given provider spec and versions
    pub fn for_machine(spec: &GceMachineProviderSpec, versions: &MachineVersionInfo) -> Self {
        Self {
            os: spec.os.clone(),
            roles: spec.roles.clone(),
            versions: versions.clone(),
        }
    }

    fn matches(&self, other: &ConfigParams) -> bool {
        let roles: BTreeSet<_> = self.roles.iter().collect();
        let other_roles: BTreeSet<_> = other.roles.iter().collect();
        self.os == other.os && roles == other_roles && self.versions == other.versions
    }
}

/// Source of boot images and metadata for machines
#[cfg_attr(test, automock)]
pub trait MachineSetupConfig: Send + Sync {
    /// Boot image for the machine described by `params`
    fn get_image(&self, params: &ConfigParams) -> Result<String, BootstrapError>;

    /// Extra metadata items for the machine described by `params`
    fn get_metadata(&self, params: &ConfigParams) -> Result<Vec<MetadataItem>, BootstrapError>;
}

/// One setup config and the machine shapes it applies to
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SetupConfig {
    /// Machine shapes served by this config
    pub machine_params: Vec<ConfigParams>,
    /// Boot disk image
    pub image: String,
    /// Metadata items attached to the instance
    #[serde(default)]
    pub metadata: Vec<MetadataItem>,
}

/// A validated list of setup configs
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ValidConfigs {
    /// Configs in file order
    pub items: Vec<SetupConfig>,
}

impl ValidConfigs {
    /// Parse configs from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self, BootstrapError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| BootstrapError::MachineSetup(format!("invalid setup config yaml: {e}")))
    }

    /// Read and parse configs from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, BootstrapError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            BootstrapError::MachineSetup(format!("unable to read {}: {e}", path.display()))
        })?;
        Self::from_yaml(&yaml)
    }

    fn matching_config(&self, params: &ConfigParams) -> Result<&SetupConfig, BootstrapError> {
        let mut matches = self
            .items
            .iter()
            .filter(|config| config.machine_params.iter().any(|p| p.matches(params)));

        let describe = || {
            format!(
                "os={} roles={:?} versions={:?}",
                params.os, params.roles, params.versions
            )
        };

        match (matches.next(), matches.next()) {
            (Some(config), None) => Ok(config),
            (None, _) => Err(BootstrapError::MachineSetup(format!(
                "could not find a matching machine setup config for params {}",
                describe()
            ))),
            (Some(_), Some(_)) => Err(BootstrapError::MachineSetup(format!(
                "found multiple matching machine setup configs for params {}",
                describe()
            ))),
        }
    }
}

impl MachineSetupConfig for ValidConfigs {
    fn get_image(&self, params: &ConfigParams) -> Result<String, BootstrapError> {
        Ok(self.matching_config(params)?.image.clone())
    }

    fn get_metadata(&self, params: &ConfigParams) -> Result<Vec<MetadataItem>, BootstrapError> {
        Ok(self.matching_config(params)?.metadata.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIGS: &str = r#"
items:
  - machineParams:
      - os: ubuntu-1604-lts
        roles: [Master]
        versions:
          kubelet: 1.9.4
          controlPlane: 1.9.4
    image: projects/ubuntu-os-cloud/global/images/family/ubuntu-1604-lts
    metadata:
      - name: startup-script
        value: "kubeadm init\n"
  - machineParams:
      - os: ubuntu-1604-lts
        roles: [Node]
        versions:
          kubelet: 1.9.4
      - os: ubuntu-1604-lts
        roles: [Node, Master]
        versions:
          kubelet: 1.9.4
          controlPlane: 1.9.4
    image: projects/ubuntu-os-cloud/global/images/family/ubuntu-1604-lts
    metadata:
      - name: startup-script
        value: "kubeadm join\n"
"#;

    fn params(roles: Vec<MachineRole>, control_plane: &str) -> ConfigParams {
        ConfigParams {
            os: "ubuntu-1604-lts".to_string(),
            roles,
            versions: MachineVersionInfo {
                kubelet: "1.9.4".to_string(),
                control_plane: control_plane.to_string(),
            },
        }
    }

    #[test]
    fn worker_params_select_worker_config() {
        let configs = ValidConfigs::from_yaml(CONFIGS).unwrap();
        let metadata = configs
            .get_metadata(&params(vec![MachineRole::Node], ""))
            .unwrap();
        assert_eq!(metadata[0].value, "kubeadm join\n");
    }

    #[test]
    fn roles_compare_as_a_set() {
        let configs = ValidConfigs::from_yaml(CONFIGS).unwrap();
        let image = configs
            .get_image(&params(vec![MachineRole::Master, MachineRole::Node], "1.9.4"))
            .unwrap();
        assert!(image.ends_with("ubuntu-1604-lts"));
    }

    #[test]
    fn unknown_version_has_no_config() {
        let configs = ValidConfigs::from_yaml(CONFIGS).unwrap();
        let mut p = params(vec![MachineRole::Node], "");
        p.versions.kubelet = "1.99.0".to_string();
        let err = configs.get_image(&p).unwrap_err();
        assert!(err.to_string().contains("could not find"));
    }

    #[test]
    fn ambiguous_params_are_rejected() {
        let mut configs = ValidConfigs::from_yaml(CONFIGS).unwrap();
        let duplicate = configs.items[0].clone();
        configs.items.push(duplicate);

        let err = configs
            .get_metadata(&params(vec![MachineRole::Master], "1.9.4"))
            .unwrap_err();
        assert!(err.to_string().contains("multiple"));
    }

    #[test]
    fn configs_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("machine_setup_configs.yaml");
        std::fs::write(&path, CONFIGS).unwrap();
        assert_eq!(ValidConfigs::from_file(&path).unwrap().items.len(), 2);
        assert!(ValidConfigs::from_file(dir.path().join("missing.yaml")).is_err());
    }

    #[test]
    fn malformed_yaml_is_setup_error() {
        assert!(matches!(
            ValidConfigs::from_yaml("items: {"),
            Err(BootstrapError::MachineSetup(_))
        ));
    }
}
