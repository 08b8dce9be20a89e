//! Machine actuator
//!
//! Drives a Machine record onto a compute instance. A pass reads the
//! provider specs, builds the boot metadata, inserts the instance and waits
//! for the zone operation, then records what it observed in the Machine's
//! `instance-status` annotation.
//!
//! Collaborators are injected through [`MachineActuatorBuilder`]:
//!
//! ```ignore
//! let actuator = MachineActuator::builder(compute)
//!     .client(client)
//!     .config(config)
//!     .build()?;
//! actuator.reconcile(&cluster, &machine).await?;
//! ```

mod instance;

pub use instance::{instance_spec, InstanceRequest, CLOUD_PLATFORM_SCOPE};

use std::sync::Arc;

use kube::{Client, ResourceExt};
use tracing::{info, instrument, warn};

use crate::bootstrap::{
    KubeTokenIssuer, MachineSetupConfig, MetadataBuilder, TokenIssuer, ValidConfigs,
};
use crate::compute::{wait_for_operation, ComputeService, Instance};
use crate::config::ActuatorConfig;
use crate::crd::{Cluster, GceClusterProviderSpec, GceMachineProviderSpec, Machine};
use crate::pki::KeyPair;
use crate::retry::RetryConfig;
use crate::status::{
    machine_instance_status, update_instance_status, KubeMachineStore, MachineStore,
};
use crate::{Error, Result};

/// What a pass did to the instance backing a machine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// A new instance was inserted
    Created,
    /// The instance was already there; only the status was recorded
    AlreadyExists,
    /// The instance was deleted
    Deleted,
    /// There was no instance to delete
    AlreadyAbsent,
    /// The worker instance was deleted and inserted again with the new spec
    Recreated,
    /// A running instance without a snapshot had its status recorded
    StatusRecorded,
    /// The recorded state matches the goal
    Unchanged,
}

/// Reconciles Machines onto compute instances
pub struct MachineActuator {
    compute: Arc<dyn ComputeService>,
    store: Arc<dyn MachineStore>,
    metadata: MetadataBuilder,
    retry: RetryConfig,
    config: ActuatorConfig,
}

impl MachineActuator {
    /// Create a builder around the compute provider client
    pub fn builder(compute: Arc<dyn ComputeService>) -> MachineActuatorBuilder {
        MachineActuatorBuilder::new(compute)
    }

    /// Settings in effect for this actuator
    pub fn config(&self) -> &ActuatorConfig {
        &self.config
    }

    /// Create the instance for `machine` unless it already exists
    ///
    /// The status annotation is written in both cases.
    #[instrument(skip(self, cluster, machine), fields(machine = %machine.identity()))]
    pub async fn create(&self, cluster: &Cluster, machine: &Machine) -> Result<Outcome> {
        let identity = machine.identity();
        let cluster_spec = GceClusterProviderSpec::from_cluster(cluster)?;
        let spec = GceMachineProviderSpec::from_machine(machine)?;
        let project = cluster_spec.project.as_str();
        let zone = spec.zone.as_str();

        let outcome = if self.get_instance(cluster, machine).await?.is_some() {
            info!(zone, "instance already exists, skipping insert");
            Outcome::AlreadyExists
        } else {
            let image = self.metadata.image(machine, &spec)?;
            let metadata = self
                .metadata
                .build_metadata(cluster, machine, &cluster_spec, &spec)
                .await?;
            let instance = instance_spec(
                &InstanceRequest {
                    cluster,
                    machine,
                    spec: &spec,
                    image: &image,
                    metadata: &metadata,
                },
                &self.config,
            );

            let operation = self
                .compute
                .instances_insert(project, zone, &instance)
                .await
                .map_err(|e| Error::provisioning(&identity, "instances.insert", e))?;
            wait_for_operation(
                self.compute.as_ref(),
                project,
                zone,
                operation,
                &identity,
                &self.retry,
            )
            .await?;
            info!(zone, machine_type = %spec.machine_type, "instance created");
            Outcome::Created
        };

        update_instance_status(self.store.as_ref(), machine).await?;
        Ok(outcome)
    }

    /// Delete the instance for `machine`; absent instances are not an error
    #[instrument(skip(self, cluster, machine), fields(machine = %machine.identity()))]
    pub async fn delete(&self, cluster: &Cluster, machine: &Machine) -> Result<Outcome> {
        let identity = machine.identity();
        let cluster_spec = GceClusterProviderSpec::from_cluster(cluster)?;
        let spec = GceMachineProviderSpec::from_machine(machine)?;
        let project = cluster_spec.project.as_str();
        let zone = spec.zone.as_str();

        if self.get_instance(cluster, machine).await?.is_none() {
            info!(zone, "instance already absent, skipping delete");
            return Ok(Outcome::AlreadyAbsent);
        }

        let operation = self
            .compute
            .instances_delete(project, zone, &machine.name_any())
            .await
            .map_err(|e| Error::provisioning(&identity, "instances.delete", e))?;
        wait_for_operation(
            self.compute.as_ref(),
            project,
            zone,
            operation,
            &identity,
            &self.retry,
        )
        .await?;
        info!(zone, "instance deleted");
        Ok(Outcome::Deleted)
    }

    /// Returns true when an instance backs `machine`
    pub async fn exists(&self, cluster: &Cluster, machine: &Machine) -> Result<bool> {
        Ok(self.get_instance(cluster, machine).await?.is_some())
    }

    /// Move the instance for `goal` towards the goal spec
    ///
    /// Worker instances are replaced when their provider spec, versions or
    /// name changed. The replacement's setup config is resolved before the
    /// old instance is deleted. Control-plane instances are never replaced in
    /// place.
    #[instrument(skip(self, cluster, goal), fields(machine = %goal.identity()))]
    pub async fn update(&self, cluster: &Cluster, goal: &Machine) -> Result<Outcome> {
        let Some(current) = machine_instance_status(goal)? else {
            if self.exists(cluster, goal).await? {
                info!("instance has no recorded status, recording current state");
                update_instance_status(self.store.as_ref(), goal).await?;
                return Ok(Outcome::StatusRecorded);
            }
            return Err(Error::validation(format!(
                "cannot retrieve current state to update machine {}",
                goal.identity()
            )));
        };

        if !requires_update(&current, goal) {
            return Ok(Outcome::Unchanged);
        }

        let current_spec = GceMachineProviderSpec::from_machine(&current)?;
        if current_spec.is_master() {
            warn!("control plane spec changed; in-place upgrades are not supported");
            return Err(Error::validation(format!(
                "updating control plane machine {} in place is not supported",
                goal.identity()
            )));
        }

        let goal_spec = GceMachineProviderSpec::from_machine(goal)?;
        self.metadata.resolve_setup(goal, &goal_spec)?;

        info!("worker spec changed, replacing instance");
        self.delete(cluster, &current).await?;
        self.create(cluster, goal).await?;
        Ok(Outcome::Recreated)
    }

    /// Run one pass for `machine`, choosing delete, create or update
    #[instrument(skip(self, cluster, machine), fields(machine = %machine.identity()))]
    pub async fn reconcile(&self, cluster: &Cluster, machine: &Machine) -> Result<Outcome> {
        if machine.metadata.deletion_timestamp.is_some() {
            return self.delete(cluster, machine).await;
        }
        match machine_instance_status(machine)? {
            None => self.create(cluster, machine).await,
            Some(_) => self.update(cluster, machine).await,
        }
    }

    async fn get_instance(&self, cluster: &Cluster, machine: &Machine) -> Result<Option<Instance>> {
        let cluster_spec = GceClusterProviderSpec::from_cluster(cluster)?;
        let spec = GceMachineProviderSpec::from_machine(machine)?;
        self.compute
            .instances_get(&cluster_spec.project, &spec.zone, &machine.name_any())
            .await
            .map_err(|e| Error::provisioning(machine.identity(), "instances.get", e))
    }
}

fn requires_update(current: &Machine, goal: &Machine) -> bool {
    current.metadata.name != goal.metadata.name
        || current.spec.provider_spec != goal.spec.provider_spec
        || current.spec.versions != goal.spec.versions
}

/// Builder for [`MachineActuator`]
///
/// Collaborators not set explicitly are derived: the machine store and token
/// issuer from the kube client, setup configs and CA from the paths in the
/// config.
pub struct MachineActuatorBuilder {
    compute: Arc<dyn ComputeService>,
    client: Option<Client>,
    store: Option<Arc<dyn MachineStore>>,
    tokens: Option<Arc<dyn TokenIssuer>>,
    setup: Option<Arc<dyn MachineSetupConfig>>,
    ca: Option<KeyPair>,
    config: ActuatorConfig,
}

impl MachineActuatorBuilder {
    fn new(compute: Arc<dyn ComputeService>) -> Self {
        Self {
            compute,
            client: None,
            store: None,
            tokens: None,
            setup: None,
            ca: None,
            config: ActuatorConfig::default(),
        }
    }

    /// Kubernetes client used for default collaborators
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Override the machine store
    pub fn machine_store(mut self, store: Arc<dyn MachineStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the join token issuer
    pub fn token_issuer(mut self, tokens: Arc<dyn TokenIssuer>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Override the machine setup configs
    pub fn setup_config(mut self, setup: Arc<dyn MachineSetupConfig>) -> Self {
        self.setup = Some(setup);
        self
    }

    /// Cluster CA handed to control-plane instances
    pub fn certificate_authority(mut self, ca: KeyPair) -> Self {
        self.ca = Some(ca);
        self
    }

    /// Actuator settings
    pub fn config(mut self, config: ActuatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the actuator
    ///
    /// Fails when a collaborator is neither set nor derivable, or when the
    /// configured CA or setup config files cannot be loaded.
    pub fn build(self) -> Result<MachineActuator> {
        self.config.validate()?;

        let store: Arc<dyn MachineStore> = match (self.store, &self.client) {
            (Some(store), _) => store,
            (None, Some(client)) => Arc::new(KubeMachineStore::new(client.clone())),
            (None, None) => {
                return Err(Error::validation(
                    "a machine store or kubernetes client is required",
                ))
            }
        };

        let tokens: Arc<dyn TokenIssuer> = match (self.tokens, &self.client) {
            (Some(tokens), _) => tokens,
            (None, Some(client)) => Arc::new(KubeTokenIssuer::new(
                client.clone(),
                self.config.token_namespace.clone(),
                self.config.token_ttl(),
            )),
            (None, None) => {
                return Err(Error::validation(
                    "a token issuer or kubernetes client is required",
                ))
            }
        };

        let setup_path = &self.config.machine_setup_configs;
        let setup: Arc<dyn MachineSetupConfig> = match (self.setup, setup_path) {
            (Some(setup), _) => setup,
            (None, Some(path)) => Arc::new(ValidConfigs::from_file(path)?),
            (None, None) => {
                return Err(Error::validation(
                    "machine setup configs or machineSetupConfigs path is required",
                ))
            }
        };

        let ca = match (self.ca, &self.config.ca_dir) {
            (Some(ca), _) => Some(ca),
            (None, Some(dir)) => Some(KeyPair::load_ca(dir)?),
            (None, None) => None,
        };
        if ca.is_none() {
            warn!("no certificate authority configured; control planes will generate their own");
        }

        Ok(MachineActuator {
            compute: self.compute,
            store,
            metadata: MetadataBuilder::new(setup, tokens, &self.config).with_ca(ca),
            retry: self.config.operation_retry(),
            config: self.config,
        })
    }
}
