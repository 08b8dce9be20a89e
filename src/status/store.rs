//! Persistence for Machine records
//!
//! The record store is the only storage the actuator has. Writes are
//! optimistic: a stale `resourceVersion` comes back as a conflict.

use async_trait::async_trait;
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::Machine;
use crate::Error;

/// Read and replace Machine records
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MachineStore: Send + Sync {
    /// Fetch a machine, returning `None` when it does not exist
    async fn get_if_exists(&self, namespace: &str, name: &str) -> Result<Option<Machine>, Error>;

    /// Replace a machine, returning the persisted record
    ///
    /// Fails with [`Error::Conflict`] when the record changed since it was read.
    async fn update(&self, machine: &Machine) -> Result<Machine, Error>;
}

/// Machine store backed by the Kubernetes API
pub struct KubeMachineStore {
    client: Client,
}

impl KubeMachineStore {
    /// Create a store wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MachineStore for KubeMachineStore {
    async fn get_if_exists(&self, namespace: &str, name: &str) -> Result<Option<Machine>, Error> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn update(&self, machine: &Machine) -> Result<Machine, Error> {
        let namespace = machine.namespace().unwrap_or_default();
        let name = machine.name_any();
        let api: Api<Machine> = Api::namespaced(self.client.clone(), &namespace);

        match api.replace(&name, &PostParams::default(), machine).await {
            Ok(updated) => {
                debug!(machine = %updated.identity(), "machine record replaced");
                Ok(updated)
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(Error::Conflict { namespace, name }),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Err(Error::record_gone(namespace, name)),
            Err(e) => Err(e.into()),
        }
    }
}
