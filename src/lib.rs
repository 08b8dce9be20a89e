//! GCE machine actuator - reconciles cluster Machines onto compute instances
//!
//! The actuator turns `cluster.k8s.io/v1alpha1` Machine records into running
//! compute instances that boot into Kubernetes nodes.
//!
//! # Architecture
//!
//! A reconcile pass for one Machine:
//! - decodes the GCE provider specs carried by the Cluster and Machine
//! - builds boot metadata: a role-specific startup script, a join token for
//!   workers, CA and API server certificates for control planes
//! - inserts the instance and waits for the zone operation to finish
//! - records the observed Machine in its own `instance-status` annotation
//!
//! # Modules
//!
//! - [`actuator`] - Create, delete, update and reconcile entry points
//! - [`bootstrap`] - Startup scripts, setup configs, join tokens, metadata
//! - [`compute`] - Compute provider boundary and operation polling
//! - [`config`] - Actuator settings loaded from YAML
//! - [`crd`] - Machine and Cluster records and their provider specs
//! - [`pki`] - Certificate authority and server certificate issuance
//! - [`status`] - Instance status annotation codec and record store
//! - [`retry`] - Exponential backoff helper
//! - [`telemetry`] - Tracing subscriber setup
//! - [`error`] - Error types for the actuator

#![deny(missing_docs)]

pub mod actuator;
pub mod bootstrap;
pub mod compute;
pub mod config;
pub mod crd;
pub mod error;
pub mod pki;
pub mod retry;
pub mod status;
pub mod telemetry;

pub use actuator::{MachineActuator, MachineActuatorBuilder, Outcome};
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
