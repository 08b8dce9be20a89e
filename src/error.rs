//! Error types for the GCE machine actuator

use thiserror::Error;

use crate::bootstrap::BootstrapError;
use crate::pki::PkiError;

/// Main error type for actuator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Certificate authority or key generation failure
    #[error("pki error: {0}")]
    Pki(#[from] PkiError),

    /// Bootstrap metadata could not be produced
    #[error("bootstrap error: {0}")]
    Bootstrap(#[from] BootstrapError),

    /// The instance-status annotation holds something that is not a Machine
    #[error("failed to decode instance status of machine {machine}: {message}")]
    Decode {
        /// `namespace/name` of the machine carrying the annotation
        machine: String,
        /// Underlying decoder message
        message: String,
    },

    /// A status snapshot could not be serialized
    #[error("failed to encode instance status of machine {machine}: {message}")]
    Encode {
        /// `namespace/name` of the machine being annotated
        machine: String,
        /// Underlying encoder message
        message: String,
    },

    /// The machine record was deleted before its status could be written
    #[error("machine {namespace}/{name} has already been deleted")]
    RecordGone {
        /// Namespace of the vanished machine
        namespace: String,
        /// Name of the vanished machine
        name: String,
    },

    /// The record store rejected a write made against a stale version
    #[error("machine {namespace}/{name} was modified concurrently")]
    Conflict {
        /// Namespace of the machine
        namespace: String,
        /// Name of the machine
        name: String,
    },

    /// The compute provider failed an instance operation
    #[error("{operation} failed for machine {machine}: {message}")]
    Provisioning {
        /// `namespace/name` of the machine being provisioned
        machine: String,
        /// Provider operation that failed (insert, delete, get, ...)
        operation: String,
        /// Provider message, verbatim
        message: String,
    },

    /// A zone operation did not reach DONE within the polling budget
    #[error("operation {name} still {status}")]
    OperationPending {
        /// Provider operation name
        name: String,
        /// Last observed operation status
        status: String,
    },

    /// Validation error for machine or cluster specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error outside the status codec
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a provisioning error for a machine and provider operation
    pub fn provisioning(
        machine: impl Into<String>,
        operation: impl Into<String>,
        message: impl std::fmt::Display,
    ) -> Self {
        Self::Provisioning {
            machine: machine.into(),
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Create a record-gone error for the given machine identity
    pub fn record_gone(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::RecordGone {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Returns true if retrying the same pass later could succeed
    ///
    /// A vanished record is terminal for the pass; a conflict or a
    /// slow provider operation is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Conflict { .. } | Self::OperationPending { .. } | Self::Kube(_) => true,
            Self::Provisioning { .. } => true,
            _ => false,
        }
    }
}
