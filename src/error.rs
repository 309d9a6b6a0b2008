//! Error types for the modelsync operator
//!
//! The reconcile loop never terminates on an error; every variant here is
//! either a whole-tick failure (registry errors, the tick is skipped and the
//! previously committed state stands) or a per-model failure (apply/remove,
//! logged and isolated to that model). `skips_tick` encodes the split.

use thiserror::Error;

use crate::registry::DeploymentId;

/// Main error type for modelsync operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The registry could not be queried at all
    #[error("registry unreachable: {0}")]
    RegistryUnreachable(String),

    /// The registry answered with data that cannot be mapped to a deployment
    #[error("registry returned malformed data: {0}")]
    RegistryMalformed(String),

    /// The deployment backend rejected an apply for one model
    #[error("apply failed for {id}: {cause}")]
    ApplyFailed {
        /// Identity of the deployment that failed to apply
        id: DeploymentId,
        /// Opaque backend cause
        cause: String,
    },

    /// The deployment backend rejected a delete for one model
    #[error("remove failed for {id}: {cause}")]
    RemoveFailed {
        /// Identity of the deployment that failed to delete
        id: DeploymentId,
        /// Opaque backend cause
        cause: String,
    },

    /// The status server could not be started
    #[error("status server error: {0}")]
    StatusServer(String),

    /// Invalid process configuration, caught at startup
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a registry-unreachable error from any displayable cause
    pub fn registry_unreachable(cause: impl ToString) -> Self {
        Self::RegistryUnreachable(cause.to_string())
    }

    /// Create a malformed-registry-data error with the given message
    pub fn registry_malformed(msg: impl Into<String>) -> Self {
        Self::RegistryMalformed(msg.into())
    }

    /// Create an apply failure for the given deployment
    pub fn apply_failed(id: DeploymentId, cause: impl ToString) -> Self {
        Self::ApplyFailed {
            id,
            cause: cause.to_string(),
        }
    }

    /// Create a remove failure for the given deployment
    pub fn remove_failed(id: DeploymentId, cause: impl ToString) -> Self {
        Self::RemoveFailed {
            id,
            cause: cause.to_string(),
        }
    }

    /// Create a status server error with the given message
    pub fn status_server(msg: impl Into<String>) -> Self {
        Self::StatusServer(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error invalidates the whole tick rather than one model
    ///
    /// Registry errors poison the snapshot, so the loop discards the tick and
    /// keeps the previously committed state. Apply/remove failures only affect
    /// their own deployment and never block the rest of the tick.
    pub fn skips_tick(&self) -> bool {
        matches!(
            self,
            Error::RegistryUnreachable(_) | Error::RegistryMalformed(_)
        )
    }

    /// Identity of the deployment this error is about, if any
    pub fn deployment(&self) -> Option<&DeploymentId> {
        match self {
            Error::ApplyFailed { id, .. } | Error::RemoveFailed { id, .. } => Some(id),
            _ => None,
        }
    }
}
