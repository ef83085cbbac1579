//! Error types for resolution, planning and reconciliation.
//!
//! Validation errors are raised before anything touches the platform.
//! Backend and store errors are attached to the node they happened on and
//! only abort that node and its dependents.

use std::time::Duration;
use thiserror::Error;

use crate::types::Action;

/// Problems with the declared graph or its inputs.
///
/// A run that hits one of these makes no backend calls and writes no state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Two nodes share a logical id
    #[error("duplicate resource id: {id}")]
    DuplicateId { id: String },

    /// A reference or `depends_on` names a node that is not declared
    #[error("{from} references unknown resource {to}")]
    UnknownReference { from: String, to: String },

    /// An included node references the output of an excluded node
    #[error("{from} references {to}, which is excluded from this run")]
    DanglingReference { from: String, to: String },

    /// The included subgraph is not acyclic
    #[error("dependency cycle between: {}", .participants.join(", "))]
    Cycle { participants: Vec<String> },

    /// A condition names a variable that was not supplied
    #[error("{id}: variable {variable} is not defined")]
    UnresolvedVariable { id: String, variable: String },

    /// A variable is present but unusable
    #[error("invalid value for {variable}: {reason}")]
    InvalidVariable { variable: String, reason: String },
}

/// Failure reported by a [`ResourceProvider`](crate::ResourceProvider).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Rate limits, timeouts; worth retrying
    #[error("transient backend error: {message}")]
    Transient { message: String },

    /// Invalid attributes, quota exceeded; retrying will not help
    #[error("backend error: {message}")]
    Permanent { message: String },

    /// The platform has no resource with this handle
    #[error("not found: {backend_id}")]
    NotFound { backend_id: String },
}

impl BackendError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    /// Whether the error is typically transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Failure reported by a [`StateStore`](crate::StateStore).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The per-resource lock could not be acquired in time
    #[error("timed out after {timeout:?} waiting for state lock on {id}")]
    LockTimeout { id: String, timeout: Duration },

    /// Reading or writing the underlying storage failed
    #[error("state storage error: {0}")]
    Storage(String),
}

/// Why a single node did not converge
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeFailure {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// A reference target was not applied when the node ran.
    ///
    /// Indicates an ordering bug; correct graphs never produce it.
    #[error("unresolved reference to {target}.{field}")]
    UnresolvedReference { target: String, field: String },
}

impl NodeFailure {
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::Store(StoreError::LockTimeout { .. }))
    }
}

/// A node-level failure, as listed in a [`RunReport`](crate::RunReport)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{id}: {cause}")]
pub struct NodeError {
    pub id: String,
    pub action: Option<Action>,
    pub cause: NodeFailure,
}

/// Errors that abort a whole run
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("failed to read state: {0}")]
    Store(#[from] StoreError),

    #[error("failed to start worker pool: {0}")]
    Pool(String),
}

impl EngineError {
    pub fn as_validation(&self) -> Option<&ValidationError> {
        match self {
            Self::Validation(e) => Some(e),
            _ => None,
        }
    }
}
