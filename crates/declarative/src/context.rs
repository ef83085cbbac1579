//! Collaborator traits
//!
//! The engine never talks to a platform or a storage system directly.
//! Callers supply a [`StateStore`] and a [`ResourceBackend`]; progress
//! reporting goes through [`ProgressCallback`].

use std::fmt;
use std::time::Duration;

use crate::error::{BackendError, StoreError};
use crate::types::{Action, Attributes, NodeStatus, ResourceKind, ResourceState};

/// Scoped ownership of one resource's state lock.
///
/// The lock is released when the guard is dropped, on every exit path.
pub struct LockGuard<'a> {
    id: String,
    release: Option<Box<dyn FnOnce() + Send + 'a>>,
}

impl<'a> LockGuard<'a> {
    /// Create a guard that runs `release` when dropped
    pub fn new(id: impl Into<String>, release: impl FnOnce() + Send + 'a) -> Self {
        Self {
            id: id.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for LockGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").field("id", &self.id).finish()
    }
}

/// Durable record of last-applied resources, keyed by logical id
///
/// Implementations must serialize access per id through [`lock`](Self::lock)
/// so overlapping runs never reconcile the same resource at once.
pub trait StateStore: Send + Sync {
    /// Last recorded state, `None` if the id was never applied
    fn get(&self, id: &str) -> Result<Option<ResourceState>, StoreError>;

    /// Record the state of a resource
    fn put(&self, state: ResourceState) -> Result<(), StoreError>;

    /// Acquire the exclusive section for `id`, waiting at most `timeout`
    fn lock(&self, id: &str, timeout: Duration) -> Result<LockGuard<'_>, StoreError>;

    /// Every id with a record, in a stable order
    fn ids(&self) -> Result<Vec<String>, StoreError>;
}

/// What the platform returns for a newly created resource
#[derive(Debug, Clone, PartialEq)]
pub struct Created {
    pub backend_id: String,
    pub outputs: Attributes,
}

/// Platform capability for one resource kind
pub trait ResourceProvider: Send + Sync {
    /// Create a resource, returning its handle and outputs
    fn create(&self, attributes: &Attributes) -> Result<Created, BackendError>;

    /// Update a resource in place, returning its outputs
    fn update(&self, backend_id: &str, attributes: &Attributes) -> Result<Attributes, BackendError>;

    /// Delete a resource
    fn destroy(&self, backend_id: &str) -> Result<(), BackendError>;

    /// Observe a resource.
    ///
    /// Returns the values the platform reports for it (attributes and
    /// outputs), or [`BackendError::NotFound`] if it no longer exists.
    fn read(&self, backend_id: &str) -> Result<Attributes, BackendError>;
}

/// The provisioning platform: one [`ResourceProvider`] per kind
pub trait ResourceBackend: Send + Sync {
    fn provider(&self, kind: ResourceKind) -> Option<&dyn ResourceProvider>;

    /// Provider for `kind`, or a permanent error if the platform has none
    fn require(&self, kind: ResourceKind) -> Result<&dyn ResourceProvider, BackendError> {
        self.provider(kind)
            .ok_or_else(|| BackendError::permanent(format!("no provider for {kind}")))
    }
}

/// Progress callback for execution operations
///
/// Implement this trait to receive progress updates during execution.
pub trait ProgressCallback: Send {
    /// Called when a wave of nodes becomes eligible
    fn on_wave_start(&mut self, index: usize, ids: &[String]);

    /// Called with the action a node ran, just before its completion
    fn on_node_planned(&mut self, id: &str, action: Action);

    /// Called when a node reaches its final status
    fn on_node_complete(&mut self, id: &str, status: &NodeStatus);

    /// Called when a wave completes
    fn on_wave_complete(&mut self);
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_wave_start(&mut self, _index: usize, _ids: &[String]) {}
    fn on_node_planned(&mut self, _id: &str, _action: Action) {}
    fn on_node_complete(&mut self, _id: &str, _status: &NodeStatus) {}
    fn on_wave_complete(&mut self) {}
}
