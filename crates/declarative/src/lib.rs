//! # Declarative
//!
//! An engine for declaring cloud resources and converging a platform to
//! match them.
//!
//! ## Core Concepts
//!
//! - **ResourceSpec**: A declared node: kind, attributes, inclusion condition
//! - **Value**: An attribute value; literals, references to other nodes'
//!   outputs, and secrets passed by name
//! - **Resolution**: Which nodes the current variables include
//! - **DependencyGraph**: Apply order and parallel waves of included nodes
//! - **Plan**: A side-effect-free preview of a run
//! - **apply**: The reconciler; creates, updates, replaces and destroys
//!
//! ## Example
//!
//! ```ignore
//! use declarative::{
//!     Condition, ExecuteOptions, MemoryStateStore, ResourceKind, ResourceSpec, Value,
//!     Variables, apply_simple,
//! };
//!
//! let specs = vec![
//!     ResourceSpec::new("rg", ResourceKind::ResourceGroup).attr("location", "eastus"),
//!     ResourceSpec::new("pip", ResourceKind::PublicAddress)
//!         .attr("resource_group", Value::reference("rg", "id"))
//!         .when(Condition::is_true("create_public_ip")),
//! ];
//! let vars = Variables::from([("create_public_ip".into(), Value::Bool(true))]);
//!
//! let store = MemoryStateStore::new();
//! let report = apply_simple(&specs, &vars, &store, &my_backend, &ExecuteOptions::default())?;
//! assert!(report.is_success());
//! ```
//!
//! ## Collaborator Traits
//!
//! - [`StateStore`]: Durable last-applied records with per-id locks
//! - [`ResourceBackend`]: One [`ResourceProvider`] per resource kind
//! - [`ProgressCallback`]: Receives progress updates
//!
//! The engine has no knowledge of any particular cloud API or storage
//! format.

pub mod context;
pub mod diff;
pub mod error;
pub mod executor;
pub mod graph;
pub mod planner;
pub mod registry;
pub mod resolver;
pub mod retry;
pub mod store;
pub mod types;

// Re-export main types at crate root
pub use context::{
    Created, LockGuard, NoProgress, ProgressCallback, ResourceBackend, ResourceProvider, StateStore,
};
pub use diff::{ResourceDiff, decide};
pub use error::{BackendError, EngineError, NodeError, NodeFailure, StoreError, ValidationError};
pub use executor::{apply, apply_simple};
pub use graph::DependencyGraph;
pub use planner::{Plan, PlanSummary, PlannedChange, plan, validate};
pub use resolver::{Resolution, resolve};
pub use retry::RetryConfig;
pub use store::MemoryStateStore;
pub use types::{
    Action, AttributeRef, Attributes, Condition, ExecuteOptions, ExecuteSummary, NodeReport,
    NodeStatus, ResourceKind, ResourceSpec, ResourceState, RunReport, SecretRef, Status, Value,
    Variables,
};
