//! Execution planner - previews what a run would do
//!
//! Planning reads state but never calls the backend or writes anything.
//! Values that only exist once a dependency is created or replaced are
//! "known after apply" and count as changed.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::context::StateStore;
use crate::diff::{decide, resolve_value};
use crate::error::{EngineError, ValidationError};
use crate::graph::DependencyGraph;
use crate::resolver::{Resolution, resolve};
use crate::types::{Action, AttributeRef, Attributes, ResourceKind, ResourceSpec, ResourceState, Variables};

/// Resolve conditions and build the ordered graph.
///
/// Pure: everything a run needs before it may touch anything.
pub fn validate(
    specs: &[ResourceSpec],
    variables: &Variables,
) -> Result<(Resolution, DependencyGraph), ValidationError> {
    let resolution = resolve(specs, variables)?;
    let graph = DependencyGraph::build(specs, &resolution)?;
    Ok((resolution, graph))
}

/// Planned action for one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedChange {
    pub id: String,
    pub kind: ResourceKind,
    pub action: Action,
    /// Changed field names, sorted
    pub changed: Vec<String>,
    /// Fields whose value is only known after apply
    pub unknown: Vec<String>,
}

/// Counts by action
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub replace: usize,
    pub destroy: usize,
    pub unchanged: usize,
}

impl PlanSummary {
    pub fn total_changes(&self) -> usize {
        self.create + self.update + self.replace + self.destroy
    }
}

/// A preview of a run
#[derive(Debug)]
pub struct Plan {
    pub resolution: Resolution,
    pub graph: DependencyGraph,
    /// Included nodes in apply order, then destroys
    pub changes: Vec<PlannedChange>,
}

impl Plan {
    pub fn order(&self) -> &[String] {
        self.graph.order()
    }

    pub fn waves(&self) -> &[Vec<String>] {
        self.graph.waves()
    }

    pub fn change(&self, id: &str) -> Option<&PlannedChange> {
        self.changes.iter().find(|c| c.id == id)
    }

    pub fn action(&self, id: &str) -> Option<Action> {
        self.change(id).map(|c| c.action)
    }

    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for change in &self.changes {
            match change.action {
                Action::Create => summary.create += 1,
                Action::Update => summary.update += 1,
                Action::Replace => summary.replace += 1,
                Action::Destroy => summary.destroy += 1,
                Action::NoOp => summary.unchanged += 1,
            }
        }
        summary
    }

    pub fn has_changes(&self) -> bool {
        self.changes.iter().any(|c| c.action.is_change())
    }
}

/// Live records that a run would destroy: excluded nodes and ids that are
/// no longer declared at all, excluded first in declaration order
pub fn destroy_candidates(
    specs: &[ResourceSpec],
    resolution: &Resolution,
    store: &dyn StateStore,
) -> Result<Vec<ResourceState>, EngineError> {
    let declared: HashSet<&str> = specs.iter().map(|s| s.id.as_str()).collect();
    let mut doomed = Vec::new();

    let orphans = store.ids()?.into_iter().filter(|id| !declared.contains(id.as_str()));
    for id in resolution.excluded.iter().cloned().chain(orphans) {
        if let Some(state) = store.get(&id)?
            && state.is_live()
        {
            doomed.push(state);
        }
    }
    Ok(doomed)
}

/// Preview the actions a run would take against `store`
pub fn plan(specs: &[ResourceSpec], variables: &Variables, store: &dyn StateStore) -> Result<Plan, EngineError> {
    let (resolution, graph) = validate(specs, variables)?;
    let by_id: HashMap<&str, &ResourceSpec> = specs.iter().map(|s| (s.id.as_str(), s)).collect();

    let mut changes = Vec::with_capacity(graph.len());
    let mut planned: HashMap<String, Action> = HashMap::new();
    let mut stored: HashMap<String, Option<ResourceState>> = HashMap::new();

    for id in graph.order() {
        let spec = by_id[id.as_str()];
        let prior = store.get(id)?;

        let mut desired = Attributes::new();
        let mut unknown = Vec::new();
        for (name, value) in &spec.attributes {
            let resolved = resolve_value(value, &mut |r: &AttributeRef| {
                if matches!(planned.get(&r.resource_id), Some(Action::Create | Action::Replace)) {
                    return Err(());
                }
                stored
                    .get(&r.resource_id)
                    .and_then(Option::as_ref)
                    .and_then(|state| state.field(&r.field))
                    .ok_or(())
            });
            match resolved {
                Ok(v) => {
                    desired.insert(name.clone(), v);
                }
                Err(()) => {
                    // An unresolved reference never equals a stored value,
                    // so the field shows up as changed.
                    desired.insert(name.clone(), value.clone());
                    unknown.push(name.clone());
                }
            }
        }

        let diff = decide(id, spec.kind, prior.as_ref(), &desired);
        planned.insert(id.clone(), diff.action);
        stored.insert(id.clone(), prior);
        changes.push(PlannedChange {
            id: id.clone(),
            kind: spec.kind,
            action: diff.action,
            changed: diff.changed,
            unknown,
        });
    }

    for state in destroy_candidates(specs, &resolution, store)? {
        changes.push(PlannedChange {
            id: state.id.clone(),
            kind: state.kind,
            action: Action::Destroy,
            changed: Vec::new(),
            unknown: Vec::new(),
        });
    }

    Ok(Plan {
        resolution,
        graph,
        changes,
    })
}
