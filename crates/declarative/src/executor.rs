//! Reconciler - converges the platform to the declared graph
//!
//! Included nodes run wave by wave on a bounded rayon pool: a node starts
//! only once every dependency has a terminal outcome for this run. A failed
//! node takes its transitive dependents down with it (they are skipped);
//! independent branches keep going. Excluded and orphaned records are
//! destroyed afterwards, dependents first.

use chrono::Utc;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::context::{ProgressCallback, ResourceBackend, StateStore};
use crate::diff::{decide, drifted_fields, resolve_attributes};
use crate::error::{EngineError, NodeError, NodeFailure};
use crate::planner::{destroy_candidates, validate};
use crate::registry;
use crate::retry::with_retry;
use crate::store::lock_unpoisoned;
use crate::types::{
    Action, AttributeRef, Attributes, ExecuteOptions, NodeStatus, ResourceKind, ResourceSpec,
    ResourceState, RunReport, Status, Variables,
};

/// Result of running one node on a worker
struct NodeRun {
    id: String,
    action: Option<Action>,
    result: Result<(), NodeFailure>,
}

/// Shared, read-mostly context for the workers of one run
struct Reconciler<'a> {
    store: &'a dyn StateStore,
    backend: &'a dyn ResourceBackend,
    opts: &'a ExecuteOptions,
    /// State of every node that converged in this run, as references see it
    applied: Mutex<HashMap<String, ResourceState>>,
}

/// Reconcile `specs` against `store` through `backend`.
///
/// Validation problems are returned as [`EngineError::Validation`] before
/// any backend call or state write. Node-level failures do not abort the
/// run; they are listed in the returned [`RunReport`].
pub fn apply<P: ProgressCallback>(
    specs: &[ResourceSpec],
    variables: &Variables,
    store: &dyn StateStore,
    backend: &dyn ResourceBackend,
    opts: &ExecuteOptions,
    progress: &mut P,
) -> Result<RunReport, EngineError> {
    let (resolution, graph) = validate(specs, variables)?;
    let doomed = destroy_candidates(specs, &resolution, store)?;
    if graph.is_empty() && doomed.is_empty() {
        log::info!("nothing to reconcile");
        return Ok(RunReport::default());
    }
    // Read before any side effect so the destroy phase cannot fail the run
    let prior_dependencies = if doomed.is_empty() {
        HashMap::new()
    } else {
        recorded_dependencies(graph.order(), store)?
    };

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(opts.jobs.max(1))
        .build()
        .map_err(|e| EngineError::Pool(e.to_string()))?;

    let by_id: HashMap<&str, &ResourceSpec> = specs.iter().map(|s| (s.id.as_str(), s)).collect();
    let reconciler = Reconciler {
        store,
        backend,
        opts,
        applied: Mutex::new(HashMap::new()),
    };
    let mut report = RunReport::default();
    let mut outcomes: HashMap<String, bool> = HashMap::new();

    log::info!(
        "applying {} nodes in {} waves ({} to destroy)",
        graph.len(),
        graph.waves().len(),
        doomed.len()
    );

    for (index, wave) in graph.waves().iter().enumerate() {
        progress.on_wave_start(index, wave);

        let mut eligible = Vec::with_capacity(wave.len());
        for id in wave {
            let blocked = graph
                .dependencies(id)
                .into_iter()
                .find(|dep| !outcomes.get(dep).copied().unwrap_or(false));
            match blocked {
                Some(dep) => {
                    let status = NodeStatus::Skipped {
                        reason: format!("dependency {dep} did not converge"),
                    };
                    log::warn!("{id}: skipped, dependency {dep} did not converge");
                    progress.on_node_complete(id, &status);
                    report.record(id, by_id[id.as_str()].kind, status);
                    outcomes.insert(id.clone(), false);
                }
                None => eligible.push((by_id[id.as_str()], graph.dependencies(id))),
            }
        }

        let runs: Vec<NodeRun> = pool.install(|| {
            eligible
                .par_iter()
                .map(|(spec, deps)| reconciler.reconcile(spec, deps))
                .collect()
        });

        for run in runs {
            let kind = by_id[run.id.as_str()].kind;
            let status = finish(&mut report, &run, |action| NodeStatus::Applied { action });
            if let Some(action) = run.action {
                progress.on_node_planned(&run.id, action);
            }
            progress.on_node_complete(&run.id, &status);
            outcomes.insert(run.id.clone(), status.is_success());
            report.record(&run.id, kind, status);
        }

        progress.on_wave_complete();
    }

    let holders: HashMap<String, Vec<String>> = prior_dependencies
        .into_iter()
        .filter(|(id, _)| !outcomes.get(id).copied().unwrap_or(false))
        .collect();
    destroy_phase(&reconciler, &pool, doomed, &holders, &mut report, progress);

    if report.is_success() {
        log::info!("run converged: {} changes", report.summary.total_changes());
    } else {
        log::warn!(
            "run finished with {} failed and {} skipped nodes",
            report.summary.failed,
            report.summary.skipped
        );
    }
    Ok(report)
}

/// [`apply`] without progress reporting
pub fn apply_simple(
    specs: &[ResourceSpec],
    variables: &Variables,
    store: &dyn StateStore,
    backend: &dyn ResourceBackend,
    opts: &ExecuteOptions,
) -> Result<RunReport, EngineError> {
    use crate::context::NoProgress;

    apply(specs, variables, store, backend, opts, &mut NoProgress)
}

/// Turn a worker result into a status, recording the error if any
fn finish(report: &mut RunReport, run: &NodeRun, on_success: impl FnOnce(Action) -> NodeStatus) -> NodeStatus {
    match &run.result {
        Ok(()) => on_success(run.action.unwrap_or(Action::NoOp)),
        Err(cause) => {
            log::error!("{}: {cause}", run.id);
            report.errors.push(NodeError {
                id: run.id.clone(),
                action: run.action,
                cause: cause.clone(),
            });
            NodeStatus::Failed {
                reason: cause.to_string(),
            }
        }
    }
}

/// Dependencies recorded in state for each of `ids` that has a record
fn recorded_dependencies(ids: &[String], store: &dyn StateStore) -> Result<HashMap<String, Vec<String>>, EngineError> {
    let mut recorded = HashMap::new();
    for id in ids {
        if let Some(state) = store.get(id)? {
            recorded.insert(id.clone(), state.dependencies);
        }
    }
    Ok(recorded)
}

/// Destroy excluded and orphaned records, dependents before dependencies.
///
/// A record is kept, and reported skipped, while one of `holders` (included
/// nodes that did not converge, with the dependencies recorded before the
/// run) or a record whose destroy did not happen still depends on it.
fn destroy_phase<P: ProgressCallback>(
    reconciler: &Reconciler<'_>,
    pool: &rayon::ThreadPool,
    doomed: Vec<ResourceState>,
    holders: &HashMap<String, Vec<String>>,
    report: &mut RunReport,
    progress: &mut P,
) {
    if doomed.is_empty() {
        return;
    }

    // Recorded dependencies of each doomed record, for records whose destroy
    // did not happen
    let recorded: HashMap<String, Vec<String>> = doomed
        .iter()
        .map(|s| (s.id.clone(), s.dependencies.clone()))
        .collect();
    let mut remaining = doomed;
    let mut blocked: HashSet<String> = HashSet::new();
    let mut index = 0;

    while !remaining.is_empty() {
        let mut ready: Vec<&ResourceState> = remaining
            .iter()
            .filter(|s| {
                !remaining
                    .iter()
                    .any(|other| other.id != s.id && other.dependencies.contains(&s.id))
            })
            .collect();
        if ready.is_empty() {
            // Recorded dependencies form a cycle; take them all at once
            ready = remaining.iter().collect();
        }
        let ready_ids: Vec<String> = ready.iter().map(|s| s.id.clone()).collect();
        progress.on_wave_start(index, &ready_ids);

        let mut runnable = Vec::with_capacity(ready.len());
        for state in ready {
            let holder = holders
                .iter()
                .chain(blocked.iter().filter_map(|id| recorded.get_key_value(id)))
                .find(|(_, deps)| deps.contains(&state.id))
                .map(|(id, _)| id.clone());
            match holder {
                Some(holder) => {
                    let status = NodeStatus::Skipped {
                        reason: format!("{holder} still depends on it"),
                    };
                    log::warn!("{}: not destroyed, {holder} still depends on it", state.id);
                    progress.on_node_complete(&state.id, &status);
                    report.record(&state.id, state.kind, status);
                    blocked.insert(state.id.clone());
                }
                None => runnable.push(state),
            }
        }

        let runs: Vec<(NodeRun, ResourceKind)> = pool.install(|| {
            runnable
                .par_iter()
                .map(|state| (reconciler.retire(state), state.kind))
                .collect()
        });

        for (run, kind) in runs {
            let status = finish(report, &run, |_| NodeStatus::Destroyed);
            progress.on_node_planned(&run.id, Action::Destroy);
            progress.on_node_complete(&run.id, &status);
            if !status.is_success() {
                blocked.insert(run.id.clone());
            }
            report.record(&run.id, kind, status);
        }
        progress.on_wave_complete();

        remaining.retain(|s| !ready_ids.contains(&s.id));
        index += 1;
    }
}

impl Reconciler<'_> {
    /// Converge one included node
    fn reconcile(&self, spec: &ResourceSpec, dependencies: &[String]) -> NodeRun {
        let mut action = None;
        let result = self.converge(spec, dependencies, &mut action);
        NodeRun {
            id: spec.id.clone(),
            action,
            result,
        }
    }

    fn converge(
        &self,
        spec: &ResourceSpec,
        dependencies: &[String],
        action: &mut Option<Action>,
    ) -> Result<(), NodeFailure> {
        let desired = {
            let applied = lock_unpoisoned(&self.applied);
            resolve_attributes(&spec.attributes, |r: &AttributeRef| {
                applied
                    .get(&r.resource_id)
                    .filter(|s| s.status == Status::Applied)
                    .and_then(|s| s.field(&r.field))
                    .ok_or_else(|| NodeFailure::UnresolvedReference {
                        target: r.resource_id.clone(),
                        field: r.field.clone(),
                    })
            })?
        };

        let _guard = self.store.lock(&spec.id, self.opts.lock_timeout)?;
        let mut prior = self.store.get(&spec.id)?;
        if self.opts.refresh {
            prior = self.refresh(prior)?;
        }

        let diff = decide(&spec.id, spec.kind, prior.as_ref(), &desired);
        *action = Some(diff.action);

        let state = match (diff.action, prior) {
            (Action::NoOp, Some(prior)) => self.keep(prior, dependencies)?,
            (Action::Update, Some(prior)) => self.update(spec, &prior, desired, dependencies)?,
            (Action::Replace, Some(prior)) => {
                self.destroy(&prior)?;
                self.create(spec, desired, dependencies)?
            }
            // Create; decide() only picks other actions for a live prior
            _ => self.create(spec, desired, dependencies)?,
        };

        lock_unpoisoned(&self.applied).insert(spec.id.clone(), state);
        Ok(())
    }

    /// Compare a live record with what the platform reports.
    ///
    /// A vanished resource becomes `Absent`; drift on an immutable field
    /// taints the record; drift on mutable fields is adopted so the diff
    /// sees it. Any change is persisted.
    fn refresh(&self, prior: Option<ResourceState>) -> Result<Option<ResourceState>, NodeFailure> {
        let Some(mut prior) = prior else {
            return Ok(None);
        };
        let Some(backend_id) = prior.backend_id.clone().filter(|_| prior.is_live()) else {
            return Ok(Some(prior));
        };

        let provider = self.backend.require(prior.kind)?;
        let label = format!("read {}", prior.id);
        let observed = match with_retry(&self.opts.retry, &label, || provider.read(&backend_id)) {
            Ok(observed) => observed,
            Err(e) if e.is_not_found() => {
                log::warn!("{}: no longer exists on the platform", prior.id);
                let absent = prior.absent();
                self.store.put(absent.clone())?;
                return Ok(Some(absent));
            }
            Err(e) => return Err(e.into()),
        };

        let drifted = drifted_fields(&prior.attributes, &observed);
        let stale_outputs: Vec<String> = drifted_fields(&prior.outputs, &observed);
        if drifted.is_empty() && stale_outputs.is_empty() {
            return Ok(Some(prior));
        }

        if drifted.iter().any(|f| registry::is_immutable(prior.kind, f)) {
            log::warn!("{}: drifted on {}, marking tainted", prior.id, drifted.join(", "));
            prior.status = Status::Tainted;
        } else if !drifted.is_empty() {
            log::info!("{}: drifted on {}", prior.id, drifted.join(", "));
        }
        for field in &drifted {
            prior.attributes.insert(field.clone(), observed[field].clone());
        }
        for field in &stale_outputs {
            prior.outputs.insert(field.clone(), observed[field].clone());
        }
        prior.updated_at = Utc::now();
        self.store.put(prior.clone())?;
        Ok(Some(prior))
    }

    /// No-op: keep the record, refreshing its recorded dependencies
    fn keep(&self, mut prior: ResourceState, dependencies: &[String]) -> Result<ResourceState, NodeFailure> {
        if prior.dependencies != dependencies {
            prior.dependencies = dependencies.to_vec();
            prior.updated_at = Utc::now();
            self.store.put(prior.clone())?;
        }
        Ok(prior)
    }

    fn create(
        &self,
        spec: &ResourceSpec,
        desired: Attributes,
        dependencies: &[String],
    ) -> Result<ResourceState, NodeFailure> {
        let provider = self.backend.require(spec.kind)?;
        let label = format!("create {}", spec.id);
        let created = with_retry(&self.opts.retry, &label, || provider.create(&desired))?;
        log::info!("{}: created {}", spec.id, created.backend_id);

        let state = ResourceState {
            id: spec.id.clone(),
            kind: spec.kind,
            status: Status::Applied,
            backend_id: Some(created.backend_id),
            attributes: desired,
            outputs: created.outputs,
            dependencies: dependencies.to_vec(),
            updated_at: Utc::now(),
        };
        self.store.put(state.clone())?;
        Ok(state)
    }

    fn update(
        &self,
        spec: &ResourceSpec,
        prior: &ResourceState,
        desired: Attributes,
        dependencies: &[String],
    ) -> Result<ResourceState, NodeFailure> {
        let provider = self.backend.require(spec.kind)?;
        let backend_id = prior.backend_id.clone().unwrap_or_default();
        let label = format!("update {}", spec.id);
        let outputs = with_retry(&self.opts.retry, &label, || provider.update(&backend_id, &desired))?;
        log::info!("{}: updated {backend_id}", spec.id);

        let state = ResourceState {
            attributes: desired,
            outputs,
            dependencies: dependencies.to_vec(),
            updated_at: Utc::now(),
            ..prior.clone()
        };
        self.store.put(state.clone())?;
        Ok(state)
    }

    /// Delete a live record's resource and mark it `Absent`.
    ///
    /// A resource the platform no longer knows counts as deleted.
    fn destroy(&self, prior: &ResourceState) -> Result<(), NodeFailure> {
        if let Some(backend_id) = prior.backend_id.as_deref() {
            let provider = self.backend.require(prior.kind)?;
            let label = format!("destroy {}", prior.id);
            match with_retry(&self.opts.retry, &label, || provider.destroy(backend_id)) {
                Ok(()) => log::info!("{}: destroyed {backend_id}", prior.id),
                Err(e) if e.is_not_found() => log::debug!("{}: already gone", prior.id),
                Err(e) => return Err(e.into()),
            }
        }
        self.store.put(prior.absent())?;
        Ok(())
    }

    /// Destroy a record that is no longer part of the desired topology
    fn retire(&self, doomed: &ResourceState) -> NodeRun {
        let result = (|| -> Result<(), NodeFailure> {
            let _guard = self.store.lock(&doomed.id, self.opts.lock_timeout)?;
            // Another run may have got here first
            match self.store.get(&doomed.id)? {
                Some(current) if current.is_live() => self.destroy(&current),
                _ => Ok(()),
            }
        })();
        NodeRun {
            id: doomed.id.clone(),
            action: Some(Action::Destroy),
            result,
        }
    }
}
