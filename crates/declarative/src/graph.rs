//! Dependency graph for included resources
//!
//! Edges come from attribute references and explicit `depends_on`.
//! Uses petgraph for storage and strongly connected components; the
//! topological sort is done here so ties follow declaration order.

use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use crate::error::ValidationError;
use crate::resolver::Resolution;
use crate::types::ResourceSpec;

/// Ordered dependency graph over the included nodes of a run
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// Edge direction: dependency -> dependent
    graph: DiGraph<String, ()>,
    node_map: HashMap<String, NodeIndex>,
    order: Vec<String>,
    waves: Vec<Vec<String>>,
}

impl DependencyGraph {
    /// Build the graph for the included nodes of `resolution`.
    ///
    /// Node indices follow declaration order, which is what ties are broken
    /// by. `depends_on` edges to excluded nodes are dropped. Fails with
    /// [`ValidationError::Cycle`] if the included subgraph has a cycle.
    pub fn build(specs: &[ResourceSpec], resolution: &Resolution) -> Result<Self, ValidationError> {
        let included = resolution.included_set();
        let mut graph = DiGraph::new();
        let mut node_map = HashMap::new();

        for spec in specs.iter().filter(|s| included.contains(s.id.as_str())) {
            let idx = graph.add_node(spec.id.clone());
            node_map.insert(spec.id.clone(), idx);
        }

        for spec in specs.iter().filter(|s| included.contains(s.id.as_str())) {
            let to = node_map[&spec.id];
            let targets = spec
                .references()
                .into_iter()
                .map(|r| r.resource_id.as_str())
                .chain(spec.depends_on.iter().map(String::as_str));
            for target in targets {
                if let Some(&from) = node_map.get(target) {
                    graph.update_edge(from, to, ());
                }
            }
        }

        let mut dag = Self {
            graph,
            node_map,
            order: Vec::new(),
            waves: Vec::new(),
        };
        dag.order = dag.topological_order()?;
        dag.waves = dag.compute_waves();
        Ok(dag)
    }

    /// Kahn's algorithm with a min-heap on declaration index
    fn topological_order(&self) -> Result<Vec<String>, ValidationError> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|idx| self.graph.neighbors_directed(idx, Direction::Incoming).count())
            .collect();

        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(in_degree.len());
        while let Some(Reverse(i)) = ready.pop() {
            let idx = NodeIndex::new(i);
            order.push(self.graph[idx].clone());
            for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                in_degree[next.index()] -= 1;
                if in_degree[next.index()] == 0 {
                    ready.push(Reverse(next.index()));
                }
            }
        }

        if order.len() == self.graph.node_count() {
            return Ok(order);
        }

        let mut participants: Vec<NodeIndex> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0]))
            .flatten()
            .collect();
        participants.sort();

        Err(ValidationError::Cycle {
            participants: participants
                .into_iter()
                .map(|idx| self.graph[idx].clone())
                .collect(),
        })
    }

    fn compute_waves(&self) -> Vec<Vec<String>> {
        let mut level: HashMap<NodeIndex, usize> = HashMap::new();
        let mut waves: Vec<BTreeSet<NodeIndex>> = Vec::new();

        for id in &self.order {
            let idx = self.node_map[id];
            let wave = self
                .graph
                .neighbors_directed(idx, Direction::Incoming)
                .map(|dep| level[&dep] + 1)
                .max()
                .unwrap_or(0);
            level.insert(idx, wave);
            if waves.len() <= wave {
                waves.resize_with(wave + 1, BTreeSet::new);
            }
            waves[wave].insert(idx);
        }

        waves
            .into_iter()
            .map(|wave| wave.into_iter().map(|idx| self.graph[idx].clone()).collect())
            .collect()
    }

    /// Deterministic apply order: every node after all of its dependencies
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Level decomposition of [`order`](Self::order); nodes in the same wave
    /// have no edges between them
    pub fn waves(&self) -> &[Vec<String>] {
        &self.waves
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Direct dependencies of a node, in declaration order
    pub fn dependencies(&self, id: &str) -> Vec<String> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct dependents of a node, in declaration order
    pub fn dependents(&self, id: &str) -> Vec<String> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Every node that depends on `id`, directly or transitively
    pub fn transitive_dependents(&self, id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack = self.dependents(id);
        while let Some(next) = stack.pop() {
            if seen.insert(next.clone()) {
                stack.extend(self.dependents(&next));
            }
        }
        seen
    }

    fn neighbors(&self, id: &str, direction: Direction) -> Vec<String> {
        let Some(&idx) = self.node_map.get(id) else {
            return vec![];
        };
        let mut found: Vec<NodeIndex> = self.graph.neighbors_directed(idx, direction).collect();
        found.sort();
        found.into_iter().map(|i| self.graph[i].clone()).collect()
    }
}
