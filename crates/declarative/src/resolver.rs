//! Conditional resolution - decides which nodes take part in a run
//!
//! Presence is an explicit condition on every node, so pruning is a pure
//! filter over the declared specs. Conditions only see literal variables,
//! never outputs of resources that have not been applied yet.

use std::collections::{BTreeSet, HashMap};

use crate::error::ValidationError;
use crate::types::{ResourceSpec, Variables};

/// Partition of the declared nodes for one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Included ids, in declaration order
    pub included: Vec<String>,
    /// Excluded ids, in declaration order
    pub excluded: Vec<String>,
}

impl Resolution {
    /// Included ids as a set
    pub fn included_set(&self) -> BTreeSet<&str> {
        self.included.iter().map(String::as_str).collect()
    }
}

/// Evaluate every node's condition and check the included subgraph is closed.
///
/// Fails on duplicate ids, references or `depends_on` to undeclared ids,
/// missing or ill-typed variables, and on an included node referencing an
/// excluded node's attributes. The first offending pair in declaration order
/// is reported, so the result does not depend on evaluation order.
pub fn resolve(specs: &[ResourceSpec], variables: &Variables) -> Result<Resolution, ValidationError> {
    let mut declared: HashMap<&str, usize> = HashMap::with_capacity(specs.len());
    for (index, spec) in specs.iter().enumerate() {
        if declared.insert(spec.id.as_str(), index).is_some() {
            return Err(ValidationError::DuplicateId {
                id: spec.id.clone(),
            });
        }
    }

    for spec in specs {
        let targets = spec
            .references()
            .into_iter()
            .map(|r| r.resource_id.as_str())
            .chain(spec.depends_on.iter().map(String::as_str));
        for target in targets {
            if !declared.contains_key(target) {
                return Err(ValidationError::UnknownReference {
                    from: spec.id.clone(),
                    to: target.to_string(),
                });
            }
        }
    }

    let mut resolution = Resolution::default();
    let mut included = vec![false; specs.len()];
    for (index, spec) in specs.iter().enumerate() {
        if spec.included.evaluate(&spec.id, variables)? {
            included[index] = true;
            resolution.included.push(spec.id.clone());
        } else {
            resolution.excluded.push(spec.id.clone());
        }
    }

    for (index, spec) in specs.iter().enumerate() {
        if !included[index] {
            continue;
        }
        for reference in spec.references() {
            let target = declared[reference.resource_id.as_str()];
            if !included[target] {
                return Err(ValidationError::DanglingReference {
                    from: spec.id.clone(),
                    to: reference.resource_id.clone(),
                });
            }
        }
    }

    log::debug!(
        "resolved {} included, {} excluded nodes",
        resolution.included.len(),
        resolution.excluded.len()
    );
    Ok(resolution)
}
