//! Diff computation - what a node needs to converge

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::registry;
use crate::types::{Action, AttributeRef, Attributes, ResourceKind, ResourceState, Status, Value};

/// Decision for one node, with the fields that motivated it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDiff {
    pub id: String,
    pub kind: ResourceKind,
    pub action: Action,
    /// Changed field names, sorted
    pub changed: Vec<String>,
}

/// Decide how an included node converges from `prior` to `desired`.
///
/// `desired` must already be resolved. A record that is missing or not
/// live means create; a kind change or a tainted record means replace;
/// otherwise the changed fields and the registry pick between no-op,
/// in-place update and replace.
pub fn decide(id: &str, kind: ResourceKind, prior: Option<&ResourceState>, desired: &Attributes) -> ResourceDiff {
    let (action, changed) = match prior {
        Some(prior) if prior.is_live() => {
            let changed = changed_fields(&prior.attributes, desired);
            if prior.kind != kind {
                (Action::Replace, vec!["kind".to_string()])
            } else if prior.status == Status::Tainted {
                (Action::Replace, changed)
            } else if changed.is_empty() {
                (Action::NoOp, changed)
            } else if registry::can_update_in_place(kind, changed.iter().map(String::as_str)) {
                (Action::Update, changed)
            } else {
                (Action::Replace, changed)
            }
        }
        _ => (Action::Create, desired.keys().cloned().collect()),
    };

    log::debug!("{id}: {action} ({} changed)", changed.len());
    ResourceDiff {
        id: id.to_string(),
        kind,
        action,
        changed,
    }
}

/// Field names whose values differ between two attribute maps.
///
/// A field missing on one side compares equal to `Null`.
pub fn changed_fields(current: &Attributes, desired: &Attributes) -> Vec<String> {
    let mut fields: Vec<String> = current
        .keys()
        .chain(desired.keys())
        .filter(|field| {
            let a = current.get(*field).unwrap_or(&Value::Null);
            let b = desired.get(*field).unwrap_or(&Value::Null);
            a != b
        })
        .cloned()
        .collect();
    fields.sort();
    fields.dedup();
    fields
}

/// Fields the platform reports differently from what was last applied.
///
/// Only fields present on both sides count; platforms do not echo every
/// input (secrets, for one).
pub fn drifted_fields(last_applied: &Attributes, observed: &Attributes) -> Vec<String> {
    last_applied
        .iter()
        .filter(|(field, value)| observed.get(*field).is_some_and(|seen| seen != *value))
        .map(|(field, _)| field.clone())
        .collect()
}

/// Replace every reference in `value` using `lookup`
pub fn resolve_value<E>(value: &Value, lookup: &mut impl FnMut(&AttributeRef) -> Result<Value, E>) -> Result<Value, E> {
    Ok(match value {
        Value::Ref(reference) => lookup(reference)?,
        Value::List(items) => Value::List(
            items
                .iter()
                .map(|item| resolve_value(item, lookup))
                .collect::<Result<Vec<_>, E>>()?,
        ),
        Value::Map(entries) => Value::Map(
            entries
                .iter()
                .map(|(k, v)| Ok((k.clone(), resolve_value(v, lookup)?)))
                .collect::<Result<BTreeMap<_, _>, E>>()?,
        ),
        literal => literal.clone(),
    })
}

/// Resolve every attribute of a node
pub fn resolve_attributes<E>(
    attributes: &Attributes,
    mut lookup: impl FnMut(&AttributeRef) -> Result<Value, E>,
) -> Result<Attributes, E> {
    attributes
        .iter()
        .map(|(name, value)| Ok((name.clone(), resolve_value(value, &mut lookup)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn attrs(pairs: &[(&str, Value)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn applied(kind: ResourceKind, attributes: Attributes) -> ResourceState {
        ResourceState {
            id: "x".into(),
            kind,
            status: Status::Applied,
            backend_id: Some("/x".into()),
            attributes,
            outputs: Attributes::new(),
            dependencies: vec![],
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_create_when_absent() {
        let desired = attrs(&[("name", "vnet".into())]);
        assert_eq!(decide("x", ResourceKind::Network, None, &desired).action, Action::Create);

        let gone = applied(ResourceKind::Network, desired.clone()).absent();
        assert_eq!(
            decide("x", ResourceKind::Network, Some(&gone), &desired).action,
            Action::Create
        );
    }

    #[test]
    fn test_noop_when_unchanged() {
        let desired = attrs(&[("name", "vnet".into()), ("tags", Value::Null)]);
        let prior = applied(ResourceKind::Network, attrs(&[("name", "vnet".into())]));
        let diff = decide("x", ResourceKind::Network, Some(&prior), &desired);
        assert_eq!(diff.action, Action::NoOp);
        assert!(diff.changed.is_empty());
    }

    #[test]
    fn test_update_on_mutable_change() {
        let prior = applied(ResourceKind::Network, attrs(&[("tags", "a".into())]));
        let desired = attrs(&[("tags", "b".into())]);
        let diff = decide("x", ResourceKind::Network, Some(&prior), &desired);
        assert_eq!(diff.action, Action::Update);
        assert_eq!(diff.changed, vec!["tags"]);
    }

    #[test]
    fn test_replace_on_immutable_change() {
        let prior = applied(ResourceKind::Network, attrs(&[("address_space", "10.0.0.0/16".into())]));
        let desired = attrs(&[("address_space", "10.1.0.0/16".into())]);
        assert_eq!(
            decide("x", ResourceKind::Network, Some(&prior), &desired).action,
            Action::Replace
        );
    }

    #[test]
    fn test_replace_on_kind_change() {
        let prior = applied(ResourceKind::Network, Attributes::new());
        let diff = decide("x", ResourceKind::Subnet, Some(&prior), &Attributes::new());
        assert_eq!(diff.action, Action::Replace);
        assert_eq!(diff.changed, vec!["kind"]);
    }

    #[test]
    fn test_replace_when_tainted() {
        let mut prior = applied(ResourceKind::Network, Attributes::new());
        prior.status = Status::Tainted;
        assert_eq!(
            decide("x", ResourceKind::Network, Some(&prior), &Attributes::new()).action,
            Action::Replace
        );
    }

    #[test]
    fn test_drifted_fields_ignore_unreported() {
        let last = attrs(&[("size", "B2s".into()), ("admin_password", Value::secret("PW"))]);
        let observed = attrs(&[("size", "B4ms".into())]);
        assert_eq!(drifted_fields(&last, &observed), vec!["size"]);
    }

    #[test]
    fn test_resolve_nested_references() {
        let attributes = attrs(&[(
            "ip",
            Value::Map(
                [("subnet".to_string(), Value::reference("sub", "id"))]
                    .into_iter()
                    .collect(),
            ),
        )]);
        let resolved = resolve_attributes(&attributes, |r| {
            Ok::<_, ()>(Value::String(format!("/{}", r.resource_id)))
        })
        .unwrap();
        assert_eq!(
            resolved["ip"],
            Value::Map([("subnet".to_string(), Value::from("/sub"))].into_iter().collect())
        );
    }
}
