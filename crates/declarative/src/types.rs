//! Core types for declarative resource graphs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::error::{NodeError, ValidationError};
use crate::retry::RetryConfig;

/// Attribute map of a resource, ordered by name for stable diffs
pub type Attributes = BTreeMap<String, Value>;

/// Literal configuration inputs that inclusion conditions are evaluated over
pub type Variables = BTreeMap<String, Value>;

/// Kind of resource a node describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    ResourceGroup,
    Network,
    Subnet,
    SecurityPolicy,
    SecurityRule,
    PublicAddress,
    NetworkInterface,
    VirtualMachine,
}

impl ResourceKind {
    /// All kinds, in the order they usually appear in a topology
    pub const ALL: [Self; 8] = [
        Self::ResourceGroup,
        Self::Network,
        Self::Subnet,
        Self::SecurityPolicy,
        Self::SecurityRule,
        Self::PublicAddress,
        Self::NetworkInterface,
        Self::VirtualMachine,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResourceGroup => "resource_group",
            Self::Network => "network",
            Self::Subnet => "subnet",
            Self::SecurityPolicy => "security_policy",
            Self::SecurityRule => "security_rule",
            Self::PublicAddress => "public_address",
            Self::NetworkInterface => "network_interface",
            Self::VirtualMachine => "virtual_machine",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// "Value produced by resource `resource_id`, field `field`"
///
/// Only resolvable once the target has been applied in the current run.
/// The field `id` resolves to the target's backend id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributeRef {
    pub resource_id: String,
    pub field: String,
}

impl fmt::Display for AttributeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{{}.{}}}", self.resource_id, self.field)
    }
}

/// Opaque reference to a credential held outside the engine
///
/// Only the reference name is ever stored or printed.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretRef(String);

impl SecretRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretRef({})", self.0)
    }
}

/// Attribute value: a literal, a reference to another resource's output,
/// or a secret reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Ref(AttributeRef),
    Secret(SecretRef),
}

impl Value {
    /// Reference to `field` of resource `resource_id`
    pub fn reference(resource_id: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Ref(AttributeRef {
            resource_id: resource_id.into(),
            field: field.into(),
        })
    }

    pub fn secret(name: impl Into<String>) -> Self {
        Self::Secret(SecretRef::new(name))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Collect every attribute reference nested in this value
    pub fn collect_refs<'a>(&'a self, out: &mut Vec<&'a AttributeRef>) {
        match self {
            Self::Ref(r) => out.push(r),
            Self::List(items) => items.iter().for_each(|v| v.collect_refs(out)),
            Self::Map(entries) => entries.values().for_each(|v| v.collect_refs(out)),
            _ => {}
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::String(s) => write!(f, "\"{s}\""),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Map(entries) => {
                f.write_str("{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k} = {v}")?;
                }
                f.write_str("}")
            }
            Self::Ref(r) => write!(f, "{r}"),
            Self::Secret(s) => write!(f, "(secret {})", s.name()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<u16> for Value {
    fn from(i: u16) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<AttributeRef> for Value {
    fn from(r: AttributeRef) -> Self {
        Self::Ref(r)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }
}

impl From<BTreeMap<String, String>> for Value {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self::Map(map.into_iter().map(|(k, v)| (k, Value::String(v))).collect())
    }
}

/// Presence predicate for a node, evaluated over literal [`Variables`] only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Condition {
    Always,
    Never,
    /// The named variable is the boolean `true`
    IsTrue(String),
    /// The named variable is a non-empty string or list
    NonEmpty(String),
    Not(Box<Condition>),
    All(Vec<Condition>),
}

impl Condition {
    pub fn is_true(variable: impl Into<String>) -> Self {
        Self::IsTrue(variable.into())
    }

    pub fn non_empty(variable: impl Into<String>) -> Self {
        Self::NonEmpty(variable.into())
    }

    /// Evaluate for node `id`
    pub fn evaluate(&self, id: &str, variables: &Variables) -> Result<bool, ValidationError> {
        let lookup = |name: &str| {
            variables
                .get(name)
                .ok_or_else(|| ValidationError::UnresolvedVariable {
                    id: id.to_string(),
                    variable: name.to_string(),
                })
        };

        match self {
            Self::Always => Ok(true),
            Self::Never => Ok(false),
            Self::IsTrue(name) => match lookup(name)? {
                Value::Bool(b) => Ok(*b),
                other => Err(ValidationError::InvalidVariable {
                    variable: name.clone(),
                    reason: format!("expected a bool, found {other}"),
                }),
            },
            Self::NonEmpty(name) => match lookup(name)? {
                Value::Null => Ok(false),
                Value::String(s) => Ok(!s.is_empty()),
                Value::List(items) => Ok(!items.is_empty()),
                other => Err(ValidationError::InvalidVariable {
                    variable: name.clone(),
                    reason: format!("expected a string or list, found {other}"),
                }),
            },
            Self::Not(inner) => Ok(!inner.evaluate(id, variables)?),
            Self::All(conditions) => {
                for condition in conditions {
                    if !condition.evaluate(id, variables)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }
}

/// Declarative description of one resource in the graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Logical id, unique and stable across runs
    pub id: String,
    pub kind: ResourceKind,
    pub attributes: Attributes,
    pub included: Condition,
    /// Explicit ordering edges, in addition to those implied by references
    pub depends_on: Vec<String>,
}

impl ResourceSpec {
    pub fn new(id: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            attributes: Attributes::new(),
            included: Condition::Always,
            depends_on: Vec::new(),
        }
    }

    /// Set an attribute
    pub fn attr(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Gate the node's presence on a condition
    pub fn when(mut self, condition: Condition) -> Self {
        self.included = condition;
        self
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        if !self.depends_on.contains(&id) {
            self.depends_on.push(id);
        }
        self
    }

    /// Every attribute reference in this node, in attribute-name order
    pub fn references(&self) -> Vec<&AttributeRef> {
        let mut refs = Vec::new();
        for value in self.attributes.values() {
            value.collect_refs(&mut refs);
        }
        refs
    }
}

/// Lifecycle status of a persisted resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Absent,
    Applied,
    /// Applied, but the platform drifted in a way that requires replacement
    Tainted,
}

/// Last-applied record of a resource, as kept by a [`StateStore`](crate::StateStore)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    pub id: String,
    pub kind: ResourceKind,
    pub status: Status,
    /// Opaque handle assigned by the platform
    pub backend_id: Option<String>,
    /// Resolved attributes as last applied (secrets by reference only)
    #[serde(default)]
    pub attributes: Attributes,
    /// Values reported by the platform after the last create/update
    #[serde(default)]
    pub outputs: Attributes,
    /// Ids this resource depended on when last applied
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl ResourceState {
    /// Whether the resource exists on the platform as far as state knows
    pub fn is_live(&self) -> bool {
        matches!(self.status, Status::Applied | Status::Tainted)
    }

    /// Resolve a field for an [`AttributeRef`]: `id`, then outputs, then attributes
    pub fn field(&self, name: &str) -> Option<Value> {
        if name == "id" {
            return self.backend_id.clone().map(Value::String);
        }
        self.outputs
            .get(name)
            .or_else(|| self.attributes.get(name))
            .cloned()
    }

    /// A record marking the resource as gone, keeping its kind
    pub fn absent(&self) -> Self {
        Self {
            id: self.id.clone(),
            kind: self.kind,
            status: Status::Absent,
            backend_id: None,
            attributes: Attributes::new(),
            outputs: Attributes::new(),
            dependencies: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

/// Action the reconciler takes for a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Update,
    /// Destroy then create
    Replace,
    NoOp,
    Destroy,
}

impl Action {
    /// Whether the action touches the platform
    pub fn is_change(&self) -> bool {
        !matches!(self, Self::NoOp)
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Replace => "-/+",
            Self::NoOp => " ",
            Self::Destroy => "-",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::NoOp => "no-op",
            Self::Destroy => "destroy",
        };
        f.write_str(s)
    }
}

/// Final status of a node for a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Converged; carries the action that got it there
    Applied { action: Action },
    Destroyed,
    Skipped { reason: String },
    Failed { reason: String },
}

impl NodeStatus {
    /// Whether the node reached a successful terminal outcome
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Applied { .. } | Self::Destroyed)
    }
}

/// Per-node line of a [`RunReport`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
    pub id: String,
    pub kind: ResourceKind,
    pub status: NodeStatus,
}

/// Summary of execution results
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteSummary {
    pub created: usize,
    pub updated: usize,
    pub replaced: usize,
    pub destroyed: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ExecuteSummary {
    /// Total number of actual changes made
    pub fn total_changes(&self) -> usize {
        self.created + self.updated + self.replaced + self.destroyed
    }

    /// Check if execution was fully successful (no failures)
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    /// Total number of resources processed
    pub fn total(&self) -> usize {
        self.total_changes() + self.unchanged + self.skipped + self.failed
    }

    /// Add a node status to the summary
    pub fn add_status(&mut self, status: &NodeStatus) {
        match status {
            NodeStatus::Applied { action } => match action {
                Action::Create => self.created += 1,
                Action::Update => self.updated += 1,
                Action::Replace => self.replaced += 1,
                Action::NoOp => self.unchanged += 1,
                Action::Destroy => self.destroyed += 1,
            },
            NodeStatus::Destroyed => self.destroyed += 1,
            NodeStatus::Skipped { .. } => self.skipped += 1,
            NodeStatus::Failed { .. } => self.failed += 1,
        }
    }
}

/// Outcome of a reconciliation run
///
/// Every node that was considered gets exactly one entry in `nodes`, in
/// execution order. A partial failure is never reported as success.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub nodes: Vec<NodeReport>,
    /// Ids that converged to `Applied`, in execution order
    pub applied: Vec<String>,
    pub errors: Vec<NodeError>,
    pub summary: ExecuteSummary,
}

impl RunReport {
    pub(crate) fn record(&mut self, id: &str, kind: ResourceKind, status: NodeStatus) {
        if matches!(status, NodeStatus::Applied { .. }) {
            self.applied.push(id.to_string());
        }
        self.summary.add_status(&status);
        self.nodes.push(NodeReport {
            id: id.to_string(),
            kind,
            status,
        });
    }

    /// Check if every node converged
    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && self.summary.skipped == 0
    }

    pub fn status(&self, id: &str) -> Option<&NodeStatus> {
        self.nodes.iter().find(|n| n.id == id).map(|n| &n.status)
    }

    /// Action a node converged with; destroyed nodes report [`Action::Destroy`]
    pub fn action(&self, id: &str) -> Option<Action> {
        match self.status(id)? {
            NodeStatus::Applied { action } => Some(*action),
            NodeStatus::Destroyed => Some(Action::Destroy),
            _ => None,
        }
    }

    /// Number of nodes that converged with `action`
    pub fn count(&self, action: Action) -> usize {
        self.nodes.iter().filter(|n| self.action(&n.id) == Some(action)).count()
    }

    /// Nodes that changed the platform, with their action
    pub fn changes(&self) -> Vec<(&str, Action)> {
        self.nodes
            .iter()
            .filter_map(|n| self.action(&n.id).map(|a| (n.id.as_str(), a)))
            .filter(|(_, a)| a.is_change())
            .collect()
    }
}

/// Options for execution
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Size of the worker pool for a wave
    pub jobs: usize,
    /// How long to wait for a node's state lock
    pub lock_timeout: Duration,
    /// Read live resources from the backend before diffing
    pub refresh: bool,
    /// Backoff policy for transient backend errors
    pub retry: RetryConfig,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            jobs: 4,
            lock_timeout: Duration::from_secs(30),
            refresh: true,
            retry: RetryConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, Value)]) -> Variables {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_condition_non_empty() {
        let v = vars(&[("cidr", Value::from("")), ("other", Value::from("1.2.3.4/32"))]);
        assert!(!Condition::non_empty("cidr").evaluate("rule", &v).unwrap());
        assert!(Condition::non_empty("other").evaluate("rule", &v).unwrap());

        // any value counts, whitespace included
        let blank = vars(&[("cidr", Value::from(" "))]);
        assert!(Condition::non_empty("cidr").evaluate("rule", &blank).unwrap());
    }

    #[test]
    fn test_condition_missing_variable() {
        let err = Condition::is_true("create_public_ip")
            .evaluate("pip", &Variables::new())
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnresolvedVariable {
                id: "pip".into(),
                variable: "create_public_ip".into(),
            }
        );
    }

    #[test]
    fn test_condition_wrong_type() {
        let v = vars(&[("flag", Value::from("yes"))]);
        assert!(matches!(
            Condition::is_true("flag").evaluate("x", &v),
            Err(ValidationError::InvalidVariable { .. })
        ));
    }

    #[test]
    fn test_condition_composition() {
        let v = vars(&[("a", Value::Bool(true)), ("b", Value::Bool(false))]);
        let c = Condition::All(vec![
            Condition::is_true("a"),
            Condition::Not(Box::new(Condition::is_true("b"))),
        ]);
        assert!(c.evaluate("x", &v).unwrap());
    }

    #[test]
    fn test_references_are_found_in_nested_values() {
        let spec = ResourceSpec::new("nic", ResourceKind::NetworkInterface)
            .attr("subnet", Value::reference("sub", "id"))
            .attr(
                "ip_configuration",
                Value::Map(BTreeMap::from([(
                    "public_ip".to_string(),
                    Value::reference("pip", "id"),
                )])),
            );
        let targets: Vec<_> = spec
            .references()
            .iter()
            .map(|r| r.resource_id.as_str())
            .collect();
        assert_eq!(targets, vec!["pip", "sub"]);
    }

    #[test]
    fn test_secret_display_hides_value() {
        let v = Value::secret("ADMIN_PASSWORD");
        assert_eq!(v.to_string(), "(secret ADMIN_PASSWORD)");
    }

    #[test]
    fn test_state_field_resolution() {
        let state = ResourceState {
            id: "nic".into(),
            kind: ResourceKind::NetworkInterface,
            status: Status::Applied,
            backend_id: Some("/nic/1".into()),
            attributes: Attributes::from([("name".to_string(), Value::from("nic-a"))]),
            outputs: Attributes::from([(
                "private_ip_address".to_string(),
                Value::from("10.0.1.4"),
            )]),
            dependencies: vec![],
            updated_at: Utc::now(),
        };
        assert_eq!(state.field("id"), Some(Value::from("/nic/1")));
        assert_eq!(state.field("private_ip_address"), Some(Value::from("10.0.1.4")));
        assert_eq!(state.field("name"), Some(Value::from("nic-a")));
        assert_eq!(state.field("missing"), None);
    }

    #[test]
    fn test_summary_counts() {
        let mut summary = ExecuteSummary::default();
        summary.add_status(&NodeStatus::Applied { action: Action::Create });
        summary.add_status(&NodeStatus::Applied { action: Action::NoOp });
        summary.add_status(&NodeStatus::Destroyed);
        summary.add_status(&NodeStatus::Failed { reason: "x".into() });
        assert_eq!(summary.total_changes(), 2);
        assert_eq!(summary.total(), 4);
        assert!(!summary.is_success());
    }
}
