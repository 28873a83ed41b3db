//! Dependency graph of the scheduler.
//!
//! Nodes are keyed values. A node keeps both the intended value and the value
//! known to be applied on the device, so the engine can tell an in-place
//! update from a (re)create. Edges are not stored: dependencies are kept on
//! the dependent node and dependents are found by scanning, which keeps
//! `AnyOf` dependencies on keys that do not exist yet trivially correct.

use kv_orch_common::{
    BaseValueStatus, Dependency, DependencyTarget, KvError, MetadataRef, TxnOperation,
    ValueOrigin, ValueRef, ValueState, ValueStatus,
};
use std::collections::BTreeMap;
use std::fmt::{self, Write};

/// One keyed value.
#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub key: String,
    /// Intended (NB) or obtained (SB) value
    pub value: ValueRef,
    /// Value currently on the device, `None` if not applied
    pub applied: Option<ValueRef>,
    /// Owning descriptor, `None` if no descriptor owns the key
    pub descriptor: Option<String>,
    pub origin: ValueOrigin,
    pub state: ValueState,
    pub last_op: TxnOperation,
    pub error: Option<KvError>,
    pub metadata: Option<MetadataRef>,
    /// Parent key of a derived value
    pub derived_from: Option<String>,
    /// Keys of values derived from this one
    pub derived: Vec<String>,
    pub deps: Vec<Dependency>,
    /// Sequence number of the transaction that last set the intent
    pub intent_seq: u64,
    /// Removal was requested but the delete failed, the value is still applied
    pub removing: bool,
}

impl Node {
    pub fn new(key: impl Into<String>, value: ValueRef, origin: ValueOrigin) -> Self {
        Self {
            key: key.into(),
            value,
            applied: None,
            descriptor: None,
            origin,
            state: ValueState::NonExistent,
            last_op: TxnOperation::Undefined,
            error: None,
            metadata: None,
            derived_from: None,
            derived: Vec::new(),
            deps: Vec::new(),
            intent_seq: 0,
            removing: false,
        }
    }

    pub fn is_derived(&self) -> bool {
        self.derived_from.is_some()
    }

    /// Returns true if the node can satisfy dependencies.
    pub fn is_available(&self) -> bool {
        self.state.is_available()
    }

    /// Returns true if the node is a requested NB base value.
    pub fn is_nb_base(&self) -> bool {
        self.origin == ValueOrigin::FromNb && !self.is_derived()
    }

    /// Details reported with the status.
    pub fn details(&self) -> Vec<String> {
        match self.state {
            ValueState::Invalid => self
                .error
                .as_ref()
                .map(|e| e.invalid_fields().to_vec())
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}

/// Graph of keyed values.
#[derive(Debug, Clone, Default)]
pub(crate) struct Graph {
    nodes: BTreeMap<String, Node>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Node> {
        self.nodes.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Node> {
        self.nodes.get_mut(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn insert(&mut self, node: Node) {
        self.nodes.insert(node.key.clone(), node);
    }

    pub fn remove(&mut self, key: &str) -> Option<Node> {
        self.nodes.remove(key)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the dependency is satisfied by an available node.
    pub fn is_satisfied(&self, dep: &Dependency) -> bool {
        match &dep.target {
            DependencyTarget::Key(key) => self.get(key).is_some_and(Node::is_available),
            DependencyTarget::AnyOf { .. } => self
                .nodes
                .values()
                .any(|n| n.is_available() && dep.matches(&n.key)),
        }
    }

    /// Dependencies of `deps` that are not satisfied.
    pub fn unmet(&self, deps: &[Dependency]) -> Vec<Dependency> {
        deps.iter()
            .filter(|dep| !self.is_satisfied(dep))
            .cloned()
            .collect()
    }

    /// Applied nodes with a dependency matched by `key`, in key order.
    pub fn applied_dependents(&self, key: &str) -> Vec<String> {
        self.nodes
            .values()
            .filter(|n| n.key != key && n.applied.is_some())
            .filter(|n| n.deps.iter().any(|dep| dep.matches(key)))
            .map(|n| n.key.clone())
            .collect()
    }

    /// Keys of NB base values.
    pub fn nb_base_keys(&self) -> Vec<String> {
        self.nodes
            .values()
            .filter(|n| n.is_nb_base())
            .map(|n| n.key.clone())
            .collect()
    }

    /// Renders the graph in Graphviz DOT format.
    ///
    /// Dashed edges lead from a value to its derived values, solid edges from
    /// a value to the values satisfying its dependencies. Unmet dependencies
    /// are drawn in red.
    pub fn to_dot(&self) -> String {
        let mut out = String::new();
        // writing into a String cannot fail
        let _ = self.write_dot(&mut out);
        out
    }

    fn write_dot(&self, out: &mut impl Write) -> fmt::Result {
        writeln!(out, "digraph kvscheduler {{")?;
        writeln!(out, "  rankdir=LR;")?;
        writeln!(out, "  node [shape=box, style=filled, fontname=monospace];")?;
        for node in self.nodes.values() {
            writeln!(
                out,
                "  \"{}\" [label=\"{}\\n{}\", fillcolor={}];",
                dot_escape(&node.key),
                dot_escape(&node.key),
                node.state,
                state_color(node.state)
            )?;
        }
        for node in self.nodes.values() {
            if let Some(parent) = &node.derived_from {
                writeln!(
                    out,
                    "  \"{}\" -> \"{}\" [style=dashed];",
                    dot_escape(parent),
                    dot_escape(&node.key)
                )?;
            }
            for dep in &node.deps {
                let color = if self.is_satisfied(dep) { "black" } else { "red" };
                let targets: Vec<String> = match &dep.target {
                    DependencyTarget::Key(key) => vec![key.clone()],
                    DependencyTarget::AnyOf { .. } => self
                        .nodes
                        .keys()
                        .filter(|k| *k != &node.key && dep.matches(k))
                        .cloned()
                        .collect(),
                };
                if targets.is_empty() {
                    writeln!(
                        out,
                        "  \"{}\" -> \"<{}>\" [label=\"{}\", color={}, style=dotted];",
                        dot_escape(&node.key),
                        dot_escape(&dep.label),
                        dot_escape(&dep.label),
                        color
                    )?;
                }
                for target in targets {
                    writeln!(
                        out,
                        "  \"{}\" -> \"{}\" [label=\"{}\", color={}];",
                        dot_escape(&node.key),
                        dot_escape(&target),
                        dot_escape(&dep.label),
                        color
                    )?;
                }
            }
        }
        writeln!(out, "}}")
    }

    /// Status of one node.
    pub fn value_status(&self, key: &str, pending_labels: Vec<String>) -> ValueStatus {
        match self.get(key) {
            Some(node) => ValueStatus {
                key: key.to_string(),
                state: node.state,
                error: node.error.as_ref().map(ToString::to_string),
                last_operation: node.last_op,
                details: if node.state == ValueState::Pending {
                    pending_labels
                } else {
                    node.details()
                },
            },
            None => ValueStatus::nonexistent(key),
        }
    }

    /// Status of a base value with its derived values.
    pub fn base_status<F>(&self, key: &str, pending_labels: F) -> BaseValueStatus
    where
        F: Fn(&str) -> Vec<String>,
    {
        let derived = self
            .get(key)
            .map(|n| {
                n.derived
                    .iter()
                    .map(|d| self.value_status(d, pending_labels(d)))
                    .collect()
            })
            .unwrap_or_default();
        BaseValueStatus {
            value: self.value_status(key, pending_labels(key)),
            derived_values: derived,
        }
    }
}

fn dot_escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

fn state_color(state: ValueState) -> &'static str {
    match state {
        ValueState::Configured | ValueState::Obtained => "palegreen",
        ValueState::Discovered => "lightblue",
        ValueState::Pending => "khaki",
        ValueState::Invalid | ValueState::Failed | ValueState::Retrying => "salmon",
        _ => "lightgrey",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kv_orch_common::value_ref;
    use pretty_assertions::assert_eq;

    fn node(key: &str, state: ValueState) -> Node {
        let mut node = Node::new(key, value_ref(key.to_string()), ValueOrigin::FromNb);
        node.state = state;
        if state.is_available() {
            node.applied = Some(node.value.clone());
        }
        node
    }

    #[test]
    fn test_dependency_satisfaction() {
        let mut graph = Graph::new();
        graph.insert(node("if/eth0", ValueState::Configured));
        graph.insert(node("if/eth1", ValueState::Failed));

        assert!(graph.is_satisfied(&Dependency::on_key("x", "if/eth0")));
        assert!(!graph.is_satisfied(&Dependency::on_key("x", "if/eth1")));
        assert!(!graph.is_satisfied(&Dependency::on_key("x", "if/eth2")));
        assert!(graph.is_satisfied(&Dependency::any_of_prefixes("x", ["if/"])));

        let unmet = graph.unmet(&[
            Dependency::on_key("a", "if/eth0"),
            Dependency::on_key("b", "if/eth2"),
        ]);
        assert_eq!(unmet.len(), 1);
        assert_eq!(unmet[0].label, "b");
    }

    #[test]
    fn test_applied_dependents() {
        let mut graph = Graph::new();
        graph.insert(node("if/eth0", ValueState::Configured));

        let mut binding = node("acl/a/if/eth0", ValueState::Configured);
        binding.deps = vec![Dependency::on_key("interface-exists", "if/eth0")];
        graph.insert(binding);

        let mut pending = node("acl/b/if/eth0", ValueState::Pending);
        pending.deps = vec![Dependency::on_key("interface-exists", "if/eth0")];
        graph.insert(pending);

        assert_eq!(graph.applied_dependents("if/eth0"), vec!["acl/a/if/eth0".to_string()]);
        assert!(graph.applied_dependents("if/eth1").is_empty());
    }

    #[test]
    fn test_base_status_with_derived() {
        let mut graph = Graph::new();
        let mut acl = node("acl/a", ValueState::Configured);
        acl.derived = vec!["acl/a/if/eth0".to_string()];
        graph.insert(acl);

        let mut binding = node("acl/a/if/eth0", ValueState::Pending);
        binding.derived_from = Some("acl/a".to_string());
        graph.insert(binding);

        let status = graph.base_status("acl/a", |_| vec!["interface-exists".to_string()]);
        assert_eq!(status.value.state, ValueState::Configured);
        assert!(status.value.details.is_empty());
        assert_eq!(status.derived_values.len(), 1);
        assert_eq!(status.derived_values[0].details, vec!["interface-exists".to_string()]);

        assert_eq!(graph.nb_base_keys(), vec!["acl/a".to_string()]);
        assert_eq!(graph.base_status("missing", |_| vec![]).value.state, ValueState::NonExistent);
    }

    #[test]
    fn test_to_dot() {
        let mut graph = Graph::new();
        let mut acl = node("acl/a", ValueState::Configured);
        acl.derived = vec!["acl/a/if/eth0".to_string()];
        graph.insert(acl);

        let mut binding = node("acl/a/if/eth0", ValueState::Pending);
        binding.derived_from = Some("acl/a".to_string());
        binding.deps = vec![Dependency::on_key("interface-exists", "if/eth0")];
        graph.insert(binding);

        let mut route = node("route/r1", ValueState::Configured);
        route.deps = vec![Dependency::any_of_prefixes("any-interface", ["if/"])];
        graph.insert(route);

        let dot = graph.to_dot();
        assert!(dot.starts_with("digraph kvscheduler {"));
        assert!(dot.trim_end().ends_with('}'));
        assert!(dot.contains(r#""acl/a" [label="acl/a\nCONFIGURED", fillcolor=palegreen];"#));
        assert!(dot.contains(r#""acl/a/if/eth0" [label="acl/a/if/eth0\nPENDING", fillcolor=khaki];"#));
        assert!(dot.contains(r#""acl/a" -> "acl/a/if/eth0" [style=dashed];"#));
        assert!(dot.contains(
            r#""acl/a/if/eth0" -> "if/eth0" [label="interface-exists", color=red];"#
        ));
        assert!(dot.contains(
            r#""route/r1" -> "<any-interface>" [label="any-interface", color=red, style=dotted];"#
        ));
        assert_eq!(dot_escape(r#"a"b"#), r#"a\"b"#);
    }
}
