//! Playbook Data Model
//!
//! Core data structures describing a playbook definition: named sequences
//! of actions, and the references used to point into them.
//!
//! # Example YAML Format
//!
//! ```yaml
//! start_sequence: main
//! sequences:
//!   main:
//!     - id: fetch_ticket
//!       type: http.request
//!       parameters:
//!         url: https://tickets.example.com/api/current
//!
//!     - id: triage
//!       type: script
//!       calls:
//!         - escalate
//!
//!   escalate:
//!     - id: page_oncall
//!       type: pager.notify
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single action within a sequence.
///
/// The engine never interprets an action beyond its identity; the `type`
/// and `parameters` are handed to the step executor untouched.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Action {
    /// Identifier, unique within the owning sequence
    pub id: String,

    /// Action type understood by the step executor
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub action_type: Option<String>,

    /// Sequences this action may branch into
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub calls: Vec<String>,

    /// Opaque executor parameters
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub parameters: Value,
}

impl Action {
    /// Creates a new action with the given identifier.
    ///
    /// # Example
    ///
    /// ```
    /// use playrunner::workflow::Action;
    ///
    /// let action = Action::new("notify")
    ///     .with_type("pager.notify")
    ///     .calls("escalate");
    /// assert_eq!(action.calls, vec!["escalate".to_string()]);
    /// ```
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into().trim().to_string(),
            action_type: None,
            calls: Vec::new(),
            parameters: Value::Null,
        }
    }

    /// Sets the executor-facing action type.
    pub fn with_type(mut self, action_type: impl Into<String>) -> Self {
        self.action_type = Some(action_type.into());
        self
    }

    /// Declares a sequence this action may branch into.
    pub fn calls(mut self, sequence: impl Into<String>) -> Self {
        self.calls.push(sequence.into());
        self
    }

    /// Sets the executor parameters.
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// A named, ordered list of actions.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct Sequence {
    pub actions: Vec<Action>,
}

impl Sequence {
    pub fn new(actions: Vec<Action>) -> Self {
        Self { actions }
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Returns the action at `index`, if any.
    pub fn get(&self, index: usize) -> Option<&Action> {
        self.actions.get(index)
    }
}

/// An immutable playbook definition.
///
/// Definitions are validated once before a run starts and then shared
/// read-only for the lifetime of the run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Definition {
    /// Name of the sequence execution begins with
    pub start_sequence: String,

    /// All sequences, keyed by name
    #[serde(default)]
    pub sequences: BTreeMap<String, Sequence>,
}

impl Definition {
    /// Creates an empty definition starting at `start_sequence`.
    pub fn new(start_sequence: impl Into<String>) -> Self {
        Self {
            start_sequence: start_sequence.into(),
            sequences: BTreeMap::new(),
        }
    }

    /// Adds (or replaces) a sequence.
    pub fn with_sequence(mut self, name: impl Into<String>, actions: Vec<Action>) -> Self {
        self.sequences.insert(name.into(), Sequence::new(actions));
        self
    }

    /// Gets a sequence by name.
    pub fn sequence(&self, name: &str) -> Option<&Sequence> {
        self.sequences.get(name)
    }

    /// Returns a reference to the first action of a sequence.
    ///
    /// `None` when the sequence is unknown or empty; callers that need to
    /// tell the two apart should check [`Definition::sequence`] first.
    pub fn first_action(&self, sequence: &str) -> Option<ActionReference> {
        self.action_at(sequence, 0)
    }

    /// Returns a reference to the action at `index` in `sequence`.
    pub fn action_at(&self, sequence: &str, index: usize) -> Option<ActionReference> {
        let action = self.sequence(sequence)?.get(index)?;
        Some(ActionReference::new(sequence, action.id.clone(), index))
    }

    /// Resolves a reference to the action it points at.
    ///
    /// Returns `None` if the sequence or index no longer exists, or if the
    /// action found there carries a different id.
    pub fn resolve(&self, reference: &ActionReference) -> Option<&Action> {
        self.sequence(&reference.sequence_id)?
            .get(reference.action_index)
            .filter(|action| action.id == reference.action_id)
    }

    /// Total number of actions across all sequences.
    pub fn action_count(&self) -> usize {
        self.sequences.values().map(Sequence::len).sum()
    }
}

/// Pointer to one action occurrence in a definition.
///
/// Two references are equal only if sequence, id and index all match.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActionReference {
    pub sequence_id: String,
    pub action_id: String,
    pub action_index: usize,
}

impl ActionReference {
    pub fn new(
        sequence_id: impl Into<String>,
        action_id: impl Into<String>,
        action_index: usize,
    ) -> Self {
        Self {
            sequence_id: sequence_id.into(),
            action_id: action_id.into(),
            action_index,
        }
    }
}

impl fmt::Display for ActionReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}]:{}",
            self.sequence_id, self.action_index, self.action_id
        )
    }
}

/// Saved continuation point: where to resume once a called sequence returns.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub reference: ActionReference,
}

impl StackFrame {
    pub fn new(reference: ActionReference) -> Self {
        Self { reference }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_definition() -> Definition {
        Definition::new("main")
            .with_sequence(
                "main",
                vec![Action::new("a"), Action::new("b").calls("sub")],
            )
            .with_sequence("sub", vec![Action::new("c")])
            .with_sequence("empty", vec![])
    }

    #[test]
    fn test_action_builder() {
        let action = Action::new("  notify ")
            .with_type("pager.notify")
            .calls("escalate")
            .with_parameters(serde_json::json!({"severity": "high"}));

        assert_eq!(action.id, "notify");
        assert_eq!(action.action_type.as_deref(), Some("pager.notify"));
        assert_eq!(action.calls, vec!["escalate"]);
        assert_eq!(action.parameters["severity"], "high");
    }

    #[test]
    fn test_first_action() {
        let definition = sample_definition();

        assert_eq!(
            definition.first_action("main"),
            Some(ActionReference::new("main", "a", 0))
        );
        assert_eq!(definition.first_action("empty"), None);
        assert_eq!(definition.first_action("missing"), None);
    }

    #[test]
    fn test_action_at() {
        let definition = sample_definition();

        assert_eq!(
            definition.action_at("main", 1),
            Some(ActionReference::new("main", "b", 1))
        );
        assert_eq!(definition.action_at("main", 2), None);
    }

    #[test]
    fn test_resolve_checks_id() {
        let definition = sample_definition();

        let good = ActionReference::new("main", "b", 1);
        assert_eq!(definition.resolve(&good).map(|a| a.id.as_str()), Some("b"));

        let stale = ActionReference::new("main", "x", 1);
        assert!(definition.resolve(&stale).is_none());
    }

    #[test]
    fn test_action_count() {
        assert_eq!(sample_definition().action_count(), 3);
    }

    #[test]
    fn test_reference_equality_is_structural() {
        let a = ActionReference::new("main", "a", 0);
        let b = ActionReference::new("main", "a", 0);
        let c = ActionReference::new("main", "a", 1);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_reference_display() {
        let reference = ActionReference::new("main", "triage", 2);
        assert_eq!(reference.to_string(), "main[2]:triage");
    }

    #[test]
    fn test_definition_yaml_shape() {
        let yaml = r#"
start_sequence: main
sequences:
  main:
    - id: a
      type: script
      calls: [sub]
  sub: []
"#;
        let definition: Definition = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(definition.start_sequence, "main");
        assert_eq!(definition.sequence("main").unwrap().len(), 1);
        assert!(definition.sequence("sub").unwrap().is_empty());
        assert_eq!(
            definition.sequence("main").unwrap().actions[0].calls,
            vec!["sub"]
        );
    }
}
