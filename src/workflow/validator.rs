//! Playbook Validation
//!
//! Structural checks run once before a run starts:
//! - Start sequence presence
//! - Action id uniqueness within each sequence
//! - Declared branch targets exist
//! - Reachability (warning only)

use std::collections::{BTreeSet, HashSet, VecDeque};

use log::{debug, info, warn};
use thiserror::Error;

use super::model::{Definition, Sequence};

/// A structural problem found in a definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Definition has no start sequence")]
    MissingStartSequence,

    #[error("Start sequence '{0}' does not exist")]
    UnknownStartSequence(String),

    #[error("Definition contains a sequence with an empty name")]
    EmptySequenceName,

    #[error("Sequence '{sequence}' has an action at index {index} with an empty id")]
    EmptyActionId { sequence: String, index: usize },

    #[error("Sequence '{sequence}' contains duplicate action id '{action}'")]
    DuplicateActionId { sequence: String, action: String },

    #[error("Action '{action}' in sequence '{sequence}' calls unknown sequence '{target}'")]
    UnknownCallTarget {
        sequence: String,
        action: String,
        target: String,
    },
}

/// Checks a single sequence's actions.
fn validate_sequence(name: &str, sequence: &Sequence) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut seen_ids: HashSet<&str> = HashSet::new();

    for (index, action) in sequence.actions.iter().enumerate() {
        if action.id.trim().is_empty() {
            errors.push(ValidationError::EmptyActionId {
                sequence: name.to_string(),
                index,
            });
            continue;
        }

        if !seen_ids.insert(action.id.as_str()) {
            errors.push(ValidationError::DuplicateActionId {
                sequence: name.to_string(),
                action: action.id.clone(),
            });
        }
    }

    if sequence.is_empty() {
        debug!("Sequence '{}' is empty (calls to it are no-ops)", name);
    }

    errors
}

/// Validates the entire definition.
///
/// All violations are collected; an empty list means the definition is
/// safe to run.
pub fn validate_definition(definition: &Definition) -> Vec<ValidationError> {
    info!(
        "Validating definition with {} sequences, {} actions",
        definition.sequences.len(),
        definition.action_count()
    );

    let mut errors = Vec::new();

    if definition.start_sequence.trim().is_empty() {
        errors.push(ValidationError::MissingStartSequence);
    } else if !definition.sequences.contains_key(&definition.start_sequence) {
        errors.push(ValidationError::UnknownStartSequence(
            definition.start_sequence.clone(),
        ));
    }

    for (name, sequence) in &definition.sequences {
        if name.trim().is_empty() {
            errors.push(ValidationError::EmptySequenceName);
        }

        errors.extend(validate_sequence(name, sequence));

        for action in &sequence.actions {
            for target in &action.calls {
                if !definition.sequences.contains_key(target) {
                    errors.push(ValidationError::UnknownCallTarget {
                        sequence: name.clone(),
                        action: action.id.clone(),
                        target: target.clone(),
                    });
                }
            }
        }
    }

    if errors.is_empty() {
        for name in unreachable_sequences(definition) {
            warn!(
                "Sequence '{}' is not reachable from '{}' through declared calls",
                name, definition.start_sequence
            );
        }
    }

    errors
}

/// Returns sequences that no declared call path reaches from the start.
///
/// Runtime branches may still name them, so this is advisory.
pub fn unreachable_sequences(definition: &Definition) -> Vec<String> {
    let mut visited: BTreeSet<&str> = BTreeSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();

    if definition.sequences.contains_key(&definition.start_sequence) {
        queue.push_back(definition.start_sequence.as_str());
    }

    while let Some(current) = queue.pop_front() {
        if !visited.insert(current) {
            continue;
        }

        let Some(sequence) = definition.sequence(current) else {
            continue;
        };

        for target in sequence.actions.iter().flat_map(|a| a.calls.iter()) {
            if definition.sequences.contains_key(target) && !visited.contains(target.as_str()) {
                queue.push_back(target.as_str());
            }
        }
    }

    definition
        .sequences
        .keys()
        .filter(|name| !visited.contains(name.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::Action;

    #[test]
    fn test_valid_definition() {
        let definition = Definition::new("main")
            .with_sequence("main", vec![Action::new("a"), Action::new("b").calls("sub")])
            .with_sequence("sub", vec![Action::new("c")]);

        assert!(validate_definition(&definition).is_empty());
    }

    #[test]
    fn test_missing_start_sequence() {
        let definition = Definition::new("  ").with_sequence("main", vec![Action::new("a")]);

        let errors = validate_definition(&definition);
        assert_eq!(errors, vec![ValidationError::MissingStartSequence]);
    }

    #[test]
    fn test_unknown_start_sequence() {
        let definition = Definition::new("main").with_sequence("other", vec![Action::new("a")]);

        let errors = validate_definition(&definition);
        assert!(errors.contains(&ValidationError::UnknownStartSequence("main".to_string())));
    }

    #[test]
    fn test_duplicate_action_id() {
        let definition = Definition::new("main")
            .with_sequence("main", vec![Action::new("a"), Action::new("a")]);

        let errors = validate_definition(&definition);
        assert_eq!(
            errors,
            vec![ValidationError::DuplicateActionId {
                sequence: "main".to_string(),
                action: "a".to_string(),
            }]
        );
    }

    #[test]
    fn test_same_id_in_different_sequences_is_allowed() {
        let definition = Definition::new("main")
            .with_sequence("main", vec![Action::new("a").calls("sub")])
            .with_sequence("sub", vec![Action::new("a")]);

        assert!(validate_definition(&definition).is_empty());
    }

    #[test]
    fn test_empty_action_id() {
        let definition = Definition::new("main")
            .with_sequence("main", vec![Action::new("ok"), Action::new("")]);

        let errors = validate_definition(&definition);
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::EmptyActionId { index: 1, .. })));
    }

    #[test]
    fn test_unknown_call_target() {
        let definition = Definition::new("main")
            .with_sequence("main", vec![Action::new("a").calls("ghost")]);

        let errors = validate_definition(&definition);
        assert!(errors.iter().any(|e| matches!(
            e,
            ValidationError::UnknownCallTarget { target, .. } if target == "ghost"
        )));
    }

    #[test]
    fn test_errors_are_collected() {
        let definition = Definition::new("missing").with_sequence(
            "main",
            vec![Action::new("a"), Action::new("a").calls("ghost")],
        );

        assert_eq!(validate_definition(&definition).len(), 3);
    }

    #[test]
    fn test_empty_sequences_are_legal() {
        let definition = Definition::new("main")
            .with_sequence("main", vec![Action::new("a").calls("noop")])
            .with_sequence("noop", vec![]);

        assert!(validate_definition(&definition).is_empty());
    }

    #[test]
    fn test_unreachable_sequences() {
        let definition = Definition::new("main")
            .with_sequence("main", vec![Action::new("a").calls("sub")])
            .with_sequence("sub", vec![Action::new("b").calls("main")])
            .with_sequence("orphan", vec![Action::new("c")]);

        assert_eq!(unreachable_sequences(&definition), vec!["orphan".to_string()]);
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::UnknownStartSequence("main".to_string());
        assert!(err.to_string().contains("main"));

        let err = ValidationError::DuplicateActionId {
            sequence: "main".to_string(),
            action: "a".to_string(),
        };
        assert!(err.to_string().contains("duplicate"));
    }
}
