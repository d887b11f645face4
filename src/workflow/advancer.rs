//! Program-Counter Advancer
//!
//! Computes which step runs next. The advancer is a pure function of the
//! definition and the run properties; its only side effect is the update
//! of `active_step` and the call stack on the properties it is given.
//!
//! # Resolution order
//!
//! 1. The candidate is the action after the active step in its own
//!    sequence, or the first action of the start sequence before any step
//!    has run.
//! 2. If the active step's result carries a call branch, the candidate is
//!    saved as a return frame and the first action of the called sequence
//!    becomes the candidate.
//! 3. While there is no candidate, a return frame is popped.
//!
//! Only one branch hop is resolved per call.

use log::debug;
use thiserror::Error;

use super::model::{ActionReference, Definition, StackFrame};
use super::state::RunProperties;

/// Default maximum call-stack depth.
pub const DEFAULT_MAX_STACK_DEPTH: usize = 64;

/// A definition-integrity violation detected while advancing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdvanceError {
    #[error("Sequence '{0}' does not exist in the definition")]
    UnknownSequence(String),

    #[error("Active step {0} no longer matches the definition")]
    UnknownAction(ActionReference),

    #[error("Call into '{sequence}' would exceed the maximum stack depth of {max_depth}")]
    StackOverflow { sequence: String, max_depth: usize },
}

impl AdvanceError {
    /// Short machine-readable code used when recording the failure.
    pub fn code(&self) -> &'static str {
        match self {
            Self::StackOverflow { .. } => "stack_overflow",
            Self::UnknownSequence(_) | Self::UnknownAction(_) => "definition_error",
        }
    }
}

/// Advances the program counter.
///
/// Returns the new active step, or `None` when the playbook has run to its
/// end. `properties` is only modified when the call succeeds.
///
/// # Example
///
/// ```
/// use playrunner::workflow::{advance, Action, Definition, RunProperties};
///
/// let definition = Definition::new("main")
///     .with_sequence("main", vec![Action::new("a"), Action::new("b")]);
/// let mut properties = RunProperties::default();
///
/// let first = advance(&definition, &mut properties, 8).unwrap().unwrap();
/// assert_eq!(first.action_id, "a");
/// ```
pub fn advance(
    definition: &Definition,
    properties: &mut RunProperties,
    max_stack_depth: usize,
) -> Result<Option<ActionReference>, AdvanceError> {
    let mut stack = properties.stack.clone();

    let mut candidate = match &properties.active_step {
        None => {
            let start = &definition.start_sequence;
            definition
                .sequence(start)
                .ok_or_else(|| AdvanceError::UnknownSequence(start.clone()))?;
            definition.first_action(start)
        }
        Some(active) => {
            definition
                .resolve(active)
                .ok_or_else(|| AdvanceError::UnknownAction(active.clone()))?;
            definition.action_at(&active.sequence_id, active.action_index + 1)
        }
    };

    let branch = properties
        .active_result()
        .and_then(|result| result.call_branch())
        .map(str::to_string);

    if let Some(sequence) = branch {
        definition
            .sequence(&sequence)
            .ok_or_else(|| AdvanceError::UnknownSequence(sequence.clone()))?;

        if let Some(return_point) = candidate.take() {
            if stack.len() >= max_stack_depth {
                return Err(AdvanceError::StackOverflow {
                    sequence,
                    max_depth: max_stack_depth,
                });
            }
            debug!("Calling '{}', will return to {}", sequence, return_point);
            stack.push(StackFrame::new(return_point));
        } else {
            debug!("Tail call into '{}'", sequence);
        }

        candidate = definition.first_action(&sequence);
    }

    if candidate.is_none() {
        if let Some(frame) = stack.pop() {
            debug!("Returning to {}", frame.reference);
            candidate = Some(frame.reference);
        }
    }

    properties.stack = stack;
    properties.active_step = candidate.clone();
    Ok(candidate)
}
