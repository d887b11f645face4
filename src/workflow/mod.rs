//! Playbook Definition Module
//!
//! Provides data structures and utilities for defining, parsing and
//! validating playbooks, plus the per-run state and the program-counter
//! advancer that walks a definition.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Definition, Sequence, Action)
//! - [`parser`]: YAML loading and saving
//! - [`validator`]: Structural validation rules
//! - [`state`]: Durable run state (Run, RunProperties, StepResult)
//! - [`advancer`]: Next-step computation with call/return semantics

pub mod advancer;
pub mod model;
pub mod parser;
pub mod state;
pub mod validator;

pub use advancer::{advance, AdvanceError, DEFAULT_MAX_STACK_DEPTH};
pub use model::{Action, ActionReference, Definition, Sequence, StackFrame};
pub use parser::{load_definition, load_definition_file, DefinitionError};
pub use state::{
    canonicalize_state, merge_suspend_state, CallBranch, GroupId, Problem, Run, RunId,
    RunOutcome, RunProperties, RunResult, RunState, StateError, StepOutcome, StepResult,
    SuspendState,
};
pub use validator::{validate_definition, ValidationError};
