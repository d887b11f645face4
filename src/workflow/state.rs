//! Run State
//!
//! The durable state of a single playbook run: its lifecycle state, the
//! program counter and call stack, every step result, and the final
//! outcome once known.
//!
//! Everything here is plain serde data so that a run can be persisted by
//! any [`crate::store::RunStore`] and re-entered after a restart.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::model::{ActionReference, StackFrame};

/// Identifier of a run.
pub type RunId = String;

/// Identifier of a group of runs.
pub type GroupId = String;

/// Opaque key/value bag carried across suspend and resume.
pub type SuspendState = Map<String, Value>;

/// Errors converting external data into run state.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Resume state must be a key/value object, got {0}")]
    NotAnObject(&'static str),

    #[error("Resume state could not be converted: {0}")]
    Conversion(#[from] serde_json::Error),
}

/// Structured description of a failure.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Problem {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl Problem {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Request to transfer control into another sequence.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CallBranch {
    pub sequence_name: String,
}

/// Outcome of one step, with only the fields relevant to that outcome.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_branch: Option<CallBranch>,
    },
    Failed {
        problem: Problem,
    },
    Suspended {
        #[serde(default)]
        suspend_state: SuspendState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        suspended_until: Option<DateTime<Utc>>,
    },
    CompletePlaybook,
    Cancelled,
}

/// Result reported for a step, plus the audit data that came with it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepResult {
    pub outcome: StepOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,
}

impl StepResult {
    fn from_outcome(outcome: StepOutcome) -> Self {
        Self {
            outcome,
            inputs: None,
            outputs: None,
        }
    }

    pub fn succeeded() -> Self {
        Self::from_outcome(StepOutcome::Succeeded { call_branch: None })
    }

    /// A successful result that asks the engine to call `sequence` next.
    pub fn call(sequence: impl Into<String>) -> Self {
        Self::from_outcome(StepOutcome::Succeeded {
            call_branch: Some(CallBranch {
                sequence_name: sequence.into(),
            }),
        })
    }

    pub fn failed(problem: Problem) -> Self {
        Self::from_outcome(StepOutcome::Failed { problem })
    }

    pub fn suspended(suspend_state: SuspendState) -> Self {
        Self::from_outcome(StepOutcome::Suspended {
            suspend_state,
            suspended_until: None,
        })
    }

    pub fn complete_playbook() -> Self {
        Self::from_outcome(StepOutcome::CompletePlaybook)
    }

    pub fn cancelled() -> Self {
        Self::from_outcome(StepOutcome::Cancelled)
    }

    pub fn with_inputs(mut self, inputs: Value) -> Self {
        self.inputs = Some(inputs);
        self
    }

    pub fn with_outputs(mut self, outputs: Value) -> Self {
        self.outputs = Some(outputs);
        self
    }

    /// Sets the resume hint on a suspended result; no-op for other outcomes.
    pub fn with_suspended_until(mut self, until: DateTime<Utc>) -> Self {
        if let StepOutcome::Suspended {
            suspended_until, ..
        } = &mut self.outcome
        {
            *suspended_until = Some(until);
        }
        self
    }

    /// Name of the sequence this result branches into, if any.
    ///
    /// An empty sequence name counts as no branch.
    pub fn call_branch(&self) -> Option<&str> {
        match &self.outcome {
            StepOutcome::Succeeded {
                call_branch: Some(branch),
            } if !branch.sequence_name.is_empty() => Some(branch.sequence_name.as_str()),
            _ => None,
        }
    }

    /// Whether this result ends the step (everything except suspension).
    pub fn is_terminal(&self) -> bool {
        !matches!(self.outcome, StepOutcome::Suspended { .. })
    }

    /// Suspend state carried by a suspended result.
    pub fn suspend_state(&self) -> Option<&SuspendState> {
        match &self.outcome {
            StepOutcome::Suspended { suspend_state, .. } => Some(suspend_state),
            _ => None,
        }
    }
}

/// Final outcome of a run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    Faulted,
    TimedOut,
    Cancelled,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Succeeded => "succeeded",
            Self::Faulted => "faulted",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunResult {
    pub outcome: RunOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem: Option<Problem>,
}

impl RunResult {
    pub fn new(outcome: RunOutcome, problem: Option<Problem>) -> Self {
        Self { outcome, problem }
    }
}

/// Lifecycle state of a run.
///
/// `ExecuteNextStep`, `CompletedSuccessfully` and `Cancelled` are transient:
/// a transition passes through them but never stops there.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Initial,
    ExecuteNextStep,
    #[serde(rename = "RunStep.Pending")]
    RunStepPending,
    Suspended,
    CompletedSuccessfully,
    Cancelled,
    Final,
}

impl RunState {
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Final)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Initial => "Initial",
            Self::ExecuteNextStep => "ExecuteNextStep",
            Self::RunStepPending => "RunStep.Pending",
            Self::Suspended => "Suspended",
            Self::CompletedSuccessfully => "CompletedSuccessfully",
            Self::Cancelled => "Cancelled",
            Self::Final => "Final",
        };
        f.write_str(label)
    }
}

/// Mutable execution properties of a run.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RunProperties {
    /// Step outstanding or about to be dispatched; `None` before start and after the end
    #[serde(default)]
    pub active_step: Option<ActionReference>,

    /// Every step that reached an outcome, in order
    #[serde(default)]
    pub completed_steps: Vec<ActionReference>,

    /// Latest result per action id
    #[serde(default)]
    pub step_results: BTreeMap<String, StepResult>,

    /// Call stack of return points
    #[serde(default)]
    pub stack: Vec<StackFrame>,

    /// Who asked for cancellation (set once)
    #[serde(default)]
    pub cancellation_requested_by: Option<String>,

    #[serde(default)]
    pub suspended_until: Option<DateTime<Utc>>,

    #[serde(default)]
    pub last_suspend_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub result: Option<RunResult>,
}

impl RunProperties {
    /// Latest result recorded for the active step.
    pub fn active_result(&self) -> Option<&StepResult> {
        let active = self.active_step.as_ref()?;
        self.step_results.get(&active.action_id)
    }

    /// Records the canceller unless one is already set.
    ///
    /// Returns `true` if this call set it.
    pub fn request_cancellation(&mut self, by: &str) -> bool {
        if self.cancellation_requested_by.is_some() {
            return false;
        }
        self.cancellation_requested_by = Some(by.to_string());
        true
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.cancellation_requested_by.is_some()
    }

    /// Appends `step` to the completed list. A step reached again, as in a
    /// recursive tail call, is recorded once per execution.
    pub fn mark_completed(&mut self, step: &ActionReference) {
        self.completed_steps.push(step.clone());
    }
}

/// One executing instance of a definition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Run {
    pub id: RunId,

    /// Serialized definition, exactly as submitted
    pub definition: String,

    pub state: RunState,

    #[serde(default)]
    pub properties: RunProperties,

    pub created: DateTime<Utc>,

    #[serde(default)]
    pub started: Option<DateTime<Utc>>,

    #[serde(default)]
    pub completed: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupId>,
}

impl Run {
    /// Creates a run in the `Initial` state.
    pub fn new(id: impl Into<RunId>, definition: impl Into<String>, created: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            definition: definition.into(),
            state: RunState::Initial,
            properties: RunProperties::default(),
            created,
            started: None,
            completed: None,
            group: None,
        }
    }

    pub fn with_group(mut self, group: impl Into<GroupId>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn result(&self) -> Option<&RunResult> {
        self.properties.result.as_ref()
    }
}

/// Converts any serializable value into the in-process suspend-state form.
///
/// Resume payloads and stored results may come from different
/// serializers (JSON, YAML, typed structs); all of them are reduced to the
/// same JSON object representation before merging.
pub fn canonicalize_state<T: Serialize>(value: T) -> Result<SuspendState, StateError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(SuspendState::new()),
        other => Err(StateError::NotAnObject(value_kind(&other))),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Merges `incoming` into `stored`; incoming values win per key.
pub fn merge_suspend_state(stored: &mut SuspendState, incoming: SuspendState) {
    for (key, value) in incoming {
        stored.insert(key, value);
    }
}
