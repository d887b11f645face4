//! Run Events and Outbound Messages
//!
//! Events are everything that can drive a run's state machine; outbound
//! messages are the side effects a transition wants performed. Outbound
//! messages are staged in the run store together with the state change
//! and only published after the commit.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{Action, ActionReference, GroupId, RunId, StepResult, SuspendState};

/// An event delivered to a single run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    StartExecuting,
    CancellationRequested {
        by: String,
    },
    StepCompleted {
        step: ActionReference,
        result: StepResult,
    },
    /// The executor failed without producing a result.
    StepFaulted {
        step: ActionReference,
        error: String,
    },
    StepTimeoutExpired {
        step: ActionReference,
    },
    ResumeExecuting {
        step: ActionReference,
        #[serde(default)]
        resume_state: SuspendState,
    },
    /// Late acknowledgement that a step timer was cancelled.
    TimeoutUnscheduled {
        step: ActionReference,
    },
}

impl RunEvent {
    /// Short name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartExecuting => "StartExecuting",
            Self::CancellationRequested { .. } => "CancellationRequested",
            Self::StepCompleted { .. } => "StepCompleted",
            Self::StepFaulted { .. } => "StepFaulted",
            Self::StepTimeoutExpired { .. } => "StepTimeoutExpired",
            Self::ResumeExecuting { .. } => "ResumeExecuting",
            Self::TimeoutUnscheduled { .. } => "TimeoutUnscheduled",
        }
    }
}

/// Request sent to the step executor.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepRequest {
    pub run_id: RunId,
    pub step: ActionReference,
    pub action: Action,
    /// Deadline for the executor's answer
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    /// State saved by an earlier suspension of this step, when resuming
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend_state: Option<SuspendState>,
}

/// Published when a run that belongs to a group finalizes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RunInGroupComplete {
    pub group_id: GroupId,
    pub run_id: RunId,
}

/// A side effect staged by a transition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "message", rename_all = "snake_case")]
pub enum OutboundMessage {
    RunStep(StepRequest),
    CancelSuspendedStep {
        run_id: RunId,
        step: ActionReference,
    },
    RunInGroupComplete(RunInGroupComplete),
}

/// An outbound message waiting in a run's outbox.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub message: OutboundMessage,
}

impl OutboxEntry {
    pub fn new(message: OutboundMessage) -> Self {
        Self {
            id: Uuid::new_v4(),
            message,
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
