//! Step Dispatch
//!
//! Hands step requests to the external executor and turns whatever comes
//! back into ordinary run events:
//! - a result becomes `StepCompleted`
//! - an executor error becomes `StepFaulted`
//! - no answer within the request's timeout becomes `StepTimeoutExpired`
//!
//! Each request runs on its own tokio task. Events travel back to the
//! engine over an unbounded channel and are applied by its event loop.
//!
//! Hand-off is at-least-once: after a crash a request may be sent again,
//! and a result for a step that is no longer active is ignored by the run.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::timeout;

use super::messages::{RunEvent, StepRequest};
use crate::workflow::{ActionReference, RunId, StepResult};

/// An executor failure that produced no step result.
#[derive(Debug, Clone, Error)]
pub enum StepFault {
    #[error("Executor unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Failed(String),
}

/// Port to whatever actually performs steps.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Runs one step and reports its result.
    async fn run_step(&self, request: StepRequest) -> Result<StepResult, StepFault>;

    /// Tells the executor to abandon a suspended step.
    async fn cancel_suspended_step(
        &self,
        run_id: &str,
        step: &ActionReference,
    ) -> Result<(), StepFault>;
}

/// An event addressed to one run.
pub type InboundEvent = (RunId, RunEvent);

/// Spawns executor calls and reports their outcome as run events.
#[derive(Clone)]
pub struct Dispatcher {
    executor: Arc<dyn StepExecutor>,
    events: UnboundedSender<InboundEvent>,
}

impl Dispatcher {
    pub fn new(executor: Arc<dyn StepExecutor>, events: UnboundedSender<InboundEvent>) -> Self {
        Self { executor, events }
    }

    /// Sends a step request to the executor on a new task.
    pub fn dispatch(&self, request: StepRequest) {
        let executor = Arc::clone(&self.executor);
        let events = self.events.clone();

        tokio::spawn(async move {
            let run_id = request.run_id.clone();
            debug!("Dispatching step {} of run {}", request.step, run_id);

            let event = run_with_timeout(executor.as_ref(), request).await;
            if events.send((run_id.clone(), event)).is_err() {
                warn!("Engine stopped, dropping step outcome for run {}", run_id);
            }
        });
    }

    /// Asks the executor to cancel a suspended step on a new task.
    pub fn cancel_suspended(&self, run_id: RunId, step: ActionReference) {
        let executor = Arc::clone(&self.executor);

        tokio::spawn(async move {
            match executor.cancel_suspended_step(&run_id, &step).await {
                Ok(()) => debug!("Cancelled suspended step {} of run {}", step, run_id),
                Err(e) => warn!(
                    "Failed to cancel suspended step {} of run {}: {}",
                    step, run_id, e
                ),
            }
        });
    }
}

/// Runs one request, bounded by its timeout, and maps the outcome to an
/// event for the run.
pub async fn run_with_timeout(executor: &dyn StepExecutor, request: StepRequest) -> RunEvent {
    let step = request.step.clone();
    let limit = request.timeout;

    match timeout(limit, executor.run_step(request)).await {
        Ok(Ok(result)) => RunEvent::StepCompleted { step, result },
        Ok(Err(fault)) => RunEvent::StepFaulted {
            step,
            error: fault.to_string(),
        },
        Err(_) => RunEvent::StepTimeoutExpired { step },
    }
}

/// Executor that performs nothing.
///
/// Every step succeeds. An action that declares calls branches into its
/// first declared sequence the first time it is reached in a run, so each
/// declared call path is walked once.
#[derive(Debug, Default)]
pub struct DryRunExecutor {
    visited: Mutex<HashSet<(RunId, ActionReference)>>,
    executed: Mutex<Vec<ActionReference>>,
}

impl DryRunExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Steps executed so far, in order.
    pub fn executed(&self) -> Vec<ActionReference> {
        lock(&self.executed).clone()
    }

    fn first_visit(&self, run_id: &str, step: &ActionReference) -> bool {
        lock(&self.visited).insert((run_id.to_string(), step.clone()))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl StepExecutor for DryRunExecutor {
    async fn run_step(&self, request: StepRequest) -> Result<StepResult, StepFault> {
        let action = &request.action;
        match &action.action_type {
            Some(action_type) => info!("[DRY RUN] {} ({})", request.step, action_type),
            None => info!("[DRY RUN] {}", request.step),
        }

        lock(&self.executed).push(request.step.clone());

        let result = match action.calls.first() {
            Some(target) if self.first_visit(&request.run_id, &request.step) => {
                info!("[DRY RUN] {} calls '{}'", request.step, target);
                StepResult::call(target.clone())
            }
            _ => StepResult::succeeded(),
        };
        Ok(result)
    }

    async fn cancel_suspended_step(
        &self,
        run_id: &str,
        step: &ActionReference,
    ) -> Result<(), StepFault> {
        info!("[DRY RUN] cancel {} of run {}", step, run_id);
        Ok(())
    }
}
