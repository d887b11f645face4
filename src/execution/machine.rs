//! Run State Machine
//!
//! The transition table of a playbook run. [`apply`] takes a run, one
//! event and the context it needs, mutates the run in place, and returns
//! what the engine must do once the new state is committed: outbound
//! messages to publish and measurements to emit.
//!
//! # States
//!
//! ```text
//! Initial -> ExecuteNextStep -> RunStep.Pending <-> Suspended
//!                 ^                   |
//!                 +-------------------+
//! ... -> CompletedSuccessfully | Cancelled -> Final
//! ```
//!
//! `ExecuteNextStep`, `CompletedSuccessfully` and `Cancelled` are left
//! within the same transition that entered them. `Final` absorbs every
//! later event.

use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};

use super::messages::{OutboundMessage, RunEvent, RunInGroupComplete, StepRequest};
use crate::monitoring::metrics::{to_duration, Measurement};
use crate::workflow::{
    advance, merge_suspend_state, ActionReference, AdvanceError, Definition, Problem, Run,
    RunOutcome, RunResult, RunState, StepOutcome, StepResult, SuspendState,
};

/// Everything a transition needs besides the run itself.
#[derive(Debug, Clone, Copy)]
pub struct TransitionContext<'a> {
    pub definition: &'a Definition,
    pub now: DateTime<Utc>,
    pub step_timeout: Duration,
    pub max_stack_depth: usize,
}

/// Effects of one applied event.
#[derive(Debug, Default)]
pub struct Transition {
    /// Whether the run changed; an unapplied event needs no commit
    pub applied: bool,
    /// Messages to stage in the outbox
    pub messages: Vec<OutboundMessage>,
    /// Measurements to emit after commit
    pub measurements: Vec<Measurement>,
    /// Definition-integrity violation that faulted the run
    pub fault: Option<AdvanceError>,
}

impl Transition {
    fn ignored() -> Self {
        Self::default()
    }

    fn changed() -> Self {
        Self {
            applied: true,
            ..Self::default()
        }
    }
}

/// Applies `event` to `run`.
pub fn apply(run: &mut Run, event: &RunEvent, ctx: &TransitionContext<'_>) -> Transition {
    let mut transition = match (run.state, event) {
        (RunState::Final, _) => {
            debug!("Run {} is final, ignoring {}", run.id, event.name());
            return Transition::ignored();
        }
        (_, RunEvent::TimeoutUnscheduled { step }) => {
            debug!("Run {}: stale unschedule acknowledgement for {}", run.id, step);
            return Transition::ignored();
        }

        (RunState::Initial, RunEvent::CancellationRequested { by }) => {
            run.properties.request_cancellation(by);
            run.state = RunState::Cancelled;
            Transition::changed()
        }
        (RunState::Initial, RunEvent::StartExecuting) => {
            run.started = Some(ctx.now);
            run.state = RunState::ExecuteNextStep;
            let mut transition = Transition::changed();
            transition
                .measurements
                .push(Measurement::ExecutionLatency(to_duration(ctx.now - run.created)));
            transition
        }

        (RunState::RunStepPending, RunEvent::CancellationRequested { by }) => {
            if !run.properties.request_cancellation(by) {
                return Transition::ignored();
            }
            info!(
                "Run {}: cancellation requested by {}, waiting for the active step",
                run.id, by
            );
            Transition::changed()
        }
        (RunState::RunStepPending, RunEvent::StepCompleted { step, result }) => {
            if !is_active(run, step) {
                return stale(run, event);
            }
            step_completed(run, step, result, ctx)
        }
        (RunState::RunStepPending, RunEvent::StepFaulted { step, error }) => {
            if !is_active(run, step) {
                return stale(run, event);
            }
            warn!("Run {}: step {} faulted: {}", run.id, step, error);
            run.properties.mark_completed(step);
            let mut transition = Transition::changed();
            finish(
                run,
                RunResult::new(
                    RunOutcome::Faulted,
                    Some(Problem::new("step_fault", error.clone())),
                ),
                ctx.now,
                &mut transition,
            );
            transition
        }
        (RunState::RunStepPending, RunEvent::StepTimeoutExpired { step }) => {
            if !is_active(run, step) {
                return stale(run, event);
            }
            warn!(
                "Run {}: step {} timed out after {:?}",
                run.id, step, ctx.step_timeout
            );
            run.properties.mark_completed(step);
            let mut transition = Transition::changed();
            transition.measurements.push(Measurement::StepTimedOut);
            finish(
                run,
                RunResult::new(
                    RunOutcome::TimedOut,
                    Some(Problem::new(
                        "step_timeout",
                        format!("No result for step {} within {:?}", step, ctx.step_timeout),
                    )),
                ),
                ctx.now,
                &mut transition,
            );
            transition
        }

        (RunState::Suspended, RunEvent::CancellationRequested { by }) => {
            run.properties.request_cancellation(by);
            let mut transition = Transition::changed();
            request_cancel_of_suspended_step(run, &mut transition);
            run.state = RunState::Cancelled;
            transition
        }
        (RunState::Suspended, RunEvent::ResumeExecuting { step, resume_state }) => {
            if !is_active(run, step) {
                return stale(run, event);
            }
            resume(run, step, resume_state, ctx)
        }

        _ => {
            debug!(
                "Run {}: {} has no effect in state {}",
                run.id,
                event.name(),
                run.state
            );
            return Transition::ignored();
        }
    };

    settle(run, ctx, &mut transition);
    transition
}

fn is_active(run: &Run, step: &ActionReference) -> bool {
    run.properties.active_step.as_ref() == Some(step)
}

fn stale(run: &Run, event: &RunEvent) -> Transition {
    debug!(
        "Run {}: ignoring {} for a step that is not active",
        run.id,
        event.name()
    );
    Transition::ignored()
}

fn step_completed(
    run: &mut Run,
    step: &ActionReference,
    result: &StepResult,
    ctx: &TransitionContext<'_>,
) -> Transition {
    let mut transition = Transition::changed();
    run.properties
        .step_results
        .insert(step.action_id.clone(), result.clone());

    match &result.outcome {
        StepOutcome::Succeeded { .. } => {
            debug!("Run {}: step {} succeeded", run.id, step);
            run.properties.mark_completed(step);
            run.state = RunState::ExecuteNextStep;
        }
        StepOutcome::CompletePlaybook => {
            info!("Run {}: step {} completed the playbook", run.id, step);
            run.properties.mark_completed(step);
            run.state = RunState::CompletedSuccessfully;
        }
        StepOutcome::Suspended {
            suspended_until, ..
        } => {
            info!("Run {}: step {} suspended", run.id, step);
            run.properties.last_suspend_time = Some(ctx.now);
            run.properties.suspended_until = *suspended_until;
            run.state = RunState::Suspended;

            if run.properties.is_cancellation_requested() {
                request_cancel_of_suspended_step(run, &mut transition);
                run.state = RunState::Cancelled;
            }
        }
        StepOutcome::Failed { problem } => {
            warn!("Run {}: step {} failed: {}", run.id, step, problem);
            run.properties.mark_completed(step);
            finish(
                run,
                RunResult::new(RunOutcome::Faulted, Some(problem.clone())),
                ctx.now,
                &mut transition,
            );
        }
        StepOutcome::Cancelled => {
            info!("Run {}: step {} reported cancellation", run.id, step);
            run.properties.mark_completed(step);
            run.state = RunState::Cancelled;
        }
    }

    transition
}

fn resume(
    run: &mut Run,
    step: &ActionReference,
    resume_state: &SuspendState,
    ctx: &TransitionContext<'_>,
) -> Transition {
    let mut transition = Transition::changed();

    let stored = run
        .properties
        .step_results
        .entry(step.action_id.clone())
        .or_insert_with(|| StepResult::suspended(SuspendState::new()));
    if stored.suspend_state().is_none() {
        *stored = StepResult::suspended(SuspendState::new());
    }

    let merged = match &mut stored.outcome {
        StepOutcome::Suspended { suspend_state, .. } => {
            merge_suspend_state(suspend_state, resume_state.clone());
            suspend_state.clone()
        }
        _ => resume_state.clone(),
    };

    if let Some(suspended_at) = run.properties.last_suspend_time.take() {
        transition
            .measurements
            .push(Measurement::SuspendDuration(to_duration(ctx.now - suspended_at)));
    }
    run.properties.suspended_until = None;

    info!("Run {}: resuming step {}", run.id, step);
    match ctx.definition.resolve(step) {
        Some(action) => {
            transition.messages.push(OutboundMessage::RunStep(StepRequest {
                run_id: run.id.clone(),
                step: step.clone(),
                action: action.clone(),
                timeout: ctx.step_timeout,
                suspend_state: Some(merged),
            }));
            run.state = RunState::RunStepPending;
        }
        None => {
            let fault = AdvanceError::UnknownAction(step.clone());
            fault_run(run, fault, ctx, &mut transition);
        }
    }

    transition
}

fn request_cancel_of_suspended_step(run: &Run, transition: &mut Transition) {
    if let Some(step) = &run.properties.active_step {
        transition.messages.push(OutboundMessage::CancelSuspendedStep {
            run_id: run.id.clone(),
            step: step.clone(),
        });
    }
}

/// Runs entry actions of transient states until the run rests.
fn settle(run: &mut Run, ctx: &TransitionContext<'_>, transition: &mut Transition) {
    loop {
        match run.state {
            RunState::ExecuteNextStep => execute_next_step(run, ctx, transition),
            RunState::CompletedSuccessfully => {
                finish(
                    run,
                    RunResult::new(RunOutcome::Succeeded, None),
                    ctx.now,
                    transition,
                );
            }
            RunState::Cancelled => enter_cancelled(run, ctx, transition),
            RunState::Initial
            | RunState::RunStepPending
            | RunState::Suspended
            | RunState::Final => return,
        }
    }
}

fn execute_next_step(run: &mut Run, ctx: &TransitionContext<'_>, transition: &mut Transition) {
    if run.properties.is_cancellation_requested() {
        run.state = RunState::Cancelled;
        return;
    }

    match advance(ctx.definition, &mut run.properties, ctx.max_stack_depth) {
        Ok(Some(step)) => match ctx.definition.resolve(&step) {
            Some(action) => {
                debug!("Run {}: dispatching step {}", run.id, step);
                transition.messages.push(OutboundMessage::RunStep(StepRequest {
                    run_id: run.id.clone(),
                    step: step.clone(),
                    action: action.clone(),
                    timeout: ctx.step_timeout,
                    suspend_state: None,
                }));
                run.state = RunState::RunStepPending;
            }
            None => fault_run(run, AdvanceError::UnknownAction(step), ctx, transition),
        },
        Ok(None) => {
            info!("Run {}: reached the end of the playbook", run.id);
            run.state = RunState::CompletedSuccessfully;
        }
        Err(fault) => fault_run(run, fault, ctx, transition),
    }
}

fn fault_run(
    run: &mut Run,
    fault: AdvanceError,
    ctx: &TransitionContext<'_>,
    transition: &mut Transition,
) {
    error!("Run {}: {}", run.id, fault);
    let problem = Problem::new(fault.code(), fault.to_string());
    transition.fault = Some(fault);
    finish(
        run,
        RunResult::new(RunOutcome::Faulted, Some(problem)),
        ctx.now,
        transition,
    );
}

fn enter_cancelled(run: &mut Run, ctx: &TransitionContext<'_>, transition: &mut Transition) {
    if let Some(step) = run.properties.active_step.clone() {
        let finished = run
            .properties
            .step_results
            .get(&step.action_id)
            .map(StepResult::is_terminal)
            .unwrap_or(false);

        // A step that already finished was recorded when its result arrived.
        if !finished {
            run.properties
                .step_results
                .insert(step.action_id.clone(), StepResult::cancelled());
            run.properties.mark_completed(&step);
        }
    }

    info!(
        "Run {}: cancelled by {}",
        run.id,
        run.properties
            .cancellation_requested_by
            .as_deref()
            .unwrap_or("executor")
    );
    finish(
        run,
        RunResult::new(RunOutcome::Cancelled, None),
        ctx.now,
        transition,
    );
}

/// Enters `Final`: records the result and completion time, and stages the
/// completion measurements and group notification.
fn finish(run: &mut Run, result: RunResult, now: DateTime<Utc>, transition: &mut Transition) {
    let result = run.properties.result.get_or_insert(result).clone();

    run.state = RunState::Final;
    run.completed = Some(now);
    run.properties.active_step = None;
    run.properties.stack.clear();
    run.properties.suspended_until = None;

    let started = run.started.unwrap_or(run.created);
    transition.measurements.extend([
        Measurement::ExecutionDuration {
            duration: to_duration(now - started),
            outcome: result.outcome,
        },
        Measurement::StepsExecuted(run.properties.completed_steps.len()),
        Measurement::ExecutionCompleted(result.outcome),
    ]);

    if let Some(group_id) = &run.group {
        transition
            .messages
            .push(OutboundMessage::RunInGroupComplete(RunInGroupComplete {
                group_id: group_id.clone(),
                run_id: run.id.clone(),
            }));
    }

    info!("Run {} finished: {}", run.id, result.outcome);
}

/// Faults a run whose stored definition can no longer be loaded.
///
/// Final runs are left alone and produce an unapplied transition.
pub fn fault_unloadable(run: &mut Run, problem: Problem, now: DateTime<Utc>) -> Transition {
    if run.state.is_final() {
        return Transition::ignored();
    }
    error!("Run {}: {}", run.id, problem);
    let mut transition = Transition::changed();
    finish(
        run,
        RunResult::new(RunOutcome::Faulted, Some(problem)),
        now,
        &mut transition,
    );
    transition
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{Action, StackFrame};
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn definition() -> Definition {
        Definition::new("main")
            .with_sequence("main", vec![Action::new("a"), Action::new("b")])
            .with_sequence("sub", vec![Action::new("c")])
    }

    fn context(definition: &Definition, now: DateTime<Utc>) -> TransitionContext<'_> {
        TransitionContext {
            definition,
            now,
            step_timeout: Duration::from_secs(300),
            max_stack_depth: 4,
        }
    }

    fn step(id: &str, index: usize) -> ActionReference {
        ActionReference::new("main", id, index)
    }

    fn started_run(definition: &Definition, now: DateTime<Utc>) -> Run {
        let mut run = Run::new("run-1", "", now);
        apply(&mut run, &RunEvent::StartExecuting, &context(definition, now));
        run
    }

    fn dispatched(transition: &Transition) -> Vec<ActionReference> {
        transition
            .messages
            .iter()
            .filter_map(|m| match m {
                OutboundMessage::RunStep(request) => Some(request.step.clone()),
                _ => None,
            })
            .collect()
    }

    fn completed(step: ActionReference, result: StepResult) -> RunEvent {
        RunEvent::StepCompleted { step, result }
    }

    #[test]
    fn test_start_dispatches_first_step() {
        let definition = definition();
        let created = Utc::now();
        let now = created + ChronoDuration::seconds(2);
        let mut run = Run::new("run-1", "", created);

        let transition = apply(&mut run, &RunEvent::StartExecuting, &context(&definition, now));

        assert!(transition.applied);
        assert_eq!(run.state, RunState::RunStepPending);
        assert_eq!(run.started, Some(now));
        assert_eq!(dispatched(&transition), vec![step("a", 0)]);
        assert_eq!(
            transition.measurements,
            vec![Measurement::ExecutionLatency(Duration::from_secs(2))]
        );
    }

    #[test]
    fn test_start_twice_is_ignored() {
        let definition = definition();
        let now = Utc::now();
        let mut run = started_run(&definition, now);

        let transition = apply(&mut run, &RunEvent::StartExecuting, &context(&definition, now));
        assert!(!transition.applied);
        assert_eq!(run.state, RunState::RunStepPending);
    }

    #[test]
    fn test_success_advances() {
        let definition = definition();
        let now = Utc::now();
        let mut run = started_run(&definition, now);

        let transition = apply(
            &mut run,
            &completed(step("a", 0), StepResult::succeeded()),
            &context(&definition, now),
        );

        assert_eq!(dispatched(&transition), vec![step("b", 1)]);
        assert_eq!(run.properties.completed_steps, vec![step("a", 0)]);
        assert_eq!(run.state, RunState::RunStepPending);
    }

    #[test]
    fn test_last_success_completes_run() {
        let definition = definition();
        let now = Utc::now();
        let mut run = started_run(&definition, now);
        let ctx = context(&definition, now);

        apply(&mut run, &completed(step("a", 0), StepResult::succeeded()), &ctx);
        let transition = apply(&mut run, &completed(step("b", 1), StepResult::succeeded()), &ctx);

        assert_eq!(run.state, RunState::Final);
        assert_eq!(run.result().unwrap().outcome, RunOutcome::Succeeded);
        assert_eq!(run.completed, Some(now));
        assert!(run.properties.active_step.is_none());
        assert!(transition
            .measurements
            .contains(&Measurement::StepsExecuted(2)));
        assert!(transition
            .measurements
            .contains(&Measurement::ExecutionCompleted(RunOutcome::Succeeded)));
    }

    #[test]
    fn test_non_matching_result_is_ignored() {
        let definition = definition();
        let now = Utc::now();
        let mut run = started_run(&definition, now);
        let before = run.clone();

        let transition = apply(
            &mut run,
            &completed(step("b", 1), StepResult::succeeded()),
            &context(&definition, now),
        );

        assert!(!transition.applied);
        assert_eq!(run, before);
    }

    #[test]
    fn test_failure_faults_run() {
        let definition = definition();
        let now = Utc::now();
        let mut run = started_run(&definition, now);

        let problem = Problem::new("http_500", "upstream error");
        apply(
            &mut run,
            &completed(step("a", 0), StepResult::failed(problem.clone())),
            &context(&definition, now),
        );

        assert_eq!(run.state, RunState::Final);
        assert_eq!(
            run.result(),
            Some(&RunResult::new(RunOutcome::Faulted, Some(problem)))
        );
        assert_eq!(run.properties.completed_steps, vec![step("a", 0)]);
    }

    #[test]
    fn test_fault_without_result() {
        let definition = definition();
        let now = Utc::now();
        let mut run = started_run(&definition, now);

        apply(
            &mut run,
            &RunEvent::StepFaulted {
                step: step("a", 0),
                error: "connection reset".to_string(),
            },
            &context(&definition, now),
        );

        let result = run.result().unwrap();
        assert_eq!(result.outcome, RunOutcome::Faulted);
        assert_eq!(result.problem.as_ref().unwrap().code, "step_fault");
        assert_eq!(run.properties.completed_steps, vec![step("a", 0)]);
    }

    #[test]
    fn test_timeout() {
        let definition = definition();
        let now = Utc::now();
        let mut run = started_run(&definition, now);

        let transition = apply(
            &mut run,
            &RunEvent::StepTimeoutExpired { step: step("a", 0) },
            &context(&definition, now),
        );

        assert_eq!(run.result().unwrap().outcome, RunOutcome::TimedOut);
        assert_eq!(transition.measurements[0], Measurement::StepTimedOut);
        assert_eq!(run.properties.completed_steps, vec![step("a", 0)]);
    }

    #[test]
    fn test_timeout_after_success_is_ignored() {
        let definition = definition();
        let now = Utc::now();
        let mut run = started_run(&definition, now);
        let ctx = context(&definition, now);

        apply(&mut run, &completed(step("a", 0), StepResult::succeeded()), &ctx);
        let transition = apply(&mut run, &RunEvent::StepTimeoutExpired { step: step("a", 0) }, &ctx);

        assert!(!transition.applied);
        assert_eq!(run.state, RunState::RunStepPending);
    }

    #[test]
    fn test_complete_playbook_stops_early() {
        let definition = definition();
        let now = Utc::now();
        let mut run = started_run(&definition, now);

        let transition = apply(
            &mut run,
            &completed(step("a", 0), StepResult::complete_playbook()),
            &context(&definition, now),
        );

        assert!(dispatched(&transition).is_empty());
        assert_eq!(run.result().unwrap().outcome, RunOutcome::Succeeded);
        assert_eq!(run.properties.completed_steps, vec![step("a", 0)]);
    }

    #[test]
    fn test_cancel_in_initial() {
        let definition = definition();
        let now = Utc::now();
        let mut run = Run::new("run-1", "", now);

        apply(
            &mut run,
            &RunEvent::CancellationRequested {
                by: "alice".to_string(),
            },
            &context(&definition, now),
        );

        assert_eq!(run.state, RunState::Final);
        assert_eq!(run.result().unwrap().outcome, RunOutcome::Cancelled);
        assert!(run.properties.completed_steps.is_empty());
        assert_eq!(
            run.properties.cancellation_requested_by.as_deref(),
            Some("alice")
        );
    }

    #[test]
    fn test_cancel_while_pending_is_deferred() {
        let definition = definition();
        let now = Utc::now();
        let mut run = started_run(&definition, now);
        let ctx = context(&definition, now);
        let cancel = RunEvent::CancellationRequested {
            by: "alice".to_string(),
        };

        let transition = apply(&mut run, &cancel, &ctx);
        assert!(transition.applied);
        assert!(transition.messages.is_empty());
        assert_eq!(run.state, RunState::RunStepPending);

        assert!(!apply(&mut run, &cancel, &ctx).applied);

        let transition = apply(&mut run, &completed(step("a", 0), StepResult::succeeded()), &ctx);
        assert!(dispatched(&transition).is_empty());
        assert_eq!(run.result().unwrap().outcome, RunOutcome::Cancelled);
        assert_eq!(run.properties.completed_steps, vec![step("a", 0)]);
        assert_eq!(
            run.properties.step_results["a"],
            StepResult::succeeded()
        );
    }

    #[test]
    fn test_failure_wins_over_pending_cancellation() {
        let definition = definition();
        let now = Utc::now();
        let mut run = started_run(&definition, now);
        let ctx = context(&definition, now);

        apply(
            &mut run,
            &RunEvent::CancellationRequested {
                by: "alice".to_string(),
            },
            &ctx,
        );
        apply(
            &mut run,
            &completed(step("a", 0), StepResult::failed(Problem::new("x", "y"))),
            &ctx,
        );

        assert_eq!(run.result().unwrap().outcome, RunOutcome::Faulted);
    }

    fn suspended_run(definition: &Definition, now: DateTime<Utc>) -> Run {
        let mut run = started_run(definition, now);
        let mut state = SuspendState::new();
        state.insert("ticket".to_string(), json!(42));
        apply(
            &mut run,
            &completed(step("a", 0), StepResult::suspended(state)),
            &context(definition, now),
        );
        run
    }

    #[test]
    fn test_suspend_records_time_and_hint() {
        let definition = definition();
        let now = Utc::now();
        let until = now + ChronoDuration::hours(1);
        let mut run = started_run(&definition, now);

        apply(
            &mut run,
            &completed(
                step("a", 0),
                StepResult::suspended(SuspendState::new()).with_suspended_until(until),
            ),
            &context(&definition, now),
        );

        assert_eq!(run.state, RunState::Suspended);
        assert_eq!(run.properties.last_suspend_time, Some(now));
        assert_eq!(run.properties.suspended_until, Some(until));
        assert!(run.properties.completed_steps.is_empty());
        assert_eq!(run.properties.active_step, Some(step("a", 0)));
    }

    #[test]
    fn test_suspended_ignores_timeouts_and_foreign_resumes() {
        let definition = definition();
        let now = Utc::now();
        let mut run = suspended_run(&definition, now);
        let ctx = context(&definition, now);

        assert!(!apply(&mut run, &RunEvent::StepTimeoutExpired { step: step("a", 0) }, &ctx).applied);
        assert!(!apply(
            &mut run,
            &RunEvent::ResumeExecuting {
                step: step("b", 1),
                resume_state: SuspendState::new(),
            },
            &ctx
        )
        .applied);
        assert!(!apply(
            &mut run,
            &RunEvent::ResumeExecuting {
                step: ActionReference::new("main", "a", 1),
                resume_state: SuspendState::new(),
            },
            &ctx
        )
        .applied);
        assert_eq!(run.state, RunState::Suspended);
    }

    #[test]
    fn test_resume_merges_state_and_redispatches() {
        let definition = definition();
        let now = Utc::now();
        let later = now + ChronoDuration::seconds(90);
        let mut run = suspended_run(&definition, now);

        let mut resume_state = SuspendState::new();
        resume_state.insert("approved".to_string(), json!(true));
        resume_state.insert("ticket".to_string(), json!(43));

        let transition = apply(
            &mut run,
            &RunEvent::ResumeExecuting {
                step: step("a", 0),
                resume_state,
            },
            &context(&definition, later),
        );

        assert_eq!(run.state, RunState::RunStepPending);
        assert!(run.properties.last_suspend_time.is_none());
        assert_eq!(
            transition.measurements,
            vec![Measurement::SuspendDuration(Duration::from_secs(90))]
        );

        let request = match &transition.messages[..] {
            [OutboundMessage::RunStep(request)] => request,
            other => panic!("unexpected messages: {:?}", other),
        };
        assert_eq!(request.step, step("a", 0));
        let sent = request.suspend_state.as_ref().unwrap();
        assert_eq!(sent["ticket"], json!(43));
        assert_eq!(sent["approved"], json!(true));

        let stored = run.properties.step_results["a"].suspend_state().unwrap();
        assert_eq!(stored, sent);
    }

    #[test]
    fn test_cancel_while_suspended_is_immediate() {
        let definition = definition();
        let now = Utc::now();
        let mut run = suspended_run(&definition, now);

        let transition = apply(
            &mut run,
            &RunEvent::CancellationRequested {
                by: "bob".to_string(),
            },
            &context(&definition, now),
        );

        assert_eq!(
            transition.messages,
            vec![OutboundMessage::CancelSuspendedStep {
                run_id: "run-1".to_string(),
                step: step("a", 0),
            }]
        );
        assert_eq!(run.result().unwrap().outcome, RunOutcome::Cancelled);
        assert_eq!(run.properties.step_results["a"], StepResult::cancelled());
        assert_eq!(run.properties.completed_steps, vec![step("a", 0)]);
    }

    #[test]
    fn test_suspend_after_pending_cancel_cancels() {
        let definition = definition();
        let now = Utc::now();
        let mut run = started_run(&definition, now);
        let ctx = context(&definition, now);

        apply(
            &mut run,
            &RunEvent::CancellationRequested {
                by: "alice".to_string(),
            },
            &ctx,
        );
        let transition = apply(
            &mut run,
            &completed(step("a", 0), StepResult::suspended(SuspendState::new())),
            &ctx,
        );

        assert!(matches!(
            transition.messages[0],
            OutboundMessage::CancelSuspendedStep { .. }
        ));
        assert_eq!(run.result().unwrap().outcome, RunOutcome::Cancelled);
    }

    #[test]
    fn test_final_is_absorbing() {
        let definition = definition();
        let now = Utc::now();
        let mut run = started_run(&definition, now);
        let ctx = context(&definition, now);

        apply(&mut run, &RunEvent::StepTimeoutExpired { step: step("a", 0) }, &ctx);
        let before = run.clone();

        for event in [
            RunEvent::StartExecuting,
            RunEvent::CancellationRequested {
                by: "x".to_string(),
            },
            completed(step("a", 0), StepResult::succeeded()),
            RunEvent::StepTimeoutExpired { step: step("a", 0) },
        ] {
            let transition = apply(&mut run, &event, &ctx);
            assert!(!transition.applied);
            assert!(transition.measurements.is_empty());
        }
        assert_eq!(run, before);
    }

    #[test]
    fn test_unschedule_ack_ignored_everywhere() {
        let definition = definition();
        let now = Utc::now();
        let ack = RunEvent::TimeoutUnscheduled { step: step("a", 0) };
        let ctx = context(&definition, now);

        let mut initial = Run::new("run-1", "", now);
        let mut pending = started_run(&definition, now);
        let mut suspended = suspended_run(&definition, now);

        for run in [&mut initial, &mut pending, &mut suspended] {
            let before = run.clone();
            assert!(!apply(run, &ack, &ctx).applied);
            assert_eq!(*run, before);
        }
    }

    #[test]
    fn test_group_member_notification() {
        let definition = definition();
        let now = Utc::now();
        let mut run = Run::new("run-1", "", now).with_group("batch-7");

        let transition = apply(
            &mut run,
            &RunEvent::CancellationRequested {
                by: "alice".to_string(),
            },
            &context(&definition, now),
        );

        assert_eq!(
            transition.messages,
            vec![OutboundMessage::RunInGroupComplete(RunInGroupComplete {
                group_id: "batch-7".to_string(),
                run_id: "run-1".to_string(),
            })]
        );
    }

    #[test]
    fn test_branch_into_unknown_sequence_faults() {
        let definition = definition();
        let now = Utc::now();
        let mut run = started_run(&definition, now);

        let transition = apply(
            &mut run,
            &completed(step("a", 0), StepResult::call("ghost")),
            &context(&definition, now),
        );

        assert_eq!(
            transition.fault,
            Some(AdvanceError::UnknownSequence("ghost".to_string()))
        );
        let result = run.result().unwrap();
        assert_eq!(result.outcome, RunOutcome::Faulted);
        assert_eq!(result.problem.as_ref().unwrap().code, "definition_error");
    }

    #[test]
    fn test_stack_overflow_faults() {
        let definition = definition();
        let now = Utc::now();
        let mut run = started_run(&definition, now);
        run.properties.stack = (0..4)
            .map(|_| StackFrame::new(step("b", 1)))
            .collect();

        apply(
            &mut run,
            &completed(step("a", 0), StepResult::call("sub")),
            &context(&definition, now),
        );

        let result = run.result().unwrap();
        assert_eq!(result.problem.as_ref().unwrap().code, "stack_overflow");
        assert!(run.properties.stack.is_empty());
    }

    #[test]
    fn test_branch_dispatches_called_sequence() {
        let definition = definition();
        let now = Utc::now();
        let mut run = started_run(&definition, now);

        let transition = apply(
            &mut run,
            &completed(step("a", 0), StepResult::call("sub")),
            &context(&definition, now),
        );

        assert_eq!(
            dispatched(&transition),
            vec![ActionReference::new("sub", "c", 0)]
        );
        assert_eq!(run.properties.stack, vec![StackFrame::new(step("b", 1))]);
    }

    #[test]
    fn test_recursive_tail_calls_count_every_execution() {
        let definition = Definition::new("main").with_sequence("main", vec![Action::new("x")]);
        let now = Utc::now();
        let mut run = started_run(&definition, now);
        let ctx = context(&definition, now);
        let x = step("x", 0);

        for _ in 0..2 {
            let transition = apply(&mut run, &completed(x.clone(), StepResult::call("main")), &ctx);
            assert_eq!(dispatched(&transition), vec![x.clone()]);
            assert!(run.properties.stack.is_empty());
        }
        let transition = apply(&mut run, &completed(x.clone(), StepResult::succeeded()), &ctx);

        assert_eq!(run.result().unwrap().outcome, RunOutcome::Succeeded);
        assert_eq!(run.properties.completed_steps, vec![x.clone(), x.clone(), x]);
        assert!(transition
            .measurements
            .contains(&Measurement::StepsExecuted(3)));
    }

    #[test]
    fn test_cancel_after_finished_step_records_it_once() {
        let definition = definition();
        let now = Utc::now();
        let mut run = started_run(&definition, now);
        let ctx = context(&definition, now);

        apply(
            &mut run,
            &RunEvent::CancellationRequested {
                by: "alice".to_string(),
            },
            &ctx,
        );
        let transition = apply(&mut run, &completed(step("a", 0), StepResult::cancelled()), &ctx);

        assert_eq!(run.result().unwrap().outcome, RunOutcome::Cancelled);
        assert_eq!(run.properties.completed_steps, vec![step("a", 0)]);
        assert!(transition
            .measurements
            .contains(&Measurement::StepsExecuted(1)));
    }

    #[test]
    fn test_fault_unloadable_finalizes_once() {
        let definition = definition();
        let now = Utc::now();
        let mut run = started_run(&definition, now);

        let transition = fault_unloadable(
            &mut run,
            Problem::new("definition_error", "stored definition is unreadable"),
            now,
        );
        assert!(transition.applied);
        assert_eq!(run.state, RunState::Final);
        assert_eq!(run.result().unwrap().outcome, RunOutcome::Faulted);
        assert!(run.properties.active_step.is_none());

        let again = fault_unloadable(&mut run, Problem::new("other", "ignored"), now);
        assert!(!again.applied);
        assert_eq!(run.result().unwrap().problem.as_ref().unwrap().code, "definition_error");
    }
}
