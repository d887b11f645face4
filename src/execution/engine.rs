//! Playbook Execution Engine
//!
//! The host-facing side of the run state machine:
//! - Run creation with pre-start definition validation
//! - Commands (start, cancel, resume) and executor events
//! - Per-run serialization of event processing
//! - Optimistic commits with bounded retries on conflict
//! - Post-commit publishing of the run's outbox
//! - Recovery of staged but unpublished messages after a restart
//!
//! # Processing an event
//!
//! 1. Take the run's async lock
//! 2. Load the run and its version, apply the event
//! 3. Commit the new state together with the outbound messages
//! 4. Publish and acknowledge each staged message, emit measurements
//!
//! A conflicting commit means another writer got there first; the run is
//! reloaded and the event applied again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::{watch, Mutex as AsyncMutex};

use super::clock::{Clock, SystemClock};
use super::machine::{self, TransitionContext};
use super::messages::{OutboundMessage, OutboxEntry, RunEvent, RunInGroupComplete};
use super::step::{Dispatcher, InboundEvent, StepExecutor};
use crate::monitoring::{LogMetrics, Measurement, MetricsSink};
use crate::store::{RunStore, StoreError};
use crate::workflow::validator::unreachable_sequences;
use crate::workflow::{
    canonicalize_state, load_definition, ActionReference, AdvanceError, Definition,
    DefinitionError, Problem, Run, RunId, StateError, DEFAULT_MAX_STACK_DEPTH,
};

/// Default deadline for a single step.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(300);

/// Default number of retries after a conflicting commit.
pub const DEFAULT_MAX_COMMIT_RETRIES: usize = 3;

/// Engine tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub step_timeout: Duration,
    pub max_stack_depth: usize,
    pub max_commit_retries: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_timeout: DEFAULT_STEP_TIMEOUT,
            max_stack_depth: DEFAULT_MAX_STACK_DEPTH,
            max_commit_retries: DEFAULT_MAX_COMMIT_RETRIES,
        }
    }
}

/// Receives completion notices for runs that belong to a group.
pub trait GroupNotifier: Send + Sync {
    fn run_in_group_complete(&self, notice: &RunInGroupComplete);
}

/// Group notifier that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogGroupNotifier;

impl GroupNotifier for LogGroupNotifier {
    fn run_in_group_complete(&self, notice: &RunInGroupComplete) {
        info!(
            "Run {} in group {} completed",
            notice.run_id, notice.group_id
        );
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Run {0} not found")]
    UnknownRun(RunId),

    #[error("Run {0} already exists")]
    RunExists(RunId),

    #[error("Invalid definition: {0}")]
    Definition(#[from] DefinitionError),

    /// The run was finalized as Faulted before this error was raised.
    #[error("Run {run_id} faulted: {source}")]
    Integrity {
        run_id: RunId,
        #[source]
        source: AdvanceError,
    },

    /// The run was finalized as Faulted before this error was raised.
    #[error("Run {run_id} has an unreadable definition: {source}")]
    UnreadableDefinition {
        run_id: RunId,
        #[source]
        source: DefinitionError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Invalid resume state: {0}")]
    State(#[from] StateError),

    #[error("Run {run_id}: gave up after {attempts} conflicting commits")]
    Contention { run_id: RunId, attempts: usize },
}

/// Playbook execution engine.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use playrunner::execution::{DryRunExecutor, Engine};
/// use playrunner::store::MemoryRunStore;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut engine = Engine::new(
///         Arc::new(MemoryRunStore::new()),
///         Arc::new(DryRunExecutor::new()),
///     );
///     engine.set_step_timeout(std::time::Duration::from_secs(30));
///     let engine = Arc::new(engine);
///     tokio::spawn(Arc::clone(&engine).run_event_loop());
///
///     let playbook = "start_sequence: main\nsequences:\n  main:\n    - id: hello\n";
///     engine.create_run("run-1", playbook, None)?;
///     engine.start_executing("run-1").await?;
///     let run = engine.wait_for_final("run-1").await?;
///     println!("{:?}", run.result());
///     Ok(())
/// }
/// ```
pub struct Engine {
    store: Arc<dyn RunStore>,
    dispatcher: Dispatcher,
    metrics: Arc<dyn MetricsSink>,
    groups: Arc<dyn GroupNotifier>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    definitions: Mutex<HashMap<RunId, Arc<Definition>>>,
    run_locks: Mutex<HashMap<RunId, Arc<AsyncMutex<()>>>>,
    events: Mutex<Option<UnboundedReceiver<InboundEvent>>>,
    commits: watch::Sender<u64>,
}

impl Engine {
    /// Creates an engine over a store and an executor.
    pub fn new(store: Arc<dyn RunStore>, executor: Arc<dyn StepExecutor>) -> Self {
        let (events_tx, events_rx) = unbounded_channel();
        let (commits, _) = watch::channel(0);

        Self {
            store,
            dispatcher: Dispatcher::new(executor, events_tx),
            metrics: Arc::new(LogMetrics),
            groups: Arc::new(LogGroupNotifier),
            clock: Arc::new(SystemClock),
            config: EngineConfig::default(),
            definitions: Mutex::new(HashMap::new()),
            run_locks: Mutex::new(HashMap::new()),
            events: Mutex::new(Some(events_rx)),
            commits,
        }
    }

    pub fn set_metrics(&mut self, metrics: Arc<dyn MetricsSink>) {
        self.metrics = metrics;
    }

    pub fn set_group_notifier(&mut self, groups: Arc<dyn GroupNotifier>) {
        self.groups = groups;
    }

    pub fn set_clock(&mut self, clock: Arc<dyn Clock>) {
        self.clock = clock;
    }

    pub fn set_config(&mut self, config: EngineConfig) {
        self.config = config;
    }

    /// Sets the deadline for each step request.
    pub fn set_step_timeout(&mut self, timeout: Duration) {
        self.config.step_timeout = timeout;
    }

    /// Sets the maximum call-stack depth of a run.
    pub fn set_max_stack_depth(&mut self, depth: usize) {
        self.config.max_stack_depth = depth;
    }

    pub fn set_max_commit_retries(&mut self, retries: usize) {
        self.config.max_commit_retries = retries;
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validates `serialized_definition` and stores a new run in `Initial`.
    ///
    /// A definition that fails to load never creates a run.
    pub fn create_run(
        &self,
        run_id: &str,
        serialized_definition: &str,
        group: Option<&str>,
    ) -> Result<(), EngineError> {
        let definition = load_definition(serialized_definition)?;
        for sequence in unreachable_sequences(&definition) {
            warn!("Run {}: sequence '{}' is never called", run_id, sequence);
        }

        let mut run = Run::new(run_id, serialized_definition, self.clock.utc_now());
        if let Some(group) = group {
            run = run.with_group(group);
        }

        self.store.insert(run).map_err(|e| match e {
            StoreError::AlreadyExists(id) => EngineError::RunExists(id),
            other => EngineError::Store(other),
        })?;
        lock(&self.definitions).insert(run_id.to_string(), Arc::new(definition));

        info!("Created run {}", run_id);
        Ok(())
    }

    /// Starts a run; the first step is dispatched before this returns.
    pub async fn start_executing(&self, run_id: &str) -> Result<(), EngineError> {
        self.deliver(run_id, RunEvent::StartExecuting).await
    }

    /// Requests cancellation of a run.
    ///
    /// A run waiting on an active step is cancelled once that step reports.
    pub async fn cancel_playbook(&self, run_id: &str, canceller: &str) -> Result<(), EngineError> {
        self.deliver(
            run_id,
            RunEvent::CancellationRequested {
                by: canceller.to_string(),
            },
        )
        .await
    }

    /// Resumes a suspended step with additional state.
    ///
    /// `resume_state` may be any serializable value that forms an object
    /// (or nothing); it is merged over the state the step suspended with.
    pub async fn resume_suspended_step<T: Serialize>(
        &self,
        run_id: &str,
        step: &ActionReference,
        resume_state: T,
    ) -> Result<(), EngineError> {
        let resume_state = canonicalize_state(resume_state)?;
        self.deliver(
            run_id,
            RunEvent::ResumeExecuting {
                step: step.clone(),
                resume_state,
            },
        )
        .await
    }

    /// Applies one event to a run and publishes what it produced.
    pub async fn deliver(&self, run_id: &str, event: RunEvent) -> Result<(), EngineError> {
        let run_lock = self.run_lock(run_id);
        let _guard = run_lock.lock().await;
        debug!("Run {}: delivering {}", run_id, event.name());

        let mut attempts = 0;
        loop {
            let Some(stored) = self.store.load(run_id)? else {
                lock(&self.run_locks).remove(run_id);
                return Err(EngineError::UnknownRun(run_id.to_string()));
            };
            let mut run = stored.run;

            if run.state.is_final() {
                debug!("Run {} is final, ignoring {}", run_id, event.name());
                lock(&self.run_locks).remove(run_id);
                return Ok(());
            }

            let now = self.clock.utc_now();
            let (mut transition, unreadable) = match self.definition_for(&run) {
                Ok(definition) => {
                    let ctx = TransitionContext {
                        definition: &definition,
                        now,
                        step_timeout: self.config.step_timeout,
                        max_stack_depth: self.config.max_stack_depth,
                    };
                    (machine::apply(&mut run, &event, &ctx), None)
                }
                Err(e) => {
                    let problem = Problem::new("definition_error", e.to_string());
                    (machine::fault_unloadable(&mut run, problem, now), Some(e))
                }
            };

            if !transition.applied {
                return Ok(());
            }

            let outbox: Vec<OutboxEntry> = transition
                .messages
                .drain(..)
                .map(OutboxEntry::new)
                .collect();

            match self.store.commit(run.clone(), stored.version, outbox) {
                Ok(version) => {
                    debug!("Run {}: committed version {}", run_id, version);
                    self.after_commit(&run, transition.measurements)?;

                    if let Some(source) = unreadable {
                        return Err(EngineError::UnreadableDefinition {
                            run_id: run.id,
                            source,
                        });
                    }
                    if let Some(source) = transition.fault {
                        return Err(EngineError::Integrity {
                            run_id: run.id,
                            source,
                        });
                    }
                    return Ok(());
                }
                Err(e) if e.is_conflict() && attempts < self.config.max_commit_retries => {
                    attempts += 1;
                    warn!("{}, retrying ({}/{})", e, attempts, self.config.max_commit_retries);
                }
                Err(e) if e.is_conflict() => {
                    error!("{}", e);
                    return Err(EngineError::Contention {
                        run_id: run_id.to_string(),
                        attempts: attempts + 1,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn after_commit(
        &self,
        run: &Run,
        measurements: Vec<Measurement>,
    ) -> Result<(), EngineError> {
        let published = self.publish_pending(&run.id);

        for measurement in &measurements {
            measurement.emit(self.metrics.as_ref());
        }
        if run.state.is_final() {
            lock(&self.definitions).remove(&run.id);
            lock(&self.run_locks).remove(&run.id);
        }
        self.commits.send_modify(|count| *count += 1);

        published.map(|_| ())
    }

    /// Publishes and acknowledges every staged message of a run.
    fn publish_pending(&self, run_id: &str) -> Result<usize, EngineError> {
        let pending = self.store.pending_messages(run_id)?;
        let count = pending.len();

        for entry in pending {
            self.publish(entry.message);
            self.store.acknowledge(run_id, entry.id)?;
        }
        Ok(count)
    }

    fn publish(&self, message: OutboundMessage) {
        match message {
            OutboundMessage::RunStep(request) => self.dispatcher.dispatch(request),
            OutboundMessage::CancelSuspendedStep { run_id, step } => {
                self.dispatcher.cancel_suspended(run_id, step)
            }
            OutboundMessage::RunInGroupComplete(notice) => {
                self.groups.run_in_group_complete(&notice)
            }
        }
    }

    /// Applies executor events as they arrive.
    ///
    /// Runs until the engine is dropped. Events for different runs are
    /// processed concurrently. Only the first call consumes events.
    pub async fn run_event_loop(self: Arc<Self>) {
        let receiver = lock(&self.events).take();
        let Some(mut receiver) = receiver else {
            warn!("Event loop is already running");
            return;
        };

        while let Some((run_id, event)) = receiver.recv().await {
            let engine = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = engine.deliver(&run_id, event).await {
                    error!("Run {}: {}", run_id, e);
                }
            });
        }
    }

    /// Re-publishes every staged but unacknowledged message.
    ///
    /// Call once after a restart. Returns the number of messages published.
    pub async fn recover(&self) -> Result<usize, EngineError> {
        let mut total = 0;
        for run_id in self.store.runs_with_pending_messages()? {
            let run_lock = self.run_lock(&run_id);
            let _guard = run_lock.lock().await;
            total += self.publish_pending(&run_id)?;
            if self.run(&run_id)?.map_or(true, |run| run.state.is_final()) {
                lock(&self.run_locks).remove(&run_id);
            }
        }
        if total > 0 {
            info!("Recovered {} pending messages", total);
        }
        Ok(total)
    }

    /// Current state of a run.
    pub fn run(&self, run_id: &str) -> Result<Option<Run>, EngineError> {
        Ok(self.store.load(run_id)?.map(|stored| stored.run))
    }

    /// Waits until a run satisfies `predicate` and returns it.
    pub async fn wait_until(
        &self,
        run_id: &str,
        predicate: impl Fn(&Run) -> bool,
    ) -> Result<Run, EngineError> {
        let mut commits = self.commits.subscribe();
        loop {
            let run = self
                .run(run_id)?
                .ok_or_else(|| EngineError::UnknownRun(run_id.to_string()))?;
            if predicate(&run) {
                return Ok(run);
            }
            // The sender lives as long as the engine.
            let _ = commits.changed().await;
        }
    }

    /// Waits until a run reaches `Final`.
    pub async fn wait_for_final(&self, run_id: &str) -> Result<Run, EngineError> {
        self.wait_until(run_id, |run| run.state.is_final()).await
    }

    fn definition_for(&self, run: &Run) -> Result<Arc<Definition>, DefinitionError> {
        if let Some(definition) = lock(&self.definitions).get(&run.id) {
            return Ok(Arc::clone(definition));
        }
        let definition = Arc::new(load_definition(&run.definition)?);
        lock(&self.definitions).insert(run.id.clone(), Arc::clone(&definition));
        Ok(definition)
    }

    fn run_lock(&self, run_id: &str) -> Arc<AsyncMutex<()>> {
        Arc::clone(
            lock(&self.run_locks)
                .entry(run_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
