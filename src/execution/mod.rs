//! Playbook Execution Module
//!
//! Drives runs through their lifecycle: the pure transition table, the
//! host-facing engine that commits and publishes, and the dispatch channel
//! to the step executor.
//!
//! # Architecture
//!
//! - [`machine`]: Run state machine, one event at a time
//! - [`engine`]: Commands, commits, outbox publishing and recovery
//! - [`step`]: Executor port, dispatcher and dry-run executor
//! - [`messages`]: Run events and outbound messages
//! - [`clock`]: Injected time source

pub mod clock;
pub mod engine;
pub mod machine;
pub mod messages;
pub mod step;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{Engine, EngineConfig, EngineError, GroupNotifier, LogGroupNotifier};
pub use messages::{OutboundMessage, OutboxEntry, RunEvent, RunInGroupComplete, StepRequest};
pub use step::{DryRunExecutor, StepExecutor, StepFault};
