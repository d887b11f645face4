//! PlayRunner - Durable Playbook Execution Engine
//!
//! Runs declarative playbooks one step at a time. A playbook is a set of
//! named sequences of actions; an action may branch into another sequence
//! and execution returns to the caller when that sequence ends. Every run
//! is a persisted state machine that survives restarts, can be suspended
//! and resumed with external state, and can be cancelled at any point.
//!
//! # Architecture
//!
//! The library is organized into four main modules:
//!
//! - [`workflow`]: Definitions, run state and the program-counter advancer
//! - [`execution`]: Run state machine, engine and step dispatch
//! - [`store`]: Versioned run storage with a transactional outbox
//! - [`monitoring`]: Metrics port and in-memory recorder
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use playrunner::execution::{DryRunExecutor, Engine};
//! use playrunner::store::MemoryRunStore;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let playbook = std::fs::read_to_string("playbook.yaml")?;
//!
//!     // Create execution engine
//!     let engine = Arc::new(Engine::new(
//!         Arc::new(MemoryRunStore::new()),
//!         Arc::new(DryRunExecutor::new()),
//!     ));
//!     tokio::spawn(Arc::clone(&engine).run_event_loop());
//!
//!     // Execute the playbook
//!     engine.create_run("run-1", &playbook, None)?;
//!     engine.start_executing("run-1").await?;
//!     engine.wait_for_final("run-1").await?;
//!     Ok(())
//! }
//! ```

pub mod execution;
pub mod monitoring;
pub mod store;
pub mod workflow;

// Re-export commonly used types
pub use execution::engine::{Engine, EngineConfig, EngineError};
pub use workflow::model::{Action, Definition};
pub use workflow::parser::load_definition;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "PlayRunner";
