//! Run Store Module
//!
//! Durable storage for run state and the transactional outbox.
//!
//! A commit writes the new run state and stages the outbound messages the
//! transition produced in one atomic step. Messages stay in the outbox until
//! the engine acknowledges them, so a crash between commit and publish is
//! repaired by re-publishing on recovery.
//!
//! # Backends
//!
//! - [`MemoryRunStore`]: Mutex-guarded map for tests and embedded hosts
//! - [`FileRunStore`]: One JSON document per run under a state directory

pub mod file;
pub mod memory;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::execution::messages::OutboxEntry;
use crate::workflow::{Run, RunId};

pub use file::FileRunStore;
pub use memory::MemoryRunStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Run {0} already exists")]
    AlreadyExists(RunId),
    #[error("Run {0} not found")]
    NotFound(RunId),
    #[error("Run {run_id} was modified concurrently (expected version {expected}, found {actual})")]
    Conflict {
        run_id: RunId,
        expected: u64,
        actual: u64,
    },
    #[error("Invalid run id '{0}'")]
    InvalidRunId(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Store lock poisoned")]
    Poisoned,
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A run together with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRun {
    pub run: Run,
    pub version: u64,
}

/// Everything persisted for one run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub run: Run,
    pub version: u64,
    #[serde(default)]
    pub outbox: Vec<OutboxEntry>,
}

impl RunRecord {
    fn new(run: Run) -> Self {
        Self {
            run,
            version: 1,
            outbox: Vec::new(),
        }
    }

    /// Replaces the run and stages `messages` if `expected_version` matches.
    fn commit(
        &mut self,
        run: Run,
        expected_version: u64,
        messages: Vec<OutboxEntry>,
    ) -> StoreResult<u64> {
        if self.version != expected_version {
            return Err(StoreError::Conflict {
                run_id: run.id,
                expected: expected_version,
                actual: self.version,
            });
        }
        self.run = run;
        self.version += 1;
        self.outbox.extend(messages);
        Ok(self.version)
    }

    /// Removes one outbox entry; returns whether it was present.
    fn acknowledge(&mut self, message_id: Uuid) -> bool {
        let before = self.outbox.len();
        self.outbox.retain(|entry| entry.id != message_id);
        self.outbox.len() != before
    }

    fn stored(&self) -> StoredRun {
        StoredRun {
            run: self.run.clone(),
            version: self.version,
        }
    }
}

/// Persistence port for runs.
///
/// Every method is synchronous and must be safe to call from several tasks.
pub trait RunStore: Send + Sync {
    /// Stores a new run at version 1.
    fn insert(&self, run: Run) -> StoreResult<()>;

    /// Reads a run, or `None` when it does not exist.
    fn load(&self, run_id: &str) -> StoreResult<Option<StoredRun>>;

    /// Writes `run` and stages `messages` atomically; returns the new version.
    fn commit(
        &self,
        run: Run,
        expected_version: u64,
        messages: Vec<OutboxEntry>,
    ) -> StoreResult<u64>;

    /// Staged messages of a run that were not acknowledged yet, oldest first.
    fn pending_messages(&self, run_id: &str) -> StoreResult<Vec<OutboxEntry>>;

    /// Removes a handed-off message from the outbox. Unknown ids are ignored.
    fn acknowledge(&self, run_id: &str, message_id: Uuid) -> StoreResult<()>;

    /// Ids of every run with at least one staged message.
    fn runs_with_pending_messages(&self) -> StoreResult<Vec<RunId>>;

    /// Ids of every stored run.
    fn list_runs(&self) -> StoreResult<Vec<RunId>>;
}

/// Rejects ids that cannot be used as a storage key.
pub(crate) fn check_run_id(run_id: &str) -> StoreResult<()> {
    let valid = !run_id.is_empty()
        && run_id != "."
        && run_id != ".."
        && !run_id.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidRunId(run_id.to_string()))
    }
}
