//! In-memory run store.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use uuid::Uuid;

use super::{check_run_id, RunRecord, RunStore, StoreError, StoreResult, StoredRun};
use crate::execution::messages::OutboxEntry;
use crate::workflow::{Run, RunId};

/// Store that keeps every run in a mutex-guarded map.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    records: Mutex<BTreeMap<RunId, RunRecord>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> StoreResult<MutexGuard<'_, BTreeMap<RunId, RunRecord>>> {
        self.records.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Returns the full record of a run, outbox included.
    pub fn record(&self, run_id: &str) -> StoreResult<Option<RunRecord>> {
        Ok(self.records()?.get(run_id).cloned())
    }
}

impl RunStore for MemoryRunStore {
    fn insert(&self, run: Run) -> StoreResult<()> {
        check_run_id(&run.id)?;
        let mut records = self.records()?;
        if records.contains_key(&run.id) {
            return Err(StoreError::AlreadyExists(run.id));
        }
        records.insert(run.id.clone(), RunRecord::new(run));
        Ok(())
    }

    fn load(&self, run_id: &str) -> StoreResult<Option<StoredRun>> {
        Ok(self.records()?.get(run_id).map(RunRecord::stored))
    }

    fn commit(
        &self,
        run: Run,
        expected_version: u64,
        messages: Vec<OutboxEntry>,
    ) -> StoreResult<u64> {
        let mut records = self.records()?;
        match records.get_mut(&run.id) {
            Some(record) => record.commit(run, expected_version, messages),
            None => Err(StoreError::NotFound(run.id)),
        }
    }

    fn pending_messages(&self, run_id: &str) -> StoreResult<Vec<OutboxEntry>> {
        Ok(self
            .records()?
            .get(run_id)
            .map(|record| record.outbox.clone())
            .unwrap_or_default())
    }

    fn acknowledge(&self, run_id: &str, message_id: Uuid) -> StoreResult<()> {
        if let Some(record) = self.records()?.get_mut(run_id) {
            record.acknowledge(message_id);
        }
        Ok(())
    }

    fn runs_with_pending_messages(&self) -> StoreResult<Vec<RunId>> {
        Ok(self
            .records()?
            .values()
            .filter(|record| !record.outbox.is_empty())
            .map(|record| record.run.id.clone())
            .collect())
    }

    fn list_runs(&self) -> StoreResult<Vec<RunId>> {
        Ok(self.records()?.keys().cloned().collect())
    }
}
