//! File-backed run store.
//!
//! Each run lives in `{dir}/{run_id}.json` as a pretty-printed
//! [`RunRecord`]. Writes go to a temporary sibling file which is then
//! renamed over the record, so a crash leaves either the old or the new
//! document on disk.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use log::{debug, warn};
use uuid::Uuid;

use super::{check_run_id, RunRecord, RunStore, StoreError, StoreResult, StoredRun};
use crate::execution::messages::OutboxEntry;
use crate::workflow::{Run, RunId};

const RECORD_EXTENSION: &str = "json";

/// Store that keeps one JSON document per run in a directory.
#[derive(Debug)]
pub struct FileRunStore {
    dir: PathBuf,
    // Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl FileRunStore {
    /// Opens a store rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        debug!("Opened run store at {}", dir.display());
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn guard(&self) -> StoreResult<MutexGuard<'_, ()>> {
        self.write_lock.lock().map_err(|_| StoreError::Poisoned)
    }

    fn record_path(&self, run_id: &str) -> StoreResult<PathBuf> {
        check_run_id(run_id)?;
        Ok(self
            .dir
            .join(format!("{}.{}", run_id, RECORD_EXTENSION)))
    }

    fn read_record(&self, run_id: &str) -> StoreResult<Option<RunRecord>> {
        let path = self.record_path(run_id)?;
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_record(&self, record: &RunRecord) -> StoreResult<()> {
        let path = self.record_path(&record.run.id)?;
        let temp = path.with_extension(format!("{}.tmp", RECORD_EXTENSION));
        let content = serde_json::to_string_pretty(record)?;
        fs::write(&temp, content)?;
        fs::rename(&temp, &path)?;
        Ok(())
    }

    fn run_ids(&self) -> StoreResult<Vec<RunId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

impl RunStore for FileRunStore {
    fn insert(&self, run: Run) -> StoreResult<()> {
        let _guard = self.guard()?;
        if self.read_record(&run.id)?.is_some() {
            return Err(StoreError::AlreadyExists(run.id));
        }
        self.write_record(&RunRecord::new(run))
    }

    fn load(&self, run_id: &str) -> StoreResult<Option<StoredRun>> {
        Ok(self.read_record(run_id)?.map(|record| record.stored()))
    }

    fn commit(
        &self,
        run: Run,
        expected_version: u64,
        messages: Vec<OutboxEntry>,
    ) -> StoreResult<u64> {
        let _guard = self.guard()?;
        let mut record = self
            .read_record(&run.id)?
            .ok_or_else(|| StoreError::NotFound(run.id.clone()))?;
        let version = record.commit(run, expected_version, messages)?;
        self.write_record(&record)?;
        Ok(version)
    }

    fn pending_messages(&self, run_id: &str) -> StoreResult<Vec<OutboxEntry>> {
        Ok(self
            .read_record(run_id)?
            .map(|record| record.outbox)
            .unwrap_or_default())
    }

    fn acknowledge(&self, run_id: &str, message_id: Uuid) -> StoreResult<()> {
        let _guard = self.guard()?;
        if let Some(mut record) = self.read_record(run_id)? {
            if record.acknowledge(message_id) {
                self.write_record(&record)?;
            }
        }
        Ok(())
    }

    fn runs_with_pending_messages(&self) -> StoreResult<Vec<RunId>> {
        let mut pending = Vec::new();
        for run_id in self.run_ids()? {
            match self.read_record(&run_id) {
                Ok(Some(record)) if !record.outbox.is_empty() => pending.push(run_id),
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable run record {}: {}", run_id, e),
            }
        }
        Ok(pending)
    }

    fn list_runs(&self) -> StoreResult<Vec<RunId>> {
        self.run_ids()
    }
}
