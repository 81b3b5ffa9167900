//! In-process backend.
//!
//! Clones share one store behind a mutex, so several loggers on different
//! threads can run a sweep against it exactly as separate workers would
//! against a remote service. It also records every call it receives and can
//! be told to fail the next few, which is what the tests lean on.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tracing::debug;

use super::{Backend, BackendResult, GridCounter};
use crate::error::{BackendError, Result};
use crate::models::{InsertedRun, RunId, SweepId, SweepMethod, SweepSpec, SweepState};

/// One call as seen by the backend, successful or not.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    Connect,
    Disconnect,
    InsertSweep { method: SweepMethod },
    InsertRun { sweep_id: Option<SweepId> },
    UpdateRunMetadata { run_id: RunId },
    AppendLogs { rows: Vec<Value> },
    AppendBlobs { rows: Vec<Value> },
}

#[derive(Debug, Clone)]
pub struct StoredSweep {
    pub id: SweepId,
    pub method: SweepMethod,
    pub metadata: Value,
    pub spec: SweepSpec,
    pub charts: Vec<Value>,
    pub grid_index: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct StoredRun {
    pub id: RunId,
    pub metadata: Value,
    pub charts: Vec<Value>,
    pub sweep_id: Option<SweepId>,
}

#[derive(Debug, Default)]
struct Store {
    sweeps: Vec<StoredSweep>,
    runs: Vec<StoredRun>,
    logs: Vec<Value>,
    blobs: Vec<Value>,
    calls: Vec<RecordedCall>,
    failures: VecDeque<BackendError>,
}

impl Store {
    /// Record the call, then fail it if a failure is queued.
    fn enter(&mut self, call: RecordedCall) -> BackendResult<()> {
        self.calls.push(call);
        match self.failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    store: Arc<Mutex<Store>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next calls fail with the given errors, in order.
    pub fn fail_next(&self, errors: impl IntoIterator<Item = BackendError>) {
        self.store().failures.extend(errors);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.store().calls.clone()
    }

    /// Calls that carry data, i.e. everything except connect/disconnect.
    pub fn remote_calls(&self) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c, RecordedCall::Connect | RecordedCall::Disconnect))
            .collect()
    }

    pub fn sweep(&self, id: SweepId) -> Option<StoredSweep> {
        self.store().sweeps.iter().find(|s| s.id == id).cloned()
    }

    pub fn run(&self, id: RunId) -> Option<StoredRun> {
        self.store().runs.iter().find(|r| r.id == id).cloned()
    }

    pub fn logs(&self) -> Vec<Value> {
        self.store().logs.clone()
    }

    pub fn blobs(&self) -> Vec<Value> {
        self.store().blobs.clone()
    }
}

impl GridCounter for MemoryBackend {
    fn fetch_increment(&self, sweep_id: SweepId) -> BackendResult<Option<u64>> {
        let mut store = self.store();
        let sweep = store
            .sweeps
            .iter_mut()
            .find(|s| s.id == sweep_id)
            .ok_or_else(|| BackendError::permanent(format!("sweep {sweep_id} does not exist")))?;
        let previous = sweep.grid_index;
        if let Some(index) = sweep.grid_index.as_mut() {
            *index += 1;
        }
        Ok(previous)
    }
}

impl Backend for MemoryBackend {
    fn connect(&mut self) -> Result<()> {
        self.store().calls.push(RecordedCall::Connect);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        self.store().calls.push(RecordedCall::Disconnect);
        Ok(())
    }

    fn insert_sweep(
        &mut self,
        method: SweepMethod,
        metadata: &Value,
        spec: &SweepSpec,
        charts: &[Value],
    ) -> BackendResult<SweepId> {
        let mut store = self.store();
        store.enter(RecordedCall::InsertSweep { method })?;
        let id = store.sweeps.len() as SweepId + 1;
        store.sweeps.push(StoredSweep {
            id,
            method,
            metadata: metadata.clone(),
            spec: spec.clone(),
            charts: charts.to_vec(),
            grid_index: method.initial_grid_index(),
        });
        debug!(sweep_id = id, %method, "stored sweep");
        Ok(id)
    }

    fn insert_run(
        &mut self,
        metadata: &Value,
        charts: &[Value],
        sweep_id: Option<SweepId>,
    ) -> BackendResult<InsertedRun> {
        self.store().enter(RecordedCall::InsertRun { sweep_id })?;

        let sweep = match sweep_id {
            Some(sweep_id) => {
                let grid_index = self.fetch_increment(sweep_id)?;
                let spec = self
                    .sweep(sweep_id)
                    .map(|s| s.spec)
                    .ok_or_else(|| BackendError::permanent(format!("sweep {sweep_id} vanished")))?;
                Some(SweepState { spec, grid_index })
            }
            None => None,
        };

        let mut store = self.store();
        let id = store.runs.len() as RunId + 1;
        store.runs.push(StoredRun {
            id,
            metadata: metadata.clone(),
            charts: charts.to_vec(),
            sweep_id,
        });
        Ok(InsertedRun { run_id: id, sweep })
    }

    fn update_run_metadata(&mut self, run_id: RunId, metadata: &Value) -> BackendResult<()> {
        let mut store = self.store();
        store.enter(RecordedCall::UpdateRunMetadata { run_id })?;
        let run = store
            .runs
            .iter_mut()
            .find(|r| r.id == run_id)
            .ok_or_else(|| BackendError::permanent(format!("run {run_id} does not exist")))?;
        merge_objects(&mut run.metadata, metadata);
        Ok(())
    }

    fn append_logs(&mut self, rows: &[Value]) -> BackendResult<()> {
        let mut store = self.store();
        store.enter(RecordedCall::AppendLogs {
            rows: rows.to_vec(),
        })?;
        store.logs.extend_from_slice(rows);
        Ok(())
    }

    fn append_blobs(&mut self, rows: &[Value]) -> BackendResult<()> {
        let mut store = self.store();
        store.enter(RecordedCall::AppendBlobs {
            rows: rows.to_vec(),
        })?;
        store.blobs.extend_from_slice(rows);
        Ok(())
    }
}

/// Shallow merge, later keys win; the same semantics as jsonb `||`.
fn merge_objects(target: &mut Value, update: &Value) {
    match (target, update) {
        (Value::Object(existing), Value::Object(new)) => {
            for (k, v) in new {
                existing.insert(k.clone(), v.clone());
            }
        }
        (target, update) => *target = update.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn grid_spec() -> SweepSpec {
        SweepSpec::new().with_choice("lr", vec![json!(0.1), json!(0.01)])
    }

    #[test]
    fn grid_counter_returns_previous_value() {
        let mut backend = MemoryBackend::new();
        let id = backend
            .insert_sweep(SweepMethod::Grid, &json!({}), &grid_spec(), &[])
            .unwrap();
        assert_eq!(backend.fetch_increment(id).unwrap(), Some(0));
        assert_eq!(backend.fetch_increment(id).unwrap(), Some(1));
        assert_eq!(backend.sweep(id).unwrap().grid_index, Some(2));
    }

    #[test]
    fn random_sweeps_keep_no_index() {
        let mut backend = MemoryBackend::new();
        let id = backend
            .insert_sweep(SweepMethod::Random, &json!({}), &grid_spec(), &[])
            .unwrap();
        assert_eq!(backend.fetch_increment(id).unwrap(), None);
    }

    #[test]
    fn unknown_sweep_is_permanent_failure() {
        let mut backend = MemoryBackend::new();
        let err = backend.insert_run(&json!({}), &[], Some(42)).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn injected_failures_are_consumed_in_order() {
        let mut backend = MemoryBackend::new();
        backend.fail_next([BackendError::transient("a"), BackendError::permanent("b")]);
        assert_eq!(backend.append_logs(&[]), Err(BackendError::transient("a")));
        assert_eq!(backend.append_logs(&[]), Err(BackendError::permanent("b")));
        assert!(backend.append_logs(&[json!(1)]).is_ok());
        assert_eq!(backend.logs(), vec![json!(1)]);
        assert_eq!(backend.calls().len(), 3);
    }

    #[test]
    fn metadata_updates_merge() {
        let mut backend = MemoryBackend::new();
        let run = backend.insert_run(&json!({"name": "a"}), &[], None).unwrap();
        backend
            .update_run_metadata(run.run_id, &json!({"score": 1.5}))
            .unwrap();
        assert_eq!(
            backend.run(run.run_id).unwrap().metadata,
            json!({"name": "a", "score": 1.5})
        );
    }
}
