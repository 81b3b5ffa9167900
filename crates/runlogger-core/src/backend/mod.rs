//! Tracking backends: the remote (or local) store of sweeps, runs and logs.
//!
//! Everything the logger persists goes through the [`Backend`] trait. Payloads
//! reaching a backend are already normalised JSON; backends only report
//! failures, the retry policy lives in [`crate::retry::ResilientClient`].

use serde_json::Value;

use crate::error::{BackendError, Result};
use crate::models::{EntryKind, InsertedRun, RunId, SweepId, SweepMethod, SweepSpec};

pub mod hasura;
pub mod jsonl;
pub mod memory;

pub use hasura::{HasuraBackend, Mutations};
pub use jsonl::JsonLinesBackend;
pub use memory::{MemoryBackend, RecordedCall};

pub type BackendResult<T> = std::result::Result<T, BackendError>;

pub trait Backend: Send {
    /// Acquire the connection or local resource. Called once when a logger opens.
    fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    /// Release whatever `connect` acquired. Called once when a logger closes.
    fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }

    fn insert_sweep(
        &mut self,
        method: SweepMethod,
        metadata: &Value,
        spec: &SweepSpec,
        charts: &[Value],
    ) -> BackendResult<SweepId>;

    /// Register a run. When `sweep_id` is given the sweep's grid index must be
    /// returned and advanced in one atomic step.
    fn insert_run(
        &mut self,
        metadata: &Value,
        charts: &[Value],
        sweep_id: Option<SweepId>,
    ) -> BackendResult<InsertedRun>;

    /// Merge `metadata` into the run's stored metadata.
    fn update_run_metadata(&mut self, run_id: RunId, metadata: &Value) -> BackendResult<()>;

    fn append_logs(&mut self, rows: &[Value]) -> BackendResult<()>;

    fn append_blobs(&mut self, rows: &[Value]) -> BackendResult<()>;

    fn append(&mut self, kind: EntryKind, rows: &[Value]) -> BackendResult<()> {
        match kind {
            EntryKind::Log => self.append_logs(rows),
            EntryKind::Blob => self.append_blobs(rows),
        }
    }
}

/// Shared per-sweep grid counter.
///
/// `fetch_increment` must behave as one serialisable read-modify-write
/// across every process using the sweep: it returns the value before the
/// increment, or `None` for sweeps that keep no index (random sweeps).
/// Two workers can only receive the same grid index if an implementation
/// breaks this.
pub trait GridCounter {
    fn fetch_increment(&self, sweep_id: SweepId) -> BackendResult<Option<u64>>;
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    fn connect(&mut self) -> Result<()> {
        (**self).connect()
    }

    fn disconnect(&mut self) -> Result<()> {
        (**self).disconnect()
    }

    fn insert_sweep(
        &mut self,
        method: SweepMethod,
        metadata: &Value,
        spec: &SweepSpec,
        charts: &[Value],
    ) -> BackendResult<SweepId> {
        (**self).insert_sweep(method, metadata, spec, charts)
    }

    fn insert_run(
        &mut self,
        metadata: &Value,
        charts: &[Value],
        sweep_id: Option<SweepId>,
    ) -> BackendResult<InsertedRun> {
        (**self).insert_run(metadata, charts, sweep_id)
    }

    fn update_run_metadata(&mut self, run_id: RunId, metadata: &Value) -> BackendResult<()> {
        (**self).update_run_metadata(run_id, metadata)
    }

    fn append_logs(&mut self, rows: &[Value]) -> BackendResult<()> {
        (**self).append_logs(rows)
    }

    fn append_blobs(&mut self, rows: &[Value]) -> BackendResult<()> {
        (**self).append_blobs(rows)
    }
}
