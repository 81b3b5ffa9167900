//! The per-worker run logger.
//!
//! A `RunLogger` registers one run at a time with its backend, hands back
//! the run's sweep parameters, and streams log and blob entries through two
//! debounced buffers. It is synchronous: every call returns once the backend
//! has answered, retries included.
//!
//! ```no_run
//! use runlogger_core::{open_logger, LoggerConfig};
//! use serde_json::json;
//!
//! let mut logger = open_logger(&LoggerConfig::from_env()?)?;
//! let params = logger.create_run(json!({"name": "baseline"}), None, Some(3))?;
//! for step in 0..100 {
//!     logger.log(json!({"step": step, "loss": 1.0 / (step as f64 + 1.0)}))?;
//! }
//! logger.close()?;
//! # let _ = params;
//! # Ok::<(), runlogger_core::RunLoggerError>(())
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::assign::SweepAssigner;
use crate::backend::{Backend, HasuraBackend, JsonLinesBackend};
use crate::clock::{Clock, Sleeper, SystemClock};
use crate::config::{BackendKind, LoggerConfig};
use crate::error::{Result, RunLoggerError};
use crate::jsonify::{jsonify, Payload};
use crate::models::{
    EntryKind, ParameterAssignment, RunEntry, RunId, SweepId, SweepMethod, SweepSpec,
};
use crate::retry::ResilientClient;
use crate::sink::BufferedSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggerState {
    Unopened,
    Open,
    Closed,
}

pub struct RunLogger<B: Backend = Box<dyn Backend>> {
    client: ResilientClient<B>,
    logs: BufferedSink,
    blobs: BufferedSink,
    assigner: SweepAssigner,
    debounce: Duration,
    run_id: Option<RunId>,
    state: LoggerState,
}

impl<B: Backend> RunLogger<B> {
    /// Wrap `backend`; nothing is contacted until [`RunLogger::open`].
    pub fn new(backend: B, config: &LoggerConfig) -> Self {
        let debounce = config.debounce();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            client: ResilientClient::new(backend, config.retry.clone()),
            logs: BufferedSink::with_clock(EntryKind::Log, debounce, clock.clone()),
            blobs: BufferedSink::with_clock(EntryKind::Blob, debounce, clock),
            assigner: SweepAssigner::new(config.seed),
            debounce,
            run_id: None,
            state: LoggerState::Unopened,
        }
    }

    /// Replace the time source of both buffers. Anything already buffered is dropped.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.logs = BufferedSink::with_clock(EntryKind::Log, self.debounce, clock.clone());
        self.blobs = BufferedSink::with_clock(EntryKind::Blob, self.debounce, clock);
        self
    }

    pub fn with_sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.client.set_sleeper(sleeper);
        self
    }

    pub fn state(&self) -> LoggerState {
        self.state
    }

    pub fn run_id(&self) -> Option<RunId> {
        self.run_id
    }

    pub fn backend(&self) -> &B {
        self.client.backend()
    }

    /// Entries waiting in the buffer of the given kind.
    pub fn pending(&self, kind: EntryKind) -> usize {
        self.sink(kind).len()
    }

    pub fn open(&mut self) -> Result<()> {
        match self.state {
            LoggerState::Open => Ok(()),
            LoggerState::Closed => Err(RunLoggerError::Precondition(
                "open called on a closed logger".to_string(),
            )),
            LoggerState::Unopened => {
                self.client.backend_mut().connect()?;
                self.state = LoggerState::Open;
                debug!("run logger opened");
                Ok(())
            }
        }
    }

    /// Register a sweep and return its id. Grid sweeps start at index 0.
    pub fn create_sweep(
        &mut self,
        method: SweepMethod,
        metadata: impl Into<Payload>,
        spec: &SweepSpec,
        charts: &[Payload],
    ) -> Result<SweepId> {
        self.ensure_open("create_sweep")?;
        spec.validate()?;
        let sweep_id = self
            .client
            .create_sweep(method, &metadata.into(), spec, charts)?;
        info!(sweep_id, %method, params = spec.len(), "created sweep");
        Ok(sweep_id)
    }

    /// Register a run and make it the target of later calls.
    ///
    /// When `sweep_id` is given the run joins that sweep and the parameters
    /// chosen for it are returned. Entries still buffered for a previous run
    /// are flushed first.
    pub fn create_run(
        &mut self,
        metadata: impl Into<Payload>,
        charts: Option<&[Payload]>,
        sweep_id: Option<SweepId>,
    ) -> Result<Option<ParameterAssignment>> {
        self.ensure_open("create_run")?;
        if self.run_id.is_some() {
            self.flush()?;
        }

        let inserted = self
            .client
            .create_run(&metadata.into(), charts.unwrap_or_default(), sweep_id)?;
        self.run_id = Some(inserted.run_id);
        info!(run_id = inserted.run_id, sweep_id = ?sweep_id, "created run");

        match (sweep_id, inserted.sweep) {
            (Some(_), Some(state)) => self.assigner.assign(&state).map(Some),
            (Some(sweep_id), None) => {
                debug!(sweep_id, "backend keeps no sweep state; no parameters assigned");
                Ok(None)
            }
            (None, _) => Ok(None),
        }
    }

    /// Merge `metadata` into the current run's metadata right away.
    pub fn update_metadata(&mut self, metadata: impl Into<Payload>) -> Result<()> {
        let run_id = self.require_run("update_metadata")?;
        self.client.update_metadata(run_id, &metadata.into())
    }

    pub fn log(&mut self, log: impl Into<Payload>) -> Result<()> {
        self.enqueue(EntryKind::Log, log.into())
    }

    pub fn blob(&mut self, blob: impl Into<Payload>) -> Result<()> {
        self.enqueue(EntryKind::Blob, blob.into())
    }

    /// Send everything buffered, ignoring the debounce interval.
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_open("flush")?;
        let logs = self.logs.flush(&mut self.client);
        let blobs = self.blobs.flush(&mut self.client);
        logs.and(blobs)
    }

    /// Flush both buffers and release the backend.
    ///
    /// The backend is disconnected even if flushing fails; the first error
    /// is returned. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            LoggerState::Closed => return Ok(()),
            LoggerState::Unopened => {
                self.state = LoggerState::Closed;
                return Ok(());
            }
            LoggerState::Open => {}
        }

        let flushed = self.flush();
        let disconnected = self.client.backend_mut().disconnect();
        self.state = LoggerState::Closed;
        info!(run_id = ?self.run_id, "run logger closed");
        flushed.and(disconnected)
    }

    fn enqueue(&mut self, kind: EntryKind, payload: Payload) -> Result<()> {
        let run_id = self.require_run(match kind {
            EntryKind::Log => "log",
            EntryKind::Blob => "blob",
        })?;
        let entry = RunEntry {
            run_id,
            payload: jsonify(&payload)?,
        };
        let sink = match kind {
            EntryKind::Log => &mut self.logs,
            EntryKind::Blob => &mut self.blobs,
        };
        sink.enqueue(entry, &mut self.client)?;
        Ok(())
    }

    fn sink(&self, kind: EntryKind) -> &BufferedSink {
        match kind {
            EntryKind::Log => &self.logs,
            EntryKind::Blob => &self.blobs,
        }
    }

    fn ensure_open(&self, operation: &str) -> Result<()> {
        match self.state {
            LoggerState::Open => Ok(()),
            LoggerState::Unopened => Err(RunLoggerError::Precondition(format!(
                "{operation} called before open"
            ))),
            LoggerState::Closed => Err(RunLoggerError::Precondition(format!(
                "{operation} called on a closed logger"
            ))),
        }
    }

    fn require_run(&self, operation: &str) -> Result<RunId> {
        self.ensure_open(operation)?;
        self.run_id.ok_or_else(|| {
            RunLoggerError::Precondition(format!("{operation} called before create_run"))
        })
    }
}

impl<B: Backend> fmt::Debug for RunLogger<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLogger")
            .field("state", &self.state)
            .field("run_id", &self.run_id)
            .field("pending_logs", &self.logs.len())
            .field("pending_blobs", &self.blobs.len())
            .field("debounce", &self.debounce)
            .finish_non_exhaustive()
    }
}

impl<B: Backend> Drop for RunLogger<B> {
    fn drop(&mut self) {
        if self.state == LoggerState::Open {
            if let Err(e) = self.close() {
                warn!(error = %e, "failed to close run logger on drop");
            }
        }
    }
}

/// Build the backend `config` names and return an opened logger for it.
pub fn open_logger(config: &LoggerConfig) -> Result<RunLogger> {
    config.validate()?;
    let backend: Box<dyn Backend> = match config.backend {
        BackendKind::Hasura => {
            let endpoint = config.endpoint.as_deref().unwrap_or_default();
            Box::new(HasuraBackend::new(endpoint, config.admin_secret.clone())?)
        }
        BackendKind::Jsonl => {
            let dir = config.log_dir.clone().unwrap_or_default();
            Box::new(JsonLinesBackend::new(dir))
        }
    };
    let mut logger = RunLogger::new(backend, config);
    logger.open()?;
    Ok(logger)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendResult, MemoryBackend, RecordedCall};
    use crate::clock::{ManualClock, RecordingSleeper};
    use crate::error::BackendError;
    use crate::models::InsertedRun;
    use serde_json::{json, Value};

    /// Accepts every log row except those whose payload is `"bad"`.
    #[derive(Default)]
    struct RejectingBackend {
        delivered: Vec<Value>,
    }

    impl Backend for RejectingBackend {
        fn insert_sweep(
            &mut self,
            _method: SweepMethod,
            _metadata: &Value,
            _spec: &SweepSpec,
            _charts: &[Value],
        ) -> BackendResult<SweepId> {
            Ok(1)
        }

        fn insert_run(
            &mut self,
            _metadata: &Value,
            _charts: &[Value],
            _sweep_id: Option<SweepId>,
        ) -> BackendResult<InsertedRun> {
            Ok(InsertedRun {
                run_id: 1,
                sweep: None,
            })
        }

        fn update_run_metadata(&mut self, _run_id: RunId, _metadata: &Value) -> BackendResult<()> {
            Ok(())
        }

        fn append_logs(&mut self, rows: &[Value]) -> BackendResult<()> {
            if rows.iter().any(|row| row["log"] == "bad") {
                return Err(BackendError::permanent("row violates constraint"));
            }
            self.delivered.extend_from_slice(rows);
            Ok(())
        }

        fn append_blobs(&mut self, _rows: &[Value]) -> BackendResult<()> {
            Ok(())
        }
    }

    fn logger(
        backend: &MemoryBackend,
        debounce: Duration,
    ) -> (RunLogger<MemoryBackend>, ManualClock) {
        let clock = ManualClock::new();
        let config = LoggerConfig::default().with_debounce(debounce).with_seed(1);
        let mut logger = RunLogger::new(backend.clone(), &config)
            .with_clock(Arc::new(clock.clone()))
            .with_sleeper(RecordingSleeper::new());
        logger.open().unwrap();
        (logger, clock)
    }

    fn lr_batch() -> SweepSpec {
        SweepSpec::new()
            .with_choice("lr", vec![json!(0.1), json!(0.01)])
            .with_choice("batch", vec![json!(32), json!(64)])
    }

    #[test]
    fn logging_before_a_run_is_rejected_locally() {
        let backend = MemoryBackend::new();
        let (mut logger, _) = logger(&backend, Duration::ZERO);

        let err = logger.log(json!({"loss": 1.0})).unwrap_err();
        assert!(matches!(
            err,
            RunLoggerError::Precondition(ref m) if m == "log called before create_run"
        ));
        assert!(logger.blob(json!("x")).is_err());
        assert!(logger.update_metadata(json!({"a": 1})).is_err());
        assert!(backend.remote_calls().is_empty());
    }

    #[test]
    fn calls_before_open_are_rejected() {
        let backend = MemoryBackend::new();
        let mut logger = RunLogger::new(backend.clone(), &LoggerConfig::default());
        assert_eq!(logger.state(), LoggerState::Unopened);
        assert!(matches!(
            logger.create_run(json!({}), None, None),
            Err(RunLoggerError::Precondition(_))
        ));
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn grid_runs_walk_the_grid_in_order() {
        let backend = MemoryBackend::new();
        let (mut logger, _) = logger(&backend, Duration::ZERO);
        let sweep_id = logger
            .create_sweep(SweepMethod::Grid, json!({"name": "sweep"}), &lr_batch(), &[])
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..5 {
            let params = logger.create_run(json!({}), None, Some(sweep_id)).unwrap().unwrap();
            seen.push((params["lr"].clone(), params["batch"].clone()));
        }
        assert_eq!(
            seen,
            vec![
                (json!(0.1), json!(32)),
                (json!(0.1), json!(64)),
                (json!(0.01), json!(32)),
                (json!(0.01), json!(64)),
                (json!(0.1), json!(32)),
            ]
        );
        assert_eq!(logger.run_id(), Some(5));
    }

    #[test]
    fn runs_outside_a_sweep_get_no_parameters() {
        let backend = MemoryBackend::new();
        let (mut logger, _) = logger(&backend, Duration::ZERO);
        assert_eq!(logger.create_run(json!({"name": "solo"}), None, None).unwrap(), None);
        assert_eq!(logger.run_id(), Some(1));
    }

    #[test]
    fn invalid_sweeps_are_not_created() {
        let backend = MemoryBackend::new();
        let (mut logger, _) = logger(&backend, Duration::ZERO);
        let err = logger
            .create_sweep(SweepMethod::Random, json!({}), &SweepSpec::new(), &[])
            .unwrap_err();
        assert!(matches!(err, RunLoggerError::InvalidSweepState(_)));
        assert!(backend.remote_calls().is_empty());
    }

    #[test]
    fn close_flushes_what_the_debounce_held_back() {
        let backend = MemoryBackend::new();
        let (mut logger, clock) = logger(&backend, Duration::from_secs(60));
        logger.create_run(json!({}), None, None).unwrap();

        for step in 0..3 {
            clock.advance(Duration::from_secs(1));
            logger.log(json!({"step": step})).unwrap();
        }
        logger.blob(Payload::Bytes(b"hi".to_vec())).unwrap();
        assert_eq!(backend.logs().len(), 1);
        assert_eq!(logger.pending(EntryKind::Log), 2);

        logger.close().unwrap();
        assert_eq!(logger.state(), LoggerState::Closed);
        assert_eq!(backend.logs().len(), 3);
        assert_eq!(backend.blobs(), vec![json!({"blob": "aGk=", "run_id": 1})]);
        assert_eq!(backend.calls().last(), Some(&RecordedCall::Disconnect));
    }

    #[test]
    fn closed_logger_refuses_work() {
        let backend = MemoryBackend::new();
        let (mut logger, _) = logger(&backend, Duration::ZERO);
        logger.create_run(json!({}), None, None).unwrap();
        logger.close().unwrap();
        logger.close().unwrap();

        let err = logger.log(json!(1)).unwrap_err();
        assert!(err.to_string().contains("closed logger"));
        let disconnects = backend
            .calls()
            .iter()
            .filter(|c| **c == RecordedCall::Disconnect)
            .count();
        assert_eq!(disconnects, 1);
    }

    #[test]
    fn drop_closes_an_open_logger() {
        let backend = MemoryBackend::new();
        {
            let (mut logger, clock) = logger(&backend, Duration::from_secs(60));
            logger.create_run(json!({}), None, None).unwrap();
            logger.log(json!({"step": 0})).unwrap();
            clock.advance(Duration::from_secs(1));
            logger.log(json!({"step": 1})).unwrap();
        }
        assert_eq!(backend.logs().len(), 2);
        assert_eq!(backend.calls().last(), Some(&RecordedCall::Disconnect));
    }

    #[test]
    fn failed_flush_on_close_still_disconnects() {
        let backend = MemoryBackend::new();
        let (mut logger, clock) = logger(&backend, Duration::from_secs(60));
        logger.create_run(json!({}), None, None).unwrap();
        logger.log(json!({"step": 0})).unwrap();
        clock.advance(Duration::from_secs(1));
        logger.log(json!({"step": 1})).unwrap();

        backend.fail_next([BackendError::permanent("table dropped")]);
        let err = logger.close().unwrap_err();
        assert!(matches!(err, RunLoggerError::BatchRejected { ref rows, .. } if rows.len() == 1));
        assert_eq!(backend.calls().last(), Some(&RecordedCall::Disconnect));
    }

    #[test]
    fn rejected_row_does_not_block_later_logs() {
        let config = LoggerConfig::default();
        let mut logger = RunLogger::new(RejectingBackend::default(), &config)
            .with_sleeper(RecordingSleeper::new());
        logger.open().unwrap();
        logger.create_run(json!({}), None, None).unwrap();

        let err = logger.log(json!("bad")).unwrap_err();
        assert!(matches!(
            err,
            RunLoggerError::BatchRejected { kind: EntryKind::Log, ref rows, .. }
                if rows == &vec![json!({"log": "bad", "run_id": 1})]
        ));
        assert_eq!(logger.pending(EntryKind::Log), 0);

        for step in 0..100 {
            logger.log(json!({"step": step})).unwrap();
        }
        assert_eq!(logger.pending(EntryKind::Log), 0);
        assert_eq!(logger.backend().delivered.len(), 100);
        logger.close().unwrap();
    }

    #[test]
    fn debug_output_shows_state_and_backlog() {
        let backend = MemoryBackend::new();
        let (mut logger, clock) = logger(&backend, Duration::from_secs(60));
        logger.create_run(json!({}), None, None).unwrap();
        logger.log(json!({"step": 0})).unwrap();
        clock.advance(Duration::from_secs(1));
        logger.log(json!({"step": 1})).unwrap();

        let rendered = format!("{logger:?}");
        assert!(rendered.contains("state: Open"));
        assert!(rendered.contains("run_id: Some(1)"));
        assert!(rendered.contains("pending_logs: 1"));
    }

    #[test]
    fn unserialisable_entries_are_never_buffered() {
        let backend = MemoryBackend::new();
        let (mut logger, _) = logger(&backend, Duration::from_secs(60));
        logger.create_run(json!({}), None, None).unwrap();
        let err = logger.log(Payload::Float(f64::INFINITY)).unwrap_err();
        assert!(matches!(err, RunLoggerError::Serialization(_)));
        assert_eq!(logger.pending(EntryKind::Log), 0);
    }

    #[test]
    fn metadata_updates_merge_into_the_run() {
        let backend = MemoryBackend::new();
        let (mut logger, _) = logger(&backend, Duration::ZERO);
        logger.create_run(json!({"name": "a"}), None, None).unwrap();
        logger.update_metadata(json!({"final_loss": 0.1})).unwrap();
        assert_eq!(
            backend.run(1).unwrap().metadata,
            json!({"name": "a", "final_loss": 0.1})
        );
    }

    #[test]
    fn new_run_flushes_entries_of_the_previous_one() {
        let backend = MemoryBackend::new();
        let (mut logger, clock) = logger(&backend, Duration::from_secs(60));
        logger.create_run(json!({}), None, None).unwrap();
        logger.log(json!({"step": 0})).unwrap();
        clock.advance(Duration::from_secs(1));
        logger.log(json!({"step": 1})).unwrap();

        logger.create_run(json!({}), None, None).unwrap();
        let run_ids: Vec<_> = backend.logs().iter().map(|r| r["run_id"].clone()).collect();
        assert_eq!(run_ids, vec![json!(1), json!(1)]);
        assert_eq!(logger.run_id(), Some(2));
    }

    #[test]
    fn open_logger_checks_configuration() {
        let err = open_logger(&LoggerConfig::default()).unwrap_err();
        assert!(matches!(err, RunLoggerError::Configuration(_)));

        let dir = tempfile::tempdir().unwrap();
        let mut logger = open_logger(&LoggerConfig::jsonl(dir.path())).unwrap();
        assert_eq!(logger.state(), LoggerState::Open);
        logger.close().unwrap();
    }
}
