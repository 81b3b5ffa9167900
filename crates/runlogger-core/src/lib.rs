//! runlogger-core: sweep coordination and run logging for runlogger.
//!
//! Workers of a hyperparameter sweep each open a [`RunLogger`], register a
//! run, and receive the parameters they should train with. Grid sweeps are
//! enumerated through a counter held by the backend, so any number of
//! workers cover the grid without talking to each other. Logs and blobs are
//! buffered, debounced and sent in batches through a retrying client.

pub mod assign;
pub mod backend;
pub mod clock;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod jsonify;
pub mod logger;
pub mod models;
pub mod retry;
pub mod sink;
pub mod sweep;

pub use assign::SweepAssigner;
pub use backend::{
    Backend, BackendResult, GridCounter, HasuraBackend, JsonLinesBackend, MemoryBackend,
    Mutations,
};
pub use clock::{Clock, ManualClock, RecordingSleeper, Sleeper, SystemClock, ThreadSleeper};
pub use config::{BackendKind, LoggerConfig};
pub use error::{BackendError, Result, RunLoggerError};
pub use jsonify::{jsonify, Payload};
pub use logger::{open_logger, LoggerState, RunLogger};
pub use models::{
    EntryKind, InsertedRun, ParamChoice, ParameterAssignment, RunEntry, RunId, SweepId,
    SweepMethod, SweepSpec, SweepState,
};
pub use retry::{ResilientClient, RetryPolicy};
pub use sink::BufferedSink;
pub use sweep::{combination_at, total_combinations, CombinationGenerator, RandomSampler};
