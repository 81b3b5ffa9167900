//! Local JSON-lines backend.
//!
//! Each run gets one file, `<name>.jsonl`, in the configured directory, with
//! one JSON object per line. Log payloads are written as they are; metadata
//! and blobs are wrapped as `{"metadata": ..}` and `{"blob": ..}`. Sweeps are
//! not tracked locally, so sweep calls succeed without doing anything.
//!
//! A batch is encoded in memory and appended with one write. If that write
//! fails the file is cut back to its previous length, so a retried batch
//! never shows up twice.

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{Backend, BackendResult};
use crate::error::{BackendError, Result, RunLoggerError};
use crate::models::{InsertedRun, RunId, SweepId, SweepMethod, SweepSpec};

const DEFAULT_RUN_NAME: &str = "run";

#[derive(Debug)]
pub struct JsonLinesBackend {
    dir: PathBuf,
    file: Option<File>,
    path: Option<PathBuf>,
    committed: u64,
    runs: RunId,
}

/// An append-only sink that can drop a partially written tail.
trait RunFile: Write {
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
}

impl RunFile for File {
    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)?;
        self.seek(SeekFrom::Start(len))?;
        Ok(())
    }
}

/// Append `batch` after the first `committed` bytes, or leave the file as it was.
fn append_batch(out: &mut impl RunFile, committed: &mut u64, batch: &[u8]) -> io::Result<()> {
    if let Err(err) = out.write_all(batch).and_then(|()| out.flush()) {
        if let Err(rollback) = out.truncate_to(*committed) {
            warn!(error = %rollback, "could not discard partially written batch");
        }
        return Err(err);
    }
    *committed += batch.len() as u64;
    Ok(())
}

fn encode_lines<'a>(lines: impl IntoIterator<Item = &'a Value>) -> BackendResult<Vec<u8>> {
    let mut batch = Vec::new();
    for line in lines {
        serde_json::to_writer(&mut batch, line)
            .map_err(|e| BackendError::permanent(format!("failed to encode line: {e}")))?;
        batch.push(b'\n');
    }
    Ok(batch)
}

impl JsonLinesBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            file: None,
            path: None,
            committed: 0,
            runs: 0,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File of the current run, once one was created.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn write_lines<'a>(&mut self, lines: impl IntoIterator<Item = &'a Value>) -> BackendResult<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| BackendError::permanent("no run file is open"))?;
        let batch = encode_lines(lines)?;
        append_batch(file, &mut self.committed, &batch).map_err(io_error)
    }
}

fn io_error(err: io::Error) -> BackendError {
    match err.kind() {
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => {
            BackendError::transient(err.to_string())
        }
        _ => BackendError::permanent(err.to_string()),
    }
}

/// Keep names usable as a single file name.
fn file_stem(metadata: &Value) -> String {
    let name = metadata
        .get("name")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(DEFAULT_RUN_NAME);
    name.chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect()
}

impl Backend for JsonLinesBackend {
    fn connect(&mut self) -> Result<()> {
        if !self.dir.is_dir() {
            return Err(RunLoggerError::Configuration(format!(
                "log directory {} does not exist",
                self.dir.display()
            )));
        }
        debug!(dir = %self.dir.display(), "using json-lines backend");
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }

    fn insert_sweep(
        &mut self,
        method: SweepMethod,
        _metadata: &Value,
        _spec: &SweepSpec,
        _charts: &[Value],
    ) -> BackendResult<SweepId> {
        debug!(%method, "json-lines backend does not track sweeps");
        Ok(0)
    }

    fn insert_run(
        &mut self,
        metadata: &Value,
        _charts: &[Value],
        _sweep_id: Option<SweepId>,
    ) -> BackendResult<InsertedRun> {
        self.file = None;
        let path = self.dir.join(format!("{}.jsonl", file_stem(metadata)));
        let file = File::create(&path).map_err(io_error)?;
        self.file = Some(file);
        self.committed = 0;
        info!(path = %path.display(), "writing run log");
        self.path = Some(path);

        self.write_lines([&json!({ "metadata": metadata })])?;
        self.runs += 1;
        Ok(InsertedRun {
            run_id: self.runs,
            sweep: None,
        })
    }

    fn update_run_metadata(&mut self, _run_id: RunId, metadata: &Value) -> BackendResult<()> {
        self.write_lines([&json!({ "metadata": metadata })])
    }

    fn append_logs(&mut self, rows: &[Value]) -> BackendResult<()> {
        let payloads: Vec<&Value> = rows.iter().map(|row| row.get("log").unwrap_or(row)).collect();
        self.write_lines(payloads)
    }

    fn append_blobs(&mut self, rows: &[Value]) -> BackendResult<()> {
        let wrapped: Vec<Value> = rows
            .iter()
            .map(|row| json!({ "blob": row.get("blob").unwrap_or(row) }))
            .collect();
        self.write_lines(&wrapped)
    }
}
