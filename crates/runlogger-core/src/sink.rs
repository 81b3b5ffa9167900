//! Debounced batching of log and blob rows.
//!
//! Rows accumulate in memory and go to the backend as one batch when the
//! debounce interval has passed since the previous flush. A batch is either
//! accepted whole or stays buffered while the backend is unreachable. A batch
//! the backend refuses outright is handed back in the error instead, so one
//! bad row cannot block everything queued after it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, error};

use crate::backend::Backend;
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, RunLoggerError};
use crate::models::{EntryKind, RunEntry};
use crate::retry::ResilientClient;

pub struct BufferedSink {
    kind: EntryKind,
    debounce: Duration,
    clock: Arc<dyn Clock>,
    buffer: Vec<RunEntry>,
    last_flush: Option<Instant>,
}

impl BufferedSink {
    pub fn new(kind: EntryKind, debounce: Duration) -> Self {
        Self::with_clock(kind, debounce, Arc::new(SystemClock))
    }

    pub fn with_clock(kind: EntryKind, debounce: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            kind,
            debounce,
            clock,
            buffer: Vec::new(),
            last_flush: None,
        }
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn last_flush(&self) -> Option<Instant> {
        self.last_flush
    }

    /// True if nothing was flushed yet or the debounce interval has elapsed.
    /// A zero interval is always due.
    pub fn is_due(&self) -> bool {
        match self.last_flush {
            None => true,
            Some(_) if self.debounce.is_zero() => true,
            Some(last) => self.clock.now().saturating_duration_since(last) > self.debounce,
        }
    }

    /// Queue a row and flush the whole buffer if the debounce allows it.
    /// Returns whether a flush happened.
    pub fn enqueue<B: Backend>(
        &mut self,
        entry: RunEntry,
        client: &mut ResilientClient<B>,
    ) -> Result<bool> {
        self.buffer.push(entry);
        self.flush_if_due(client)
    }

    pub fn flush_if_due<B: Backend>(&mut self, client: &mut ResilientClient<B>) -> Result<bool> {
        if self.buffer.is_empty() || !self.is_due() {
            return Ok(false);
        }
        self.flush(client)?;
        Ok(true)
    }

    /// Send everything buffered regardless of the debounce. No-op when empty.
    ///
    /// When retries run out the batch stays buffered for the next flush. A
    /// permanent failure empties the buffer and returns the refused rows in
    /// [`RunLoggerError::BatchRejected`].
    pub fn flush<B: Backend>(&mut self, client: &mut ResilientClient<B>) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let rows: Vec<Value> = self.buffer.iter().map(|e| e.to_row(self.kind)).collect();
        match client.append(self.kind, &rows) {
            Ok(()) => {}
            Err(RunLoggerError::Backend(err)) if !err.is_retryable() => {
                self.buffer.clear();
                self.last_flush = Some(self.clock.now());
                error!(
                    kind = %self.kind,
                    rows = rows.len(),
                    error = %err,
                    "backend rejected batch"
                );
                return Err(RunLoggerError::BatchRejected {
                    kind: self.kind,
                    rows,
                    error: err,
                });
            }
            Err(err) => return Err(err),
        }

        self.buffer.clear();
        self.last_flush = Some(self.clock.now());
        debug!(kind = %self.kind, rows = rows.len(), "flushed buffer");
        Ok(())
    }
}
