//! Retrying wrapper around a [`Backend`].
//!
//! `ResilientClient` is the only component that talks to the backend. Every
//! call is normalised with [`jsonify`], then attempted until it succeeds,
//! fails permanently, or runs out of attempts. Transient failures are retried
//! after an exponentially growing, capped and jittered delay.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::backend::{Backend, BackendResult};
use crate::clock::{Sleeper, ThreadSleeper};
use crate::error::{Result, RunLoggerError};
use crate::jsonify::{jsonify, Payload};
use crate::models::{EntryKind, InsertedRun, RunId, SweepId, SweepMethod, SweepSpec};

/// How often and how patiently a failing call is retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry (default: 1000)
    pub initial_backoff_ms: u64,
    /// Factor applied to the delay after each failure (default: 2.0)
    pub multiplier: f64,
    /// Upper bound for a single delay; `None` lets it grow without limit (default: 60000)
    pub max_backoff_ms: Option<u64>,
    /// Attempts before giving up, first try included; `None` retries forever (default: 8)
    pub max_attempts: Option<u32>,
    /// Relative random spread applied to each delay, in `[0, 1]` (default: 0.1)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1000,
            multiplier: 2.0,
            max_backoff_ms: Some(60_000),
            max_attempts: Some(8),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Retry forever, doubling from one second with no cap and no jitter.
    pub fn unbounded() -> Self {
        Self {
            initial_backoff_ms: 1000,
            multiplier: 2.0,
            max_backoff_ms: None,
            max_attempts: None,
            jitter: 0.0,
        }
    }

    pub fn with_max_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay after the `failures`-th consecutive failure (1-based), before jitter.
    pub fn base_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.initial_backoff_ms as f64 * self.multiplier.powi(exponent);
        let capped = match self.max_backoff_ms {
            Some(max) => millis.min(max as f64),
            None => millis,
        };
        Duration::try_from_secs_f64(capped / 1000.0).unwrap_or(Duration::MAX)
    }

    /// Delay after the `failures`-th failure with jitter applied; never above the cap.
    pub fn delay<R: Rng + ?Sized>(&self, failures: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(failures);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let factor = 1.0 + rng.random_range(-jitter..=jitter);
        let jittered =
            Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(Duration::MAX);
        match self.max_backoff_ms {
            Some(max) => jittered.min(Duration::from_millis(max)),
            None => jittered,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.multiplier < 1.0 || !self.multiplier.is_finite() {
            return Err(RunLoggerError::Configuration(format!(
                "retry multiplier must be a finite value >= 1, got {}",
                self.multiplier
            )));
        }
        if self.max_attempts == Some(0) {
            return Err(RunLoggerError::Configuration(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(RunLoggerError::Configuration(format!(
                "retry jitter must lie in [0, 1], got {}",
                self.jitter
            )));
        }
        Ok(())
    }
}

/// A backend plus the policy for surviving its failures.
pub struct ResilientClient<B> {
    backend: B,
    policy: RetryPolicy,
    sleeper: Box<dyn Sleeper>,
}

impl<B: Backend> ResilientClient<B> {
    pub fn new(backend: B, policy: RetryPolicy) -> Self {
        Self {
            backend,
            policy,
            sleeper: Box::new(ThreadSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.set_sleeper(sleeper);
        self
    }

    pub fn set_sleeper(&mut self, sleeper: impl Sleeper + 'static) {
        self.sleeper = Box::new(sleeper);
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    /// Run `call` under the retry policy.
    ///
    /// Returns the first success. A permanent failure is returned as
    /// [`RunLoggerError::Backend`] without retrying; running out of attempts
    /// yields [`RunLoggerError::RetryExhausted`] carrying the last failure.
    pub fn execute<T>(
        &mut self,
        operation: &str,
        mut call: impl FnMut(&mut B) -> BackendResult<T>,
    ) -> Result<T> {
        let mut rng = rand::rng();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let err = match call(&mut self.backend) {
                Ok(value) => {
                    if attempt > 1 {
                        info!(operation, attempts = attempt, "backend call recovered");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                error!(operation, attempt, error = %err, "backend call failed permanently");
                return Err(err.into());
            }
            if self.policy.max_attempts.is_some_and(|max| attempt >= max) {
                error!(operation, attempts = attempt, error = %err, "giving up on backend call");
                return Err(RunLoggerError::RetryExhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    last_error: err,
                });
            }

            let delay = self.policy.delay(attempt, &mut rng);
            warn!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "backend call failed, retrying"
            );
            self.sleeper.sleep(delay);
        }
    }

    pub fn create_sweep(
        &mut self,
        method: SweepMethod,
        metadata: &Payload,
        spec: &SweepSpec,
        charts: &[Payload],
    ) -> Result<SweepId> {
        let metadata = jsonify(metadata)?;
        let charts = jsonify_all(charts)?;
        self.execute("insert_sweep", |b| {
            b.insert_sweep(method, &metadata, spec, &charts)
        })
    }

    pub fn create_run(
        &mut self,
        metadata: &Payload,
        charts: &[Payload],
        sweep_id: Option<SweepId>,
    ) -> Result<InsertedRun> {
        let metadata = jsonify(metadata)?;
        let charts = jsonify_all(charts)?;
        self.execute("insert_run", |b| b.insert_run(&metadata, &charts, sweep_id))
    }

    pub fn update_metadata(&mut self, run_id: RunId, metadata: &Payload) -> Result<()> {
        let metadata = jsonify(metadata)?;
        self.execute("update_run_metadata", |b| {
            b.update_run_metadata(run_id, &metadata)
        })
    }

    /// Submit one batch of already-normalised rows.
    pub fn append(&mut self, kind: EntryKind, rows: &[Value]) -> Result<()> {
        let operation = match kind {
            EntryKind::Log => "append_logs",
            EntryKind::Blob => "append_blobs",
        };
        self.execute(operation, |b| b.append(kind, rows))
    }
}

fn jsonify_all(items: &[Payload]) -> Result<Vec<Value>> {
    items.iter().map(jsonify).collect()
}
