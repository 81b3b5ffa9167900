//! Logger configuration: which backend, where, and how patiently.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, RunLoggerError};
use crate::retry::RetryPolicy;

pub const ENDPOINT_VARS: [&str; 2] = ["HASURA_URI", "GRAPHQL_ENDPOINT"];
pub const ADMIN_SECRET_VAR: &str = "HASURA_GRAPHQL_ADMIN_SECRET";
pub const LOG_PATH_VAR: &str = "LOG_PATH";
pub const DEBOUNCE_VAR: &str = "RUNLOGGER_DEBOUNCE_MS";
pub const SEED_VAR: &str = "RUNLOGGER_SEED";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Hasura,
    #[serde(alias = "jsonlines")]
    Jsonl,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Hasura => write!(f, "hasura"),
            BackendKind::Jsonl => write!(f, "jsonl"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = RunLoggerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "hasura" => Ok(BackendKind::Hasura),
            "jsonl" | "jsonlines" => Ok(BackendKind::Jsonl),
            other => Err(RunLoggerError::Configuration(format!(
                "unknown logger '{other}' (expected 'hasura' or 'jsonl')"
            ))),
        }
    }
}

/// Everything needed to open a [`crate::RunLogger`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Backend to log to (default: hasura)
    pub backend: BackendKind,
    /// GraphQL endpoint of the Hasura backend
    pub endpoint: Option<String>,
    /// Sent as `x-hasura-admin-secret`
    #[serde(skip_serializing)]
    pub admin_secret: Option<String>,
    /// Directory the json-lines backend writes to
    pub log_dir: Option<PathBuf>,
    /// Minimum time between two flushes of the same buffer (default: 0, flush on every entry)
    pub debounce_ms: u64,
    /// Seed for random-search assignments; drawn from the OS when unset
    pub seed: Option<u64>,
    pub retry: RetryPolicy,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Hasura,
            endpoint: None,
            admin_secret: None,
            log_dir: None,
            debounce_ms: 0,
            seed: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl LoggerConfig {
    pub fn hasura(endpoint: impl Into<String>) -> Self {
        Self {
            backend: BackendKind::Hasura,
            endpoint: Some(endpoint.into()),
            ..Self::default()
        }
    }

    pub fn jsonl(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendKind::Jsonl,
            log_dir: Some(log_dir.into()),
            ..Self::default()
        }
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_admin_secret(mut self, secret: impl Into<String>) -> Self {
        self.admin_secret = Some(secret.into());
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce_ms = debounce.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Defaults overridden by whatever the environment sets.
    pub fn from_env() -> Result<Self> {
        Self::default().overlay_env(|key| std::env::var(key).ok())
    }

    /// Read a YAML file, then let the environment override it.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&text)?;
        debug!(path = %path.display(), "loaded logger config");
        config.overlay_env(|key| std::env::var(key).ok())
    }

    /// Apply the recognised variables found through `lookup`.
    pub fn overlay_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(endpoint) = ENDPOINT_VARS.iter().find_map(|key| lookup(key)) {
            self.endpoint = Some(endpoint);
        }
        if let Some(secret) = lookup(ADMIN_SECRET_VAR) {
            self.admin_secret = Some(secret);
        }
        if let Some(dir) = lookup(LOG_PATH_VAR) {
            self.log_dir = Some(PathBuf::from(dir));
        }
        if let Some(ms) = lookup(DEBOUNCE_VAR) {
            self.debounce_ms = parse_var(DEBOUNCE_VAR, &ms)?;
        }
        if let Some(seed) = lookup(SEED_VAR) {
            self.seed = Some(parse_var(SEED_VAR, &seed)?);
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        match self.backend {
            BackendKind::Hasura if self.endpoint.as_deref().map_or(true, str::is_empty) => {
                Err(RunLoggerError::Configuration(format!(
                    "hasura backend needs an endpoint; set {} or {}",
                    ENDPOINT_VARS[0], ENDPOINT_VARS[1]
                )))
            }
            BackendKind::Jsonl if self.log_dir.is_none() => Err(RunLoggerError::Configuration(
                format!("jsonl backend needs a log directory; set {LOG_PATH_VAR}"),
            )),
            _ => Ok(()),
        }
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| RunLoggerError::Configuration(format!("{key}={value}: {e}")))
}
