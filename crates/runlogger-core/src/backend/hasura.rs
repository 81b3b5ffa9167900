//! Hasura GraphQL backend.
//!
//! Every operation is a single GraphQL mutation posted with the blocking
//! `reqwest` client. Registering a run inside a sweep inserts the run and
//! bumps the sweep's `grid_index` in the same request, which Hasura executes
//! as one transaction; that is what keeps grid indices unique across workers.

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use serde_json::{json, Value};
use tracing::debug;

use super::{Backend, BackendResult, GridCounter};
use crate::error::{BackendError, Result, RunLoggerError};
use crate::models::{InsertedRun, RunId, SweepId, SweepMethod, SweepSpec, SweepState};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const ADMIN_SECRET_HEADER: &str = "x-hasura-admin-secret";

/// GraphQL documents sent by [`HasuraBackend`].
///
/// Fixed at construction; override them to target a schema with different
/// table or column names.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutations {
    pub insert_sweep: String,
    pub insert_run: String,
    pub insert_run_in_sweep: String,
    pub increment_grid_index: String,
    pub update_metadata: String,
    pub insert_logs: String,
    pub insert_blobs: String,
}

impl Default for Mutations {
    fn default() -> Self {
        Self {
            insert_sweep: r#"
mutation insert_new_sweep($grid_index: Int, $metadata: jsonb = {}, $parameter_choices: [parameter_choice_insert_input!]!, $charts: [chart_insert_input!] = []) {
  insert_sweep_one(object: {grid_index: $grid_index, metadata: $metadata, parameter_choices: {data: $parameter_choices}, charts: {data: $charts}}) {
    id
  }
}"#
            .to_string(),
            insert_run: r#"
mutation insert_new_run($metadata: jsonb = {}, $charts: [chart_insert_input!] = []) {
  insert_run_one(object: {charts: {data: $charts}, metadata: $metadata}) {
    id
  }
}"#
            .to_string(),
            insert_run_in_sweep: r#"
mutation add_run_to_sweep($metadata: jsonb = {}, $sweep_id: Int!, $charts: [chart_insert_input!] = []) {
  insert_run_one(object: {charts: {data: $charts}, metadata: $metadata, sweep_id: $sweep_id}) {
    id
    sweep {
      parameter_choices {
        key
        choice
      }
    }
  }
  update_sweep(where: {id: {_eq: $sweep_id}}, _inc: {grid_index: 1}) {
    returning {
      grid_index
    }
  }
}"#
            .to_string(),
            increment_grid_index: r#"
mutation increment_grid_index($sweep_id: Int!) {
  update_sweep(where: {id: {_eq: $sweep_id}}, _inc: {grid_index: 1}) {
    returning {
      grid_index
    }
  }
}"#
            .to_string(),
            update_metadata: r#"
mutation update_metadata($metadata: jsonb!, $run_id: Int!) {
  update_run(where: {id: {_eq: $run_id}}, _append: {metadata: $metadata}) {
    affected_rows
  }
}"#
            .to_string(),
            insert_logs: r#"
mutation insert_run_logs($objects: [run_log_insert_input!]!) {
  insert_run_log(objects: $objects) {
    affected_rows
  }
}"#
            .to_string(),
            insert_blobs: r#"
mutation insert_run_blobs($objects: [run_blob_insert_input!]!) {
  insert_run_blob(objects: $objects) {
    affected_rows
  }
}"#
            .to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HasuraBackend {
    client: Client,
    endpoint: Url,
    admin_secret: Option<String>,
    mutations: Mutations,
}

impl HasuraBackend {
    pub fn new(endpoint: &str, admin_secret: Option<String>) -> Result<Self> {
        let endpoint = Url::parse(endpoint).map_err(|e| {
            RunLoggerError::Configuration(format!("invalid GraphQL endpoint '{endpoint}': {e}"))
        })?;
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| {
                RunLoggerError::Configuration(format!("failed to build HTTP client: {e}"))
            })?;
        Ok(Self {
            client,
            endpoint,
            admin_secret,
            mutations: Mutations::default(),
        })
    }

    pub fn with_mutations(mut self, mutations: Mutations) -> Self {
        self.mutations = mutations;
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn mutations(&self) -> &Mutations {
        &self.mutations
    }

    /// Post one GraphQL document and return its `data` object.
    fn execute(&self, query: &str, variables: Value) -> BackendResult<Value> {
        let mut request = self
            .client
            .post(self.endpoint.clone())
            .json(&json!({ "query": query, "variables": variables }));
        if let Some(secret) = &self.admin_secret {
            request = request.header(ADMIN_SECRET_HEADER, secret);
        }

        let response = request.send().map_err(classify_transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(classify_status(status, &body));
        }
        let body: Value = response
            .json()
            .map_err(|e| BackendError::permanent(format!("malformed GraphQL response: {e}")))?;
        parse_response(body)
    }
}

/// Transport failures are worth retrying unless the request itself could not be built.
fn classify_transport(err: reqwest::Error) -> BackendError {
    if err.is_builder() {
        BackendError::permanent(format!("invalid request: {err}"))
    } else {
        BackendError::transient(format!("request failed: {err}"))
    }
}

fn classify_status(status: StatusCode, body: &str) -> BackendError {
    let message = format!("HTTP {status}: {}", body.trim());
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        BackendError::transient(message)
    } else {
        BackendError::permanent(message)
    }
}

/// Unwrap a GraphQL response envelope. Reported `errors` are permanent:
/// they mean the document or its variables were rejected.
fn parse_response(mut body: Value) -> BackendResult<Value> {
    if let Some(errors) = body.get("errors").and_then(Value::as_array) {
        if !errors.is_empty() {
            let messages: Vec<&str> = errors
                .iter()
                .map(|e| e.get("message").and_then(Value::as_str).unwrap_or("unknown error"))
                .collect();
            return Err(BackendError::permanent(format!(
                "GraphQL error: {}",
                messages.join("; ")
            )));
        }
    }
    match body.get_mut("data").map(Value::take) {
        Some(data @ Value::Object(_)) => Ok(data),
        _ => Err(BackendError::permanent("GraphQL response has no data")),
    }
}

fn field<'a>(value: &'a Value, path: &[&str]) -> BackendResult<&'a Value> {
    path.iter()
        .try_fold(value, |v, key| v.get(*key))
        .ok_or_else(|| BackendError::permanent(format!("response is missing {}", path.join("."))))
}

fn id_field(value: &Value, path: &[&str]) -> BackendResult<i64> {
    field(value, path)?
        .as_i64()
        .ok_or_else(|| BackendError::permanent(format!("{} is not an integer", path.join("."))))
}

/// `update_sweep` reports the incremented value; hand back the one before it.
fn previous_grid_index(data: &Value) -> BackendResult<Option<u64>> {
    let returning = field(data, &["update_sweep", "returning"])?
        .as_array()
        .and_then(|rows| rows.first())
        .ok_or_else(|| BackendError::permanent("sweep does not exist"))?;
    match returning.get("grid_index") {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .and_then(|n| n.checked_sub(1))
            .map(Some)
            .ok_or_else(|| BackendError::permanent(format!("unexpected grid_index {v}"))),
    }
}

fn parse_sweep_spec(run: &Value) -> BackendResult<SweepSpec> {
    let choices = field(run, &["sweep", "parameter_choices"])?
        .as_array()
        .ok_or_else(|| BackendError::permanent("parameter_choices is not a list"))?;
    choices.iter().try_fold(SweepSpec::new(), |spec, row| {
        let key = field(row, &["key"])?
            .as_str()
            .ok_or_else(|| BackendError::permanent("parameter key is not a string"))?;
        let candidates = match field(row, &["choice"])? {
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        };
        Ok(spec.with_choice(key, candidates))
    })
}

fn chart_objects(charts: &[Value]) -> Vec<Value> {
    charts.iter().map(|spec| json!({ "spec": spec })).collect()
}

impl GridCounter for HasuraBackend {
    fn fetch_increment(&self, sweep_id: SweepId) -> BackendResult<Option<u64>> {
        let data = self.execute(
            &self.mutations.increment_grid_index,
            json!({ "sweep_id": sweep_id }),
        )?;
        previous_grid_index(&data)
    }
}

impl Backend for HasuraBackend {
    fn connect(&mut self) -> Result<()> {
        debug!(
            endpoint = %self.endpoint,
            authenticated = self.admin_secret.is_some(),
            "using hasura backend"
        );
        Ok(())
    }

    fn insert_sweep(
        &mut self,
        method: SweepMethod,
        metadata: &Value,
        spec: &SweepSpec,
        charts: &[Value],
    ) -> BackendResult<SweepId> {
        let parameter_choices: Vec<Value> = spec
            .params()
            .iter()
            .map(|p| json!({ "key": p.key, "choice": p.choices }))
            .collect();
        let data = self.execute(
            &self.mutations.insert_sweep,
            json!({
                "grid_index": method.initial_grid_index(),
                "metadata": metadata,
                "parameter_choices": parameter_choices,
                "charts": chart_objects(charts),
            }),
        )?;
        id_field(&data, &["insert_sweep_one", "id"])
    }

    fn insert_run(
        &mut self,
        metadata: &Value,
        charts: &[Value],
        sweep_id: Option<SweepId>,
    ) -> BackendResult<InsertedRun> {
        let Some(sweep_id) = sweep_id else {
            let data = self.execute(
                &self.mutations.insert_run,
                json!({ "metadata": metadata, "charts": chart_objects(charts) }),
            )?;
            let run_id = id_field(&data, &["insert_run_one", "id"])?;
            return Ok(InsertedRun { run_id, sweep: None });
        };

        let data = self.execute(
            &self.mutations.insert_run_in_sweep,
            json!({
                "metadata": metadata,
                "charts": chart_objects(charts),
                "sweep_id": sweep_id,
            }),
        )?;
        parse_run_in_sweep(&data)
    }

    fn update_run_metadata(&mut self, run_id: RunId, metadata: &Value) -> BackendResult<()> {
        let data = self.execute(
            &self.mutations.update_metadata,
            json!({ "metadata": metadata, "run_id": run_id }),
        )?;
        match field(&data, &["update_run", "affected_rows"])?.as_u64() {
            Some(0) => Err(BackendError::permanent(format!("run {run_id} does not exist"))),
            _ => Ok(()),
        }
    }

    fn append_logs(&mut self, rows: &[Value]) -> BackendResult<()> {
        let data = self.execute(&self.mutations.insert_logs, json!({ "objects": rows }))?;
        field(&data, &["insert_run_log", "affected_rows"])?;
        Ok(())
    }

    fn append_blobs(&mut self, rows: &[Value]) -> BackendResult<()> {
        let data = self.execute(&self.mutations.insert_blobs, json!({ "objects": rows }))?;
        field(&data, &["insert_run_blob", "affected_rows"])?;
        Ok(())
    }
}

fn parse_run_in_sweep(data: &Value) -> BackendResult<InsertedRun> {
    let run = field(data, &["insert_run_one"])?;
    let run_id = id_field(run, &["id"])?;
    let spec = parse_sweep_spec(run)?;
    let grid_index = previous_grid_index(data)?;
    Ok(InsertedRun {
        run_id,
        sweep: Some(SweepState { spec, grid_index }),
    })
}
