//! A sweep worker: joins the sweep named by `SWEEP_ID`, trains a toy model
//! with the parameters it is handed, and logs the loss curve.
//!
//! LOG_PATH=/tmp/runs SWEEP_ID=0 cargo run -p runlogger --example sweep_worker

use runlogger::diagnostics::{self, DiagnosticsConfig};
use runlogger::{open_logger, LoggerConfig, Result, RunLoggerError};
use serde_json::json;

fn main() -> Result<()> {
    let _guard = diagnostics::init(&DiagnosticsConfig::default())?;

    let config = LoggerConfig::from_env()?;
    let sweep_id = match std::env::var("SWEEP_ID") {
        Ok(id) => Some(id.parse().map_err(|e| {
            RunLoggerError::Configuration(format!("SWEEP_ID={id}: {e}"))
        })?),
        Err(_) => None,
    };

    let mut logger = open_logger(&config)?;
    let params = logger
        .create_run(json!({"name": "sweep_worker"}), None, sweep_id)?
        .unwrap_or_default();
    let lr = params.get("lr").and_then(|v| v.as_f64()).unwrap_or(0.1);

    let mut weight = 5.0_f64;
    for step in 0..50 {
        let grad = 2.0 * (weight - 1.0);
        weight -= lr * grad;
        let loss = (weight - 1.0).powi(2);
        logger.log(json!({"step": step, "loss": loss}))?;
    }
    logger.update_metadata(json!({"final_weight": weight}))?;
    logger.close()
}
