//! runlog CLI: create sweeps and inspect their parameter grids.

mod reproducibility;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use serde_json::{json, Map, Value};
use tracing::info;

use runlogger::diagnostics::{self, DiagnosticsConfig};
use runlogger::sweep::describe;
use runlogger::{open_logger, CombinationGenerator, LoggerConfig, SweepMethod, SweepSpec};

#[derive(Parser)]
#[command(
    name = "runlog",
    about = "runlogger: coordinate hyperparameter sweeps across workers",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a sweep from a YAML parameter config
    CreateSweep {
        /// Path to the sweep config (a mapping of parameter -> candidates, or a bare list)
        #[arg(long, short, default_value = "config.yml")]
        config: PathBuf,
        /// Name of the sweep (stored in metadata)
        #[arg(long, short)]
        name: Option<String>,
        /// Name of the project (stored in metadata)
        #[arg(long, short)]
        project: Option<String>,
        /// Enumerate the grid in order, or sample every parameter at random
        #[arg(long, short, default_value = "random", value_parser = ["grid", "random"])]
        method: String,
        /// Backend to register the sweep with
        #[arg(
            long,
            short,
            default_value = "hasura",
            value_parser = ["hasura", "jsonl", "jsonlines"]
        )]
        logger: String,
        /// Number of runs workers should still start (stored in metadata)
        #[arg(long)]
        remaining_runs: Option<u64>,
        /// GraphQL endpoint (default: HASURA_URI / GRAPHQL_ENDPOINT)
        #[arg(long)]
        endpoint: Option<String>,
        /// Output directory of the jsonl backend (default: LOG_PATH)
        #[arg(long)]
        log_dir: Option<PathBuf>,
        /// YAML file with logger settings
        #[arg(long)]
        logger_config: Option<PathBuf>,
    },
    /// Show the grid a sweep config expands to
    Preview {
        #[arg(long, short, default_value = "config.yml")]
        config: PathBuf,
        /// Maximum number of combinations to print
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Print the parameters a grid sweep assigns to a given index
    Resolve {
        #[arg(long, short, default_value = "config.yml")]
        config: PathBuf,
        /// Grid index; wraps around after the last combination
        #[arg(long, short)]
        index: u64,
    },
}

fn main() -> Result<()> {
    let _guard = diagnostics::init(&DiagnosticsConfig::default())?;

    let cli = Cli::parse();

    match cli.command {
        Commands::CreateSweep {
            config,
            name,
            project,
            method,
            logger,
            remaining_runs,
            endpoint,
            log_dir,
            logger_config,
        } => {
            let mut settings = match logger_config {
                Some(path) => LoggerConfig::load(&path)?,
                None => LoggerConfig::from_env()?,
            };
            settings.backend = logger.parse()?;
            if endpoint.is_some() {
                settings.endpoint = endpoint;
            }
            if log_dir.is_some() {
                settings.log_dir = log_dir;
            }
            let sweep = SweepRequest {
                name,
                project,
                method: method.parse()?,
                remaining_runs,
            };
            cmd_create_sweep(&config, sweep, &settings)?;
        }
        Commands::Preview { config, limit } => {
            cmd_preview(&config, limit)?;
        }
        Commands::Resolve { config, index } => {
            cmd_resolve(&config, index)?;
        }
    }

    Ok(())
}

struct SweepRequest {
    name: Option<String>,
    project: Option<String>,
    method: SweepMethod,
    remaining_runs: Option<u64>,
}

// ─── Command implementations ──────────────────────────────────────────────────

fn cmd_create_sweep(config: &Path, sweep: SweepRequest, settings: &LoggerConfig) -> Result<()> {
    let raw = load_sweep_config(config)?;
    let spec = SweepSpec::from_config(&raw)?;

    let mut metadata = Map::new();
    metadata.insert("name".into(), json!(sweep.name));
    metadata.insert("project".into(), json!(sweep.project));
    metadata.insert("config".into(), raw);
    if let Some(remaining) = sweep.remaining_runs {
        metadata.insert("remaining_runs".into(), remaining.into());
    }
    let cwd = std::env::current_dir()?;
    metadata.extend(reproducibility::collect(&cwd));

    let mut logger = open_logger(settings)?;
    let sweep_id = logger.create_sweep(sweep.method, Value::Object(metadata), &spec, &[])?;
    logger.close()?;

    info!(sweep_id, method = %sweep.method, backend = %settings.backend, "sweep registered");
    println!("Sweep ID: {sweep_id}");
    Ok(())
}

fn cmd_preview(config: &Path, limit: usize) -> Result<()> {
    let spec = SweepSpec::from_config(&load_sweep_config(config)?)?;
    let grid = CombinationGenerator::new(&spec);

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    let mut header = vec!["#".to_string()];
    header.extend(spec.params().iter().map(|p| column_name(&p.key)));
    table.set_header(header);

    for (index, assignment) in grid.iter().take(limit).enumerate() {
        let mut row = vec![index.to_string()];
        row.extend(assignment.values().map(display_value));
        table.add_row(row);
    }

    println!("{table}");
    match grid.total() {
        Some(total) if total as u128 > limit as u128 => {
            println!("Total combinations: {total} (showing first {limit})")
        }
        Some(total) => println!("Total combinations: {total}"),
        None => println!("Total combinations: more than {}", u64::MAX),
    }
    Ok(())
}

fn cmd_resolve(config: &Path, index: u64) -> Result<()> {
    let spec = SweepSpec::from_config(&load_sweep_config(config)?)?;
    let assignment = CombinationGenerator::new(&spec).combination_at(index);
    info!(index, params = %describe(&assignment), "resolved grid index");
    println!("{}", serde_json::to_string_pretty(&assignment)?);
    Ok(())
}

// ─── Utilities ────────────────────────────────────────────────────────────────

fn load_sweep_config(path: &Path) -> Result<Value> {
    if !path.exists() {
        anyhow::bail!("Sweep config not found: {}", path.display());
    }
    let text = std::fs::read_to_string(path)?;
    serde_yaml::from_str(&text).with_context(|| format!("Invalid YAML in {}", path.display()))
}

fn column_name(key: &str) -> String {
    if key.is_empty() {
        "value".to_string()
    } else {
        key.to_string()
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
