use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use hp_runner::config::{SetupRequest, DEFAULT_EPOCHS};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "hyperpower",
    version = "0.3.0",
    about = "Power- and accuracy-constrained hyper-parameter search"
)]
struct Cli {
    /// Debug logging (RUST_LOG takes precedence when set)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum MetricArg {
    #[value(name = "error")]
    Error,
    #[value(name = "energy")]
    Energy,
    #[value(name = "runtime")]
    Runtime,
    #[value(name = "power")]
    Power,
}

impl From<MetricArg> for hp_runner::Metric {
    fn from(value: MetricArg) -> Self {
        match value {
            MetricArg::Error => hp_runner::Metric::Error,
            MetricArg::Energy => hp_runner::Metric::Energy,
            MetricArg::Runtime => hp_runner::Metric::Runtime,
            MetricArg::Power => hp_runner::Metric::Power,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Extract the search space, write optimizer and trial state
    Setup {
        #[arg(long)]
        experiment: PathBuf,
        #[arg(long, value_enum)]
        optimize: MetricArg,
        #[arg(long, value_enum)]
        constraint: Option<MetricArg>,
        #[arg(long = "constraint-val")]
        constraint_val: Option<f64>,
        #[arg(long, default_value_t = DEFAULT_EPOCHS)]
        epochs: usize,
        /// Start the optimizer after setup
        #[arg(long)]
        launch: bool,
        #[arg(long)]
        json: bool,
    },
    /// Evaluate one optimizer suggestion; the last stdout line is the result
    Trial {
        #[arg(long)]
        experiment: PathBuf,
        #[arg(long = "job-id", default_value_t = 0)]
        job_id: u64,
        /// JSON object of token to value or list of values
        #[arg(long)]
        params: String,
    },
    /// Show the hyper-parameters declared in a network definition
    Describe {
        network: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Remove generated optimizer and trial state
    Clean {
        #[arg(long)]
        experiment: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    let trial_mode = matches!(cli.command, Commands::Trial { .. });
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if trial_mode {
                // The optimizer entry point reads the last stdout line and the
                // exit status.
                eprintln!("Error: {:#}", err);
                emit_json(&json_error(error_code(&err), format!("{:#}", err)));
                std::process::exit(hp_runner::trial_exit_code(&err));
            }
            if json_mode {
                emit_json(&json_error(error_code(&err), format!("{:#}", err)));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Setup {
            experiment,
            optimize,
            constraint,
            constraint_val,
            epochs,
            launch,
            json,
        } => {
            let request = SetupRequest {
                experiment,
                optimize: optimize.into(),
                constraint: constraint.map(Into::into),
                constraint_value: constraint_val,
                epochs,
            };
            let options = hp_runner::SetupOptions {
                launch,
                trial_binary: Some(std::env::current_exe()?),
            };
            let result = hp_runner::setup_experiment(request, &options)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "result": setup_result_to_json(&result)
                })));
            }
            println!("experiment_name: {}", result.experiment_name);
            println!("mode: {:?}", result.mode);
            println!("hyperparameters: {}", result.tokens.join(", "));
            println!("search_space: {}", result.search_space_path.display());
            if !result.launched {
                println!("next: start the optimizer on {}", result.search_space_path.display());
            }
        }
        Commands::Trial {
            experiment,
            job_id,
            params,
        } => {
            let params = hp_runner::parse_trial_params(&params)?;
            let outcome = hp_runner::run_trial(&experiment, job_id, &params)?;
            // Printed as text: NaN is not valid serde_json output.
            println!("{}", outcome.value);
        }
        Commands::Describe { network, json } => {
            let extraction = hp_runner::describe_network(&network)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "result": {
                        "hyperparameters": extraction.specs,
                    }
                })));
            }
            for spec in &extraction.specs {
                let transform = spec
                    .transform
                    .map(|t| t.code())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}: {} [{}, {}] transform={}",
                    spec.token, spec.kind, spec.min, spec.max, transform
                );
            }
        }
        Commands::Clean { experiment } => {
            for dir in hp_runner::clean_experiment(&experiment)? {
                println!("cleaned: {}", dir.display());
            }
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

fn error_code(err: &anyhow::Error) -> &'static str {
    use hp_runner::error::HyperpowerError as E;
    match err.downcast_ref::<E>() {
        Some(E::MissingTool { .. }) => "missing_tool",
        Some(E::MissingFile { .. }) => "missing_file",
        Some(E::NoHyperparameters) => "no_hyperparameters",
        Some(E::DuplicateToken(_)) => "duplicate_token",
        Some(E::InvalidDeclaration { .. }) | Some(E::InvalidTransform { .. }) => {
            "invalid_declaration"
        }
        Some(E::NoMeasurements(_)) => "no_measurements",
        Some(E::MissingConstraint(_))
        | Some(E::MissingConstraintValue(_))
        | Some(E::InvalidMetricPair { .. }) => "invalid_constraint",
        Some(_) => "trial_failed",
        None => "command_failed",
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Setup { json, .. } | Commands::Describe { json, .. } => *json,
        _ => false,
    }
}

fn setup_result_to_json(result: &hp_runner::SetupResult) -> Value {
    json!({
        "experiment_name": result.experiment_name,
        "mode": result.mode,
        "hyperparameters": result.tokens,
        "search_space": result.search_space_path.display().to_string(),
        "launched": result.launched,
    })
}
