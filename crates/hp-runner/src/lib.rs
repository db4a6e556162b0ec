pub mod config;
pub mod error;
pub mod executor;
pub mod extract;
pub mod harness;
pub mod model;
pub mod objective;
pub mod profile;
pub mod template;
pub mod transform;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use config::{ExperimentConfig, ExperimentSettings, SetupRequest};
use error::HyperpowerError;
use executor::ModelTrialRunner;
use extract::{extract, Extraction, HyperparamSpec, SearchSpaceDescription};
use harness::HarnessBackend;
use model::{ModelBackend, ModelDefinition};
use objective::{evaluate_objective, ObjectiveValue, TrialResult};
use profile::{NvidiaSmiSampler, PowerSampler};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;
use template::{transform_params, TemplateSource, TransformedParams, TrialParams};
use tracing::{debug, info, warn};

pub use config::{ExecMode, Metric};

/// Exit status of `hyperpower trial` when the whole search has to stop.
pub const SEARCH_ABORT_EXIT_CODE: i32 = 3;

pub fn trial_exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<HyperpowerError>() {
        Some(e) if e.aborts_search() => SEARCH_ABORT_EXIT_CODE,
        _ => 1,
    }
}

#[derive(Debug, Clone)]
pub struct ExperimentLayout {
    pub root: PathBuf,
    pub model_dir: PathBuf,
    pub optimizer_dir: PathBuf,
    pub db_dir: PathBuf,
    pub tmp_dir: PathBuf,
}

impl ExperimentLayout {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            model_dir: root.join("model"),
            optimizer_dir: root.join("optimizer"),
            db_dir: root.join("db"),
            tmp_dir: root.join("tmp"),
        }
    }

    pub fn network_def(&self) -> PathBuf {
        self.model_dir.join("network_def.yaml")
    }

    pub fn search_space(&self) -> PathBuf {
        self.optimizer_dir.join("config.json")
    }

    pub fn config_state(&self) -> PathBuf {
        self.tmp_dir.join("experiment_config.json")
    }

    pub fn definitions_state(&self) -> PathBuf {
        self.tmp_dir.join("hyperparam_definitions.json")
    }

    pub fn template(&self) -> PathBuf {
        self.tmp_dir.join("network_template.yaml")
    }

    pub fn power_log(&self) -> PathBuf {
        self.tmp_dir.join("power_samples.log")
    }

    pub fn concrete_network(&self, prefix: &str) -> PathBuf {
        self.tmp_dir.join(format!("{}_network_def.yaml", prefix))
    }

    pub fn trial_record(&self, prefix: &str) -> PathBuf {
        self.tmp_dir.join(format!("{}_trial.json", prefix))
    }

    fn prepare(&self) -> Result<()> {
        for dir in [&self.model_dir, &self.optimizer_dir, &self.db_dir, &self.tmp_dir] {
            if !dir.exists() {
                fs::create_dir_all(dir)?;
                info!(path = %dir.display(), "created experiment directory");
            }
        }
        Ok(())
    }
}

fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn atomic_write_json_pretty<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

fn load_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}; was setup run?", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("corrupt state file {}", path.display()))
}

fn clear_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct SetupOptions {
    pub launch: bool,
    pub trial_binary: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SetupResult {
    pub experiment_name: String,
    pub mode: ExecMode,
    pub tokens: Vec<String>,
    pub search_space_path: PathBuf,
    pub launched: bool,
}

pub fn setup_experiment(request: SetupRequest, options: &SetupOptions) -> Result<SetupResult> {
    let root = request
        .experiment
        .canonicalize()
        .map_err(|_| HyperpowerError::MissingFile {
            path: request.experiment.clone(),
            hint: "experiment directory does not exist".to_string(),
        })?;
    let layout = ExperimentLayout::new(&root);
    let network_def = layout.network_def();
    if !network_def.exists() {
        return Err(HyperpowerError::MissingFile {
            path: network_def,
            hint: "the network definition with HYPERPARAM declarations is required".to_string(),
        }
        .into());
    }

    let settings = ExperimentSettings::load(&root)?;
    let config = ExperimentConfig::from_request(
        SetupRequest {
            experiment: root.clone(),
            ..request
        },
        settings,
    )?;
    if config.needs_power_sampler() {
        NvidiaSmiSampler::probe(&config.settings.profiling.sampler_program)?;
    }
    if options.launch {
        check_optimizer(&config)?;
    }

    let source = fs::read_to_string(&network_def)?;
    let extraction = extract(&source)?;
    info!(
        count = extraction.specs.len(),
        mode = ?config.mode,
        "hyper-parameters extracted"
    );

    let prefix = Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let experiment_name = format!("hyperpower-{}", prefix);
    let task_pair = config.task_pair();
    let description = SearchSpaceDescription::new(
        &config.settings.optimizer.language,
        &config.settings.optimizer.main_file,
        &experiment_name,
        &extraction.specs,
        task_pair.as_ref(),
    );

    layout.prepare()?;
    cleanup_previous_run(&layout, &config)?;

    atomic_write_json_pretty(&layout.search_space(), &description)?;
    atomic_write_json_pretty(&layout.config_state(), &config)?;
    let definitions: BTreeMap<&str, &HyperparamSpec> = extraction
        .specs
        .iter()
        .map(|s| (s.token.as_str(), s))
        .collect();
    atomic_write_json_pretty(&layout.definitions_state(), &definitions)?;
    atomic_write_bytes(&layout.template(), extraction.template.as_str().as_bytes())?;
    if let Some(binary) = &options.trial_binary {
        let shim = layout
            .optimizer_dir
            .join(&config.settings.optimizer.main_file);
        atomic_write_bytes(&shim, entry_point_shim(binary, &root)?.as_bytes())?;
    }
    info!(path = %layout.search_space().display(), "search space written");

    let result = SetupResult {
        experiment_name,
        mode: config.mode,
        tokens: extraction.specs.iter().map(|s| s.token.clone()).collect(),
        search_space_path: layout.search_space(),
        launched: options.launch,
    };
    if options.launch {
        launch_optimizer(&layout, &config)?;
    }
    Ok(result)
}

fn check_optimizer(config: &ExperimentConfig) -> Result<()> {
    let optimizer = &config.settings.optimizer;
    let main = optimizer.main_script().ok_or_else(|| HyperpowerError::MissingTool {
        tool: "optimizer".to_string(),
        hint: format!("set optimizer.root in {}", config::SETTINGS_FILE),
    })?;
    let mut required = vec![main];
    required.extend(optimizer.cleanup_script());
    required.extend(optimizer.database_bin.clone());
    for path in required {
        if !path.exists() {
            return Err(HyperpowerError::MissingFile {
                path,
                hint: "required by the optimizer".to_string(),
            }
            .into());
        }
    }
    Ok(())
}

fn cleanup_previous_run(layout: &ExperimentLayout, config: &ExperimentConfig) -> Result<()> {
    if layout.search_space().exists() {
        if let Some(script) = config
            .settings
            .optimizer
            .cleanup_script()
            .filter(|p| p.exists())
        {
            info!(script = %script.display(), "running optimizer cleanup");
            let status = Command::new("bash")
                .arg(&script)
                .arg(&layout.optimizer_dir)
                .status()?;
            if !status.success() {
                warn!(%status, "optimizer cleanup script failed");
            }
        }
    }
    clear_dir(&layout.optimizer_dir)?;
    clear_dir(&layout.tmp_dir)?;
    Ok(())
}

fn launch_optimizer(layout: &ExperimentLayout, config: &ExperimentConfig) -> Result<()> {
    let optimizer = &config.settings.optimizer;
    let main = optimizer
        .main_script()
        .ok_or_else(|| anyhow!("optimizer.root is not configured"))?;
    info!(optimizer = %main.display(), "launching optimizer");
    let status = Command::new(&optimizer.python)
        .arg(&main)
        .arg(&layout.optimizer_dir)
        .status()
        .with_context(|| format!("failed to start {}", optimizer.python))?;
    if !status.success() {
        return Err(anyhow!("optimizer exited with {}", status));
    }
    Ok(())
}

/// Entry point the optimizer imports; it forwards each suggestion to
/// `hyperpower trial` and decodes the JSON it prints. An abort exit status
/// terminates the optimizer process as well.
fn entry_point_shim(binary: &Path, experiment: &Path) -> Result<String> {
    let binary = serde_json::to_string(&binary.to_string_lossy())?;
    let experiment = serde_json::to_string(&experiment.to_string_lossy())?;
    let abort = SEARCH_ABORT_EXIT_CODE;
    Ok(format!(
        r#"import json
import os
import signal
import subprocess
import sys

HYPERPOWER = {binary}
EXPERIMENT = {experiment}
ABORT_EXIT_CODE = {abort}


def main(job_id, params):
    suggestion = dict((k, v.tolist() if hasattr(v, "tolist") else v) for k, v in params.items())
    proc = subprocess.Popen([HYPERPOWER, "trial", "--experiment", EXPERIMENT,
                             "--job-id", str(job_id), "--params", json.dumps(suggestion)],
                            stdout=subprocess.PIPE)
    out, _ = proc.communicate()
    lines = [l for l in out.decode("utf-8").splitlines() if l.strip()]
    if proc.returncode == ABORT_EXIT_CODE:
        sys.stderr.write("hyperpower: search aborted: %s\n" % (lines[-1] if lines else ""))
        os.kill(os.getppid(), signal.SIGTERM)
        os._exit(ABORT_EXIT_CODE)
    if proc.returncode != 0:
        raise subprocess.CalledProcessError(proc.returncode, HYPERPOWER, out)
    return json.loads(lines[-1])
"#
    ))
}

#[derive(Debug, Clone)]
pub struct Experiment {
    pub layout: ExperimentLayout,
    pub config: ExperimentConfig,
    pub specs: BTreeMap<String, HyperparamSpec>,
    pub template: TemplateSource,
}

impl Experiment {
    pub fn load(root: &Path) -> Result<Self> {
        let layout = ExperimentLayout::new(root);
        let config: ExperimentConfig = load_json_file(&layout.config_state())?;
        let specs: BTreeMap<String, HyperparamSpec> =
            load_json_file(&layout.definitions_state())?;
        let template = fs::read_to_string(layout.template())
            .with_context(|| format!("failed to read {}", layout.template().display()))?;
        Ok(Self {
            layout,
            config,
            specs,
            template: TemplateSource::new(template),
        })
    }
}

#[derive(Debug, Clone)]
pub struct TrialOutcome {
    pub prefix: String,
    pub transformed: TransformedParams,
    pub result: TrialResult,
    pub value: ObjectiveValue,
    pub concrete_path: PathBuf,
}

pub fn run_trial(root: &Path, job_id: u64, params: &TrialParams) -> Result<TrialOutcome> {
    let experiment = Experiment::load(root)?;
    let settings = &experiment.config.settings;
    let backend = HarnessBackend::new(&settings.trainer.command, &experiment.layout.root)?;
    let sampler = NvidiaSmiSampler::from_settings(&settings.profiling);
    run_trial_with(&experiment, job_id, params, &backend, &sampler)
}

pub fn run_trial_with<B: ModelBackend, S: PowerSampler>(
    experiment: &Experiment,
    job_id: u64,
    params: &TrialParams,
    backend: &B,
    sampler: &S,
) -> Result<TrialOutcome> {
    let started = Instant::now();
    let prefix = format!("{}_job{}", Utc::now().format("%Y%m%d_%H%M%S"), job_id);
    info!(job_id, prefix = %prefix, "trial started");

    let transformed = transform_params(&experiment.specs, params)?;
    debug!(?transformed, "transformed parameters");
    let concrete = experiment.template.instantiate(&transformed)?;
    let concrete_path = experiment.layout.concrete_network(&prefix);
    atomic_write_bytes(&concrete_path, concrete.as_bytes())?;
    let definition = ModelDefinition::parse(&concrete)
        .with_context(|| format!("instantiated network {}", concrete_path.display()))?;

    let power_log = experiment.layout.power_log();
    let mut runner = ModelTrialRunner {
        definition: &definition,
        backend,
        sampler,
        profiling: &experiment.config.settings.profiling,
        power_log: &power_log,
    };
    let (value, result) = evaluate_objective(&experiment.config, &mut runner)?;

    let record = json!({
        "schema_version": "trial_record_v1",
        "job_id": job_id,
        "prefix": prefix,
        "params": params,
        "transformed": transformed,
        "network": concrete_path.display().to_string(),
        "result": result,
        "returned": value.to_string(),
        "elapsed_secs": started.elapsed().as_secs_f64(),
        "finished_at": Utc::now().to_rfc3339(),
    });
    atomic_write_json_pretty(&experiment.layout.trial_record(&prefix), &record)?;
    info!(
        elapsed_secs = started.elapsed().as_secs_f64(),
        returned = %value,
        "trial finished"
    );

    Ok(TrialOutcome {
        prefix,
        transformed,
        result,
        value,
        concrete_path,
    })
}

pub fn parse_trial_params(raw: &str) -> Result<TrialParams> {
    let value: Value = serde_json::from_str(raw).context("trial params must be JSON")?;
    match value {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(anyhow!("trial params must be a JSON object, got {}", other)),
    }
}

pub fn describe_network(path: &Path) -> Result<Extraction> {
    let source =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    extract(&source)
}

pub fn clean_experiment(root: &Path) -> Result<Vec<PathBuf>> {
    let layout = ExperimentLayout::new(root);
    let mut removed = Vec::new();
    for dir in [&layout.optimizer_dir, &layout.tmp_dir] {
        if dir.exists() {
            clear_dir(dir)?;
            removed.push(dir.clone());
        }
    }
    Ok(removed)
}
