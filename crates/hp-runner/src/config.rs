use crate::error::HyperpowerError;
use crate::extract::TaskPair;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub const SETTINGS_FILE: &str = "hyperpower.yaml";
pub const DEFAULT_EPOCHS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Error,
    Energy,
    Runtime,
    Power,
}

impl Metric {
    pub fn name(&self) -> &'static str {
        match self {
            Metric::Error => "error",
            Metric::Energy => "energy",
            Metric::Runtime => "runtime",
            Metric::Power => "power",
        }
    }

    /// Everything except `error` is measured by profiling, not training.
    pub fn is_hardware(&self) -> bool {
        !matches!(self, Metric::Error)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    Constrained,
    Unconstrained,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub metric: Metric,
    pub threshold: f64,
}

#[derive(Debug, Clone)]
pub struct SetupRequest {
    pub experiment: PathBuf,
    pub optimize: Metric,
    pub constraint: Option<Metric>,
    pub constraint_value: Option<f64>,
    pub epochs: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub optimize: Metric,
    #[serde(default)]
    pub constraint: Option<Constraint>,
    pub mode: ExecMode,
    pub epochs: usize,
    pub experiment: PathBuf,
    #[serde(default)]
    pub settings: ExperimentSettings,
}

impl ExperimentConfig {
    pub fn from_request(request: SetupRequest, settings: ExperimentSettings) -> Result<Self> {
        if request.epochs == 0 {
            return Err(anyhow!("epochs must be at least 1"));
        }
        let constraint = match (request.optimize, request.constraint) {
            (Metric::Error, None) => None,
            (optimize, None) => {
                return Err(HyperpowerError::MissingConstraint(optimize.to_string()).into())
            }
            (Metric::Error, Some(Metric::Error)) => {
                return Err(HyperpowerError::InvalidMetricPair {
                    optimize: "error".to_string(),
                    constraint: "error".to_string(),
                    reason: "constraint must be a hardware metric".to_string(),
                }
                .into())
            }
            (optimize, Some(metric)) if optimize.is_hardware() && metric.is_hardware() => {
                return Err(HyperpowerError::InvalidMetricPair {
                    optimize: optimize.to_string(),
                    constraint: metric.to_string(),
                    reason: "a hardware objective is constrained by error".to_string(),
                }
                .into())
            }
            (_, Some(metric)) => {
                let threshold = request
                    .constraint_value
                    .ok_or_else(|| HyperpowerError::MissingConstraintValue(metric.to_string()))?;
                if !threshold.is_finite() {
                    return Err(anyhow!("constraint value must be finite, got {}", threshold));
                }
                Some(Constraint { metric, threshold })
            }
        };
        let mode = if constraint.is_some() {
            ExecMode::Constrained
        } else {
            ExecMode::Unconstrained
        };
        Ok(Self {
            optimize: request.optimize,
            constraint,
            mode,
            epochs: request.epochs,
            experiment: request.experiment,
            settings,
        })
    }

    /// Constrained runs always profile, and profiling always samples power.
    pub fn needs_power_sampler(&self) -> bool {
        self.mode == ExecMode::Constrained
    }

    pub fn task_pair(&self) -> Option<TaskPair> {
        self.constraint.map(|c| TaskPair {
            objective: self.optimize.to_string(),
            constraint: c.metric.to_string(),
        })
    }
}

/// Optional `hyperpower.yaml` in the experiment directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ExperimentSettings {
    pub trainer: TrainerSettings,
    pub profiling: ProfilingSettings,
    pub optimizer: OptimizerSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TrainerSettings {
    /// Harness command; relative paths resolve against the experiment dir.
    pub command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilingSettings {
    pub passes: usize,
    pub batch: usize,
    pub pass_interval_ms: u64,
    pub sampler_program: String,
    pub device: u32,
    pub sample_interval_ms: u64,
}

impl Default for ProfilingSettings {
    fn default() -> Self {
        Self {
            passes: 30,
            batch: 100,
            pass_interval_ms: 1000,
            sampler_program: "nvidia-smi".to_string(),
            device: 0,
            sample_interval_ms: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerSettings {
    pub root: Option<PathBuf>,
    pub python: String,
    pub language: String,
    pub main_file: String,
    pub database_bin: Option<PathBuf>,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            root: None,
            python: "python".to_string(),
            language: "PYTHON".to_string(),
            main_file: "mainrun.py".to_string(),
            database_bin: None,
        }
    }
}

impl OptimizerSettings {
    pub fn main_script(&self) -> Option<PathBuf> {
        self.root
            .as_ref()
            .map(|r| r.join("spearmint").join("main.py"))
    }

    pub fn cleanup_script(&self) -> Option<PathBuf> {
        self.root
            .as_ref()
            .map(|r| r.join("spearmint").join("cleanup.sh"))
    }
}

impl ExperimentSettings {
    pub fn load(experiment_dir: &Path) -> Result<Self> {
        let path = experiment_dir.join(SETTINGS_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let settings: Self = serde_yaml::from_str(&raw)
            .with_context(|| format!("invalid settings in {}", path.display()))?;
        if settings.profiling.passes == 0 || settings.profiling.batch == 0 {
            return Err(anyhow!(
                "{}: profiling.passes and profiling.batch must be positive",
                path.display()
            ));
        }
        Ok(settings)
    }
}
