use crate::config::{Constraint, ExecMode, ExperimentConfig, Metric};
use crate::model::Evaluation;
use crate::profile::HardwareProfile;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

pub trait TrialRunner {
    fn profile(&mut self) -> Result<HardwareProfile>;
    fn train(&mut self, epochs: usize) -> Result<Evaluation>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialState {
    Init,
    HardwareDone,
    Violated,
    Train,
    Done,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy: Option<f64>,
}

impl TrialResult {
    fn record_profile(&mut self, profile: &HardwareProfile) {
        self.runtime = Some(profile.runtime);
        self.power = Some(profile.power);
        self.energy = Some(profile.energy);
    }

    fn record_evaluation(&mut self, eval: &Evaluation) {
        self.loss = Some(eval.loss);
        self.accuracy = Some(eval.accuracy);
    }

    pub fn metric(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Error => self.accuracy.map(error_from_accuracy),
            Metric::Energy => self.energy,
            Metric::Runtime => self.runtime,
            Metric::Power => self.power,
        }
    }
}

/// What the trial returns to the optimizer.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectiveValue {
    Scalar(f64),
    /// Objective first, constraint second.
    Tasks {
        objective: (Metric, f64),
        constraint: (Metric, f64),
    },
}

impl ObjectiveValue {
    pub fn objective(&self) -> f64 {
        match self {
            ObjectiveValue::Scalar(v) => *v,
            ObjectiveValue::Tasks { objective, .. } => objective.1,
        }
    }

    pub fn constraint_margin(&self) -> Option<f64> {
        match self {
            ObjectiveValue::Scalar(_) => None,
            ObjectiveValue::Tasks { constraint, .. } => Some(constraint.1),
        }
    }
}

fn write_number(f: &mut fmt::Formatter<'_>, v: f64) -> fmt::Result {
    if v.is_nan() {
        f.write_str("NaN")
    } else if v.is_infinite() {
        f.write_str(if v > 0.0 { "Infinity" } else { "-Infinity" })
    } else {
        write!(f, "{:?}", v)
    }
}

/// JSON text for the optimizer side. Non-finite values use the `NaN` /
/// `Infinity` literals that Python's `json` module accepts.
impl fmt::Display for ObjectiveValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectiveValue::Scalar(v) => write_number(f, *v),
            ObjectiveValue::Tasks {
                objective,
                constraint,
            } => {
                write!(f, "{{\"{}\": ", objective.0)?;
                write_number(f, objective.1)?;
                write!(f, ", \"{}\": ", constraint.0)?;
                write_number(f, constraint.1)?;
                f.write_str("}")
            }
        }
    }
}

pub fn error_from_accuracy(accuracy: f64) -> f64 {
    100.0 - accuracy * 100.0
}

/// `threshold - measured`; non-negative means the constraint holds.
pub fn constraint_margin(threshold: f64, measured: f64) -> f64 {
    threshold - measured
}

pub fn evaluate_objective<R: TrialRunner>(
    config: &ExperimentConfig,
    runner: &mut R,
) -> Result<(ObjectiveValue, TrialResult)> {
    let mut result = TrialResult::default();
    match (config.mode, config.constraint) {
        (ExecMode::Unconstrained, _) => {
            let eval = runner.train(config.epochs)?;
            result.record_evaluation(&eval);
            let error = error_from_accuracy(eval.accuracy);
            info!(loss = eval.loss, accuracy = eval.accuracy, error, "trial evaluated");
            Ok((ObjectiveValue::Scalar(error), result))
        }
        (ExecMode::Constrained, Some(constraint)) => {
            let value = constrained(config, constraint, runner, &mut result)?;
            Ok((value, result))
        }
        (ExecMode::Constrained, None) => Err(anyhow!(
            "constrained mode without a constraint in the experiment config"
        )),
    }
}

fn constrained<R: TrialRunner>(
    config: &ExperimentConfig,
    constraint: Constraint,
    runner: &mut R,
    result: &mut TrialResult,
) -> Result<ObjectiveValue> {
    let mut state = TrialState::Init;
    let profile = runner.profile()?;
    result.record_profile(&profile);
    advance(&mut state, TrialState::HardwareDone);

    if config.optimize == Metric::Error {
        let measured = result
            .metric(constraint.metric)
            .ok_or_else(|| anyhow!("profiling did not produce {}", constraint.metric))?;
        let margin = constraint_margin(constraint.threshold, measured);
        if measured >= constraint.threshold {
            advance(&mut state, TrialState::Violated);
            warn!(
                metric = %constraint.metric,
                measured,
                threshold = constraint.threshold,
                "hardware constraint violated, skipping training"
            );
            return Ok(ObjectiveValue::Tasks {
                objective: (Metric::Error, f64::NAN),
                constraint: (constraint.metric, margin),
            });
        }
        advance(&mut state, TrialState::Train);
        let eval = runner.train(config.epochs)?;
        result.record_evaluation(&eval);
        advance(&mut state, TrialState::Done);
        let error = error_from_accuracy(eval.accuracy);
        info!(error, margin, "constrained trial evaluated");
        Ok(ObjectiveValue::Tasks {
            objective: (Metric::Error, error),
            constraint: (constraint.metric, margin),
        })
    } else {
        // Error is only known after training.
        let objective = result
            .metric(config.optimize)
            .ok_or_else(|| anyhow!("profiling did not produce {}", config.optimize))?;
        advance(&mut state, TrialState::Train);
        let eval = runner.train(config.epochs)?;
        result.record_evaluation(&eval);
        advance(&mut state, TrialState::Done);
        let error = error_from_accuracy(eval.accuracy);
        let margin = constraint_margin(constraint.threshold, error);
        info!(objective, error, margin, "constrained trial evaluated");
        Ok(ObjectiveValue::Tasks {
            objective: (config.optimize, objective),
            constraint: (constraint.metric, margin),
        })
    }
}

fn advance(state: &mut TrialState, next: TrialState) {
    tracing::debug!(from = ?state, to = ?next, "trial state");
    *state = next;
}
