//! Process-backed [`ModelBackend`].
//!
//! The trainer is any program that reads one JSON request per line on stdin
//! and answers each with one JSON line on stdout:
//!
//! ```text
//! {"op":"build","model":{...}}       -> {"ok":true}
//! {"op":"fit","epochs":50}           -> {"ok":true,"history":{"loss":[..],"val_accuracy":[..]}}
//! {"op":"evaluate","limit":100}      -> {"ok":true,"loss":0.93,"accuracy":0.68}
//! ```
//!
//! Failures answer `{"ok":false,"error":"..."}`. Stdout lines that are not a
//! response object are treated as trainer chatter and skipped.

use crate::error::HyperpowerError;
use crate::model::{Evaluation, ModelBackend, ModelDefinition, TrainableModel, TrainingHistory};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use tracing::debug;

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    Build { model: &'a ModelDefinition },
    Fit { epochs: usize },
    Evaluate { limit: Option<usize> },
}

#[derive(Debug, Deserialize)]
struct Response {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(flatten)]
    body: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct HarnessBackend {
    command: Vec<String>,
    workdir: PathBuf,
}

impl HarnessBackend {
    pub fn new(command: &[String], experiment_dir: &Path) -> Result<Self> {
        if command.is_empty() || command[0].trim().is_empty() {
            return Err(HyperpowerError::Harness(format!(
                "trainer.command is not configured in {}",
                experiment_dir.join(crate::config::SETTINGS_FILE).display()
            ))
            .into());
        }
        Ok(Self {
            command: resolve_command(command, experiment_dir),
            workdir: experiment_dir.to_path_buf(),
        })
    }
}

/// Path-like first arguments (`./train.sh`) resolve against the experiment
/// directory; bare program names go through `PATH`.
fn resolve_command(command: &[String], experiment_dir: &Path) -> Vec<String> {
    let mut out = command.to_vec();
    if out[0].starts_with("./") || out[0].starts_with("../") {
        out[0] = experiment_dir.join(&out[0]).to_string_lossy().to_string();
    }
    out
}

impl ModelBackend for HarnessBackend {
    type Model = HarnessModel;

    fn build(&self, definition: &ModelDefinition) -> Result<HarnessModel> {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]);
        cmd.current_dir(&self.workdir);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to start trainer {:?}", self.command))?;
        let stdin = child.stdin.take().ok_or_else(|| anyhow!("trainer stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow!("trainer stdout"))?;
        let mut model = HarnessModel {
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
        };
        model.request(&Request::Build { model: definition })?;
        Ok(model)
    }
}

/// One live trainer process holding one model.
pub struct HarnessModel {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl HarnessModel {
    fn request(&mut self, request: &Request<'_>) -> Result<Map<String, Value>> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| HyperpowerError::Harness("trainer stdin closed".to_string()))?;
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .and_then(|_| stdin.flush())
            .map_err(|e| HyperpowerError::Harness(format!("trainer stopped reading: {}", e)))?;

        let mut buf = String::new();
        loop {
            buf.clear();
            let n = self.stdout.read_line(&mut buf)?;
            if n == 0 {
                return Err(HyperpowerError::Harness(
                    "trainer exited before answering".to_string(),
                )
                .into());
            }
            let trimmed = buf.trim();
            match serde_json::from_str::<Response>(trimmed) {
                Ok(resp) if resp.ok => return Ok(resp.body),
                Ok(resp) => {
                    return Err(HyperpowerError::Harness(
                        resp.error.unwrap_or_else(|| "unspecified trainer error".to_string()),
                    )
                    .into())
                }
                Err(_) => {
                    if !trimmed.is_empty() {
                        debug!(line = trimmed, "trainer output");
                    }
                }
            }
        }
    }
}

impl TrainableModel for HarnessModel {
    fn fit(&mut self, epochs: usize) -> Result<TrainingHistory> {
        let mut body = self.request(&Request::Fit { epochs })?;
        match body.remove("history") {
            Some(history) => Ok(serde_json::from_value(history).context("malformed history")?),
            None => Ok(TrainingHistory::default()),
        }
    }

    fn evaluate(&mut self, limit: Option<usize>) -> Result<Evaluation> {
        let body = self.request(&Request::Evaluate { limit })?;
        Ok(serde_json::from_value(Value::Object(body)).context("malformed evaluation")?)
    }
}

impl Drop for HarnessModel {
    fn drop(&mut self) {
        // Closing stdin lets a well-behaved trainer exit on its own first.
        drop(self.stdin.take());
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
