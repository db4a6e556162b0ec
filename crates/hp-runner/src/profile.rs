use crate::config::ProfilingSettings;
use crate::error::HyperpowerError;
use crate::model::TrainableModel;
use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HardwareProfile {
    pub runtime: f64,
    pub power: f64,
    pub energy: f64,
}

/// Dropping the guard kills and reaps the sampler process.
pub struct SamplerGuard {
    child: Option<Child>,
}

impl SamplerGuard {
    pub fn from_child(child: Child) -> Self {
        Self { child: Some(child) }
    }

    pub fn detached() -> Self {
        Self { child: None }
    }

    pub fn stop(mut self) {
        self.terminate();
    }

    fn terminate(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for SamplerGuard {
    fn drop(&mut self) {
        self.terminate();
    }
}

pub trait PowerSampler {
    /// Starts sampling into `log_path`, truncating any previous log.
    fn start(&self, log_path: &Path) -> Result<SamplerGuard>;
}

/// `nvidia-smi -i <device> -lms <interval> -q -d POWER -f <log>`.
#[derive(Debug, Clone)]
pub struct NvidiaSmiSampler {
    pub program: String,
    pub device: u32,
    pub interval_ms: u64,
}

impl NvidiaSmiSampler {
    pub fn from_settings(settings: &ProfilingSettings) -> Self {
        Self {
            program: settings.sampler_program.clone(),
            device: settings.device,
            interval_ms: settings.sample_interval_ms,
        }
    }

    pub fn probe(program: &str) -> Result<()> {
        let status = Command::new(program)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(s) if s.success() => Ok(()),
            Ok(s) => Err(HyperpowerError::MissingTool {
                tool: program.to_string(),
                hint: format!("exited with {}; is the driver installed?", s),
            }
            .into()),
            Err(e) => Err(HyperpowerError::MissingTool {
                tool: program.to_string(),
                hint: e.to_string(),
            }
            .into()),
        }
    }
}

impl PowerSampler for NvidiaSmiSampler {
    fn start(&self, log_path: &Path) -> Result<SamplerGuard> {
        if log_path.exists() {
            fs::remove_file(log_path)?;
        }
        let child = Command::new(&self.program)
            .arg("-i")
            .arg(self.device.to_string())
            .arg("-lms")
            .arg(self.interval_ms.to_string())
            .args(["-q", "-d", "POWER", "-f"])
            .arg(log_path)
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| HyperpowerError::MissingTool {
                tool: self.program.clone(),
                hint: e.to_string(),
            })?;
        Ok(SamplerGuard::from_child(child))
    }
}

/// Average power readings (`Avg : 61.23 W`) in a sampler log.
pub fn parse_power_log(text: &str) -> Vec<f64> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let regex = RE.get_or_init(|| {
        Regex::new(r"Avg\s+: ([0-9]+\.[0-9]+) W").expect("power log pattern must compile")
    });
    regex
        .captures_iter(text)
        .filter_map(|c| c[1].parse::<f64>().ok())
        .collect()
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

pub fn measure<M: TrainableModel, S: PowerSampler>(
    model: &mut M,
    sampler: &S,
    settings: &ProfilingSettings,
    log_path: &Path,
) -> Result<HardwareProfile> {
    let pause = Duration::from_millis(settings.pass_interval_ms);
    let mut runtimes = Vec::with_capacity(settings.passes);

    info!(passes = settings.passes, batch = settings.batch, "starting power sampler");
    let guard = sampler.start(log_path)?;
    for pass in 0..settings.passes {
        // Each timed pass includes the pause before it.
        let started = Instant::now();
        thread::sleep(pause);
        let eval = model.evaluate(Some(settings.batch))?;
        let elapsed = started.elapsed().as_secs_f64();
        debug!(pass, elapsed, accuracy = eval.accuracy, "evaluation pass");
        runtimes.push(elapsed);
    }
    guard.stop();
    info!("power sampler stopped");

    let log = fs::read_to_string(log_path).unwrap_or_else(|e| {
        warn!(error = %e, path = %log_path.display(), "power log unreadable");
        String::new()
    });
    let samples = parse_power_log(&log);
    if samples.is_empty() {
        return Err(HyperpowerError::NoMeasurements(log_path.to_path_buf()).into());
    }

    let runtime = mean(&runtimes);
    let power = mean(&samples);
    let profile = HardwareProfile {
        runtime,
        power,
        energy: power * runtime,
    };
    info!(
        runtime = profile.runtime,
        power = profile.power,
        energy = profile.energy,
        samples = samples.len(),
        "hardware profile"
    );
    Ok(profile)
}
