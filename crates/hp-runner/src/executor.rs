use crate::config::ProfilingSettings;
use crate::model::{Evaluation, ModelBackend, ModelDefinition, TrainableModel};
use crate::objective::TrialRunner;
use crate::profile::{measure, HardwareProfile, PowerSampler};
use anyhow::Result;
use std::path::Path;
use tracing::{debug, info};

/// Profiling and training each build a fresh model.
pub struct ModelTrialRunner<'a, B, S> {
    pub definition: &'a ModelDefinition,
    pub backend: &'a B,
    pub sampler: &'a S,
    pub profiling: &'a ProfilingSettings,
    pub power_log: &'a Path,
}

impl<B: ModelBackend, S: PowerSampler> TrialRunner for ModelTrialRunner<'_, B, S> {
    fn profile(&mut self) -> Result<HardwareProfile> {
        let mut model = self.backend.build(self.definition)?;
        info!("warm-up epoch before profiling");
        model.fit(1)?;
        measure(&mut model, self.sampler, self.profiling, self.power_log)
    }

    fn train(&mut self, epochs: usize) -> Result<Evaluation> {
        let mut model = self.backend.build(self.definition)?;
        info!(epochs, "training");
        let history = model.fit(epochs)?;
        debug!(val_accuracy = ?history.val_accuracy, "training history");
        let eval = model.evaluate(None)?;
        info!(loss = eval.loss, accuracy = eval.accuracy, "test evaluation");
        Ok(eval)
    }
}
