use crate::error::HyperpowerError;
use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub dataset: DatasetSpec,
    pub batch_size: usize,
    pub layers: Vec<LayerSpec>,
    pub compile: CompileSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSpec {
    pub name: String,
    pub num_classes: usize,
    #[serde(default = "default_true")]
    pub normalize: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Padding {
    #[default]
    Valid,
    Same,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationKind {
    Relu,
    Sigmoid,
    Tanh,
    Softmax,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerSpec {
    Conv2d {
        filters: u32,
        kernel_size: u32,
        #[serde(default)]
        padding: Padding,
    },
    Activation {
        function: ActivationKind,
    },
    MaxPooling2d {
        pool_size: u32,
    },
    Dropout {
        rate: f64,
    },
    Flatten,
    Dense {
        units: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileSpec {
    pub loss: String,
    pub optimizer: OptimizerSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OptimizerSpec {
    Sgd {
        lr: f64,
        #[serde(default)]
        momentum: f64,
        #[serde(default)]
        decay: f64,
    },
    Adam {
        lr: f64,
    },
}

impl ModelDefinition {
    pub fn parse(source: &str) -> Result<Self> {
        let def: Self = serde_yaml::from_str(source)
            .map_err(|e| HyperpowerError::InvalidModel(e.to_string()))?;
        def.validate()?;
        Ok(def)
    }

    pub fn validate(&self) -> Result<(), HyperpowerError> {
        let invalid = |msg: String| Err(HyperpowerError::InvalidModel(msg));
        if self.batch_size == 0 {
            return invalid("batch_size must be positive".to_string());
        }
        if self.dataset.num_classes < 2 {
            return invalid("dataset.num_classes must be at least 2".to_string());
        }
        if self.layers.is_empty() {
            return invalid("layers must not be empty".to_string());
        }
        for (idx, layer) in self.layers.iter().enumerate() {
            match layer {
                LayerSpec::Conv2d {
                    filters,
                    kernel_size,
                    ..
                } if *filters == 0 || *kernel_size == 0 => {
                    return invalid(format!("layer {}: conv2d sizes must be positive", idx));
                }
                LayerSpec::MaxPooling2d { pool_size: 0 } => {
                    return invalid(format!("layer {}: pool_size must be positive", idx));
                }
                LayerSpec::Dropout { rate } if !(0.0..1.0).contains(rate) => {
                    return invalid(format!("layer {}: dropout rate {} not in [0, 1)", idx, rate));
                }
                LayerSpec::Dense { units: 0 } => {
                    return invalid(format!("layer {}: dense units must be positive", idx));
                }
                _ => {}
            }
        }
        let lr = match self.compile.optimizer {
            OptimizerSpec::Sgd { lr, .. } | OptimizerSpec::Adam { lr } => lr,
        };
        if !(lr.is_finite() && lr > 0.0) {
            return invalid(format!("learning rate {} must be positive", lr));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    #[serde(default)]
    pub loss: Vec<f64>,
    #[serde(default)]
    pub accuracy: Vec<f64>,
    #[serde(default)]
    pub val_loss: Vec<f64>,
    #[serde(default)]
    pub val_accuracy: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub loss: f64,
    pub accuracy: f64,
}

pub trait TrainableModel {
    fn fit(&mut self, epochs: usize) -> Result<TrainingHistory>;

    /// Evaluates on the first `limit` test samples, or all of them.
    fn evaluate(&mut self, limit: Option<usize>) -> Result<Evaluation>;
}

pub trait ModelBackend {
    type Model: TrainableModel;

    fn build(&self, definition: &ModelDefinition) -> Result<Self::Model>;
}
