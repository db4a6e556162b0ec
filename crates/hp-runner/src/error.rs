use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HyperpowerError {
    #[error("required tool not found: {tool} ({hint})")]
    MissingTool { tool: String, hint: String },

    #[error("required file not found at {path}: {hint}")]
    MissingFile { path: PathBuf, hint: String },

    #[error("no hyper-parameters declared; add HYPERPARAM{{...}} declarations to the network definition")]
    NoHyperparameters,

    #[error("token '{0}' is declared by more than one hyper-parameter")]
    DuplicateToken(String),

    #[error("invalid hyper-parameter declaration at byte {offset}: {reason}")]
    InvalidDeclaration { offset: usize, reason: String },

    #[error("invalid transform '{code}': {reason}")]
    InvalidTransform { code: String, reason: String },

    #[error("optimizing '{0}' requires a constraint metric")]
    MissingConstraint(String),

    #[error("constraint metric '{0}' is set but no constraint value was given")]
    MissingConstraintValue(String),

    #[error("cannot optimize '{optimize}' under a '{constraint}' constraint: {reason}")]
    InvalidMetricPair {
        optimize: String,
        constraint: String,
        reason: String,
    },

    #[error("optimizer suggested a value for unknown token '{0}'")]
    UnknownToken(String),

    #[error("optimizer gave no value for declared token '{0}'")]
    MissingSuggestion(String),

    #[error("template has no remaining placeholder for token '{0}'")]
    PlaceholderMissing(String),

    #[error("invalid model definition: {0}")]
    InvalidModel(String),

    #[error("no power measurements found in {0}")]
    NoMeasurements(PathBuf),

    #[error("trainer harness failed: {0}")]
    Harness(String),
}

impl HyperpowerError {
    /// Whether a trial failing with this error must stop the optimizer too.
    pub fn aborts_search(&self) -> bool {
        !matches!(
            self,
            HyperpowerError::InvalidModel(_) | HyperpowerError::Harness(_)
        )
    }
}
