//! ```text
//! filters: HYPERPARAM{"type": "INT", "token": "conv1_num_output", "transform": "X2", "min": 10, "max": 18}
//! ```

use crate::error::HyperpowerError;
use crate::template::TemplateSource;
use crate::transform::{ParamKind, Transform};
use anyhow::Result;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Number;
use std::collections::BTreeSet;
use tracing::debug;

pub const MARKER: &str = "HYPERPARAM";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperparamSpec {
    pub token: String,
    #[serde(rename = "type")]
    pub kind: ParamKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Transform>,
    pub min: f64,
    pub max: f64,
}

/// Byte range of one declaration, marker included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeclarationSpan {
    pub start: usize,
    pub payload_start: usize,
    pub end: usize,
}

#[derive(Debug, Deserialize)]
struct DeclarationPayload {
    #[serde(rename = "type")]
    kind: ParamKind,
    token: String,
    #[serde(default)]
    transform: Option<String>,
    min: Number,
    max: Number,
}

#[derive(Debug, Clone)]
pub struct Extraction {
    pub specs: Vec<HyperparamSpec>,
    pub template: TemplateSource,
}

/// Pass 1: find every `HYPERPARAM{...}` span. A marker that is not followed
/// by `{` (an already substituted placeholder, or prose) is skipped.
pub fn scan_declarations(source: &str) -> Result<Vec<DeclarationSpan>> {
    let bytes = source.as_bytes();
    let mut spans = Vec::new();
    let mut cursor = 0;
    while let Some(found) = source[cursor..].find(MARKER) {
        let start = cursor + found;
        let mut pos = start + MARKER.len();
        while pos < bytes.len() && (bytes[pos] == b' ' || bytes[pos] == b'\t') {
            pos += 1;
        }
        if pos >= bytes.len() || bytes[pos] != b'{' {
            cursor = start + MARKER.len();
            continue;
        }
        let end = match_braces(bytes, pos).ok_or(HyperpowerError::InvalidDeclaration {
            offset: start,
            reason: "unterminated '{' in declaration".to_string(),
        })?;
        spans.push(DeclarationSpan {
            start,
            payload_start: pos,
            end,
        });
        cursor = end;
    }
    Ok(spans)
}

/// Returns the index one past the brace closing the one at `open`. Braces
/// inside JSON string literals are ignored.
fn match_braces(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

pub fn decode_declaration(source: &str, span: &DeclarationSpan) -> Result<HyperparamSpec> {
    let invalid = |reason: String| HyperpowerError::InvalidDeclaration {
        offset: span.start,
        reason,
    };
    let payload: DeclarationPayload = serde_json::from_str(&source[span.payload_start..span.end])
        .map_err(|e| invalid(e.to_string()))?;
    if payload.token.is_empty()
        || !payload
            .token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(invalid(format!(
            "token '{}' must be a non-empty identifier",
            payload.token
        ))
        .into());
    }
    let transform = payload
        .transform
        .as_deref()
        .map(Transform::parse)
        .transpose()?;
    let (min, max) = match payload.kind {
        ParamKind::Int => {
            let bound = |n: &Number, which: &str| {
                n.as_i64().map(|v| v as f64).ok_or_else(|| {
                    invalid(format!("INT {} bound must be an integer, got {}", which, n))
                })
            };
            (bound(&payload.min, "min")?, bound(&payload.max, "max")?)
        }
        ParamKind::Float => {
            let bound = |n: &Number| n.as_f64().unwrap_or(f64::NAN);
            (bound(&payload.min), bound(&payload.max))
        }
    };
    if !(min <= max) {
        return Err(invalid(format!("min {} exceeds max {}", min, max)).into());
    }
    Ok(HyperparamSpec {
        token: payload.token,
        kind: payload.kind,
        transform,
        min,
        max,
    })
}

/// Runs both passes and builds the template.
pub fn extract(source: &str) -> Result<Extraction> {
    let spans = scan_declarations(source)?;
    if spans.is_empty() {
        return Err(HyperpowerError::NoHyperparameters.into());
    }

    let mut seen = BTreeSet::new();
    let mut specs = Vec::with_capacity(spans.len());
    let mut template = String::with_capacity(source.len());
    let mut last = 0;
    for span in &spans {
        let spec = decode_declaration(source, span)?;
        if !seen.insert(spec.token.clone()) {
            return Err(HyperpowerError::DuplicateToken(spec.token).into());
        }
        template.push_str(&source[last..span.start]);
        template.push_str(&placeholder(&spec.token));
        last = span.end;
        debug!(token = %spec.token, kind = %spec.kind, "hyper-parameter declared");
        specs.push(spec);
    }
    template.push_str(&source[last..]);

    Ok(Extraction {
        specs,
        template: TemplateSource::new(template),
    })
}

pub fn placeholder(token: &str) -> String {
    format!("{}_{}", MARKER, token)
}

#[derive(Debug, Clone, Serialize)]
pub enum Likelihood {
    #[serde(rename = "GAUSSIAN")]
    Gaussian,
}

#[derive(Debug, Clone, Serialize)]
pub enum TaskRole {
    #[serde(rename = "OBJECTIVE")]
    Objective,
    #[serde(rename = "CONSTRAINT")]
    Constraint,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskDecl {
    #[serde(rename = "type")]
    pub role: TaskRole,
    pub likelihood: Likelihood,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum VariableDecl {
    #[serde(rename = "INT")]
    Int { size: u32, min: i64, max: i64 },
    #[serde(rename = "FLOAT")]
    Float { size: u32, min: f64, max: f64 },
}

impl From<&HyperparamSpec> for VariableDecl {
    fn from(spec: &HyperparamSpec) -> Self {
        match spec.kind {
            ParamKind::Int => VariableDecl::Int {
                size: 1,
                min: spec.min as i64,
                max: spec.max as i64,
            },
            ParamKind::Float => VariableDecl::Float {
                size: 1,
                min: spec.min,
                max: spec.max,
            },
        }
    }
}

/// Names of the two tasks declared in constrained mode.
#[derive(Debug, Clone)]
pub struct TaskPair {
    pub objective: String,
    pub constraint: String,
}

/// The optimizer's `config.json`.
#[derive(Debug, Clone, Serialize)]
pub struct SearchSpaceDescription {
    pub language: String,
    #[serde(rename = "main-file")]
    pub main_file: String,
    #[serde(rename = "experiment-name")]
    pub experiment_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub likelihood: Option<Likelihood>,
    #[serde(serialize_with = "ordered_map")]
    pub variables: Vec<(String, VariableDecl)>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "ordered_tasks"
    )]
    pub tasks: Option<Vec<(String, TaskDecl)>>,
}

impl SearchSpaceDescription {
    pub fn new(
        language: &str,
        main_file: &str,
        experiment_name: &str,
        specs: &[HyperparamSpec],
        tasks: Option<&TaskPair>,
    ) -> Self {
        let variables = specs
            .iter()
            .map(|s| (s.token.clone(), VariableDecl::from(s)))
            .collect();
        let (likelihood, tasks) = match tasks {
            Some(pair) => (
                None,
                Some(vec![
                    (
                        pair.objective.clone(),
                        TaskDecl {
                            role: TaskRole::Objective,
                            likelihood: Likelihood::Gaussian,
                        },
                    ),
                    (
                        pair.constraint.clone(),
                        TaskDecl {
                            role: TaskRole::Constraint,
                            likelihood: Likelihood::Gaussian,
                        },
                    ),
                ]),
            ),
            None => (Some(Likelihood::Gaussian), None),
        };
        Self {
            language: language.to_string(),
            main_file: main_file.to_string(),
            experiment_name: experiment_name.to_string(),
            likelihood,
            variables,
            tasks,
        }
    }
}

fn ordered_map<S: Serializer>(
    entries: &[(String, VariableDecl)],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_map(entries.iter().map(|(k, v)| (k, v)))
}

fn ordered_tasks<S: Serializer>(
    entries: &Option<Vec<(String, TaskDecl)>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    let entries = entries.as_deref().unwrap_or_default();
    serializer.collect_map(entries.iter().map(|(k, v)| (k, v)))
}
