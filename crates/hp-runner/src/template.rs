use crate::error::HyperpowerError;
use crate::extract::{placeholder, HyperparamSpec};
use crate::transform::{apply_transform, ParamValue};
use anyhow::Result;
use serde_json::Value;
use std::collections::BTreeMap;

pub type TrialParams = BTreeMap<String, Value>;

pub type TransformedParams = BTreeMap<String, ParamValue>;

/// Network definition with every declaration replaced by `HYPERPARAM_<token>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSource(String);

impl TemplateSource {
    pub fn new(text: String) -> Self {
        Self(text)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn instantiate(&self, params: &TransformedParams) -> Result<String> {
        let mut out = self.0.clone();
        for (token, value) in params {
            let needle = placeholder(token);
            let at = find_placeholder(&out, &needle)
                .ok_or_else(|| HyperpowerError::PlaceholderMissing(token.clone()))?;
            out.replace_range(at..at + needle.len(), &value.to_string());
        }
        Ok(out)
    }
}

/// First occurrence of `needle` not immediately followed by an identifier
/// character, so `HYPERPARAM_lr` does not match inside `HYPERPARAM_lr_decay`.
fn find_placeholder(haystack: &str, needle: &str) -> Option<usize> {
    let mut from = 0;
    while let Some(found) = haystack[from..].find(needle) {
        let at = from + found;
        let next = haystack[at + needle.len()..].chars().next();
        match next {
            Some(c) if c.is_ascii_alphanumeric() || c == '_' => from = at + needle.len(),
            _ => return Some(at),
        }
    }
    None
}

/// Every declared token must have a suggestion.
pub fn transform_params(
    specs: &BTreeMap<String, HyperparamSpec>,
    params: &TrialParams,
) -> Result<TransformedParams> {
    let mut out = TransformedParams::new();
    for (token, raw) in params {
        let spec = specs
            .get(token)
            .ok_or_else(|| HyperpowerError::UnknownToken(token.clone()))?;
        let value = ParamValue::from_suggestion(spec.kind, raw)?;
        out.insert(token.clone(), apply_transform(spec.transform.as_ref(), value)?);
    }
    if let Some(missing) = specs.keys().find(|t| !out.contains_key(*t)) {
        return Err(HyperpowerError::MissingSuggestion(missing.clone()).into());
    }
    Ok(out)
}
