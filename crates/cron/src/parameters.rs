//! Job parameters: declared defaults merged with per-run values.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Resolved parameter values for one invocation.
pub type Parameters = BTreeMap<String, String>;

/// A parameter a job declares.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Parameter {
    pub name: String,
    /// Human-friendly name shown in the management API.
    pub label: Option<String>,
    pub default: Option<String>,
    pub required: bool,
}

impl Parameter {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_default(mut self, value: impl Into<String>) -> Self {
        self.default = Some(value.into());
        self
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Merge `declared` defaults with `provided` values; provided values win.
///
/// Values for undeclared names are kept. A required parameter that ends up
/// without a value (or with an empty one) is an error.
pub fn resolve_parameters(
    job: &str,
    declared: &[Parameter],
    provided: Option<&Parameters>,
) -> Result<Parameters> {
    let mut resolved = Parameters::new();
    for param in declared {
        if let Some(default) = &param.default {
            resolved.insert(param.name.clone(), default.clone());
        }
    }
    if let Some(provided) = provided {
        resolved.extend(provided.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    for param in declared.iter().filter(|p| p.required) {
        if resolved.get(&param.name).is_none_or(String::is_empty) {
            return Err(Error::MissingParameter {
                job: job.to_string(),
                parameter: param.name.clone(),
            });
        }
    }

    Ok(resolved)
}
