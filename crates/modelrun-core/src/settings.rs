//! Analysis settings as delivered with each task.
//!
//! The settings document is kept verbatim (it is persisted into the
//! workspace for the computation module) alongside a typed view of the keys
//! the worker itself needs.

use crate::error::{Result, WorkerError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Component, Path};

/// Key under which the analysis settings are nested in a settings document.
pub const ANALYSIS_SETTINGS_KEY: &str = "analysis_settings";

const REQUIRED_KEYS: [&str; 4] = [
    "source_tag",
    "analysis_tag",
    "module_supplier_id",
    "model_version_id",
];

/// Model-specific switches selecting data file variants.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_set: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_occurrence_id: Option<String>,
}

/// Typed view of the keys the worker depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisSettings {
    pub source_tag: String,
    pub analysis_tag: String,
    pub module_supplier_id: String,
    pub model_version_id: String,
    #[serde(default)]
    pub model_settings: ModelSettings,
}

/// A settings document: the raw JSON plus its parsed analysis settings.
#[derive(Debug, Clone)]
pub struct SettingsDocument {
    raw: Value,
    analysis: Map<String, Value>,
    settings: AnalysisSettings,
}

impl SettingsDocument {
    /// Parse a settings document.
    ///
    /// Accepts either `{"analysis_settings": {...}}` or the bare settings
    /// object. Missing required keys fail with a configuration error.
    pub fn from_value(raw: Value) -> Result<Self> {
        let inner = analysis_section(&raw)?.clone();
        for key in REQUIRED_KEYS {
            match inner.get(key) {
                None | Some(Value::Null) => return Err(WorkerError::MissingSetting(key.to_string())),
                Some(Value::String(s)) if s.trim().is_empty() => {
                    return Err(WorkerError::InvalidSettings(format!("{key} must not be empty")))
                }
                Some(Value::String(s)) if !is_path_component(s) => {
                    return Err(WorkerError::InvalidSettings(format!(
                        "{key} must be a plain name without path separators, got {s:?}"
                    )))
                }
                Some(Value::String(_)) => {}
                Some(other) => {
                    return Err(WorkerError::InvalidSettings(format!(
                        "{key} must be a string, got {other}"
                    )))
                }
            }
        }
        let settings: AnalysisSettings = serde_json::from_value(Value::Object(inner.clone()))
            .map_err(|e| WorkerError::InvalidSettings(e.to_string()))?;
        Ok(Self {
            raw,
            analysis: inner,
            settings,
        })
    }

    /// Parse a settings document from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        let raw: Value = serde_json::from_str(text)
            .map_err(|e| WorkerError::InvalidSettings(format!("not valid JSON: {e}")))?;
        Self::from_value(raw)
    }

    pub fn settings(&self) -> &AnalysisSettings {
        &self.settings
    }

    /// The document exactly as received.
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// The analysis settings object handed to computation modules.
    pub fn analysis_map(&self) -> &Map<String, Value> {
        &self.analysis
    }
}

/// Required keys become path components of the workspace and model data
/// paths, so each must be exactly one normal component.
fn is_path_component(value: &str) -> bool {
    if value.contains('/') || value.contains('\\') {
        return false;
    }
    let mut components = Path::new(value).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn analysis_section(raw: &Value) -> Result<&Map<String, Value>> {
    match raw {
        Value::Object(top) => match top.get(ANALYSIS_SETTINGS_KEY) {
            Some(Value::Object(inner)) => Ok(inner),
            Some(other) => Err(WorkerError::InvalidSettings(format!(
                "{ANALYSIS_SETTINGS_KEY} must be an object, got {other}"
            ))),
            None => Ok(top),
        },
        other => Err(WorkerError::InvalidSettings(format!(
            "settings document must be a JSON object, got {other}"
        ))),
    }
}
