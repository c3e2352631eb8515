//! Orchestration request input.

use crate::error::{OrchestraError, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What the caller wants built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct OrchestrationRequest {
    /// Free-form description of the system to build.
    pub text: String,
    /// Explicit feature list, e.g. `["audit log", "rbac"]`.
    #[serde(default)]
    pub features: Vec<String>,
    /// Platform constraints, e.g. `["postgres", "react"]`.
    #[serde(default)]
    pub platform: Vec<String>,
}

impl OrchestrationRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.features.push(feature.into());
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform.push(platform.into());
        self
    }

    /// JSON Schema describing the request shape.
    pub fn schema() -> Value {
        let schema = schemars::schema_for!(OrchestrationRequest);
        serde_json::to_value(schema)
            .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
    }

    /// Parse and validate a JSON request.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| OrchestraError::InvalidRequest(format!("invalid JSON: {e}")))?;

        let schema = Self::schema();
        if let Ok(validator) = jsonschema::validator_for(&schema) {
            let errors: Vec<String> = validator
                .iter_errors(&value)
                .map(|e| format!("{}: {e}", e.instance_path()))
                .collect();
            if !errors.is_empty() {
                return Err(OrchestraError::InvalidRequest(errors.join("; ")));
            }
        }

        let request: Self = serde_json::from_value(value)
            .map_err(|e| OrchestraError::InvalidRequest(e.to_string()))?;
        if request.text.trim().is_empty() && request.features.is_empty() {
            return Err(OrchestraError::InvalidRequest(
                "request needs text or at least one feature".into(),
            ));
        }
        Ok(request)
    }

    /// Text plus features, used for classification and prediction.
    pub fn combined_text(&self) -> String {
        let mut text = self.text.clone();
        for feature in &self.features {
            text.push(' ');
            text.push_str(feature);
        }
        text
    }
}
