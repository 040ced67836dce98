//! Tool (function-calling) definitions.

use serde::{Deserialize, Serialize};

/// A tool the model may invoke.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub function: FunctionSpec,
}

/// The callable function a [`Tool`] wraps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema fragment describing the accepted arguments.
    pub parameters: serde_json::Value,
}

impl Tool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            function: FunctionSpec {
                name: name.into(),
                description: Some(description.into()),
                parameters,
            },
        }
    }
}
