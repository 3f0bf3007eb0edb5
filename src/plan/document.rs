use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;

/// Plan as produced by the external plan generator. Untrusted until validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    pub steps: Vec<PlanStepDocument>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStepDocument {
    pub id: String,
    pub capability: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    #[serde(default, alias = "required")]
    pub critical: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PlanDocumentError {
    #[error("failed to read plan {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid plan json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid plan yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl PlanDocument {
    pub fn from_json(raw: &str) -> Result<Self, PlanDocumentError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, PlanDocumentError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Reads a plan file; `.yaml`/`.yml` files are parsed as YAML, anything else as JSON.
    pub fn from_path(path: &Path) -> Result<Self, PlanDocumentError> {
        let raw = fs::read_to_string(path).map_err(|source| PlanDocumentError::Read {
            path: path.display().to_string(),
            source,
        })?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml(&raw),
            _ => Self::from_json(&raw),
        }
    }
}

impl PlanStepDocument {
    pub fn new(id: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capability: capability.into(),
            arguments: Map::new(),
            critical: false,
            depends_on: Vec::new(),
        }
    }

    pub fn with_argument(mut self, name: impl Into<String>, value: Value) -> Self {
        self.arguments.insert(name.into(), value);
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn after(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }
}
