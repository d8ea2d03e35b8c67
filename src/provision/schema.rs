//! OpenAPI schema of the `QueryKnowledgeBase` action group

use crate::Result;
use serde_json::Value;
use std::path::Path;

const BUILTIN_SCHEMA: &str = include_str!("../../assets/openapi_schema.yaml");

/// An OpenAPI document ready to be sent as an inline action-group payload
#[derive(Debug, Clone, PartialEq)]
pub struct ApiSchema {
    document: Value,
}

impl ApiSchema {
    /// The knowledge-base retrieval API shipped with the crate
    pub fn builtin() -> Result<Self> {
        Self::from_yaml_str(BUILTIN_SCHEMA)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let document: Value = serde_yaml::from_str(yaml)?;
        Ok(Self { document })
    }

    /// Load YAML (or JSON, which is a YAML subset) from disk
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Built-in schema unless a file is configured
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_yaml_file(path),
            None => Self::builtin(),
        }
    }

    /// JSON string for `APISchema::Payload`
    pub fn payload(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.document)?)
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    /// Paths declared by the schema, e.g. `/retrieveKnowledge`
    pub fn api_paths(&self) -> Vec<String> {
        self.document
            .get("paths")
            .and_then(Value::as_object)
            .map(|paths| paths.keys().cloned().collect())
            .unwrap_or_default()
    }
}
