//! Pipeline configuration.

use serde::{Deserialize, Serialize};

use crate::error::LowerError;

/// Options for a [`Pipeline`](crate::pipeline::Pipeline) run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Whether "all elements of kind K" queries also cover external modules
    /// unless a phase asks otherwise.
    pub include_external_modules: bool,
    /// Run the store consistency check after every phase.
    pub verify_after_each_phase: bool,
    /// Names of phases to skip.
    pub disabled_phases: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            include_external_modules: true,
            verify_after_each_phase: false,
            disabled_phases: Vec::new(),
        }
    }
}

impl PipelineConfig {
    pub fn from_json(json: &str) -> Result<Self, LowerError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn is_disabled(&self, phase: &str) -> bool {
        self.disabled_phases.iter().any(|name| name == phase)
    }
}
