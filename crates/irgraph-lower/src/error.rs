//! Error type for lowering pipelines.

use irgraph_core::StoreError;
use thiserror::Error;

/// Errors produced while running lowering phases.
#[derive(Debug, Error)]
pub enum LowerError {
    /// A store operation failed inside a phase.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A phase reported its own failure.
    #[error("phase '{phase}' failed: {message}")]
    PhaseFailed { phase: String, message: String },

    /// A pipeline configuration could not be parsed.
    #[error("invalid pipeline configuration: {0}")]
    Config(#[from] serde_json::Error),
}
