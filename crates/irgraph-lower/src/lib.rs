pub mod config;
pub mod error;
pub mod phase;
pub mod pipeline;

// Re-export commonly used types
pub use config::PipelineConfig;
pub use error::LowerError;
pub use phase::{LoweringPhase, PhaseContext};
pub use pipeline::{Pipeline, PipelineReport};
