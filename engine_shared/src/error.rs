//! Configuration errors shared by every crate in the workspace.

use thiserror::Error;

/// A configuration value that can never produce a valid tick.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("substep size must be finite and positive, got {0}")]
    InvalidSubstepSize(f32),

    #[error("max_substeps must be at least 1")]
    ZeroMaxSubsteps,

    #[error("elapsed time must be finite and non-negative, got {0}")]
    InvalidElapsed(f32),

    #[error("worker_threads must be at least 1")]
    ZeroWorkers,

    #[error("config parse error: {0}")]
    Parse(String),
}
