//! Scene scheduler errors.

use engine_shared::error::ConfigError;
use thiserror::Error;

/// Errors reported synchronously by [`crate::SceneScheduler`] calls.
///
/// Backend step failures are not errors here; they come back as
/// [`engine_shared::physics::StepErrorFlags`] from `fetch_results`.
#[derive(Debug, Error)]
pub enum SceneError {
    #[error("no physics world attached")]
    NoWorldAttached,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("module scene '{0}' is already registered")]
    DuplicateModule(String),
    #[error("no module scene named '{0}'")]
    UnknownModule(String),
}
