//! `engine_shared`
//!
//! Building blocks for stepping a physics scene once per frame.
//!
//! Design goals:
//! - Deterministic where practical: the inline dispatcher and synthetic backend give
//!   reproducible task order and event streams.
//! - Clear separation of concerns (timestep, task graph, notifications, stats).
//! - Traits for abstraction and dependency injection (`PhysicsBackend`, `CpuDispatcher`).
//! - No `unsafe`.

pub mod config;
pub mod error;
pub mod notify;
pub mod physics;
pub mod stats;
pub mod sync;
pub mod task;
pub mod timestep;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::config::*;
    pub use crate::error::*;
    pub use crate::notify::*;
    pub use crate::physics::*;
    pub use crate::stats::*;
    pub use crate::sync::*;
    pub use crate::task::*;
    pub use crate::timestep::*;
}
