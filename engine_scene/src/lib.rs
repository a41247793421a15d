//! `engine_scene`
//!
//! Scene-side systems:
//! - Substep planning and the per-tick task graph
//! - `simulate` / `fetch_results` handshake with the caller
//! - Notification batching across substeps
//! - Module scenes and the LOD resource budget
//! - Per-tick stats
//! - A headless host frame loop (`runner`)
//!
//! Threading model:
//! - `simulate` only builds and submits work; the dispatcher's workers step the backend.
//! - The physics world sits behind one RW lock shared with the caller's own queries.

pub mod error;
pub mod lod;
pub mod module;
pub mod runner;
pub mod scheduler;

pub use error::SceneError;
pub use module::{ModuleRegistry, ModuleScene};
pub use scheduler::{FetchStatus, SceneScheduler, TickPhase};
