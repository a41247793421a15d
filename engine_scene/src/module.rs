//! Module scenes.
//!
//! A module scene is a subsystem that rides along with the physics tick: it gets a share
//! of the LOD budget, work between substeps, and a bracket of hooks around result
//! retrieval. Hooks take `&self` since they are called from worker threads.

use std::sync::Arc;

use engine_shared::stats::{StatId, StatValue};
use parking_lot::RwLock;
use tracing::info;

use crate::error::SceneError;

/// Per-tick hooks for a subsystem attached to a scene.
///
/// Every hook has a no-op default. Hooks must not lock the physics world for writing.
pub trait ModuleScene: Send + Sync {
    /// Unique within one scheduler.
    fn name(&self) -> &str;

    /// Called from `simulate`, before the tick's graph is built.
    fn simulate(&self, _elapsed: f32) {}

    /// LOD benefit score for this tick. Non-positive means no share of the budget.
    fn benefit(&self) -> f32 {
        0.0
    }

    /// Receives this module's share of the budget; returns what it consumed.
    fn allocate_resource(&self, _budget: f32) -> f32 {
        0.0
    }

    /// Runs before substep index `substep` (never 0) of a multi-substep tick.
    fn interstep(&self, _substep: u32, _substep_count: u32, _substep_size: f32) {}

    fn fetch_results_pre_render_lock(&self) {}

    fn lock_render_resources(&self) {}

    /// Called after backend results were pulled, with render resources locked.
    fn fetch_results(&self) {}

    fn unlock_render_resources(&self) {}

    fn fetch_results_post_render_unlock(&self) {}

    /// Values added into the scene's stats snapshot.
    fn stats(&self) -> Vec<(StatId, StatValue)> {
        Vec::new()
    }
}

/// Ordered set of module scenes. Iteration order is registration order.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: RwLock<Vec<Arc<dyn ModuleScene>>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, module: Arc<dyn ModuleScene>) -> Result<(), SceneError> {
        let mut modules = self.modules.write();
        if modules.iter().any(|m| m.name() == module.name()) {
            return Err(SceneError::DuplicateModule(module.name().to_string()));
        }
        info!(module = module.name(), "Module scene registered");
        modules.push(module);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<Arc<dyn ModuleScene>, SceneError> {
        let mut modules = self.modules.write();
        let Some(index) = modules.iter().position(|m| m.name() == name) else {
            return Err(SceneError::UnknownModule(name.to_string()));
        };
        info!(module = name, "Module scene unregistered");
        Ok(modules.remove(index))
    }

    pub fn names(&self) -> Vec<String> {
        self.modules
            .read()
            .iter()
            .map(|m| m.name().to_string())
            .collect()
    }

    /// Current modules in registration order. Hooks are called on the copy so the
    /// registry lock is never held across module code.
    pub fn snapshot(&self) -> Vec<Arc<dyn ModuleScene>> {
        self.modules.read().clone()
    }

    pub fn len(&self) -> usize {
        self.modules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.read().is_empty()
    }
}
