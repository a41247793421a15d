//! LOD budget split.
//!
//! Modules are scored by benefit and each gets a slice of the scene's resource budget
//! in proportion to its score.

use std::sync::Arc;

use crate::module::ModuleScene;

/// Result of one benefit pass.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LodAllocation {
    pub benefit_sum: f32,
    /// Sum of what modules reported consuming.
    pub consumed: f32,
}

/// Hands out `budget` across `modules` proportionally to their benefit.
///
/// Non-positive or non-finite benefits count as zero. When nothing has benefit, nobody
/// is allocated anything.
pub fn allocate(modules: &[Arc<dyn ModuleScene>], budget: f32) -> LodAllocation {
    let benefits: Vec<f32> = modules
        .iter()
        .map(|m| {
            let b = m.benefit();
            if b.is_finite() && b > 0.0 {
                b
            } else {
                0.0
            }
        })
        .collect();
    let benefit_sum: f32 = benefits.iter().sum();

    let mut consumed = 0.0;
    for (module, benefit) in modules.iter().zip(&benefits) {
        let share = if benefit_sum > 0.0 {
            budget * benefit / benefit_sum
        } else {
            0.0
        };
        consumed += module.allocate_resource(share).clamp(0.0, share.max(0.0));
    }

    LodAllocation {
        benefit_sum,
        consumed,
    }
}
