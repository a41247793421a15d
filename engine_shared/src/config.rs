//! Configuration system.
//!
//! Loads scene and runner configuration from JSON strings (file IO left to app).

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Upper bound accepted by [`clamp_resource_budget`].
pub const MAX_RESOURCE_BUDGET: f32 = 4_294_967_040.0;

/// How elapsed time is handed to the physics backend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TimestepMode {
    /// Elapsed time is cut into whole substeps of `substep_size` seconds.
    Fixed { substep_size: f32, max_substeps: u32 },
    /// The backend integrates the full elapsed time in one continuous step.
    Variable,
}

impl Default for TimestepMode {
    fn default() -> Self {
        TimestepMode::Fixed {
            substep_size: 1.0 / 60.0,
            max_substeps: 8,
        }
    }
}

impl TimestepMode {
    /// Checks that the mode can produce a substep plan.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            TimestepMode::Fixed {
                substep_size,
                max_substeps,
            } => {
                if !substep_size.is_finite() || substep_size <= 0.0 {
                    return Err(ConfigError::InvalidSubstepSize(substep_size));
                }
                if max_substeps == 0 {
                    return Err(ConfigError::ZeroMaxSubsteps);
                }
                Ok(())
            }
            TimestepMode::Variable => Ok(()),
        }
    }
}

/// Per-scene scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneConfig {
    #[serde(default)]
    pub timestep: TimestepMode,
    /// LOD resource budget shared out by the benefit node.
    #[serde(default = "default_resource_budget")]
    pub resource_budget: f32,
    /// Worker threads for the default thread-pool dispatcher.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

// Roughly 1/30 s worth of work.
fn default_resource_budget() -> f32 {
    33.333_333
}

fn default_worker_threads() -> usize {
    2
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            timestep: TimestepMode::default(),
            resource_budget: default_resource_budget(),
            worker_threads: default_worker_threads(),
        }
    }
}

impl SceneConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.timestep.validate()?;
        if self.worker_threads == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        Ok(())
    }
}

/// Configuration for the headless `scene_runner` host loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default)]
    pub scene: SceneConfig,
    /// Host frame rate; each frame calls `simulate(1 / frame_hz)`.
    #[serde(default = "default_frame_hz")]
    pub frame_hz: u32,
    /// Number of frames to run before exiting.
    #[serde(default = "default_frames")]
    pub frames: u32,
    /// Seed for the synthetic backend.
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_bodies")]
    pub bodies: u32,
    #[serde(default = "default_events_per_step")]
    pub events_per_step: u32,
    /// Simulated render work overlapped with each physics tick.
    #[serde(default = "default_render_work_ms")]
    pub render_work_ms: u64,
}

fn default_frame_hz() -> u32 {
    30
}

fn default_frames() -> u32 {
    120
}

fn default_bodies() -> u32 {
    64
}

fn default_events_per_step() -> u32 {
    2
}

fn default_render_work_ms() -> u64 {
    4
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            scene: SceneConfig::default(),
            frame_hz: default_frame_hz(),
            frames: default_frames(),
            seed: 0,
            bodies: default_bodies(),
            events_per_step: default_events_per_step(),
            render_work_ms: default_render_work_ms(),
        }
    }
}

impl RunnerConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

/// Clamps a resource budget into the accepted range. NaN becomes zero.
pub fn clamp_resource_budget(value: f32) -> f32 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, MAX_RESOURCE_BUDGET)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fixed_timestep_and_fills_defaults() {
        let cfg = SceneConfig::from_json_str(
            r#"{"timestep":{"mode":"fixed","substep_size":0.01,"max_substeps":4}}"#,
        )
        .unwrap();
        assert_eq!(
            cfg.timestep,
            TimestepMode::Fixed {
                substep_size: 0.01,
                max_substeps: 4
            }
        );
        assert_eq!(cfg.worker_threads, 2);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn parses_variable_timestep() {
        let cfg = SceneConfig::from_json_str(r#"{"timestep":{"mode":"variable"}}"#).unwrap();
        assert_eq!(cfg.timestep, TimestepMode::Variable);
    }

    #[test]
    fn rejects_zero_max_substeps() {
        let mode = TimestepMode::Fixed {
            substep_size: 1.0 / 60.0,
            max_substeps: 0,
        };
        assert_eq!(mode.validate(), Err(ConfigError::ZeroMaxSubsteps));
    }

    #[test]
    fn rejects_non_positive_substep() {
        let mode = TimestepMode::Fixed {
            substep_size: 0.0,
            max_substeps: 4,
        };
        assert_eq!(mode.validate(), Err(ConfigError::InvalidSubstepSize(0.0)));
    }

    #[test]
    fn runner_config_defaults_from_empty_object() {
        let cfg = RunnerConfig::from_json_str("{}").unwrap();
        assert_eq!(cfg.frame_hz, 30);
        assert_eq!(cfg.scene.timestep, TimestepMode::default());
    }

    #[test]
    fn budget_is_clamped() {
        assert_eq!(clamp_resource_budget(-1.0), 0.0);
        assert_eq!(clamp_resource_budget(f32::INFINITY), MAX_RESOURCE_BUDGET);
        assert_eq!(clamp_resource_budget(f32::NAN), 0.0);
        assert_eq!(clamp_resource_budget(12.5), 12.5);
    }
}
