//! Substep planning.
//!
//! Turns a variable wall-clock `elapsed` into a whole number of fixed substeps plus a
//! carried remainder. Arithmetic is done in `f64`; the backend receives `f32` sizes.

use tracing::warn;

use crate::config::TimestepMode;

/// Added to `remainder / substep_size` before flooring so that e.g. `0.1 / (1/60)`
/// yields 6 and not 5.
pub const SUBSTEP_EPSILON: f64 = 1.0e-6;

/// Below this much accumulated time no whole millisecond is booked.
const MILLISECOND_THRESHOLD: f64 = 0.001;

/// What the backend should do for one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubstepPlan {
    /// Fixed substep size, or the whole elapsed time in variable mode.
    pub substep_size: f32,
    /// Number of fixed substeps. `0` in variable mode means "one continuous step".
    pub substep_count: u32,
    pub variable: bool,
    /// Elapsed time passed to `plan`.
    pub elapsed: f32,
}

impl SubstepPlan {
    /// Number of `step_simulation` calls the backend will receive.
    pub fn backend_steps(&self) -> u32 {
        if self.variable {
            u32::from(self.elapsed > 0.0)
        } else {
            self.substep_count
        }
    }

    /// Total simulated time covered by this plan.
    pub fn simulated_time(&self) -> f64 {
        f64::from(self.substep_size) * f64::from(self.backend_steps())
    }

    /// Notifications are batched when more than one fixed substep runs.
    pub fn batches_notifications(&self) -> bool {
        self.substep_count > 1
    }
}

/// Converts elapsed time into substeps without drift.
#[derive(Debug, Clone)]
pub struct SubstepAccumulator {
    mode: TimestepMode,
    remainder: f64,
    dropped: f64,
}

impl SubstepAccumulator {
    pub fn new(mode: TimestepMode) -> Self {
        Self {
            mode,
            remainder: 0.0,
            dropped: 0.0,
        }
    }

    pub fn mode(&self) -> TimestepMode {
        self.mode
    }

    /// Switches mode. The remainder is cleared because it belongs to the old substep size.
    pub fn set_mode(&mut self, mode: TimestepMode) {
        self.mode = mode;
        self.remainder = 0.0;
    }

    /// Carried time in seconds, always in `[0, substep_size)` in fixed mode.
    pub fn remainder(&self) -> f64 {
        self.remainder
    }

    /// Total time discarded by the substep cap since construction.
    pub fn dropped_time(&self) -> f64 {
        self.dropped
    }

    /// Plans one tick. `elapsed` must be finite and non-negative.
    pub fn plan(&mut self, elapsed: f32) -> SubstepPlan {
        debug_assert!(elapsed.is_finite() && elapsed >= 0.0);

        let (substep_size, max_substeps) = match self.mode {
            TimestepMode::Variable => {
                self.remainder = 0.0;
                return SubstepPlan {
                    substep_size: elapsed,
                    substep_count: 0,
                    variable: true,
                    elapsed,
                };
            }
            TimestepMode::Fixed {
                substep_size,
                max_substeps,
            } => (substep_size, max_substeps),
        };

        let size = f64::from(substep_size);
        self.remainder += f64::from(elapsed);

        let whole = (self.remainder / size + SUBSTEP_EPSILON).floor();
        // Saturating cast: absurd elapsed values still land on the cap.
        let whole_steps = whole as u64;
        let count = whole_steps.min(u64::from(max_substeps)) as u32;

        // The unclamped count is subtracted, so time beyond the cap is dropped rather
        // than carried into later ticks.
        self.remainder -= whole * size;
        self.remainder = self.remainder.clamp(0.0, size);
        if self.remainder >= size {
            self.remainder = 0.0;
        }
        debug_assert!(self.remainder >= 0.0 && self.remainder < size);

        if whole_steps > u64::from(count) {
            let dropped = (whole_steps - u64::from(count)) as f64 * size;
            self.dropped += dropped;
            warn!(
                requested = whole_steps,
                max_substeps,
                dropped_secs = dropped,
                "Substep cap hit, dropping excess time"
            );
        }

        SubstepPlan {
            substep_size,
            substep_count: count,
            variable: false,
            elapsed,
        }
    }
}

/// Books elapsed time into whole milliseconds once a tick actually advances the backend.
#[derive(Debug, Clone, Default)]
pub struct ElapsedClock {
    pending: f64,
    last_elapsed: f64,
    ms_remainder: f64,
    total_ms: u64,
    step_was_valid: bool,
}

impl ElapsedClock {
    /// Records one retired tick. Ticks that ran no substep keep accumulating.
    pub fn record(&mut self, elapsed: f32, step_was_valid: bool) {
        self.step_was_valid = step_was_valid;
        self.pending += f64::from(elapsed);
        if !step_was_valid {
            return;
        }

        self.last_elapsed = self.pending;
        self.pending = 0.0;

        let carried = self.ms_remainder + self.last_elapsed;
        if carried > MILLISECOND_THRESHOLD {
            let ms = (carried * 1000.0).floor();
            self.total_ms += ms as u64;
            self.ms_remainder = carried - ms * 0.001;
        }
    }

    pub fn total_ms(&self) -> u64 {
        self.total_ms
    }

    /// Time covered by the last valid step, including skipped ticks before it.
    pub fn last_elapsed(&self) -> f64 {
        self.last_elapsed
    }

    pub fn step_was_valid(&self) -> bool {
        self.step_was_valid
    }
}
