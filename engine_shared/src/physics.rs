//! Physics backend abstraction.
//!
//! The scheduler never integrates anything itself. It drives an opaque backend that
//! accepts fixed (or variable) substeps, reports results on fetch, and emits simulation
//! events through a single replaceable callback slot.

use std::sync::Arc;

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Opaque body id as seen by event consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BodyId(pub u64);

/// An event the backend emits while stepping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SimEvent {
    Contact {
        bodies: (BodyId, BodyId),
        impulse: f32,
    },
    Trigger {
        trigger: BodyId,
        other: BodyId,
        entered: bool,
    },
    Wake(Vec<BodyId>),
    Sleep(Vec<BodyId>),
    JointBreak {
        bodies: (BodyId, BodyId),
        impulse: f32,
    },
}

/// Callback installed in the backend's notification slot.
pub type EventCallback = Arc<dyn Fn(&SimEvent) + Send + Sync>;

/// Returns true if both callbacks are the same allocation.
pub fn same_callback(a: &EventCallback, b: &EventCallback) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

bitflags::bitflags! {
    /// Failure bits surfaced through `fetch_results`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StepErrorFlags: u32 {
        /// The backend detected a numeric blow-up.
        const NUMERIC_INSTABILITY = 1 << 0;
        /// An internal backend check failed.
        const BACKEND_ASSERT = 1 << 1;
        /// The backend panicked inside a step.
        const BACKEND_PANIC = 1 << 2;
        /// The backend could not hand over results on fetch.
        const FETCH_INCOMPLETE = 1 << 3;
    }
}

impl Default for StepErrorFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Counters pulled from the backend after every fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BackendCounts {
    pub actors: u32,
    pub shapes: u32,
    pub awake_shapes: u32,
    pub shape_pairs: u32,
}

/// Physics stepper trait.
pub trait PhysicsBackend: Send + Sync + 'static {
    /// Integrates `dt_sec` seconds. Events go to the installed callback.
    fn step_simulation(&mut self, dt_sec: f32, final_step: bool) -> StepErrorFlags;

    /// Makes the results of the last steps visible. Returns false if they are not ready
    /// and `block` is false.
    fn fetch_results(&mut self, block: bool) -> bool;

    fn counts(&self) -> BackendCounts;

    /// Current occupant of the notification slot.
    fn event_callback(&self) -> Option<EventCallback>;

    fn set_event_callback(&mut self, callback: Option<EventCallback>);
}

/// No-op physics.
#[derive(Default)]
pub struct NullPhysics {
    callback: Option<EventCallback>,
}

impl PhysicsBackend for NullPhysics {
    fn step_simulation(&mut self, _dt_sec: f32, _final_step: bool) -> StepErrorFlags {
        StepErrorFlags::empty()
    }

    fn fetch_results(&mut self, _block: bool) -> bool {
        true
    }

    fn counts(&self) -> BackendCounts {
        BackendCounts::default()
    }

    fn event_callback(&self) -> Option<EventCallback> {
        self.callback.clone()
    }

    fn set_event_callback(&mut self, callback: Option<EventCallback>) {
        self.callback = callback;
    }
}

/// Settings for [`SyntheticPhysics`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticSettings {
    pub seed: u64,
    pub bodies: u32,
    /// Contact events emitted on every step.
    pub events_per_step: u32,
    /// Global step index (0-based) that reports `NUMERIC_INSTABILITY`.
    pub fail_on_step: Option<u64>,
    /// Most recent steps kept in the step log. Zero disables the log.
    #[serde(default = "default_step_log_limit")]
    pub step_log_limit: usize,
}

fn default_step_log_limit() -> usize {
    DEFAULT_STEP_LOG_LIMIT
}

pub const DEFAULT_STEP_LOG_LIMIT: usize = 1024;

impl Default for SyntheticSettings {
    fn default() -> Self {
        Self {
            seed: 0,
            bodies: 16,
            events_per_step: 1,
            fail_on_step: None,
            step_log_limit: DEFAULT_STEP_LOG_LIMIT,
        }
    }
}

/// One entry of [`SyntheticPhysics::step_log`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepRecord {
    pub dt_sec: f32,
    pub final_step: bool,
}

/// Deterministic stand-in backend for tests and the runner.
///
/// Contact events carry a running sequence number in the first body id so emission order
/// is observable. Impulses and sleep state come from a seeded RNG.
pub struct SyntheticPhysics {
    settings: SyntheticSettings,
    rng: StdRng,
    callback: Option<EventCallback>,
    steps: u64,
    emitted: u64,
    awake: u32,
    simulated: f64,
    pending_fetch: bool,
    step_log: Vec<StepRecord>,
}

impl SyntheticPhysics {
    pub fn new(settings: SyntheticSettings) -> Self {
        let rng = StdRng::seed_from_u64(settings.seed);
        let awake = settings.bodies;
        Self {
            settings,
            rng,
            callback: None,
            steps: 0,
            emitted: 0,
            awake,
            simulated: 0.0,
            pending_fetch: false,
            step_log: Vec::new(),
        }
    }

    /// The last `step_log_limit` `step_simulation` calls, oldest first.
    pub fn step_log(&self) -> &[StepRecord] {
        &self.step_log
    }

    pub fn steps_taken(&self) -> u64 {
        self.steps
    }

    /// Events emitted so far (delivered or not).
    pub fn events_emitted(&self) -> u64 {
        self.emitted
    }

    pub fn simulated_time(&self) -> f64 {
        self.simulated
    }

    /// True between a step and the `fetch_results` that collects it.
    pub fn has_pending_results(&self) -> bool {
        self.pending_fetch
    }

    fn emit(&mut self, event: SimEvent) {
        self.emitted += 1;
        if let Some(cb) = &self.callback {
            cb(&event);
        }
    }
}

impl PhysicsBackend for SyntheticPhysics {
    fn step_simulation(&mut self, dt_sec: f32, final_step: bool) -> StepErrorFlags {
        let index = self.steps;
        self.steps += 1;
        self.simulated += f64::from(dt_sec);
        self.pending_fetch = true;
        let limit = self.settings.step_log_limit;
        if limit > 0 {
            if self.step_log.len() >= limit {
                let excess = self.step_log.len() + 1 - limit;
                self.step_log.drain(..excess);
            }
            self.step_log.push(StepRecord { dt_sec, final_step });
        }

        if self.settings.fail_on_step == Some(index) {
            return StepErrorFlags::NUMERIC_INSTABILITY;
        }

        if index == 0 && self.settings.bodies > 0 {
            let woken = (0..self.settings.bodies).map(|b| BodyId(u64::from(b))).collect();
            self.emit(SimEvent::Wake(woken));
        }

        for _ in 0..self.settings.events_per_step {
            let other = if self.settings.bodies > 0 {
                self.rng.gen_range(0..self.settings.bodies)
            } else {
                0
            };
            let impulse = self.rng.gen_range(0.0f32..10.0) * dt_sec;
            let seq = self.emitted;
            self.emit(SimEvent::Contact {
                bodies: (BodyId(seq), BodyId(u64::from(other))),
                impulse,
            });
        }

        if self.settings.bodies > 0 {
            self.awake = self.rng.gen_range(0..=self.settings.bodies);
        }
        StepErrorFlags::empty()
    }

    fn fetch_results(&mut self, _block: bool) -> bool {
        self.pending_fetch = false;
        true
    }

    fn counts(&self) -> BackendCounts {
        BackendCounts {
            actors: self.settings.bodies,
            shapes: self.settings.bodies,
            awake_shapes: self.awake,
            shape_pairs: self.settings.events_per_step,
        }
    }

    fn event_callback(&self) -> Option<EventCallback> {
        self.callback.clone()
    }

    fn set_event_callback(&mut self, callback: Option<EventCallback>) {
        self.callback = callback;
    }
}
