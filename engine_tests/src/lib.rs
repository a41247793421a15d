//! Shared fixtures for the integration tests.

use std::sync::Arc;

use engine_scene::{ModuleScene, SceneScheduler};
use engine_shared::{
    config::{SceneConfig, TimestepMode},
    physics::{
        BackendCounts, EventCallback, PhysicsBackend, SimEvent, StepErrorFlags, SyntheticPhysics,
        SyntheticSettings,
    },
    stats::{StatId, StatValue},
    sync::{PhysicsWorld, WaitableLatch},
    task::{InlineDispatcher, ThreadPoolDispatcher},
};
use parking_lot::Mutex;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// Fixed 1/60 s substeps, capped at 8.
pub fn sixtieth_config() -> SceneConfig {
    SceneConfig {
        timestep: TimestepMode::Fixed {
            substep_size: 1.0 / 60.0,
            max_substeps: 8,
        },
        ..SceneConfig::default()
    }
}

/// Elapsed time that plans exactly `n` sixtieth substeps from a zero remainder.
pub fn substeps(n: u32) -> f32 {
    n as f32 / 60.0 + 1.0e-4
}

pub fn inline_scheduler<B: PhysicsBackend>(
    backend: B,
) -> anyhow::Result<(SceneScheduler<B>, PhysicsWorld<B>)> {
    let scheduler = SceneScheduler::new(sixtieth_config(), Arc::new(InlineDispatcher::new()))?;
    let world = PhysicsWorld::new(backend);
    scheduler.attach_world(world.clone());
    Ok((scheduler, world))
}

pub fn pooled_scheduler<B: PhysicsBackend>(
    backend: B,
    workers: usize,
) -> anyhow::Result<(Arc<SceneScheduler<B>>, PhysicsWorld<B>)> {
    let pool = ThreadPoolDispatcher::new(workers)?;
    let scheduler = SceneScheduler::new(sixtieth_config(), Arc::new(pool))?;
    let world = PhysicsWorld::new(backend);
    scheduler.attach_world(world.clone());
    Ok((Arc::new(scheduler), world))
}

pub fn synthetic(events_per_step: u32) -> SyntheticPhysics {
    SyntheticPhysics::new(SyntheticSettings {
        bodies: 0,
        events_per_step,
        ..SyntheticSettings::default()
    })
}

/// Application callback that keeps every event it sees.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<SimEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> EventCallback {
        let events = Arc::clone(&self.events);
        Arc::new(move |e: &SimEvent| events.lock().push(e.clone()))
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Sequence numbers of the contact events seen, in delivery order.
    pub fn contact_sequence(&self) -> Vec<u64> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SimEvent::Contact { bodies, .. } => Some(bodies.0 .0),
                _ => None,
            })
            .collect()
    }
}

/// Synthetic backend whose steps block until a gate opens.
pub struct GatedPhysics {
    inner: SyntheticPhysics,
    gate: Arc<WaitableLatch>,
}

impl GatedPhysics {
    pub fn new(inner: SyntheticPhysics) -> (Self, Arc<WaitableLatch>) {
        let gate = Arc::new(WaitableLatch::new());
        (
            Self {
                inner,
                gate: Arc::clone(&gate),
            },
            gate,
        )
    }

    pub fn steps_taken(&self) -> u64 {
        self.inner.steps_taken()
    }
}

impl PhysicsBackend for GatedPhysics {
    fn step_simulation(&mut self, dt_sec: f32, final_step: bool) -> StepErrorFlags {
        self.gate.wait();
        self.inner.step_simulation(dt_sec, final_step)
    }

    fn fetch_results(&mut self, block: bool) -> bool {
        self.inner.fetch_results(block)
    }

    fn counts(&self) -> BackendCounts {
        self.inner.counts()
    }

    fn event_callback(&self) -> Option<EventCallback> {
        self.inner.event_callback()
    }

    fn set_event_callback(&mut self, callback: Option<EventCallback>) {
        self.inner.set_event_callback(callback);
    }
}

/// Shared record of module hook calls, as `"<module>:<hook>"`.
pub type HookLog = Arc<Mutex<Vec<String>>>;

/// Module scene that logs every hook it receives.
pub struct TraceModule {
    name: String,
    log: HookLog,
    benefit: f32,
    stats: Vec<(StatId, StatValue)>,
}

impl TraceModule {
    pub fn new(name: &str, log: &HookLog) -> Self {
        Self {
            name: name.to_string(),
            log: Arc::clone(log),
            benefit: 0.0,
            stats: Vec::new(),
        }
    }

    pub fn with_benefit(mut self, benefit: f32) -> Self {
        self.benefit = benefit;
        self
    }

    pub fn with_stat(mut self, id: StatId, value: StatValue) -> Self {
        self.stats.push((id, value));
        self
    }

    fn note(&self, hook: &str) {
        self.log.lock().push(format!("{}:{hook}", self.name));
    }
}

impl ModuleScene for TraceModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn simulate(&self, _elapsed: f32) {
        self.note("simulate");
    }

    fn benefit(&self) -> f32 {
        self.benefit
    }

    fn allocate_resource(&self, budget: f32) -> f32 {
        self.note("allocate");
        budget / 2.0
    }

    fn interstep(&self, substep: u32, _substep_count: u32, _substep_size: f32) {
        self.note(&format!("interstep{substep}"));
    }

    fn fetch_results_pre_render_lock(&self) {
        self.note("pre_render_lock");
    }

    fn lock_render_resources(&self) {
        self.note("lock");
    }

    fn fetch_results(&self) {
        self.note("fetch");
    }

    fn unlock_render_resources(&self) {
        self.note("unlock");
    }

    fn fetch_results_post_render_unlock(&self) {
        self.note("post_render_unlock");
    }

    fn stats(&self) -> Vec<(StatId, StatValue)> {
        self.stats.clone()
    }
}
