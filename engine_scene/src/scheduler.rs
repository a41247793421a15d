//! Scene tick scheduler.
//!
//! One tick is a `simulate` / `fetch_results` pair:
//! - `simulate` plans the substeps, wraps the backend's notification slot and submits a
//!   small task graph, then returns without doing any physics work.
//! - Worker threads run `benefit -> physics_step -> (between_steps)* -> check_results ->
//!   fetch_results`. The terminal node sets the fetch-ready latch.
//! - `fetch_results` retires the tick: render locks, backend result pull, callback
//!   restore, notification replay, stats, unlock. It then sets the tick-complete latch
//!   that gates the next `simulate`.
//!
//! Graph nodes are registered once per scheduler and hold only a `Weak` handle to the
//! scene state, so nothing in the graph keeps the scheduler alive.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Instant;

use engine_shared::{
    config::{clamp_resource_budget, SceneConfig, TimestepMode},
    error::ConfigError,
    notify::{BatchingShim, NotificationBatcher},
    physics::{PhysicsBackend, StepErrorFlags},
    stats::{StatsAggregator, StatsSnapshot, TickReport, TickTimings},
    sync::{PhysicsWorld, WaitTimeout, WaitableLatch},
    task::{CpuDispatcher, TaskId, TaskManager, TaskStatus, ThreadPoolDispatcher},
    timestep::{ElapsedClock, SubstepAccumulator, SubstepPlan},
};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, trace, warn};

use crate::error::SceneError;
use crate::lod;
use crate::module::{ModuleRegistry, ModuleScene};

/// Where the current tick is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickPhase {
    /// No tick in flight.
    Idle,
    /// `simulate` is planning and building the graph.
    Building,
    /// Graph handed to the task manager, no node has run yet.
    Submitted,
    Running,
    /// Terminal node ran; `fetch_results` may retire the tick.
    FetchReady,
    Retiring,
}

/// Outcome of [`SceneScheduler::fetch_results`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    /// Tick still running and the caller did not block.
    NotReady,
    /// Nothing was in flight. Counts as success; there is no new data.
    NoTick,
    /// The tick retired. `errors` is empty unless a backend step failed.
    Retired { errors: StepErrorFlags },
}

impl FetchStatus {
    pub fn success(&self) -> bool {
        !matches!(self, FetchStatus::NotReady)
    }

    pub fn errors(&self) -> StepErrorFlags {
        match self {
            FetchStatus::Retired { errors } => *errors,
            _ => StepErrorFlags::empty(),
        }
    }
}

struct TickState<B> {
    phase: TickPhase,
    tick: u64,
    accumulator: SubstepAccumulator,
    clock: ElapsedClock,
    plan: Option<SubstepPlan>,
    /// World the in-flight tick steps. Kept so detach cannot pull it mid-tick.
    world: Option<PhysicsWorld<B>>,
    elapsed: f32,
    final_step: bool,
    /// Backend steps attempted this tick.
    substeps_run: u32,
    errors: StepErrorFlags,
    /// Module hooks that panicked on the caller's thread. Kept apart from `errors` so
    /// the substep loop keeps running.
    hook_errors: StepErrorFlags,
    tick_start: Option<Instant>,
    ready_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy)]
struct LodState {
    budget: f32,
    consumed: f32,
    benefit_sum: f32,
}

/// State shared between the scheduler and its graph nodes.
struct SceneInner<B> {
    world: RwLock<Option<PhysicsWorld<B>>>,
    modules: ModuleRegistry,
    shim: BatchingShim,
    fetch_ready: WaitableLatch,
    tick_complete: WaitableLatch,
    tick: Mutex<TickState<B>>,
    lod: Mutex<LodState>,
    stats: Mutex<StatsAggregator>,
}

impl<B: PhysicsBackend> SceneInner<B> {
    fn phase(&self) -> TickPhase {
        self.tick.lock().phase
    }

    fn compute_benefit(&self) {
        {
            let mut tick = self.tick.lock();
            if tick.phase == TickPhase::Submitted {
                tick.phase = TickPhase::Running;
            }
        }
        let modules = self.modules.snapshot();
        let budget = self.lod.lock().budget;
        let alloc = lod::allocate(&modules, budget);
        let mut lod = self.lod.lock();
        lod.consumed = alloc.consumed;
        lod.benefit_sum = alloc.benefit_sum;
    }

    /// Runs backend step `index` of the current tick. Returns false if it failed.
    fn run_substep(&self, index: u32) -> bool {
        let (plan, final_step, world) = {
            let tick = self.tick.lock();
            let (Some(plan), Some(world)) = (tick.plan, tick.world.clone()) else {
                return false;
            };
            (plan, tick.final_step, world)
        };

        let dt = if plan.variable {
            plan.elapsed
        } else {
            plan.substep_size
        };
        let last = index + 1 == plan.backend_steps();
        let hint = final_step && last;

        let flags = catch_unwind(AssertUnwindSafe(|| {
            world.write().step_simulation(dt, hint)
        }))
        .unwrap_or(StepErrorFlags::BACKEND_PANIC);

        let mut tick = self.tick.lock();
        tick.substeps_run += 1;
        if !flags.is_empty() {
            warn!(tick = tick.tick, substep = index, ?flags, "Backend step failed");
            tick.errors |= flags;
        }
        flags.is_empty()
    }

    fn physics_step(&self) {
        let steps = self.tick.lock().plan.map_or(0, |p| p.backend_steps());
        if steps > 0 {
            self.run_substep(0);
        }
    }

    /// One pass of the substep loop. Returns true when another pass is needed.
    fn between_steps(&self) -> bool {
        let (plan, next, failed) = {
            let tick = self.tick.lock();
            let Some(plan) = tick.plan else {
                return false;
            };
            (plan, tick.substeps_run, !tick.errors.is_empty())
        };
        let count = plan.substep_count;
        if failed {
            debug!(skipped = count.saturating_sub(next), "Skipping substeps after failure");
            return false;
        }
        if next >= count {
            return false;
        }

        for module in self.modules.snapshot() {
            module.interstep(next, count, plan.substep_size);
        }
        self.run_substep(next) && next + 1 < count
    }

    fn check_results(&self) {
        let mut tick = self.tick.lock();
        let expected = tick.plan.map_or(0, |p| p.backend_steps());
        if tick.errors.is_empty() && tick.substeps_run < expected {
            debug_assert!(false, "substep chain finished early");
            tick.errors |= StepErrorFlags::FETCH_INCOMPLETE;
        }
        trace!(tick = tick.tick, substeps = tick.substeps_run, "Substeps checked");
    }

    fn signal_ready(&self) {
        {
            let mut tick = self.tick.lock();
            tick.ready_at = Some(Instant::now());
            tick.phase = TickPhase::FetchReady;
        }
        self.fetch_ready.set();
    }
}

/// Ids of the per-scheduler graph nodes.
#[derive(Debug, Clone, Copy)]
struct GraphNodes {
    benefit: TaskId,
    physics_step: TaskId,
    between_steps: TaskId,
    check_results: TaskId,
    fetch_results: TaskId,
}

impl GraphNodes {
    fn register<B: PhysicsBackend>(tasks: &TaskManager, inner: &Arc<SceneInner<B>>) -> Self {
        let node = |tasks: &TaskManager, name: &str, body: fn(&SceneInner<B>)| {
            let weak: Weak<SceneInner<B>> = Arc::downgrade(inner);
            tasks.register(name, move |_| {
                if let Some(inner) = weak.upgrade() {
                    body(&inner);
                }
                TaskStatus::Complete
            })
        };

        let benefit = node(tasks, "lod_compute_benefit", SceneInner::compute_benefit);
        let physics_step = node(tasks, "physics_step", SceneInner::physics_step);
        let check_results = node(tasks, "check_results", SceneInner::check_results);
        let fetch_results = node(tasks, "fetch_results", SceneInner::signal_ready);

        let weak = Arc::downgrade(inner);
        let between_steps = tasks.register("between_steps", move |ctx| {
            if let Some(inner) = weak.upgrade() {
                // check_results stays blocked until this node lets go of it.
                match catch_unwind(AssertUnwindSafe(|| inner.between_steps())) {
                    Ok(true) => return TaskStatus::RunAgain,
                    Ok(false) => {}
                    Err(_) => {
                        error!("Substep loop panicked, ending the tick's substeps");
                        inner.tick.lock().errors |= StepErrorFlags::FETCH_INCOMPLETE;
                    }
                }
            }
            ctx.remove_reference(check_results);
            TaskStatus::Complete
        });

        Self {
            benefit,
            physics_step,
            between_steps,
            check_results,
            fetch_results,
        }
    }
}

/// Drives a physics backend one tick at a time.
///
/// All methods take `&self`; the scheduler can be shared across threads. A second
/// `simulate` issued before the previous tick retired blocks until it has.
pub struct SceneScheduler<B: PhysicsBackend> {
    inner: Arc<SceneInner<B>>,
    tasks: TaskManager,
    nodes: GraphNodes,
    retire_lock: Mutex<()>,
}

impl<B: PhysicsBackend> SceneScheduler<B> {
    pub fn new(config: SceneConfig, dispatcher: Arc<dyn CpuDispatcher>) -> Result<Self, SceneError> {
        config.validate()?;

        let batcher = Arc::new(NotificationBatcher::new());
        let inner = Arc::new(SceneInner {
            world: RwLock::new(None),
            modules: ModuleRegistry::new(),
            shim: BatchingShim::new(batcher),
            fetch_ready: WaitableLatch::new_set(),
            tick_complete: WaitableLatch::new_set(),
            tick: Mutex::new(TickState {
                phase: TickPhase::Idle,
                tick: 0,
                accumulator: SubstepAccumulator::new(config.timestep),
                clock: ElapsedClock::default(),
                plan: None,
                world: None,
                elapsed: 0.0,
                final_step: false,
                substeps_run: 0,
                errors: StepErrorFlags::empty(),
                hook_errors: StepErrorFlags::empty(),
                tick_start: None,
                ready_at: None,
            }),
            lod: Mutex::new(LodState {
                budget: clamp_resource_budget(config.resource_budget),
                consumed: 0.0,
                benefit_sum: 0.0,
            }),
            stats: Mutex::new(StatsAggregator::new()),
        });

        let tasks = TaskManager::new(dispatcher);
        let nodes = GraphNodes::register(&tasks, &inner);

        debug!(
            workers = tasks.worker_count(),
            timestep = ?config.timestep,
            "Scene scheduler created"
        );
        Ok(Self {
            inner,
            tasks,
            nodes,
            retire_lock: Mutex::new(()),
        })
    }

    /// Scheduler backed by its own pool of `config.worker_threads` threads.
    pub fn with_worker_pool(config: SceneConfig) -> anyhow::Result<Self> {
        let pool = ThreadPoolDispatcher::new(config.worker_threads)?;
        Ok(Self::new(config, Arc::new(pool))?)
    }

    /// Attaches a world, retiring any in-flight tick first. Returns the previous world.
    pub fn attach_world(&self, world: PhysicsWorld<B>) -> Option<PhysicsWorld<B>> {
        self.retire_in_flight();
        self.inner.world.write().replace(world)
    }

    /// Detaches the world, retiring any in-flight tick first.
    pub fn detach_world(&self) -> Option<PhysicsWorld<B>> {
        self.retire_in_flight();
        self.inner.world.write().take()
    }

    /// Handle to the attached world. Its `read()` / `write()` guards are the lock
    /// passthrough for the caller's own queries.
    pub fn world(&self) -> Option<PhysicsWorld<B>> {
        self.inner.world.read().clone()
    }

    fn retire_in_flight(&self) {
        if self.inner.phase() != TickPhase::Idle {
            self.fetch_results(true);
        }
    }

    /// Starts a tick covering `elapsed` seconds and returns once the graph is submitted.
    ///
    /// Blocks first if the previous tick has not retired. `final_step` is passed to the
    /// backend on the last substep only.
    pub fn simulate(&self, elapsed: f32, final_step: bool) -> Result<(), SceneError> {
        if !elapsed.is_finite() || elapsed < 0.0 {
            warn!(elapsed, "Rejected simulate call");
            return Err(ConfigError::InvalidElapsed(elapsed).into());
        }
        let Some(world) = self.world() else {
            warn!("simulate called with no physics world attached");
            return Err(SceneError::NoWorldAttached);
        };

        let plan = loop {
            self.inner.tick_complete.wait();
            let mut tick = self.inner.tick.lock();
            if tick.phase != TickPhase::Idle {
                continue;
            }
            tick.phase = TickPhase::Building;
            self.inner.tick_complete.reset();
            self.inner.fetch_ready.reset();

            let plan = tick.accumulator.plan(elapsed);
            tick.tick += 1;
            tick.plan = Some(plan);
            tick.world = Some(world.clone());
            tick.elapsed = elapsed;
            tick.final_step = final_step;
            tick.substeps_run = 0;
            tick.errors = StepErrorFlags::empty();
            tick.hook_errors = StepErrorFlags::empty();
            tick.tick_start = Some(Instant::now());
            tick.ready_at = None;
            break plan;
        };

        {
            let mut backend = world.write();
            self.inner
                .shim
                .install(&mut *backend, plan.batches_notifications());
        }

        let modules = self.inner.modules.snapshot();
        let faults = run_hook(&modules, "simulate", |m| m.simulate(elapsed));
        if !faults.is_empty() {
            self.inner.tick.lock().hook_errors |= faults;
        }

        self.build_graph(&plan);

        let tick = {
            let mut tick = self.inner.tick.lock();
            tick.phase = TickPhase::Submitted;
            tick.tick
        };
        debug!(
            tick,
            substeps = plan.substep_count,
            substep_size = plan.substep_size,
            "Tick submitted"
        );
        self.tasks.start_simulation();
        Ok(())
    }

    fn build_graph(&self, plan: &SubstepPlan) {
        let n = self.nodes;
        let tm = &self.tasks;
        tm.reset_dependencies();

        tm.submit(n.benefit);
        tm.submit(n.physics_step);
        tm.submit(n.check_results);
        tm.submit(n.fetch_results);

        tm.start_after(n.physics_step, n.benefit);
        tm.start_after(n.check_results, n.physics_step);
        tm.start_after(n.fetch_results, n.physics_step);
        tm.start_after(n.fetch_results, n.check_results);

        if plan.substep_count > 1 {
            tm.submit(n.between_steps);
            tm.set_following(n.physics_step, Some(n.between_steps));
            // Held until the last substep's pass of the loop has run.
            tm.add_reference(n.check_results);
        }
    }

    /// True when no tick is in flight or the in-flight tick is ready to fetch.
    /// Never changes scheduler state.
    pub fn check_results(&self, block: bool) -> bool {
        if self.inner.phase() == TickPhase::Idle {
            return true;
        }
        self.inner
            .fetch_ready
            .wait_timeout(WaitTimeout::from_block(block))
    }

    /// Retires the in-flight tick once its graph has finished.
    pub fn fetch_results(&self, block: bool) -> FetchStatus {
        let fetch_entered = Instant::now();
        let _retiring = if block {
            self.retire_lock.lock()
        } else {
            // Another caller is already retiring; a non-blocking fetch must not wait on it.
            match self.retire_lock.try_lock() {
                Some(guard) => guard,
                None if self.inner.phase() == TickPhase::Idle => return FetchStatus::NoTick,
                None => return FetchStatus::NotReady,
            }
        };

        if self.inner.phase() == TickPhase::Idle {
            return FetchStatus::NoTick;
        }
        if !self
            .inner
            .fetch_ready
            .wait_timeout(WaitTimeout::from_block(block))
        {
            return FetchStatus::NotReady;
        }

        let (tick_id, world) = {
            let mut tick = self.inner.tick.lock();
            tick.phase = TickPhase::Retiring;
            (tick.tick, tick.world.take())
        };
        let finish = RetireGuard { scheduler: self };

        let modules = self.inner.modules.snapshot();
        let mut retire_errors = run_hook(&modules, "fetch_results_pre_render_lock", |m| {
            m.fetch_results_pre_render_lock()
        });
        retire_errors |= run_hook(&modules, "lock_render_resources", |m| {
            m.lock_render_resources()
        });

        let counts = match &world {
            Some(world) => {
                let mut backend = world.write();
                match catch_unwind(AssertUnwindSafe(|| backend.fetch_results(true))) {
                    Ok(true) => {}
                    Ok(false) => retire_errors |= StepErrorFlags::FETCH_INCOMPLETE,
                    Err(_) => {
                        error!(tick = tick_id, "Backend result pull panicked");
                        retire_errors |=
                            StepErrorFlags::BACKEND_PANIC | StepErrorFlags::FETCH_INCOMPLETE;
                    }
                }
                self.inner.shim.restore(&mut *backend);
                backend.counts()
            }
            None => {
                retire_errors |= StepErrorFlags::FETCH_INCOMPLETE;
                Default::default()
            }
        };
        let results_pulled = Instant::now();
        retire_errors |= run_hook(&modules, "fetch_results", |m| m.fetch_results());

        let delivered = self.inner.shim.batcher().end_tick();

        let (errors, report) = {
            let mut tick = self.inner.tick.lock();
            let hook_errors = tick.hook_errors;
            tick.errors |= retire_errors | hook_errors;
            let step_was_valid = tick.substeps_run > 0;
            let elapsed = tick.elapsed;
            tick.clock.record(elapsed, step_was_valid);

            let report = TickReport {
                tick: tick_id,
                counts,
                substeps: tick.substeps_run,
                step_was_valid,
                timings: TickTimings {
                    tick_start: tick.tick_start.unwrap_or(fetch_entered),
                    ready_at: tick.ready_at,
                    fetch_entered,
                    results_pulled,
                    retired: Instant::now(),
                },
                resource_consumed: self.inner.lod.lock().consumed,
                total_elapsed_ms: tick.clock.total_ms(),
                module_stats: modules.iter().flat_map(|m| m.stats()).collect(),
            };
            (tick.errors, report)
        };
        self.inner.stats.lock().publish(&report);

        let mut unlock_errors = run_hook(modules.iter().rev(), "unlock_render_resources", |m| {
            m.unlock_render_resources()
        });
        unlock_errors |= run_hook(&modules, "fetch_results_post_render_unlock", |m| {
            m.fetch_results_post_render_unlock()
        });
        let errors = errors | unlock_errors;
        drop(finish);

        debug!(
            tick = tick_id,
            substeps = report.substeps,
            delivered,
            ?errors,
            "Tick retired"
        );
        FetchStatus::Retired { errors }
    }

    /// Stats of the last retired tick.
    pub fn get_stats(&self) -> Option<StatsSnapshot> {
        self.inner.stats.lock().latest().cloned()
    }

    /// Sets the LOD budget. Clamped to `[0, MAX_RESOURCE_BUDGET]`; NaN becomes zero.
    pub fn set_resource_budget(&self, value: f32) {
        self.inner.lod.lock().budget = clamp_resource_budget(value);
    }

    pub fn resource_budget(&self) -> f32 {
        self.inner.lod.lock().budget
    }

    /// Resource consumed by modules during the last benefit pass.
    pub fn consumed_resource(&self) -> f32 {
        self.inner.lod.lock().consumed
    }

    pub fn last_benefit_sum(&self) -> f32 {
        self.inner.lod.lock().benefit_sum
    }

    /// Switches between fixed and variable stepping. Waits for any in-flight tick.
    pub fn set_timestep(&self, mode: TimestepMode) -> Result<(), SceneError> {
        mode.validate()?;
        self.retire_in_flight();
        self.inner.tick.lock().accumulator.set_mode(mode);
        Ok(())
    }

    pub fn timestep(&self) -> TimestepMode {
        self.inner.tick.lock().accumulator.mode()
    }

    pub fn register_module(&self, module: Arc<dyn ModuleScene>) -> Result<(), SceneError> {
        self.inner.modules.register(module)
    }

    pub fn unregister_module(&self, name: &str) -> Result<Arc<dyn ModuleScene>, SceneError> {
        self.inner.modules.unregister(name)
    }

    pub fn module_names(&self) -> Vec<String> {
        self.inner.modules.names()
    }

    pub fn phase(&self) -> TickPhase {
        self.inner.phase()
    }

    /// Ticks started so far.
    pub fn tick_count(&self) -> u64 {
        self.inner.tick.lock().tick
    }

    /// Substep plan of the most recent tick.
    pub fn last_plan(&self) -> Option<SubstepPlan> {
        self.inner.tick.lock().plan
    }

    /// Carried fixed-step time not yet simulated.
    pub fn remainder(&self) -> f64 {
        self.inner.tick.lock().accumulator.remainder()
    }

    pub fn total_elapsed_ms(&self) -> u64 {
        self.inner.tick.lock().clock.total_ms()
    }
}

/// Runs one hook on each module in turn. A panicking module is logged and reported as
/// `FETCH_INCOMPLETE`; the remaining modules still get the call.
fn run_hook<'a>(
    modules: impl IntoIterator<Item = &'a Arc<dyn ModuleScene>>,
    hook: &'static str,
    call: impl Fn(&dyn ModuleScene),
) -> StepErrorFlags {
    let mut flags = StepErrorFlags::empty();
    for module in modules {
        if catch_unwind(AssertUnwindSafe(|| call(module.as_ref()))).is_err() {
            error!(module = module.name(), hook, "Module hook panicked");
            flags |= StepErrorFlags::FETCH_INCOMPLETE;
        }
    }
    flags
}

/// Ends a retire: drains the graph, returns to `Idle` and opens the next tick.
/// Runs on unwind too, so the scheduler never stays in `Retiring`.
struct RetireGuard<'a, B: PhysicsBackend> {
    scheduler: &'a SceneScheduler<B>,
}

impl<B: PhysicsBackend> Drop for RetireGuard<'_, B> {
    fn drop(&mut self) {
        let scheduler = self.scheduler;
        scheduler.tasks.wait_idle();
        scheduler.tasks.stop_simulation();
        scheduler.inner.tick.lock().phase = TickPhase::Idle;
        scheduler.inner.tick_complete.set();
    }
}

impl<B: PhysicsBackend> Drop for SceneScheduler<B> {
    fn drop(&mut self) {
        match self.inner.phase() {
            TickPhase::Idle => {}
            // simulate unwound before submitting; there is no graph to wait for.
            TickPhase::Building => warn!("Dropping scheduler with an unsubmitted tick"),
            // Puts the application callback back and drains the graph.
            _ => {
                self.fetch_results(true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_shared::physics::{
        BackendCounts, EventCallback, NullPhysics, SimEvent, SyntheticPhysics, SyntheticSettings,
    };
    use engine_shared::stats::StatId;
    use engine_shared::task::InlineDispatcher;

    fn fixed_config(size: f32, max: u32) -> SceneConfig {
        SceneConfig {
            timestep: TimestepMode::Fixed {
                substep_size: size,
                max_substeps: max,
            },
            ..SceneConfig::default()
        }
    }

    fn synthetic(
        settings: SyntheticSettings,
    ) -> (SceneScheduler<SyntheticPhysics>, PhysicsWorld<SyntheticPhysics>) {
        let scheduler =
            SceneScheduler::new(fixed_config(1.0 / 60.0, 8), Arc::new(InlineDispatcher::new()))
                .unwrap();
        let world = PhysicsWorld::new(SyntheticPhysics::new(settings));
        scheduler.attach_world(world.clone());
        (scheduler, world)
    }

    fn recording() -> (EventCallback, Arc<Mutex<Vec<SimEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb: EventCallback = Arc::new(move |e: &SimEvent| sink.lock().push(e.clone()));
        (cb, seen)
    }

    #[test]
    fn simulate_without_world_is_rejected() {
        let scheduler: SceneScheduler<NullPhysics> =
            SceneScheduler::new(SceneConfig::default(), Arc::new(InlineDispatcher::new())).unwrap();
        assert!(matches!(
            scheduler.simulate(0.016, true),
            Err(SceneError::NoWorldAttached)
        ));
        assert_eq!(scheduler.phase(), TickPhase::Idle);
        assert_eq!(scheduler.fetch_results(true), FetchStatus::NoTick);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let result: Result<SceneScheduler<NullPhysics>, _> =
            SceneScheduler::new(fixed_config(1.0 / 60.0, 0), Arc::new(InlineDispatcher::new()));
        assert!(matches!(
            result,
            Err(SceneError::Config(ConfigError::ZeroMaxSubsteps))
        ));
    }

    #[test]
    fn negative_elapsed_is_rejected() {
        let (scheduler, _world) = synthetic(SyntheticSettings::default());
        assert!(matches!(
            scheduler.simulate(-0.1, true),
            Err(SceneError::Config(ConfigError::InvalidElapsed(_)))
        ));
        assert_eq!(scheduler.tick_count(), 0);
    }

    #[test]
    fn six_substeps_for_a_tenth_of_a_second() {
        let (scheduler, world) = synthetic(SyntheticSettings::default());
        scheduler.simulate(0.1, true).unwrap();
        let status = scheduler.fetch_results(true);
        assert_eq!(status, FetchStatus::Retired { errors: StepErrorFlags::empty() });

        let log = world.read().step_log().to_vec();
        assert_eq!(log.len(), 6);
        assert!(log.iter().all(|r| (r.dt_sec - 1.0 / 60.0).abs() < 1.0e-7));
        let finals: Vec<bool> = log.iter().map(|r| r.final_step).collect();
        assert_eq!(finals, vec![false, false, false, false, false, true]);

        let stats = scheduler.get_stats().unwrap();
        assert_eq!(stats.int(StatId::SubstepCount), 6);
        assert!(stats.step_was_valid);
        assert!(scheduler.remainder() < 1.0e-6);
    }

    #[test]
    fn excess_time_is_dropped_at_the_cap() {
        let (scheduler, world) = synthetic(SyntheticSettings::default());
        scheduler.simulate(0.2, false).unwrap();
        scheduler.fetch_results(true);
        assert_eq!(world.read().steps_taken(), 8);
        assert!(scheduler.remainder() < 1.0e-6);
        assert!(world.read().step_log().iter().all(|r| !r.final_step));
    }

    #[test]
    fn zero_elapsed_still_retires_and_publishes() {
        let (scheduler, world) = synthetic(SyntheticSettings::default());
        scheduler.simulate(0.0, true).unwrap();
        assert_eq!(
            scheduler.fetch_results(false),
            FetchStatus::Retired { errors: StepErrorFlags::empty() }
        );
        assert_eq!(world.read().steps_taken(), 0);

        let stats = scheduler.get_stats().unwrap();
        assert!(!stats.step_was_valid);
        assert_eq!(stats.int(StatId::SubstepCount), 0);
        assert_eq!(stats.float(StatId::Throughput), 0.0);
    }

    #[test]
    fn variable_mode_takes_one_continuous_step() {
        let (scheduler, world) = synthetic(SyntheticSettings::default());
        scheduler.set_timestep(TimestepMode::Variable).unwrap();
        scheduler.simulate(0.037, true).unwrap();
        scheduler.fetch_results(true);

        let log = world.read().step_log().to_vec();
        assert_eq!(log.len(), 1);
        assert!((log[0].dt_sec - 0.037).abs() < 1.0e-7);
        assert!(log[0].final_step);
        assert_eq!(scheduler.last_plan().map(|p| p.substep_count), Some(0));
    }

    #[test]
    fn batched_events_arrive_once_in_order() {
        let (scheduler, world) = synthetic(SyntheticSettings {
            bodies: 0,
            events_per_step: 2,
            ..SyntheticSettings::default()
        });
        let (cb, seen) = recording();
        world.write().set_event_callback(Some(cb.clone()));

        scheduler.simulate(4.0 / 60.0 + 1.0e-4, true).unwrap();
        assert!(seen.lock().is_empty());
        scheduler.fetch_results(true);

        let seqs: Vec<u64> = seen
            .lock()
            .iter()
            .filter_map(|e| match e {
                SimEvent::Contact { bodies, .. } => Some(bodies.0 .0),
                _ => None,
            })
            .collect();
        assert_eq!(seqs, (0..8).collect::<Vec<_>>());

        let slot = world.read().event_callback().unwrap();
        assert!(engine_shared::physics::same_callback(&slot, &cb));
    }

    #[test]
    fn failed_substep_skips_the_rest_and_still_retires() {
        let (scheduler, world) = synthetic(SyntheticSettings {
            fail_on_step: Some(2),
            ..SyntheticSettings::default()
        });
        scheduler.simulate(5.0 / 60.0 + 1.0e-4, true).unwrap();
        let status = scheduler.fetch_results(true);
        assert!(status.success());
        assert!(status.errors().contains(StepErrorFlags::NUMERIC_INSTABILITY));
        assert_eq!(world.read().steps_taken(), 3);
        assert_eq!(scheduler.phase(), TickPhase::Idle);

        scheduler.simulate(1.0 / 60.0 + 1.0e-4, true).unwrap();
        assert_eq!(
            scheduler.fetch_results(true),
            FetchStatus::Retired { errors: StepErrorFlags::empty() }
        );
    }

    struct Exploding;

    impl PhysicsBackend for Exploding {
        fn step_simulation(&mut self, _dt_sec: f32, _final_step: bool) -> StepErrorFlags {
            panic!("solver blew up");
        }

        fn fetch_results(&mut self, _block: bool) -> bool {
            true
        }

        fn counts(&self) -> BackendCounts {
            Default::default()
        }

        fn event_callback(&self) -> Option<EventCallback> {
            None
        }

        fn set_event_callback(&mut self, _callback: Option<EventCallback>) {}
    }

    #[test]
    fn backend_panic_is_reported_as_a_flag() {
        let scheduler =
            SceneScheduler::new(fixed_config(1.0 / 60.0, 8), Arc::new(InlineDispatcher::new()))
                .unwrap();
        scheduler.attach_world(PhysicsWorld::new(Exploding));
        scheduler.simulate(3.0 / 60.0 + 1.0e-4, true).unwrap();
        let status = scheduler.fetch_results(true);
        assert!(status.errors().contains(StepErrorFlags::BACKEND_PANIC));
        assert_eq!(scheduler.phase(), TickPhase::Idle);
    }

    struct PanicsOnPull;

    impl PhysicsBackend for PanicsOnPull {
        fn step_simulation(&mut self, _dt_sec: f32, _final_step: bool) -> StepErrorFlags {
            StepErrorFlags::empty()
        }

        fn fetch_results(&mut self, _block: bool) -> bool {
            panic!("result buffer corrupted");
        }

        fn counts(&self) -> BackendCounts {
            Default::default()
        }

        fn event_callback(&self) -> Option<EventCallback> {
            None
        }

        fn set_event_callback(&mut self, _callback: Option<EventCallback>) {}
    }

    #[test]
    fn backend_pull_panic_still_retires() {
        let scheduler =
            SceneScheduler::new(fixed_config(1.0 / 60.0, 8), Arc::new(InlineDispatcher::new()))
                .unwrap();
        scheduler.attach_world(PhysicsWorld::new(PanicsOnPull));
        for _ in 0..2 {
            scheduler.simulate(2.0 / 60.0 + 1.0e-4, true).unwrap();
            let errors = scheduler.fetch_results(true).errors();
            assert!(errors.contains(StepErrorFlags::BACKEND_PANIC));
            assert!(errors.contains(StepErrorFlags::FETCH_INCOMPLETE));
            assert_eq!(scheduler.phase(), TickPhase::Idle);
        }
        assert_eq!(scheduler.tick_count(), 2);
        // In-flight tick at drop time is retired without unwinding out of the destructor.
        scheduler.simulate(1.0 / 60.0 + 1.0e-4, true).unwrap();
        drop(scheduler);
    }

    #[test]
    fn check_results_is_a_pure_peek() {
        let (scheduler, _world) = synthetic(SyntheticSettings::default());
        assert!(scheduler.check_results(false));
        scheduler.simulate(0.05, true).unwrap();
        for _ in 0..5 {
            assert!(scheduler.check_results(false));
        }
        assert_eq!(scheduler.phase(), TickPhase::FetchReady);
        assert!(scheduler.get_stats().is_none());
        assert!(scheduler.fetch_results(false).success());
        assert!(scheduler.get_stats().is_some());
    }

    #[test]
    fn detach_retires_the_in_flight_tick() {
        let (scheduler, _world) = synthetic(SyntheticSettings::default());
        scheduler.simulate(0.05, true).unwrap();
        assert!(scheduler.detach_world().is_some());
        assert_eq!(scheduler.phase(), TickPhase::Idle);
        assert!(scheduler.get_stats().is_some());
        assert!(matches!(
            scheduler.simulate(0.05, true),
            Err(SceneError::NoWorldAttached)
        ));
    }

    #[test]
    fn elapsed_clock_waits_for_a_valid_step() {
        let (scheduler, _world) = synthetic(SyntheticSettings::default());
        for _ in 0..2 {
            scheduler.simulate(0.0078125, true).unwrap();
            scheduler.fetch_results(true);
            assert!(!scheduler.get_stats().unwrap().step_was_valid);
            assert_eq!(scheduler.total_elapsed_ms(), 0);
        }

        scheduler.simulate(0.0078125, true).unwrap();
        scheduler.fetch_results(true);
        assert_eq!(scheduler.total_elapsed_ms(), 23);
        assert_eq!(
            scheduler.get_stats().unwrap().int(StatId::TotalElapsedMs),
            23
        );
    }

    #[test]
    fn resource_budget_is_clamped() {
        let (scheduler, _world) = synthetic(SyntheticSettings::default());
        assert!((scheduler.resource_budget() - 33.333_333).abs() < 1.0e-4);
        scheduler.set_resource_budget(-5.0);
        assert_eq!(scheduler.resource_budget(), 0.0);
        scheduler.set_resource_budget(f32::MAX);
        assert_eq!(
            scheduler.resource_budget(),
            engine_shared::config::MAX_RESOURCE_BUDGET
        );
    }
}
