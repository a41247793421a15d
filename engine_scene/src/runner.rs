//! Headless host frame loop.
//!
//! Each frame starts a physics tick, does simulated render work while the workers step
//! the backend, then retires the tick. Frame pacing uses `tokio::time::sleep_until`
//! like a real host loop would use vsync.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use engine_shared::{
    config::RunnerConfig,
    physics::{EventCallback, PhysicsBackend, SimEvent, SyntheticPhysics, SyntheticSettings},
    stats::StatsSnapshot,
    sync::PhysicsWorld,
};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::scheduler::SceneScheduler;

/// What a run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub frames: u32,
    /// Ticks that retired with backend error flags set.
    pub failed_ticks: u32,
    /// Events that reached the application callback.
    pub events_delivered: u64,
    pub backend_steps: u64,
    pub simulated_secs: f64,
    pub total_elapsed_ms: u64,
    pub stats: Option<StatsSnapshot>,
}

/// Runs `cfg.frames` frames against a fresh synthetic backend.
///
/// With `paced` false frames run back to back, which is what tests want.
pub async fn run_frames(cfg: &RunnerConfig, paced: bool) -> anyhow::Result<RunSummary> {
    let scheduler = Arc::new(
        SceneScheduler::<SyntheticPhysics>::with_worker_pool(cfg.scene.clone())
            .context("create scene scheduler")?,
    );

    let world = PhysicsWorld::new(SyntheticPhysics::new(SyntheticSettings {
        seed: cfg.seed,
        bodies: cfg.bodies,
        events_per_step: cfg.events_per_step,
        fail_on_step: None,
        step_log_limit: 0,
    }));
    let delivered = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&delivered);
    let on_event: EventCallback = Arc::new(move |_: &SimEvent| {
        counter.fetch_add(1, Ordering::Relaxed);
    });
    world.write().set_event_callback(Some(on_event));
    scheduler.attach_world(world.clone());

    let frame = Duration::from_secs_f64(1.0 / f64::from(cfg.frame_hz.max(1)));
    let render_work = Duration::from_millis(cfg.render_work_ms);
    let mut next_frame = Instant::now();
    let mut failed_ticks = 0;

    info!(
        frames = cfg.frames,
        frame_hz = cfg.frame_hz,
        workers = cfg.scene.worker_threads,
        "Running scene"
    );

    for frame_index in 0..cfg.frames {
        scheduler
            .simulate(frame.as_secs_f32(), true)
            .with_context(|| format!("simulate frame {frame_index}"))?;

        // Render work overlaps the physics tick.
        tokio::time::sleep(render_work).await;

        let fetcher = Arc::clone(&scheduler);
        let status = tokio::task::spawn_blocking(move || fetcher.fetch_results(true))
            .await
            .context("join fetch task")?;
        if !status.errors().is_empty() {
            failed_ticks += 1;
            warn!(frame = frame_index, errors = ?status.errors(), "Tick retired with errors");
        }

        if paced {
            next_frame += frame;
            tokio::time::sleep_until(next_frame).await;
        }
    }

    let (backend_steps, simulated_secs) = {
        let backend = world.read();
        (backend.steps_taken(), backend.simulated_time())
    };
    let summary = RunSummary {
        frames: cfg.frames,
        failed_ticks,
        events_delivered: delivered.load(Ordering::Relaxed),
        backend_steps,
        simulated_secs,
        total_elapsed_ms: scheduler.total_elapsed_ms(),
        stats: scheduler.get_stats(),
    };
    scheduler.detach_world();
    info!(
        backend_steps,
        events = summary.events_delivered,
        failed_ticks,
        "Run finished"
    );
    Ok(summary)
}
